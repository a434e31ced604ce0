//! # Roost Storage
//!
//! Generic table store for the Roost client cache.
//!
//! Every cached entity is kept in one table of `(key, data)` rows behind the
//! [`TableStore`] trait. A [`Backend`] opens tables; three backends exist:
//!
//! - [`SqliteBackend`]: relational engine, versioned schema driven by a
//!   [`MigrationLedger`]
//! - [`RedbBackend`]: schemaless key/value tables in one file, undeclared
//!   tables are dropped at prepare time
//! - [`InMemoryBackend`]: volatile tables with call counters, for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use roost_storage::{Backend, Row, SqliteBackend, TableSpec};
//!
//! let backend = SqliteBackend::open_dir("./data");
//! let events = backend.open(&TableSpec::new("events", "id")).await?;
//!
//! events.bulk_put(vec![Row::new(id, json)]).await?;
//! let rows = events.get_all().await?;
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod redb_store;
pub mod sqlite;
pub mod table;

pub use error::StorageError;
pub use memory::{InMemoryBackend, InMemoryTable};
pub use migration::{Migration, MigrationLedger};
pub use redb_store::{RedbBackend, RedbConfig, RedbTable};
pub use sqlite::{SqliteBackend, SqliteLocation, SqliteTable};
pub use table::{Backend, BackendKind, Row, TableSpec, TableStore};
