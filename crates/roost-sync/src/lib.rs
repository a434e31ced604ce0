//! # Roost Sync
//!
//! Keeps the in-memory cache structures of a session mirrored to durable
//! table storage.
//!
//! At startup the [`StorageOrchestrator`] opens every service's table, loads
//! the persisted snapshot into the matching in-memory structure, and only
//! then attaches change listeners. From then on each service coalesces
//! changes into bulk writes on its own schedule, and the events service
//! enforces the [`RetentionPolicy`] on what it stores.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use roost_storage::SqliteBackend;
//! use roost_sync::{Session, StorageOrchestrator, SyncConfig};
//!
//! let session = Session::new();
//! let services = session.services(&SyncConfig::default());
//!
//! let storage = StorageOrchestrator::new(Arc::new(SqliteBackend::open_dir("./data")))
//!     .with_services(services.all())
//!     .start()
//!     .await?;
//!
//! session.repository.publish(event);
//!
//! // On logout
//! storage.reset().await?;
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod retention;
pub mod services;
pub mod session;

pub use batch::{Batch, Throttled, batch, throttled};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use orchestrator::{RunningStorage, StorageOrchestrator, Teardown};
pub use retention::{Candidate, RetentionPolicy, rank};
pub use services::{
    CollectionService, DatabaseService, EventsService, KeyValueService, StopSignal, SyncHandle,
    SyncMode, TrackerService,
};
pub use session::{Services, Session};
