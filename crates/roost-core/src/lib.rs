//! # Roost Core
//!
//! Event model and in-memory stores for the Roost client cache.
//!
//! Every structure here is explicitly constructed and owned by a session;
//! there are no process-wide singletons. Each store publishes its mutations
//! through a [`ChangeFeed`], which is what the persistence layer in
//! `roost-sync` listens to.
//!
//! ## Components
//!
//! - [`Event`]: immutable, content-addressed protocol record
//! - [`Repository`]: in-memory event store emitting `{added, removed}` deltas
//! - [`Tracker`]: which relays an event was seen on
//! - [`Collection`]: keyed records (relay metadata, handles, zappers)
//! - [`Store`]: a writable value observed as a whole (freshness, plaintext)
//!
//! ## Example
//!
//! ```rust,ignore
//! use roost_core::{Event, Repository, kinds};
//!
//! let repository = Repository::new();
//! let mut updates = repository.subscribe();
//!
//! repository.publish(Event::new(id, pubkey, kinds::MESSAGE, 1_700_000_000));
//!
//! let update = updates.recv().await.unwrap();
//! assert_eq!(update.added.len(), 1);
//! ```

pub mod collection;
pub mod event;
pub mod feed;
pub mod kinds;
pub mod records;
pub mod repository;
pub mod store;
pub mod tracker;

pub use collection::{Collection, CollectionChange, Keyed};
pub use event::Event;
pub use feed::{ChangeFeed, Subscription};
pub use records::{HandleRecord, RelayProfile, RelayRecord, RelayStats, ZapperRecord};
pub use repository::{Filter, Repository, RepositoryUpdate};
pub use store::Store;
pub use tracker::{Tracker, TrackerChange};
