//! Per-entity database services
//!
//! A service pairs one in-memory structure with one table. It opens the
//! table, loads the persisted snapshot into the structure, and then keeps
//! the table current by listening to the structure's changes.
//!
//! Two sync strategies exist:
//!
//! - **Event-driven + batched**: discrete changes are forwarded into a
//!   [`batch`](crate::batch::batch) loop and folded into one write per window
//!   ([`EventsService`], [`TrackerService`], batched [`CollectionService`]s)
//! - **Sampled**: the whole value is sampled, on a throttle or a fixed
//!   interval, and diffed against the last written snapshot (throttled
//!   [`CollectionService`], [`KeyValueService`])

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use roost_core::Subscription;
use roost_storage::{Backend, StorageError, TableSpec, TableStore};

use crate::batch::Batch;
use crate::error::{SyncError, SyncResult};

pub mod collection;
pub mod events;
pub mod key_value;
pub mod tracker;

pub use collection::{CollectionService, SyncMode};
pub use events::EventsService;
pub use key_value::KeyValueService;
pub use tracker::{TrackerRow, TrackerService};

/// Uniform contract for every cached entity
#[async_trait]
pub trait DatabaseService: Send + Sync {
    /// Service name, also the table name
    fn name(&self) -> &str;

    /// Table this service persists into
    fn table_spec(&self) -> TableSpec;

    /// Open the backing table. Fails if this service was already initialized.
    async fn initialize_database(&self, backend: &dyn Backend) -> SyncResult<()>;

    /// Load the persisted snapshot into the in-memory structure.
    ///
    /// Returns the number of rows read.
    async fn initialize_state(&self) -> SyncResult<usize>;

    /// Start propagating in-memory changes to the table
    fn sync(self: Arc<Self>) -> SyncResult<SyncHandle>;

    /// Empty both the in-memory structure and the table
    async fn clear(&self) -> SyncResult<()>;
}

/// Table handle set once by `initialize_database`
pub(crate) struct TableSlot {
    name: &'static str,
    table: OnceLock<Arc<dyn TableStore>>,
}

impl TableSlot {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            table: OnceLock::new(),
        }
    }

    pub(crate) async fn open(&self, backend: &dyn Backend, spec: &TableSpec) -> SyncResult<()> {
        if self.table.get().is_some() {
            return Err(StorageError::already_initialized(self.name).into());
        }
        let table = backend.open(spec).await?;
        self.table
            .set(table)
            .map_err(|_| StorageError::already_initialized(self.name))?;
        Ok(())
    }

    pub(crate) fn get(&self) -> SyncResult<Arc<dyn TableStore>> {
        self.table
            .get()
            .cloned()
            .ok_or_else(|| SyncError::NotInitialized(self.name.to_string()))
    }
}

/// Running sync loops of one service
pub struct SyncHandle {
    name: String,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn new(name: impl Into<String>) -> (Self, StopSignal) {
        let (stop, rx) = watch::channel(false);
        let handle = Self {
            name: name.into(),
            stop,
            tasks: Vec::new(),
        };
        (handle, StopSignal(rx))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spawn<F>(&mut self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(future));
    }

    /// Signal every loop to stop. A batch that is already pending still
    /// flushes once; nothing received afterwards is written.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Wait for every loop to finish
    pub async fn join(self) -> SyncResult<()> {
        for task in self.tasks {
            task.await?;
        }
        Ok(())
    }
}

/// Receiving side of [`SyncHandle::stop`]
#[derive(Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// Resolve once stop was requested or the handle was dropped
    pub async fn stopped(&mut self) {
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

/// Feed discrete changes into a batch loop until stopped
pub(crate) async fn forward<T: Send + 'static>(
    name: &'static str,
    mut changes: Subscription<T>,
    mut stop: StopSignal,
    batch: Batch<T>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.stopped() => {
                // Changes emitted before the stop belong to the final batch
                while let Some(change) = changes.try_recv() {
                    batch.push(change);
                }
                break;
            }
            change = changes.recv() => match change {
                Some(change) => {
                    batch.push(change);
                }
                None => break,
            },
        }
    }
    debug!(service = name, "Sync loop stopping");
    batch.close().await;
}

/// Upserts and deletes that turn `previous` into `current`
pub(crate) fn diff_maps<V: PartialEq + Clone>(
    previous: &BTreeMap<String, V>,
    current: &BTreeMap<String, V>,
) -> (Vec<(String, V)>, Vec<String>) {
    let upserts = current
        .iter()
        .filter(|(key, value)| previous.get(*key) != Some(value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let deletes = previous
        .keys()
        .filter(|key| !current.contains_key(*key))
        .cloned()
        .collect();
    (upserts, deletes)
}
