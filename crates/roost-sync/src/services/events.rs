//! Event persistence with bounded retention
//!
//! Repository deltas are batched and written as one upsert and one delete
//! per window. Only events with a positive rank are stored. A running count
//! of managed rows drives the retention sweep, which trims the table back to
//! the policy limit once the count passes the sweep threshold.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use roost_core::{Event, Repository, RepositoryUpdate};
use roost_storage::{Backend, Row, TableSpec};

use crate::batch::batch;
use crate::error::SyncResult;
use crate::retention::{Candidate, RetentionPolicy, rank};
use crate::services::{DatabaseService, SyncHandle, TableSlot, forward};

const TABLE: &str = "events";
const KEY: &str = "id";

/// Clears the sweep flag when a sweep ends, however it ends
struct SweepGuard<'a>(&'a AtomicBool);

impl<'a> SweepGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Writes accumulated in one batch
#[derive(Debug, Default)]
struct Folded {
    puts: BTreeMap<String, Event>,
    deletes: BTreeSet<String>,
}

impl Folded {
    /// Last write wins per id; zero-rank additions are dropped
    fn fold(updates: Vec<RepositoryUpdate>) -> Self {
        let mut folded = Self::default();
        for update in updates {
            for event in update.added {
                if rank(&event) > 0.0 {
                    folded.deletes.remove(&event.id);
                    folded.puts.insert(event.id.clone(), event);
                }
            }
            for id in update.removed {
                folded.puts.remove(&id);
                folded.deletes.insert(id);
            }
        }
        folded
    }
}

pub struct EventsService {
    repository: Arc<Repository>,
    policy: RetentionPolicy,
    window: Duration,
    table: TableSlot,
    managed: AtomicUsize,
    evicting: AtomicBool,
    write_lock: tokio::sync::Mutex<()>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventsService {
    pub fn new(repository: Arc<Repository>, policy: RetentionPolicy, window: Duration) -> Self {
        Self {
            repository,
            policy,
            window,
            table: TableSlot::new(TABLE),
            managed: AtomicUsize::new(0),
            evicting: AtomicBool::new(false),
            write_lock: tokio::sync::Mutex::new(()),
            sweep_task: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Rows this service believes are persisted
    pub fn managed_count(&self) -> usize {
        self.managed.load(Ordering::Acquire)
    }

    pub fn is_evicting(&self) -> bool {
        self.evicting.load(Ordering::Acquire)
    }

    /// Run a retention sweep now.
    ///
    /// Returns `None` without touching the table when a sweep is already
    /// running, otherwise the number of evicted rows.
    pub async fn evict(&self) -> Option<SyncResult<usize>> {
        let _guard = SweepGuard::acquire(&self.evicting)?;
        Some(self.sweep().await)
    }

    /// Wait for the most recently triggered background sweep, if any
    pub async fn wait_for_sweep(&self) {
        let task = self.sweep_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    #[instrument(skip(self), fields(table = TABLE, limit = self.policy.limit()))]
    async fn sweep(&self) -> SyncResult<usize> {
        let table = self.table.get()?;

        // Reads do not take the write lock; flushes keep landing meanwhile
        let rows = table.get_all().await?;
        let total = rows.len();
        let candidates = rows
            .into_iter()
            .map(|row| match row.decode::<Event>() {
                Ok(event) => Candidate::from_event(&event),
                Err(_) => Candidate::new(row.key, 0.0, 0),
            })
            .collect();

        let evicted = self.policy.select_for_eviction(candidates);
        let count = evicted.len();
        if count == 0 {
            debug!(total, "Nothing to evict");
            return Ok(0);
        }

        {
            let _lock = self.write_lock.lock().await;
            table.bulk_delete(evicted).await?;
        }

        let _ = self
            .managed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |managed| {
                Some(managed.saturating_sub(count))
            });

        info!(total, evicted = count, "Retention sweep complete");
        Ok(count)
    }

    fn trigger_sweep(self: &Arc<Self>) {
        if self.is_evicting() {
            debug!(managed = self.managed_count(), "Sweep already running");
            return;
        }

        let service = Arc::clone(self);
        let task = tokio::spawn(async move {
            match service.evict().await {
                Some(Ok(_)) => {}
                Some(Err(e)) => error!(table = TABLE, error = %e, "Retention sweep failed"),
                None => debug!(table = TABLE, "Sweep already running"),
            }
        });
        *self.sweep_task.lock() = Some(task);
    }

    async fn flush(self: &Arc<Self>, updates: Vec<RepositoryUpdate>) {
        let Ok(table) = self.table.get() else {
            return;
        };

        let Folded { puts, deletes } = Folded::fold(updates);
        if puts.is_empty() && deletes.is_empty() {
            return;
        }

        let mut rows = Vec::with_capacity(puts.len());
        for (id, event) in &puts {
            match Row::encode(id.clone(), event) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(table = TABLE, key = %id, error = %e, "Skipping unencodable event"),
            }
        }
        let kept = rows.len();
        let removed = deletes.len();

        let written = {
            let _lock = self.write_lock.lock().await;
            match table.bulk_put(rows).await {
                Ok(()) => table.bulk_delete(deletes.into_iter().collect()).await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = written {
            error!(table = TABLE, kept, removed, error = %e, "Flush failed");
            return;
        }

        let count = self
            .managed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |managed| {
                Some((managed + kept).saturating_sub(removed))
            })
            .map(|previous| (previous + kept).saturating_sub(removed))
            .unwrap_or_default();

        debug!(table = TABLE, kept, removed, managed = count, "Flushed events");

        if self.policy.should_sweep(count) {
            self.trigger_sweep();
        }
    }
}

#[async_trait]
impl DatabaseService for EventsService {
    fn name(&self) -> &str {
        TABLE
    }

    fn table_spec(&self) -> TableSpec {
        TableSpec::new(TABLE, KEY)
    }

    async fn initialize_database(&self, backend: &dyn Backend) -> SyncResult<()> {
        self.table.open(backend, &self.table_spec()).await
    }

    #[instrument(skip(self), fields(table = TABLE))]
    async fn initialize_state(&self) -> SyncResult<usize> {
        let table = self.table.get()?;
        let rows = table.get_all().await?;
        let total = rows.len();

        let mut events = Vec::with_capacity(total);
        for row in rows {
            match row.decode::<Event>() {
                Ok(event) => events.push(event.into_trusted()),
                Err(e) => warn!(key = %row.key, error = %e, "Skipping undecodable row"),
            }
        }

        let loaded = events.len();
        self.managed.store(total, Ordering::Release);
        self.repository.load(events);

        info!(rows = total, loaded, "Loaded events");
        Ok(total)
    }

    fn sync(self: Arc<Self>) -> SyncResult<SyncHandle> {
        self.table.get()?;

        let changes = self.repository.subscribe();
        let (mut handle, stop) = SyncHandle::new(TABLE);

        let service = Arc::clone(&self);
        let batch = batch(self.window, move |updates: Vec<RepositoryUpdate>| {
            let service = Arc::clone(&service);
            async move { service.flush(updates).await }
        });

        // A sweep started by the last flush must not outlive the handle
        handle.spawn(async move {
            forward(TABLE, changes, stop, batch).await;
            self.wait_for_sweep().await;
        });
        Ok(handle)
    }

    async fn clear(&self) -> SyncResult<()> {
        let table = self.table.get()?;
        self.wait_for_sweep().await;
        self.repository.clear();
        {
            let _lock = self.write_lock.lock().await;
            table.clear().await?;
        }
        self.managed.store(0, Ordering::Release);
        Ok(())
    }
}
