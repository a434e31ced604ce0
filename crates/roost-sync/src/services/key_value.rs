//! Interval-sampled key/value persistence (freshness, plaintext)
//!
//! These maps change constantly and only their current state matters, so
//! individual mutations are ignored. On every tick the whole map is sampled
//! and diffed against the last snapshot written to disk.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use roost_core::Store;
use roost_storage::{Backend, Row, StorageError, TableSpec, TableStore};

use crate::error::SyncResult;
use crate::services::{DatabaseService, StopSignal, SyncHandle, TableSlot, diff_maps};

const KEY: &str = "key";

/// Persisted form of one entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValueRow<V> {
    pub key: String,
    pub value: V,
}

pub struct KeyValueService<V> {
    name: &'static str,
    store: Arc<Store<BTreeMap<String, V>>>,
    interval: Duration,
    table: TableSlot,
    written: Mutex<BTreeMap<String, V>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl<V> KeyValueService<V>
where
    V: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: &'static str, store: Arc<Store<BTreeMap<String, V>>>, interval: Duration) -> Self {
        Self {
            name,
            store,
            interval,
            table: TableSlot::new(name),
            written: Mutex::new(BTreeMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Sample the store and write whatever changed since the last sample
    pub async fn sample(&self) -> SyncResult<(usize, usize)> {
        let table = self.table.get()?;
        let current = self.store.get();
        let previous = self.written.lock().clone();

        let (upserts, deletes) = diff_maps(&previous, &current);
        if upserts.is_empty() && deletes.is_empty() {
            return Ok((0, 0));
        }
        let counts = (upserts.len(), deletes.len());

        self.write(table.as_ref(), upserts, deletes).await?;
        *self.written.lock() = current;
        Ok(counts)
    }

    async fn write(
        &self,
        table: &dyn TableStore,
        upserts: Vec<(String, V)>,
        deletes: Vec<String>,
    ) -> Result<(), StorageError> {
        let rows = upserts
            .into_iter()
            .map(|(key, value)| {
                let row = KeyValueRow {
                    key: key.clone(),
                    value,
                };
                Row::encode(key, &row)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let _lock = self.write_lock.lock().await;
        table.bulk_put(rows).await?;
        table.bulk_delete(deletes).await?;
        Ok(())
    }

    async fn run(self: Arc<Self>, mut stop: StopSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                _ = ticker.tick() => {
                    match self.sample().await {
                        Ok((0, 0)) => {}
                        Ok((written, deleted)) => {
                            debug!(table = self.name, written, deleted, "Sampled store")
                        }
                        Err(e) => error!(table = self.name, error = %e, "Sample write failed"),
                    }
                }
            }
        }
        debug!(service = self.name, "Sync loop stopping");
    }
}

#[async_trait]
impl<V> DatabaseService for KeyValueService<V>
where
    V: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.name
    }

    fn table_spec(&self) -> TableSpec {
        TableSpec::new(self.name, KEY)
    }

    async fn initialize_database(&self, backend: &dyn Backend) -> SyncResult<()> {
        self.table.open(backend, &self.table_spec()).await
    }

    #[instrument(skip(self), fields(table = self.name))]
    async fn initialize_state(&self) -> SyncResult<usize> {
        let table = self.table.get()?;
        let rows = table.get_all().await?;
        let total = rows.len();

        let mut map = BTreeMap::new();
        for row in rows {
            match row.decode::<KeyValueRow<V>>() {
                Ok(entry) => {
                    map.insert(entry.key, entry.value);
                }
                Err(e) => warn!(key = %row.key, error = %e, "Skipping undecodable row"),
            }
        }

        info!(rows = total, loaded = map.len(), "Loaded entries");
        *self.written.lock() = map.clone();
        self.store.set(map);
        Ok(total)
    }

    fn sync(self: Arc<Self>) -> SyncResult<SyncHandle> {
        self.table.get()?;
        let (mut handle, stop) = SyncHandle::new(self.name);
        handle.spawn(Arc::clone(&self).run(stop));
        Ok(handle)
    }

    async fn clear(&self) -> SyncResult<()> {
        let table = self.table.get()?;
        self.store.set(BTreeMap::new());
        let _lock = self.write_lock.lock().await;
        table.clear().await?;
        *self.written.lock() = BTreeMap::new();
        Ok(())
    }
}
