//! Keyed record persistence (relays, handles, zappers)

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use roost_core::collection::Snapshot;
use roost_core::{Collection, CollectionChange, Keyed};
use roost_storage::{Backend, Row, StorageError, TableSpec, TableStore};

use crate::batch::{batch, throttled};
use crate::error::SyncResult;
use crate::services::{DatabaseService, StopSignal, SyncHandle, TableSlot, diff_maps, forward};

/// How a collection's changes reach its table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Fold discrete changes, flushing once per window
    Batched(Duration),
    /// Sample the whole collection at most once per window and diff it
    Throttled(Duration),
}

/// Writes accumulated in one batch
struct Folded<T> {
    puts: BTreeMap<String, T>,
    deletes: BTreeSet<String>,
    rewrite: bool,
}

impl<T: Keyed> Folded<T> {
    fn fold(changes: Vec<CollectionChange<T>>) -> Self {
        let mut folded = Self {
            puts: BTreeMap::new(),
            deletes: BTreeSet::new(),
            rewrite: false,
        };
        for change in changes {
            match change {
                CollectionChange::Put(records) => {
                    for record in records {
                        folded.deletes.remove(record.key());
                        folded.puts.insert(record.key().to_string(), record);
                    }
                }
                CollectionChange::Remove(keys) => {
                    for key in keys {
                        folded.puts.remove(&key);
                        folded.deletes.insert(key);
                    }
                }
                CollectionChange::Load | CollectionChange::Clear => folded.rewrite = true,
            }
        }
        folded
    }
}

pub struct CollectionService<T: Keyed> {
    name: &'static str,
    key_path: &'static str,
    collection: Arc<Collection<T>>,
    mode: SyncMode,
    table: TableSlot,
    /// Last snapshot known to be on disk, for throttled diffs
    written: Mutex<Snapshot<T>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl<T> CollectionService<T>
where
    T: Keyed + PartialEq + Serialize + DeserializeOwned,
{
    pub fn new(
        name: &'static str,
        key_path: &'static str,
        collection: Arc<Collection<T>>,
        mode: SyncMode,
    ) -> Self {
        Self {
            name,
            key_path,
            collection,
            mode,
            table: TableSlot::new(name),
            written: Mutex::new(Arc::new(BTreeMap::new())),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    fn encode_all<'a>(
        records: impl IntoIterator<Item = (&'a String, &'a T)>,
    ) -> Result<Vec<Row>, StorageError> {
        records
            .into_iter()
            .map(|(key, record)| Row::encode(key.clone(), record))
            .collect()
    }

    async fn write_batch(&self, table: &dyn TableStore, folded: Folded<T>) -> Result<(), StorageError> {
        let _lock = self.write_lock.lock().await;
        if folded.rewrite {
            let snapshot = self.collection.snapshot();
            let rows = Self::encode_all(snapshot.iter())?;
            table.replace_all(rows).await?;
            *self.written.lock() = snapshot;
            return Ok(());
        }

        let rows = Self::encode_all(folded.puts.iter())?;
        table.bulk_put(rows).await?;
        table.bulk_delete(folded.deletes.into_iter().collect()).await?;
        Ok(())
    }

    async fn flush(&self, changes: Vec<CollectionChange<T>>) {
        let Ok(table) = self.table.get() else {
            return;
        };
        let folded = Folded::fold(changes);
        let (puts, deletes, rewrite) = (folded.puts.len(), folded.deletes.len(), folded.rewrite);

        match self.write_batch(table.as_ref(), folded).await {
            Ok(()) => debug!(table = self.name, puts, deletes, rewrite, "Flushed records"),
            Err(e) => error!(table = self.name, error = %e, "Flush failed"),
        }
    }

    async fn write_snapshot(&self, table: &dyn TableStore, current: Snapshot<T>) {
        let previous = self.written.lock().clone();
        let (upserts, deletes) = diff_maps(&previous, &current);
        if upserts.is_empty() && deletes.is_empty() {
            return;
        }
        let (puts, removed) = (upserts.len(), deletes.len());

        let written = async {
            let rows = Self::encode_all(upserts.iter().map(|(key, record)| (key, record)))?;
            let _lock = self.write_lock.lock().await;
            table.bulk_put(rows).await?;
            table.bulk_delete(deletes).await?;
            Ok::<_, StorageError>(())
        }
        .await;

        match written {
            Ok(()) => {
                *self.written.lock() = current;
                debug!(table = self.name, puts, deletes = removed, "Wrote snapshot");
            }
            Err(e) => error!(table = self.name, error = %e, "Snapshot write failed"),
        }
    }

    async fn follow(self: Arc<Self>, window: Duration, mut stop: StopSignal) {
        let Ok(table) = self.table.get() else {
            return;
        };
        let mut throttled = throttled(window, self.collection.watch());

        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                changed = throttled.changed() => {
                    if !changed {
                        break;
                    }
                    let current = throttled.latest();
                    self.write_snapshot(table.as_ref(), current).await;
                }
            }
        }
        debug!(service = self.name, "Sync loop stopping");
    }
}

#[async_trait]
impl<T> DatabaseService for CollectionService<T>
where
    T: Keyed + PartialEq + Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        self.name
    }

    fn table_spec(&self) -> TableSpec {
        TableSpec::new(self.name, self.key_path)
    }

    async fn initialize_database(&self, backend: &dyn Backend) -> SyncResult<()> {
        self.table.open(backend, &self.table_spec()).await
    }

    #[instrument(skip(self), fields(table = self.name))]
    async fn initialize_state(&self) -> SyncResult<usize> {
        let table = self.table.get()?;
        let rows = table.get_all().await?;
        let total = rows.len();

        let mut records = Vec::with_capacity(total);
        for row in rows {
            match row.decode::<T>() {
                Ok(record) => records.push(record),
                Err(e) => warn!(key = %row.key, error = %e, "Skipping undecodable row"),
            }
        }

        info!(rows = total, loaded = records.len(), "Loaded records");
        self.collection.load(records);
        *self.written.lock() = self.collection.snapshot();
        Ok(total)
    }

    fn sync(self: Arc<Self>) -> SyncResult<SyncHandle> {
        self.table.get()?;
        let (mut handle, stop) = SyncHandle::new(self.name);

        match self.mode {
            SyncMode::Batched(window) => {
                let changes = self.collection.subscribe();
                let service = Arc::clone(&self);
                let batch = batch(window, move |changes: Vec<CollectionChange<T>>| {
                    let service = Arc::clone(&service);
                    async move { service.flush(changes).await }
                });
                handle.spawn(forward(self.name, changes, stop, batch));
            }
            SyncMode::Throttled(window) => {
                handle.spawn(Arc::clone(&self).follow(window, stop));
            }
        }
        Ok(handle)
    }

    async fn clear(&self) -> SyncResult<()> {
        let table = self.table.get()?;
        self.collection.clear();
        let _lock = self.write_lock.lock().await;
        table.clear().await?;
        *self.written.lock() = Arc::new(BTreeMap::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::HandleRecord;

    fn handle(name: &str, fetched_at: u64) -> HandleRecord {
        HandleRecord {
            nip05: name.to_string(),
            pubkey: None,
            relays: vec![],
            nip46: vec![],
            fetched_at,
        }
    }

    #[test]
    fn test_fold_keeps_latest_record() {
        let folded = Folded::fold(vec![
            CollectionChange::Put(vec![handle("a@x", 1), handle("b@x", 1)]),
            CollectionChange::Put(vec![handle("a@x", 2)]),
            CollectionChange::Remove(vec!["b@x".to_string()]),
        ]);

        assert!(!folded.rewrite);
        assert_eq!(folded.puts.len(), 1);
        assert_eq!(folded.puts["a@x"].fetched_at, 2);
        assert_eq!(folded.deletes, BTreeSet::from(["b@x".to_string()]));
    }

    #[test]
    fn test_fold_load_requests_rewrite() {
        let folded: Folded<HandleRecord> = Folded::fold(vec![CollectionChange::Load]);
        assert!(folded.rewrite);
    }
}
