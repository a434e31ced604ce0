//! Relay provenance persistence
//!
//! Each row holds the full relay set of one event id. A batch of tracker
//! changes is folded into the set of touched ids, and each touched id's
//! current relay set is written at flush time.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use roost_core::{Tracker, TrackerChange};
use roost_storage::{Backend, Row, StorageError, TableSpec, TableStore};

use crate::batch::batch;
use crate::error::SyncResult;
use crate::services::{DatabaseService, SyncHandle, TableSlot, forward};

const TABLE: &str = "tracker";
const KEY: &str = "id";

/// Persisted form of one tracker entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerRow {
    pub id: String,
    pub relays: Vec<String>,
}

/// What a batch of changes requires at flush time
#[derive(Debug, Default, PartialEq)]
enum Pending {
    #[default]
    Nothing,
    Ids(BTreeSet<String>),
    /// Contents were replaced or cleared; rewrite everything
    Everything,
}

impl Pending {
    fn fold(changes: Vec<TrackerChange>) -> Self {
        let mut pending = Pending::Nothing;
        for change in changes {
            match change {
                TrackerChange::Load | TrackerChange::Clear => pending = Pending::Everything,
                TrackerChange::Add { id, .. } | TrackerChange::Remove { id, .. } => {
                    if let Pending::Ids(ids) = &mut pending {
                        ids.insert(id);
                    } else if pending == Pending::Nothing {
                        pending = Pending::Ids(BTreeSet::from([id]));
                    }
                }
            }
        }
        pending
    }
}

pub struct TrackerService {
    tracker: Arc<Tracker>,
    window: Duration,
    table: TableSlot,
    write_lock: tokio::sync::Mutex<()>,
}

impl TrackerService {
    pub fn new(tracker: Arc<Tracker>, window: Duration) -> Self {
        Self {
            tracker,
            window,
            table: TableSlot::new(TABLE),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn encode(id: &str, relays: &BTreeSet<String>) -> Result<Row, StorageError> {
        Row::encode(
            id,
            &TrackerRow {
                id: id.to_string(),
                relays: relays.iter().cloned().collect(),
            },
        )
    }

    async fn write(&self, table: &dyn TableStore, pending: Pending) -> Result<(usize, usize), StorageError> {
        let _lock = self.write_lock.lock().await;
        match pending {
            Pending::Nothing => Ok((0, 0)),
            Pending::Everything => {
                let rows = self
                    .tracker
                    .dump()
                    .iter()
                    .map(|(id, relays)| Self::encode(id, relays))
                    .collect::<Result<Vec<_>, _>>()?;
                let count = rows.len();
                table.replace_all(rows).await?;
                Ok((count, 0))
            }
            Pending::Ids(ids) => {
                let mut rows = Vec::new();
                let mut deletes = Vec::new();
                for id in ids {
                    let relays = self.tracker.get_relays(&id);
                    if relays.is_empty() {
                        deletes.push(id);
                    } else {
                        rows.push(Self::encode(&id, &relays)?);
                    }
                }
                let counts = (rows.len(), deletes.len());
                table.bulk_put(rows).await?;
                table.bulk_delete(deletes).await?;
                Ok(counts)
            }
        }
    }

    async fn flush(&self, changes: Vec<TrackerChange>) {
        let Ok(table) = self.table.get() else {
            return;
        };
        match self.write(table.as_ref(), Pending::fold(changes)).await {
            Ok((written, deleted)) => {
                debug!(table = TABLE, written, deleted, "Flushed tracker")
            }
            Err(e) => error!(table = TABLE, error = %e, "Flush failed"),
        }
    }
}

#[async_trait]
impl DatabaseService for TrackerService {
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

        let mut map = HashMap::with_capacity(total);
        for row in rows {
            match row.decode::<TrackerRow>() {
                Ok(entry) => {
                    map.insert(entry.id, entry.relays.into_iter().collect());
                }
                Err(e) => warn!(key = %row.key, error = %e, "Skipping undecodable row"),
            }
        }

        info!(rows = total, loaded = map.len(), "Loaded tracker");
        self.tracker.load(map);
        Ok(total)
    }

    fn sync(self: Arc<Self>) -> SyncResult<SyncHandle> {
        self.table.get()?;

        let changes = self.tracker.subscribe();
        let (mut handle, stop) = SyncHandle::new(TABLE);

        let service = Arc::clone(&self);
        let batch = batch(self.window, move |changes: Vec<TrackerChange>| {
            let service = Arc::clone(&service);
            async move { service.flush(changes).await }
        });

        handle.spawn(forward(TABLE, changes, stop, batch));
        Ok(handle)
    }

    async fn clear(&self) -> SyncResult<()> {
        let table = self.table.get()?;
        self.tracker.clear();
        let _lock = self.write_lock.lock().await;
        table.clear().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(id: &str, relay: &str) -> TrackerChange {
        TrackerChange::Add {
            id: id.into(),
            relay: relay.into(),
        }
    }

    #[test]
    fn test_fold_touched_ids() {
        let pending = Pending::fold(vec![
            add("a", "wss://1"),
            add("b", "wss://1"),
            TrackerChange::Remove {
                id: "a".into(),
                relay: "wss://1".into(),
            },
        ]);
        assert_eq!(
            pending,
            Pending::Ids(BTreeSet::from(["a".to_string(), "b".to_string()]))
        );
    }

    #[test]
    fn test_fold_clear_rewrites_everything() {
        let pending = Pending::fold(vec![add("a", "wss://1"), TrackerChange::Clear, add("b", "wss://2")]);
        assert_eq!(pending, Pending::Everything);
        assert_eq!(Pending::fold(vec![]), Pending::Nothing);
    }
}
