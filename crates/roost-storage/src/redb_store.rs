//! redb table backend
//!
//! Schemaless variant: one database file, one redb table per entity keyed by
//! the entity's key path. There are no migrations; the declared version of
//! each table is recorded in a metadata table, and tables nobody declares
//! are dropped in [`Backend::prepare`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use redb::{
    Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableError, TableHandle,
};
use tracing::{debug, info, instrument, warn};

use crate::error::StorageError;
use crate::table::{Backend, BackendKind, Row, TableSpec, TableStore, blocking, validate_identifier};

/// Declared version per table
const META: TableDefinition<&str, u32> = TableDefinition::new("__roost_meta");

fn definition(name: &str) -> TableDefinition<'_, &'static str, &'static str> {
    TableDefinition::new(name)
}

/// Configuration for redb storage
#[derive(Debug, Clone)]
pub struct RedbConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Cache size in bytes
    pub cache_size: usize,
}

impl Default for RedbConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/roost.redb"),
            cache_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl RedbConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }
}

/// Key/value table backend over a single redb file
pub struct RedbBackend {
    db: Arc<Database>,
    config: RedbConfig,
    bound: DashSet<String>,
}

impl RedbBackend {
    /// Open or create the database
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::builder()
            .set_cache_size(config.cache_size)
            .create(&config.db_path)
            .map_err(|e| StorageError::open("redb", e))?;

        info!("Opened redb database");

        Ok(Self {
            db: Arc::new(db),
            config,
            bound: DashSet::new(),
        })
    }

    pub fn config(&self) -> &RedbConfig {
        &self.config
    }

    /// Names of every entity table currently in the file
    pub async fn table_names(&self) -> Result<Vec<String>, StorageError> {
        let db = self.db.clone();
        blocking(move || {
            let txn = db.begin_read().map_err(StorageError::database)?;
            let names = txn
                .list_tables()
                .map_err(StorageError::database)?
                .map(|handle| handle.name().to_string())
                .filter(|name| name != META.name())
                .collect();
            Ok(names)
        })
        .await
    }

    /// Version recorded for `name` at the last prepare
    pub async fn recorded_version(&self, name: &str) -> Result<Option<u32>, StorageError> {
        let db = self.db.clone();
        let name = name.to_string();
        blocking(move || {
            let txn = db.begin_read().map_err(StorageError::database)?;
            let meta = match txn.open_table(META) {
                Ok(meta) => meta,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(StorageError::database(e)),
            };
            let version = meta
                .get(name.as_str())
                .map_err(StorageError::database)?
                .map(|v| v.value());
            Ok(version)
        })
        .await
    }
}

#[async_trait]
impl Backend for RedbBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redb
    }

    #[instrument(skip(self, tables), fields(declared = tables.len()))]
    async fn prepare(&self, tables: &[TableSpec]) -> Result<(), StorageError> {
        for spec in tables {
            validate_identifier(&spec.name)?;
        }

        let db = self.db.clone();
        let declared: Vec<(String, u32)> = tables
            .iter()
            .map(|spec| (spec.name.clone(), spec.version()))
            .collect();

        blocking(move || {
            let names: HashSet<&str> = declared.iter().map(|(name, _)| name.as_str()).collect();
            let txn = db.begin_write().map_err(StorageError::database)?;

            let orphans: Vec<_> = txn
                .list_tables()
                .map_err(StorageError::database)?
                .filter(|handle| handle.name() != META.name() && !names.contains(handle.name()))
                .collect();
            for orphan in orphans {
                warn!(table = orphan.name(), "Dropping undeclared table");
                txn.delete_table(orphan).map_err(StorageError::database)?;
            }

            {
                let mut meta = txn.open_table(META).map_err(StorageError::database)?;
                let stale: Vec<String> = meta
                    .iter()
                    .map_err(StorageError::database)?
                    .filter_map(|entry| entry.ok())
                    .map(|(name, _)| name.value().to_string())
                    .filter(|name| !names.contains(name.as_str()))
                    .collect();
                for name in stale {
                    meta.remove(name.as_str()).map_err(StorageError::database)?;
                }

                for (name, version) in &declared {
                    let previous = meta
                        .insert(name.as_str(), *version)
                        .map_err(StorageError::database)?
                        .map(|v| v.value());
                    if previous.is_some_and(|p| p != *version) {
                        debug!(table = %name, ?previous, version, "Declared version changed");
                    }
                }
            }

            txn.commit().map_err(StorageError::database)?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, spec), fields(table = %spec.name))]
    async fn open(&self, spec: &TableSpec) -> Result<Arc<dyn TableStore>, StorageError> {
        validate_identifier(&spec.name)?;

        if !self.bound.insert(spec.name.clone()) {
            return Err(StorageError::already_initialized(&spec.name));
        }

        let db = self.db.clone();
        let name = spec.name.clone();
        let created = blocking(move || {
            let txn = db
                .begin_write()
                .map_err(|e| StorageError::open(&name, e))?;
            txn.open_table(definition(&name))
                .map_err(|e| StorageError::open(&name, e))?;
            txn.commit().map_err(|e| StorageError::open(&name, e))?;
            Ok(())
        })
        .await;

        if let Err(e) = created {
            self.bound.remove(&spec.name);
            return Err(e);
        }

        debug!("Opened redb table");

        Ok(Arc::new(RedbTable {
            name: spec.name.clone(),
            db: self.db.clone(),
        }))
    }

    fn release(&self, name: &str) {
        self.bound.remove(name);
    }
}

/// One entity table inside the shared database
pub struct RedbTable {
    name: String,
    db: Arc<Database>,
}

#[async_trait]
impl TableStore for RedbTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_all(&self) -> Result<Vec<Row>, StorageError> {
        let db = self.db.clone();
        let name = self.name.clone();
        blocking(move || {
            let txn = db.begin_read().map_err(StorageError::database)?;
            let table = txn
                .open_table(definition(&name))
                .map_err(StorageError::database)?;
            let mut rows = Vec::new();
            for entry in table.iter().map_err(StorageError::database)? {
                let (key, data) = entry.map_err(StorageError::database)?;
                rows.push(Row::new(key.value(), data.value()));
            }
            Ok(rows)
        })
        .await
    }

    async fn bulk_put(&self, rows: Vec<Row>) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let db = self.db.clone();
        let name = self.name.clone();
        blocking(move || {
            let txn = db.begin_write().map_err(StorageError::database)?;
            {
                let mut table = txn
                    .open_table(definition(&name))
                    .map_err(StorageError::database)?;
                for row in &rows {
                    table
                        .insert(row.key.as_str(), row.data.as_str())
                        .map_err(StorageError::database)?;
                }
            }
            txn.commit().map_err(StorageError::database)?;
            Ok(())
        })
        .await
    }

    async fn bulk_delete(&self, keys: Vec<String>) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let db = self.db.clone();
        let name = self.name.clone();
        blocking(move || {
            let txn = db.begin_write().map_err(StorageError::database)?;
            {
                let mut table = txn
                    .open_table(definition(&name))
                    .map_err(StorageError::database)?;
                for key in &keys {
                    table
                        .remove(key.as_str())
                        .map_err(StorageError::database)?;
                }
            }
            txn.commit().map_err(StorageError::database)?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let db = self.db.clone();
        let name = self.name.clone();
        blocking(move || {
            let txn = db.begin_write().map_err(StorageError::database)?;
            txn.delete_table(definition(&name))
                .map_err(StorageError::database)?;
            txn.open_table(definition(&name))
                .map_err(StorageError::database)?;
            txn.commit().map_err(StorageError::database)?;
            Ok(())
        })
        .await
    }

    async fn replace_all(&self, rows: Vec<Row>) -> Result<(), StorageError> {
        let db = self.db.clone();
        let name = self.name.clone();
        blocking(move || {
            let txn = db.begin_write().map_err(StorageError::database)?;
            txn.delete_table(definition(&name))
                .map_err(StorageError::database)?;
            {
                let mut table = txn
                    .open_table(definition(&name))
                    .map_err(StorageError::database)?;
                for row in &rows {
                    table
                        .insert(row.key.as_str(), row.data.as_str())
                        .map_err(StorageError::database)?;
                }
            }
            txn.commit().map_err(StorageError::database)?;
            Ok(())
        })
        .await
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let db = self.db.clone();
        let name = self.name.clone();
        blocking(move || {
            let txn = db.begin_read().map_err(StorageError::database)?;
            let table = txn
                .open_table(definition(&name))
                .map_err(StorageError::database)?;
            Ok(table.len().map_err(StorageError::database)? as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend() -> (RedbBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = RedbBackend::open(RedbConfig::new(dir.path().join("cache.redb"))).unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn test_prepare_drops_undeclared_tables() {
        let (backend, _dir) = backend();
        let old = TableSpec::new("legacy", "id");
        let events = TableSpec::new("events", "id");

        backend.prepare(&[old.clone(), events.clone()]).await.unwrap();
        let legacy = backend.open(&old).await.unwrap();
        legacy.bulk_put(vec![Row::new("a", "{}")]).await.unwrap();
        backend.open(&events).await.unwrap();
        assert_eq!(backend.recorded_version("legacy").await.unwrap(), Some(1));

        backend.prepare(&[events]).await.unwrap();
        let names = backend.table_names().await.unwrap();
        assert_eq!(names, vec!["events".to_string()]);
        assert_eq!(backend.recorded_version("legacy").await.unwrap(), None);
        assert_eq!(backend.recorded_version("events").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_clear_keeps_table_usable() {
        let (backend, _dir) = backend();
        let table = backend.open(&TableSpec::new("handles", "nip05")).await.unwrap();

        table
            .bulk_put(vec![Row::new("a", "1"), Row::new("b", "2")])
            .await
            .unwrap();
        table.clear().await.unwrap();
        assert_eq!(table.count().await.unwrap(), 0);

        table.bulk_put(vec![Row::new("c", "3")]).await.unwrap();
        assert_eq!(table.get_all().await.unwrap(), vec![Row::new("c", "3")]);
    }

    #[tokio::test]
    async fn test_recorded_version_before_prepare() {
        let (backend, _dir) = backend();
        assert_eq!(backend.recorded_version("events").await.unwrap(), None);
    }
}
