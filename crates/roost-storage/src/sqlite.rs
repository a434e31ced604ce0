//! SQLite table backend
//!
//! Each table lives behind its own connection, cached for the life of the
//! backend so that reopening a released table reuses it. The schema version
//! is kept in `PRAGMA user_version` and all pending migration steps run in
//! one transaction before the handle is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::table::{Backend, BackendKind, Row, TableSpec, TableStore, blocking, validate_identifier};

/// Where SQLite databases are kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteLocation {
    /// One `<name>.sqlite3` file per table under this directory
    Directory(PathBuf),
    /// Private in-memory database per table
    Memory,
}

type SharedConnection = Arc<Mutex<Connection>>;

/// Relational table backend
pub struct SqliteBackend {
    location: SqliteLocation,
    connections: DashMap<String, SharedConnection>,
    bound: DashSet<String>,
}

impl SqliteBackend {
    pub fn new(location: SqliteLocation) -> Self {
        Self {
            location,
            connections: DashMap::new(),
            bound: DashSet::new(),
        }
    }

    /// Backend storing one file per table under `dir`
    pub fn open_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(SqliteLocation::Directory(dir.as_ref().to_path_buf()))
    }

    pub fn in_memory() -> Self {
        Self::new(SqliteLocation::Memory)
    }

    pub fn location(&self) -> &SqliteLocation {
        &self.location
    }

    /// Drop the cached connection for `name`, closing it once no handle uses it
    pub fn close(&self, name: &str) {
        self.bound.remove(name);
        if self.connections.remove(name).is_some() {
            debug!(table = name, "Closed SQLite connection");
        }
    }

    async fn connection(&self, name: &str) -> Result<SharedConnection, StorageError> {
        if let Some(existing) = self.connections.get(name) {
            debug!(table = name, "Reusing SQLite connection");
            return Ok(existing.value().clone());
        }

        let location = self.location.clone();
        let table = name.to_string();
        let conn = blocking(move || connect(&location, &table)).await?;
        let conn = Arc::new(Mutex::new(conn));

        Ok(self
            .connections
            .entry(name.to_string())
            .or_insert(conn)
            .value()
            .clone())
    }

    async fn open_bound(&self, spec: &TableSpec) -> Result<Arc<dyn TableStore>, StorageError> {
        let conn = self.connection(&spec.name).await?;

        let version = {
            let conn = conn.clone();
            let spec = spec.clone();
            blocking(move || migrate(&mut conn.lock(), &spec)).await?
        };

        info!(table = %spec.name, version, "Opened SQLite table");

        Ok(Arc::new(SqliteTable {
            name: spec.name.clone(),
            key_path: spec.key_path.clone(),
            conn,
        }))
    }
}

fn connect(location: &SqliteLocation, name: &str) -> Result<Connection, StorageError> {
    match location {
        SqliteLocation::Directory(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| StorageError::open(name, e))?;
            let path = dir.join(format!("{name}.sqlite3"));
            let conn = Connection::open(&path).map_err(|e| StorageError::open(name, e))?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
                .map_err(|e| StorageError::open(name, e))?;
            Ok(conn)
        }
        SqliteLocation::Memory => {
            Connection::open_in_memory().map_err(|e| StorageError::open(name, e))
        }
    }
}

/// Apply pending ledger steps. Returns the resulting schema version.
fn migrate(conn: &mut Connection, spec: &TableSpec) -> Result<u32, StorageError> {
    let current: u32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| StorageError::open(&spec.name, e))?;
    let target = spec.version();

    if current > target {
        return Err(StorageError::Migration {
            name: spec.name.clone(),
            version: current,
            cause: format!("stored schema is newer than ledger target {target}"),
        });
    }
    if current == target {
        return Ok(current);
    }

    let migration_error = |version: u32, e: rusqlite::Error| StorageError::Migration {
        name: spec.name.clone(),
        version,
        cause: e.to_string(),
    };

    let tx = conn.transaction().map_err(|e| migration_error(target, e))?;
    for step in spec.ledger.pending(current) {
        for statement in &step.statements {
            tx.execute_batch(statement)
                .map_err(|e| migration_error(step.to_version, e))?;
        }
        debug!(table = %spec.name, version = step.to_version, "Applied migration step");
    }
    tx.pragma_update(None, "user_version", target)
        .map_err(|e| migration_error(target, e))?;
    tx.commit().map_err(|e| migration_error(target, e))?;

    info!(table = %spec.name, from = current, to = target, "Migrated SQLite table");
    Ok(target)
}

#[async_trait]
impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    #[instrument(skip(self, spec), fields(table = %spec.name, version = spec.version()))]
    async fn open(&self, spec: &TableSpec) -> Result<Arc<dyn TableStore>, StorageError> {
        validate_identifier(&spec.name)?;
        validate_identifier(&spec.key_path)?;

        if !self.bound.insert(spec.name.clone()) {
            return Err(StorageError::already_initialized(&spec.name));
        }

        let result = self.open_bound(spec).await;
        if result.is_err() {
            self.bound.remove(&spec.name);
        }
        result
    }

    fn release(&self, name: &str) {
        self.bound.remove(name);
    }
}

/// One table on a cached connection
pub struct SqliteTable {
    name: String,
    key_path: String,
    conn: SharedConnection,
}

impl SqliteTable {
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        blocking(move || f(&mut conn.lock())).await
    }
}

#[async_trait]
impl TableStore for SqliteTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_all(&self) -> Result<Vec<Row>, StorageError> {
        let sql = format!(
            "SELECT {key}, data FROM {table} ORDER BY {key}",
            key = self.key_path,
            table = self.name
        );
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Row {
                        key: row.get(0)?,
                        data: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn bulk_put(&self, rows: Vec<Row>) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}, data) VALUES (?1, ?2)",
            self.name, self.key_path
        );
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for row in &rows {
                    stmt.execute(params![row.key, row.data])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn bulk_delete(&self, keys: Vec<String>) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let sql = format!("DELETE FROM {} WHERE {} = ?1", self.name, self.key_path);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for key in &keys {
                    stmt.execute(params![key])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let sql = format!("DELETE FROM {}", self.name);
        self.with_conn(move |conn| {
            conn.execute(&sql, [])?;
            Ok(())
        })
        .await
    }

    async fn replace_all(&self, rows: Vec<Row>) -> Result<(), StorageError> {
        let clear = format!("DELETE FROM {}", self.name);
        let insert = format!(
            "INSERT OR REPLACE INTO {} ({}, data) VALUES (?1, ?2)",
            self.name, self.key_path
        );
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(&clear, [])?;
            {
                let mut stmt = tx.prepare_cached(&insert)?;
                for row in &rows {
                    stmt.execute(params![row.key, row.data])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.name);
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(count.max(0) as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{Migration, MigrationLedger};

    #[tokio::test]
    async fn test_migrations_applied_once() {
        let backend = SqliteBackend::in_memory();
        let ledger = MigrationLedger::key_value("events", "id")
            .then(Migration::new(
                2,
                ["CREATE INDEX IF NOT EXISTS events_data ON events (data)"],
            ))
            .unwrap();
        let spec = TableSpec::new("events", "id").with_ledger(ledger);

        let table = backend.open(&spec).await.unwrap();
        table.bulk_put(vec![Row::new("a", "{}")]).await.unwrap();
        backend.release("events");

        // Same connection, already at target: rows survive, no error
        let table = backend.open(&spec).await.unwrap();
        assert_eq!(table.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_downgrade_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MigrationLedger::key_value("events", "id")
            .then(Migration::new(3, ["SELECT 1"]))
            .unwrap();

        let backend = SqliteBackend::open_dir(dir.path());
        backend
            .open(&TableSpec::new("events", "id").with_ledger(ledger))
            .await
            .unwrap();
        backend.close("events");

        let backend = SqliteBackend::open_dir(dir.path());
        let err = backend.open(&TableSpec::new("events", "id")).await.err().unwrap();
        assert!(matches!(err, StorageError::Migration { version: 3, .. }));

        // A failed open does not leave the name bound
        let err = backend.open(&TableSpec::new("events", "id")).await.err().unwrap();
        assert!(!err.is_already_initialized());
    }

    #[tokio::test]
    async fn test_failed_step_rolls_back() {
        let backend = SqliteBackend::in_memory();
        let ledger = MigrationLedger::key_value("events", "id")
            .then(Migration::new(2, ["THIS IS NOT SQL"]))
            .unwrap();
        let spec = TableSpec::new("events", "id").with_ledger(ledger);

        let err = backend.open(&spec).await.err().unwrap();
        assert!(matches!(err, StorageError::Migration { version: 2, .. }));

        // Version 1 table creation was rolled back with the failed step
        let table = backend.open(&TableSpec::new("events", "id")).await.unwrap();
        assert_eq!(table.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let backend = SqliteBackend::in_memory();
        let err = backend
            .open(&TableSpec::new("events; DROP", "id"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::UnknownTable(_)));
    }
}
