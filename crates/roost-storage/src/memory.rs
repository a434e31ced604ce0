//! In-memory table backend
//!
//! Volatile tables for tests and ephemeral sessions. Each table counts the
//! write calls it receives and can be told to fail writes or delay reads,
//! which is how batching and eviction behaviour is observed in tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};

use crate::error::StorageError;
use crate::table::{Backend, BackendKind, Row, TableSpec, TableStore, validate_identifier};

/// Volatile backend. Table contents survive release and reopen.
#[derive(Default)]
pub struct InMemoryBackend {
    tables: DashMap<String, Arc<InMemoryTable>>,
    bound: DashSet<String>,
    fail_opens: DashSet<String>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table by name, creating it if needed. Does not bind the name.
    pub fn table(&self, name: &str) -> Arc<InMemoryTable> {
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryTable::new(name)))
            .value()
            .clone()
    }

    /// Make the next opens of `name` fail with an I/O error
    pub fn fail_open(&self, name: &str) {
        self.fail_opens.insert(name.to_string());
    }

    /// Undo [`fail_open`](Self::fail_open)
    pub fn allow_open(&self, name: &str) {
        self.fail_opens.remove(name);
    }

    /// Whether `name` is currently bound to a live handle
    pub fn is_bound(&self, name: &str) -> bool {
        self.bound.contains(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn open(&self, spec: &TableSpec) -> Result<Arc<dyn TableStore>, StorageError> {
        validate_identifier(&spec.name)?;
        if self.fail_opens.contains(&spec.name) {
            return Err(StorageError::open(&spec.name, "simulated open failure"));
        }
        if !self.bound.insert(spec.name.clone()) {
            return Err(StorageError::already_initialized(&spec.name));
        }
        Ok(self.table(&spec.name))
    }

    fn release(&self, name: &str) {
        self.bound.remove(name);
    }
}

/// Volatile table with call counters
pub struct InMemoryTable {
    name: String,
    rows: RwLock<BTreeMap<String, String>>,
    put_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    fail_writes: AtomicBool,
    fail_puts: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
}

impl InMemoryTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
            put_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            fail_puts: AtomicBool::new(false),
            read_delay: Mutex::new(None),
        }
    }

    /// Number of non-empty `bulk_put` calls received
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Number of non-empty `bulk_delete` calls received
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail only writes that insert rows (`bulk_put`, `replace_all`)
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Delay every `get_all` by `delay`
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock() = delay;
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rows.read().contains_key(key)
    }

    /// Insert rows directly, bypassing counters
    pub fn seed(&self, rows: impl IntoIterator<Item = Row>) {
        let mut map = self.rows.write();
        for row in rows {
            map.insert(row.key, row.data);
        }
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(format!("{}: simulated write failure", self.name)));
        }
        Ok(())
    }

    fn check_puttable(&self) -> Result<(), StorageError> {
        self.check_writable()?;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Io(format!("{}: simulated put failure", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl TableStore for InMemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_all(&self) -> Result<Vec<Row>, StorageError> {
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .rows
            .read()
            .iter()
            .map(|(key, data)| Row::new(key.clone(), data.clone()))
            .collect())
    }

    async fn bulk_put(&self, rows: Vec<Row>) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.check_puttable()?;
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let mut map = self.rows.write();
        for row in rows {
            map.insert(row.key, row.data);
        }
        Ok(())
    }

    async fn bulk_delete(&self, keys: Vec<String>) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.check_writable()?;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut map = self.rows.write();
        for key in &keys {
            map.remove(key);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.check_writable()?;
        self.rows.write().clear();
        Ok(())
    }

    async fn replace_all(&self, rows: Vec<Row>) -> Result<(), StorageError> {
        self.check_puttable()?;
        let replacement: BTreeMap<String, String> =
            rows.into_iter().map(|row| (row.key, row.data)).collect();
        *self.rows.write() = replacement;
        Ok(())
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_skip_empty_calls() {
        let backend = InMemoryBackend::new();
        let table = backend.open(&TableSpec::new("events", "id")).await.unwrap();

        table.bulk_put(vec![]).await.unwrap();
        table.bulk_delete(vec![]).await.unwrap();
        table
            .bulk_put(vec![Row::new("a", "1"), Row::new("b", "2")])
            .await
            .unwrap();
        table.bulk_delete(vec!["a".into()]).await.unwrap();

        let inner = backend.table("events");
        assert_eq!(inner.put_calls(), 1);
        assert_eq!(inner.delete_calls(), 1);
        assert_eq!(inner.len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_leaves_rows_untouched() {
        let backend = InMemoryBackend::new();
        let table = backend.open(&TableSpec::new("events", "id")).await.unwrap();
        table.bulk_put(vec![Row::new("a", "1")]).await.unwrap();

        backend.table("events").set_fail_writes(true);
        assert!(table.bulk_delete(vec!["a".into()]).await.is_err());
        assert!(table.clear().await.is_err());
        assert_eq!(table.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_put_failure_keeps_replaced_rows() {
        let backend = InMemoryBackend::new();
        let table = backend.open(&TableSpec::new("events", "id")).await.unwrap();
        table
            .bulk_put(vec![Row::new("a", "1"), Row::new("b", "2")])
            .await
            .unwrap();

        backend.table("events").set_fail_puts(true);
        assert!(table.replace_all(vec![Row::new("c", "3")]).await.is_err());
        assert!(table.bulk_put(vec![Row::new("c", "3")]).await.is_err());
        assert_eq!(table.count().await.unwrap(), 2);

        // Deletes are unaffected
        table.bulk_delete(vec!["a".into()]).await.unwrap();
        assert_eq!(table.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_simulated_open_failure() {
        let backend = InMemoryBackend::new();
        backend.fail_open("events");
        let err = backend.open(&TableSpec::new("events", "id")).await.err().unwrap();
        assert!(matches!(err, StorageError::Open { .. }));
        assert!(!backend.is_bound("events"));

        backend.allow_open("events");
        backend.open(&TableSpec::new("events", "id")).await.unwrap();
        assert!(backend.is_bound("events"));
    }
}
