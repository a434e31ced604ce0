//! Table store contract
//!
//! Every entity is mirrored into exactly one table of `(key, data)` rows,
//! where `data` is the record's JSON text. Services depend only on the
//! [`Backend`] and [`TableStore`] traits.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StorageError;
use crate::migration::MigrationLedger;

/// Raw persisted row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: String,
    pub data: String,
}

impl Row {
    pub fn new(key: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data: data.into(),
        }
    }

    /// Serialize a record into a row
    pub fn encode<T: Serialize>(key: impl Into<String>, value: &T) -> Result<Self, StorageError> {
        let data =
            serde_json::to_string(value).map_err(|e| StorageError::serialization(e.to_string()))?;
        Ok(Self::new(key, data))
    }

    /// Deserialize the row's record
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        serde_json::from_str(&self.data).map_err(|e| {
            StorageError::deserialization(format!("row {}: {}", self.key, e))
        })
    }
}

/// What a service asks a backend to open
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub key_path: String,
    pub ledger: MigrationLedger,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        let name = name.into();
        let key_path = key_path.into();
        let ledger = MigrationLedger::key_value(&name, &key_path);
        Self {
            name,
            key_path,
            ledger,
        }
    }

    pub fn with_ledger(mut self, ledger: MigrationLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn version(&self) -> u32 {
        self.ledger.target_version()
    }
}

/// Table and column names end up in SQL text, so only identifiers are allowed
pub(crate) fn validate_identifier(name: &str) -> Result<(), StorageError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::UnknownTable(name.to_string()))
    }
}

/// One open table
#[async_trait]
pub trait TableStore: Send + Sync {
    fn name(&self) -> &str;

    /// Every row, in key order
    async fn get_all(&self) -> Result<Vec<Row>, StorageError>;

    /// Upsert rows by key
    async fn bulk_put(&self, rows: Vec<Row>) -> Result<(), StorageError>;

    /// Delete rows by key. Missing keys are ignored.
    async fn bulk_delete(&self, keys: Vec<String>) -> Result<(), StorageError>;

    /// Delete every row
    async fn clear(&self) -> Result<(), StorageError>;

    /// Replace the whole table with `rows` in one commit. On failure the
    /// previous contents are left untouched.
    async fn replace_all(&self, rows: Vec<Row>) -> Result<(), StorageError>;

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.get_all().await?.len())
    }
}

/// Which concrete backend is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    Redb,
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::Redb => write!(f, "redb"),
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

/// Storage medium that opens tables
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Called once with every table the session declares, before any open
    async fn prepare(&self, _tables: &[TableSpec]) -> Result<(), StorageError> {
        Ok(())
    }

    /// Open a table at its ledger's target version.
    ///
    /// Fails with [`StorageError::AlreadyInitialized`] if the name is already
    /// bound to a live handle on this backend.
    async fn open(&self, spec: &TableSpec) -> Result<Arc<dyn TableStore>, StorageError>;

    /// Unbind a table name so it can be opened again
    fn release(&self, name: &str);
}

/// Run blocking storage work off the async executor
pub(crate) async fn blocking<F, T>(f: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
