//! Error types for roost-storage

use thiserror::Error;

/// Errors that can occur in table store operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// A table handle was opened twice on the same backend
    #[error("Table already initialized: {name}")]
    AlreadyInitialized { name: String },

    /// Table name is not a valid identifier
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Backend could not be opened for a table
    #[error("Failed to open {name}: {cause}")]
    Open { name: String, cause: String },

    /// A migration step failed
    #[error("Migration of {name} to version {version} failed: {cause}")]
    Migration {
        name: String,
        version: u32,
        cause: String,
    },

    /// Migration ledger is empty or out of order
    #[error("Invalid migration ledger: {0}")]
    InvalidLedger(String),

    /// Database engine error
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error during storage operations
    #[error("I/O error: {0}")]
    Io(String),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Blocking task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(String),
}

impl StorageError {
    /// Create a new AlreadyInitialized error
    pub fn already_initialized(name: impl Into<String>) -> Self {
        Self::AlreadyInitialized { name: name.into() }
    }

    /// Create a new Open error
    pub fn open(name: impl Into<String>, cause: impl ToString) -> Self {
        Self::Open {
            name: name.into(),
            cause: cause.to_string(),
        }
    }

    /// Create a new Database error
    pub fn database(message: impl ToString) -> Self {
        Self::Database(message.to_string())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new Deserialization error
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization(message.into())
    }

    /// Whether this error comes from opening a table twice
    pub fn is_already_initialized(&self) -> bool {
        matches!(self, Self::AlreadyInitialized { .. })
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_initialized_names_table() {
        let err = StorageError::already_initialized("events");
        assert!(err.is_already_initialized());
        assert!(err.to_string().contains("events"));
    }

    #[test]
    fn test_open_error_carries_cause() {
        let err = StorageError::open("tracker", "permission denied");
        assert!(!err.is_already_initialized());
        let message = err.to_string();
        assert!(message.contains("tracker"));
        assert!(message.contains("permission denied"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
    }
}
