//! Error types for roost-sync

use thiserror::Error;

use roost_storage::StorageError;

/// Errors that can occur while loading or syncing cached state
#[derive(Debug, Error)]
pub enum SyncError {
    /// Table store error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A service failed during the startup barrier
    #[error("Startup of {service} failed: {source}")]
    Startup {
        service: String,
        #[source]
        source: Box<SyncError>,
    },

    /// `sync` or `initialize_state` called before `initialize_database`
    #[error("Service not initialized: {0}")]
    NotInitialized(String),

    /// Background task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(String),

    /// One or more services failed to reset
    #[error("Reset failed for: {}", .0.join(", "))]
    Reset(Vec<String>),
}

impl SyncError {
    pub fn startup(service: impl Into<String>, source: SyncError) -> Self {
        Self::Startup {
            service: service.into(),
            source: Box::new(source),
        }
    }

    /// Name of the service that failed startup, if this is a startup error
    pub fn failed_service(&self) -> Option<&str> {
        match self {
            Self::Startup { service, .. } => Some(service),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Task(e.to_string())
    }
}

/// Result type alias for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_carries_service_and_cause() {
        let err = SyncError::startup(
            "events",
            StorageError::already_initialized("events").into(),
        );
        assert_eq!(err.failed_service(), Some("events"));

        let message = err.to_string();
        assert!(message.contains("events"));
        assert!(message.contains("already initialized"));
    }

    #[test]
    fn test_reset_lists_services() {
        let err = SyncError::Reset(vec!["events".into(), "tracker".into()]);
        assert_eq!(err.to_string(), "Reset failed for: events, tracker");
    }
}
