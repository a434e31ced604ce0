//! Migration ledger
//!
//! An ordered, forward-only list of schema steps. Each step carries the
//! schema version it produces; the last step's version is the version a
//! table is opened at.
//!
//! ```json
//! [
//!   {"toVersion": 1, "statements": ["CREATE TABLE IF NOT EXISTS events (id TEXT PRIMARY KEY, data TEXT NOT NULL)"]}
//! ]
//! ```

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// One schema step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migration {
    pub to_version: u32,
    pub statements: Vec<String>,
}

impl Migration {
    pub fn new<S: Into<String>>(to_version: u32, statements: impl IntoIterator<Item = S>) -> Self {
        Self {
            to_version,
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }
}

/// Validated migration ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MigrationLedger {
    steps: Vec<Migration>,
}

impl MigrationLedger {
    /// Build a ledger, rejecting empty or non-increasing step lists
    pub fn new(steps: Vec<Migration>) -> Result<Self, StorageError> {
        if steps.is_empty() {
            return Err(StorageError::InvalidLedger("ledger has no steps".into()));
        }

        let mut previous = 0;
        for step in &steps {
            if step.to_version <= previous {
                return Err(StorageError::InvalidLedger(format!(
                    "version {} follows version {}",
                    step.to_version, previous
                )));
            }
            previous = step.to_version;
        }

        Ok(Self { steps })
    }

    /// Parse a ledger from its JSON form
    pub fn from_json(json: &str) -> Result<Self, StorageError> {
        let steps: Vec<Migration> = serde_json::from_str(json)
            .map_err(|e| StorageError::InvalidLedger(e.to_string()))?;
        Self::new(steps)
    }

    /// Single-step ledger for a `(key PRIMARY KEY, data JSON)` table
    pub fn key_value(table: &str, key: &str) -> Self {
        Self {
            steps: vec![Migration::new(
                1,
                [format!(
                    "CREATE TABLE IF NOT EXISTS {table} ({key} TEXT PRIMARY KEY, data TEXT NOT NULL)"
                )],
            )],
        }
    }

    /// Version a table is opened at
    pub fn target_version(&self) -> u32 {
        self.steps.last().map(|step| step.to_version).unwrap_or(0)
    }

    /// Steps still to apply to a database currently at `current`
    pub fn pending(&self, current: u32) -> impl Iterator<Item = &Migration> {
        self.steps.iter().filter(move |step| step.to_version > current)
    }

    pub fn steps(&self) -> &[Migration] {
        &self.steps
    }

    /// Append a step. It must move the version forward.
    pub fn then(mut self, step: Migration) -> Result<Self, StorageError> {
        self.steps.push(step);
        Self::new(self.steps)
    }
}
