//! Metadata records cached alongside events.

use serde::{Deserialize, Serialize};

use crate::collection::Keyed;

/// Relay information document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub supported_nips: Vec<u32>,
}

/// Connectivity counters for a relay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayStats {
    #[serde(default)]
    pub open_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub event_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_open: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<u64>,
}

/// Last-known metadata for one relay. Replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<RelayProfile>,
    #[serde(default)]
    pub stats: RelayStats,
}

impl RelayRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            profile: None,
            stats: RelayStats::default(),
        }
    }
}

impl Keyed for RelayRecord {
    fn key(&self) -> &str {
        &self.url
    }
}

/// Resolved `name@domain` handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleRecord {
    pub nip05: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub nip46: Vec<String>,
    pub fetched_at: u64,
}

impl Keyed for HandleRecord {
    fn key(&self) -> &str {
        &self.nip05
    }
}

/// Resolved lightning payment endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZapperRecord {
    pub lnurl: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    #[serde(default)]
    pub min_sendable: u64,
    #[serde(default)]
    pub max_sendable: u64,
    #[serde(default)]
    pub allows_nostr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nostr_pubkey: Option<String>,
    pub fetched_at: u64,
}

impl Keyed for ZapperRecord {
    fn key(&self) -> &str {
        &self.lnurl
    }
}
