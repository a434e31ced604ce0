//! Session-owned cache structures
//!
//! A [`Session`] is created at login and dropped at logout. It owns every
//! in-memory structure the cache mirrors; nothing here is process-global.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use roost_core::{
    Collection, HandleRecord, RelayRecord, Repository, Store, Tracker, ZapperRecord,
};

use crate::config::SyncConfig;
use crate::retention::RetentionPolicy;
use crate::services::{
    CollectionService, DatabaseService, EventsService, KeyValueService, SyncMode, TrackerService,
};

/// Every in-memory structure of one session
#[derive(Default)]
pub struct Session {
    pub repository: Arc<Repository>,
    pub tracker: Arc<Tracker>,
    pub relays: Arc<Collection<RelayRecord>>,
    pub handles: Arc<Collection<HandleRecord>>,
    pub zappers: Arc<Collection<ZapperRecord>>,
    /// Cache key -> unix seconds of last refresh
    pub freshness: Arc<Store<BTreeMap<String, i64>>>,
    /// Cache key -> decrypted payload
    pub plaintext: Arc<Store<BTreeMap<String, String>>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the database services mirroring this session's structures
    pub fn services(&self, config: &SyncConfig) -> Services {
        Services {
            events: Arc::new(EventsService::new(
                self.repository.clone(),
                RetentionPolicy::new(config.events_limit),
                config.events_batch(),
            )),
            tracker: Arc::new(TrackerService::new(
                self.tracker.clone(),
                config.tracker_batch(),
            )),
            relays: Arc::new(CollectionService::new(
                "relays",
                "url",
                self.relays.clone(),
                SyncMode::Throttled(config.relays_throttle()),
            )),
            handles: Arc::new(CollectionService::new(
                "handles",
                "nip05",
                self.handles.clone(),
                SyncMode::Batched(config.handles_batch()),
            )),
            zappers: Arc::new(CollectionService::new(
                "zappers",
                "lnurl",
                self.zappers.clone(),
                SyncMode::Batched(config.zappers_batch()),
            )),
            freshness: Arc::new(KeyValueService::new(
                "freshness",
                self.freshness.clone(),
                config.freshness_interval(),
            )),
            plaintext: Arc::new(KeyValueService::new(
                "plaintext",
                self.plaintext.clone(),
                config.plaintext_interval(),
            )),
        }
    }

    /// Record that `key` was refreshed now
    pub fn mark_fresh(&self, key: impl Into<String>) {
        let now = Utc::now().timestamp();
        self.freshness.update(|map| {
            map.insert(key.into(), now);
        });
    }

    /// Whether `key` was never refreshed or was refreshed longer than
    /// `max_age` ago
    pub fn is_stale(&self, key: &str, max_age: Duration) -> bool {
        let Some(refreshed) = self.freshness.get().get(key).copied() else {
            return true;
        };
        let age = Utc::now().timestamp().saturating_sub(refreshed);
        age < 0 || age as u64 >= max_age.as_secs()
    }

    pub fn set_plaintext(&self, key: impl Into<String>, value: impl Into<String>) {
        self.plaintext.update(|map| {
            map.insert(key.into(), value.into());
        });
    }

    pub fn get_plaintext(&self, key: &str) -> Option<String> {
        self.plaintext.get().get(key).cloned()
    }
}

/// The services of one session, typed
#[derive(Clone)]
pub struct Services {
    pub events: Arc<EventsService>,
    pub tracker: Arc<TrackerService>,
    pub relays: Arc<CollectionService<RelayRecord>>,
    pub handles: Arc<CollectionService<HandleRecord>>,
    pub zappers: Arc<CollectionService<ZapperRecord>>,
    pub freshness: Arc<KeyValueService<i64>>,
    pub plaintext: Arc<KeyValueService<String>>,
}

impl Services {
    pub fn all(&self) -> Vec<Arc<dyn DatabaseService>> {
        vec![
            self.events.clone() as Arc<dyn DatabaseService>,
            self.tracker.clone(),
            self.relays.clone(),
            self.handles.clone(),
            self.zappers.clone(),
            self.freshness.clone(),
            self.plaintext.clone(),
        ]
    }
}
