//! Relay provenance tracker.
//!
//! Records which relays each event was seen on. Entries may outlive the
//! events they describe.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::feed::{ChangeFeed, Subscription};

/// Mutation emitted by the [`Tracker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerChange {
    Add { id: String, relay: String },
    Remove { id: String, relay: String },
    /// Contents were replaced wholesale
    Load,
    /// Contents were emptied
    Clear,
}

pub struct Tracker {
    relays: RwLock<HashMap<String, BTreeSet<String>>>,
    feed: ChangeFeed<TrackerChange>,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            relays: RwLock::new(HashMap::new()),
            feed: ChangeFeed::new(),
        }
    }

    pub fn subscribe(&self) -> Subscription<TrackerChange> {
        self.feed.subscribe()
    }

    /// Record that `id` was seen on `relay`. Returns false if already known.
    pub fn track(&self, id: &str, relay: &str) -> bool {
        let mut relays = self.relays.write();
        let added = relays
            .entry(id.to_string())
            .or_default()
            .insert(relay.to_string());
        if added {
            self.feed.emit(TrackerChange::Add {
                id: id.to_string(),
                relay: relay.to_string(),
            });
        }
        added
    }

    pub fn get_relays(&self, id: &str) -> BTreeSet<String> {
        self.relays.read().get(id).cloned().unwrap_or_default()
    }

    pub fn remove_relay(&self, id: &str, relay: &str) -> bool {
        let mut relays = self.relays.write();
        let Some(set) = relays.get_mut(id) else {
            return false;
        };
        if !set.remove(relay) {
            return false;
        }
        if set.is_empty() {
            relays.remove(id);
        }
        self.feed.emit(TrackerChange::Remove {
            id: id.to_string(),
            relay: relay.to_string(),
        });
        true
    }

    /// Forget every relay recorded for `id`
    pub fn remove(&self, id: &str) {
        let mut relays = self.relays.write();
        if let Some(set) = relays.remove(id) {
            for relay in set {
                self.feed.emit(TrackerChange::Remove {
                    id: id.to_string(),
                    relay,
                });
            }
        }
    }

    /// Replace all contents
    pub fn load(&self, map: HashMap<String, BTreeSet<String>>) {
        let mut relays = self.relays.write();
        *relays = map.into_iter().filter(|(_, set)| !set.is_empty()).collect();
        self.feed.emit(TrackerChange::Load);
    }

    pub fn clear(&self) {
        let mut relays = self.relays.write();
        relays.clear();
        self.feed.emit(TrackerChange::Clear);
    }

    pub fn dump(&self) -> HashMap<String, BTreeSet<String>> {
        self.relays.read().clone()
    }

    pub fn len(&self) -> usize {
        self.relays.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}
