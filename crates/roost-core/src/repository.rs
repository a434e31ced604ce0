//! In-memory event repository.
//!
//! Holds the deduplicated event set for a session and emits a
//! [`RepositoryUpdate`] for every mutation. Replaceable events are
//! superseded by newer versions at the same address.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::trace;

use crate::event::Event;
use crate::feed::{ChangeFeed, Subscription};

/// Delta emitted on every repository mutation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepositoryUpdate {
    pub added: Vec<Event>,
    pub removed: HashSet<String>,
}

impl RepositoryUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Query over the repository
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub ids: Option<HashSet<String>>,
    pub kinds: Option<HashSet<u32>>,
    pub authors: Option<HashSet<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors<S: Into<String>>(mut self, authors: impl IntoIterator<Item = S>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` satisfies every set constraint
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids
            && !ids.contains(&event.id)
        {
            return false;
        }
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }
        if let Some(authors) = &self.authors
            && !authors.contains(&event.pubkey)
        {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        true
    }
}

#[derive(Default)]
struct State {
    events: HashMap<String, Event>,
    /// Replaceable address -> current event id
    by_address: HashMap<String, String>,
}

impl State {
    fn insert(&mut self, event: Event, update: &mut RepositoryUpdate) -> bool {
        if self.events.contains_key(&event.id) {
            return false;
        }

        if let Some(address) = event.address() {
            if let Some(current_id) = self.by_address.get(&address).cloned()
                && let Some(current) = self.events.get(&current_id)
            {
                if current.created_at >= event.created_at {
                    return false;
                }
                self.events.remove(&current_id);
                update.added.retain(|e| e.id != current_id);
                update.removed.insert(current_id);
            }
            self.by_address.insert(address, event.id.clone());
        }

        update.removed.remove(&event.id);
        self.events.insert(event.id.clone(), event.clone());
        update.added.push(event);
        true
    }

    fn remove(&mut self, id: &str) -> Option<Event> {
        let event = self.events.remove(id)?;
        if let Some(address) = event.address()
            && self.by_address.get(&address).map(String::as_str) == Some(id)
        {
            self.by_address.remove(&address);
        }
        Some(event)
    }
}

/// Explicitly constructed in-memory event store
pub struct Repository {
    state: RwLock<State>,
    feed: ChangeFeed<RepositoryUpdate>,
}

impl Repository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            feed: ChangeFeed::new(),
        }
    }

    /// Listen for `{added, removed}` deltas
    pub fn subscribe(&self) -> Subscription<RepositoryUpdate> {
        self.feed.subscribe()
    }

    /// Add an event. Returns false for duplicates and stale replaceables.
    pub fn publish(&self, event: Event) -> bool {
        let mut state = self.state.write();
        let mut update = RepositoryUpdate::default();
        let inserted = state.insert(event, &mut update);
        if inserted {
            self.feed.emit(update);
        }
        inserted
    }

    /// Bulk-add events, emitting a single update
    pub fn load(&self, events: Vec<Event>) {
        let mut state = self.state.write();
        let mut update = RepositoryUpdate::default();
        for event in events {
            state.insert(event, &mut update);
        }
        trace!(
            added = update.added.len(),
            removed = update.removed.len(),
            "repository load"
        );
        if !update.is_empty() {
            self.feed.emit(update);
        }
    }

    /// Remove an event by id
    pub fn remove(&self, id: &str) -> Option<Event> {
        let mut state = self.state.write();
        let event = state.remove(id)?;
        self.feed.emit(RepositoryUpdate {
            added: Vec::new(),
            removed: HashSet::from([id.to_string()]),
        });
        Some(event)
    }

    /// Remove every event
    pub fn clear(&self) {
        let mut state = self.state.write();
        if state.events.is_empty() {
            return;
        }
        let removed = state.events.keys().cloned().collect();
        *state = State::default();
        self.feed.emit(RepositoryUpdate {
            added: Vec::new(),
            removed,
        });
    }

    pub fn get(&self, id: &str) -> Option<Event> {
        self.state.read().events.get(id).cloned()
    }

    /// Matching events, newest first
    pub fn query(&self, filter: &Filter) -> Vec<Event> {
        let state = self.state.read();
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        events
    }

    /// Every event, in no particular order
    pub fn dump(&self) -> Vec<Event> {
        self.state.read().events.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds;

    fn id(n: u32) -> String {
        format!("{n:064x}")
    }

    #[tokio::test]
    async fn test_publish_emits_update() {
        let repository = Repository::new();
        let mut updates = repository.subscribe();

        assert!(repository.publish(Event::new(id(1), "alice", kinds::MESSAGE, 10)));
        let update = updates.recv().await.unwrap();
        assert_eq!(update.added.len(), 1);
        assert!(update.removed.is_empty());
    }

    #[test]
    fn test_duplicate_publish_is_noop() {
        let repository = Repository::new();
        let mut updates = repository.subscribe();

        let event = Event::new(id(1), "alice", kinds::MESSAGE, 10);
        assert!(repository.publish(event.clone()));
        assert!(!repository.publish(event));

        assert!(updates.try_recv().is_some());
        assert!(updates.try_recv().is_none());
        assert_eq!(repository.len(), 1);
    }

    #[test]
    fn test_replaceable_supersedes_older() {
        let repository = Repository::new();
        let mut updates = repository.subscribe();

        repository.publish(Event::new(id(1), "alice", kinds::PROFILE, 10));
        repository.publish(Event::new(id(2), "alice", kinds::PROFILE, 20));

        let _ = updates.try_recv();
        let update = updates.try_recv().unwrap();
        assert_eq!(update.added[0].id, id(2));
        assert!(update.removed.contains(&id(1)));
        assert!(repository.get(&id(1)).is_none());

        // Older version arriving late is ignored
        assert!(!repository.publish(Event::new(id(3), "alice", kinds::PROFILE, 5)));
    }

    #[test]
    fn test_parameterized_replaceable_keyed_by_d_tag() {
        let repository = Repository::new();
        repository.publish(Event::new(id(1), "alice", kinds::APP_DATA, 10).with_tag(["d", "a"]));
        repository.publish(Event::new(id(2), "alice", kinds::APP_DATA, 20).with_tag(["d", "b"]));
        assert_eq!(repository.len(), 2);

        repository.publish(Event::new(id(3), "alice", kinds::APP_DATA, 30).with_tag(["d", "a"]));
        assert_eq!(repository.len(), 2);
        assert!(repository.get(&id(1)).is_none());
    }

    #[test]
    fn test_load_collapses_superseded_within_batch() {
        let repository = Repository::new();
        let mut updates = repository.subscribe();

        repository.load(vec![
            Event::new(id(1), "alice", kinds::FOLLOWS, 10),
            Event::new(id(2), "alice", kinds::FOLLOWS, 20),
            Event::new(id(3), "bob", kinds::MESSAGE, 20),
        ]);

        let update = updates.try_recv().unwrap();
        let added: HashSet<_> = update.added.iter().map(|e| e.id.clone()).collect();
        assert_eq!(added, HashSet::from([id(2), id(3)]));
        assert!(update.removed.contains(&id(1)));
    }

    #[test]
    fn test_query_filters_and_orders() {
        let repository = Repository::new();
        for n in 0..5 {
            repository.publish(Event::new(id(n), "alice", kinds::MESSAGE, 100 + n as u64));
        }
        repository.publish(Event::new(id(9), "bob", kinds::THREAD, 500));

        let events = repository.query(&Filter::new().kinds([kinds::MESSAGE]).since(101).limit(2));
        let ids: Vec<_> = events.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![id(4), id(3)]);

        let bob = repository.query(&Filter::new().authors(["bob"]));
        assert_eq!(bob.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let repository = Repository::new();
        let mut updates = repository.subscribe();
        repository.publish(Event::new(id(1), "alice", kinds::MESSAGE, 1));
        repository.publish(Event::new(id(2), "alice", kinds::MESSAGE, 2));

        assert!(repository.remove(&id(1)).is_some());
        assert!(repository.remove(&id(1)).is_none());
        repository.clear();

        let mut last = None;
        while let Some(update) = updates.try_recv() {
            last = Some(update);
        }
        assert_eq!(last.unwrap().removed, HashSet::from([id(2)]));
        assert!(repository.is_empty());
    }
}
