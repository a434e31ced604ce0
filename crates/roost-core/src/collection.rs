//! Keyed record collections.
//!
//! A [`Collection`] can be observed two ways: as a stream of discrete
//! [`CollectionChange`]s, or as a whole value through [`Collection::watch`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::feed::{ChangeFeed, Subscription};

/// A record with a natural primary key
pub trait Keyed: Clone + Send + Sync + 'static {
    fn key(&self) -> &str;
}

/// Mutation emitted by a [`Collection`]
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionChange<T> {
    Put(Vec<T>),
    Remove(Vec<String>),
    Load,
    Clear,
}

pub type Snapshot<T> = Arc<BTreeMap<String, T>>;

pub struct Collection<T: Keyed> {
    state: watch::Sender<Snapshot<T>>,
    feed: ChangeFeed<CollectionChange<T>>,
}

impl<T: Keyed> Collection<T> {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Arc::new(BTreeMap::new()));
        Self {
            state,
            feed: ChangeFeed::new(),
        }
    }

    pub fn subscribe(&self) -> Subscription<CollectionChange<T>> {
        self.feed.subscribe()
    }

    /// Observe the whole collection
    pub fn watch(&self) -> watch::Receiver<Snapshot<T>> {
        self.state.subscribe()
    }

    pub fn put(&self, record: T) {
        self.put_many(vec![record]);
    }

    /// Upsert records, replacing any existing record with the same key
    pub fn put_many(&self, records: Vec<T>) {
        if records.is_empty() {
            return;
        }
        self.state.send_modify(|map| {
            let map = Arc::make_mut(map);
            for record in &records {
                map.insert(record.key().to_string(), record.clone());
            }
        });
        self.feed.emit(CollectionChange::Put(records));
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        let mut removed = None;
        self.state.send_if_modified(|map| {
            if !map.contains_key(key) {
                return false;
            }
            removed = Arc::make_mut(map).remove(key);
            true
        });
        if removed.is_some() {
            self.feed.emit(CollectionChange::Remove(vec![key.to_string()]));
        }
        removed
    }

    /// Replace all contents
    pub fn load(&self, records: Vec<T>) {
        let map = records
            .into_iter()
            .map(|record| (record.key().to_string(), record))
            .collect();
        self.state.send_replace(Arc::new(map));
        self.feed.emit(CollectionChange::Load);
    }

    pub fn clear(&self) {
        self.state.send_replace(Arc::new(BTreeMap::new()));
        self.feed.emit(CollectionChange::Clear);
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.state.borrow().get(key).cloned()
    }

    pub fn values(&self) -> Vec<T> {
        self.state.borrow().values().cloned().collect()
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        self.state.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Keyed> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        key: String,
        value: u32,
    }

    impl Keyed for Item {
        fn key(&self) -> &str {
            &self.key
        }
    }

    fn item(key: &str, value: u32) -> Item {
        Item {
            key: key.to_string(),
            value,
        }
    }

    #[test]
    fn test_put_replaces_by_key() {
        let collection = Collection::new();
        collection.put(item("a", 1));
        collection.put(item("a", 2));

        assert_eq!(collection.len(), 1);
        assert_eq!(collection.get("a").unwrap().value, 2);
    }

    #[test]
    fn test_change_feed() {
        let collection = Collection::new();
        let mut changes = collection.subscribe();

        collection.put_many(vec![item("a", 1), item("b", 2)]);
        collection.remove("a");
        collection.remove("missing");
        collection.load(vec![item("c", 3)]);
        collection.clear();

        assert!(matches!(changes.try_recv(), Some(CollectionChange::Put(v)) if v.len() == 2));
        assert_eq!(
            changes.try_recv(),
            Some(CollectionChange::Remove(vec!["a".to_string()]))
        );
        assert_eq!(changes.try_recv(), Some(CollectionChange::Load));
        assert_eq!(changes.try_recv(), Some(CollectionChange::Clear));
        assert!(changes.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_watch_sees_latest() {
        let collection = Collection::new();
        let mut rx = collection.watch();

        collection.put(item("a", 1));
        collection.put(item("b", 2));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 2);
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let collection = Collection::new();
        collection.put(item("a", 1));
        let before = collection.snapshot();
        collection.put(item("b", 2));

        assert_eq!(before.len(), 1);
        assert_eq!(collection.snapshot().len(), 2);
    }
}
