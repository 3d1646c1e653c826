use std::collections::HashMap;

use crate::database_ops::sink::{GameVariantKey, IdentitySnapshot};

/// Outcome of recording a (provider, item) link in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Inserted,
    AlreadyLinked,
    /// The item already points at another title; the existing link is kept.
    Conflict { existing: i64 },
}

/// In-run name/item -> title maps, seeded once from a bulk read and owned by
/// one worker.
#[derive(Debug, Default, Clone)]
pub struct IdentityCache {
    titles_by_key: HashMap<String, i64>,
    titles_by_item: HashMap<GameVariantKey, i64>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: IdentitySnapshot) -> Self {
        Self {
            titles_by_key: snapshot.titles_by_key,
            titles_by_item: snapshot.titles_by_item,
        }
    }

    pub fn title_for_item(&self, provider: &str, item_id: &str) -> Option<i64> {
        self.titles_by_item
            .get(&(provider.to_string(), item_id.to_string()))
            .copied()
    }

    pub fn title_for_key(&self, key: &str) -> Option<i64> {
        self.titles_by_key.get(key).copied()
    }

    pub fn remember_key(&mut self, key: &str, title_id: i64) {
        self.titles_by_key.insert(key.to_string(), title_id);
    }

    pub fn remember_item(&mut self, provider: &str, item_id: &str, title_id: i64) -> LinkOutcome {
        let key = (provider.to_string(), item_id.to_string());
        match self.titles_by_item.get(&key) {
            Some(existing) if *existing == title_id => LinkOutcome::AlreadyLinked,
            Some(existing) => LinkOutcome::Conflict {
                existing: *existing,
            },
            None => {
                self.titles_by_item.insert(key, title_id);
                LinkOutcome::Inserted
            }
        }
    }

    pub fn len_keys(&self) -> usize {
        self.titles_by_key.len()
    }

    pub fn len_items(&self) -> usize {
        self.titles_by_item.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_link_wins() {
        let mut cache = IdentityCache::new();
        assert_eq!(cache.remember_item("b", "7", 1), LinkOutcome::Inserted);
        assert_eq!(cache.remember_item("b", "7", 1), LinkOutcome::AlreadyLinked);
        assert_eq!(
            cache.remember_item("b", "7", 2),
            LinkOutcome::Conflict { existing: 1 }
        );
        assert_eq!(cache.title_for_item("b", "7"), Some(1));
    }

    #[test]
    fn seeded_from_snapshot() {
        let mut snapshot = IdentitySnapshot::default();
        snapshot.titles_by_key.insert("foo".into(), 10);
        snapshot
            .titles_by_item
            .insert(("x".into(), "1".into()), 10);
        let cache = IdentityCache::from_snapshot(snapshot);
        assert_eq!(cache.title_for_key("foo"), Some(10));
        assert_eq!(cache.title_for_item("x", "1"), Some(10));
        assert_eq!(cache.title_for_item("x", "2"), None);
        assert_eq!((cache.len_keys(), cache.len_items()), (1, 1));
    }
}
