//! In-process presence backend. Default implementation; swap for
//! [`super::RedisPresenceStore`] behind the same trait for a multi-instance
//! deployment (spec.md §9 "externalize to a key-value store with TTL
//! primitives; no in-process singleton").

use super::{PresenceStore, PresenceTransition};
use crate::domain::UserId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::Duration;

struct Entry {
    connections: HashSet<String>,
    last_seen: DateTime<Utc>,
}

pub struct InMemoryPresenceStore {
    entries: DashMap<UserId, Entry>,
    ttl: Duration,
}

impl InMemoryPresenceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn is_fresh(&self, entry: &Entry) -> bool {
        Utc::now().signed_duration_since(entry.last_seen).to_std().unwrap_or(Duration::MAX) <= self.ttl
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn mark_online(&self, user: &UserId, connection_id: &str) -> PresenceTransition {
        let mut was_online = false;
        let became_online = {
            let mut entry = self.entries.entry(user.clone()).or_insert_with(|| Entry {
                connections: HashSet::new(),
                last_seen: Utc::now(),
            });
            was_online = !entry.connections.is_empty() && self.is_fresh(&entry);
            entry.connections.insert(connection_id.to_string());
            entry.last_seen = Utc::now();
            !was_online
        };
        if became_online {
            PresenceTransition::BecameOnline
        } else {
            PresenceTransition::None
        }
    }

    async fn mark_offline(&self, user: &UserId, connection_id: &str) -> PresenceTransition {
        let Some(mut entry) = self.entries.get_mut(user) else {
            return PresenceTransition::None;
        };
        entry.connections.remove(connection_id);
        if entry.connections.is_empty() {
            drop(entry);
            self.entries.remove(user);
            PresenceTransition::BecameOffline
        } else {
            PresenceTransition::None
        }
    }

    async fn is_online(&self, user: &UserId) -> bool {
        let Some(entry) = self.entries.get(user) else {
            return false;
        };
        if !entry.connections.is_empty() && self.is_fresh(&entry) {
            return true;
        }
        drop(entry);
        self.entries.remove(user);
        false
    }

    async fn last_seen(&self, user: &UserId) -> Option<DateTime<Utc>> {
        self.entries.get(user).map(|e| e.last_seen)
    }

    async fn online_users(&self) -> Vec<UserId> {
        let stale: Vec<UserId> = self
            .entries
            .iter()
            .filter(|e| !self.is_fresh(&e))
            .map(|e| e.key().clone())
            .collect();
        for user in &stale {
            self.entries.remove(user);
        }
        self.entries
            .iter()
            .filter(|e| !e.connections.is_empty())
            .map(|e| e.key().clone())
            .collect()
    }

    async fn connection_count(&self, user: &UserId) -> usize {
        self.entries.get(user).map(|e| e.connections.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId(id.to_string())
    }

    #[tokio::test]
    async fn single_connection_online_then_offline() {
        let store = InMemoryPresenceStore::new(Duration::from_secs(300));
        let u = user("u1");

        let t = store.mark_online(&u, "c1").await;
        assert_eq!(t, PresenceTransition::BecameOnline);
        assert!(store.is_online(&u).await);

        let t = store.mark_offline(&u, "c1").await;
        assert_eq!(t, PresenceTransition::BecameOffline);
        assert!(!store.is_online(&u).await);
    }

    #[tokio::test]
    async fn multi_tab_does_not_flicker() {
        let store = InMemoryPresenceStore::new(Duration::from_secs(300));
        let u = user("u1");

        assert_eq!(store.mark_online(&u, "c1").await, PresenceTransition::BecameOnline);
        assert_eq!(store.mark_online(&u, "c2").await, PresenceTransition::None);

        // Closing one of two connections produces no presence transition.
        assert_eq!(store.mark_offline(&u, "c1").await, PresenceTransition::None);
        assert!(store.is_online(&u).await);

        // Closing the last connection produces the offline transition.
        assert_eq!(store.mark_offline(&u, "c2").await, PresenceTransition::BecameOffline);
        assert!(!store.is_online(&u).await);
    }

    #[tokio::test]
    async fn ttl_expiry_without_disconnect() {
        let store = InMemoryPresenceStore::new(Duration::from_millis(20));
        let u = user("u1");
        store.mark_online(&u, "c1").await;
        assert!(store.is_online(&u).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!store.is_online(&u).await);
    }

    #[tokio::test]
    async fn connection_count_tracks_distinct_connections() {
        let store = InMemoryPresenceStore::new(Duration::from_secs(300));
        let u = user("u1");
        store.mark_online(&u, "c1").await;
        store.mark_online(&u, "c2").await;
        assert_eq!(store.connection_count(&u).await, 2);
    }
}
