//! Distributed liveness map shared by all gateway instances (spec.md §4.4).

mod memory;
#[cfg(feature = "redis-presence")]
mod redis_backed;

pub use memory::InMemoryPresenceStore;
#[cfg(feature = "redis-presence")]
pub use redis_backed::RedisPresenceStore;

use crate::domain::UserId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A distributed, TTL-backed liveness map.
///
/// Failure model: if the backing store is unavailable, callers must still
/// accept connections and send messages; presence APIs should return
/// conservative answers (`false` / `None` / `[]`) rather than propagate the
/// error, since presence is a UX signal, not a security gate.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn mark_online(&self, user: &UserId, connection_id: &str) -> PresenceTransition;
    async fn mark_offline(&self, user: &UserId, connection_id: &str) -> PresenceTransition;
    async fn is_online(&self, user: &UserId) -> bool;
    async fn last_seen(&self, user: &UserId) -> Option<DateTime<Utc>>;
    async fn online_users(&self) -> Vec<UserId>;
    async fn connection_count(&self, user: &UserId) -> usize;
}

/// Outcome of a `mark_online`/`mark_offline` call, used by the gateway to
/// decide whether a `UserPresenceChanged` event should be broadcast — only
/// on a zero-crossing of the connection count (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    None,
    BecameOnline,
    BecameOffline,
}
