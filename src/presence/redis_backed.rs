//! Redis-backed presence store for the distributed deployment (spec.md §4.4,
//! §9 redesign flag: "externalize to a key-value store; no in-process
//! singleton"). Feature-gated behind `redis-presence` since the default
//! deployment can run entirely in-process.

use super::{PresenceStore, PresenceTransition};
use crate::domain::UserId;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

pub struct RedisPresenceStore {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisPresenceStore {
    pub async fn connect(url: &str, ttl: Duration) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, ttl })
    }

    fn connections_key(user: &UserId) -> String {
        format!("presence:{}:connections", user.0)
    }

    fn last_seen_key(user: &UserId) -> String {
        format!("presence:{}:last_seen", user.0)
    }

    fn online_index_key() -> &'static str {
        "presence:online"
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn mark_online(&self, user: &UserId, connection_id: &str) -> PresenceTransition {
        let mut conn = self.conn.clone();
        let ttl_secs = self.ttl.as_secs() as i64;
        let was_online: bool = conn
            .zscore::<_, _, Option<f64>>(Self::online_index_key(), &user.0)
            .await
            .ok()
            .flatten()
            .is_some();

        let _: redis::RedisResult<()> = async {
            let conn_key = Self::connections_key(user);
            conn.sadd::<_, _, ()>(&conn_key, connection_id).await?;
            conn.expire::<_, ()>(&conn_key, ttl_secs).await?;
            conn.set_ex::<_, _, ()>(Self::last_seen_key(user), Utc::now().timestamp(), ttl_secs as u64)
                .await?;
            conn.zadd::<_, _, _, ()>(Self::online_index_key(), &user.0, Utc::now().timestamp())
                .await?;
            Ok(())
        }
        .await;

        if was_online {
            PresenceTransition::None
        } else {
            PresenceTransition::BecameOnline
        }
    }

    async fn mark_offline(&self, user: &UserId, connection_id: &str) -> PresenceTransition {
        let mut conn = self.conn.clone();
        let conn_key = Self::connections_key(user);
        let _: redis::RedisResult<()> = conn.srem(&conn_key, connection_id).await;
        let remaining: usize = conn.scard(&conn_key).await.unwrap_or(0);
        if remaining == 0 {
            let _: redis::RedisResult<()> = conn.zrem(Self::online_index_key(), &user.0).await;
            PresenceTransition::BecameOffline
        } else {
            PresenceTransition::None
        }
    }

    async fn is_online(&self, user: &UserId) -> bool {
        let mut conn = self.conn.clone();
        let ttl_secs = self.ttl.as_secs() as i64;
        let cutoff = Utc::now().timestamp() - ttl_secs;
        let _: redis::RedisResult<u64> =
            conn.zrembyscore(Self::online_index_key(), 0, cutoff).await;
        conn.zscore::<_, _, Option<f64>>(Self::online_index_key(), &user.0)
            .await
            .ok()
            .flatten()
            .is_some()
    }

    async fn last_seen(&self, user: &UserId) -> Option<DateTime<Utc>> {
        let mut conn = self.conn.clone();
        let ts: Option<i64> = conn.get(Self::last_seen_key(user)).await.ok().flatten();
        ts.and_then(|t| Utc.timestamp_opt(t, 0).single())
    }

    async fn online_users(&self) -> Vec<UserId> {
        let mut conn = self.conn.clone();
        let ttl_secs = self.ttl.as_secs() as i64;
        let cutoff = Utc::now().timestamp() - ttl_secs;
        let _: redis::RedisResult<u64> =
            conn.zrembyscore(Self::online_index_key(), 0, cutoff).await;
        let ids: Vec<String> = conn.zrange(Self::online_index_key(), 0, -1).await.unwrap_or_default();
        ids.into_iter().map(UserId).collect()
    }

    async fn connection_count(&self, user: &UserId) -> usize {
        let mut conn = self.conn.clone();
        conn.scard(Self::connections_key(user)).await.unwrap_or(0)
    }
}
