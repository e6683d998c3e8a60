//! Durable storage for conversations and messages (spec.md §4.2).
//!
//! `ConversationRepository` is the storage trait boundary; `SqliteConversationStore`
//! is the reference implementation, a `rusqlite` connection behind a `Mutex`
//! plus a per-conversation append lock so that concurrent `AppendMessage`
//! calls on the same conversation serialize into a linear extension of
//! wall-clock order (spec.md §4.2 concurrency note).

mod schema;
#[cfg(test)]
mod proptests;

pub use schema::SCHEMA;

use crate::domain::{Conversation, Message, MessageRole, UserId};
use crate::error::{AppError, AppResult};
use crate::validation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// One page of conversations, with the pagination metadata spec.md §6 asks
/// the REST surface to surface as response headers.
#[derive(Debug, Clone)]
pub struct ConversationPage {
    pub items: Vec<Conversation>,
    pub total_count: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
}

/// One page of messages, cursor-paginated.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub items: Vec<Message>,
    pub next_cursor: Option<String>,
}

/// Storage boundary consumed by the gateway and the orchestration worker.
/// A different backend (Postgres, a remote service) plugs in here without
/// touching callers.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create_conversation(&self, owner: &UserId, title: &str) -> AppResult<Conversation>;
    async fn get_conversation(&self, id: &str) -> AppResult<Conversation>;
    async fn list_conversations(
        &self,
        owner: &UserId,
        page: u32,
        page_size: u32,
        query: Option<&str>,
    ) -> AppResult<ConversationPage>;
    async fn update_conversation_title(
        &self,
        id: &str,
        new_title: &str,
        caller: &UserId,
    ) -> AppResult<Conversation>;
    async fn delete_conversation(&self, id: &str, caller: &UserId) -> AppResult<()>;
    async fn append_message(
        &self,
        conversation_id: &str,
        sender: Option<UserId>,
        content: &str,
        role: MessageRole,
        is_error: bool,
    ) -> AppResult<Message>;
    async fn list_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u32,
        caller: &UserId,
    ) -> AppResult<MessagePage>;
    /// Callable only through the `InternalService` authorization layer;
    /// bypasses ownership (spec.md §4.2).
    async fn list_messages_for_service(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> AppResult<Vec<Message>>;
}

pub struct SqliteConversationStore {
    conn: Arc<Mutex<Connection>>,
    /// Per-conversation append lock keyed by conversation id, so concurrent
    /// `SendMessage` calls on the same conversation don't interleave their
    /// read-modify-write of `updated_at` (spec.md §4.2, §5).
    append_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl SqliteConversationStore {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let conn = Connection::open(path).map_err(|e| AppError::Transient(e.to_string()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| AppError::Transient(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> AppResult<Self> {
        // SQLite enforces foreign keys per-connection, off by default; without
        // this the messages table's ON DELETE CASCADE is silently a no-op.
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| AppError::Transient(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| AppError::Transient(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            append_locks: DashMap::new(),
        })
    }

    fn append_lock(&self, conversation_id: &str) -> Arc<AsyncMutex<()>> {
        self.append_locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
        Ok(Conversation {
            id: row.get(0)?,
            owner_user_id: UserId(row.get(1)?),
            title: row.get(2)?,
            created_at: parse_datetime(&row.get::<_, String>(3)?),
            updated_at: parse_datetime(&row.get::<_, String>(4)?),
        })
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
        let role_str: String = row.get(3)?;
        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_user_id: row.get::<_, Option<String>>(2)?.map(UserId),
            role: parse_role(&role_str),
            content: row.get(4)?,
            sent_at: parse_datetime(&row.get::<_, String>(5)?),
            is_error: row.get(6)?,
        })
    }
}

#[async_trait]
impl ConversationRepository for SqliteConversationStore {
    async fn create_conversation(&self, owner: &UserId, title: &str) -> AppResult<Conversation> {
        validation::validate_title(title)?;
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO conversations (id, owner_user_id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, owner.0, title, now.to_rfc3339()],
        )?;

        Ok(Conversation {
            id,
            owner_user_id: owner.clone(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_conversation(&self, id: &str) -> AppResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, owner_user_id, title, created_at, updated_at FROM conversations WHERE id = ?1",
            params![id],
            Self::row_to_conversation,
        )
        .map_err(AppError::from)
    }

    async fn list_conversations(
        &self,
        owner: &UserId,
        page: u32,
        page_size: u32,
        query: Option<&str>,
    ) -> AppResult<ConversationPage> {
        let page_size = validation::clamp_page_size(Some(page_size))?;
        let page = page.max(1);
        let conn = self.conn.lock().unwrap();

        // Case-insensitive substring match on title and on message content
        // within the owner's conversations (spec.md §9 resolution). `?2` is
        // bound to NULL when no query is given, so one statement shape
        // covers both cases and parameter indices never shift.
        let needle: Option<String> = query
            .filter(|q| !q.is_empty())
            .map(|q| format!("%{}%", q.to_lowercase()));
        let search_clause = "AND (?2 IS NULL OR LOWER(c.title) LIKE ?2 OR EXISTS (
            SELECT 1 FROM messages m WHERE m.conversation_id = c.id AND LOWER(m.content) LIKE ?2
        ))";

        let count_sql =
            format!("SELECT COUNT(*) FROM conversations c WHERE c.owner_user_id = ?1 {search_clause}");
        let total_count: u64 = conn.query_row(&count_sql, params![owner.0, needle], |r| r.get(0))?;

        let total_pages = total_count.div_ceil(page_size as u64).max(1) as u32;
        let offset = (page - 1) as i64 * page_size as i64;

        let list_sql = format!(
            "SELECT c.id, c.owner_user_id, c.title, c.created_at, c.updated_at
             FROM conversations c WHERE c.owner_user_id = ?1 {search_clause}
             ORDER BY c.updated_at DESC, c.id DESC LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = conn.prepare(&list_sql)?;
        let items = stmt
            .query_map(params![owner.0, needle, page_size, offset], Self::row_to_conversation)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ConversationPage {
            items,
            total_count,
            page,
            page_size,
            total_pages,
        })
    }

    async fn update_conversation_title(
        &self,
        id: &str,
        new_title: &str,
        caller: &UserId,
    ) -> AppResult<Conversation> {
        validation::validate_title(new_title)?;
        let conn = self.conn.lock().unwrap();
        let existing = conn
            .query_row(
                "SELECT id, owner_user_id, title, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
                Self::row_to_conversation,
            )
            .map_err(AppError::from)?;

        if !existing.is_owned_by(caller) {
            return Err(AppError::Forbidden);
        }

        let now = Utc::now();
        conn.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_title, now.to_rfc3339(), id],
        )?;

        Ok(Conversation {
            title: new_title.to_string(),
            updated_at: now,
            ..existing
        })
    }

    async fn delete_conversation(&self, id: &str, caller: &UserId) -> AppResult<()> {
        let conn = self.conn.lock().unwrap();
        let existing = conn
            .query_row(
                "SELECT id, owner_user_id, title, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
                Self::row_to_conversation,
            )
            .map_err(AppError::from)?;

        if !existing.is_owned_by(caller) {
            return Err(AppError::Forbidden);
        }

        // Messages are removed by ON DELETE CASCADE.
        conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        sender: Option<UserId>,
        content: &str,
        role: MessageRole,
        is_error: bool,
    ) -> AppResult<Message> {
        validation::validate_content(content)?;
        let lock = self.append_lock(conversation_id);
        let _guard = lock.lock().await;

        let conn = self.conn.lock().unwrap();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
            params![conversation_id],
            |r| r.get(0),
        )?;
        if !exists {
            return Err(AppError::NotFound(conversation_id.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        // `sentAt = max(storedUpdatedAt, now) + ε` keeps message ordering a
        // linear extension of wall-clock order even under clock skew between
        // rapid appends (spec.md §4.2 concurrency note).
        let stored_updated_at: String = conn.query_row(
            "SELECT updated_at FROM conversations WHERE id = ?1",
            params![conversation_id],
            |r| r.get(0),
        )?;
        let stored_updated_at = parse_datetime(&stored_updated_at);
        let now = Utc::now();
        let sent_at = if stored_updated_at >= now {
            stored_updated_at + chrono::Duration::milliseconds(1)
        } else {
            now
        };

        conn.execute(
            "INSERT INTO messages (id, conversation_id, sender_user_id, role, content, sent_at, is_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                conversation_id,
                sender.as_ref().map(|u| u.0.clone()),
                role.to_string(),
                content,
                sent_at.to_rfc3339(),
                is_error,
            ],
        )?;
        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![sent_at.to_rfc3339(), conversation_id],
        )?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            sender_user_id: sender,
            role,
            content: content.to_string(),
            sent_at,
            is_error,
        })
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u32,
        caller: &UserId,
    ) -> AppResult<MessagePage> {
        let limit = validation::validate_list_limit(Some(limit), validation::PAGE_SIZE_DEFAULT);
        let conn = self.conn.lock().unwrap();
        let owner: String = conn
            .query_row(
                "SELECT owner_user_id FROM conversations WHERE id = ?1",
                params![conversation_id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| AppError::NotFound(conversation_id.to_string()))?;
        if owner != caller.0 {
            return Err(AppError::Forbidden);
        }

        let cursor_sent_at: Option<String> = match cursor {
            Some(cursor_id) => {
                let sent_at: Option<String> = conn
                    .query_row(
                        "SELECT sent_at FROM messages WHERE id = ?1 AND conversation_id = ?2",
                        params![cursor_id, conversation_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                Some(sent_at.ok_or_else(|| AppError::InvalidArgument(format!("unknown cursor {cursor_id}")))?)
            }
            None => None,
        };

        // Fetch one extra row to determine whether the page was full.
        let mut stmt;
        let rows: Vec<Message> = if let Some(sent_at) = &cursor_sent_at {
            let cursor_id = cursor.unwrap();
            stmt = conn.prepare(
                "SELECT id, conversation_id, sender_user_id, role, content, sent_at, is_error
                 FROM messages
                 WHERE conversation_id = ?1
                   AND (sent_at > ?2 OR (sent_at = ?2 AND id > ?3))
                 ORDER BY sent_at ASC, id ASC LIMIT ?4",
            )?;
            stmt.query_map(params![conversation_id, sent_at, cursor_id, limit as i64 + 1], Self::row_to_message)?
                .collect::<Result<Vec<_>, _>>()?
        } else {
            stmt = conn.prepare(
                "SELECT id, conversation_id, sender_user_id, role, content, sent_at, is_error
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY sent_at ASC, id ASC LIMIT ?2",
            )?;
            stmt.query_map(params![conversation_id, limit as i64 + 1], Self::row_to_message)?
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut items = rows;
        let next_cursor = if items.len() > limit as usize {
            items.truncate(limit as usize);
            items.last().map(|m| m.id.clone())
        } else {
            None
        };

        Ok(MessagePage { items, next_cursor })
    }

    async fn list_messages_for_service(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> AppResult<Vec<Message>> {
        let limit = validation::validate_list_limit(Some(limit), validation::PAGE_SIZE_DEFAULT);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sender_user_id, role, content, sent_at, is_error
             FROM messages WHERE conversation_id = ?1
             ORDER BY sent_at DESC, id DESC LIMIT ?2",
        )?;
        let mut items: Vec<Message> = stmt
            .query_map(params![conversation_id, limit], Self::row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        items.reverse();
        Ok(items)
    }
}

fn parse_role(s: &str) -> MessageRole {
    match s {
        "assistant" => MessageRole::Assistant,
        "system" => MessageRole::System,
        _ => MessageRole::User,
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId(id.to_string())
    }

    #[tokio::test]
    async fn create_and_get_conversation() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let owner = user("u1");
        let conv = store.create_conversation(&owner, "Hello").await.unwrap();
        let fetched = store.get_conversation(&conv.id).await.unwrap();
        assert_eq!(fetched.id, conv.id);
        assert_eq!(fetched.title, "Hello");
    }

    #[tokio::test]
    async fn ownership_enforced_on_title_update_and_delete() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let owner = user("u1");
        let other = user("u2");
        let conv = store.create_conversation(&owner, "Hello").await.unwrap();

        let err = store
            .update_conversation_title(&conv.id, "New", &other)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden));

        let err = store.delete_conversation(&conv.id, &other).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden));
    }

    #[tokio::test]
    async fn append_then_list_reflects_order() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let owner = user("u1");
        let conv = store.create_conversation(&owner, "Hello").await.unwrap();

        for i in 0..5 {
            store
                .append_message(&conv.id, Some(owner.clone()), &format!("msg {i}"), MessageRole::User, false)
                .await
                .unwrap();
        }

        let page = store.list_messages(&conv.id, None, 100, &owner).await.unwrap();
        assert_eq!(page.items.len(), 5);
        assert!(page.next_cursor.is_none());
        for (i, m) in page.items.iter().enumerate() {
            assert_eq!(m.content, format!("msg {i}"));
        }
    }

    #[tokio::test]
    async fn cursor_pagination_is_a_partition() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let owner = user("u1");
        let conv = store.create_conversation(&owner, "Hello").await.unwrap();

        for i in 0..25 {
            store
                .append_message(&conv.id, Some(owner.clone()), &format!("msg {i}"), MessageRole::User, false)
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = store
                .list_messages(&conv.id, cursor.as_deref(), 10, &owner)
                .await
                .unwrap();
            seen.extend(page.items.iter().map(|m| m.id.clone()));
            match page.next_cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        assert_eq!(seen.len(), 25);
        let unique: std::collections::HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 25);
    }

    #[tokio::test]
    async fn title_and_content_search_is_case_insensitive() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let owner = user("u1");
        let c1 = store.create_conversation(&owner, "Refactor Plan").await.unwrap();
        let c2 = store.create_conversation(&owner, "Unrelated").await.unwrap();
        store
            .append_message(&c2.id, Some(owner.clone()), "let's talk about the REFACTOR", MessageRole::User, false)
            .await
            .unwrap();

        let page = store
            .list_conversations(&owner, 1, 50, Some("refactor"))
            .await
            .unwrap();
        let ids: Vec<_> = page.items.iter().map(|c| c.id.clone()).collect();
        assert!(ids.contains(&c1.id));
        assert!(ids.contains(&c2.id));
    }
}
