//! Embedded SQL schema for the conversation/message store (spec.md §3).

/// SQL schema for initialization.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    owner_user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_owner_updated
    ON conversations(owner_user_id, updated_at DESC);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sender_user_id TEXT,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    sent_at TEXT NOT NULL,
    is_error BOOLEAN NOT NULL DEFAULT 0,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_sent
    ON messages(conversation_id, sent_at, id);
"#;
