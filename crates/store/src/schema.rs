pub const SCHEMA_VERSION: i64 = 1;

pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role TEXT NOT NULL CHECK (role IN ('user','assistant','system','tool')),
    content TEXT NOT NULL,
    position INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (conversation_id, position)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, position);

CREATE TABLE IF NOT EXISTS tool_calls (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    tool_name TEXT NOT NULL,
    provider_name TEXT NOT NULL,
    input TEXT NOT NULL,
    output TEXT,
    status TEXT NOT NULL CHECK (status IN ('pending','success','error')),
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tool_calls_message ON tool_calls(message_id);

CREATE TABLE IF NOT EXISTS attachments (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    filename TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size INTEGER NOT NULL,
    storage_path TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);

CREATE TABLE IF NOT EXISTS change_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    origin_process_id TEXT NOT NULL,
    channel TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_log_created ON change_log(created_at);

CREATE VIRTUAL TABLE IF NOT EXISTS conversations_fts USING fts5(
    conversation_id UNINDEXED,
    title,
    body,
    tokenize = 'porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS trg_conversations_ai AFTER INSERT ON conversations BEGIN
    INSERT INTO conversations_fts(conversation_id, title, body) VALUES (new.id, new.title, '');
END;

CREATE TRIGGER IF NOT EXISTS trg_conversations_au AFTER UPDATE OF title ON conversations BEGIN
    DELETE FROM conversations_fts WHERE conversation_id = old.id;
    INSERT INTO conversations_fts(conversation_id, title, body)
        SELECT new.id, new.title, COALESCE((SELECT group_concat(content, ' ') FROM messages WHERE conversation_id = new.id), '');
END;

CREATE TRIGGER IF NOT EXISTS trg_conversations_ad AFTER DELETE ON conversations BEGIN
    DELETE FROM conversations_fts WHERE conversation_id = old.id;
END;

CREATE TRIGGER IF NOT EXISTS trg_messages_ai AFTER INSERT ON messages BEGIN
    DELETE FROM conversations_fts WHERE conversation_id = new.conversation_id;
    INSERT INTO conversations_fts(conversation_id, title, body)
        SELECT c.id, c.title, COALESCE((SELECT group_concat(content, ' ') FROM messages WHERE conversation_id = c.id), '')
        FROM conversations c WHERE c.id = new.conversation_id;
END;

CREATE TRIGGER IF NOT EXISTS trg_messages_au AFTER UPDATE ON messages BEGIN
    DELETE FROM conversations_fts WHERE conversation_id = new.conversation_id;
    INSERT INTO conversations_fts(conversation_id, title, body)
        SELECT c.id, c.title, COALESCE((SELECT group_concat(content, ' ') FROM messages WHERE conversation_id = c.id), '')
        FROM conversations c WHERE c.id = new.conversation_id;
END;

CREATE TRIGGER IF NOT EXISTS trg_messages_ad AFTER DELETE ON messages BEGIN
    DELETE FROM conversations_fts WHERE conversation_id = old.conversation_id;
    INSERT INTO conversations_fts(conversation_id, title, body)
        SELECT c.id, c.title, COALESCE((SELECT group_concat(content, ' ') FROM messages WHERE conversation_id = c.id), '')
        FROM conversations c WHERE c.id = old.conversation_id;
END;
"#;

pub fn migrate(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
    conn.execute_batch(DDL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}
