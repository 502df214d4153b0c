use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::models::*;
use crate::schema;

/// Durable, single-writer, multi-reader store over one SQLite database file.
///
/// All access is serialised through a single mutex guarding the connection,
/// matching the reference implementation's single-lock `ThreadSafeConnection`
/// model (SPEC_FULL §4.1).
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Conversations ──────────────────────────────────────────────

    pub fn create_conversation(&self, title: &str) -> Result<Conversation> {
        let conn = self.conn.lock();
        let id = Uuid::new_v4().to_string();
        let now = now_str();
        conn.execute(
            "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![id, title, now],
        )?;
        Ok(Conversation {
            id,
            title: title.to_string(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
            params![id],
            |row| {
                Ok(Conversation {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn update_conversation_title(&self, id: &str, title: &str) -> Result<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE conversations SET title = ?1 WHERE id = ?2",
            params![title, id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("conversation {id}")));
        }
        Ok(())
    }

    pub fn list_conversations(
        &self,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ConversationSummary>> {
        let conn = self.conn.lock();
        let mut rows = Vec::new();
        if let Some(q) = search.filter(|s| !s.trim().is_empty()) {
            let escaped = q.replace('"', "\"\"");
            let fts_query = format!("\"{escaped}\"");
            let mut stmt = conn.prepare(
                "SELECT c.id, c.title, c.created_at, c.updated_at,
                        (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count
                 FROM conversations_fts f
                 JOIN conversations c ON c.id = f.conversation_id
                 WHERE conversations_fts MATCH ?1
                 ORDER BY c.updated_at DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let mapped = stmt.query_map(params![fts_query, limit, offset], map_summary)?;
            for r in mapped {
                rows.push(r?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.title, c.created_at, c.updated_at,
                        (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count
                 FROM conversations c
                 ORDER BY c.updated_at DESC
                 LIMIT ?1 OFFSET ?2",
            )?;
            let mapped = stmt.query_map(params![limit, offset], map_summary)?;
            for r in mapped {
                rows.push(r?);
            }
        }
        Ok(rows)
    }

    pub fn delete_conversation(&self, id: &str, data_root: impl AsRef<Path>) -> Result<()> {
        let attachment_dir = data_root.as_ref().join("attachments").join(id);
        if attachment_dir.exists() {
            std::fs::remove_dir_all(&attachment_dir)?;
        }
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("conversation {id}")));
        }
        Ok(())
    }

    // ── Messages ───────────────────────────────────────────────────

    pub fn append_message(&self, conversation_id: &str, role: Role, content: &str) -> Result<Message> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let position: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(position), -1) + 1 FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |r| r.get(0),
            )
            .map_err(StoreError::from)?;
        let id = Uuid::new_v4().to_string();
        let now = now_str();
        tx.execute(
            "INSERT INTO messages (id, conversation_id, role, content, position, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, conversation_id, role.as_str(), content, position, now],
        )?;
        let updated = tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now, conversation_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "conversation {conversation_id}"
            )));
        }
        tx.commit()?;
        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            position,
            created_at: now,
            tool_calls: Vec::new(),
            attachments: Vec::new(),
        })
    }

    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, position, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY position ASC",
        )?;
        let mut messages: Vec<Message> = stmt
            .query_map(params![conversation_id], |row| {
                let role_str: String = row.get(2)?;
                Ok(Message {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: Role::parse(&role_str).unwrap_or(Role::User),
                    content: row.get(3)?,
                    position: row.get(4)?,
                    created_at: row.get(5)?,
                    tool_calls: Vec::new(),
                    attachments: Vec::new(),
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        for msg in &mut messages {
            msg.tool_calls = self.list_tool_calls_locked(&conn, &msg.id)?;
            msg.attachments = self.list_attachments_locked(&conn, &msg.id)?;
        }
        Ok(messages)
    }

    fn list_tool_calls_locked(
        &self,
        conn: &Connection,
        message_id: &str,
    ) -> Result<Vec<ToolCallRecord>> {
        let mut stmt = conn.prepare(
            "SELECT id, message_id, tool_name, provider_name, input, output, status, created_at
             FROM tool_calls WHERE message_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![message_id], map_tool_call)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn list_attachments_locked(&self, conn: &Connection, message_id: &str) -> Result<Vec<Attachment>> {
        let mut stmt = conn.prepare(
            "SELECT id, message_id, conversation_id, filename, mime_type, size, storage_path, created_at
             FROM attachments WHERE message_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![message_id], |row| {
                Ok(Attachment {
                    id: row.get(0)?,
                    message_id: row.get(1)?,
                    conversation_id: row.get(2)?,
                    filename: row.get(3)?,
                    mime_type: row.get(4)?,
                    size: row.get(5)?,
                    storage_path: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Tool calls ─────────────────────────────────────────────────

    pub fn record_tool_call(
        &self,
        message_id: &str,
        tool_call_id: Option<&str>,
        tool_name: &str,
        provider_name: &str,
        input: serde_json::Value,
    ) -> Result<ToolCallRecord> {
        let conn = self.conn.lock();
        let id = tool_call_id
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = now_str();
        let input_json = serde_json::to_string(&input)?;
        conn.execute(
            "INSERT INTO tool_calls (id, message_id, tool_name, provider_name, input, output, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, 'pending', ?6)",
            params![id, message_id, tool_name, provider_name, input_json, now],
        )?;
        Ok(ToolCallRecord {
            id,
            message_id: message_id.to_string(),
            tool_name: tool_name.to_string(),
            provider_name: provider_name.to_string(),
            input,
            output: None,
            status: ToolCallStatus::Pending,
            created_at: now,
        })
    }

    pub fn complete_tool_call(
        &self,
        id: &str,
        output: serde_json::Value,
        status: ToolCallStatus,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let existing: Option<(Option<String>, String)> = conn
            .query_row(
                "SELECT output, status FROM tool_calls WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((existing_output, existing_status)) = existing else {
            return Err(StoreError::NotFound(format!("tool call {id}")));
        };
        if existing_status != "pending" {
            let same_status = existing_status == status.as_str();
            let same_output = existing_output
                .as_deref()
                .map(|o| serde_json::from_str::<serde_json::Value>(o).ok())
                .flatten()
                == Some(output.clone());
            if same_status && same_output {
                return Ok(());
            }
            return Err(StoreError::Validation(format!(
                "tool call {id} already terminal with a different outcome"
            )));
        }
        let output_json = serde_json::to_string(&output)?;
        conn.execute(
            "UPDATE tool_calls SET output = ?1, status = ?2 WHERE id = ?3",
            params![output_json, status.as_str(), id],
        )?;
        Ok(())
    }

    // ── Attachments ────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn save_attachment(
        &self,
        message_id: &str,
        conversation_id: &str,
        filename: &str,
        mime_type: &str,
        data: &[u8],
        data_root: impl AsRef<Path>,
        max_bytes: u64,
    ) -> Result<Attachment> {
        if !ALLOWED_MIME_TYPES.contains(&mime_type) {
            return Err(StoreError::Validation(format!(
                "mime type not allowed: {mime_type}"
            )));
        }
        if data.len() as u64 > max_bytes {
            return Err(StoreError::Validation(format!(
                "attachment exceeds max size of {max_bytes} bytes"
            )));
        }
        let clean_name = sanitize_filename(filename);
        let id = Uuid::new_v4().to_string();
        let dir = data_root.as_ref().join("attachments").join(conversation_id);
        std::fs::create_dir_all(&dir)?;
        let file_name = format!("{id}_{clean_name}");
        let dest = dir.join(&file_name);

        let root_canon = dir.canonicalize().unwrap_or_else(|_| dir.clone());
        let parent_canon = dest
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| dir.clone());
        if parent_canon != root_canon && !parent_canon.starts_with(&root_canon) {
            return Err(StoreError::Validation(
                "attachment path escapes storage root".into(),
            ));
        }

        std::fs::write(&dest, data)?;
        let storage_path: PathBuf = ["attachments", conversation_id, &file_name].iter().collect();
        let storage_path_str = storage_path.to_string_lossy().to_string();
        let now = now_str();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO attachments (id, message_id, conversation_id, filename, mime_type, size, storage_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![id, message_id, conversation_id, clean_name, mime_type, data.len() as i64, storage_path_str, now],
        )?;
        Ok(Attachment {
            id,
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            filename: clean_name,
            mime_type: mime_type.to_string(),
            size: data.len() as i64,
            storage_path: storage_path_str,
            created_at: now,
        })
    }

    // ── Rewind ─────────────────────────────────────────────────────

    /// Deletes every message past `to_position`. Returns the ids of tool
    /// calls whose outputs were restored from the undo ledger, and the ids
    /// skipped because no shadow copy existed (SPEC_FULL §9 Open Question 2).
    pub fn rewind(
        &self,
        conversation_id: &str,
        to_position: i64,
        undo_root: Option<&Path>,
    ) -> Result<RewindReport> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut restored = Vec::new();
        let mut skipped = Vec::new();

        if let Some(undo_root) = undo_root {
            let mut stmt = tx.prepare(
                "SELECT tc.id, tc.input FROM tool_calls tc
                 JOIN messages m ON m.id = tc.message_id
                 WHERE m.conversation_id = ?1 AND m.position > ?2
                 ORDER BY m.position DESC",
            )?;
            let calls: Vec<(String, String)> = stmt
                .query_map(params![conversation_id, to_position], |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })?
                .collect::<rusqlite::Result<_>>()?;
            drop(stmt);
            for (call_id, input_json) in calls {
                let shadow = undo_root.join(conversation_id).join(&call_id);
                if !shadow.exists() {
                    skipped.push(call_id);
                    continue;
                }
                let input: serde_json::Value =
                    serde_json::from_str(&input_json).unwrap_or(serde_json::Value::Null);
                if let Some(path) = input.get("path").and_then(|v| v.as_str()) {
                    if let Ok(bytes) = std::fs::read(&shadow) {
                        let _ = std::fs::write(path, bytes);
                        restored.push(call_id);
                        continue;
                    }
                }
                skipped.push(call_id);
            }
        }

        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1 AND position > ?2",
            params![conversation_id, to_position],
        )?;
        let now = now_str();
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now, conversation_id],
        )?;
        tx.commit()?;
        Ok(RewindReport { restored, skipped })
    }

    // ── Change log (event bus support) ────────────────────────────

    pub fn insert_change_log(
        &self,
        origin_process_id: &str,
        channel: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        let payload_json = serde_json::to_string(payload)?;
        let now = now_str();
        conn.execute(
            "INSERT INTO change_log (origin_process_id, channel, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![origin_process_id, channel, event_type, payload_json, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn max_change_log_id(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let id: i64 = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM change_log", [], |r| {
            r.get(0)
        })?;
        Ok(id)
    }

    pub fn change_log_since(&self, last_id: i64) -> Result<Vec<ChangeLogRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, origin_process_id, channel, event_type, payload, created_at
             FROM change_log WHERE id > ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![last_id], |row| {
                let payload_str: String = row.get(4)?;
                Ok(ChangeLogRow {
                    id: row.get(0)?,
                    origin_process_id: row.get(1)?,
                    channel: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
                    created_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn cleanup_change_log_older_than_secs(&self, max_age_secs: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let cutoff = (Utc::now() - chrono::Duration::seconds(max_age_secs)).to_rfc3339();
        let n = conn.execute("DELETE FROM change_log WHERE created_at < ?1", params![cutoff])?;
        Ok(n)
    }
}

pub struct RewindReport {
    pub restored: Vec<String>,
    pub skipped: Vec<String>,
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn map_summary(row: &rusqlite::Row) -> rusqlite::Result<ConversationSummary> {
    Ok(ConversationSummary {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        message_count: row.get(4)?,
    })
}

fn map_tool_call(row: &rusqlite::Row) -> rusqlite::Result<ToolCallRecord> {
    let input_str: String = row.get(4)?;
    let output_str: Option<String> = row.get(5)?;
    let status_str: String = row.get(6)?;
    Ok(ToolCallRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        tool_name: row.get(2)?,
        provider_name: row.get(3)?,
        input: serde_json::from_str(&input_str).unwrap_or(serde_json::Value::Null),
        output: output_str.map(|s| serde_json::from_str(&s).unwrap_or(serde_json::Value::Null)),
        status: ToolCallStatus::parse(&status_str).unwrap_or(ToolCallStatus::Pending),
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_message_positions_are_dense() {
        let store = Store::open_in_memory().unwrap();
        let convo = store.create_conversation("t").unwrap();
        let m0 = store.append_message(&convo.id, Role::User, "hi").unwrap();
        let m1 = store
            .append_message(&convo.id, Role::Assistant, "hello")
            .unwrap();
        assert_eq!(m0.position, 0);
        assert_eq!(m1.position, 1);
        let msgs = store.list_messages(&convo.id).unwrap();
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn complete_tool_call_transitions_exactly_once() {
        let store = Store::open_in_memory().unwrap();
        let convo = store.create_conversation("t").unwrap();
        let msg = store
            .append_message(&convo.id, Role::Assistant, "")
            .unwrap();
        let call = store
            .record_tool_call(&msg.id, None, "shell", "builtin", serde_json::json!({}))
            .unwrap();
        store
            .complete_tool_call(&call.id, serde_json::json!({"ok": true}), ToolCallStatus::Success)
            .unwrap();
        let err = store.complete_tool_call(
            &call.id,
            serde_json::json!({"ok": false}),
            ToolCallStatus::Error,
        );
        assert!(err.is_err());
        // Idempotent re-application of the same outcome succeeds.
        store
            .complete_tool_call(&call.id, serde_json::json!({"ok": true}), ToolCallStatus::Success)
            .unwrap();
    }

    #[test]
    fn delete_conversation_removes_all_children() {
        let store = Store::open_in_memory().unwrap();
        let convo = store.create_conversation("t").unwrap();
        store.append_message(&convo.id, Role::User, "hi").unwrap();
        let dir = tempfile::tempdir().unwrap();
        store.delete_conversation(&convo.id, dir.path()).unwrap();
        assert!(store.get_conversation(&convo.id).unwrap().is_none());
    }

    #[test]
    fn rewind_deletes_messages_past_cutoff() {
        let store = Store::open_in_memory().unwrap();
        let convo = store.create_conversation("t").unwrap();
        store.append_message(&convo.id, Role::User, "a").unwrap();
        store.append_message(&convo.id, Role::Assistant, "b").unwrap();
        store.append_message(&convo.id, Role::User, "c").unwrap();
        store.rewind(&convo.id, 0, None).unwrap();
        let msgs = store.list_messages(&convo.id).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].position, 0);
    }

    #[test]
    fn search_matches_title_and_body() {
        let store = Store::open_in_memory().unwrap();
        let convo = store.create_conversation("Rust borrow checker").unwrap();
        store
            .append_message(&convo.id, Role::User, "explain lifetimes")
            .unwrap();
        let results = store.list_conversations(Some("lifetimes"), 10, 0).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, convo.id);
    }

    #[test]
    fn search_sanitizes_fts_query_syntax() {
        let store = Store::open_in_memory().unwrap();
        store.create_conversation("has \"quotes\" in it").unwrap();
        // Should not panic or error out on FTS5 special syntax.
        let results = store.list_conversations(Some("OR AND NOT \""), 10, 0).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn attachment_mime_type_allow_list_enforced() {
        let store = Store::open_in_memory().unwrap();
        let convo = store.create_conversation("t").unwrap();
        let msg = store.append_message(&convo.id, Role::User, "hi").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = store.save_attachment(
            &msg.id,
            &convo.id,
            "evil.exe",
            "application/x-msdownload",
            b"data",
            dir.path(),
            1024,
        );
        assert!(err.is_err());
    }
}
