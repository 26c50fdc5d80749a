use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use conduit_core::types::{CheckpointId, Content, ConversationId, Message, Role};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{MemoryError, Result};
use crate::types::{Checkpoint, FullHistoryEntry, MarkKind, MessageMark};

/// Append-only conversation log plus checkpoint snapshots and advisory
/// marks. Every write goes through a single connection guarded by a
/// `Mutex`, held only across the synchronous SQLite call, never across an
/// `.await` — the same discipline the teacher's memory manager uses.
pub struct HistoryStore {
    db: Mutex<Connection>,
}

impl HistoryStore {
    pub fn new(conn: Connection) -> Result<Self> {
        crate::db::init_db(&conn)?;
        Ok(Self { db: Mutex::new(conn) })
    }

    /// Append `messages` to `conversation_id` in a single transaction.
    /// Content is normalized to its flattened text/image-marker form
    /// before storage.
    pub fn append(&self, conversation_id: &ConversationId, messages: &[Message]) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let now = Utc::now().timestamp_millis();
        for message in messages {
            tx.execute(
                "INSERT INTO full_history (conversation_id, role, content, name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation_id.as_str(),
                    message.role.to_string(),
                    message.content.render(),
                    message.name,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn read(
        &self,
        conversation_id: &ConversationId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FullHistoryEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, role, content, name, created_at
             FROM full_history
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, id ASC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            params![conversation_id.as_str(), limit, offset],
            row_to_entry,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn count(&self, conversation_id: &ConversationId) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM full_history WHERE conversation_id = ?1",
            params![conversation_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn first(&self, conversation_id: &ConversationId) -> Result<Option<FullHistoryEntry>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, conversation_id, role, content, name, created_at
             FROM full_history WHERE conversation_id = ?1
             ORDER BY created_at ASC, id ASC LIMIT 1",
            params![conversation_id.as_str()],
            row_to_entry,
        )
        .optional()
        .map_err(MemoryError::from)
    }

    pub fn last(&self, conversation_id: &ConversationId) -> Result<Option<FullHistoryEntry>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, conversation_id, role, content, name, created_at
             FROM full_history WHERE conversation_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT 1",
            params![conversation_id.as_str()],
            row_to_entry,
        )
        .optional()
        .map_err(MemoryError::from)
    }

    pub fn delete_by_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM full_history WHERE conversation_id = ?1",
            params![conversation_id.as_str()],
        )?;
        Ok(())
    }

    pub fn delete_older_than(&self, timestamp: DateTime<Utc>) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM full_history WHERE created_at < ?1",
            params![timestamp.timestamp_millis()],
        )?;
        Ok(n as i64)
    }

    pub fn create_checkpoint(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
        token_count: u64,
        reason: &str,
        max_checkpoints: usize,
    ) -> Result<CheckpointId> {
        let id = CheckpointId::new();
        let now = Utc::now();
        let messages_json = serde_json::to_string(messages)?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO context_checkpoints
             (id, conversation_id, messages, token_count, message_count, reason, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
            params![
                id.to_string(),
                conversation_id.as_str(),
                messages_json,
                token_count as i64,
                messages.len() as i64,
                reason,
                now.timestamp_millis(),
            ],
        )?;

        // Retention: keep at most max_checkpoints per conversation,
        // oldest-first deletion after the new one is created.
        let mut stmt = db.prepare(
            "SELECT id FROM context_checkpoints
             WHERE conversation_id = ?1
             ORDER BY created_at DESC",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![conversation_id.as_str()], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        if ids.len() > max_checkpoints {
            for stale in &ids[max_checkpoints..] {
                db.execute(
                    "DELETE FROM context_checkpoints WHERE id = ?1",
                    params![stale],
                )?;
            }
        }

        Ok(id)
    }

    pub fn list_checkpoints(&self, conversation_id: &ConversationId) -> Result<Vec<Checkpoint>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, messages, token_count, message_count, reason, created_at, expires_at
             FROM context_checkpoints
             WHERE conversation_id = ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![conversation_id.as_str()], row_to_checkpoint)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn restore_checkpoint(&self, checkpoint_id: &CheckpointId) -> Result<Option<Checkpoint>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, conversation_id, messages, token_count, message_count, reason, created_at, expires_at
             FROM context_checkpoints WHERE id = ?1",
            params![checkpoint_id.to_string()],
            row_to_checkpoint,
        )
        .optional()
        .map_err(MemoryError::from)
    }

    pub fn mark(
        &self,
        message_id: i64,
        conversation_id: &ConversationId,
        kind: MarkKind,
        action_id: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let metadata_json = metadata.map(|m| serde_json::to_string(&m)).transpose()?;
        db.execute(
            "INSERT INTO message_marks (message_id, conversation_id, mark_type, action_id, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message_id,
                conversation_id.as_str(),
                mark_kind_str(kind),
                action_id,
                Utc::now().timestamp_millis(),
                metadata_json,
            ],
        )?;
        Ok(())
    }

    pub fn expire_checkpoints(&self, now: DateTime<Utc>) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM context_checkpoints WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(n as i64)
    }

    /// Atomically replace a conversation's full history with `messages`,
    /// used by rollback (spec.md §4.5 step 3). Delete-then-reinsert runs
    /// inside one transaction so concurrent readers never observe an
    /// empty conversation mid-rollback.
    pub fn replace_history(&self, conversation_id: &ConversationId, messages: &[Message]) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM full_history WHERE conversation_id = ?1",
            params![conversation_id.as_str()],
        )?;
        let now = Utc::now().timestamp_millis();
        for message in messages {
            tx.execute(
                "INSERT INTO full_history (conversation_id, role, content, name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation_id.as_str(),
                    message.role.to_string(),
                    message.content.render(),
                    message.name,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn mark_kind_str(kind: MarkKind) -> &'static str {
    match kind {
        MarkKind::Compressed => "compressed",
        MarkKind::Truncated => "truncated",
        MarkKind::Pruned => "pruned",
        MarkKind::Important => "important",
        MarkKind::Pinned => "pinned",
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<FullHistoryEntry> {
    let role_str: String = row.get(2)?;
    let role: Role = role_str.parse().unwrap_or(Role::User);
    let content: String = row.get(3)?;
    let name: Option<String> = row.get(4)?;
    let created_ms: i64 = row.get(5)?;
    Ok(FullHistoryEntry {
        id: row.get(0)?,
        conversation_id: ConversationId::new(row.get::<_, String>(1)?),
        message: Message {
            role,
            content: Content::text(content),
            name,
        },
        created_at: millis_to_datetime(created_ms),
    })
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
    let messages_json: String = row.get(2)?;
    let messages: Vec<Message> = serde_json::from_str(&messages_json).unwrap_or_default();
    let created_ms: i64 = row.get(6)?;
    let expires_ms: Option<i64> = row.get(7)?;
    Ok(Checkpoint {
        id: CheckpointId::from(row.get::<_, String>(0)?),
        conversation_id: ConversationId::new(row.get::<_, String>(1)?),
        messages,
        token_count: row.get::<_, i64>(3)? as u64,
        message_count: row.get::<_, i64>(4)? as usize,
        reason: row.get(5)?,
        created_at: millis_to_datetime(created_ms),
        expires_at: expires_ms.map(millis_to_datetime),
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> HistoryStore {
        HistoryStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn append_then_count_matches() {
        let store = store();
        let conv = ConversationId::new("c1");
        let msgs = vec![Message::user("hi"), Message::assistant("hello")];
        store.append(&conv, &msgs).unwrap();
        assert_eq!(store.count(&conv).unwrap(), 2);
    }

    #[test]
    fn read_is_ascending_created_at() {
        let store = store();
        let conv = ConversationId::new("c1");
        store.append(&conv, &[Message::user("first")]).unwrap();
        store.append(&conv, &[Message::user("second")]).unwrap();
        let entries = store.read(&conv, 10, 0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message.content.render(), "first");
        assert_eq!(entries[1].message.content.render(), "second");
    }

    #[test]
    fn checkpoint_round_trip() {
        let store = store();
        let conv = ConversationId::new("c1");
        let msgs = vec![Message::user("a"), Message::assistant("b")];
        let id = store.create_checkpoint(&conv, &msgs, 10, "test", 10).unwrap();
        let restored = store.restore_checkpoint(&id).unwrap().unwrap();
        assert_eq!(restored.messages.len(), 2);
        assert_eq!(restored.conversation_id, conv);
    }

    #[test]
    fn checkpoint_retention_deletes_oldest_first() {
        let store = store();
        let conv = ConversationId::new("c1");
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                store
                    .create_checkpoint(&conv, &[Message::user(format!("m{i}"))], 1, "r", 3)
                    .unwrap(),
            );
        }
        let remaining = store.list_checkpoints(&conv).unwrap();
        assert_eq!(remaining.len(), 3);
        // The two oldest (ids[0], ids[1]) should be gone.
        assert!(store.restore_checkpoint(&ids[0]).unwrap().is_none());
        assert!(store.restore_checkpoint(&ids[4]).unwrap().is_some());
    }

    #[test]
    fn replace_history_is_atomic_delete_then_insert() {
        let store = store();
        let conv = ConversationId::new("c1");
        store
            .append(&conv, &[Message::user("a"), Message::user("b"), Message::user("c")])
            .unwrap();
        store
            .replace_history(&conv, &[Message::user("x")])
            .unwrap();
        assert_eq!(store.count(&conv).unwrap(), 1);
    }
}
