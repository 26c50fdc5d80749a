use rusqlite::{Connection, Result};

/// Initialise history/context tables. Safe to call on every startup
/// (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_full_history_table(conn)?;
    create_context_sessions_table(conn)?;
    create_context_checkpoints_table(conn)?;
    create_message_marks_table(conn)?;
    Ok(())
}

fn create_full_history_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS full_history (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            role            TEXT NOT NULL CHECK(role IN ('user','assistant','system')),
            content         TEXT NOT NULL,
            name            TEXT,
            created_at      INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_history_conv
            ON full_history(conversation_id);
        CREATE INDEX IF NOT EXISTS idx_history_conv_created
            ON full_history(conversation_id, created_at);",
    )
}

fn create_context_sessions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS context_sessions (
            id                       TEXT PRIMARY KEY,
            conversation_id          TEXT NOT NULL,
            effective_messages       TEXT NOT NULL,
            token_count              INTEGER NOT NULL,
            message_count            INTEGER NOT NULL,
            compression_summary      TEXT,
            compressed_message_ids   TEXT NOT NULL,
            last_action              TEXT,
            created_at               INTEGER NOT NULL,
            updated_at               INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_context_sessions_conv
            ON context_sessions(conversation_id);",
    )
}

fn create_context_checkpoints_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS context_checkpoints (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            messages        TEXT NOT NULL,
            token_count     INTEGER NOT NULL,
            message_count   INTEGER NOT NULL,
            reason          TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            expires_at      INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_checkpoints_conv
            ON context_checkpoints(conversation_id, created_at DESC);",
    )
}

fn create_message_marks_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS message_marks (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id      INTEGER NOT NULL REFERENCES full_history(id),
            conversation_id TEXT NOT NULL,
            mark_type       TEXT NOT NULL,
            action_id       TEXT,
            created_at      INTEGER NOT NULL,
            metadata        TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_marks_conv
            ON message_marks(conversation_id);",
    )
}
