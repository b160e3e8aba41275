use sqlx::SqlitePool;

/// Create all tables and indexes. Idempotent; called once at startup and by
/// tests that run against scratch databases.
pub async fn run_migrations(pool: &SqlitePool) -> crate::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT    NOT NULL,
            email        TEXT    NOT NULL UNIQUE,
            role         TEXT    NOT NULL DEFAULT 'cs',
            token_digest TEXT,
            created_at   INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS agent_presence (
            user_id        INTEGER PRIMARY KEY REFERENCES users(id),
            state          TEXT    NOT NULL DEFAULT 'offline',
            current_chats  INTEGER NOT NULL DEFAULT 0,
            max_chats      INTEGER NOT NULL DEFAULT 5,
            last_active_at INTEGER NOT NULL DEFAULT 0,
            CHECK (current_chats >= 0),
            CHECK (max_chats > 0)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS chat_sessions (
            id                TEXT    PRIMARY KEY,
            customer_name     TEXT,
            customer_email    TEXT,
            source_url        TEXT,
            customer_token    TEXT    NOT NULL UNIQUE,
            status            TEXT    NOT NULL DEFAULT 'waiting',
            assigned_agent_id INTEGER REFERENCES users(id),
            created_at        INTEGER NOT NULL,
            assigned_at       INTEGER,
            resolved_at       INTEGER,
            rating            INTEGER,
            feedback          TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sessions_status_created
         ON chat_sessions (status, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sessions_agent
         ON chat_sessions (assigned_agent_id, status)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS chat_messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id  TEXT    NOT NULL REFERENCES chat_sessions(id),
            sender_type TEXT    NOT NULL,
            sender_id   INTEGER,
            content     TEXT    NOT NULL,
            kind        TEXT    NOT NULL DEFAULT 'text',
            file_ref    TEXT,
            created_at  INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_session_created
         ON chat_messages (session_id, created_at, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS canned_responses (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            title      TEXT    NOT NULL,
            content    TEXT    NOT NULL,
            created_by INTEGER REFERENCES users(id),
            created_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS activity_log (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    INTEGER,
            action     TEXT    NOT NULL,
            detail     TEXT,
            created_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_activity_created
         ON activity_log (created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
