//! Durable chat store backed by SQLite.
//!
//! This crate is the source of truth for sessions, messages, agent presence
//! and the support tables (users, canned responses, activity log). Every
//! lifecycle transition that touches more than one row (claiming a waiting
//! session, resolving, transferring, abandoning) runs as a single
//! transaction so the capacity counters can never drift from the session set
//! under concurrent access.

pub mod admin;
pub mod error;
pub mod presence;
pub mod schema;
pub mod sessions;
pub mod types;

pub use {
    error::StoreError,
    schema::run_migrations,
    types::{
        AgentPresence, AgentState, ChatMessage, ChatSession, CreateSession, MessageKind,
        NewMessage, SenderType, SessionStatus,
    },
};

use sqlx::SqlitePool;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the chat database. Cheap to clone; wraps the connection pool.
#[derive(Clone)]
pub struct ChatStore {
    pool: SqlitePool,
}

impl ChatStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Open a pool for the given sqlx SQLite URL with the settings the broker
/// needs: auto-create, WAL journaling and a busy timeout so short write
/// contention resolves by waiting instead of failing.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    use {sqlx::sqlite::SqliteConnectOptions, std::str::FromStr};

    let options = SqliteConnectOptions::from_str(url)
        .map_err(StoreError::Db)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}
