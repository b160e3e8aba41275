//! Users, canned responses and the activity log. CRUD screens live outside
//! the core; these are the read/seed surfaces the broker itself needs.

use livedesk_common::now_ms;

use crate::{
    ChatStore, Result,
    types::{ActivityEntry, CannedResponse, User},
};

type UserRow = (i64, String, String, String, i64);

fn user_from_row(row: UserRow) -> User {
    User {
        id: row.0,
        name: row.1,
        email: row.2,
        role: row.3,
        created_at: row.4,
    }
}

impl ChatStore {
    /// Insert a staff user. `token_digest` is the SHA-256 hex of the bearer
    /// token issued by the external identity layer.
    pub async fn insert_user(
        &self,
        name: &str,
        email: &str,
        role: &str,
        token_digest: Option<&str>,
    ) -> Result<i64> {
        let res = sqlx::query(
            "INSERT INTO users (name, email, role, token_digest, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(email)
        .bind(role)
        .bind(token_digest)
        .bind(now_ms())
        .execute(self.pool())
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn user_by_id(&self, id: i64) -> Result<Option<User>> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, name, email, role, created_at FROM users WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(user_from_row))
    }

    pub async fn user_by_token_digest(&self, digest: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, name, email, role, created_at FROM users WHERE token_digest = ?",
        )
        .bind(digest)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(user_from_row))
    }

    pub async fn canned_responses(&self) -> Result<Vec<CannedResponse>> {
        let rows: Vec<(i64, String, String, Option<i64>, i64)> = sqlx::query_as(
            "SELECT id, title, content, created_by, created_at
             FROM canned_responses ORDER BY title",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| CannedResponse {
                id: r.0,
                title: r.1,
                content: r.2,
                created_by: r.3,
                created_at: r.4,
            })
            .collect())
    }

    pub async fn insert_canned_response(
        &self,
        title: &str,
        content: &str,
        created_by: Option<i64>,
    ) -> Result<i64> {
        let res = sqlx::query(
            "INSERT INTO canned_responses (title, content, created_by, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(title)
        .bind(content)
        .bind(created_by)
        .bind(now_ms())
        .execute(self.pool())
        .await?;
        Ok(res.last_insert_rowid())
    }

    /// Append-only audit trail; failures here must never fail the operation
    /// being audited, so callers log and continue.
    pub async fn log_activity(
        &self,
        user_id: Option<i64>,
        action: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO activity_log (user_id, action, detail, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(action)
        .bind(detail)
        .bind(now_ms())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn recent_activity(&self, limit: i64) -> Result<Vec<ActivityEntry>> {
        let rows: Vec<(i64, Option<i64>, String, Option<String>, i64)> = sqlx::query_as(
            "SELECT id, user_id, action, detail, created_at
             FROM activity_log ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ActivityEntry {
                id: r.0,
                user_id: r.1,
                action: r.2,
                detail: r.3,
                created_at: r.4,
            })
            .collect())
    }
}
