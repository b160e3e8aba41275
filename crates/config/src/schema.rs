//! Config schema types (server, database, auth, chat).

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LivedeskConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub chat: ChatConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8790,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL. `mode=rwc` creates the file on first run.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:livedesk.db?mode=rwc".into(),
        }
    }
}

/// Settings handed to the external identity layer. The core never reads the
/// secret itself; it only verifies bearer tokens through the authenticator
/// interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub jwt_expires_in: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_expires_in: "24h".into(),
        }
    }
}

/// Routing and lifecycle tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Default concurrent-chat ceiling for a new agent presence row.
    pub max_chats_per_cs: u32,
    /// Message silence after which a session is abandoned.
    pub chat_idle_timeout_seconds: u64,
    /// Master switch for the auto-assignment loop.
    pub auto_assign_enabled: bool,
    /// Idle-reaper scan interval.
    pub reaper_interval_seconds: u64,
    /// Deadline for store operations inside event handlers.
    pub db_op_timeout_ms: u64,
    /// Re-queue an agent's active chats when its last connection drops.
    /// Off by default: assignments survive agent disconnects.
    pub requeue_on_agent_disconnect: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_chats_per_cs: 5,
            chat_idle_timeout_seconds: 1800,
            auto_assign_enabled: true,
            reaper_interval_seconds: 45,
            db_op_timeout_ms: 5000,
            requeue_on_agent_disconnect: false,
        }
    }
}

impl ChatConfig {
    pub fn idle_timeout_ms(&self) -> i64 {
        self.chat_idle_timeout_seconds as i64 * 1000
    }

    pub fn db_op_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.db_op_timeout_ms)
    }

    pub fn reaper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reaper_interval_seconds.max(1))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = LivedeskConfig::default();
        assert_eq!(cfg.server.port, 8790);
        assert_eq!(cfg.chat.max_chats_per_cs, 5);
        assert_eq!(cfg.chat.chat_idle_timeout_seconds, 1800);
        assert!(cfg.chat.auto_assign_enabled);
        assert!(!cfg.chat.requeue_on_agent_disconnect);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: LivedeskConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [chat]
            max_chats_per_cs = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.chat.max_chats_per_cs, 2);
        assert_eq!(cfg.chat.chat_idle_timeout_seconds, 1800);
    }
}
