//! The slice of the identity layer the core consumes. Token issuance and
//! password handling live elsewhere; the gateway only asks "whose bearer
//! token is this?".

use {
    async_trait::async_trait,
    livedesk_common::to_hex,
    livedesk_store::ChatStore,
    serde::Serialize,
    sha2::{Digest, Sha256},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Cs,
    Admin,
}

impl AgentRole {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "admin" => Self::Admin,
            _ => Self::Cs,
        }
    }
}

/// A verified staff identity bound to a connection for its lifetime.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub user_id: i64,
    pub name: String,
    pub role: AgentRole,
}

/// `Authenticate(token) → Principal | Invalid`, as seen from the core.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<AgentIdentity>;
}

/// Verifies bearer tokens against the users table by SHA-256 digest, so raw
/// tokens are never stored.
pub struct StoreAuthenticator {
    store: ChatStore,
}

impl StoreAuthenticator {
    pub fn new(store: ChatStore) -> Self {
        Self { store }
    }

    pub fn digest(token: &str) -> String {
        to_hex(&Sha256::digest(token.as_bytes()))
    }
}

#[async_trait]
impl Authenticator for StoreAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<AgentIdentity> {
        if token.is_empty() {
            return None;
        }
        let user = self
            .store
            .user_by_token_digest(&Self::digest(token))
            .await
            .ok()??;
        Some(AgentIdentity {
            user_id: user.id,
            name: user.name,
            role: AgentRole::parse(&user.role),
        })
    }
}
