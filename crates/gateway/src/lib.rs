//! Connection gateway: WebSocket upgrade endpoints, the role/event dispatch
//! table, and the REST support surface for reconnect and history.

pub mod auth;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod state;
pub mod ws;

pub use {
    auth::{AgentIdentity, AgentRole, Authenticator, StoreAuthenticator},
    server::{build_app, start},
    state::GatewayState,
};
