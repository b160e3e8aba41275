//! Configuration schema and loading for the livedesk broker.
//!
//! Config is discovered as `livedesk.{toml,yaml,yml,json}` in the working
//! directory first, then `~/.config/livedesk/`. String values may reference
//! environment variables as `${VAR}` or `${VAR:-fallback}`.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{discover_and_load, load_config},
    schema::{AuthConfig, ChatConfig, DatabaseConfig, LivedeskConfig, ServerConfig},
};
