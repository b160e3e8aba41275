//! The session state machine.
//!
//! `ChatService` owns every lifecycle transition: it validates the acting
//! principal, runs the store transaction, syncs the presence cache, and
//! publishes the resulting events through the broker. The gateway's dispatch
//! table calls into this crate; nothing here knows about sockets.

pub mod error;
pub mod service;

pub use {
    error::ChatError,
    service::{AgentConnection, ChatService},
};
