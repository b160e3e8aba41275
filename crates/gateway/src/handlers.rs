//! The `(role, event)` dispatch table.
//!
//! Handlers are free functions over `(principal, payload, services)`; every
//! authorization decision is taken here at the boundary, not inside the chat
//! layer. Unknown events and unparseable payloads are logged and dropped;
//! only permitted-but-failing operations produce `system:error` frames.

use std::sync::Arc;

use {
    livedesk_chat::ChatError,
    livedesk_protocol::{Envelope, client_events, payloads},
    serde::de::DeserializeOwned,
    tracing::debug,
};

use crate::{auth::AgentIdentity, state::GatewayState};

/// Who is on the other end of the socket, fixed at upgrade time.
pub enum Principal {
    Customer,
    Cs(AgentIdentity),
    Admin(AgentIdentity),
}

/// Outcome of routing one inbound frame.
pub enum Handled {
    Ok,
    /// Event name unknown for this role, or payload malformed: drop silently.
    Dropped,
}

fn parse<T: DeserializeOwned>(envelope: &Envelope) -> Option<T> {
    match serde_json::from_value(envelope.data.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(event = %envelope.event, error = %e, "malformed payload, dropping frame");
            None
        },
    }
}

/// Route one frame. `bound` is the customer's session binding; it is set by
/// `start_chat` and token restore, and never changes for agent connections.
pub async fn handle_event(
    state: &Arc<GatewayState>,
    conn_id: &str,
    principal: &Principal,
    bound: &mut Option<String>,
    envelope: Envelope,
) -> Result<Handled, ChatError> {
    match principal {
        Principal::Customer => handle_customer_event(state, conn_id, bound, envelope).await,
        Principal::Cs(identity) => handle_cs_event(state, identity, envelope).await,
        Principal::Admin(identity) => handle_admin_event(state, conn_id, identity, envelope).await,
    }
}

async fn handle_customer_event(
    state: &Arc<GatewayState>,
    conn_id: &str,
    bound: &mut Option<String>,
    envelope: Envelope,
) -> Result<Handled, ChatError> {
    match envelope.event.as_str() {
        client_events::CUSTOMER_START_CHAT => {
            if bound.is_some() {
                return Err(ChatError::InvalidSession);
            }
            let Some(params) = parse::<payloads::StartChatParams>(&envelope) else {
                return Ok(Handled::Dropped);
            };
            let session = state.chat.start_chat(conn_id, params).await?;
            *bound = Some(session.id);
            Ok(Handled::Ok)
        },
        client_events::CUSTOMER_SEND_MESSAGE => {
            let Some(params) = parse::<payloads::SendMessageParams>(&envelope) else {
                return Ok(Handled::Dropped);
            };
            state.chat.customer_message(bound.as_deref(), params).await?;
            Ok(Handled::Ok)
        },
        client_events::CUSTOMER_TYPING => {
            let Some(params) = parse::<payloads::TypingParams>(&envelope) else {
                return Ok(Handled::Dropped);
            };
            state.chat.customer_typing(bound.as_deref(), params)?;
            Ok(Handled::Ok)
        },
        client_events::CUSTOMER_END_CHAT => {
            let Some(params) = parse::<payloads::EndChatParams>(&envelope) else {
                return Ok(Handled::Dropped);
            };
            state.chat.end_chat(bound.as_deref(), params).await?;
            Ok(Handled::Ok)
        },
        client_events::CUSTOMER_RATING => {
            let Some(params) = parse::<payloads::RatingParams>(&envelope) else {
                return Ok(Handled::Dropped);
            };
            state.chat.rate_session(bound.as_deref(), params).await?;
            Ok(Handled::Ok)
        },
        other => {
            debug!(event = %other, "unknown customer event, dropping");
            Ok(Handled::Dropped)
        },
    }
}

async fn handle_cs_event(
    state: &Arc<GatewayState>,
    identity: &AgentIdentity,
    envelope: Envelope,
) -> Result<Handled, ChatError> {
    let agent_id = identity.user_id;
    match envelope.event.as_str() {
        client_events::CS_SET_STATUS => {
            let Some(params) = parse::<payloads::SetStatusParams>(&envelope) else {
                return Ok(Handled::Dropped);
            };
            state.chat.set_status(agent_id, &params.status).await?;
            Ok(Handled::Ok)
        },
        client_events::CS_ACCEPT_CHAT => {
            let Some(params) = parse::<payloads::AcceptChatParams>(&envelope) else {
                return Ok(Handled::Dropped);
            };
            state.chat.accept_chat(agent_id, &params.session_id).await?;
            Ok(Handled::Ok)
        },
        client_events::CS_SEND_MESSAGE => {
            let Some(params) = parse::<payloads::SendMessageParams>(&envelope) else {
                return Ok(Handled::Dropped);
            };
            state.chat.agent_message(agent_id, params).await?;
            Ok(Handled::Ok)
        },
        client_events::CS_TYPING => {
            let Some(params) = parse::<payloads::TypingParams>(&envelope) else {
                return Ok(Handled::Dropped);
            };
            state.chat.agent_typing(agent_id, params).await?;
            Ok(Handled::Ok)
        },
        client_events::CS_RESOLVE_CHAT => {
            let Some(params) = parse::<payloads::ResolveChatParams>(&envelope) else {
                return Ok(Handled::Dropped);
            };
            state.chat.resolve_chat(agent_id, params).await?;
            Ok(Handled::Ok)
        },
        client_events::CS_TRANSFER_CHAT => {
            let Some(params) = parse::<payloads::TransferChatParams>(&envelope) else {
                return Ok(Handled::Dropped);
            };
            state.chat.transfer_chat(agent_id, params).await?;
            Ok(Handled::Ok)
        },
        other => {
            debug!(event = %other, agent_id, "unknown cs event, dropping");
            Ok(Handled::Dropped)
        },
    }
}

async fn handle_admin_event(
    state: &Arc<GatewayState>,
    conn_id: &str,
    identity: &AgentIdentity,
    envelope: Envelope,
) -> Result<Handled, ChatError> {
    match envelope.event.as_str() {
        client_events::ADMIN_SUBSCRIBE_STATS => {
            state.chat.stats_snapshot(conn_id).await?;
            Ok(Handled::Ok)
        },
        client_events::ADMIN_FORCE_ASSIGN => {
            let Some(params) = parse::<payloads::ForceAssignParams>(&envelope) else {
                return Ok(Handled::Dropped);
            };
            state
                .chat
                .force_assign(identity.user_id, &params.session_id, params.cs_id)
                .await?;
            Ok(Handled::Ok)
        },
        other => {
            debug!(event = %other, admin_id = identity.user_id, "unknown admin event, dropping");
            Ok(Handled::Dropped)
        },
    }
}
