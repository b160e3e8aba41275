use thiserror::Error;

/// Store-level failures. The contract violations map 1:1 onto the wire error
/// codes surfaced by the chat layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("session not found")]
    SessionNotFound,

    #[error("session is no longer waiting")]
    AlreadyAssigned,

    #[error("agent is at capacity")]
    AtCapacity,

    #[error("agent is offline")]
    NotOnline,

    #[error("agent does not own this session")]
    NotAssigned,

    #[error("transfer target is not online")]
    TargetNotOnline,

    #[error("transfer target is at capacity")]
    TargetAtCapacity,

    #[error("session is already closed")]
    TerminalSession,

    #[error("session is not resolved")]
    NotResolved,

    #[error("rating must be between 1 and 5")]
    InvalidRating,

    #[error("unknown agent")]
    AgentNotFound,

    #[error("corrupt row: {0}")]
    Decode(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}
