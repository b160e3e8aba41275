use {livedesk_protocol::error_codes, livedesk_store::StoreError, thiserror::Error};

/// Handler failures, each carrying a stable wire code for `system:error`.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("missing or invalid credential")]
    Unauthorized,

    #[error("session does not belong to this connection")]
    InvalidSession,

    #[error("session not found")]
    SessionNotFound,

    #[error("message is empty")]
    EmptyMessage,

    #[error("chat was already claimed")]
    AlreadyAssigned,

    #[error("accepting would exceed your chat limit")]
    AtCapacity,

    #[error("set your status to online first")]
    NotOnline,

    #[error("you are not assigned to this chat")]
    NotAssigned,

    #[error("transfer target is not online")]
    TargetNotOnline,

    #[error("transfer target is at capacity")]
    TargetAtCapacity,

    #[error("rating must be between 1 and 5")]
    InvalidRating,

    #[error("could not start chat: {0}")]
    InitFailed(String),

    #[error("could not send message: {0}")]
    SendFailed(String),

    #[error("could not resolve chat: {0}")]
    ResolveFailed(String),

    #[error("could not transfer chat: {0}")]
    TransferFailed(String),

    #[error("could not save rating: {0}")]
    RatingFailed(String),

    #[error("internal error: {0}")]
    Server(String),
}

impl ChatError {
    /// The stable identifier surfaced in `system:error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => error_codes::UNAUTHORIZED,
            Self::InvalidSession => error_codes::INVALID_SESSION,
            Self::SessionNotFound => error_codes::SESSION_NOT_FOUND,
            Self::EmptyMessage => error_codes::EMPTY_MESSAGE,
            Self::AlreadyAssigned => error_codes::ALREADY_ASSIGNED,
            Self::AtCapacity => error_codes::AT_CAPACITY,
            Self::NotOnline => error_codes::NOT_ONLINE,
            Self::NotAssigned => error_codes::NOT_ASSIGNED,
            Self::TargetNotOnline => error_codes::TARGET_NOT_ONLINE,
            Self::TargetAtCapacity => error_codes::TARGET_AT_CAPACITY,
            Self::InvalidRating => error_codes::INVALID_RATING,
            Self::InitFailed(_) => error_codes::INIT_FAILED,
            Self::SendFailed(_) => error_codes::SEND_FAILED,
            Self::ResolveFailed(_) => error_codes::RESOLVE_FAILED,
            Self::TransferFailed(_) => error_codes::TRANSFER_FAILED,
            Self::RatingFailed(_) => error_codes::RATING_FAILED,
            Self::Server(_) => error_codes::SERVER_ERROR,
        }
    }
}

/// Which `*_FAILED` bucket a store-level fault falls into, per operation.
#[derive(Debug, Clone, Copy)]
pub enum FailureKind {
    Init,
    Send,
    Resolve,
    Transfer,
    Rating,
    Other,
}

/// Contract violations keep their specific code; database faults collapse
/// into the operation's `*_FAILED` code.
pub fn map_store_error(kind: FailureKind, err: StoreError) -> ChatError {
    match err {
        StoreError::SessionNotFound => ChatError::SessionNotFound,
        StoreError::AlreadyAssigned => ChatError::AlreadyAssigned,
        StoreError::AtCapacity => ChatError::AtCapacity,
        StoreError::NotOnline | StoreError::AgentNotFound => ChatError::NotOnline,
        StoreError::NotAssigned => ChatError::NotAssigned,
        StoreError::TargetNotOnline => ChatError::TargetNotOnline,
        StoreError::TargetAtCapacity => ChatError::TargetAtCapacity,
        StoreError::InvalidRating => ChatError::InvalidRating,
        StoreError::NotResolved => ChatError::RatingFailed("session is not resolved".into()),
        StoreError::TerminalSession => ChatError::SendFailed("chat is already closed".into()),
        StoreError::Db(e) => match kind {
            FailureKind::Init => ChatError::InitFailed(e.to_string()),
            FailureKind::Send => ChatError::SendFailed(e.to_string()),
            FailureKind::Resolve => ChatError::ResolveFailed(e.to_string()),
            FailureKind::Transfer => ChatError::TransferFailed(e.to_string()),
            FailureKind::Rating => ChatError::RatingFailed(e.to_string()),
            FailureKind::Other => ChatError::Server(e.to_string()),
        },
        StoreError::Decode(e) => ChatError::Server(e),
    }
}
