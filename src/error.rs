//! Crate-level error taxonomy.
//!
//! Two things callers might expect here are deliberately absent: an idempotent
//! re-join surfaces as [`crate::rooms::JoinOutcome::AlreadyMember`] (a success,
//! not a failure), and a send whose echo never arrives becomes an
//! `Unconfirmed` timeline entry on the controller, never an error.

use thiserror::Error;
use uuid::Uuid;

/// Everything that can go wrong inside the chat core.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Membership or authorization failure: the user may not act in this room.
    #[error("no active membership for this room")]
    Forbidden,

    /// The supplied invite code matches no private room.
    #[error("invite code does not match any salon")]
    InvalidCode,

    /// Content was blank after trimming.
    #[error("content is empty")]
    EmptyContent,

    /// Content exceeded the server-enforced character cap.
    #[error("content is {len} characters, cap is {max}")]
    TooLong { len: usize, max: usize },

    /// Room id that matches no stored room.
    #[error("room {0} does not exist")]
    RoomNotFound(Uuid),

    /// The realtime channel is gone: hub shut down or handle dead.
    #[error("realtime channel disconnected")]
    TransportDisconnected,

    /// Backing store failure.
    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Socket-level failure in the server.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Bad configuration file or value.
    #[error("config: {0}")]
    Config(String),

    /// Redis bridge failure.
    #[cfg(feature = "redis-relay")]
    #[error("relay: {0}")]
    Relay(#[from] redis::RedisError),
}

impl ChatError {
    /// Stable machine-readable code, used in wire error frames and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Forbidden => "forbidden",
            ChatError::InvalidCode => "invalid_code",
            ChatError::EmptyContent => "empty_content",
            ChatError::TooLong { .. } => "too_long",
            ChatError::RoomNotFound(_) => "room_not_found",
            ChatError::TransportDisconnected => "transport_disconnected",
            ChatError::Storage(_) => "storage",
            ChatError::Io(_) => "io",
            ChatError::Config(_) => "config",
            #[cfg(feature = "redis-relay")]
            ChatError::Relay(_) => "relay",
        }
    }

    /// Whether the error is the caller's fault (validation / access), as
    /// opposed to an infrastructure failure.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ChatError::Forbidden
                | ChatError::InvalidCode
                | ChatError::EmptyContent
                | ChatError::TooLong { .. }
                | ChatError::RoomNotFound(_)
        )
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
