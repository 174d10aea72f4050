use thiserror::Error;

use tandem_kv::KvError;

/// How a failure should be surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request; never retried.
    Validation,
    /// User-actionable conflict (already queued, already left, blocked).
    Conflict,
    /// Caller may not act on this resource.
    Forbidden,
    NotFound,
    /// Store failure; a fallback or requeue may already have run.
    Transient,
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("user is already waiting in a matching queue")]
    AlreadyInQueue,

    #[error("user already left this room and cannot re-enter")]
    ReentryForbidden,

    #[error("user and a room participant have blocked each other")]
    Blocked,

    #[error("room is full")]
    RoomFull,

    #[error("user is not a participant of this room")]
    NotParticipant,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("key-value store failure: {0}")]
    Kv(#[from] KvError),

    #[error("persistent store failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::AlreadyInQueue | Self::ReentryForbidden | Self::Blocked | Self::RoomFull => {
                ErrorKind::Conflict
            }
            Self::NotParticipant => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Kv(_) | Self::Store(_) => ErrorKind::Transient,
        }
    }

    /// Stable machine-readable code for acks and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::AlreadyInQueue => "ALREADY_IN_QUEUE",
            Self::ReentryForbidden => "REENTRY_FORBIDDEN",
            Self::Blocked => "BLOCKED",
            Self::RoomFull => "ROOM_FULL",
            Self::NotParticipant => "NOT_PARTICIPANT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Kv(_) | Self::Store(_) => "UNAVAILABLE",
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
