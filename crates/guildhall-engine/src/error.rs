use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::sink::SinkError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid time: {0}")]
    InvalidTime(String),

    #[error("{0} is unreasonably far in the future")]
    UnreasonablyFar(DateTime<Utc>),

    #[error("{0} not found")]
    NotFound(String),

    #[error("treasure {0} has already been redeemed")]
    AlreadyRedeemed(String),

    #[error("treasure code {0} is already taken")]
    DuplicateCode(String),

    #[error("insufficient funds: balance is {balance}, {needed} needed")]
    InsufficientFunds { balance: i64, needed: i64 },

    #[error("poll {0} is closed")]
    PollClosed(Uuid),

    #[error("matchmaking #{0} is closed")]
    EventClosed(i64),

    #[error("unauthorised: {0}")]
    Unauthorised(String),

    #[error("message sink unavailable: {0}")]
    ExternalTransient(String),

    #[error("message sink refused: {0}")]
    ExternalPermanent(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Error kinds as seen by callers; several variants share one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    AlreadyRedeemed,
    DuplicateCode,
    InsufficientFunds,
    PollClosed,
    EventClosed,
    Unauthorised,
    ExternalTransient,
    ExternalPermanent,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::AlreadyRedeemed => "already_redeemed",
            Self::DuplicateCode => "duplicate_code",
            Self::InsufficientFunds => "insufficient_funds",
            Self::PollClosed => "poll_closed",
            Self::EventClosed => "event_closed",
            Self::Unauthorised => "unauthorised",
            Self::ExternalTransient => "external_transient",
            Self::ExternalPermanent => "external_permanent",
            Self::Internal => "internal",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) | Self::InvalidTime(_) | Self::UnreasonablyFar(_) => {
                ErrorKind::InvalidInput
            }
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyRedeemed(_) => ErrorKind::AlreadyRedeemed,
            Self::DuplicateCode(_) => ErrorKind::DuplicateCode,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::PollClosed(_) => ErrorKind::PollClosed,
            Self::EventClosed(_) => ErrorKind::EventClosed,
            Self::Unauthorised(_) => ErrorKind::Unauthorised,
            Self::ExternalTransient(_) => ErrorKind::ExternalTransient,
            Self::ExternalPermanent(_) => ErrorKind::ExternalPermanent,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<SinkError> for Error {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::Transient(msg) => Self::ExternalTransient(msg),
            SinkError::Permanent(msg) => Self::ExternalPermanent(msg),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(anyhow::anyhow!("blocking task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_errors_are_invalid_input() {
        assert_eq!(
            Error::InvalidTime("past".into()).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            Error::UnreasonablyFar(Utc::now()).kind(),
            ErrorKind::InvalidInput
        );
        let sink: Error = SinkError::Permanent("channel deleted".into()).into();
        assert_eq!(sink.kind(), ErrorKind::ExternalPermanent);
    }
}
