//! Caller-facing error taxonomy

use crate::db::{DbError, InvalidIdentifier};
use crate::state_machine::TransitionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors surfaced to participants
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("cannot respond to your own offer")]
    SelfResponseNotAllowed,
    #[error("offer {0} has expired")]
    OfferExpired(String),
    #[error("offer {0} has already been resolved")]
    OfferAlreadyResolved(String),
    #[error("offer {0} is no longer the current offer")]
    OfferSuperseded(String),
    #[error("conversation is finalized")]
    ConversationFinalized,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Stable, serializable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AccessDenied,
    SelfResponseNotAllowed,
    OfferExpired,
    OfferAlreadyResolved,
    OfferSuperseded,
    ConversationFinalized,
    InvalidMessage,
    ConversationNotFound,
    MessageNotFound,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessDenied => "access_denied",
            Self::SelfResponseNotAllowed => "self_response_not_allowed",
            Self::OfferExpired => "offer_expired",
            Self::OfferAlreadyResolved => "offer_already_resolved",
            Self::OfferSuperseded => "offer_superseded",
            Self::ConversationFinalized => "conversation_finalized",
            Self::InvalidMessage => "invalid_message",
            Self::ConversationNotFound => "conversation_not_found",
            Self::MessageNotFound => "message_not_found",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::SelfResponseNotAllowed => ErrorKind::SelfResponseNotAllowed,
            Self::OfferExpired(_) => ErrorKind::OfferExpired,
            Self::OfferAlreadyResolved(_) => ErrorKind::OfferAlreadyResolved,
            Self::OfferSuperseded(_) => ErrorKind::OfferSuperseded,
            Self::ConversationFinalized => ErrorKind::ConversationFinalized,
            Self::InvalidMessage(_) => ErrorKind::InvalidMessage,
            Self::ConversationNotFound(_) => ErrorKind::ConversationNotFound,
            Self::MessageNotFound(_) => ErrorKind::MessageNotFound,
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }

    pub fn access_denied(participant: impl fmt::Display, conversation_id: &str) -> Self {
        Self::AccessDenied(format!("{participant} is not a participant in {conversation_id}"))
    }
}

impl From<DbError> for ChatError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ConversationNotFound(id) => Self::ConversationNotFound(id),
            DbError::MessageNotFound(id) => Self::MessageNotFound(id),
            DbError::OfferAlreadyResolved(id) => Self::OfferAlreadyResolved(id),
            other @ (DbError::Sqlite(_) | DbError::LockPoisoned) => {
                Self::Internal(other.to_string())
            }
        }
    }
}

impl From<TransitionError> for ChatError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::NotParticipant(p) => {
                Self::AccessDenied(format!("{p} is not a participant in this conversation"))
            }
            TransitionError::SelfResponseNotAllowed => Self::SelfResponseNotAllowed,
            TransitionError::OfferExpired(id) => Self::OfferExpired(id),
            TransitionError::OfferAlreadyResolved(id) => Self::OfferAlreadyResolved(id),
            TransitionError::OfferSuperseded(id) => Self::OfferSuperseded(id),
            TransitionError::Finalized => Self::ConversationFinalized,
            e @ TransitionError::NotAnOffer(_) => Self::InvalidMessage(e.to_string()),
            TransitionError::InvalidMessage(detail) => Self::InvalidMessage(detail),
        }
    }
}

impl From<InvalidIdentifier> for ChatError {
    fn from(e: InvalidIdentifier) -> Self {
        Self::InvalidMessage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::SelfResponseNotAllowed).unwrap();
        assert_eq!(json, "\"self_response_not_allowed\"");
        assert_eq!(ErrorKind::InternalError.to_string(), "internal_error");
    }

    #[test]
    fn storage_errors_keep_not_found_kinds() {
        let e: ChatError = DbError::MessageNotFound("m1".into()).into();
        assert_eq!(e.kind(), ErrorKind::MessageNotFound);

        let e: ChatError = DbError::LockPoisoned.into();
        assert_eq!(e.kind(), ErrorKind::InternalError);

        let e: ChatError = DbError::OfferAlreadyResolved("o1".into()).into();
        assert_eq!(e.kind(), ErrorKind::OfferAlreadyResolved);
    }

    #[test]
    fn transition_errors_map_to_taxonomy() {
        let cases = [
            (TransitionError::Finalized, ErrorKind::ConversationFinalized),
            (TransitionError::NotAnOffer("m".into()), ErrorKind::InvalidMessage),
            (TransitionError::OfferSuperseded("o".into()), ErrorKind::OfferSuperseded),
            (TransitionError::SelfResponseNotAllowed, ErrorKind::SelfResponseNotAllowed),
        ];
        for (err, kind) in cases {
            assert_eq!(ChatError::from(err).kind(), kind);
        }
    }
}
