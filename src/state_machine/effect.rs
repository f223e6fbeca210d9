//! Effects produced by state transitions

use super::event::OfferAction;
use crate::db::{NewMessage, ParticipantId, Resolution};

/// Effects to be executed after state transition
///
/// The executor applies every storage effect of one transition inside a
/// single transaction; notifications are delivered only after commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Append a message to the log
    PersistMessage(NewMessage),

    /// Record the answer on a proposal, only if it is still unresolved
    ResolveOffer {
        message_id: String,
        resolution: Resolution,
    },

    /// Persist the new state
    PersistState,

    /// Tell the room how a proposal was answered
    NotifyOfferResponse {
        offer_id: String,
        action: OfferAction,
        responder: ParticipantId,
    },
}

impl Effect {
    pub fn persisted_message(&self) -> Option<&NewMessage> {
        match self {
            Effect::PersistMessage(message) => Some(message),
            _ => None,
        }
    }
}
