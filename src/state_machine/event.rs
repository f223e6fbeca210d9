//! Events that can occur in a negotiation

use crate::db::{Message, MessageContent, ParticipantId, Price};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    /// A participant sent a message of any kind
    MessagePosted {
        message_id: String,
        sender: ParticipantId,
        content: MessageContent,
    },

    /// A participant answered a priced proposal
    OfferResponse {
        responder: ParticipantId,
        /// The stored proposal being answered
        offer: Message,
        response: Response,
    },
}

/// What the responder decided, with anything the decision needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Accept {
        record_id: String,
    },
    Reject {
        record_id: String,
    },
    Counter {
        /// Id for the new Offer message
        message_id: String,
        price: Price,
    },
}

impl Response {
    pub fn action(&self) -> OfferAction {
        match self {
            Self::Accept { .. } => OfferAction::Accept,
            Self::Reject { .. } => OfferAction::Reject,
            Self::Counter { .. } => OfferAction::Counter,
        }
    }
}

/// Wire-level name of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferAction {
    Accept,
    Reject,
    Counter,
}

impl fmt::Display for OfferAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Counter => "counter",
        })
    }
}
