//! Negotiation state types

use crate::db::{ParticipantId, Price};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Conversation-level negotiation status
///
/// `Negotiating` is re-entrant (repeated counters) and `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    Negotiating,
    DealPending,
    Completed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Negotiating => "negotiating",
            Self::DealPending => "deal_pending",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "negotiating" => Some(Self::Negotiating),
            "deal_pending" => Some(Self::DealPending),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The live proposal a conversation is waiting on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentOffer {
    pub message_id: String,
    pub price: Price,
    pub proposer_id: ParticipantId,
}

/// Derived negotiation state of one conversation
///
/// This is a cache over the message log: folding the log with
/// [`super::replay`] always reproduces it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NegotiationState {
    pub status: ConversationStatus,
    pub current_offer: Option<CurrentOffer>,
    pub finalized: bool,
    pub finalized_price: Option<Price>,
}

impl NegotiationState {
    pub fn is_current_offer(&self, message_id: &str) -> bool {
        self.current_offer
            .as_ref()
            .is_some_and(|offer| offer.message_id == message_id)
    }
}

/// Inputs to a transition that are not part of the state itself
#[derive(Debug, Clone)]
pub struct ConvContext {
    pub conversation_id: String,
    pub participant_a: ParticipantId,
    pub participant_b: ParticipantId,
    /// Clock reading taken once for the whole transition
    pub now: DateTime<Utc>,
}

impl ConvContext {
    pub fn new(
        conversation_id: impl Into<String>,
        participant_a: ParticipantId,
        participant_b: ParticipantId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            participant_a,
            participant_b,
            now,
        }
    }

    pub fn peer_of(&self, participant: &ParticipantId) -> Option<&ParticipantId> {
        if &self.participant_a == participant {
            Some(&self.participant_b)
        } else if &self.participant_b == participant {
            Some(&self.participant_a)
        } else {
            None
        }
    }
}
