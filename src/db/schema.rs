//! Database schema and record types

pub use crate::state_machine::state::{ConversationStatus, CurrentOffer, NegotiationState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    participant_a TEXT NOT NULL,
    participant_b TEXT NOT NULL,
    item_key TEXT NOT NULL DEFAULT '',
    holder_id TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    current_offer_id TEXT,
    current_offer_price INTEGER,
    current_offer_by TEXT,
    finalized BOOLEAN NOT NULL DEFAULT 0,
    finalized_price INTEGER,
    created_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL,

    UNIQUE (participant_a, participant_b, item_key),
    CHECK (participant_a < participant_b)
);

CREATE INDEX IF NOT EXISTS idx_conversations_a ON conversations(participant_a, last_activity_at DESC);
CREATE INDEX IF NOT EXISTS idx_conversations_b ON conversations(participant_b, last_activity_at DESC);

CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sequence_id INTEGER NOT NULL,
    sender_id TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    message_kind TEXT NOT NULL,
    body TEXT NOT NULL,
    price INTEGER,
    quantity INTEGER,
    responds_to TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    resolution TEXT,
    is_read BOOLEAN NOT NULL DEFAULT 0,

    UNIQUE (conversation_id, sequence_id),
    CHECK (message_kind IN ('text', 'system') OR (price IS NOT NULL AND expires_at IS NOT NULL)),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, sequence_id);
CREATE INDEX IF NOT EXISTS idx_messages_unread ON messages(receiver_id, is_read);

CREATE TABLE IF NOT EXISTS participants (
    participant_id TEXT PRIMARY KEY,
    online BOOLEAN NOT NULL DEFAULT 0,
    last_seen_at TEXT NOT NULL
);
";

/// Longest accepted participant id or item ref
pub const MAX_IDENTIFIER_LEN: usize = 64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {what}: {value:?} (expected 1-{MAX_IDENTIFIER_LEN} characters of [A-Za-z0-9-])")]
pub struct InvalidIdentifier {
    pub what: &'static str,
    pub value: String,
}

fn validate_identifier(what: &'static str, value: String) -> Result<String, InvalidIdentifier> {
    let ok = !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if ok {
        Ok(value)
    } else {
        Err(InvalidIdentifier { what, value })
    }
}

// Opaque tokens restricted to [A-Za-z0-9-] so the textual conversation id,
// which joins them with '_', can never collide across different keys.
macro_rules! opaque_identifier {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(value: impl Into<String>) -> Result<Self, InvalidIdentifier> {
                validate_identifier($what, value.into()).map(Self)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidIdentifier;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_identifier!(
    /// Authenticated participant identity supplied by the auth collaborator
    ParticipantId,
    "participant id"
);

opaque_identifier!(
    /// Reference into the item registry
    ItemRef,
    "item ref"
);

/// Amount in minor currency units
pub type Price = i64;

/// Role a participant plays in an item-scoped conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Owns the item under negotiation
    Holder,
    /// Wants the item
    Seeker,
    /// General chat, or the registry could not say
    Unknown,
}

/// Conversation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participant_a: ParticipantId,
    pub participant_b: ParticipantId,
    pub item_ref: Option<ItemRef>,
    pub holder_id: Option<ParticipantId>,
    #[serde(flatten)]
    pub state: NegotiationState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, participant: &ParticipantId) -> bool {
        &self.participant_a == participant || &self.participant_b == participant
    }

    /// The other side of the conversation, if `participant` is in it
    pub fn peer_of(&self, participant: &ParticipantId) -> Option<&ParticipantId> {
        if &self.participant_a == participant {
            Some(&self.participant_b)
        } else if &self.participant_b == participant {
            Some(&self.participant_a)
        } else {
            None
        }
    }

    pub fn role_of(&self, participant: &ParticipantId) -> Role {
        match &self.holder_id {
            Some(holder) if holder == participant => Role::Holder,
            Some(_) if self.is_participant(participant) => Role::Seeker,
            _ => Role::Unknown,
        }
    }
}

/// One row of a participant's conversation list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub peer_id: ParticipantId,
    pub role: Role,
    pub unread_count: i64,
}

/// Insert parameters for a conversation row
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub id: String,
    pub participant_a: ParticipantId,
    pub participant_b: ParticipantId,
    pub item_ref: Option<ItemRef>,
    pub holder_id: Option<ParticipantId>,
    pub created_at: DateTime<Utc>,
}

/// Message kind discriminator, stored in the `message_kind` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Offer,
    Counter,
    Deal,
    System,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Offer => "offer",
            Self::Counter => "counter",
            Self::Deal => "deal",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "offer" => Some(Self::Offer),
            "counter" => Some(Self::Counter),
            "deal" => Some(Self::Deal),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    /// Offer, Counter and Deal carry a price and a validity window
    pub fn is_priced(self) -> bool {
        matches!(self, Self::Offer | Self::Counter | Self::Deal)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed message content
///
/// Required fields per kind are enforced by the variant shape; the
/// storage layer splits this into `message_kind`, `body`, `price` and
/// `quantity` columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Offer {
        body: String,
        price: Price,
        quantity: u32,
    },
    Counter {
        body: String,
        price: Price,
        quantity: u32,
    },
    Deal {
        body: String,
        price: Price,
    },
    System {
        body: String,
    },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn system(body: impl Into<String>) -> Self {
        Self::System { body: body.into() }
    }

    pub fn offer(body: impl Into<String>, price: Price, quantity: u32) -> Self {
        Self::Offer {
            body: body.into(),
            price,
            quantity,
        }
    }

    pub fn counter(body: impl Into<String>, price: Price, quantity: u32) -> Self {
        Self::Counter {
            body: body.into(),
            price,
            quantity,
        }
    }

    pub fn deal(body: impl Into<String>, price: Price) -> Self {
        Self::Deal {
            body: body.into(),
            price,
        }
    }

    /// Same content with surrounding whitespace removed from the body
    pub fn trimmed(mut self) -> Self {
        match &mut self {
            Self::Text { body }
            | Self::Offer { body, .. }
            | Self::Counter { body, .. }
            | Self::Deal { body, .. }
            | Self::System { body } => *body = body.trim().to_string(),
        }
        self
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Offer { .. } => MessageKind::Offer,
            Self::Counter { .. } => MessageKind::Counter,
            Self::Deal { .. } => MessageKind::Deal,
            Self::System { .. } => MessageKind::System,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Self::Text { body }
            | Self::Offer { body, .. }
            | Self::Counter { body, .. }
            | Self::Deal { body, .. }
            | Self::System { body } => body,
        }
    }

    pub fn price(&self) -> Option<Price> {
        match self {
            Self::Offer { price, .. } | Self::Counter { price, .. } | Self::Deal { price, .. } => {
                Some(*price)
            }
            Self::Text { .. } | Self::System { .. } => None,
        }
    }

    pub fn quantity(&self) -> Option<u32> {
        match self {
            Self::Offer { quantity, .. } | Self::Counter { quantity, .. } => Some(*quantity),
            _ => None,
        }
    }

    /// Check the shape rules that the type cannot express:
    /// non-empty body, positive price, quantity of at least one.
    pub fn validate(&self) -> Result<(), String> {
        if self.body().trim().is_empty() {
            return Err("message body cannot be empty".to_string());
        }
        if let Some(price) = self.price() {
            if price <= 0 {
                return Err(format!("price must be positive, got {price}"));
            }
        }
        if self.quantity() == Some(0) {
            return Err("quantity must be at least 1".to_string());
        }
        Ok(())
    }

    /// Build typed content from flat fields, as stored in the `messages`
    /// table and as sent on the wire. Quantity defaults to 1.
    pub fn from_columns(
        kind: MessageKind,
        body: String,
        price: Option<Price>,
        quantity: Option<u32>,
    ) -> Result<Self, String> {
        let missing_price = || format!("{kind} message stored without a price");
        Ok(match kind {
            MessageKind::Text => Self::Text { body },
            MessageKind::System => Self::System { body },
            MessageKind::Offer => Self::Offer {
                body,
                price: price.ok_or_else(missing_price)?,
                quantity: quantity.unwrap_or(1),
            },
            MessageKind::Counter => Self::Counter {
                body,
                price: price.ok_or_else(missing_price)?,
                quantity: quantity.unwrap_or(1),
            },
            MessageKind::Deal => Self::Deal {
                body,
                price: price.ok_or_else(missing_price)?,
            },
        })
    }
}

/// Final answer recorded on a priced proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Accepted,
    Rejected,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A message ready to be appended to the log
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: ParticipantId,
    pub receiver_id: ParticipantId,
    pub content: MessageContent,
    /// The proposal this message answers (deal/rejection records, counters)
    pub responds_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    /// The record as it reads back right after insertion
    pub fn stored(self, sequence_id: i64) -> Message {
        Message {
            message_id: self.message_id,
            conversation_id: self.conversation_id,
            sequence_id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            content: self.content,
            responds_to: self.responds_to,
            created_at: self.created_at,
            expires_at: self.expires_at,
            resolution: None,
            read: false,
        }
    }
}

/// Stored message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub sequence_id: i64,
    pub sender_id: ParticipantId,
    pub receiver_id: ParticipantId,
    #[serde(flatten)]
    pub content: MessageContent,
    pub responds_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
    pub read: bool,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.content.kind()
    }

    /// Whether this message is a proposal that can be accepted, rejected or
    /// countered. Deal messages that answer another proposal are records of
    /// an outcome, not proposals.
    pub fn is_proposal(&self) -> bool {
        match self.kind() {
            MessageKind::Offer | MessageKind::Counter => true,
            MessageKind::Deal => self.responds_to.is_none(),
            MessageKind::Text | MessageKind::System => false,
        }
    }
}

/// Message annotated for display with its read-time expiry status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub is_expired: bool,
}

/// Durable presence bookkeeping for one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastSeen {
    pub participant_id: ParticipantId,
    pub online: bool,
    pub last_seen_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_reject_separator_and_empty() {
        assert!(ParticipantId::parse("user-42").is_ok());
        assert!(ParticipantId::parse("").is_err());
        assert!(ParticipantId::parse("a_b").is_err());
        assert!(ItemRef::parse("x".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
    }

    #[test]
    fn priced_content_requires_price_in_storage() {
        let err = MessageContent::from_columns(MessageKind::Offer, "hi".into(), None, Some(1));
        assert!(err.is_err());

        let text =
            MessageContent::from_columns(MessageKind::Text, "hi".into(), None, None).unwrap();
        assert_eq!(text, MessageContent::text("hi"));
    }

    #[test]
    fn validate_rejects_empty_body_and_bad_amounts() {
        assert!(MessageContent::text("   ").validate().is_err());
        assert!(MessageContent::offer("x", 0, 1).validate().is_err());
        assert!(MessageContent::counter("x", 10, 0).validate().is_err());
        assert!(MessageContent::deal("x", 10).validate().is_ok());
    }

    #[test]
    fn trimmed_strips_body_only() {
        let content = MessageContent::offer("  100k?\n", 100_000, 1).trimmed();
        assert_eq!(content, MessageContent::offer("100k?", 100_000, 1));
    }

    #[test]
    fn content_serializes_with_kind_tag() {
        let json = serde_json::to_value(MessageContent::offer("deal?", 100_000, 2)).unwrap();
        assert_eq!(json["kind"], "offer");
        assert_eq!(json["price"], 100_000);
        assert_eq!(json["quantity"], 2);
    }
}
