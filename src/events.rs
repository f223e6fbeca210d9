//! Wire events exchanged over a participant's socket

use crate::db::{
    Conversation, ItemRef, Message, MessageContent, MessageKind, ParticipantId, Price,
};
use crate::error::{ChatError, ErrorKind};
use crate::state_machine::OfferAction;
use serde::{Deserialize, Serialize};

/// Inbound events from a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Join {
        conversation_id: String,
    },
    Leave {
        conversation_id: String,
    },
    /// Either `conversation_id`, or `receiver_id` (plus optional
    /// `item_ref`) to open the conversation on first contact
    SendMessage {
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        receiver_id: Option<ParticipantId>,
        #[serde(default)]
        item_ref: Option<ItemRef>,
        #[serde(flatten)]
        draft: MessageDraft,
    },
    RespondToOffer {
        message_id: String,
        action: OfferAction,
        #[serde(default)]
        counter_price: Option<Price>,
    },
    Typing {
        conversation_id: String,
        is_typing: bool,
    },
    GetOnlineUsers {
        conversation_id: String,
    },
    MarkRead {
        conversation_id: String,
    },
}

/// Flat message fields as clients send them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    #[serde(default = "default_kind")]
    pub kind: MessageKind,
    pub body: String,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub quantity: Option<u32>,
}

fn default_kind() -> MessageKind {
    MessageKind::Text
}

impl MessageDraft {
    pub fn into_content(self) -> Result<MessageContent, ChatError> {
        MessageContent::from_columns(self.kind, self.body, self.price, self.quantity)
            .map_err(ChatError::InvalidMessage)
    }
}

/// Outbound events to a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionAck {
        participant_id: ParticipantId,
    },
    Joined {
        conversation: Conversation,
        online: Vec<ParticipantId>,
    },
    ParticipantOnline {
        conversation_id: String,
        participant_id: ParticipantId,
    },
    ParticipantOffline {
        conversation_id: String,
        participant_id: ParticipantId,
    },
    NewMessage {
        message: Message,
        conversation: Conversation,
    },
    MessageSent {
        conversation_id: String,
        message_id: String,
    },
    OfferResponse {
        conversation_id: String,
        message_id: String,
        action: OfferAction,
        responder_id: ParticipantId,
        conversation: Conversation,
    },
    ResponseSent {
        message_id: String,
        action: OfferAction,
    },
    Typing {
        conversation_id: String,
        participant_id: ParticipantId,
        is_typing: bool,
    },
    OnlineUsers {
        conversation_id: String,
        participants: Vec<ParticipantId>,
    },
    Error {
        kind: ErrorKind,
        detail: String,
    },
}

impl From<&ChatError> for ServerEvent {
    fn from(e: &ChatError) -> Self {
        Self::Error {
            kind: e.kind(),
            detail: e.to_string(),
        }
    }
}
