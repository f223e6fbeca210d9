//! API request and response types

use crate::db::{
    Conversation, ConversationSummary, ItemRef, LastSeen, Message, MessageView, ParticipantId,
    Price,
};
use crate::error::ErrorKind;
use crate::events::MessageDraft;
use crate::state_machine::OfferAction;
use serde::{Deserialize, Serialize};

/// Request to open (or fetch) a conversation with a peer
#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub peer_id: ParticipantId,
    #[serde(default)]
    pub item_ref: Option<ItemRef>,
}

/// Request to send a message to an existing conversation
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(flatten)]
    pub draft: MessageDraft,
}

/// Request to answer a proposal
#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub action: OfferAction,
    #[serde(default)]
    pub counter_price: Option<Price>,
}

/// Incremental fetch parameters
#[derive(Debug, Default, Deserialize)]
pub struct MessagesQuery {
    pub after: Option<i64>,
    pub limit: Option<u32>,
}

/// Response with a list of conversations
#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationSummary>,
}

/// Response with a single conversation
#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub conversation: Conversation,
}

/// Response with conversation and messages
#[derive(Debug, Serialize)]
pub struct ConversationWithMessagesResponse {
    pub conversation: Conversation,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Serialize)]
pub struct MessageSentResponse {
    pub conversation: Conversation,
    pub message: Message,
}

/// Response for an answered proposal
#[derive(Debug, Serialize)]
pub struct RespondResponse {
    pub conversation: Conversation,
    pub offer_id: String,
    pub action: OfferAction,
    /// Records the response appended
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct OnlineResponse {
    pub conversation_id: String,
    pub participants: Vec<ParticipantId>,
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub unread_count: i64,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub online: bool,
}

#[derive(Debug, Serialize)]
pub struct LastSeenResponse {
    pub participant_id: ParticipantId,
    /// `None` if the participant has never connected
    pub last_seen: Option<LastSeen>,
}

#[derive(Debug, Serialize)]
pub struct SuggestedPriceResponse {
    pub item_ref: ItemRef,
    pub suggested_price: Option<Price>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }
}
