//! Negotiation engine
//!
//! Composes the conversation directory, the message log and the presence
//! hub, and routes participant events to them. Durable operations complete
//! before anything is broadcast, so a room never hears about a message that
//! was rolled back.

pub mod traits;

#[cfg(test)]
pub mod testing;

pub use traits::*;

use crate::db::{
    Conversation, ConversationSummary, Database, ItemRef, LastSeen, MessageContent, MessageView,
    ParticipantId, Price,
};
use crate::directory::ConversationDirectory;
use crate::error::{ChatError, ChatResult};
use crate::events::{ClientEvent, ServerEvent};
use crate::message_log::{Appended, MessageLog, Responded};
use crate::presence::{ConnectionId, PresenceHub};
use crate::state_machine::OfferAction;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Minor currency units per point of comparability score
pub const PRICE_PER_SCORE_POINT: f64 = 1000.0;

/// Where a new message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    /// An existing conversation
    Conversation(String),
    /// The conversation with `peer` about `item_ref`, created on first contact
    Peer {
        peer: ParticipantId,
        item_ref: Option<ItemRef>,
    },
}

pub struct NegotiationEngine {
    db: Database,
    directory: ConversationDirectory,
    log: MessageLog,
    presence: PresenceHub,
    valuation: Arc<dyn ValuationService>,
    clock: Arc<dyn Clock>,
}

impl NegotiationEngine {
    pub fn new(
        db: Database,
        registry: Arc<dyn ItemRegistry>,
        valuation: Arc<dyn ValuationService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            directory: ConversationDirectory::new(db.clone(), registry, clock.clone()),
            log: MessageLog::new(db.clone(), clock.clone()),
            presence: PresenceHub::new(),
            db,
            valuation,
            clock,
        }
    }

    pub fn presence(&self) -> &PresenceHub {
        &self.presence
    }

    // ==================== Connection lifecycle ====================

    /// Register a participant's socket and acknowledge it
    pub fn connect(
        &self,
        participant: &ParticipantId,
    ) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (connection_id, receiver) = self.presence.connect(participant);
        if let Err(e) = self.db.touch_participant(participant, true, self.clock.now()) {
            tracing::warn!(
                participant = %participant,
                error = %e,
                "Failed to record last seen on connect"
            );
        }
        self.presence.send_to(
            participant,
            ServerEvent::ConnectionAck {
                participant_id: participant.clone(),
            },
        );
        tracing::info!(participant = %participant, "Participant connected");
        (connection_id, receiver)
    }

    /// Presence cleanup and the durable last-seen write are independent;
    /// neither failing stops the other.
    pub fn disconnect(&self, participant: &ParticipantId, connection_id: ConnectionId) {
        let Some(rooms) = self.presence.disconnect(participant, connection_id) else {
            tracing::debug!(participant = %participant, "Stale connection closed");
            return;
        };

        for conversation_id in &rooms {
            self.presence.broadcast(
                conversation_id,
                &ServerEvent::ParticipantOffline {
                    conversation_id: conversation_id.clone(),
                    participant_id: participant.clone(),
                },
                Some(participant),
            );
        }

        if let Err(e) = self.db.touch_participant(participant, false, self.clock.now()) {
            tracing::warn!(
                participant = %participant,
                error = %e,
                "Failed to record last seen on disconnect"
            );
        }
        tracing::info!(participant = %participant, rooms = rooms.len(), "Participant disconnected");
    }

    // ==================== Rooms ====================

    /// Join a conversation's live room. Idempotent; only a first join is
    /// announced to the room.
    pub fn join(
        &self,
        conversation_id: &str,
        participant: &ParticipantId,
    ) -> ChatResult<Conversation> {
        let conversation = self.directory.access_control(conversation_id, participant)?;

        if let Err(e) = self.log.mark_read(conversation_id, participant) {
            tracing::warn!(
                conv_id = %conversation_id,
                participant = %participant,
                error = %e,
                "Failed to mark messages read on join"
            );
        }

        if self.presence.join(conversation_id, participant, self.clock.now()) {
            self.presence.broadcast(
                conversation_id,
                &ServerEvent::ParticipantOnline {
                    conversation_id: conversation_id.to_string(),
                    participant_id: participant.clone(),
                },
                Some(participant),
            );
            tracing::debug!(conv_id = %conversation_id, participant = %participant, "Joined room");
        }
        Ok(conversation)
    }

    /// Leave a conversation's live room. Outsiders are refused like any other
    /// room operation.
    pub fn leave(&self, conversation_id: &str, participant: &ParticipantId) -> ChatResult<()> {
        self.directory.access_control(conversation_id, participant)?;
        if self.presence.leave(conversation_id, participant) {
            self.presence.broadcast(
                conversation_id,
                &ServerEvent::ParticipantOffline {
                    conversation_id: conversation_id.to_string(),
                    participant_id: participant.clone(),
                },
                Some(participant),
            );
            tracing::debug!(conv_id = %conversation_id, participant = %participant, "Left room");
        }
        Ok(())
    }

    /// Ephemeral typing indicator for the other joined members
    pub fn typing(
        &self,
        conversation_id: &str,
        participant: &ParticipantId,
        is_typing: bool,
    ) -> ChatResult<()> {
        if !self.presence.is_joined(conversation_id, participant) {
            self.directory.access_control(conversation_id, participant)?;
        }
        self.presence.broadcast(
            conversation_id,
            &ServerEvent::Typing {
                conversation_id: conversation_id.to_string(),
                participant_id: participant.clone(),
                is_typing,
            },
            Some(participant),
        );
        Ok(())
    }

    pub fn list_online(
        &self,
        conversation_id: &str,
        requester: &ParticipantId,
    ) -> ChatResult<Vec<ParticipantId>> {
        self.directory.access_control(conversation_id, requester)?;
        Ok(self.presence.list_online(conversation_id))
    }

    // ==================== Negotiation ====================

    pub async fn get_or_create(
        &self,
        initiator: &ParticipantId,
        peer: &ParticipantId,
        item_ref: Option<&ItemRef>,
    ) -> ChatResult<Conversation> {
        self.directory.get_or_create(initiator, peer, item_ref).await
    }

    /// Append a message and fan it out to the room, sender included
    pub async fn send_message(
        &self,
        sender: &ParticipantId,
        target: MessageTarget,
        content: MessageContent,
    ) -> ChatResult<Appended> {
        let conversation_id = match target {
            MessageTarget::Conversation(id) => id,
            MessageTarget::Peer { peer, item_ref } => {
                self.directory
                    .get_or_create(sender, &peer, item_ref.as_ref())
                    .await?
                    .id
            }
        };

        let appended = self.log.append(&conversation_id, sender, content)?;
        self.presence.broadcast(
            &conversation_id,
            &ServerEvent::NewMessage {
                message: appended.message.clone(),
                conversation: appended.conversation.clone(),
            },
            None,
        );
        Ok(appended)
    }

    /// Answer a proposal and tell the room
    pub fn respond_to_offer(
        &self,
        responder: &ParticipantId,
        offer_id: &str,
        action: OfferAction,
        counter_price: Option<Price>,
    ) -> ChatResult<Responded> {
        let responded = self.log.respond(offer_id, responder, action, counter_price)?;
        let conversation_id = responded.conversation.id.as_str();

        for message in &responded.messages {
            self.presence.broadcast(
                conversation_id,
                &ServerEvent::NewMessage {
                    message: message.clone(),
                    conversation: responded.conversation.clone(),
                },
                None,
            );
        }
        self.presence.broadcast(
            conversation_id,
            &ServerEvent::OfferResponse {
                conversation_id: conversation_id.to_string(),
                message_id: responded.offer_id.clone(),
                action: responded.action,
                responder_id: responded.responder.clone(),
                conversation: responded.conversation.clone(),
            },
            None,
        );
        Ok(responded)
    }

    // ==================== Reads ====================

    pub fn mark_read(&self, conversation_id: &str, reader: &ParticipantId) -> ChatResult<usize> {
        self.log.mark_read(conversation_id, reader)
    }

    pub fn list_messages(
        &self,
        conversation_id: &str,
        reader: &ParticipantId,
        after_sequence: Option<i64>,
        limit: Option<u32>,
    ) -> ChatResult<Vec<MessageView>> {
        self.log.list(conversation_id, reader, after_sequence, limit)
    }

    /// Conversation plus its full log; marks the reader's messages read
    pub fn conversation_with_messages(
        &self,
        conversation_id: &str,
        reader: &ParticipantId,
    ) -> ChatResult<(Conversation, Vec<MessageView>)> {
        let messages = self.log.list(conversation_id, reader, None, None)?;
        let conversation = self.directory.access_control(conversation_id, reader)?;
        Ok((conversation, messages))
    }

    pub fn list_conversations(
        &self,
        participant: &ParticipantId,
    ) -> ChatResult<Vec<ConversationSummary>> {
        Ok(self.db.list_conversations_for(participant)?)
    }

    pub fn unread_count(&self, participant: &ParticipantId) -> ChatResult<i64> {
        Ok(self.db.unread_count(participant)?)
    }

    pub fn last_seen(&self, participant: &ParticipantId) -> ChatResult<Option<LastSeen>> {
        Ok(self.db.last_seen(participant)?)
    }

    /// Explicit online/offline toggle, independent of any socket. Live rooms
    /// are untouched.
    pub fn set_status(&self, participant: &ParticipantId, online: bool) -> ChatResult<LastSeen> {
        let now = self.clock.now();
        self.db.touch_participant(participant, online, now)?;
        tracing::debug!(participant = %participant, online, "Status set");
        Ok(LastSeen {
            participant_id: participant.clone(),
            online,
            last_seen_at: now,
        })
    }

    /// Advisory price from the valuation service; `None` whenever it has
    /// nothing useful to say.
    #[allow(clippy::cast_possible_truncation)] // Scores are small positive reals
    pub async fn suggest_price(&self, item_ref: &ItemRef) -> Option<Price> {
        match self.valuation.comparability_score(item_ref).await {
            Ok(Some(score)) if score.is_finite() && score > 0.0 => {
                Some((score * PRICE_PER_SCORE_POINT).round() as Price)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(item = %item_ref, error = %e, "Valuation service unavailable");
                None
            }
        }
    }

    // ==================== Event dispatch ====================

    /// Handle one inbound socket event. Failures are reported only to the
    /// originating participant.
    pub async fn dispatch(&self, participant: &ParticipantId, event: ClientEvent) {
        if let Err(e) = self.handle(participant, event).await {
            tracing::info!(
                participant = %participant,
                kind = %e.kind(),
                error = %e,
                "Event refused"
            );
            self.presence.send_to(participant, ServerEvent::from(&e));
        }
    }

    async fn handle(&self, participant: &ParticipantId, event: ClientEvent) -> ChatResult<()> {
        match event {
            ClientEvent::Join { conversation_id } => {
                let conversation = self.join(&conversation_id, participant)?;
                let online = self.presence.list_online(&conversation_id);
                self.presence
                    .send_to(participant, ServerEvent::Joined { conversation, online });
            }
            ClientEvent::Leave { conversation_id } => self.leave(&conversation_id, participant)?,
            ClientEvent::SendMessage {
                conversation_id,
                receiver_id,
                item_ref,
                draft,
            } => {
                let target = match (conversation_id, receiver_id) {
                    (Some(id), _) => MessageTarget::Conversation(id),
                    (None, Some(peer)) => MessageTarget::Peer { peer, item_ref },
                    (None, None) => {
                        return Err(ChatError::InvalidMessage(
                            "send_message needs conversation_id or receiver_id".to_string(),
                        ))
                    }
                };
                let appended = self
                    .send_message(participant, target, draft.into_content()?)
                    .await?;
                self.presence.send_to(
                    participant,
                    ServerEvent::MessageSent {
                        conversation_id: appended.conversation.id,
                        message_id: appended.message.message_id,
                    },
                );
            }
            ClientEvent::RespondToOffer {
                message_id,
                action,
                counter_price,
            } => {
                let responded =
                    self.respond_to_offer(participant, &message_id, action, counter_price)?;
                self.presence.send_to(
                    participant,
                    ServerEvent::ResponseSent {
                        message_id: responded.offer_id,
                        action: responded.action,
                    },
                );
            }
            ClientEvent::Typing {
                conversation_id,
                is_typing,
            } => self.typing(&conversation_id, participant, is_typing)?,
            ClientEvent::GetOnlineUsers { conversation_id } => {
                let participants = self.list_online(&conversation_id, participant)?;
                self.presence.send_to(
                    participant,
                    ServerEvent::OnlineUsers {
                        conversation_id,
                        participants,
                    },
                );
            }
            ClientEvent::MarkRead { conversation_id } => {
                self.mark_read(&conversation_id, participant)?;
            }
        }
        Ok(())
    }
}
