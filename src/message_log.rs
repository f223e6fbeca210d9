//! Append-only message log and effect executor
//!
//! Every mutation follows the same shape inside one IMMEDIATE transaction:
//! load the conversation, check membership, run the pure transition, then
//! apply its storage effects. A failure anywhere rolls all of it back.

use crate::db::{
    insert_message, load_conversation, load_message, load_messages, mark_read, mark_read_between,
    resolve_offer_if_open, save_state, Conversation, Database, Message, MessageContent,
    MessageView, ParticipantId, Price,
};
use crate::directory::ensure_participant;
use crate::engine::Clock;
use crate::error::{ChatError, ChatResult};
use crate::expiration;
use crate::state_machine::{transition, ConvContext, Effect, Event, OfferAction, Response};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::Arc;

/// A message appended by a participant
#[derive(Debug, Clone)]
pub struct Appended {
    pub conversation: Conversation,
    pub message: Message,
}

/// Outcome of answering a proposal
#[derive(Debug, Clone)]
pub struct Responded {
    pub conversation: Conversation,
    pub offer_id: String,
    pub action: OfferAction,
    pub responder: ParticipantId,
    /// Records appended by the response (deal, rejection notice or counter)
    pub messages: Vec<Message>,
}

/// What executing one transition wrote
struct Executed {
    conversation: Conversation,
    messages: Vec<Message>,
    notices: Vec<Effect>,
}

pub struct MessageLog {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl MessageLog {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Append a participant message to an existing conversation
    pub fn append(
        &self,
        conversation_id: &str,
        sender: &ParticipantId,
        content: MessageContent,
    ) -> ChatResult<Appended> {
        let now = self.clock.now();
        let event = Event::MessagePosted {
            message_id: new_message_id(),
            sender: sender.clone(),
            content: content.trimmed(),
        };

        let executed = self.db.transaction(|conn| {
            let conversation = load_conversation(conn, conversation_id)?;
            ensure_participant(&conversation, sender)?;
            execute(conn, &conversation, now, event)
        })?;

        let Executed {
            conversation,
            mut messages,
            ..
        } = executed;
        let message = messages
            .pop()
            .ok_or_else(|| ChatError::Internal("transition appended no message".to_string()))?;

        tracing::debug!(
            conv_id = %conversation.id,
            sender = %sender,
            kind = %message.kind(),
            status = %conversation.state.status,
            "Appended message"
        );
        Ok(Appended {
            conversation,
            message,
        })
    }

    /// Accept, reject or counter a proposal
    pub fn respond(
        &self,
        offer_id: &str,
        responder: &ParticipantId,
        action: OfferAction,
        counter_price: Option<Price>,
    ) -> ChatResult<Responded> {
        let now = self.clock.now();
        let response = match action {
            OfferAction::Accept => Response::Accept {
                record_id: new_message_id(),
            },
            OfferAction::Reject => Response::Reject {
                record_id: new_message_id(),
            },
            OfferAction::Counter => Response::Counter {
                message_id: new_message_id(),
                price: counter_price.ok_or_else(|| {
                    ChatError::InvalidMessage("counter requires a counter price".to_string())
                })?,
            },
        };

        let result = self.db.transaction(|conn| {
            let offer = load_message(conn, offer_id)?;
            let conversation = load_conversation(conn, &offer.conversation_id)?;
            ensure_participant(&conversation, responder)?;
            execute(
                conn,
                &conversation,
                now,
                Event::OfferResponse {
                    responder: responder.clone(),
                    offer,
                    response,
                },
            )
        });

        let executed = match result {
            Ok(executed) => executed,
            Err(e) => {
                tracing::info!(
                    offer_id,
                    responder = %responder,
                    %action,
                    error = %e,
                    "Offer response refused"
                );
                return Err(e);
            }
        };

        let Executed {
            conversation,
            messages,
            notices,
        } = executed;
        let Some(Effect::NotifyOfferResponse {
            offer_id,
            action,
            responder,
        }) = notices.into_iter().next()
        else {
            return Err(ChatError::Internal(
                "response produced no notification".to_string(),
            ));
        };

        tracing::info!(
            conv_id = %conversation.id,
            offer_id = %offer_id,
            responder = %responder,
            %action,
            status = %conversation.state.status,
            "Offer answered"
        );
        Ok(Responded {
            conversation,
            offer_id,
            action,
            responder,
            messages,
        })
    }

    /// Mark messages addressed to `reader` as read
    pub fn mark_read(&self, conversation_id: &str, reader: &ParticipantId) -> ChatResult<usize> {
        self.db.transaction(|conn| {
            let conversation = load_conversation(conn, conversation_id)?;
            ensure_participant(&conversation, reader)?;
            Ok(mark_read(conn, conversation_id, reader)?)
        })
    }

    /// Messages oldest first, annotated with read-time expiry. Only the
    /// returned page is marked read for `reader`; later pages stay unread.
    pub fn list(
        &self,
        conversation_id: &str,
        reader: &ParticipantId,
        after_sequence: Option<i64>,
        limit: Option<u32>,
    ) -> ChatResult<Vec<MessageView>> {
        let now = self.clock.now();
        let messages = self.db.transaction(|conn| {
            let conversation = load_conversation(conn, conversation_id)?;
            ensure_participant(&conversation, reader)?;
            let mut messages = load_messages(conn, conversation_id, after_sequence, limit)?;
            if let Some(last) = messages.last() {
                let through = last.sequence_id;
                let after = after_sequence.unwrap_or(0);
                mark_read_between(conn, conversation_id, reader, after, through)?;
                for message in messages.iter_mut().filter(|m| &m.receiver_id == reader) {
                    message.read = true;
                }
            }
            Ok::<_, ChatError>(messages)
        })?;

        Ok(messages
            .into_iter()
            .map(|message| MessageView {
                is_expired: expiration::is_expired(&message, now),
                message,
            })
            .collect())
    }
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Run the transition for `event` and apply its storage effects on `conn`.
fn execute(
    conn: &Connection,
    conversation: &Conversation,
    now: DateTime<Utc>,
    event: Event,
) -> ChatResult<Executed> {
    let context = ConvContext::new(
        conversation.id.clone(),
        conversation.participant_a.clone(),
        conversation.participant_b.clone(),
        now,
    );
    let result = transition(&conversation.state, &context, event)?;

    let mut messages = Vec::new();
    let mut notices = Vec::new();
    for effect in result.effects {
        match effect {
            Effect::ResolveOffer {
                message_id,
                resolution,
            } => resolve_offer_if_open(conn, &message_id, resolution)?,
            Effect::PersistMessage(message) => messages.push(insert_message(conn, message)?),
            Effect::PersistState => save_state(conn, &conversation.id, &result.new_state, now)?,
            notice @ Effect::NotifyOfferResponse { .. } => notices.push(notice),
        }
    }

    Ok(Executed {
        conversation: load_conversation(conn, &conversation.id)?,
        messages,
        notices,
    })
}
