//! Rebuild negotiation state from the message log

use super::transition::{advance, Outcome};
use super::NegotiationState;
use crate::db::Message;

/// Fold a conversation's messages, in sequence order, into its state.
///
/// Replay trusts the log: it does not re-check expiry or authorization,
/// since those were enforced when each message was appended.
pub fn replay(messages: &[Message]) -> NegotiationState {
    messages
        .iter()
        .fold(NegotiationState::default(), |state, message| {
            let outcome = Outcome::of(
                &message.message_id,
                &message.sender_id,
                &message.content,
                message.responds_to.as_deref(),
            );
            advance(&state, &outcome)
        })
}
