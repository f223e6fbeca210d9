//! Pure state transition function
//!
//! Every entry point that can move a negotiation (sending a message,
//! answering a proposal) goes through [`transition`]. It performs no I/O:
//! given the same state, context and event it always produces the same
//! new state and the same effects.

use super::event::Response;
use super::{ConvContext, ConversationStatus, CurrentOffer, Effect, Event, NegotiationState};
use crate::db::{MessageContent, NewMessage, ParticipantId, Price, Resolution};
use crate::expiration;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: NegotiationState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: NegotiationState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    /// Messages this transition appends, in order
    pub fn messages(&self) -> impl Iterator<Item = &NewMessage> {
        self.effects.iter().filter_map(Effect::persisted_message)
    }
}

/// Errors that can occur during transition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{0} is not a participant in this conversation")]
    NotParticipant(ParticipantId),
    #[error("cannot respond to your own offer")]
    SelfResponseNotAllowed,
    #[error("offer {0} has expired")]
    OfferExpired(String),
    #[error("offer {0} has already been resolved")]
    OfferAlreadyResolved(String),
    #[error("offer {0} has been superseded by a newer proposal")]
    OfferSuperseded(String),
    #[error("negotiation is finalized, no further proposals are accepted")]
    Finalized,
    #[error("message {0} is not an open proposal in this conversation")]
    NotAnOffer(String),
    #[error("{0}")]
    InvalidMessage(String),
}

/// How one logged message moves the negotiation
///
/// Both [`transition`] and [`super::replay`] derive state exclusively
/// through this, which is what keeps the stored status equal to a replay
/// of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Text, or a system notice that answers nothing
    Chat,
    /// A new priced proposal; `closing` for a take-it-or-leave-it Deal
    Proposed { offer: CurrentOffer, closing: bool },
    /// Deal record answering an accepted proposal
    Accepted { price: Price },
    /// System record answering a rejected proposal
    Rejected,
}

impl Outcome {
    pub fn of(
        message_id: &str,
        sender: &ParticipantId,
        content: &MessageContent,
        responds_to: Option<&str>,
    ) -> Self {
        let proposed = |price: Price, closing: bool| Outcome::Proposed {
            offer: CurrentOffer {
                message_id: message_id.to_string(),
                price,
                proposer_id: sender.clone(),
            },
            closing,
        };

        match (content, responds_to) {
            (MessageContent::Text { .. } | MessageContent::System { .. }, None)
            | (MessageContent::Text { .. }, Some(_)) => Outcome::Chat,
            (MessageContent::System { .. }, Some(_)) => Outcome::Rejected,
            (
                MessageContent::Offer { price, .. } | MessageContent::Counter { price, .. },
                _,
            ) => proposed(*price, false),
            (MessageContent::Deal { price, .. }, None) => proposed(*price, true),
            (MessageContent::Deal { price, .. }, Some(_)) => Outcome::Accepted { price: *price },
        }
    }

    pub fn of_new(message: &NewMessage) -> Self {
        Self::of(
            &message.message_id,
            &message.sender_id,
            &message.content,
            message.responds_to.as_deref(),
        )
    }
}

/// Apply one outcome to a state, without validation
pub fn advance(state: &NegotiationState, outcome: &Outcome) -> NegotiationState {
    let mut next = state.clone();
    match outcome {
        Outcome::Chat => {}
        Outcome::Proposed { offer, closing } => {
            next.status = if *closing {
                ConversationStatus::DealPending
            } else {
                ConversationStatus::Negotiating
            };
            next.current_offer = Some(offer.clone());
        }
        Outcome::Accepted { price } => {
            next.status = ConversationStatus::Completed;
            next.finalized = true;
            next.finalized_price = Some(*price);
        }
        Outcome::Rejected => {
            next.status = ConversationStatus::Active;
            next.current_offer = None;
        }
    }
    next
}

/// Pure transition function
pub fn transition(
    state: &NegotiationState,
    context: &ConvContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match event {
        Event::MessagePosted {
            message_id,
            sender,
            content,
        } => {
            let receiver = peer(context, &sender)?;
            content.validate().map_err(TransitionError::InvalidMessage)?;

            // Text and System stay allowed after finalization
            if content.kind().is_priced() && state.finalized {
                return Err(TransitionError::Finalized);
            }

            let message = draft(context, message_id, sender, receiver, content, None);
            Ok(record(state, message).with_effect(Effect::PersistState))
        }

        Event::OfferResponse {
            responder,
            offer,
            response,
        } => {
            let offer_id = offer.message_id.clone();
            let receiver = peer(context, &responder)?;

            if offer.conversation_id != context.conversation_id || !offer.is_proposal() {
                return Err(TransitionError::NotAnOffer(offer_id));
            }
            if offer.sender_id == responder {
                return Err(TransitionError::SelfResponseNotAllowed);
            }
            if offer.resolution.is_some() {
                return Err(TransitionError::OfferAlreadyResolved(offer_id));
            }
            if state.finalized {
                return Err(TransitionError::Finalized);
            }
            if !state.is_current_offer(&offer_id) {
                return Err(TransitionError::OfferSuperseded(offer_id));
            }

            if expiration::is_expired(&offer, context.now) {
                return Err(TransitionError::OfferExpired(offer_id));
            }

            let action = response.action();
            let notify = Effect::NotifyOfferResponse {
                offer_id: offer_id.clone(),
                action,
                responder: responder.clone(),
            };

            let result = match response {
                Response::Accept { record_id } => {
                    let price = offer
                        .content
                        .price()
                        .ok_or_else(|| TransitionError::NotAnOffer(offer_id.clone()))?;
                    let deal = draft(
                        context,
                        record_id,
                        responder,
                        receiver,
                        MessageContent::deal(format!("Deal accepted at {price}"), price),
                        Some(offer_id.clone()),
                    );
                    resolved(state, &offer_id, Resolution::Accepted, deal)
                }

                Response::Reject { record_id } => {
                    let notice = draft(
                        context,
                        record_id,
                        responder,
                        receiver,
                        MessageContent::system("Offer rejected"),
                        Some(offer_id.clone()),
                    );
                    resolved(state, &offer_id, Resolution::Rejected, notice)
                }

                // The countered offer stays unresolved: it is superseded, not answered
                Response::Counter { message_id, price } => {
                    let quantity = offer.content.quantity().unwrap_or(1);
                    let content =
                        MessageContent::offer(format!("Counter offer: {price}"), price, quantity);
                    content.validate().map_err(TransitionError::InvalidMessage)?;
                    let counter = draft(
                        context,
                        message_id,
                        responder,
                        receiver,
                        content,
                        Some(offer_id.clone()),
                    );
                    record(state, counter)
                }
            };

            Ok(result
                .with_effect(Effect::PersistState)
                .with_effect(notify))
        }
    }
}

fn peer(
    context: &ConvContext,
    participant: &ParticipantId,
) -> Result<ParticipantId, TransitionError> {
    context
        .peer_of(participant)
        .cloned()
        .ok_or_else(|| TransitionError::NotParticipant(participant.clone()))
}

fn draft(
    context: &ConvContext,
    message_id: String,
    sender: ParticipantId,
    receiver: ParticipantId,
    content: MessageContent,
    responds_to: Option<String>,
) -> NewMessage {
    NewMessage {
        message_id,
        conversation_id: context.conversation_id.clone(),
        sender_id: sender,
        receiver_id: receiver,
        expires_at: expiration::expires_at_for(content.kind(), context.now),
        content,
        responds_to,
        created_at: context.now,
    }
}

fn record(state: &NegotiationState, message: NewMessage) -> TransitionResult {
    let next = advance(state, &Outcome::of_new(&message));
    TransitionResult::new(next).with_effect(Effect::PersistMessage(message))
}

fn resolved(
    state: &NegotiationState,
    offer_id: &str,
    resolution: Resolution,
    message: NewMessage,
) -> TransitionResult {
    let next = advance(state, &Outcome::of_new(&message));
    TransitionResult::new(next)
        .with_effect(Effect::ResolveOffer {
            message_id: offer_id.to_string(),
            resolution,
        })
        .with_effect(Effect::PersistMessage(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Message, ParticipantId};
    use crate::state_machine::event::OfferAction;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::parse(s).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn ctx(now: DateTime<Utc>) -> ConvContext {
        ConvContext::new("conv_alice_bob_product_x", pid("alice"), pid("bob"), now)
    }

    fn post(id: &str, sender: &str, content: MessageContent) -> Event {
        Event::MessagePosted {
            message_id: id.to_string(),
            sender: pid(sender),
            content,
        }
    }

    /// Bob offers 100000 at t0; returns the state after and the stored offer
    fn bob_offers() -> (NegotiationState, Message) {
        let result = transition(
            &NegotiationState::default(),
            &ctx(t0()),
            post("offer-1", "bob", MessageContent::offer("100k?", 100_000, 1)),
        )
        .unwrap();
        let offer = result.messages().next().unwrap().clone().stored(1);
        (result.new_state, offer)
    }

    fn accept(id: &str) -> Response {
        Response::Accept { record_id: id.into() }
    }

    fn reject(id: &str) -> Response {
        Response::Reject { record_id: id.into() }
    }

    fn counter(id: &str, price: Price) -> Response {
        Response::Counter { message_id: id.into(), price }
    }

    fn respond(
        state: &NegotiationState,
        now: DateTime<Utc>,
        responder: &str,
        offer: &Message,
        response: Response,
    ) -> Result<TransitionResult, TransitionError> {
        transition(
            state,
            &ctx(now),
            Event::OfferResponse {
                responder: pid(responder),
                offer: offer.clone(),
                response,
            },
        )
    }

    #[test]
    fn text_does_not_change_status() {
        let state = NegotiationState::default();
        let hi = post("m1", "alice", MessageContent::text("hi"));
        let result = transition(&state, &ctx(t0()), hi).unwrap();

        assert_eq!(result.new_state, state);
        let message = result.messages().next().unwrap();
        assert_eq!(message.receiver_id, pid("bob"));
        assert_eq!(message.expires_at, None);
        assert!(result.effects.contains(&Effect::PersistState));
    }

    #[test]
    fn offer_moves_to_negotiating_with_current_offer() {
        let (state, offer) = bob_offers();

        assert_eq!(state.status, ConversationStatus::Negotiating);
        assert_eq!(
            state.current_offer,
            Some(CurrentOffer {
                message_id: "offer-1".into(),
                price: 100_000,
                proposer_id: pid("bob"),
            })
        );
        assert_eq!(offer.expires_at, Some(t0() + Duration::hours(24)));
        assert_eq!(offer.resolution, None);
    }

    #[test]
    fn deal_proposal_moves_to_deal_pending() {
        let result = transition(
            &NegotiationState::default(),
            &ctx(t0()),
            post("d1", "alice", MessageContent::deal("final: 90k", 90_000)),
        )
        .unwrap();
        assert_eq!(result.new_state.status, ConversationStatus::DealPending);
    }

    #[test]
    fn empty_body_and_outsiders_are_rejected() {
        let state = NegotiationState::default();
        assert!(matches!(
            transition(&state, &ctx(t0()), post("m", "alice", MessageContent::text(" "))),
            Err(TransitionError::InvalidMessage(_))
        ));
        assert!(matches!(
            transition(&state, &ctx(t0()), post("m", "mallory", MessageContent::text("hi"))),
            Err(TransitionError::NotParticipant(_))
        ));
    }

    #[test]
    fn accept_finalizes_at_offer_price() {
        let (state, offer) = bob_offers();
        let later = t0() + Duration::hours(1);
        let result = respond(&state, later, "alice", &offer, accept("deal-1")).unwrap();

        assert_eq!(result.new_state.status, ConversationStatus::Completed);
        assert!(result.new_state.finalized);
        assert_eq!(result.new_state.finalized_price, Some(100_000));
        assert_eq!(
            result.effects[0],
            Effect::ResolveOffer {
                message_id: "offer-1".into(),
                resolution: Resolution::Accepted,
            }
        );
        let deal = result.messages().next().unwrap();
        assert_eq!(deal.content, MessageContent::deal("Deal accepted at 100000", 100_000));
        assert_eq!(deal.responds_to.as_deref(), Some("offer-1"));
        assert_eq!(deal.receiver_id, pid("bob"));
        assert!(result.effects.iter().any(|e| matches!(
            e,
            Effect::NotifyOfferResponse { action: OfferAction::Accept, .. }
        )));
    }

    #[test]
    fn reject_returns_to_active_and_clears_offer() {
        let (state, offer) = bob_offers();
        let result = respond(&state, t0(), "alice", &offer, reject("r1")).unwrap();

        assert_eq!(result.new_state.status, ConversationStatus::Active);
        assert_eq!(result.new_state.current_offer, None);
        assert!(!result.new_state.finalized);
    }

    #[test]
    fn counter_supersedes_without_resolving() {
        let (state, offer) = bob_offers();
        let result = respond(
            &state,
            t0() + Duration::hours(2),
            "alice",
            &offer,
            counter("offer-2", 120_000),
        )
        .unwrap();

        assert!(!result.effects.iter().any(|e| matches!(e, Effect::ResolveOffer { .. })));
        assert_eq!(result.new_state.status, ConversationStatus::Negotiating);
        let current = result.new_state.current_offer.clone().unwrap();
        assert_eq!(current.message_id, "offer-2");
        assert_eq!(current.proposer_id, pid("alice"));
        assert_eq!(current.price, 120_000);

        let counter = result.messages().next().unwrap();
        assert_eq!(counter.content.kind(), crate::db::MessageKind::Offer);
        assert_eq!(counter.expires_at, Some(t0() + Duration::hours(26)));
    }

    #[test]
    fn proposer_cannot_answer_own_offer() {
        let (state, offer) = bob_offers();
        for response in [accept("x"), reject("x"), counter("x", 1)] {
            assert_eq!(
                respond(&state, t0(), "bob", &offer, response).unwrap_err(),
                TransitionError::SelfResponseNotAllowed
            );
        }
    }

    #[test]
    fn expired_offer_cannot_be_answered() {
        let (state, offer) = bob_offers();
        let late = t0() + Duration::hours(24) + Duration::seconds(1);

        for response in [accept("x"), counter("x", 5), reject("x")] {
            assert_eq!(
                respond(&state, late, "alice", &offer, response).unwrap_err(),
                TransitionError::OfferExpired("offer-1".into())
            );
        }

        // Exactly at the window edge the offer is still live
        let edge = t0() + Duration::hours(24);
        assert!(respond(&state, edge, "alice", &offer, reject("x")).is_ok());
    }

    #[test]
    fn resolved_and_superseded_offers_are_refused() {
        let (state, mut offer) = bob_offers();

        let newer = transition(
            &state,
            &ctx(t0()),
            post("offer-9", "bob", MessageContent::offer("actually 95k", 95_000, 1)),
        )
        .unwrap()
        .new_state;
        assert_eq!(
            respond(&newer, t0(), "alice", &offer, accept("x")).unwrap_err(),
            TransitionError::OfferSuperseded("offer-1".into())
        );

        offer.resolution = Some(Resolution::Rejected);
        assert_eq!(
            respond(&state, t0(), "alice", &offer, accept("x")).unwrap_err(),
            TransitionError::OfferAlreadyResolved("offer-1".into())
        );
    }

    #[test]
    fn finalized_conversation_refuses_new_proposals_but_not_text() {
        let (state, offer) = bob_offers();
        let done = respond(&state, t0(), "alice", &offer, accept("d"))
            .unwrap()
            .new_state;

        let more = post("o2", "bob", MessageContent::offer("more?", 1, 1));
        assert_eq!(
            transition(&done, &ctx(t0()), more).unwrap_err(),
            TransitionError::Finalized
        );
        let thanks = post("t", "bob", MessageContent::text("thanks"));
        assert!(transition(&done, &ctx(t0()), thanks).is_ok());
    }
}
