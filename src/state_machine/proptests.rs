//! Property-based tests for the state machine
//!
//! A small in-memory driver plays arbitrary sequences of messages and
//! responses through `transition`, executing storage effects against a
//! vector log, and checks the negotiation invariants after every step.

use super::*;
use crate::db::{Message, MessageContent, ParticipantId, Resolution};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

// ============================================================================
// Test Helpers
// ============================================================================

fn alice() -> ParticipantId {
    ParticipantId::parse("alice").unwrap()
}

fn bob() -> ParticipantId {
    ParticipantId::parse("bob").unwrap()
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn context(now: DateTime<Utc>) -> ConvContext {
    ConvContext::new("conv_alice_bob_product_widget", alice(), bob(), now)
}

/// Conversation kept entirely in memory
struct Driver {
    state: NegotiationState,
    log: Vec<Message>,
    now: DateTime<Utc>,
    next_id: u32,
}

impl Driver {
    fn new() -> Self {
        Self {
            state: NegotiationState::default(),
            log: Vec::new(),
            now: t0(),
            next_id: 0,
        }
    }

    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        format!("m{}", self.next_id)
    }

    fn proposals(&self) -> Vec<&Message> {
        self.log.iter().filter(|m| m.is_proposal()).collect()
    }

    fn apply(&mut self, event: Event) -> Result<(), TransitionError> {
        let result = transition(&self.state, &context(self.now), event)?;
        for effect in result.effects {
            match effect {
                Effect::PersistMessage(message) => {
                    let seq = i64::try_from(self.log.len()).unwrap() + 1;
                    self.log.push(message.stored(seq));
                }
                Effect::ResolveOffer {
                    message_id,
                    resolution,
                } => {
                    let offer = self
                        .log
                        .iter_mut()
                        .find(|m| m.message_id == message_id)
                        .expect("resolved offer exists");
                    assert!(offer.resolution.is_none(), "offer resolved twice");
                    offer.resolution = Some(resolution);
                }
                Effect::PersistState | Effect::NotifyOfferResponse { .. } => {}
            }
        }
        self.state = result.new_state;
        Ok(())
    }

    fn run(&mut self, step: &Step) -> Result<(), TransitionError> {
        self.now += Duration::minutes(i64::from(step.advance_minutes));
        let who = if step.from_alice { alice() } else { bob() };
        match &step.action {
            Action::Post(content) => {
                let message_id = self.fresh_id();
                self.apply(Event::MessagePosted {
                    message_id,
                    sender: who,
                    content: content.clone(),
                })
            }
            Action::Respond { target, kind, price } => {
                let proposals = self.proposals();
                if proposals.is_empty() {
                    return Ok(());
                }
                let offer = proposals[*target % proposals.len()].clone();
                let id = self.fresh_id();
                let response = match kind {
                    0 => Response::Accept { record_id: id },
                    1 => Response::Reject { record_id: id },
                    _ => Response::Counter {
                        message_id: id,
                        price: *price,
                    },
                };
                self.apply(Event::OfferResponse {
                    responder: who,
                    offer,
                    response,
                })
            }
        }
    }
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

#[derive(Debug, Clone)]
enum Action {
    Post(MessageContent),
    Respond {
        target: usize,
        kind: u8,
        price: i64,
    },
}

#[derive(Debug, Clone)]
struct Step {
    from_alice: bool,
    advance_minutes: u32,
    action: Action,
}

fn arb_content() -> impl Strategy<Value = MessageContent> {
    prop_oneof![
        "[a-z ]{0,12}".prop_map(|body: String| MessageContent::text(body)),
        (1i64..500_000, 1u32..4).prop_map(|(p, q)| MessageContent::offer(format!("{p}?"), p, q)),
        (1i64..500_000, 1u32..4).prop_map(|(p, q)| MessageContent::counter(format!("{p}!"), p, q)),
        (1i64..500_000).prop_map(|p| MessageContent::deal(format!("final {p}"), p)),
        (-10i64..1).prop_map(|p| MessageContent::offer("bad", p, 1)),
    ]
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        arb_content().prop_map(Action::Post),
        (0usize..8, 0u8..3, -5i64..500_000)
            .prop_map(|(target, kind, price)| Action::Respond { target, kind, price }),
    ]
}

fn arb_step() -> impl Strategy<Value = Step> {
    // Mostly small gaps, occasionally long enough to expire an offer
    let gap = prop_oneof![4 => 0u32..120, 1 => 1000u32..2000];
    (any::<bool>(), gap, arb_action()).prop_map(|(from_alice, advance_minutes, action)| Step {
        from_alice,
        advance_minutes,
        action,
    })
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // Stored state always equals a replay of the log
    #[test]
    fn prop_state_equals_replay(steps in proptest::collection::vec(arb_step(), 0..30)) {
        let mut driver = Driver::new();
        for step in &steps {
            let _ = driver.run(step);
            prop_assert_eq!(&driver.state, &replay(&driver.log));
        }
    }

    // At most one accepted proposal, and finalization matches it
    #[test]
    fn prop_single_accepted_deal(steps in proptest::collection::vec(arb_step(), 0..30)) {
        let mut driver = Driver::new();
        for step in &steps {
            let _ = driver.run(step);
        }

        let accepted: Vec<&Message> = driver
            .log
            .iter()
            .filter(|m| m.resolution == Some(Resolution::Accepted))
            .collect();
        prop_assert!(accepted.len() <= 1);
        prop_assert_eq!(driver.state.finalized, accepted.len() == 1);
        if let Some(offer) = accepted.first() {
            prop_assert_eq!(driver.state.finalized_price, offer.content.price());
            prop_assert_eq!(driver.state.status, ConversationStatus::Completed);
        }
    }

    // Once finalized, no further priced message is ever appended
    #[test]
    fn prop_finalized_is_terminal(steps in proptest::collection::vec(arb_step(), 0..30)) {
        let mut driver = Driver::new();
        let mut finalized_at = None;
        for step in &steps {
            let _ = driver.run(step);
            if driver.state.finalized && finalized_at.is_none() {
                finalized_at = Some(driver.log.len());
            }
        }
        if let Some(len) = finalized_at {
            prop_assert!(driver.log[len..].iter().all(|m| !m.kind().is_priced()));
        }
    }

    // A proposer can never answer their own proposal
    #[test]
    fn prop_self_response_rejected(
        content in arb_content(),
        kind in 0u8..3,
        from_alice in any::<bool>(),
    ) {
        prop_assume!(content.kind().is_priced() && content.validate().is_ok());
        let mut driver = Driver::new();
        let proposer = if from_alice { alice() } else { bob() };
        driver
            .apply(Event::MessagePosted {
                message_id: "p1".into(),
                sender: proposer.clone(),
                content,
            })
            .unwrap();

        let offer = driver.log[0].clone();
        let response = match kind {
            0 => Response::Accept { record_id: "r".into() },
            1 => Response::Reject { record_id: "r".into() },
            _ => Response::Counter { message_id: "r".into(), price: 10 },
        };
        let result = transition(
            &driver.state,
            &context(driver.now),
            Event::OfferResponse { responder: proposer, offer, response },
        );
        prop_assert_eq!(result.unwrap_err(), TransitionError::SelfResponseNotAllowed);
    }

    // Acceptance is possible through exactly 24h after creation and never after
    #[test]
    fn prop_expiry_boundary(elapsed_secs in 0i64..(48 * 3600)) {
        let mut driver = Driver::new();
        driver
            .apply(Event::MessagePosted {
                message_id: "o1".into(),
                sender: bob(),
                content: MessageContent::offer("100", 100, 1),
            })
            .unwrap();
        let offer = driver.log[0].clone();

        let result = transition(
            &driver.state,
            &context(t0() + Duration::seconds(elapsed_secs)),
            Event::OfferResponse {
                responder: alice(),
                offer,
                response: Response::Accept { record_id: "d1".into() },
            },
        );
        if elapsed_secs <= 24 * 3600 {
            prop_assert!(result.is_ok());
        } else {
            prop_assert_eq!(result.unwrap_err(), TransitionError::OfferExpired("o1".into()));
        }
    }
}
