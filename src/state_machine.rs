//! Core negotiation state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions:
//! [`transition`] validates an event against the current state and returns
//! the new state plus the effects the caller must execute.

mod effect;
pub mod event;
mod replay;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::Effect;
pub use event::{Event, OfferAction, Response};
pub use replay::replay;
pub use state::{ConvContext, ConversationStatus, CurrentOffer, NegotiationState};
pub use transition::{transition, TransitionError};
