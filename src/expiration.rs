//! Validity window for priced proposals
//!
//! Expiry is evaluated lazily whenever an action is attempted or a message
//! is displayed. Nothing sweeps expired offers in the background, and an
//! expired offer never changes the stored conversation status on its own.

use crate::db::{Message, MessageKind};
use chrono::{DateTime, Duration, Utc};

/// How long an Offer, Counter or Deal stays open
pub const OFFER_VALIDITY_HOURS: i64 = 24;

pub fn offer_validity() -> Duration {
    Duration::hours(OFFER_VALIDITY_HOURS)
}

/// Expiry timestamp to stamp on a new message of `kind`
pub fn expires_at_for(kind: MessageKind, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    kind.is_priced().then(|| created_at + offer_validity())
}

/// Text and System messages never expire; priced ones expire strictly after
/// their `expires_at`.
pub fn is_expired(message: &Message, now: DateTime<Utc>) -> bool {
    if !message.kind().is_priced() {
        return false;
    }
    message.expires_at.is_some_and(|expires_at| now > expires_at)
}
