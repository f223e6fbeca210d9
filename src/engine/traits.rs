//! Trait abstractions for the engine's collaborators
//!
//! These traits enable testing the engine with mock implementations.

use crate::catalog::CatalogError;
use crate::db::{ItemRef, ParticipantId};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use std::sync::Arc;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock, truncated to the precision timestamps are stored at
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }
}

/// Item catalog: who owns an item
#[async_trait]
pub trait ItemRegistry: Send + Sync {
    /// `Ok(None)` when the item is unknown
    async fn owner_of(&self, item: &ItemRef) -> Result<Option<ParticipantId>, CatalogError>;
}

/// Valuation collaborator used for price suggestions
#[async_trait]
pub trait ValuationService: Send + Sync {
    async fn comparability_score(&self, item: &ItemRef) -> Result<Option<f64>, CatalogError>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

#[async_trait]
impl<T: ItemRegistry + ?Sized> ItemRegistry for Arc<T> {
    async fn owner_of(&self, item: &ItemRef) -> Result<Option<ParticipantId>, CatalogError> {
        (**self).owner_of(item).await
    }
}

#[async_trait]
impl<T: ValuationService + ?Sized> ValuationService for Arc<T> {
    async fn comparability_score(&self, item: &ItemRef) -> Result<Option<f64>, CatalogError> {
        (**self).comparability_score(item).await
    }
}
