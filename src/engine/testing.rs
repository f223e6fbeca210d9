//! Mock implementations for testing
//!
//! These mocks enable engine tests without a real clock or catalog.

use super::traits::*;
use crate::catalog::CatalogError;
use crate::db::{ItemRef, ParticipantId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

// ============================================================================
// Mock Clock
// ============================================================================

/// Manually advanced clock
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Fixed, whole-second starting point
    pub fn at_epoch() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).unwrap())
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ============================================================================
// Mock Catalog
// ============================================================================

/// In-memory item registry and valuation service
#[derive(Default)]
pub struct MockCatalog {
    owners: Mutex<HashMap<ItemRef, ParticipantId>>,
    scores: Mutex<HashMap<ItemRef, f64>>,
    unavailable: AtomicBool,
}

#[allow(dead_code)]
impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(self, item: &str, owner: &str) -> Self {
        self.owners.lock().unwrap().insert(
            ItemRef::parse(item).unwrap(),
            ParticipantId::parse(owner).unwrap(),
        );
        self
    }

    pub fn with_score(self, item: &str, score: f64) -> Self {
        self.scores
            .lock()
            .unwrap()
            .insert(ItemRef::parse(item).unwrap(), score);
        self
    }

    /// Make every lookup fail as if the catalog were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CatalogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CatalogError::Status(503))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ItemRegistry for MockCatalog {
    async fn owner_of(&self, item: &ItemRef) -> Result<Option<ParticipantId>, CatalogError> {
        self.check_available()?;
        Ok(self.owners.lock().unwrap().get(item).cloned())
    }
}

#[async_trait]
impl ValuationService for MockCatalog {
    async fn comparability_score(&self, item: &ItemRef) -> Result<Option<f64>, CatalogError> {
        self.check_available()?;
        Ok(self.scores.lock().unwrap().get(item).copied())
    }
}
