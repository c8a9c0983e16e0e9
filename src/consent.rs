//! Tracking consent state and its transitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// User-granted permission controlling whether collected data may be stored and uploaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingConsent {
    /// Data is stored for upload.
    Granted,
    /// Data is discarded.
    NotGranted,
    /// Data is held on disk until a decision is made.
    #[default]
    Pending,
}

impl fmt::Display for TrackingConsent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingConsent::Granted => write!(f, "granted"),
            TrackingConsent::NotGranted => write!(f, "not_granted"),
            TrackingConsent::Pending => write!(f, "pending"),
        }
    }
}

impl TryFrom<&str> for TrackingConsent {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "granted" => Ok(TrackingConsent::Granted),
            "not_granted" | "notgranted" => Ok(TrackingConsent::NotGranted),
            "pending" => Ok(TrackingConsent::Pending),
            other => Err(format!("unknown tracking consent '{}'", other)),
        }
    }
}

/// What storage has to do with already collected data when consent changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsentMigration {
    /// Move unauthorized data into the authorized directory.
    MoveUnauthorizedToAuthorized,
    /// Delete all unauthorized data.
    DeleteUnauthorized,
    /// Nothing to migrate.
    None,
}

impl ConsentMigration {
    pub fn for_transition(from: TrackingConsent, to: TrackingConsent) -> Self {
        use TrackingConsent::*;

        match (from, to) {
            (Pending, Granted) => ConsentMigration::MoveUnauthorizedToAuthorized,
            (Pending, NotGranted) | (Granted, NotGranted) => ConsentMigration::DeleteUnauthorized,
            _ => ConsentMigration::None,
        }
    }
}

/// Receives consent transitions, in the order they were made.
pub trait ConsentObserver: Send + Sync {
    fn consent_changed(&self, from: TrackingConsent, to: TrackingConsent);
}

/// Holds the current consent and notifies its observer about every change.
pub struct ConsentController {
    current: RwLock<TrackingConsent>,
    observer: Option<Arc<dyn ConsentObserver>>,
}

impl ConsentController {
    pub fn new(initial: TrackingConsent, observer: Option<Arc<dyn ConsentObserver>>) -> Self {
        Self {
            current: RwLock::new(initial),
            observer,
        }
    }

    pub fn current(&self) -> TrackingConsent {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets a new consent value, returning the previous one if it changed.
    ///
    /// The observer is called while the value is still locked, so observers see
    /// transitions in exactly the order they were applied.
    pub fn set(&self, new_value: TrackingConsent) -> Option<TrackingConsent> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let previous = *current;

        if previous == new_value {
            debug!("Tracking consent unchanged: {}", new_value);
            return None;
        }

        *current = new_value;
        info!("Tracking consent changed: {} -> {}", previous, new_value);

        if let Some(observer) = &self.observer {
            observer.consent_changed(previous, new_value);
        }

        Some(previous)
    }
}

impl fmt::Debug for ConsentController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsentController")
            .field("current", &self.current())
            .finish()
    }
}
