//! ==============================================================================
//! store.rs - injected in-memory state
//! ==============================================================================
//!
//! purpose:
//!     holds the two pieces of process-wide state the relay keeps:
//!     - the latest sensor reading (one slot, overwritten on every message)
//!     - the list of push notification tokens
//!
//!     both sit behind the TelemetryStore trait so that the hub and the
//!     notifier never touch globals and a different cache can be slotted in
//!     without changing call sites.
//!
//! everything here is volatile and lost on restart.
//!
//! ==============================================================================

use crate::domain::SensorReading;
use std::sync::{PoisonError, RwLock};

pub trait TelemetryStore: Send + Sync {
    /// current reading, empty before the first message
    fn get(&self) -> SensorReading;
    /// replace the reading wholesale
    fn set(&self, reading: SensorReading);
    /// add a push token; false if it was already present
    fn append(&self, token: String) -> bool;
    fn tokens(&self) -> Vec<String>;
}

#[derive(Default)]
pub struct MemoryStore {
    latest: RwLock<SensorReading>,
    tokens: RwLock<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// locks are never held across an await, a poisoned lock still has valid data
impl TelemetryStore for MemoryStore {
    fn get(&self) -> SensorReading {
        self.latest.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, reading: SensorReading) {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = reading;
    }

    fn append(&self, token: String) -> bool {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        if tokens.contains(&token) {
            return false;
        }
        tokens.push(token);
        true
    }

    fn tokens(&self) -> Vec<String> {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
