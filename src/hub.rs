//! ==============================================================================
//! hub.rs - fanout of relay events to every connected client
//! ==============================================================================
//!
//! purpose:
//!     every websocket session holds a broadcast receiver from this hub.
//!     the broker bridge pushes readings in, the command path pushes status
//!     updates in, and each session forwards whatever arrives to its socket.
//!
//! ordering:
//!     a new client registers its receiver before reading the snapshot, so a
//!     reading that races the connect is never missed (at worst it is seen
//!     twice, which is harmless for last-writer-wins state).
//!
//! ==============================================================================

use crate::domain::{MotorCommand, SensorReading, ServerEvent};
use crate::store::TelemetryStore;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct Hub {
    store: Arc<dyn TelemetryStore>,
    tx: broadcast::Sender<ServerEvent>,
}

/// what a freshly connected client starts from
pub struct Subscription {
    pub snapshot: SensorReading,
    pub events: broadcast::Receiver<ServerEvent>,
}

impl Hub {
    pub fn new(store: Arc<dyn TelemetryStore>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { store, tx }
    }

    pub fn subscribe(&self) -> Subscription {
        let events = self.tx.subscribe();
        let snapshot = self.store.get();
        Subscription { snapshot, events }
    }

    /// cache the reading and broadcast it
    /// returns the number of clients it was handed to
    pub fn publish_reading(&self, reading: SensorReading) -> usize {
        self.store.set(reading.clone());
        self.broadcast(ServerEvent::SensorData(reading))
    }

    pub fn publish_status(&self, command: MotorCommand) -> usize {
        self.broadcast(ServerEvent::MotorStatusUpdate(command))
    }

    pub fn latest(&self) -> SensorReading {
        self.store.get()
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn broadcast(&self, event: ServerEvent) -> usize {
        // an error only means nobody is listening right now
        self.tx.send(event).unwrap_or(0)
    }
}
