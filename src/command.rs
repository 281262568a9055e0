//! ==============================================================================
//! command.rs - motor command path
//! ==============================================================================
//!
//! purpose:
//!     turns a client's ON/OFF request into
//!     1. a plain-string publish on the command topic (at-most-once)
//!     2. a motor_status_update broadcast to every client, sender included
//!
//!     the websocket path is fire-and-forget: the status update goes out even
//!     when the publish failed, and nobody checks the actuator moved.
//!
//!     `dispatch_confirmed` is the request/response variant used by the http
//!     api. it waits for the next reading whose confirm field shows the new
//!     motor state, bounded by a timeout.
//!
//! ==============================================================================

use crate::config::CommandsConfig;
use crate::domain::{MotorCommand, ServerEvent};
use crate::hub::Hub;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

/// the upstream side of the command path (mqtt in production)
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish_command(&self, topic: &str, command: MotorCommand) -> Result<()>;
}

/// result of a confirmed dispatch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// a reading reflected the command
    Confirmed { elapsed_ms: u64 },
    /// no matching reading within the timeout
    TimedOut { timeout_ms: u64 },
    /// no confirm field configured, nothing to check against
    Unverified,
}

pub struct CommandDispatcher {
    publisher: Arc<dyn CommandPublisher>,
    hub: Hub,
    topic: String,
    confirm_field: Option<String>,
    confirm_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        publisher: Arc<dyn CommandPublisher>,
        hub: Hub,
        topic: impl Into<String>,
        commands: &CommandsConfig,
    ) -> Self {
        Self {
            publisher,
            hub,
            topic: topic.into(),
            confirm_field: commands.confirm_field.clone(),
            confirm_timeout: commands.confirm_timeout(),
        }
    }

    /// publish then broadcast; the broadcast happens whatever the publish did
    pub async fn dispatch(&self, command: MotorCommand) -> Result<()> {
        let published = self.publisher.publish_command(&self.topic, command).await;
        match &published {
            Ok(()) => tracing::info!("[COMMAND] {} -> {}", command, self.topic),
            Err(e) => tracing::warn!("[COMMAND] publish of {} to {} failed: {:#}", command, self.topic, e),
        }
        let clients = self.hub.publish_status(command);
        tracing::debug!("[COMMAND] status update {} sent to {} clients", command, clients);
        published
    }

    /// dispatch and wait for a reading that shows the new state
    ///
    /// an Err means the publish itself failed
    pub async fn dispatch_confirmed(&self, command: MotorCommand) -> Result<CommandOutcome> {
        let Some(field) = self.confirm_field.as_deref() else {
            self.dispatch(command).await?;
            return Ok(CommandOutcome::Unverified);
        };

        // subscribe before publishing so a fast reply cannot slip past
        let mut events = self.hub.subscribe().events;
        self.dispatch(command).await?;

        let started = Instant::now();
        let deadline = started + self.confirm_timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => {
                    tracing::warn!("[COMMAND] {} not confirmed within {:?}", command, self.confirm_timeout);
                    return Ok(CommandOutcome::TimedOut {
                        timeout_ms: self.confirm_timeout.as_millis() as u64,
                    });
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    // the skipped readings are gone; the cache holds the newest one
                    tracing::debug!("[COMMAND] confirmation watcher skipped {} events", skipped);
                    if self.hub.latest().field_str(field) == Some(command.as_str()) {
                        return Ok(confirmed(started));
                    }
                    continue;
                }
                Ok(Err(RecvError::Closed)) => {
                    return Ok(CommandOutcome::TimedOut {
                        timeout_ms: self.confirm_timeout.as_millis() as u64,
                    });
                }
                Ok(Ok(event)) => event,
            };

            if let ServerEvent::SensorData(reading) = event {
                if reading.field_str(field) == Some(command.as_str()) {
                    let outcome = confirmed(started);
                    tracing::info!("[COMMAND] {} confirmed by {}", command, field);
                    return Ok(outcome);
                }
            }
        }
    }
}

fn confirmed(started: Instant) -> CommandOutcome {
    CommandOutcome::Confirmed { elapsed_ms: started.elapsed().as_millis() as u64 }
}
