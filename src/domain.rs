//! ==============================================================================
//! domain.rs - wire types shared by the broker bridge and the websocket clients
//! ==============================================================================
//!
//! purpose:
//!     defines the payloads that move through the relay:
//!     - SensorReading: the opaque telemetry snapshot decoded from mqtt
//!     - MotorCommand: the ON/OFF token a client asks us to publish
//!     - ServerEvent / ClientEvent: the websocket envelopes
//!
//! wire format:
//!     every websocket text frame is `{"event": <name>, "data": <payload>}`
//!     - sensor_data          server -> client   {..reading..}
//!     - motor_status_update  server -> client   "ON" | "OFF"
//!     - error                server -> client   {"message": "..."}
//!     - motor_control        client -> server   {"command": "ON" | "OFF"}
//!
//! ==============================================================================

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// a generic sensor reading
/// no fixed schema - fields vary by plant and firmware
/// examples:
/// - {"plant_status": "RUNNING", "motor1_status": "ON"}
/// - {"voltage_r": 229.4, "current_r": 3.1, "valve1_status": "OPEN"}
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorReading(Map<String, Value>);

impl SensorReading {
    /// decode a broker payload
    /// the payload must be a json object; any other json value is rejected
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload).context("payload is not valid json")?;
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(anyhow!("payload is json but not an object: {}", kind_of(&other))),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// the field rendered as a plain string, if it is a json string
    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// motor on/off token
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotorCommand {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl MotorCommand {
    /// the token as it goes on the wire and to the broker
    pub fn as_str(&self) -> &'static str {
        match self {
            MotorCommand::On => "ON",
            MotorCommand::Off => "OFF",
        }
    }
}

impl fmt::Display for MotorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MotorCommand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ON" => Ok(MotorCommand::On),
            "OFF" => Ok(MotorCommand::Off),
            other => Err(anyhow!("unknown motor command: {:?}", other)),
        }
    }
}

/// events pushed from the relay to every browser client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    SensorData(SensorReading),
    MotorStatusUpdate(MotorCommand),
    Error { message: String },
}

/// events a browser client may send
///
/// the command stays a raw string here so that an unknown token produces an
/// `error` event for the sender instead of a generic decode failure
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    MotorControl { command: String },
}
