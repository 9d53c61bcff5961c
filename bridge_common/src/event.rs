//! Engine-originated events.
//!
//! The engine emits opaque events (type code + JSON payload) addressed to the client that drives
//! its session. The bridge forwards them untouched; clients decode the known kinds with
//! [`EngineEvent::decode`].
use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, FromRepr};

use crate::command::SessionHandle;
use crate::error::BridgeError;
use crate::result::Result;

/// Known event type codes.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, FromRepr)]
#[repr(i32)]
pub enum EngineEventType {
    LastTimeBar = 1,
    ChartEvent = 2,
    OnLockTicks = 3,
}

/// Opaque event as transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Event type code, see [`EngineEventType`].
    pub event_type: i32,
    /// JSON payload.
    pub payload: String,
    /// Session that emitted the event.
    pub expert_handle: SessionHandle,
}

/// A closed bar.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimeBar {
    pub symbol: String,
    #[serde(rename = "MtOpenTime")]
    pub open_time: i32,
    #[serde(rename = "MtCloseTime")]
    pub close_time: i32,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
}

/// Chart interaction reported by the engine.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChartEvent {
    pub chart_id: i64,
    pub event_id: i32,
    pub lparam: i64,
    pub dparam: f64,
    pub sparam: String,
}

/// Tester paused ticks on an instrument.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LockTicks {
    pub instrument: String,
}

/// Decoded form of an [`EngineEvent`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    LastTimeBar(TimeBar),
    ChartEvent(ChartEvent),
    OnLockTicks(LockTicks),
    /// Type code the bridge does not know; payload left as is.
    Unknown { event_type: i32, payload: String },
}

impl EngineEvent {
    /// Builds an event of a known type from a typed payload.
    pub fn encode<T: Serialize>(
        event_type: EngineEventType,
        payload: &T,
        expert_handle: SessionHandle,
    ) -> Result<Self> {
        Ok(EngineEvent {
            event_type: event_type as i32,
            payload: serde_json::to_string(payload)?,
            expert_handle,
        })
    }

    /// Known type of this event, if any.
    pub fn kind(&self) -> Option<EngineEventType> {
        EngineEventType::from_repr(self.event_type)
    }

    /// Decodes the payload of known event types.
    pub fn decode(&self) -> Result<DecodedEvent> {
        let parse_error = |e: serde_json::Error| {
            BridgeError::Protocol(format!(
                "event {} payload of {} bytes failed to parse: {e}",
                self.event_type,
                self.payload.len()
            ))
        };
        Ok(match self.kind() {
            Some(EngineEventType::LastTimeBar) => {
                DecodedEvent::LastTimeBar(serde_json::from_str(&self.payload).map_err(parse_error)?)
            }
            Some(EngineEventType::ChartEvent) => {
                DecodedEvent::ChartEvent(serde_json::from_str(&self.payload).map_err(parse_error)?)
            }
            Some(EngineEventType::OnLockTicks) => {
                DecodedEvent::OnLockTicks(serde_json::from_str(&self.payload).map_err(parse_error)?)
            }
            None => DecodedEvent::Unknown {
                event_type: self.event_type,
                payload: self.payload.clone(),
            },
        })
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventType = {}; Payload = {}; ExpertHandle = {}",
            self.event_type, self.payload, self.expert_handle
        )
    }
}
