//! `photon-types` – shared vocabulary of the laser safety core.
//!
//! Every other crate in the workspace speaks in these types: the safety
//! state, the protocol document model, execution records, bus events, and
//! the single [`PhotonError`] error enum.

pub mod execution;
pub mod protocol;
pub mod safety;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use execution::{
    ExecutionLogEntry, ExecutionOutcome, ExecutionState, ExecutionSummary, LogEvent,
};
pub use protocol::{
    ActionKind, ActionType, LoopParams, MoveActuatorParams, Protocol, ProtocolAction,
    RampLaserPowerParams, RampType, SafetyLimits, SetLaserPowerParams, WaitParams,
};
pub use safety::{
    HeartbeatStats, InterlockDetails, InterlockSet, SafetyEventKind, SafetyState,
};

/// Unified event wrapper for the headless event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"photon-kernel::safety"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp a new event with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Every notification the core emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    // ── safety ───────────────────────────────────────────────────────────
    SafetyStateChanged {
        state: SafetyState,
        status: String,
    },
    LaserEnableChanged {
        enabled: bool,
    },
    SafetyEvent {
        kind: SafetyEventKind,
        message: String,
    },
    // ── interlock ────────────────────────────────────────────────────────
    /// Emitted on every poll.
    InterlockLevel {
        satisfied: bool,
        vibration_g: f32,
        consecutive: u32,
    },
    /// Emitted only when the satisfied flag flips.
    InterlockChanged {
        satisfied: bool,
    },
    // ── execution ────────────────────────────────────────────────────────
    ExecutionStateChanged {
        state: ExecutionState,
    },
    ExecutionProgress {
        fraction: f64,
    },
    ActionStarted {
        action_id: u32,
        action_type: ActionType,
    },
    ActionCompleted {
        action_id: u32,
        action_type: ActionType,
    },
    RampStep {
        action_id: u32,
        step: u32,
        total_steps: u32,
        power_watts: f64,
    },
    RecordingRequested {
        active: bool,
    },
    // ── watchdog ─────────────────────────────────────────────────────────
    HeartbeatStatus(HeartbeatStats),
    WatchdogStopped,
    WatchdogCriticalFault {
        consecutive_failures: u32,
        message: String,
    },
}

/// Global error type spanning hardware, wire protocol, documents and config.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhotonError {
    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Peer not connected: {0}")]
    NotConnected(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Wire protocol error: {0}")]
    Protocol(String),

    #[error("Invalid protocol document: {0}")]
    InvalidProtocol(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("I/O Error: {0}")]
    Io(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Busy: {0}")]
    Busy(String),
}

impl PhotonError {
    /// Convenience constructor for the most common variant.
    pub fn hardware(component: impl Into<String>, details: impl Into<String>) -> Self {
        Self::HardwareFault {
            component: component.into(),
            details: details.into(),
        }
    }
}

impl From<std::io::Error> for PhotonError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_roundtrip() {
        let event = Event::new(
            "photon-kernel::safety",
            EventPayload::SafetyStateChanged {
                state: SafetyState::Armed,
                status: "System armed".to_string(),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        assert_eq!(event.payload, back.payload);
    }

    #[test]
    fn photon_error_display() {
        let err = PhotonError::hardware("laser", "overcurrent");
        assert!(err.to_string().contains("laser"));
        assert!(err.to_string().contains("overcurrent"));

        let err = PhotonError::Timeout("WDT_RESET".into());
        assert!(err.to_string().contains("WDT_RESET"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PhotonError = io.into();
        assert!(matches!(err, PhotonError::Io(msg) if msg.contains("pipe closed")));
    }
}
