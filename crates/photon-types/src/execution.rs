//! Execution-side value types: run state, audit log, and run summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ActionType;

/// Lifecycle of one protocol run.
///
/// Created [`Idle`][Self::Idle]; [`Stopped`][Self::Stopped],
/// [`Completed`][Self::Completed] and [`Error`][Self::Error] are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Error)
    }

    /// A run is in flight (running or paused).
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    Start,
    Complete,
    Timeout,
    Error,
}

/// One append-only audit record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub action_id: u32,
    pub action_type: ActionType,
    pub timestamp: DateTime<Utc>,
    pub event: LogEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of `ProtocolExecutionEngine::execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub message: String,
}

impl ExecutionOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Snapshot returned by `ProtocolExecutionEngine::get_execution_summary`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub run_id: Option<Uuid>,
    pub protocol_name: String,
    pub state: ExecutionState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_s: Option<f64>,
    /// Number of actions started during the run, loop iterations included.
    pub action_count: usize,
    pub recorded: bool,
    /// Non-critical failures that were logged and skipped.
    pub failures: Vec<String>,
    pub log: Vec<ExecutionLogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ExecutionState::Stopped.is_terminal());
        assert!(ExecutionState::Completed.is_terminal());
        assert!(ExecutionState::Error.is_terminal());
        assert!(!ExecutionState::Idle.is_terminal());
        assert!(!ExecutionState::Paused.is_terminal());
        assert!(ExecutionState::Paused.is_active());
    }

    #[test]
    fn log_entry_omits_empty_error() {
        let entry = ExecutionLogEntry {
            action_id: 3,
            action_type: ActionType::Wait,
            timestamp: Utc::now(),
            event: LogEvent::Start,
            error: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("error"));
        assert!(json.contains("\"start\""));
    }
}
