//! Treatment protocol document model.
//!
//! A [`Protocol`] is the operator-authored, immutable description of one
//! treatment run.  On disk it is a single JSON document:
//!
//! ```json
//! {
//!   "protocol_name": "Standard 10 min",
//!   "version": "1.0",
//!   "description": "",
//!   "actions": [
//!     { "action_id": 1, "type": "SetLaserPower",
//!       "parameters": { "power_watts": 2.0 }, "notes": "" }
//!   ],
//!   "safety_limits": { "max_power_watts": 10.0, ... }
//! }
//! ```
//!
//! Action payloads are adjacently tagged (`type` + `parameters`) so the file
//! stays readable and editable by hand.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Hard limits a protocol declares for itself.  Validation rejects any
/// action that exceeds them before a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SafetyLimits {
    pub max_power_watts: f64,
    /// Upper bound for any single timed action (wait or ramp).
    pub max_duration_s: f64,
    pub min_position_um: f64,
    pub max_position_um: f64,
    pub max_speed_um_per_s: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_power_watts: 10.0,
            max_duration_s: 600.0,
            min_position_um: 0.0,
            max_position_um: 50_000.0,
            max_speed_um_per_s: 5_000.0,
        }
    }
}

/// Interpolation curve for [`ActionKind::RampLaserPower`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RampType {
    #[default]
    Linear,
    Logarithmic,
    Exponential,
    Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SetLaserPowerParams {
    pub power_watts: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RampLaserPowerParams {
    pub start_power_watts: f64,
    pub end_power_watts: f64,
    pub duration_s: f64,
    #[serde(default)]
    pub ramp_type: RampType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MoveActuatorParams {
    pub target_position_um: f64,
    pub speed_um_per_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WaitParams {
    pub duration_s: f64,
}

/// A nested action sequence repeated `repeat_count` times, or forever when
/// `repeat_count` is [`LoopParams::INFINITE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LoopParams {
    pub repeat_count: i32,
    pub actions: Vec<ProtocolAction>,
}

impl LoopParams {
    pub const INFINITE: i32 = -1;

    pub fn is_infinite(&self) -> bool {
        self.repeat_count == Self::INFINITE
    }
}

/// Typed action payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "parameters")]
pub enum ActionKind {
    SetLaserPower(SetLaserPowerParams),
    RampLaserPower(RampLaserPowerParams),
    MoveActuator(MoveActuatorParams),
    Wait(WaitParams),
    Loop(LoopParams),
}

/// Payload-free discriminant of [`ActionKind`], used in logs and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ActionType {
    SetLaserPower,
    RampLaserPower,
    MoveActuator,
    Wait,
    Loop,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SetLaserPower => "SetLaserPower",
            Self::RampLaserPower => "RampLaserPower",
            Self::MoveActuator => "MoveActuator",
            Self::Wait => "Wait",
            Self::Loop => "Loop",
        }
    }

    /// Actions that drive hardware.  These are retried on failure and are
    /// critical: exhausting their retries aborts the run.
    pub fn is_hardware_actuation(self) -> bool {
        matches!(
            self,
            Self::SetLaserPower | Self::RampLaserPower | Self::MoveActuator
        )
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ActionKind {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::SetLaserPower(_) => ActionType::SetLaserPower,
            Self::RampLaserPower(_) => ActionType::RampLaserPower,
            Self::MoveActuator(_) => ActionType::MoveActuator,
            Self::Wait(_) => ActionType::Wait,
            Self::Loop(_) => ActionType::Loop,
        }
    }
}

/// One step of a protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProtocolAction {
    pub action_id: u32,
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default)]
    pub notes: String,
}

impl ProtocolAction {
    pub fn new(action_id: u32, kind: ActionKind) -> Self {
        Self {
            action_id,
            kind,
            notes: String::new(),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn action_type(&self) -> ActionType {
        self.kind.action_type()
    }
}

/// A complete treatment protocol document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Protocol {
    pub protocol_name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub actions: Vec<ProtocolAction>,
    #[serde(default)]
    pub safety_limits: SafetyLimits,
}

impl Protocol {
    pub fn new(protocol_name: impl Into<String>) -> Self {
        Self {
            protocol_name: protocol_name.into(),
            version: "1.0".to_string(),
            description: String::new(),
            actions: Vec::new(),
            safety_limits: SafetyLimits::default(),
        }
    }

    /// Builder-style helper appending one action.
    pub fn with_action(mut self, action: ProtocolAction) -> Self {
        self.actions.push(action);
        self
    }

    /// Number of actions in the whole tree, loop bodies counted once.
    pub fn total_action_count(&self) -> usize {
        fn count(actions: &[ProtocolAction]) -> usize {
            actions
                .iter()
                .map(|a| match &a.kind {
                    ActionKind::Loop(l) => 1 + count(&l.actions),
                    _ => 1,
                })
                .sum()
        }
        count(&self.actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Protocol {
        Protocol::new("sample")
            .with_action(ProtocolAction::new(
                1,
                ActionKind::SetLaserPower(SetLaserPowerParams { power_watts: 1.5 }),
            ))
            .with_action(ProtocolAction::new(
                2,
                ActionKind::Loop(LoopParams {
                    repeat_count: 2,
                    actions: vec![ProtocolAction::new(
                        3,
                        ActionKind::Wait(WaitParams { duration_s: 0.5 }),
                    )],
                }),
            ))
    }

    #[test]
    fn action_serializes_with_type_and_parameters() {
        let action = ProtocolAction::new(
            7,
            ActionKind::MoveActuator(MoveActuatorParams {
                target_position_um: 1200.0,
                speed_um_per_s: 300.0,
            }),
        )
        .with_notes("approach");
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["action_id"], 7);
        assert_eq!(value["type"], "MoveActuator");
        assert_eq!(value["parameters"]["target_position_um"], 1200.0);
        assert_eq!(value["notes"], "approach");
    }

    #[test]
    fn hand_written_document_parses() {
        let raw = r#"{
            "protocol_name": "ramp test",
            "version": "2.1",
            "actions": [
                {"action_id": 1, "type": "RampLaserPower",
                 "parameters": {"start_power_watts": 0, "end_power_watts": 4,
                                "duration_s": 2, "ramp_type": "LOGARITHMIC"}},
                {"action_id": 2, "type": "Wait", "parameters": {"duration_s": 1}}
            ]
        }"#;
        let protocol: Protocol = serde_json::from_str(raw).unwrap();
        assert_eq!(protocol.actions.len(), 2);
        assert_eq!(protocol.safety_limits, SafetyLimits::default());
        match &protocol.actions[0].kind {
            ActionKind::RampLaserPower(p) => {
                assert_eq!(p.ramp_type, RampType::Logarithmic);
                assert!((p.end_power_watts - 4.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn total_action_count_includes_loop_bodies() {
        assert_eq!(sample().total_action_count(), 3);
    }

    #[test]
    fn hardware_actuation_taxonomy() {
        assert!(ActionType::SetLaserPower.is_hardware_actuation());
        assert!(ActionType::RampLaserPower.is_hardware_actuation());
        assert!(ActionType::MoveActuator.is_hardware_actuation());
        assert!(!ActionType::Wait.is_hardware_actuation());
        assert!(!ActionType::Loop.is_hardware_actuation());
    }

    #[test]
    fn unknown_action_type_is_rejected() {
        let raw = r#"{"action_id": 1, "type": "Teleport", "parameters": {}}"#;
        assert!(serde_json::from_str::<ProtocolAction>(raw).is_err());
    }
}
