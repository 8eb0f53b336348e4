//! Safety-side value types shared by the kernel, the runtime, and the bus.

use serde::{Deserialize, Serialize};

/// The single authoritative safety state owned by the safety state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyState {
    /// Interlocks satisfied, system idle.
    Safe,
    /// Operator has armed the system; treatment may start.
    Armed,
    /// Treatment in progress, laser output permitted.
    Treating,
    /// At least one interlock is not satisfied.
    Unsafe,
    /// Latched emergency stop; only an explicit clear leaves this state.
    EmergencyStop,
}

impl SafetyState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Armed => "ARMED",
            Self::Treating => "TREATING",
            Self::Unsafe => "UNSAFE",
            Self::EmergencyStop => "EMERGENCY_STOP",
        }
    }
}

impl std::fmt::Display for SafetyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three independent interlock inputs. Each field has exactly one
/// external writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterlockSet {
    /// Hardware interlock reported by the GPIO peer (motor + vibration).
    pub gpio_ok: bool,
    /// An active subject session exists.
    pub session_valid: bool,
    /// Requested laser power is within the configured limit.
    pub power_limit_ok: bool,
}

impl InterlockSet {
    /// `true` when every interlock is satisfied.
    pub fn all_satisfied(&self) -> bool {
        self.gpio_ok && self.session_valid && self.power_limit_ok
    }

    /// Human-readable name of the first unsatisfied interlock, if any.
    pub fn first_fault(&self) -> Option<&'static str> {
        if !self.gpio_ok {
            Some("GPIO interlock not satisfied")
        } else if !self.session_valid {
            Some("no valid session")
        } else if !self.power_limit_ok {
            Some("power limit exceeded")
        } else {
            None
        }
    }
}

/// Point-in-time snapshot returned by
/// `SafetyStateMachine::get_interlock_details`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterlockDetails {
    pub gpio_ok: bool,
    pub session_valid: bool,
    pub power_limit_ok: bool,
    pub emergency_stop: bool,
    pub developer_bypass: bool,
    pub state: SafetyState,
    pub laser_enable_permitted: bool,
}

/// Named safety events published alongside state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyEventKind {
    InterlockFault,
    InterlockRestored,
    Armed,
    Disarmed,
    TreatmentStarted,
    TreatmentStopped,
    EmergencyStop,
    EmergencyStopCleared,
    TransitionRejected,
    DeveloperBypass,
}

/// Counters maintained by the watchdog heartbeat transmitter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatStats {
    pub sent_count: u64,
    pub failed_count: u64,
    /// Reset to zero by any successful send.
    pub consecutive_failures: u32,
}
