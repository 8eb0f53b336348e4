//! Linear actuator port (stage / probe positioning).
//!
//! Positions are in micrometres, speeds in micrometres per second.

use photon_types::PhotonError;
use tokio::sync::watch;

/// A position-controlled linear actuator.
pub trait ActuatorDriver: Send + Sync {
    /// Stable identifier for this actuator, e.g. `"stage_z"`.
    fn id(&self) -> &str;

    /// Set the travel speed used by subsequent moves.
    ///
    /// # Errors
    ///
    /// Returns [`PhotonError::HardwareFault`] if the command cannot be applied.
    fn set_speed(&mut self, um_per_s: f64) -> Result<(), PhotonError>;

    /// Command a move to the absolute position `target_um`.
    ///
    /// # Errors
    ///
    /// Returns [`PhotonError::HardwareFault`] if the command cannot be applied.
    fn set_position(&mut self, target_um: f64) -> Result<(), PhotonError>;

    /// Last known position in micrometres.
    fn position(&self) -> f64;

    /// Position-reached feedback, when the hardware provides it.
    ///
    /// The receiver yields the position each time the actuator reports that
    /// a move has finished.  Drivers without feedback return `None` and the
    /// caller falls back to estimating travel time.
    fn position_feedback(&self) -> Option<watch::Receiver<f64>> {
        None
    }
}
