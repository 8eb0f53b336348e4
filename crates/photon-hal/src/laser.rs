//! Laser port: drive current and output enable.
//!
//! Exactly one controller owns a laser port; nothing else writes to its
//! transport.  In practice that owner is the protocol execution engine.

use photon_types::PhotonError;

/// A current-controlled laser driver.
pub trait LaserDriver: Send + Sync {
    /// Stable identifier for this driver, e.g. `"treatment_laser"`.
    fn id(&self) -> &str;

    /// Command the drive current in milliamps.
    ///
    /// # Errors
    ///
    /// Returns [`PhotonError::HardwareFault`] if the driver rejects the value
    /// or the transport fails.
    fn set_current(&mut self, milliamps: f64) -> Result<(), PhotonError>;

    /// Switch the optical output on or off.
    ///
    /// # Errors
    ///
    /// Returns [`PhotonError::HardwareFault`] if the command cannot be applied.
    fn set_output(&mut self, enabled: bool) -> Result<(), PhotonError>;

    /// Most recently commanded current in milliamps.
    fn current(&self) -> f64;

    /// Whether output is currently enabled.
    fn output_enabled(&self) -> bool;
}
