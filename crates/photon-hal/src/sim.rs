//! In-process simulated ports for CI and bench testing without hardware.
//!
//! Absence of a real port is expressed by wiring one of these in, never by
//! `Option` checks scattered through the core.  Each simulator is a cheap
//! [`Clone`] handle over shared state, so a test can hand one clone to the
//! owning controller and keep another to inspect what was commanded.
//!
//! # Example
//!
//! ```rust
//! use photon_hal::laser::LaserDriver;
//! use photon_hal::sim::SimLaser;
//!
//! let probe = SimLaser::new("treatment_laser");
//! let mut port: Box<dyn LaserDriver> = Box::new(probe.clone());
//! port.set_current(120.0).unwrap();
//! assert_eq!(probe.current(), 120.0);
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use photon_types::PhotonError;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::debug;

use crate::actuator::ActuatorDriver;
use crate::gpio::GpioPeer;
use crate::gpio_protocol::{GpioCommand, GpioResponse};
use crate::laser::LaserDriver;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated laser
// ────────────────────────────────────────────────────────────────────────────

/// A command received by [`SimLaser`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LaserCommand {
    Current(f64),
    Output(bool),
}

#[derive(Default)]
struct SimLaserState {
    current: f64,
    output: bool,
    fail_remaining: u32,
    history: Vec<LaserCommand>,
}

/// Simulated laser driver that records every command.
#[derive(Clone)]
pub struct SimLaser {
    id: String,
    state: Arc<Mutex<SimLaserState>>,
}

impl SimLaser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(SimLaserState::default())),
        }
    }

    /// Make the next `n` commands fail with a hardware fault.
    pub fn fail_next(&self, n: u32) {
        lock(&self.state).fail_remaining = n;
    }

    /// Every command received so far, failed attempts included.
    pub fn commands(&self) -> Vec<LaserCommand> {
        lock(&self.state).history.clone()
    }

    pub fn current(&self) -> f64 {
        lock(&self.state).current
    }

    pub fn output(&self) -> bool {
        lock(&self.state).output
    }

    fn apply(&self, command: LaserCommand) -> Result<(), PhotonError> {
        let mut state = lock(&self.state);
        state.history.push(command);
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(PhotonError::hardware(&self.id, "injected fault"));
        }
        match command {
            LaserCommand::Current(ma) => state.current = ma,
            LaserCommand::Output(on) => state.output = on,
        }
        Ok(())
    }
}

impl LaserDriver for SimLaser {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_current(&mut self, milliamps: f64) -> Result<(), PhotonError> {
        self.apply(LaserCommand::Current(milliamps))
    }

    fn set_output(&mut self, enabled: bool) -> Result<(), PhotonError> {
        self.apply(LaserCommand::Output(enabled))
    }

    fn current(&self) -> f64 {
        SimLaser::current(self)
    }

    fn output_enabled(&self) -> bool {
        self.output()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated actuator
// ────────────────────────────────────────────────────────────────────────────

/// A command received by [`SimActuator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActuatorCommand {
    Speed(f64),
    Position(f64),
}

#[derive(Default)]
struct SimActuatorState {
    position: f64,
    fail_remaining: u32,
    history: Vec<ActuatorCommand>,
    feedback: Option<watch::Sender<f64>>,
}

/// Simulated actuator that arrives instantly at every commanded position.
#[derive(Clone)]
pub struct SimActuator {
    id: String,
    state: Arc<Mutex<SimActuatorState>>,
}

impl SimActuator {
    /// An actuator without position feedback.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(SimActuatorState::default())),
        }
    }

    /// Enable position-reached feedback.
    pub fn with_feedback(self) -> Self {
        {
            let mut state = lock(&self.state);
            let (tx, _) = watch::channel(state.position);
            state.feedback = Some(tx);
        }
        self
    }

    pub fn fail_next(&self, n: u32) {
        lock(&self.state).fail_remaining = n;
    }

    pub fn commands(&self) -> Vec<ActuatorCommand> {
        lock(&self.state).history.clone()
    }

    fn apply(&self, command: ActuatorCommand) -> Result<(), PhotonError> {
        let mut state = lock(&self.state);
        state.history.push(command);
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(PhotonError::hardware(&self.id, "injected fault"));
        }
        if let ActuatorCommand::Position(target) = command {
            state.position = target;
            if let Some(tx) = &state.feedback {
                tx.send_replace(target);
            }
        }
        Ok(())
    }
}

impl ActuatorDriver for SimActuator {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_speed(&mut self, um_per_s: f64) -> Result<(), PhotonError> {
        self.apply(ActuatorCommand::Speed(um_per_s))
    }

    fn set_position(&mut self, target_um: f64) -> Result<(), PhotonError> {
        self.apply(ActuatorCommand::Position(target_um))
    }

    fn position(&self) -> f64 {
        lock(&self.state).position
    }

    fn position_feedback(&self) -> Option<watch::Receiver<f64>> {
        lock(&self.state).feedback.as_ref().map(|tx| tx.subscribe())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated GPIO microcontroller
// ────────────────────────────────────────────────────────────────────────────

/// Vibration reported per unit of PWM duty when no override is set; full
/// duty reads 1.5 g, comfortably above the 0.8 g interlock threshold.
const G_PER_DUTY: f32 = 1.5 / 255.0;

/// Oldest GPIO requests are dropped beyond this many.
const GPIO_HISTORY_LIMIT: usize = 4096;

struct SimGpioState {
    connected: bool,
    motor_speed: u8,
    vibration_override: Option<f32>,
    heartbeats: u64,
    heartbeat_failures_remaining: u32,
    heartbeats_always_fail: bool,
    history: Vec<GpioCommand>,
}

/// Simulated GPIO microcontroller.
///
/// Vibration tracks the commanded motor duty unless pinned with
/// [`SimGpio::set_vibration`].
#[derive(Clone)]
pub struct SimGpio {
    state: Arc<Mutex<SimGpioState>>,
}

impl SimGpio {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimGpioState {
                connected: true,
                motor_speed: 0,
                vibration_override: None,
                heartbeats: 0,
                heartbeat_failures_remaining: 0,
                heartbeats_always_fail: false,
                history: Vec::new(),
            })),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }

    /// Pin the vibration reading regardless of motor duty.
    pub fn set_vibration(&self, g: f32) {
        lock(&self.state).vibration_override = Some(g);
    }

    /// Return to duty-derived vibration readings.
    pub fn clear_vibration_override(&self) {
        lock(&self.state).vibration_override = None;
    }

    /// Answer the next `n` `WDT_RESET` requests with an error.
    pub fn fail_heartbeats(&self, n: u32) {
        lock(&self.state).heartbeat_failures_remaining = n;
    }

    /// Answer every `WDT_RESET` with an error until cleared.
    pub fn set_heartbeats_failing(&self, failing: bool) {
        lock(&self.state).heartbeats_always_fail = failing;
    }

    pub fn motor_speed(&self) -> u8 {
        lock(&self.state).motor_speed
    }

    /// Number of successfully acknowledged watchdog feeds.
    pub fn heartbeat_count(&self) -> u64 {
        lock(&self.state).heartbeats
    }

    pub fn commands(&self) -> Vec<GpioCommand> {
        lock(&self.state).history.clone()
    }

    /// Produce the peer's answer to `command`, updating simulated state.
    pub fn respond(&self, command: GpioCommand) -> GpioResponse {
        let mut state = lock(&self.state);
        if state.history.len() == GPIO_HISTORY_LIMIT {
            state.history.remove(0);
        }
        state.history.push(command);
        match command {
            GpioCommand::MotorSpeed(pwm) => {
                state.motor_speed = pwm;
                GpioResponse::Ok(command.encode())
            }
            GpioCommand::WdtReset => {
                if state.heartbeats_always_fail {
                    return GpioResponse::Error("watchdog reset rejected".to_string());
                }
                if state.heartbeat_failures_remaining > 0 {
                    state.heartbeat_failures_remaining -= 1;
                    return GpioResponse::Error("watchdog reset rejected".to_string());
                }
                state.heartbeats += 1;
                GpioResponse::Ok(command.encode())
            }
            GpioCommand::GetVibrationLevel => GpioResponse::Vibration(
                state
                    .vibration_override
                    .unwrap_or(f32::from(state.motor_speed) * G_PER_DUTY),
            ),
            GpioCommand::Ping => GpioResponse::Ok(command.encode()),
        }
    }

    /// Act as the device end of a byte stream, answering one line at a time
    /// until the host hangs up.
    pub async fn serve<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let response = match GpioCommand::parse(&line) {
                Ok(command) => self.respond(command),
                Err(e) => GpioResponse::Error(e.to_string()),
            };
            let out = format!("{}\n", response.encode());
            if writer.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
        debug!("simulated GPIO peer: host hung up");
    }
}

impl Default for SimGpio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GpioPeer for SimGpio {
    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn request(&self, command: GpioCommand) -> Result<GpioResponse, PhotonError> {
        if !self.is_connected() {
            return Err(PhotonError::NotConnected("simulated GPIO peer".to_string()));
        }
        match self.respond(command) {
            GpioResponse::Error(msg) => Err(PhotonError::hardware("gpio", msg)),
            response => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_laser_injected_faults_are_consumed() {
        let probe = SimLaser::new("laser");
        let mut port = probe.clone();
        probe.fail_next(1);
        assert!(port.set_current(50.0).is_err());
        port.set_current(50.0).unwrap();
        assert_eq!(probe.current(), 50.0);
        assert_eq!(probe.commands().len(), 2);
    }

    #[test]
    fn sim_actuator_feedback_reports_arrival() {
        let probe = SimActuator::new("stage").with_feedback();
        let mut port = probe.clone();
        let rx = port.position_feedback().expect("feedback enabled");
        port.set_position(750.0).unwrap();
        assert_eq!(*rx.borrow(), 750.0);
        assert_eq!(port.position(), 750.0);
    }

    #[test]
    fn sim_actuator_without_feedback() {
        let act = SimActuator::new("stage");
        assert!(act.position_feedback().is_none());
    }

    #[test]
    fn sim_gpio_vibration_follows_motor_duty() {
        let gpio = SimGpio::new();
        assert_eq!(gpio.respond(GpioCommand::GetVibrationLevel), GpioResponse::Vibration(0.0));
        gpio.respond(GpioCommand::MotorSpeed(255));
        match gpio.respond(GpioCommand::GetVibrationLevel) {
            GpioResponse::Vibration(g) => assert!(g > 0.8),
            other => panic!("unexpected {other:?}"),
        }
        gpio.set_vibration(0.2);
        assert_eq!(gpio.respond(GpioCommand::GetVibrationLevel), GpioResponse::Vibration(0.2));
    }

    #[tokio::test]
    async fn sim_gpio_disconnected_refuses_requests() {
        let gpio = SimGpio::new();
        gpio.set_connected(false);
        let err = gpio.reset_watchdog().await.unwrap_err();
        assert!(matches!(err, PhotonError::NotConnected(_)));
        assert_eq!(gpio.heartbeat_count(), 0);
    }
}
