//! [`InterlockValidator`] – dual-signal hardware interlock.
//!
//! The smoothing motor must be both *commanded on* and *observed vibrating*
//! before the GPIO interlock is reported satisfied.  Vibration must exceed
//! the threshold for a run of consecutive samples (debounce); a single
//! sample at or below threshold, a read failure, or a stop command clears
//! the interlock immediately.
//!
//! When a [`SafetyStateMachine`] is attached, the validator pushes its
//! result into `set_gpio_ok` after every poll and every motor command, so
//! the safety machine always sees the current hardware status.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use photon_hal::GpioPeer;
use photon_middleware::{EventBus, Topic};
use photon_types::{EventPayload, PhotonError};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::safety::SafetyStateMachine;

const SOURCE: &str = "photon-kernel::interlock";

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Debounce parameters for the vibration interlock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterlockConfig {
    /// A sample qualifies only when strictly above this level (g).
    pub vibration_threshold_g: f32,
    /// Consecutive qualifying samples required before the interlock holds.
    pub debounce_samples: u32,
    /// Period of the background monitor started by
    /// [`InterlockValidator::spawn_monitor`].
    pub poll_interval_ms: u64,
}

impl Default for InterlockConfig {
    fn default() -> Self {
        Self {
            vibration_threshold_g: 0.8,
            debounce_samples: 3,
            poll_interval_ms: 100,
        }
    }
}

impl InterlockConfig {
    pub fn validate(&self) -> Result<(), PhotonError> {
        if !self.vibration_threshold_g.is_finite() || self.vibration_threshold_g < 0.0 {
            return Err(PhotonError::Config(format!(
                "vibration_threshold_g must be a non-negative number, got {}",
                self.vibration_threshold_g
            )));
        }
        if self.debounce_samples == 0 {
            return Err(PhotonError::Config("debounce_samples must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(PhotonError::Config("poll_interval_ms must be non-zero".into()));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Validator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Debounce {
    commanded_on: bool,
    consecutive: u32,
    satisfied: bool,
}

/// Combines the motor command with debounced vibration feedback.
pub struct InterlockValidator {
    config: InterlockConfig,
    peer: Arc<dyn GpioPeer>,
    safety: Option<Arc<SafetyStateMachine>>,
    bus: EventBus,
    state: Mutex<Debounce>,
}

impl InterlockValidator {
    pub fn new(config: InterlockConfig, peer: Arc<dyn GpioPeer>, bus: EventBus) -> Self {
        Self {
            config,
            peer,
            safety: None,
            bus,
            state: Mutex::new(Debounce::default()),
        }
    }

    /// Forward every result to `safety.set_gpio_ok`.
    pub fn with_safety(mut self, safety: Arc<SafetyStateMachine>) -> Self {
        self.safety = Some(safety);
        self
    }

    pub fn config(&self) -> &InterlockConfig {
        &self.config
    }

    /// Command the motor on at `pwm` duty.  A duty of `0` is a stop.
    ///
    /// The interlock is not satisfied by the command alone; the debounce
    /// counter starts from zero and vibration must still be observed.
    pub async fn start_motor(&self, pwm: u8) -> Result<(), PhotonError> {
        if pwm == 0 {
            return self.stop_motor().await;
        }
        self.peer.set_motor_speed(pwm).await?;
        let was_on = {
            let mut state = self.lock();
            let was_on = state.commanded_on;
            state.commanded_on = true;
            if !was_on {
                state.consecutive = 0;
            }
            was_on
        };
        if !was_on {
            info!(pwm, "smoothing motor commanded on");
        }
        self.push_to_safety();
        Ok(())
    }

    /// Command the motor off (`MOTOR_SPEED:0`).
    ///
    /// The interlock clears immediately, even when the command itself fails.
    pub async fn stop_motor(&self) -> Result<(), PhotonError> {
        let result = self.peer.set_motor_speed(0).await;
        if let Err(e) = &result {
            warn!(error = %e, "motor stop command failed; interlock cleared regardless");
        }
        let was_satisfied = {
            let mut state = self.lock();
            let was = state.satisfied;
            *state = Debounce::default();
            was
        };
        info!("smoothing motor commanded off");
        if was_satisfied {
            self.bus.notify(
                Topic::Interlock,
                SOURCE,
                EventPayload::InterlockChanged { satisfied: false },
            );
        }
        self.push_to_safety();
        result
    }

    /// Feed one vibration sample (g) and return the updated status.
    pub fn poll(&self, vibration_g: f32) -> bool {
        self.apply_sample(Some(vibration_g))
    }

    /// Read one sample from the GPIO peer and feed it through [`poll`].
    ///
    /// A read failure counts as a disqualifying sample and is returned to
    /// the caller after the interlock has been cleared.
    ///
    /// [`poll`]: Self::poll
    pub async fn poll_peer(&self) -> Result<bool, PhotonError> {
        match self.peer.read_vibration().await {
            Ok(g) => Ok(self.poll(g)),
            Err(e) => {
                warn!(error = %e, "vibration read failed; treating as no vibration");
                self.apply_sample(None);
                Err(e)
            }
        }
    }

    /// `true` only when the motor is commanded on and the debounced
    /// vibration condition holds.
    pub fn get_safety_status(&self) -> bool {
        let state = self.lock();
        state.commanded_on && state.satisfied
    }

    pub fn is_motor_commanded(&self) -> bool {
        self.lock().commanded_on
    }

    pub fn consecutive_samples(&self) -> u32 {
        self.lock().consecutive
    }

    /// Poll the peer every `poll_interval_ms` on a background task.
    ///
    /// Abort the returned handle to stop monitoring.
    pub fn spawn_monitor(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_millis(self.config.poll_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Failures are already logged and folded into the status.
                let _ = self.poll_peer().await;
            }
        })
    }

    // ── internals ───────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, Debounce> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_sample(&self, sample: Option<f32>) -> bool {
        let threshold = self.config.vibration_threshold_g;
        let required = self.config.debounce_samples.max(1);

        let (changed, satisfied, consecutive) = {
            let mut state = self.lock();
            let qualifying = state.commanded_on
                && sample.is_some_and(|g| g.is_finite() && g > threshold);
            let before = state.satisfied;
            if qualifying {
                state.consecutive = state.consecutive.saturating_add(1);
                if state.consecutive >= required {
                    state.satisfied = true;
                }
            } else {
                state.consecutive = 0;
                state.satisfied = false;
            }
            (
                before != state.satisfied,
                state.commanded_on && state.satisfied,
                state.consecutive,
            )
        };

        debug!(vibration_g = ?sample, consecutive, satisfied, "interlock sample");
        self.bus.notify(
            Topic::Interlock,
            SOURCE,
            EventPayload::InterlockLevel {
                satisfied,
                vibration_g: sample.unwrap_or(0.0),
                consecutive,
            },
        );
        if changed {
            if satisfied {
                info!("GPIO interlock satisfied");
            } else {
                warn!("GPIO interlock lost");
            }
            self.bus.notify(
                Topic::Interlock,
                SOURCE,
                EventPayload::InterlockChanged { satisfied },
            );
        }
        self.push_to_safety();
        satisfied
    }

    fn push_to_safety(&self) {
        if let Some(safety) = &self.safety {
            safety.set_gpio_ok(self.get_safety_status());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon_hal::SimGpio;
    use photon_middleware::TopicReceiver;
    use photon_types::SafetyState;
    use proptest::prelude::*;

    fn validator() -> (InterlockValidator, SimGpio, TopicReceiver) {
        let sim = SimGpio::new();
        let bus = EventBus::default();
        let rx = bus.subscribe_to(Topic::Interlock);
        let v = InterlockValidator::new(InterlockConfig::default(), Arc::new(sim.clone()), bus);
        (v, sim, rx)
    }

    fn edges(rx: &mut TopicReceiver) -> Vec<bool> {
        rx.drain()
            .into_iter()
            .filter_map(|p| match p {
                EventPayload::InterlockChanged { satisfied } => Some(satisfied),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn three_samples_above_threshold_satisfy() {
        let (v, sim, mut rx) = validator();
        v.start_motor(200).await.unwrap();
        assert_eq!(sim.motor_speed(), 200);
        assert!(!v.get_safety_status(), "command alone is not enough");

        assert!(!v.poll(1.0));
        assert!(!v.poll(1.0));
        assert!(v.poll(1.0));
        assert!(v.get_safety_status());
        assert_eq!(edges(&mut rx), vec![true]);
    }

    #[tokio::test]
    async fn one_low_sample_clears_immediately() {
        let (v, _sim, mut rx) = validator();
        v.start_motor(200).await.unwrap();
        for _ in 0..3 {
            v.poll(1.2);
        }
        assert!(v.get_safety_status());
        assert!(!v.poll(0.8), "threshold itself does not qualify");
        assert_eq!(v.consecutive_samples(), 0);
        assert_eq!(edges(&mut rx), vec![true, false]);
    }

    #[tokio::test]
    async fn stop_motor_clears_and_sends_zero() {
        let (v, sim, mut rx) = validator();
        v.start_motor(150).await.unwrap();
        for _ in 0..3 {
            v.poll(1.0);
        }
        v.stop_motor().await.unwrap();
        assert!(!v.get_safety_status());
        assert!(!v.is_motor_commanded());
        assert_eq!(sim.motor_speed(), 0);
        assert_eq!(edges(&mut rx), vec![true, false]);
    }

    #[tokio::test]
    async fn start_motor_with_zero_duty_is_a_stop() {
        let (v, sim, _rx) = validator();
        v.start_motor(0).await.unwrap();
        assert!(!v.is_motor_commanded());
        assert_eq!(sim.commands().len(), 1);
    }

    #[test]
    fn vibration_without_command_never_satisfies() {
        let (v, _sim, mut rx) = validator();
        for _ in 0..10 {
            assert!(!v.poll(5.0));
        }
        assert!(edges(&mut rx).is_empty());
    }

    #[test]
    fn level_notification_every_poll() {
        let (v, _sim, mut rx) = validator();
        v.poll(0.1);
        v.poll(0.2);
        let levels = rx
            .drain()
            .into_iter()
            .filter(|p| matches!(p, EventPayload::InterlockLevel { .. }))
            .count();
        assert_eq!(levels, 2);
    }

    #[tokio::test]
    async fn poll_peer_uses_simulated_vibration() {
        let (v, sim, _rx) = validator();
        v.start_motor(255).await.unwrap();
        for _ in 0..3 {
            v.poll_peer().await.unwrap();
        }
        assert!(v.get_safety_status());

        sim.set_connected(false);
        assert!(v.poll_peer().await.is_err());
        assert!(!v.get_safety_status(), "read failure clears the interlock");
    }

    #[tokio::test]
    async fn pushes_status_into_safety_machine() {
        let bus = EventBus::default();
        let sim = SimGpio::new();
        let safety = Arc::new(SafetyStateMachine::new(bus.clone()));
        safety.set_session_valid(true);
        safety.set_power_limit_ok(true);
        let v = InterlockValidator::new(InterlockConfig::default(), Arc::new(sim), bus)
            .with_safety(Arc::clone(&safety));

        v.start_motor(200).await.unwrap();
        for _ in 0..3 {
            v.poll(1.0);
        }
        assert_eq!(safety.state(), SafetyState::Safe);
        assert!(safety.is_laser_enable_permitted());

        v.stop_motor().await.unwrap();
        assert_eq!(safety.state(), SafetyState::Unsafe);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_polls_in_background() {
        let sim = SimGpio::new();
        let v = Arc::new(InterlockValidator::new(
            InterlockConfig::default(),
            Arc::new(sim.clone()),
            EventBus::default(),
        ));
        v.start_motor(255).await.unwrap();
        let handle = Arc::clone(&v).spawn_monitor();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(v.get_safety_status());
        handle.abort();
    }

    #[test]
    fn config_validation() {
        assert!(InterlockConfig::default().validate().is_ok());
        let bad = InterlockConfig {
            debounce_samples: 0,
            ..InterlockConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    proptest! {
        /// The reported status is exactly "commanded on and the last
        /// `debounce_samples` samples all exceeded the threshold".
        #[test]
        fn status_matches_trailing_window(
            commanded in any::<bool>(),
            samples in proptest::collection::vec(0.0f32..2.0, 0..40),
        ) {
            let (v, _sim, _rx) = validator();
            if commanded {
                v.state.lock().unwrap().commanded_on = true;
            }
            for (i, &g) in samples.iter().enumerate() {
                let status = v.poll(g);
                let window_ok = i + 1 >= 3
                    && samples[i + 1 - 3..=i].iter().all(|&s| s > 0.8);
                prop_assert_eq!(status, commanded && window_ok);
            }
        }
    }
}
