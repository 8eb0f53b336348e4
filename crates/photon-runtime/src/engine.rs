//! [`ProtocolExecutionEngine`] – runs treatment protocols under safety
//! authorization.
//!
//! # Run lifecycle
//!
//! ```text
//! IDLE ──execute()──► RUNNING ⇄ PAUSED
//!                        │
//!                        ├── all actions done ────────► COMPLETED
//!                        ├── stop() / enable revoked ─► STOPPED
//!                        └── critical failure ────────► ERROR
//! ```
//!
//! `execute` validates the protocol and checks laser authorization once, up
//! front.  After that, revocation is pushed: the run is raced against the
//! safety machine's enable channel, so a lost interlock or an emergency
//! stop drops the in-flight action at its current await point and the
//! laser is shut down immediately, without waiting for the next checkpoint.
//!
//! Stop and pause are observed at checkpoints: before every action, between
//! ramp steps, and every `checkpoint_interval_ms` inside waits and moves.
//! Every hardware write re-checks authorization first.
//!
//! Shutdown is *selective*: laser output off and current to zero.  The
//! actuator is left where it is.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use photon_hal::{ActuatorDriver, LaserDriver};
use photon_kernel::SafetyStateMachine;
use photon_middleware::{EventBus, Topic};
use photon_types::{
    ActionKind, EventPayload, ExecutionLogEntry, ExecutionOutcome, ExecutionState,
    ExecutionSummary, LogEvent, LoopParams, MoveActuatorParams, PhotonError, Protocol,
    ProtocolAction, RampLaserPowerParams,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::ramp::{interval_count, ramp_steps};
use crate::validation::validate_protocol;

const SOURCE: &str = "photon-runtime::engine";

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Active-time budget for a single action (loops excluded).
    pub action_timeout_ms: u64,
    /// Attempts for hardware actions; other actions run once.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub checkpoint_interval_ms: u64,
    pub ramp_rate_hz: u32,
    /// Laser drive current per watt of commanded optical power.
    pub milliamps_per_watt: f64,
    /// A move with position feedback is done once within this distance.
    pub position_tolerance_um: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            action_timeout_ms: 60_000,
            max_attempts: 3,
            retry_delay_ms: 1_000,
            checkpoint_interval_ms: 100,
            ramp_rate_hz: 10,
            milliamps_per_watt: 1_000.0,
            position_tolerance_um: 1.0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), PhotonError> {
        if self.max_attempts == 0 {
            return Err(PhotonError::Config("max_attempts must be at least 1".into()));
        }
        if self.checkpoint_interval_ms == 0 || self.ramp_rate_hz == 0 {
            return Err(PhotonError::Config(
                "checkpoint_interval_ms and ramp_rate_hz must be non-zero".into(),
            ));
        }
        if !self.milliamps_per_watt.is_finite() || self.milliamps_per_watt <= 0.0 {
            return Err(PhotonError::Config("milliamps_per_watt must be positive".into()));
        }
        Ok(())
    }

    fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms.max(1))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal control flow
// ────────────────────────────────────────────────────────────────────────────

/// Why a run unwound before completing.
#[derive(Debug, Clone, PartialEq)]
enum Abort {
    Stopped,
    Revoked,
    Failed(String),
}

/// Outcome of one attempt at a leaf action.
#[derive(Debug)]
enum LeafError {
    Hardware(PhotonError),
    Timeout,
    Abort(Abort),
}

impl From<Abort> for LeafError {
    fn from(a: Abort) -> Self {
        LeafError::Abort(a)
    }
}

type Unwind<'a> = Pin<Box<dyn Future<Output = Result<(), Abort>> + Send + 'a>>;

struct RunCtx {
    stop_on_error: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Engine
// ────────────────────────────────────────────────────────────────────────────

/// Executes one [`Protocol`] at a time against the owned laser and
/// actuator ports.
pub struct ProtocolExecutionEngine {
    config: EngineConfig,
    safety: Arc<SafetyStateMachine>,
    bus: EventBus,
    laser: Mutex<Box<dyn LaserDriver>>,
    actuator: Mutex<Box<dyn ActuatorDriver>>,
    state_tx: watch::Sender<ExecutionState>,
    pause_tx: watch::Sender<bool>,
    stop_tx: watch::Sender<bool>,
    record: Mutex<ExecutionSummary>,
}

impl ProtocolExecutionEngine {
    pub fn new(
        config: EngineConfig,
        safety: Arc<SafetyStateMachine>,
        laser: Box<dyn LaserDriver>,
        actuator: Box<dyn ActuatorDriver>,
    ) -> Self {
        let bus = safety.bus().clone();
        Self {
            config,
            safety,
            bus,
            laser: Mutex::new(laser),
            actuator: Mutex::new(actuator),
            state_tx: watch::channel(ExecutionState::Idle).0,
            pause_tx: watch::channel(false).0,
            stop_tx: watch::channel(false).0,
            record: Mutex::new(empty_summary()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> ExecutionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ExecutionState> {
        self.state_tx.subscribe()
    }

    /// Run `protocol` to completion, stop, or failure.
    ///
    /// Never returns an error: every failure is folded into the returned
    /// [`ExecutionOutcome`].  Validation and authorization failures return
    /// without entering RUNNING.
    #[instrument(skip_all, fields(protocol = %protocol.protocol_name))]
    pub async fn execute(
        &self,
        protocol: &Protocol,
        record: bool,
        stop_on_error: bool,
    ) -> ExecutionOutcome {
        if self.state().is_active() {
            return ExecutionOutcome::failure("A protocol run is already active");
        }
        if let Err(e) = validate_protocol(protocol) {
            warn!(error = %e, "protocol rejected");
            return ExecutionOutcome::failure(format!("Protocol validation failed: {e}"));
        }

        // Subscribe before the check so no revocation can slip in between.
        let mut enable_rx = self.safety.subscribe_enable();
        if !self.safety.is_laser_enable_permitted() {
            warn!("execution refused: laser enable not permitted");
            return ExecutionOutcome::failure(
                "Laser enable not permitted: safety interlocks not satisfied",
            );
        }

        let claimed = self.state_tx.send_if_modified(|s| {
            if s.is_active() {
                false
            } else {
                *s = ExecutionState::Running;
                true
            }
        });
        if !claimed {
            return ExecutionOutcome::failure(
                PhotonError::Busy("a protocol run is already active".into()).to_string(),
            );
        }

        self.stop_tx.send_replace(false);
        self.pause_tx.send_replace(false);
        let run_id = Uuid::new_v4();
        {
            let mut rec = self.record();
            *rec = empty_summary();
            rec.run_id = Some(run_id);
            rec.protocol_name = protocol.protocol_name.clone();
            rec.start_time = Some(Utc::now());
            rec.action_count = protocol.total_action_count();
            rec.recorded = record;
        }
        info!(%run_id, actions = protocol.actions.len(), "protocol run started");
        self.notify(EventPayload::ExecutionStateChanged {
            state: ExecutionState::Running,
        });
        if record {
            self.notify(EventPayload::RecordingRequested { active: true });
        }

        let ctx = RunCtx { stop_on_error };
        let result = tokio::select! {
            biased;
            () = wait_for_revocation(&mut enable_rx, &self.safety) => Err(Abort::Revoked),
            r = self.run_top_level(&protocol.actions, &ctx) => r,
        };

        let (state, outcome) = match result {
            Ok(()) => {
                let failures = self.record().failures.len();
                let message = if failures == 0 {
                    format!("Protocol '{}' completed", protocol.protocol_name)
                } else {
                    format!(
                        "Protocol '{}' completed with {failures} non-critical failure(s)",
                        protocol.protocol_name
                    )
                };
                (ExecutionState::Completed, ExecutionOutcome::success(message))
            }
            Err(Abort::Stopped) => (
                ExecutionState::Stopped,
                ExecutionOutcome::failure("Execution stopped by operator"),
            ),
            Err(Abort::Revoked) => {
                error!("laser authorization revoked mid-run");
                (
                    ExecutionState::Stopped,
                    ExecutionOutcome::failure("Safety authorization revoked; laser shut down"),
                )
            }
            Err(Abort::Failed(message)) => {
                error!(%message, "protocol run aborted");
                (ExecutionState::Error, ExecutionOutcome::failure(message))
            }
        };

        self.finish_run(state, record);
        info!(%run_id, %state, success = outcome.success, "protocol run finished");
        outcome
    }

    /// RUNNING → PAUSED.  No-op in any other state.
    pub fn pause(&self) {
        if self.transition(ExecutionState::Running, ExecutionState::Paused) {
            self.pause_tx.send_replace(true);
            info!("execution paused");
        }
    }

    /// PAUSED → RUNNING.  No-op in any other state.
    pub fn resume(&self) {
        if self.transition(ExecutionState::Paused, ExecutionState::Running) {
            self.pause_tx.send_replace(false);
            info!("execution resumed");
        }
    }

    /// Request the active run to stop.  Always safe; idempotent.
    pub fn stop(&self) {
        if !self.stop_tx.send_replace(true) && self.state().is_active() {
            info!("execution stop requested");
        }
    }

    pub fn get_execution_summary(&self) -> ExecutionSummary {
        let mut summary = self.record().clone();
        summary.state = self.state();
        if let Some(start) = summary.start_time {
            let end = summary.end_time.unwrap_or_else(Utc::now);
            summary.duration_s = Some((end - start).num_milliseconds() as f64 / 1000.0);
        }
        summary
    }

    // ── run structure ───────────────────────────────────────────────────

    async fn run_top_level(&self, actions: &[ProtocolAction], ctx: &RunCtx) -> Result<(), Abort> {
        let total = actions.len().max(1) as f64;
        for (i, action) in actions.iter().enumerate() {
            self.run_action(action, ctx).await?;
            self.notify(EventPayload::ExecutionProgress {
                fraction: (i + 1) as f64 / total,
            });
        }
        Ok(())
    }

    async fn run_action(&self, action: &ProtocolAction, ctx: &RunCtx) -> Result<(), Abort> {
        self.checkpoint().await?;
        debug!(action_id = action.action_id, kind = %action.action_type(), "action start");
        self.log(action, LogEvent::Start, None);
        self.notify(EventPayload::ActionStarted {
            action_id: action.action_id,
            action_type: action.action_type(),
        });

        match &action.kind {
            ActionKind::Loop(params) => self.run_loop(action, params, ctx).await?,
            _ => self.run_leaf(action, ctx).await?,
        }
        Ok(())
    }

    fn run_loop<'a>(
        &'a self,
        action: &'a ProtocolAction,
        params: &'a LoopParams,
        ctx: &'a RunCtx,
    ) -> Unwind<'a> {
        Box::pin(async move {
            let mut iteration: u64 = 0;
            while params.is_infinite() || iteration < params.repeat_count as u64 {
                debug!(action_id = action.action_id, iteration, "loop iteration");
                for child in &params.actions {
                    self.run_action(child, ctx).await?;
                }
                iteration += 1;
                // Bodies of instantaneous actions must not starve the runtime.
                tokio::task::yield_now().await;
            }
            self.complete(action);
            Ok(())
        })
    }

    /// Run one non-loop action with timeout, retry and failure escalation.
    async fn run_leaf(&self, action: &ProtocolAction, ctx: &RunCtx) -> Result<(), Abort> {
        let hardware = action.action_type().is_hardware_actuation();
        let attempts = if hardware { self.config.max_attempts.max(1) } else { 1 };
        let budget = Duration::from_millis(self.config.action_timeout_ms);

        let mut attempt = 1;
        let result = loop {
            let r = tokio::select! {
                r = self.perform(action) => r,
                () = self.active_deadline(budget) => Err(LeafError::Timeout),
            };
            match r {
                Err(LeafError::Hardware(e)) if attempt < attempts => {
                    warn!(action_id = action.action_id, attempt, error = %e, "action failed; retrying");
                    attempt += 1;
                    self.sleep_checkpointed(Duration::from_millis(self.config.retry_delay_ms))
                        .await?;
                }
                other => break other,
            }
        };

        match result {
            Ok(()) => {
                if attempt > 1 {
                    info!(action_id = action.action_id, attempt, "action succeeded after retry");
                }
                self.complete(action);
                Ok(())
            }
            Err(LeafError::Abort(a)) => Err(a),
            Err(LeafError::Timeout) => {
                let message = format!(
                    "Action {} ({}) timed out after {} ms",
                    action.action_id,
                    action.action_type(),
                    self.config.action_timeout_ms
                );
                self.log(action, LogEvent::Timeout, Some(message.clone()));
                self.escalate(action, message, ctx)
            }
            Err(LeafError::Hardware(e)) => {
                let message = format!(
                    "Action {} ({}) failed after {attempt} attempt(s): {e}",
                    action.action_id,
                    action.action_type()
                );
                self.log(action, LogEvent::Error, Some(message.clone()));
                self.escalate(action, message, ctx)
            }
        }
    }

    /// Hardware actions are critical; `stop_on_error` makes everything
    /// critical.  Non-critical failures are collected and the run continues.
    fn escalate(&self, action: &ProtocolAction, message: String, ctx: &RunCtx) -> Result<(), Abort> {
        if ctx.stop_on_error || action.action_type().is_hardware_actuation() {
            return Err(Abort::Failed(message));
        }
        warn!(action_id = action.action_id, %message, "non-critical action failed; continuing");
        self.record().failures.push(message);
        Ok(())
    }

    fn complete(&self, action: &ProtocolAction) {
        self.log(action, LogEvent::Complete, None);
        self.notify(EventPayload::ActionCompleted {
            action_id: action.action_id,
            action_type: action.action_type(),
        });
    }

    // ── action bodies ───────────────────────────────────────────────────

    async fn perform(&self, action: &ProtocolAction) -> Result<(), LeafError> {
        match &action.kind {
            ActionKind::SetLaserPower(p) => self.apply_power(p.power_watts),
            ActionKind::RampLaserPower(p) => self.ramp(action.action_id, p).await,
            ActionKind::MoveActuator(p) => self.move_actuator(p).await,
            ActionKind::Wait(p) => {
                self.sleep_checkpointed(seconds(p.duration_s)?).await?;
                Ok(())
            }
            ActionKind::Loop(_) => Ok(()),
        }
    }

    async fn ramp(&self, action_id: u32, params: &RampLaserPowerParams) -> Result<(), LeafError> {
        let intervals = interval_count(params.duration_s, self.config.ramp_rate_hz);
        let step_time = seconds(params.duration_s / f64::from(intervals))?;
        let total_steps = intervals + 1;

        for (step, watts) in (1..=total_steps).zip(ramp_steps(params, self.config.ramp_rate_hz)) {
            self.checkpoint().await?;
            self.apply_power(watts)?;
            self.notify(EventPayload::RampStep {
                action_id,
                step,
                total_steps,
                power_watts: watts,
            });
            if step < total_steps {
                self.sleep_checkpointed(step_time).await?;
            }
        }
        Ok(())
    }

    async fn move_actuator(&self, params: &MoveActuatorParams) -> Result<(), LeafError> {
        let target = params.target_position_um;
        let (start, feedback) = {
            self.authorize()?;
            let mut actuator = self.actuator();
            let start = actuator.position();
            let feedback = actuator.position_feedback();
            actuator.set_speed(params.speed_um_per_s).map_err(LeafError::Hardware)?;
            actuator.set_position(target).map_err(LeafError::Hardware)?;
            (start, feedback)
        };

        match feedback {
            Some(mut rx) => {
                let tolerance = self.config.position_tolerance_um;
                loop {
                    if (*rx.borrow_and_update() - target).abs() <= tolerance {
                        return Ok(());
                    }
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return Err(LeafError::Hardware(PhotonError::hardware(
                                    "actuator",
                                    "position feedback channel closed",
                                )));
                            }
                        }
                        () = tokio::time::sleep(self.config.checkpoint_interval()) => {
                            self.checkpoint().await?;
                        }
                    }
                }
            }
            None => {
                // No feedback: estimate travel time from the last known position.
                // Past the action budget the deadline fires first.
                let cap = Duration::from_millis(self.config.action_timeout_ms)
                    + self.config.checkpoint_interval();
                let travel = (target - start).abs() / params.speed_um_per_s;
                let travel = if travel.is_finite() && travel > cap.as_secs_f64() {
                    cap
                } else {
                    seconds(travel)?
                };
                self.sleep_checkpointed(travel).await?;
                Ok(())
            }
        }
    }

    /// Convert optical power to drive current and write it, switching the
    /// output on for any non-zero power.
    fn apply_power(&self, watts: f64) -> Result<(), LeafError> {
        self.authorize()?;
        let milliamps = watts * self.config.milliamps_per_watt;
        let mut laser = self.laser();
        laser.set_current(milliamps).map_err(LeafError::Hardware)?;
        let want_output = watts > 0.0;
        if laser.output_enabled() != want_output {
            laser.set_output(want_output).map_err(LeafError::Hardware)?;
        }
        Ok(())
    }

    // ── checkpoints ─────────────────────────────────────────────────────

    /// Hardware write gate.
    fn authorize(&self) -> Result<(), Abort> {
        if *self.stop_tx.borrow() {
            return Err(Abort::Stopped);
        }
        if !self.safety.is_laser_enable_permitted() {
            return Err(Abort::Revoked);
        }
        Ok(())
    }

    /// Observe stop and revocation, then block while paused.
    async fn checkpoint(&self) -> Result<(), Abort> {
        self.authorize()?;
        if *self.pause_tx.borrow() {
            let mut pause_rx = self.pause_tx.subscribe();
            let mut stop_rx = self.stop_tx.subscribe();
            tokio::select! {
                _ = pause_rx.wait_for(|paused| !*paused) => {}
                _ = stop_rx.wait_for(|stopped| *stopped) => {}
            }
            self.authorize()?;
        }
        Ok(())
    }

    /// Sleep for `total` of *active* time.  Paused time does not count;
    /// stop is observed immediately.
    async fn sleep_checkpointed(&self, total: Duration) -> Result<(), Abort> {
        let slice = self.config.checkpoint_interval();
        let mut stop_rx = self.stop_tx.subscribe();
        let mut remaining = total;
        while !remaining.is_zero() {
            self.checkpoint().await?;
            let step = remaining.min(slice);
            tokio::select! {
                () = tokio::time::sleep(step) => {}
                _ = stop_rx.wait_for(|stopped| *stopped) => return Err(Abort::Stopped),
            }
            remaining -= step;
        }
        self.checkpoint().await
    }

    /// Resolves once `budget` of unpaused time has elapsed.
    async fn active_deadline(&self, budget: Duration) {
        let mut pause_rx = self.pause_tx.subscribe();
        let mut remaining = budget;
        loop {
            if *pause_rx.borrow_and_update() {
                if pause_rx.wait_for(|paused| !*paused).await.is_err() {
                    std::future::pending::<()>().await;
                }
                continue;
            }
            let started = Instant::now();
            tokio::select! {
                () = tokio::time::sleep(remaining) => return,
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        std::future::pending::<()>().await;
                    }
                    remaining = remaining.saturating_sub(started.elapsed());
                }
            }
        }
    }

    // ── run bookkeeping ─────────────────────────────────────────────────

    fn finish_run(&self, state: ExecutionState, record: bool) {
        let leave_as_is = {
            let laser = self.laser();
            state == ExecutionState::Completed
                && !laser.output_enabled()
                && laser.current() == 0.0
        };
        if !leave_as_is {
            self.selective_shutdown();
        }

        self.pause_tx.send_replace(false);
        self.record().end_time = Some(Utc::now());
        self.state_tx.send_replace(state);
        self.notify(EventPayload::ExecutionStateChanged { state });
        if record {
            self.notify(EventPayload::RecordingRequested { active: false });
        }
    }

    /// Laser output off and current zero.  The actuator is not touched.
    fn selective_shutdown(&self) {
        let mut laser = self.laser();
        if let Err(e) = laser.set_output(false) {
            error!(laser = laser.id(), error = %e, "failed to disable laser output");
        }
        if let Err(e) = laser.set_current(0.0) {
            error!(laser = laser.id(), error = %e, "failed to zero laser current");
        }
        warn!(laser = laser.id(), "selective laser shutdown performed");
    }

    fn transition(&self, from: ExecutionState, to: ExecutionState) -> bool {
        let changed = self.state_tx.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        });
        if changed {
            self.notify(EventPayload::ExecutionStateChanged { state: to });
        } else {
            debug!(current = %self.state(), requested = %to, "execution transition ignored");
        }
        changed
    }

    fn log(&self, action: &ProtocolAction, event: LogEvent, error: Option<String>) {
        self.record().log.push(ExecutionLogEntry {
            action_id: action.action_id,
            action_type: action.action_type(),
            timestamp: Utc::now(),
            event,
            error,
        });
    }

    fn notify(&self, payload: EventPayload) {
        self.bus.notify(Topic::Execution, SOURCE, payload);
    }

    fn record(&self) -> MutexGuard<'_, ExecutionSummary> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn laser(&self) -> MutexGuard<'_, Box<dyn LaserDriver>> {
        self.laser.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn actuator(&self) -> MutexGuard<'_, Box<dyn ActuatorDriver>> {
        self.actuator.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn empty_summary() -> ExecutionSummary {
    ExecutionSummary {
        run_id: None,
        protocol_name: String::new(),
        state: ExecutionState::Idle,
        start_time: None,
        end_time: None,
        duration_s: None,
        action_count: 0,
        recorded: false,
        failures: Vec::new(),
        log: Vec::new(),
    }
}

/// Seconds from a protocol parameter as a `Duration`; out-of-range values
/// fail the run instead of panicking.
fn seconds(s: f64) -> Result<Duration, LeafError> {
    Duration::try_from_secs_f64(s)
        .map_err(|e| LeafError::Abort(Abort::Failed(format!("invalid duration {s} s: {e}"))))
}

/// Resolves when the enable channel changes and the effective permission
/// has been withdrawn.
async fn wait_for_revocation(rx: &mut watch::Receiver<bool>, safety: &SafetyStateMachine) {
    loop {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if !safety.is_laser_enable_permitted() {
            return;
        }
    }
}
