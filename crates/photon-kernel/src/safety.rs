//! [`SafetyStateMachine`] – interlock aggregation and laser authorization.
//!
//! The machine owns the single [`SafetyState`] and derives one boolean from
//! it: *laser enable permitted*.  Three independent interlocks feed it
//! (GPIO hardware interlock, session validity, power limit), plus a latched
//! emergency-stop flag that overrides everything else.
//!
//! # State diagram
//!
//! ```text
//!            arm_system()          start_treatment()
//!    SAFE ─────────────────► ARMED ─────────────────► TREATING
//!      ▲  ◄─────────────────   │  ◄─────────────────    │
//!      │     disarm_system()   │     stop_treatment()   │
//!      └───────────────────────┴──── disarm_system() ───┘
//!
//!    any ──(interlock lost)──► UNSAFE ──(all interlocks ok)──► SAFE
//!    any ──trigger_emergency_stop()──► EMERGENCY_STOP
//!    EMERGENCY_STOP ──clear_emergency_stop()──► SAFE | UNSAFE
//! ```
//!
//! # Guarantees
//!
//! - Every method is synchronous, non-blocking and performs no I/O.
//! - Invalid transitions return `false`, log a warning and leave state
//!   untouched.
//! - The authoritative enable level ([`SafetyStateMachine::subscribe_enable`])
//!   is updated inside the call that causes the change, before any bus
//!   notification is published, so no listener can delay or prevent a laser
//!   disable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use photon_middleware::{EventBus, Topic};
use photon_types::{
    EventPayload, InterlockDetails, InterlockSet, SafetyEventKind, SafetyState,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const SOURCE: &str = "photon-kernel::safety";

#[derive(Debug, Clone, Copy)]
enum Interlock {
    Gpio,
    Session,
    PowerLimit,
}

impl Interlock {
    fn name(self) -> &'static str {
        match self {
            Self::Gpio => "gpio_ok",
            Self::Session => "session_valid",
            Self::PowerLimit => "power_limit_ok",
        }
    }
}

struct Inner {
    state: SafetyState,
    interlocks: InterlockSet,
}

/// Aggregates interlock status into an arm/treat authorization.
pub struct SafetyStateMachine {
    inner: Mutex<Inner>,
    emergency_stop: AtomicBool,
    developer_bypass: AtomicBool,
    enable_tx: watch::Sender<bool>,
    bus: EventBus,
}

impl SafetyStateMachine {
    /// Create a machine with every interlock unsatisfied, i.e. in
    /// [`SafetyState::Unsafe`] with laser enable denied.
    pub fn new(bus: EventBus) -> Self {
        let (enable_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                state: SafetyState::Unsafe,
                interlocks: InterlockSet::default(),
            }),
            emergency_stop: AtomicBool::new(false),
            developer_bypass: AtomicBool::new(false),
            enable_tx,
            bus,
        }
    }

    // ── interlock inputs ────────────────────────────────────────────────

    pub fn set_gpio_ok(&self, ok: bool) {
        self.set_interlock(Interlock::Gpio, ok);
    }

    pub fn set_session_valid(&self, valid: bool) {
        self.set_interlock(Interlock::Session, valid);
    }

    pub fn set_power_limit_ok(&self, ok: bool) {
        self.set_interlock(Interlock::PowerLimit, ok);
    }

    // ── operator transitions ────────────────────────────────────────────

    /// SAFE → ARMED, only with every interlock satisfied.
    pub fn arm_system(&self) -> bool {
        self.transition(
            "arm_system",
            &[SafetyState::Safe],
            SafetyState::Armed,
            SafetyEventKind::Armed,
            "System armed",
        )
    }

    /// ARMED → TREATING; laser enable is granted.
    pub fn start_treatment(&self) -> bool {
        self.transition(
            "start_treatment",
            &[SafetyState::Armed],
            SafetyState::Treating,
            SafetyEventKind::TreatmentStarted,
            "Treatment started",
        )
    }

    /// TREATING → ARMED.
    pub fn stop_treatment(&self) -> bool {
        self.transition(
            "stop_treatment",
            &[SafetyState::Treating],
            SafetyState::Armed,
            SafetyEventKind::TreatmentStopped,
            "Treatment stopped",
        )
    }

    /// ARMED or TREATING → SAFE.
    pub fn disarm_system(&self) -> bool {
        self.transition(
            "disarm_system",
            &[SafetyState::Armed, SafetyState::Treating],
            SafetyState::Safe,
            SafetyEventKind::Disarmed,
            "System disarmed",
        )
    }

    // ── emergency stop ──────────────────────────────────────────────────

    /// Latch the emergency stop.  Valid from any state and idempotent.
    ///
    /// The flag and the enable level are written before anything else; the
    /// call never waits on I/O or on a listener.
    pub fn trigger_emergency_stop(&self) {
        let already_latched = self.emergency_stop.swap(true, Ordering::AcqRel);
        let mut out = Vec::new();
        // Always wakes subscribers, even when the level was already low.
        let mut was_enabled = self.enable_tx.send_replace(false);

        {
            let mut inner = self.lock();
            // A setter that read the flag before it was latched may have
            // raised the level in between; every later one sees the flag.
            was_enabled |= self.enable_tx.send_replace(false);
            if was_enabled {
                out.push(EventPayload::LaserEnableChanged { enabled: false });
            }
            if inner.state != SafetyState::EmergencyStop {
                inner.state = SafetyState::EmergencyStop;
                out.push(EventPayload::SafetyStateChanged {
                    state: SafetyState::EmergencyStop,
                    status: "EMERGENCY STOP".to_string(),
                });
                out.push(EventPayload::SafetyEvent {
                    kind: SafetyEventKind::EmergencyStop,
                    message: "Emergency stop activated".to_string(),
                });
            }
        }

        if already_latched {
            debug!("emergency stop already latched");
        } else {
            error!("EMERGENCY STOP activated");
        }
        self.dispatch(out);
    }

    /// Release the emergency stop and re-evaluate the interlocks exactly as
    /// automatic recovery does: SAFE when all are satisfied, UNSAFE otherwise.
    ///
    /// Returns `false` when no emergency stop was latched.
    pub fn clear_emergency_stop(&self) -> bool {
        let mut out = Vec::new();
        {
            let mut inner = self.lock();
            if !self.emergency_stop.swap(false, Ordering::AcqRel) {
                warn!("clear_emergency_stop rejected: no emergency stop latched");
                return false;
            }
            out.push(EventPayload::SafetyEvent {
                kind: SafetyEventKind::EmergencyStopCleared,
                message: "Emergency stop cleared".to_string(),
            });
            self.reevaluate(&mut inner, &mut out);
            info!(state = %inner.state, "emergency stop cleared");
        }
        self.dispatch(out);
        true
    }

    // ── developer bypass ────────────────────────────────────────────────

    /// Calibration bypass: forces [`is_laser_enable_permitted`] true
    /// regardless of interlocks, except while an emergency stop is latched.
    ///
    /// Interlock and emergency-stop state are never modified, so
    /// [`get_interlock_details`] keeps reporting true hardware status.
    ///
    /// [`is_laser_enable_permitted`]: Self::is_laser_enable_permitted
    /// [`get_interlock_details`]: Self::get_interlock_details
    pub fn set_developer_bypass(&self, enabled: bool) {
        if self.developer_bypass.swap(enabled, Ordering::AcqRel) == enabled {
            return;
        }
        warn!(enabled, "developer interlock bypass changed");
        // Effective permission moved without the interlock level changing.
        self.enable_tx.send_modify(|_| {});
        self.bus.notify(
            Topic::Safety,
            SOURCE,
            EventPayload::SafetyEvent {
                kind: SafetyEventKind::DeveloperBypass,
                message: if enabled {
                    "Developer bypass ENABLED: interlocks not enforced".to_string()
                } else {
                    "Developer bypass disabled".to_string()
                },
            },
        );
    }

    // ── queries ─────────────────────────────────────────────────────────

    pub fn is_laser_enable_permitted(&self) -> bool {
        if self.emergency_stop.load(Ordering::Acquire) {
            return false;
        }
        if self.developer_bypass.load(Ordering::Acquire) {
            return true;
        }
        *self.enable_tx.borrow()
    }

    pub fn state(&self) -> SafetyState {
        self.lock().state
    }

    pub fn interlocks(&self) -> InterlockSet {
        self.lock().interlocks
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::Acquire)
    }

    pub fn get_interlock_details(&self) -> InterlockDetails {
        let (state, interlocks) = {
            let inner = self.lock();
            (inner.state, inner.interlocks)
        };
        InterlockDetails {
            gpio_ok: interlocks.gpio_ok,
            session_valid: interlocks.session_valid,
            power_limit_ok: interlocks.power_limit_ok,
            emergency_stop: self.is_emergency_stopped(),
            developer_bypass: self.developer_bypass.load(Ordering::Acquire),
            state,
            laser_enable_permitted: self.is_laser_enable_permitted(),
        }
    }

    /// Push channel carrying the interlock-derived enable level.
    ///
    /// The developer bypass is deliberately not reflected here; consumers
    /// that need the effective permission re-check
    /// [`is_laser_enable_permitted`][Self::is_laser_enable_permitted] when
    /// the channel changes.
    pub fn subscribe_enable(&self) -> watch::Receiver<bool> {
        self.enable_tx.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ── internals ───────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_interlock(&self, which: Interlock, value: bool) {
        let mut out = Vec::new();
        {
            let mut inner = self.lock();
            let slot = match which {
                Interlock::Gpio => &mut inner.interlocks.gpio_ok,
                Interlock::Session => &mut inner.interlocks.session_valid,
                Interlock::PowerLimit => &mut inner.interlocks.power_limit_ok,
            };
            if *slot == value {
                return;
            }
            *slot = value;
            info!(interlock = which.name(), value, "interlock updated");

            if self.emergency_stop.load(Ordering::Acquire) {
                debug!("emergency stop latched; safety state unchanged");
                return;
            }
            self.reevaluate(&mut inner, &mut out);
        }
        self.dispatch(out);
    }

    /// Automatic fault/recovery: any lost interlock forces UNSAFE, and
    /// UNSAFE (or a just-cleared EMERGENCY_STOP) recovers to SAFE once all
    /// interlocks hold.  Operator states are otherwise left alone.
    fn reevaluate(&self, inner: &mut Inner, out: &mut Vec<EventPayload>) {
        let all_ok = inner.interlocks.all_satisfied();
        let previous = inner.state;
        let next = match (all_ok, previous) {
            (false, _) => SafetyState::Unsafe,
            (true, SafetyState::Unsafe | SafetyState::EmergencyStop) => SafetyState::Safe,
            (true, s) => s,
        };
        inner.state = next;

        // Enable first, notifications after.
        let enabled = Self::derive_enable(next, &inner.interlocks);
        self.publish_enable(enabled, out);

        let status = match inner.interlocks.first_fault() {
            Some(fault) => format!("Interlock fault: {fault}"),
            None => "All interlocks satisfied".to_string(),
        };

        if next != previous {
            if next == SafetyState::Unsafe {
                warn!(from = %previous, %status, "interlock fault");
                out.push(EventPayload::SafetyEvent {
                    kind: SafetyEventKind::InterlockFault,
                    message: status.clone(),
                });
            } else if previous == SafetyState::Unsafe {
                info!("interlocks restored");
                out.push(EventPayload::SafetyEvent {
                    kind: SafetyEventKind::InterlockRestored,
                    message: status.clone(),
                });
            }
        }
        out.push(EventPayload::SafetyStateChanged {
            state: next,
            status,
        });
    }

    fn transition(
        &self,
        name: &'static str,
        from: &[SafetyState],
        to: SafetyState,
        kind: SafetyEventKind,
        message: &str,
    ) -> bool {
        let mut out = Vec::new();
        {
            let mut inner = self.lock();
            let current = inner.state;
            let interlocks_ok = inner.interlocks.all_satisfied();
            let latched = self.emergency_stop.load(Ordering::Acquire);

            if latched || !from.contains(&current) || !interlocks_ok {
                let reason = if latched {
                    "emergency stop latched".to_string()
                } else if !from.contains(&current) {
                    format!("not valid from {current}")
                } else {
                    format!("interlocks not satisfied ({})", inner.interlocks.first_fault().unwrap_or("unknown"))
                };
                warn!(transition = name, state = %current, %reason, "transition rejected");
                drop(inner);
                self.bus.notify(
                    Topic::Safety,
                    SOURCE,
                    EventPayload::SafetyEvent {
                        kind: SafetyEventKind::TransitionRejected,
                        message: format!("{name} rejected: {reason}"),
                    },
                );
                return false;
            }

            inner.state = to;
            let enabled = Self::derive_enable(to, &inner.interlocks);
            self.publish_enable(enabled, &mut out);
            info!(from = %current, to = %to, "{message}");
            out.push(EventPayload::SafetyStateChanged {
                state: to,
                status: message.to_string(),
            });
            out.push(EventPayload::SafetyEvent {
                kind,
                message: message.to_string(),
            });
        }
        self.dispatch(out);
        true
    }

    fn derive_enable(state: SafetyState, interlocks: &InterlockSet) -> bool {
        interlocks.all_satisfied()
            && matches!(
                state,
                SafetyState::Safe | SafetyState::Armed | SafetyState::Treating
            )
    }

    fn publish_enable(&self, enabled: bool, out: &mut Vec<EventPayload>) {
        let changed = self.enable_tx.send_if_modified(|current| {
            if *current == enabled {
                false
            } else {
                *current = enabled;
                true
            }
        });
        if changed {
            out.push(EventPayload::LaserEnableChanged { enabled });
        }
    }

    fn dispatch(&self, out: Vec<EventPayload>) {
        for payload in out {
            self.bus.notify(Topic::Safety, SOURCE, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon_middleware::TopicReceiver;
    use proptest::prelude::*;

    fn machine() -> (SafetyStateMachine, TopicReceiver) {
        let bus = EventBus::default();
        let rx = bus.subscribe_to(Topic::Safety);
        (SafetyStateMachine::new(bus), rx)
    }

    fn all_ok(sm: &SafetyStateMachine) {
        sm.set_gpio_ok(true);
        sm.set_session_valid(true);
        sm.set_power_limit_ok(true);
    }

    #[test]
    fn starts_unsafe_with_enable_denied() {
        let (sm, _rx) = machine();
        assert_eq!(sm.state(), SafetyState::Unsafe);
        assert!(!sm.is_laser_enable_permitted());
    }

    #[test]
    fn all_interlocks_recover_to_safe() {
        let (sm, _rx) = machine();
        sm.set_gpio_ok(true);
        sm.set_session_valid(true);
        assert_eq!(sm.state(), SafetyState::Unsafe);
        sm.set_power_limit_ok(true);
        assert_eq!(sm.state(), SafetyState::Safe);
        assert!(sm.is_laser_enable_permitted());
    }

    #[test]
    fn unchanged_interlock_is_a_noop() {
        let (sm, mut rx) = machine();
        all_ok(&sm);
        rx.drain();
        sm.set_gpio_ok(true);
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn lifecycle_scenario() {
        let (sm, _rx) = machine();
        all_ok(&sm);
        assert!(sm.arm_system());
        assert_eq!(sm.state(), SafetyState::Armed);
        assert!(sm.start_treatment());
        assert_eq!(sm.state(), SafetyState::Treating);
        assert!(sm.is_laser_enable_permitted());

        sm.set_session_valid(false);
        assert_eq!(sm.state(), SafetyState::Unsafe);
        assert!(!sm.is_laser_enable_permitted());

        sm.set_session_valid(true);
        assert_eq!(sm.state(), SafetyState::Safe);
        assert!(sm.is_laser_enable_permitted());
    }

    #[test]
    fn arm_requires_safe_and_all_interlocks() {
        let (sm, _rx) = machine();
        sm.set_gpio_ok(true);
        sm.set_session_valid(true);
        assert!(!sm.arm_system());
        assert_eq!(sm.state(), SafetyState::Unsafe);

        sm.set_power_limit_ok(true);
        assert!(sm.arm_system());
        // Already armed: rejected, no mutation.
        assert!(!sm.arm_system());
        assert_eq!(sm.state(), SafetyState::Armed);
    }

    #[test]
    fn invalid_transitions_return_false_without_mutation() {
        let (sm, mut rx) = machine();
        all_ok(&sm);
        rx.drain();
        assert!(!sm.start_treatment());
        assert!(!sm.stop_treatment());
        assert!(!sm.disarm_system());
        assert_eq!(sm.state(), SafetyState::Safe);

        let events = rx.drain();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| matches!(
            e,
            EventPayload::SafetyEvent { kind: SafetyEventKind::TransitionRejected, .. }
        )));
    }

    #[test]
    fn disarm_directly_from_treating() {
        let (sm, _rx) = machine();
        all_ok(&sm);
        sm.arm_system();
        sm.start_treatment();
        assert!(sm.disarm_system());
        assert_eq!(sm.state(), SafetyState::Safe);
    }

    #[test]
    fn stop_treatment_returns_to_armed() {
        let (sm, _rx) = machine();
        all_ok(&sm);
        sm.arm_system();
        sm.start_treatment();
        assert!(sm.stop_treatment());
        assert_eq!(sm.state(), SafetyState::Armed);
    }

    #[test]
    fn emergency_stop_priority_scenario() {
        let (sm, _rx) = machine();
        all_ok(&sm);
        sm.arm_system();
        sm.start_treatment();

        sm.trigger_emergency_stop();
        assert_eq!(sm.state(), SafetyState::EmergencyStop);
        assert!(!sm.is_laser_enable_permitted());

        // Redundant interlock update must not change the latched state.
        sm.set_gpio_ok(true);
        sm.set_gpio_ok(false);
        sm.set_gpio_ok(true);
        assert_eq!(sm.state(), SafetyState::EmergencyStop);
        assert!(!sm.arm_system());

        assert!(sm.clear_emergency_stop());
        assert_eq!(sm.state(), SafetyState::Safe);
        assert!(sm.is_laser_enable_permitted());
    }

    #[test]
    fn clearing_emergency_stop_with_fault_lands_unsafe() {
        let (sm, _rx) = machine();
        all_ok(&sm);
        sm.trigger_emergency_stop();
        sm.set_power_limit_ok(false);
        assert_eq!(sm.state(), SafetyState::EmergencyStop);
        assert!(sm.clear_emergency_stop());
        assert_eq!(sm.state(), SafetyState::Unsafe);
        assert!(!sm.is_laser_enable_permitted());
    }

    #[test]
    fn clear_without_latch_is_rejected() {
        let (sm, _rx) = machine();
        assert!(!sm.clear_emergency_stop());
    }

    #[test]
    fn emergency_stop_is_idempotent() {
        let (sm, mut rx) = machine();
        all_ok(&sm);
        rx.drain();
        sm.trigger_emergency_stop();
        let first = rx.drain();
        let details_once = sm.get_interlock_details();

        sm.trigger_emergency_stop();
        assert!(rx.drain().is_empty(), "second trigger must not re-notify");
        assert_eq!(sm.get_interlock_details(), details_once);
        assert!(first.contains(&EventPayload::LaserEnableChanged { enabled: false }));
    }

    #[test]
    fn enable_changes_before_notifications_are_read() {
        let (sm, _rx) = machine();
        all_ok(&sm);
        sm.arm_system();
        sm.start_treatment();
        let enable = sm.subscribe_enable();
        assert!(*enable.borrow());

        sm.set_gpio_ok(false);
        // Same call, no task scheduling involved.
        assert!(!*enable.borrow());
    }

    #[test]
    fn interlock_loss_emits_fault_event_and_enable_change() {
        let (sm, mut rx) = machine();
        all_ok(&sm);
        rx.drain();
        sm.set_gpio_ok(false);
        let events = rx.drain();
        assert_eq!(events[0], EventPayload::LaserEnableChanged { enabled: false });
        assert!(events.iter().any(|e| matches!(
            e,
            EventPayload::SafetyEvent { kind: SafetyEventKind::InterlockFault, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            EventPayload::SafetyStateChanged { state: SafetyState::Unsafe, status }
                if status.contains("GPIO")
        )));
    }

    #[test]
    fn developer_bypass_never_overrides_emergency_stop() {
        let (sm, _rx) = machine();
        sm.set_developer_bypass(true);
        assert!(sm.is_laser_enable_permitted(), "bypass forces enable with interlocks open");
        let details = sm.get_interlock_details();
        assert!(!details.gpio_ok, "bypass must not rewrite audit state");
        assert_eq!(details.state, SafetyState::Unsafe);

        sm.trigger_emergency_stop();
        assert!(!sm.is_laser_enable_permitted());
        sm.set_developer_bypass(false);
        sm.clear_emergency_stop();
        assert!(!sm.is_laser_enable_permitted());
    }

    #[test]
    fn enable_level_stays_low_after_concurrent_estop() {
        for _ in 0..200 {
            let sm = std::sync::Arc::new(SafetyStateMachine::new(EventBus::default()));
            sm.set_gpio_ok(true);
            sm.set_session_valid(true);
            let enable = sm.subscribe_enable();

            let toggler = {
                let sm = std::sync::Arc::clone(&sm);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        sm.set_power_limit_ok(i % 2 == 0);
                    }
                })
            };
            sm.trigger_emergency_stop();
            toggler.join().unwrap();

            assert_eq!(sm.state(), SafetyState::EmergencyStop);
            assert!(!*enable.borrow(), "enable level raised while latched");
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Gpio(bool),
        Session(bool),
        Power(bool),
        Arm,
        Start,
        Stop,
        Disarm,
        EStop,
        Clear,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<bool>().prop_map(Op::Gpio),
            any::<bool>().prop_map(Op::Session),
            any::<bool>().prop_map(Op::Power),
            Just(Op::Arm),
            Just(Op::Start),
            Just(Op::Stop),
            Just(Op::Disarm),
            Just(Op::EStop),
            Just(Op::Clear),
        ]
    }

    proptest! {
        #[test]
        fn enable_iff_interlocks_and_no_estop(ops in proptest::collection::vec(op(), 0..64)) {
            let sm = SafetyStateMachine::new(EventBus::default());
            for op in ops {
                match op {
                    Op::Gpio(v) => sm.set_gpio_ok(v),
                    Op::Session(v) => sm.set_session_valid(v),
                    Op::Power(v) => sm.set_power_limit_ok(v),
                    Op::Arm => { sm.arm_system(); }
                    Op::Start => { sm.start_treatment(); }
                    Op::Stop => { sm.stop_treatment(); }
                    Op::Disarm => { sm.disarm_system(); }
                    Op::EStop => sm.trigger_emergency_stop(),
                    Op::Clear => { sm.clear_emergency_stop(); }
                }

                let d = sm.get_interlock_details();
                let all = d.gpio_ok && d.session_valid && d.power_limit_ok;
                let operational = matches!(
                    d.state,
                    SafetyState::Safe | SafetyState::Armed | SafetyState::Treating
                );
                prop_assert_eq!(d.laser_enable_permitted, all && !d.emergency_stop && operational);
                prop_assert_eq!(d.emergency_stop, d.state == SafetyState::EmergencyStop);
                if !d.emergency_stop {
                    prop_assert_eq!(d.state == SafetyState::Unsafe, !all);
                }
            }
        }
    }
}
