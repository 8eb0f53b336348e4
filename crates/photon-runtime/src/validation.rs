//! [`ProtocolValidator`] – pre-flight rule engine for protocol documents.
//!
//! Every registered [`ProtocolRule`] is evaluated in order; the first
//! violation is returned as [`PhotonError::InvalidProtocol`] and the
//! protocol is **not** executed.
//!
//! Built-in rules, in default order:
//! - [`StructureRule`] – names, ids, loop counts and nesting.
//! - [`PowerCapRule`] – every commanded power within `max_power_watts`.
//! - [`TimingRule`] – ramp and wait durations finite, positive and within
//!   `max_duration_s`.
//! - [`TravelRule`] – actuator targets inside the travel window, speeds
//!   within the cap and fast enough to cross the window in `max_duration_s`.

use std::collections::HashSet;

use photon_types::{ActionKind, PhotonError, Protocol, ProtocolAction};

/// Ceiling on `safety_limits.max_duration_s`, whatever a document declares.
pub const MAX_ACTION_DURATION_S: f64 = 86_400.0;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single pre-flight invariant a protocol must satisfy.
pub trait ProtocolRule: Send + Sync {
    fn name(&self) -> &str;

    /// Return `Ok(())` when the protocol satisfies the invariant, or
    /// [`PhotonError::InvalidProtocol`] describing the first violation.
    fn check(&self, protocol: &Protocol) -> Result<(), PhotonError>;
}

// ────────────────────────────────────────────────────────────────────────────
// ProtocolValidator
// ────────────────────────────────────────────────────────────────────────────

/// Ordered collection of [`ProtocolRule`]s.
///
/// # Example
///
/// ```
/// use photon_runtime::validation::ProtocolValidator;
/// use photon_types::{ActionKind, Protocol, ProtocolAction, SetLaserPowerParams};
///
/// let validator = ProtocolValidator::with_default_rules();
/// let ok = Protocol::new("demo").with_action(ProtocolAction::new(
///     1,
///     ActionKind::SetLaserPower(SetLaserPowerParams { power_watts: 2.0 }),
/// ));
/// assert!(validator.validate(&ok).is_ok());
///
/// let too_hot = Protocol::new("demo").with_action(ProtocolAction::new(
///     1,
///     ActionKind::SetLaserPower(SetLaserPowerParams { power_watts: 50.0 }),
/// ));
/// assert!(validator.validate(&too_hot).is_err());
/// ```
#[derive(Default)]
pub struct ProtocolValidator {
    rules: Vec<Box<dyn ProtocolRule>>,
}

impl ProtocolValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_rules() -> Self {
        let mut v = Self::new();
        v.add_rule(Box::new(StructureRule::default()));
        v.add_rule(Box::new(PowerCapRule));
        v.add_rule(Box::new(TimingRule));
        v.add_rule(Box::new(TravelRule));
        v
    }

    /// Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn ProtocolRule>) {
        self.rules.push(rule);
    }

    pub fn validate(&self, protocol: &Protocol) -> Result<(), PhotonError> {
        for rule in &self.rules {
            rule.check(protocol)?;
        }
        Ok(())
    }
}

/// Validate with the default rule set.
pub fn validate_protocol(protocol: &Protocol) -> Result<(), PhotonError> {
    ProtocolValidator::with_default_rules().validate(protocol)
}

fn invalid(action: &ProtocolAction, details: impl std::fmt::Display) -> PhotonError {
    PhotonError::InvalidProtocol(format!(
        "action {} ({}): {details}",
        action.action_id,
        action.action_type()
    ))
}

/// Depth-first visit of every action, loop bodies included.  `depth` is 1
/// for top-level actions.
fn visit<'a, F>(actions: &'a [ProtocolAction], depth: usize, f: &mut F) -> Result<(), PhotonError>
where
    F: FnMut(&'a ProtocolAction, usize) -> Result<(), PhotonError>,
{
    for action in actions {
        f(action, depth)?;
        if let ActionKind::Loop(params) = &action.kind {
            visit(&params.actions, depth + 1, f)?;
        }
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Document shape: non-empty name and action list, ids unique across the
/// whole tree, loop counts `> 0` or `-1`, non-empty loop bodies, bounded
/// nesting, and sane safety limits.
pub struct StructureRule {
    pub max_loop_depth: usize,
}

impl Default for StructureRule {
    fn default() -> Self {
        Self { max_loop_depth: 8 }
    }
}

impl ProtocolRule for StructureRule {
    fn name(&self) -> &str {
        "structure"
    }

    fn check(&self, protocol: &Protocol) -> Result<(), PhotonError> {
        if protocol.protocol_name.trim().is_empty() {
            return Err(PhotonError::InvalidProtocol("protocol_name is empty".into()));
        }
        if protocol.actions.is_empty() {
            return Err(PhotonError::InvalidProtocol("protocol has no actions".into()));
        }

        let limits = &protocol.safety_limits;
        let finite = [
            limits.max_power_watts,
            limits.max_duration_s,
            limits.min_position_um,
            limits.max_position_um,
            limits.max_speed_um_per_s,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite
            || limits.max_power_watts < 0.0
            || limits.max_duration_s <= 0.0
            || limits.max_duration_s > MAX_ACTION_DURATION_S
            || limits.max_speed_um_per_s <= 0.0
            || limits.min_position_um > limits.max_position_um
        {
            return Err(PhotonError::InvalidProtocol(format!(
                "safety_limits are inconsistent: {limits:?}"
            )));
        }

        let mut seen = HashSet::new();
        visit(&protocol.actions, 1, &mut |action, depth| {
            if !seen.insert(action.action_id) {
                return Err(invalid(action, "duplicate action_id"));
            }
            if let ActionKind::Loop(params) = &action.kind {
                if depth > self.max_loop_depth {
                    return Err(invalid(
                        action,
                        format!("loop nesting exceeds {}", self.max_loop_depth),
                    ));
                }
                if params.repeat_count == 0 || params.repeat_count < -1 {
                    return Err(invalid(
                        action,
                        format!("repeat_count must be > 0 or -1, got {}", params.repeat_count),
                    ));
                }
                if params.actions.is_empty() {
                    return Err(invalid(action, "loop body is empty"));
                }
            }
            Ok(())
        })
    }
}

/// Every power set point and ramp endpoint within `[0, max_power_watts]`.
pub struct PowerCapRule;

impl ProtocolRule for PowerCapRule {
    fn name(&self) -> &str {
        "power_cap"
    }

    fn check(&self, protocol: &Protocol) -> Result<(), PhotonError> {
        let max = protocol.safety_limits.max_power_watts;
        let within = |w: f64| w.is_finite() && (0.0..=max).contains(&w);
        visit(&protocol.actions, 1, &mut |action, _| match &action.kind {
            ActionKind::SetLaserPower(p) if !within(p.power_watts) => Err(invalid(
                action,
                format!("power {} W outside 0..={max} W", p.power_watts),
            )),
            ActionKind::RampLaserPower(p)
                if !within(p.start_power_watts) || !within(p.end_power_watts) =>
            {
                Err(invalid(
                    action,
                    format!(
                        "ramp {} → {} W outside 0..={max} W",
                        p.start_power_watts, p.end_power_watts
                    ),
                ))
            }
            _ => Ok(()),
        })
    }
}

/// Ramp and wait durations finite, positive and no longer than
/// `max_duration_s`.
pub struct TimingRule;

impl ProtocolRule for TimingRule {
    fn name(&self) -> &str {
        "timing"
    }

    fn check(&self, protocol: &Protocol) -> Result<(), PhotonError> {
        let max = protocol.safety_limits.max_duration_s;
        visit(&protocol.actions, 1, &mut |action, _| {
            let duration = match &action.kind {
                ActionKind::RampLaserPower(p) => p.duration_s,
                ActionKind::Wait(p) => p.duration_s,
                _ => return Ok(()),
            };
            if !duration.is_finite() || duration <= 0.0 || duration > max {
                return Err(invalid(
                    action,
                    format!("duration {duration} s outside (0, {max}] s"),
                ));
            }
            Ok(())
        })
    }
}

/// Actuator targets inside `[min_position_um, max_position_um]`, speeds in
/// `(0, max_speed_um_per_s]`.
pub struct TravelRule;

impl ProtocolRule for TravelRule {
    fn name(&self) -> &str {
        "travel"
    }

    fn check(&self, protocol: &Protocol) -> Result<(), PhotonError> {
        let limits = &protocol.safety_limits;
        visit(&protocol.actions, 1, &mut |action, _| {
            let ActionKind::MoveActuator(p) = &action.kind else {
                return Ok(());
            };
            let target = p.target_position_um;
            if !target.is_finite() || target < limits.min_position_um || target > limits.max_position_um
            {
                return Err(invalid(
                    action,
                    format!(
                        "target {target} µm outside {}..={} µm",
                        limits.min_position_um, limits.max_position_um
                    ),
                ));
            }
            let speed = p.speed_um_per_s;
            if !speed.is_finite() || speed <= 0.0 || speed > limits.max_speed_um_per_s {
                return Err(invalid(
                    action,
                    format!(
                        "speed {speed} µm/s outside (0, {}] µm/s",
                        limits.max_speed_um_per_s
                    ),
                ));
            }
            let worst_case_s = (limits.max_position_um - limits.min_position_um) / speed;
            if worst_case_s > limits.max_duration_s {
                return Err(invalid(
                    action,
                    format!(
                        "speed {speed} µm/s needs up to {worst_case_s:.0} s to cross the travel \
                         window (max {} s)",
                        limits.max_duration_s
                    ),
                ));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon_types::{
        LoopParams, MoveActuatorParams, RampLaserPowerParams, RampType, SetLaserPowerParams,
        WaitParams,
    };

    fn power(id: u32, w: f64) -> ProtocolAction {
        ProtocolAction::new(id, ActionKind::SetLaserPower(SetLaserPowerParams { power_watts: w }))
    }

    fn wait(id: u32, s: f64) -> ProtocolAction {
        ProtocolAction::new(id, ActionKind::Wait(WaitParams { duration_s: s }))
    }

    fn looped(id: u32, count: i32, body: Vec<ProtocolAction>) -> ProtocolAction {
        ProtocolAction::new(
            id,
            ActionKind::Loop(LoopParams {
                repeat_count: count,
                actions: body,
            }),
        )
    }

    fn err_text(p: &Protocol) -> String {
        validate_protocol(p).unwrap_err().to_string()
    }

    #[test]
    fn accepts_well_formed_protocol() {
        let p = Protocol::new("ok")
            .with_action(power(1, 2.0))
            .with_action(looped(2, -1, vec![wait(3, 1.0)]))
            .with_action(ProtocolAction::new(
                4,
                ActionKind::RampLaserPower(RampLaserPowerParams {
                    start_power_watts: 0.0,
                    end_power_watts: 5.0,
                    duration_s: 2.0,
                    ramp_type: RampType::Logarithmic,
                }),
            ));
        assert!(validate_protocol(&p).is_ok());
    }

    #[test]
    fn rejects_empty_name_and_actions() {
        assert!(err_text(&Protocol::new(" ").with_action(power(1, 1.0))).contains("protocol_name"));
        assert!(err_text(&Protocol::new("x")).contains("no actions"));
    }

    #[test]
    fn rejects_duplicate_ids_inside_loops() {
        let p = Protocol::new("dup")
            .with_action(power(1, 1.0))
            .with_action(looped(2, 2, vec![wait(1, 1.0)]));
        assert!(err_text(&p).contains("duplicate"));
    }

    #[test]
    fn rejects_bad_loop_counts_and_empty_bodies() {
        let zero = Protocol::new("l").with_action(looped(1, 0, vec![wait(2, 1.0)]));
        assert!(err_text(&zero).contains("repeat_count"));
        let neg = Protocol::new("l").with_action(looped(1, -2, vec![wait(2, 1.0)]));
        assert!(err_text(&neg).contains("repeat_count"));
        let empty = Protocol::new("l").with_action(looped(1, 3, vec![]));
        assert!(err_text(&empty).contains("empty"));
    }

    #[test]
    fn rejects_deep_nesting() {
        let nest = |levels: u32| {
            let mut inner = wait(100, 1.0);
            for id in 1..=levels {
                inner = looped(id, 1, vec![inner]);
            }
            Protocol::new("deep").with_action(inner)
        };
        assert!(validate_protocol(&nest(8)).is_ok());
        assert!(err_text(&nest(9)).contains("nesting"));
    }

    #[test]
    fn rejects_power_over_cap_in_nested_action() {
        let p = Protocol::new("hot").with_action(looped(1, 2, vec![power(2, 10.5)]));
        assert!(err_text(&p).contains("action 2"));
        assert!(validate_protocol(&Protocol::new("neg").with_action(power(1, -1.0))).is_err());
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(validate_protocol(&Protocol::new("w").with_action(wait(1, 0.0))).is_err());
        assert!(validate_protocol(&Protocol::new("w").with_action(wait(1, 601.0))).is_err());
        assert!(validate_protocol(&Protocol::new("w").with_action(wait(1, f64::INFINITY))).is_err());
    }

    #[test]
    fn rejects_travel_outside_window() {
        let mv = |target, speed| {
            Protocol::new("m").with_action(ProtocolAction::new(
                1,
                ActionKind::MoveActuator(MoveActuatorParams {
                    target_position_um: target,
                    speed_um_per_s: speed,
                }),
            ))
        };
        assert!(validate_protocol(&mv(1_000.0, 500.0)).is_ok());
        assert!(err_text(&mv(60_000.0, 500.0)).contains("target"));
        assert!(err_text(&mv(1_000.0, 0.0)).contains("speed"));
        assert!(err_text(&mv(1_000.0, 9_000.0)).contains("speed"));
    }

    #[test]
    fn rejects_speeds_too_slow_to_cross_the_window() {
        let mv = |speed| {
            Protocol::new("slow").with_action(ProtocolAction::new(
                1,
                ActionKind::MoveActuator(MoveActuatorParams {
                    target_position_um: 50_000.0,
                    speed_um_per_s: speed,
                }),
            ))
        };
        // 50 000 µm window, 600 s budget.
        assert!(validate_protocol(&mv(100.0)).is_ok());
        assert!(err_text(&mv(50.0)).contains("cross the travel window"));
        assert!(err_text(&mv(1e-16)).contains("cross the travel window"));
    }

    #[test]
    fn rejects_unbounded_duration_limit() {
        let mut p = Protocol::new("forever").with_action(wait(1, 1e300));
        p.safety_limits.max_duration_s = 1e300;
        assert!(err_text(&p).contains("safety_limits"));

        p.safety_limits.max_duration_s = MAX_ACTION_DURATION_S;
        p.actions = vec![wait(1, MAX_ACTION_DURATION_S)];
        assert!(validate_protocol(&p).is_ok());
    }

    #[test]
    fn first_failing_rule_wins() {
        // Duplicate id (structure) and over-cap power: structure is reported.
        let p = Protocol::new("both")
            .with_action(power(1, 99.0))
            .with_action(power(1, 1.0));
        assert!(err_text(&p).contains("duplicate"));
    }

    #[test]
    fn custom_rule_is_applied() {
        struct NoLoops;
        impl ProtocolRule for NoLoops {
            fn name(&self) -> &str {
                "no_loops"
            }
            fn check(&self, protocol: &Protocol) -> Result<(), PhotonError> {
                if protocol
                    .actions
                    .iter()
                    .any(|a| matches!(a.kind, ActionKind::Loop(_)))
                {
                    return Err(PhotonError::InvalidProtocol("loops not allowed".into()));
                }
                Ok(())
            }
        }
        let mut v = ProtocolValidator::new();
        v.add_rule(Box::new(NoLoops));
        let p = Protocol::new("l").with_action(looped(1, 1, vec![wait(2, 1.0)]));
        assert!(v.validate(&p).is_err());
    }
}
