//! REPL – the operator shell.
//!
//! Supported slash-commands:
//!   /status                 – interlocks, safety state, engine and heartbeat
//!   /arm | /disarm          – SAFE ⇄ ARMED
//!   /treat                  – ARMED → TREATING
//!   /stop                   – stop the active run and leave TREATING
//!   /estop | /clear         – latch / clear the emergency stop
//!   /session on|off         – session interlock
//!   /power on|off           – power-limit interlock
//!   /motor <pwm>|off        – interlock motor
//!   /vibration <g>|auto     – pin the simulated vibration reading
//!   /run <file> [--continue] [--record]
//!   /pause | /resume        – pause or resume the active run
//!   /validate <file>        – pre-flight a protocol without running it
//!   /schema                 – print the protocol JSON Schema
//!   /summary                – summary of the last run
//!   /help                   – show this list
//!   /quit | /exit           – leave the console

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use colored::Colorize;
use tokio::sync::{mpsc, watch};

use photon_hal::SimGpio;
use photon_kernel::{InterlockValidator, SafetyStateMachine, WatchdogHeartbeat};
use photon_runtime::{ProtocolExecutionEngine, load_protocol, protocol_schema, validate_protocol};
use photon_types::{ExecutionState, SafetyState};

use crate::config::Config;

/// One parsed shell command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status,
    Arm,
    Disarm,
    Treat,
    Stop,
    EmergencyStop,
    ClearEmergencyStop,
    Session(bool),
    PowerLimit(bool),
    /// `None` stops the motor.
    Motor(Option<u8>),
    /// `None` returns to duty-derived readings.
    Vibration(Option<f32>),
    Run {
        file: String,
        stop_on_error: bool,
        record: bool,
    },
    Pause,
    Resume,
    Validate(String),
    Schema,
    Summary,
    Help,
    Quit,
}

fn on_off(arg: Option<&str>, usage: &str) -> Result<bool, String> {
    match arg {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        _ => Err(format!("usage: {usage} on|off")),
    }
}

/// Parse one input line.  `Err` carries the message shown to the operator.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();
    let first = args.first().copied();

    let cmd = match head {
        "/status" => Command::Status,
        "/arm" => Command::Arm,
        "/disarm" => Command::Disarm,
        "/treat" => Command::Treat,
        "/stop" => Command::Stop,
        "/estop" => Command::EmergencyStop,
        "/clear" => Command::ClearEmergencyStop,
        "/session" => Command::Session(on_off(first, "/session")?),
        "/power" => Command::PowerLimit(on_off(first, "/power")?),
        "/motor" => match first {
            Some("off") => Command::Motor(None),
            Some(v) => match v.parse::<u8>() {
                Ok(0) => Command::Motor(None),
                Ok(pwm) => Command::Motor(Some(pwm)),
                Err(_) => return Err(format!("invalid PWM duty {v:?} (0–255)")),
            },
            None => return Err("usage: /motor <pwm>|off".to_string()),
        },
        "/vibration" => match first {
            Some("auto") => Command::Vibration(None),
            Some(v) => match v.parse::<f32>() {
                Ok(g) if g.is_finite() && g >= 0.0 => Command::Vibration(Some(g)),
                _ => return Err(format!("invalid vibration level {v:?}")),
            },
            None => return Err("usage: /vibration <g>|auto".to_string()),
        },
        "/run" => {
            let mut file = None;
            let mut stop_on_error = true;
            let mut record = false;
            for arg in &args {
                match *arg {
                    "--continue" => stop_on_error = false,
                    "--record" => record = true,
                    flag if flag.starts_with("--") => {
                        return Err(format!("unknown flag {flag:?}"));
                    }
                    path if file.is_none() => file = Some(path.to_string()),
                    extra => return Err(format!("unexpected argument {extra:?}")),
                }
            }
            let Some(file) = file else {
                return Err("usage: /run <file> [--continue] [--record]".to_string());
            };
            Command::Run {
                file,
                stop_on_error,
                record,
            }
        }
        "/pause" => Command::Pause,
        "/resume" => Command::Resume,
        "/validate" => match first {
            Some(file) => Command::Validate(file.to_string()),
            None => return Err("usage: /validate <file>".to_string()),
        },
        "/schema" => Command::Schema,
        "/summary" => Command::Summary,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other => {
            return Err(format!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                other.yellow(),
                "/help".bold()
            ));
        }
    };
    Ok(cmd)
}

/// Handles shared by every command.
pub struct Shell {
    config: Config,
    safety: Arc<SafetyStateMachine>,
    engine: Arc<ProtocolExecutionEngine>,
    validator: Arc<InterlockValidator>,
    watchdog: Arc<WatchdogHeartbeat>,
    /// Present only when the GPIO peer is simulated in-process.
    sim_gpio: Option<SimGpio>,
}

impl Shell {
    pub fn new(
        config: Config,
        safety: Arc<SafetyStateMachine>,
        engine: Arc<ProtocolExecutionEngine>,
        validator: Arc<InterlockValidator>,
        watchdog: Arc<WatchdogHeartbeat>,
        sim_gpio: Option<SimGpio>,
    ) -> Self {
        Self {
            config,
            safety,
            engine,
            validator,
            watchdog,
            sim_gpio,
        }
    }

    /// Execute one command.  Returns `false` when the shell should exit.
    async fn dispatch(&self, cmd: Command) -> bool {
        match cmd {
            Command::Status => self.cmd_status(),
            Command::Arm => report("arm", self.safety.arm_system()),
            Command::Disarm => report("disarm", self.safety.disarm_system()),
            Command::Treat => report("start treatment", self.safety.start_treatment()),
            Command::Stop => {
                if self.engine.state().is_active() {
                    self.engine.stop();
                    println!("  {}", "Stop requested.".green());
                }
                if self.safety.state() == SafetyState::Treating {
                    report("stop treatment", self.safety.stop_treatment());
                }
            }
            Command::EmergencyStop => {
                self.safety.trigger_emergency_stop();
                self.engine.stop();
                println!("  {}", "EMERGENCY STOP latched.".red().bold());
            }
            Command::ClearEmergencyStop => {
                report("clear emergency stop", self.safety.clear_emergency_stop())
            }
            Command::Session(valid) => self.safety.set_session_valid(valid),
            Command::PowerLimit(ok) => self.safety.set_power_limit_ok(ok),
            Command::Motor(pwm) => {
                let result = match pwm {
                    Some(pwm) => self.validator.start_motor(pwm).await,
                    None => self.validator.stop_motor().await,
                };
                if let Err(e) = result {
                    println!("  {} {e}", "Motor command failed:".red());
                }
            }
            Command::Vibration(level) => match &self.sim_gpio {
                Some(sim) => match level {
                    Some(g) => sim.set_vibration(g),
                    None => sim.clear_vibration_override(),
                },
                None => println!("  {}", "Vibration can only be pinned on the simulated peer.".yellow()),
            },
            Command::Run {
                file,
                stop_on_error,
                record,
            } => self.cmd_run(&file, stop_on_error, record),
            Command::Pause => self.engine.pause(),
            Command::Resume => self.engine.resume(),
            Command::Validate(file) => self.cmd_validate(&file),
            Command::Schema => match serde_json::to_string_pretty(&protocol_schema()) {
                Ok(schema) => println!("{schema}"),
                Err(e) => println!("  {} {e}", "Schema error:".red()),
            },
            Command::Summary => self.cmd_summary(),
            Command::Help => cmd_help(),
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                return false;
            }
        }
        true
    }

    fn cmd_status(&self) {
        let d = self.safety.get_interlock_details();
        let flag = |ok: bool| if ok { "ok".green() } else { "FAULT".red() };

        println!();
        println!("  {}", "Safety".bold().underline());
        println!("    state           : {}", d.state.to_string().cyan());
        println!("    gpio interlock  : {}", flag(d.gpio_ok));
        println!("    session         : {}", flag(d.session_valid));
        println!("    power limit     : {}", flag(d.power_limit_ok));
        if d.emergency_stop {
            println!("    emergency stop  : {}", "LATCHED".red().bold());
        }
        if d.developer_bypass {
            println!("    developer bypass: {}", "ACTIVE".yellow().bold());
        }
        println!(
            "    laser enable    : {}",
            if d.laser_enable_permitted { "PERMITTED".green().bold() } else { "denied".red() }
        );

        println!("  {}", "Interlock motor".bold().underline());
        println!("    commanded       : {}", self.validator.is_motor_commanded());
        println!("    vibration ok    : {}", flag(self.validator.get_safety_status()));
        println!("    window          : {}", self.validator.consecutive_samples());

        let stats = self.watchdog.stats();
        println!("  {}", "Watchdog".bold().underline());
        println!(
            "    running         : {}",
            if self.watchdog.is_running() { "yes".green() } else { "NO".red().bold() }
        );
        println!(
            "    heartbeats      : {} sent, {} failed ({} consecutive)",
            stats.sent_count, stats.failed_count, stats.consecutive_failures
        );

        println!("  {}", "Engine".bold().underline());
        println!("    state           : {}", self.engine.state().to_string().cyan());
        println!();
    }

    fn cmd_run(&self, file: &str, stop_on_error: bool, record: bool) {
        if self.engine.state().is_active() {
            println!("  {}", "A protocol is already running.".red());
            return;
        }
        let path = self.config.resolve_protocol(file);
        let protocol = match load_protocol(&path) {
            Ok(p) => p,
            Err(e) => {
                println!("  {} {e}", "Could not load protocol:".red());
                return;
            }
        };
        println!(
            "  Running {} ({} action(s))…",
            protocol.protocol_name.cyan(),
            protocol.total_action_count()
        );
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let outcome = engine.execute(&protocol, record, stop_on_error).await;
            if outcome.success {
                println!("\n  {} {}", "Run finished:".green().bold(), outcome.message);
            } else {
                println!("\n  {} {}", "Run failed:".red().bold(), outcome.message);
            }
        });
    }

    fn cmd_validate(&self, file: &str) {
        let path = self.config.resolve_protocol(file);
        match load_protocol(&path).and_then(|p| validate_protocol(&p).map(|()| p)) {
            Ok(p) => println!(
                "  {} {} is valid ({} action(s)).",
                "✓".green(),
                p.protocol_name.cyan(),
                p.total_action_count()
            ),
            Err(e) => println!("  {} {e}", "✗".red()),
        }
    }

    fn cmd_summary(&self) {
        let summary = self.engine.get_execution_summary();
        if summary.run_id.is_none() {
            println!("  No protocol has been run yet.");
            return;
        }
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{json}"),
            Err(e) => println!("  {} {e}", "Summary error:".red()),
        }
        if summary.state == ExecutionState::Completed && !summary.failures.is_empty() {
            println!(
                "  {} {} non-critical failure(s) were skipped.",
                "note:".yellow(),
                summary.failures.len()
            );
        }
    }
}

fn report(what: &str, accepted: bool) {
    if accepted {
        println!("  {} {what}", "✓".green());
    } else {
        println!("  {} {what} rejected in the current state", "✗".red());
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Available commands:".bold().underline());
    let rows = [
        ("/status", "Interlocks, safety state, engine and heartbeat"),
        ("/arm, /disarm", "Arm or disarm the system"),
        ("/treat", "Begin treatment (ARMED → TREATING)"),
        ("/stop", "Stop the active run and leave TREATING"),
        ("/estop", "Latch the emergency stop"),
        ("/clear", "Clear the emergency stop"),
        ("/session on|off", "Set the session interlock"),
        ("/power on|off", "Set the power-limit interlock"),
        ("/motor <pwm>|off", "Command the interlock motor"),
        ("/vibration <g>|auto", "Pin the simulated vibration reading"),
        ("/run <file> [--continue] [--record]", "Execute a protocol"),
        ("/pause, /resume", "Pause or resume the active run"),
        ("/validate <file>", "Pre-flight a protocol"),
        ("/schema", "Print the protocol JSON Schema"),
        ("/summary", "Show the last run summary"),
        ("/quit, /exit", "Leave the console"),
    ];
    for (cmd, desc) in rows {
        println!("  {:<38} {}", cmd.cyan(), desc);
    }
    println!();
}

/// Entry point for the interactive shell.
///
/// Lines are read on a dedicated thread so an in-flight protocol run keeps
/// executing while the prompt waits.  Returns when the operator quits,
/// stdin closes, or `shutdown` flips to `true`.
pub async fn run(shell: Shell, mut shutdown: watch::Receiver<bool>) {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("{}: {}", "Read error".red(), e);
                    break;
                }
            }
        }
    });

    loop {
        print!("{} ", "photon>".bold().cyan());
        io::stdout().flush().ok();

        let line = tokio::select! {
            line = line_rx.recv() => line,
            _ = shutdown.wait_for(|stop| *stop) => break,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_command(line) {
            Ok(cmd) => {
                if !shell.dispatch(cmd).await {
                    break;
                }
            }
            Err(msg) => println!("  {msg}"),
        }
    }
}
