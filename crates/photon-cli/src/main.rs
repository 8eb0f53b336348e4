//! `photon` – operator console for the laser safety core.
//!
//! 1. Loads `~/.photon/config.toml` (writing defaults on first run).
//! 2. Connects the GPIO peer (in-process simulator or a TCP serial bridge),
//!    then wires the safety state machine, interlock validator, watchdog
//!    heartbeat and protocol execution engine together.
//! 3. Drops the operator into an interactive shell (`/help` for commands).
//! 4. Intercepts **Ctrl-C** to latch an emergency stop and exit safely.

mod config;
mod repl;

use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use photon_hal::{GpioController, GpioPeer, SimActuator, SimGpio, SimLaser};
use photon_kernel::{InterlockValidator, SafetyStateMachine, WatchdogHeartbeat};
use photon_middleware::{EventBus, Topic};
use photon_runtime::ProtocolExecutionEngine;
use photon_types::{EventPayload, PhotonError};

use crate::config::{Config, GpioEndpoint};
use crate::repl::Shell;

fn main() {
    let _otel = photon_runtime::init_tracing("photon");

    print_banner();

    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{} {e}", "Configuration error:".red().bold());
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{} {e}", "Failed to start runtime:".red().bold());
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cfg)) {
        error!(error = %e, "photon exited with an error");
        eprintln!("{} {e}", "Fatal:".red().bold());
        std::process::exit(1);
    }
}

fn load_config() -> Result<Config, PhotonError> {
    let cfg = match config::load()? {
        Some(cfg) => cfg,
        None => {
            let mut cfg = Config::default();
            config::save(&cfg)?;
            println!(
                "  {} {}",
                "Wrote default configuration to".dimmed(),
                config::config_path().display()
            );
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    cfg.validate()?;
    Ok(cfg)
}

async fn run(cfg: Config) -> Result<(), PhotonError> {
    let bus = EventBus::default();
    let safety = Arc::new(SafetyStateMachine::new(bus.clone()));

    // ── GPIO peer ─────────────────────────────────────────────────────────
    let controller = Arc::new(GpioController::new(Duration::from_millis(
        cfg.gpio.response_timeout_ms,
    )));
    let sim_gpio = match cfg.gpio_endpoint()? {
        GpioEndpoint::Sim => {
            let sim = SimGpio::new();
            let (host, device) = tokio::io::duplex(4096);
            tokio::spawn(sim.clone().serve(device));
            controller.connect(host).await;
            println!("  {} simulated GPIO peer", "gpio:".bold());
            Some(sim)
        }
        GpioEndpoint::Tcp(addr) => {
            controller.connect_tcp(&addr).await?;
            println!("  {} bridge at {}", "gpio:".bold(), addr.cyan());
            None
        }
    };
    let peer: Arc<dyn GpioPeer> = controller.clone();

    // ── Safety chain ──────────────────────────────────────────────────────
    let validator = Arc::new(
        InterlockValidator::new(cfg.interlock, Arc::clone(&peer), bus.clone())
            .with_safety(Arc::clone(&safety)),
    );
    let monitor = Arc::clone(&validator).spawn_monitor();

    let watchdog = Arc::new(WatchdogHeartbeat::new(
        cfg.watchdog,
        Arc::clone(&peer),
        bus.clone(),
    ));
    if let Err(e) = watchdog.start() {
        warn!(error = %e, "watchdog heartbeat not started");
        println!("  {} {e}", "watchdog not running:".red());
    }

    if cfg.developer_mode {
        safety.set_developer_bypass(true);
        println!(
            "  {}",
            "DEVELOPER MODE: laser interlocks bypassed (emergency stop still honoured)"
                .yellow()
                .bold()
        );
    }

    // Only simulated laser and actuator drivers ship with the console.
    let engine = Arc::new(ProtocolExecutionEngine::new(
        cfg.engine.clone(),
        Arc::clone(&safety),
        Box::new(SimLaser::new("treatment_laser")),
        Box::new(SimActuator::new("stage_z").with_feedback()),
    ));

    let event_log = spawn_event_log(&bus);

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let safety = Arc::clone(&safety);
        let engine = Arc::clone(&engine);
        if let Err(e) = ctrlc::set_handler(move || {
            println!(
                "\n{}",
                "[!] Ctrl-C received – latching EMERGENCY STOP and shutting down."
                    .red()
                    .bold()
            );
            safety.trigger_emergency_stop();
            engine.stop();
            shutdown_tx.send_replace(true);
        }) {
            warn!("Could not install Ctrl-C handler: {e}");
        }
    }

    info!(endpoint = %cfg.gpio.endpoint, "photon console ready");

    let shell = Shell::new(
        cfg,
        Arc::clone(&safety),
        Arc::clone(&engine),
        Arc::clone(&validator),
        Arc::clone(&watchdog),
        sim_gpio,
    );
    repl::run(shell, shutdown_rx).await;

    // ── Teardown: laser first, then motor, heartbeat and link ─────────────
    engine.stop();
    if let Err(e) = validator.stop_motor().await {
        warn!(error = %e, "failed to stop interlock motor on exit");
    }
    watchdog.stop();
    monitor.abort();
    event_log.abort();
    controller.disconnect().await;
    info!("photon console stopped");
    Ok(())
}

/// Print safety-relevant bus traffic to the console as it happens.
fn spawn_event_log(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut safety_rx = bus.subscribe_to(Topic::Safety);
    let mut watchdog_rx = bus.subscribe_to(Topic::Watchdog);
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                ev = safety_rx.recv() => ev,
                ev = watchdog_rx.recv() => ev,
            };
            let event = match event {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "console event log lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event.payload {
                EventPayload::SafetyStateChanged { state, status } => {
                    println!("\n  {} {} ({status})", "safety:".bold(), state.to_string().cyan());
                }
                EventPayload::SafetyEvent { kind, message } => {
                    println!("\n  {} {kind:?}: {message}", "event:".bold());
                }
                EventPayload::WatchdogCriticalFault { message, .. } => {
                    println!("\n  {} {message}", "WATCHDOG FAULT:".red().bold());
                }
                _ => {}
            }
        }
    })
}

fn print_banner() {
    println!();
    println!("{}", "  ┌──────────────────────────────────────┐".cyan());
    println!("{}", "  │   photon – laser safety console      │".cyan().bold());
    println!("{}", "  └──────────────────────────────────────┘".cyan());
    println!("  Type {} for commands. Ctrl-C latches an emergency stop.", "/help".bold());
    println!();
}
