//! [`WatchdogHeartbeat`] – periodic feed of the GPIO peer's hardware watchdog.
//!
//! The peer cuts laser power on its own when it stops hearing `WDT_RESET`
//! within its hardware timeout.  This side sends one feed every
//! `heartbeat_interval_ms`; after `max_consecutive_failures` failed feeds in
//! a row it stops itself and publishes a single
//! [`EventPayload::WatchdogCriticalFault`], leaving the peer to time out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use photon_hal::GpioPeer;
use photon_middleware::{EventBus, Topic};
use photon_types::{EventPayload, HeartbeatStats, PhotonError};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const SOURCE: &str = "photon-kernel::watchdog";

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub heartbeat_interval_ms: u64,
    /// Timeout configured in the peer firmware; informational on this side
    /// but must leave room for at least one missed feed.
    pub hardware_timeout_ms: u64,
    pub max_consecutive_failures: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            hardware_timeout_ms: 1000,
            max_consecutive_failures: 3,
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<(), PhotonError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(PhotonError::Config("heartbeat_interval_ms must be non-zero".into()));
        }
        if self.heartbeat_interval_ms >= self.hardware_timeout_ms {
            return Err(PhotonError::Config(format!(
                "heartbeat interval {} ms must be shorter than the hardware timeout {} ms",
                self.heartbeat_interval_ms, self.hardware_timeout_ms
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(PhotonError::Config(
                "max_consecutive_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Heartbeat
// ────────────────────────────────────────────────────────────────────────────

struct Shared {
    running: AtomicBool,
    stats: Mutex<HeartbeatStats>,
}

impl Shared {
    fn stats(&self) -> MutexGuard<'_, HeartbeatStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Periodic `WDT_RESET` transmitter.
pub struct WatchdogHeartbeat {
    config: WatchdogConfig,
    peer: Arc<dyn GpioPeer>,
    bus: EventBus,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatchdogHeartbeat {
    pub fn new(config: WatchdogConfig, peer: Arc<dyn GpioPeer>, bus: EventBus) -> Self {
        Self {
            config,
            peer,
            bus,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                stats: Mutex::new(HeartbeatStats::default()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Begin feeding the watchdog.  The first feed goes out immediately.
    ///
    /// Must be called from within a Tokio runtime.  Calling `start` while
    /// already running is a no-op.
    ///
    /// # Errors
    ///
    /// - [`PhotonError::NotConnected`] – the GPIO peer has no open link.
    /// - [`PhotonError::Config`] – invalid configuration or no runtime.
    pub fn start(&self) -> Result<(), PhotonError> {
        self.config.validate()?;
        if !self.peer.is_connected() {
            warn!("watchdog start refused: GPIO peer not connected");
            return Err(PhotonError::NotConnected(
                "cannot start heartbeat without a GPIO link".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PhotonError::Config(format!("heartbeat needs a Tokio runtime: {e}")))?;

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shared.running.swap(true, Ordering::AcqRel) {
            debug!("watchdog heartbeat already running");
            return Ok(());
        }
        *self.shared.stats() = HeartbeatStats::default();

        let handle = runtime.spawn(run(
            self.config,
            Arc::clone(&self.peer),
            self.bus.clone(),
            Arc::clone(&self.shared),
        ));
        if let Some(old) = task.replace(handle) {
            old.abort();
        }
        info!(interval_ms = self.config.heartbeat_interval_ms, "watchdog heartbeat started");
        Ok(())
    }

    /// Stop feeding the watchdog and publish [`EventPayload::WatchdogStopped`].
    ///
    /// Idempotent; does nothing after a critical-fault self-stop.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        if self.shared.running.swap(false, Ordering::AcqRel) {
            info!("watchdog heartbeat stopped");
            self.bus.notify(Topic::Watchdog, SOURCE, EventPayload::WatchdogStopped);
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> HeartbeatStats {
        *self.shared.stats()
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }
}

impl Drop for WatchdogHeartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

async fn run(config: WatchdogConfig, peer: Arc<dyn GpioPeer>, bus: EventBus, shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let result = peer.reset_watchdog().await;

        let stats = {
            let mut stats = shared.stats();
            match &result {
                Ok(()) => {
                    stats.sent_count += 1;
                    stats.consecutive_failures = 0;
                }
                Err(e) => {
                    stats.failed_count += 1;
                    stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
                    warn!(
                        error = %e,
                        consecutive = stats.consecutive_failures,
                        "watchdog feed failed"
                    );
                }
            }
            *stats
        };
        bus.notify(Topic::Watchdog, SOURCE, EventPayload::HeartbeatStatus(stats));

        if stats.consecutive_failures >= config.max_consecutive_failures {
            shared.running.store(false, Ordering::Release);
            let message = format!(
                "{} consecutive watchdog feeds failed; hardware watchdog will cut laser power",
                stats.consecutive_failures
            );
            error!("{message}");
            bus.notify(
                Topic::Watchdog,
                SOURCE,
                EventPayload::WatchdogCriticalFault {
                    consecutive_failures: stats.consecutive_failures,
                    message,
                },
            );
            break;
        }
    }
}
