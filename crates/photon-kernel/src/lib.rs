//! `photon-kernel` – Safety Core
//!
//! Owns the authoritative safety state and the two hardware-facing guards
//! that feed it.  Nothing here drives the laser; the kernel only decides
//! whether the laser may be driven.
//!
//! # Modules
//!
//! - [`safety`] – [`SafetyStateMachine`][safety::SafetyStateMachine]:
//!   aggregates the GPIO, session and power-limit interlocks plus a latched
//!   emergency stop into a single *laser enable permitted* level.
//! - [`interlock`] – [`InterlockValidator`][interlock::InterlockValidator]:
//!   debounces motor-command and vibration feedback into the GPIO interlock.
//! - [`watchdog`] – [`WatchdogHeartbeat`][watchdog::WatchdogHeartbeat]:
//!   feeds the GPIO peer's hardware watchdog and self-stops on repeated
//!   failure.

pub mod interlock;
pub mod safety;
pub mod watchdog;

pub use interlock::{InterlockConfig, InterlockValidator};
pub use safety::SafetyStateMachine;
pub use watchdog::{WatchdogConfig, WatchdogHeartbeat};
