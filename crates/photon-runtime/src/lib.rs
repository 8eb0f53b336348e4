//! `photon-runtime` – protocol execution.
//!
//! Turns operator-authored protocol documents into timed hardware actions,
//! strictly under the authorization of the kernel's safety state machine.
//!
//! # Modules
//!
//! - [`engine`] – [`ProtocolExecutionEngine`][engine::ProtocolExecutionEngine]:
//!   runs one protocol at a time with per-action timeouts, hardware retries,
//!   pause/resume/stop checkpoints, and pushed safety revocation.
//! - [`ramp`] – power ramp curves and their discretisation.
//! - [`validation`] – [`ProtocolValidator`][validation::ProtocolValidator]:
//!   ordered pre-flight rules (structure, power cap, timing, travel).
//! - [`protocol_io`] – atomic JSON load/save and the document JSON Schema.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: `tracing`
//!   subscriber with optional OTLP span export.

pub mod engine;
pub mod protocol_io;
pub mod ramp;
pub mod telemetry;
pub mod validation;

pub use engine::{EngineConfig, ProtocolExecutionEngine};
pub use protocol_io::{load_protocol, protocol_schema, save_protocol};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use validation::{ProtocolRule, ProtocolValidator, validate_protocol};
