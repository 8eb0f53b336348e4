//! `photon-middleware` – notification plumbing.
//!
//! Routes notifications from the safety core to any number of independent
//! listeners without the core ever waiting on, or being unwound by, a
//! listener.
//!
//! # Modules
//!
//! - [`bus`] – Headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
