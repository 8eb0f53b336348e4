//! `photon-hal` – hardware ports.
//!
//! The rest of the system only ever talks to the traits defined here, so a
//! real driver and a simulated one are interchangeable at construction time.
//!
//! # Modules
//!
//! - [`laser`] – [`LaserDriver`]: drive current and output enable.
//! - [`actuator`] – [`ActuatorDriver`]: speed, absolute position, optional
//!   position-reached feedback.
//! - [`gpio_protocol`] – request/response codec for the GPIO
//!   microcontroller's line protocol.
//! - [`gpio`] – [`GpioPeer`] seam and the async [`GpioController`] client.
//! - [`sim`] – simulated ports for headless runs and tests.

pub mod actuator;
pub mod gpio;
pub mod gpio_protocol;
pub mod laser;
pub mod sim;

pub use actuator::ActuatorDriver;
pub use gpio::{GpioController, GpioPeer};
pub use gpio_protocol::{GpioCommand, GpioResponse};
pub use laser::LaserDriver;
pub use sim::{SimActuator, SimGpio, SimLaser};
