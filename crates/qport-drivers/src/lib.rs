//! `qport-drivers` provides the hardware drivers of a `qport` device.
//!
//! All drivers are implemented using only the [`embedded-hal`] traits, so
//! they run on any platform supporting these abstractions. Each driver
//! plugs into the port runtime either as a port driver for a firmware port
//! (GPIO, PWM) or as a peripheral producing its own ports.
//!
//! [`embedded-hal`]: https://crates.io/crates/embedded-hal

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

/// Peripheral type of the pulse counter.
pub const PULSE_COUNTER: u16 = 4;

/// Peripheral type of the `DHT22` sensor.
pub const DHT22: u16 = 5;

/// Peripheral type of the energy meter.
pub const ENERGY_METER: u16 = 6;

/// Peripheral type of the gate controller.
pub const GATE: u16 = 7;

/// The `DHT22` driver.
#[cfg(feature = "dht22")]
pub mod dht22;

/// The energy meter driver.
#[cfg(feature = "energy-meter")]
pub mod energy_meter;

/// The gate controller.
#[cfg(feature = "gate")]
pub mod gate;

/// Digital input and output ports.
#[cfg(feature = "gpio")]
pub mod gpio;

/// The pulse counter.
#[cfg(feature = "pulse-counter")]
pub mod pulse_counter;

/// Duty-cycle output ports.
#[cfg(feature = "pwm")]
pub mod pwm;
