//! The port runtime of a `qport` device.
//!
//! A device exposes a set of typed, named *ports*: boolean or numeric signals
//! produced by sensors or consumed by actuators. This crate provides APIs to:
//!
//! - Describe ports, their constraints, flags and extra attributes
//!   (attrdefs) in a single polymorphic value model.
//! - Plug hardware drivers in as *peripherals*, each owning shared state and
//!   a fixed-size parameter block, and producing one or more ports.
//! - Keep ports in a registry with stable slot numbers.
//! - Compute port values from expressions over other ports, re-evaluating
//!   dependents in order whenever a source value changes.
//! - Drive ports through timed value sequences.
//! - Run periodic heartbeats and value sampling from a single cooperative
//!   tick.
//! - Pack the whole configuration into fixed-offset binary records meant
//!   to be stored in flash.
//!
//! Network transport, Wi-Fi management and flash wear-levelling are left to
//! the firmware embedding this crate: it only consumes the JSON contract
//! in [`json`] and the [`config::ConfigStore`] trait.
//!
//! This crate is `no_std` and only requires an allocator.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

/// Attribute definitions.
pub mod attrdef;
/// Binary configuration layout and storage.
pub mod config;
/// The expression dependency engine.
pub mod deps;
/// The device: the owner of ports and peripherals.
pub mod device;
/// Error management.
pub mod error;
/// The expression language.
pub mod expr;
/// Interrupt-shared counters and ring buffers.
pub mod isr;
/// JSON representation of ports.
pub mod json;
/// Typed accessors over packed byte blocks.
pub mod layout;
/// Peripherals and their drivers.
pub mod peripheral;
/// Ports and their drivers.
pub mod port;
/// The port registry and slot allocator.
pub mod registry;
/// Cached hardware sampling.
pub mod sampling;
/// Output sequences.
pub mod sequence;
/// Runtime settings.
pub mod settings;
/// System hooks and event notifications.
pub mod system;
/// Driver-less ports.
pub mod virtual_port;

pub use device::Device;
pub use error::{Error, ErrorKind, Result};
pub use port::{ChangeReason, Port, PortData, PortDriver, PortFlags, PortType, UNDEFINED};
pub use settings::Settings;

#[cfg(test)]
pub(crate) fn serialize<T: serde::Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap()
}
