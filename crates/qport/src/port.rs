use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use core::ops::Range;

use bitflags::bitflags;
use hashbrown::DefaultHashBuilder;
use indexmap::IndexMap;
use serde::Serialize;

use crate::attrdef::{AttrDef, AttrStorage, AttrValue};
use crate::error::{Error, ErrorKind, Result};
use crate::expr::Expression;
use crate::sequence::Sequence;

/// Maximum number of registered ports.
///
/// Slots are bit indices of a [`DepMask`], so the two are tied together.
pub const MAX_PORTS: usize = 64;

/// Length of the generic per-port extra data blob.
pub const EXTRA_LEN: usize = 24;

/// The value of a port whose value is unknown.
pub const UNDEFINED: f64 = f64::NAN;

/// Dependency mask: bit `N` set means "the port in slot `N` depends on me".
pub type DepMask = u64;

// Relative tolerance used when checking a value against a step.
const STEP_EPSILON: f64 = 1e-9;

/// Returns whether a value is [`UNDEFINED`].
#[inline]
#[must_use]
pub fn is_undefined(value: f64) -> bool {
    value.is_nan()
}

bitflags! {
    /// Port capability and state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PortFlags: u32 {
        /// The port is enabled.
        const ENABLED = 1 << 0;
        /// Clients can write the port value.
        const WRITABLE = 1 << 1;
        /// The value has been set at least once.
        const SET = 1 << 2;
        /// The value is saved with the configuration.
        const PERSISTED = 1 << 3;
        /// The port is hidden from clients.
        const INTERNAL = 1 << 4;
        /// Numeric values must be integers.
        const INTEGER = 1 << 5;
        /// The port is numeric rather than boolean.
        const NUMBER = 1 << 6;
        /// Driver-defined flag.
        const CUSTOM0 = 1 << 8;
        /// Driver-defined flag.
        const CUSTOM1 = 1 << 9;
        /// Driver-defined flag.
        const CUSTOM2 = 1 << 10;
        /// Driver-defined flag.
        const CUSTOM3 = 1 << 11;
    }
}

impl PortFlags {
    // Flags describing the port itself rather than its runtime state.
    pub(crate) const STATIC: Self = Self::WRITABLE
        .union(Self::INTERNAL)
        .union(Self::INTEGER)
        .union(Self::NUMBER);
}

/// Port value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    /// A boolean value, stored as `0` or `1`.
    Boolean,
    /// A numeric value.
    Number,
}

/// An allowed port value.
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    /// The value.
    pub value: f64,
    /// Name shown to users.
    pub display_name: Option<String>,
}

impl Choice {
    /// Creates a [`Choice`].
    #[must_use]
    pub fn new(value: f64, display_name: impl Into<String>) -> Self {
        Self {
            value,
            display_name: Some(display_name.into()),
        }
    }

    /// Creates a [`Choice`] without a display name.
    #[must_use]
    pub const fn value(value: f64) -> Self {
        Self {
            value,
            display_name: None,
        }
    }
}

/// Port categories.
///
/// Each category owns a fixed range of slots, so the persisted offsets of
/// one category never move when ports of another category are added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotCategory {
    /// On-board GPIO and PWM ports.
    Gpio,
    /// Ports produced by peripherals.
    Peripheral,
    /// Ports of stateful composite drivers.
    Extra,
    /// Driver-less ports.
    Virtual,
}

impl SlotCategory {
    /// Returns the slot range of the category.
    #[must_use]
    pub const fn range(self) -> Range<usize> {
        match self {
            Self::Gpio => 0..16,
            Self::Peripheral => 16..40,
            Self::Extra => 40..48,
            Self::Virtual => 48..MAX_PORTS,
        }
    }

    /// Returns the category owning a slot.
    #[must_use]
    pub const fn of_slot(slot: u8) -> Self {
        match slot {
            0..16 => Self::Gpio,
            16..40 => Self::Peripheral,
            40..48 => Self::Extra,
            _ => Self::Virtual,
        }
    }
}

/// The origin of a value change.
///
/// Purely informational: all reasons propagate the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeReason {
    /// The hardware reported a new value.
    Native,
    /// A client wrote the value.
    Api,
    /// A sequence step fired.
    Sequence,
    /// An expression was recomputed.
    Expression,
}

/// Sampling cadence of a port, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sampling {
    /// Current interval, `0` disables polling.
    pub interval: u32,
    /// Minimum accepted interval.
    pub min: u32,
    /// Maximum accepted interval.
    pub max: u32,
    /// Interval restored on factory reset.
    pub default: u32,
    /// Time of the last poll.
    pub last: u64,
}

/// The state shared by a port and its driver.
#[derive(Debug, Clone)]
pub struct PortData {
    /// Port identifier.
    pub id: String,
    /// Slot, `None` until the port is registered.
    pub slot: Option<u8>,
    /// Slot category.
    pub category: SlotCategory,
    /// Index of the owning peripheral.
    pub peripheral: Option<u8>,
    /// Position of the port among the ports of its peripheral.
    pub ordinal: u8,
    /// Name shown to users.
    pub display_name: Option<String>,
    /// Measurement unit.
    pub unit: Option<String>,
    /// Minimum value.
    pub min: Option<f64>,
    /// Maximum value.
    pub max: Option<f64>,
    /// Granularity of the value, starting from `min`.
    pub step: Option<f64>,
    /// Allowed values.
    pub choices: Vec<Choice>,
    /// Flags.
    pub flags: PortFlags,
    /// Current value.
    pub value: f64,
    /// Expression computing the value from other ports.
    pub expression: Option<Expression>,
    /// Expression applied to values written by clients.
    pub transform_write: Option<Expression>,
    /// Expression applied to values read by clients.
    pub transform_read: Option<Expression>,
    /// Ports depending on this one.
    pub change_dep_mask: DepMask,
    /// Sampling cadence.
    pub sampling: Sampling,
    /// Heartbeat interval in milliseconds, `0` disables heartbeats.
    pub heart_beat_interval: u32,
    /// Time of the last heartbeat.
    pub last_heart_beat: u64,
    /// Persisted driver-defined data.
    pub extra: [u8; EXTRA_LEN],
    /// Attribute values read from their persisted location.
    pub attrs: IndexMap<&'static str, AttrValue, DefaultHashBuilder>,
}

impl PortData {
    fn new(id: String, port_type: PortType) -> Self {
        let mut flags = PortFlags::ENABLED;
        if port_type == PortType::Number {
            flags |= PortFlags::NUMBER;
        }

        Self {
            id,
            slot: None,
            category: SlotCategory::Gpio,
            peripheral: None,
            ordinal: 0,
            display_name: None,
            unit: None,
            min: None,
            max: None,
            step: None,
            choices: Vec::new(),
            flags,
            value: UNDEFINED,
            expression: None,
            transform_write: None,
            transform_read: None,
            change_dep_mask: 0,
            sampling: Sampling::default(),
            heart_beat_interval: 0,
            last_heart_beat: 0,
            extra: [0; EXTRA_LEN],
            attrs: IndexMap::with_hasher(DefaultHashBuilder::default()),
        }
    }

    /// Returns the port type.
    #[must_use]
    pub const fn port_type(&self) -> PortType {
        if self.flags.contains(PortFlags::NUMBER) {
            PortType::Number
        } else {
            PortType::Boolean
        }
    }

    /// Returns whether the port is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.flags.contains(PortFlags::ENABLED)
    }

    /// Returns whether clients can write the port.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.flags.contains(PortFlags::WRITABLE)
    }

    /// Returns whether the value is saved with the configuration.
    #[must_use]
    pub const fn is_persisted(&self) -> bool {
        self.flags.contains(PortFlags::PERSISTED)
    }

    /// Returns whether numeric values must be integers.
    #[must_use]
    pub const fn is_integer(&self) -> bool {
        self.flags.contains(PortFlags::INTEGER)
    }

    /// Returns the bit of the port in a [`DepMask`].
    #[must_use]
    pub fn mask_bit(&self) -> DepMask {
        self.slot.map_or(0, |slot| 1 << slot)
    }

    /// Returns the value seen by other ports: [`UNDEFINED`] while the port
    /// is disabled.
    #[must_use]
    pub fn visible_value(&self) -> f64 {
        if self.is_enabled() {
            self.value
        } else {
            UNDEFINED
        }
    }

    /// Checks a value written by a client against the port constraints.
    ///
    /// # Errors
    ///
    /// Fails with the kind naming the violated constraint.
    pub fn check_value(&self, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(Error::new(
                ErrorKind::InvalidAttributeValue,
                format!("port `{}`: value must be a finite number", self.id),
            ));
        }

        if self.port_type() == PortType::Boolean {
            return if value == 0. || value == 1. {
                Ok(())
            } else {
                Err(Error::new(
                    ErrorKind::NotInChoices,
                    format!("port `{}`: {value} is not a boolean", self.id),
                ))
            };
        }

        if !self.choices.is_empty() {
            return if self.choices.iter().any(|choice| choice.value == value) {
                Ok(())
            } else {
                Err(Error::new(
                    ErrorKind::NotInChoices,
                    format!("port `{}`: {value} not in choices", self.id),
                ))
            };
        }

        if let Some(min) = self.min.filter(|min| value < *min) {
            return Err(Error::new(
                ErrorKind::BelowMin,
                format!("port `{}`: {value} < {min}", self.id),
            ));
        }

        if let Some(max) = self.max.filter(|max| value > *max) {
            return Err(Error::new(
                ErrorKind::AboveMax,
                format!("port `{}`: {value} > {max}", self.id),
            ));
        }

        if self.is_integer() && libm::trunc(value) != value {
            return Err(Error::new(
                ErrorKind::NotInteger,
                format!("port `{}`: {value} is not an integer", self.id),
            ));
        }

        if let Some(step) = self.step.filter(|step| *step > 0.) {
            let steps = (value - self.min.unwrap_or(0.)) / step;
            if libm::fabs(steps - libm::round(steps)) > STEP_EPSILON * libm::fmax(1., steps) {
                return Err(Error::new(
                    ErrorKind::InvalidStep,
                    format!("port `{}`: {value} is not a multiple of {step}", self.id),
                ));
            }
        }

        Ok(())
    }

    /// Adapts a computed value to the port type and bounds.
    ///
    /// [`UNDEFINED`] is returned unchanged.
    #[must_use]
    pub fn coerce(&self, value: f64) -> f64 {
        if is_undefined(value) {
            return value;
        }

        if self.port_type() == PortType::Boolean {
            return f64::from(u8::from(value != 0.));
        }

        let mut value = value;
        if self.is_integer() {
            value = libm::round(value);
        }
        if let Some(min) = self.min {
            value = value.max(min);
        }
        if let Some(max) = self.max {
            value = value.min(max);
        }
        value
    }
}

/// The hardware-specific behavior of a port.
///
/// Every method receives the [`PortData`] of the port, so drivers can
/// inspect flags and extra data without keeping a copy.
pub trait PortDriver {
    /// Returns the current hardware value, or [`UNDEFINED`] if unavailable.
    ///
    /// Drivers of slow hardware rate-limit their transactions internally
    /// and return a cached value between polls.
    fn read_value(&mut self, port: &PortData, now_ms: u64) -> f64;

    /// Writes a value to the hardware.
    ///
    /// Returns `false` if the hardware rejected the value.
    fn write_value(&mut self, _port: &PortData, _value: f64, _now_ms: u64) -> bool {
        false
    }

    /// Called whenever the port is enabled or disabled.
    fn configure(&mut self, _port: &PortData, _enabled: bool) {}

    /// Runs periodic hardware housekeeping.
    fn heart_beat(&mut self, _port: &PortData, _now_ms: u64) {}

    /// Returns the extra attributes of the port.
    fn attrdefs(&self) -> &'static [AttrDef] {
        &[]
    }

    /// Returns the value of an attribute stored through custom accessors.
    fn get_attr(&self, _port: &PortData, _name: &str) -> Option<AttrValue> {
        None
    }

    /// Stores the value of an attribute through custom accessors.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnknownAttribute`] unless overridden.
    fn set_attr(&mut self, port: &mut PortData, name: &str, _value: &AttrValue) -> Result<()> {
        Err(Error::new(
            ErrorKind::UnknownAttribute,
            format!("port `{}` has no custom attribute `{name}`", port.id),
        ))
    }
}

/// A port: its data, its driver and its running sequence.
pub struct Port {
    pub(crate) data: PortData,
    pub(crate) driver: Box<dyn PortDriver>,
    pub(crate) sequence: Option<Sequence>,
}

impl core::fmt::Debug for Port {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Port")
            .field("data", &self.data)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Port {
    /// Creates an enabled [`Port`] with an undefined value.
    #[must_use]
    pub fn new(id: impl Into<String>, port_type: PortType, driver: impl PortDriver + 'static) -> Self {
        let mut port = Self {
            data: PortData::new(id.into(), port_type),
            driver: Box::new(driver),
            sequence: None,
        };
        port.apply_attr_defaults();
        port
    }

    // Attributes persisted in the extra blob start from their default.
    fn apply_attr_defaults(&mut self) {
        for def in self.driver.attrdefs() {
            if let (AttrStorage::Extra(field), Some(default)) =
                (def.storage, def.default)
            {
                if let Err(e) = field.write(&mut self.data.extra, default) {
                    log::warn!("Attribute `{}` default not applied: {e}", def.name);
                }
            }
        }
    }

    /// Sets the slot category.
    #[must_use]
    pub fn category(mut self, category: SlotCategory) -> Self {
        self.data.category = category;
        self
    }

    /// Requests a specific slot.
    #[must_use]
    pub fn slot(mut self, slot: u8) -> Self {
        self.data.slot = Some(slot);
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.data.display_name = Some(display_name.into());
        self
    }

    /// Sets the measurement unit.
    #[must_use]
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.data.unit = Some(unit.into());
        self
    }

    /// Sets the minimum value.
    #[must_use]
    pub fn min(mut self, min: f64) -> Self {
        self.data.min = Some(min);
        self
    }

    /// Sets the maximum value.
    #[must_use]
    pub fn max(mut self, max: f64) -> Self {
        self.data.max = Some(max);
        self
    }

    /// Sets the step.
    #[must_use]
    pub fn step(mut self, step: f64) -> Self {
        self.data.step = Some(step);
        self
    }

    /// Requires integer values.
    #[must_use]
    pub fn integer(mut self) -> Self {
        self.data.flags |= PortFlags::INTEGER;
        self
    }

    /// Sets the allowed values.
    #[must_use]
    pub fn choices(mut self, choices: Vec<Choice>) -> Self {
        self.data.choices = choices;
        self
    }

    /// Allows clients to write the value.
    #[must_use]
    pub fn writable(mut self) -> Self {
        self.data.flags |= PortFlags::WRITABLE;
        self
    }

    /// Saves the value with the configuration.
    #[must_use]
    pub fn persisted(mut self) -> Self {
        self.data.flags |= PortFlags::PERSISTED;
        self
    }

    /// Hides the port from clients.
    #[must_use]
    pub fn internal(mut self) -> Self {
        self.data.flags |= PortFlags::INTERNAL;
        self
    }

    /// Creates the port disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.data.flags.remove(PortFlags::ENABLED);
        self
    }

    /// Sets driver-defined flags.
    #[must_use]
    pub fn custom_flags(mut self, flags: PortFlags) -> Self {
        self.data.flags |= flags
            & (PortFlags::CUSTOM0 | PortFlags::CUSTOM1 | PortFlags::CUSTOM2 | PortFlags::CUSTOM3);
        self
    }

    /// Enables value polling with the given default, minimum and maximum
    /// intervals in milliseconds.
    #[must_use]
    pub fn sampling(mut self, default: u32, min: u32, max: u32) -> Self {
        self.data.sampling = Sampling {
            interval: default,
            min,
            max,
            default,
            last: 0,
        };
        self
    }

    /// Enables heartbeats with the given interval in milliseconds.
    #[must_use]
    pub fn heart_beat(mut self, interval: u32) -> Self {
        self.data.heart_beat_interval = interval;
        self
    }

    /// Sets the initial value.
    #[must_use]
    pub fn initial_value(mut self, value: f64) -> Self {
        self.data.value = value;
        self
    }

    /// Returns the port data.
    #[must_use]
    pub fn data(&self) -> &PortData {
        &self.data
    }

    /// Returns the port identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.data.id
    }

    /// Returns the slot.
    #[must_use]
    pub fn slot_number(&self) -> Option<u8> {
        self.data.slot
    }

    /// Returns the current value.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.data.value
    }

    /// Returns the attribute definitions of the driver.
    #[must_use]
    pub fn attrdefs(&self) -> &'static [AttrDef] {
        self.driver.attrdefs()
    }

    /// Returns whether a sequence is running.
    #[must_use]
    pub fn has_sequence(&self) -> bool {
        self.sequence.is_some()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use crate::error::ErrorKind;
    use crate::virtual_port::VirtualDriver;

    use super::{Choice, Port, PortFlags, PortType, SlotCategory, UNDEFINED, is_undefined};

    fn number() -> Port {
        Port::new("level", PortType::Number, VirtualDriver)
            .min(0.)
            .max(100.)
            .step(0.5)
            .writable()
    }

    #[test]
    fn test_flags() {
        let port = number();
        assert_eq!(port.data().port_type(), PortType::Number);
        assert!(port.data().is_enabled());
        assert!(port.data().is_writable());
        assert!(!port.data().is_persisted());

        let port = Port::new("relay", PortType::Boolean, VirtualDriver)
            .disabled()
            .custom_flags(PortFlags::CUSTOM1 | PortFlags::WRITABLE);
        assert_eq!(port.data().port_type(), PortType::Boolean);
        assert!(!port.data().is_enabled());
        // Only custom bits pass through.
        assert!(!port.data().is_writable());
        assert!(port.data().flags.contains(PortFlags::CUSTOM1));
    }

    #[test]
    fn test_slot_categories() {
        assert_eq!(SlotCategory::of_slot(3), SlotCategory::Gpio);
        assert_eq!(SlotCategory::of_slot(16), SlotCategory::Peripheral);
        assert_eq!(SlotCategory::of_slot(47), SlotCategory::Extra);
        assert_eq!(SlotCategory::of_slot(63), SlotCategory::Virtual);
        assert_eq!(SlotCategory::Virtual.range(), 48..64);
    }

    #[test]
    fn test_check_value() {
        let port = number();
        assert!(port.data().check_value(10.5).is_ok());
        assert_eq!(
            port.data().check_value(-1.).unwrap_err().kind,
            ErrorKind::BelowMin
        );
        assert_eq!(
            port.data().check_value(101.).unwrap_err().kind,
            ErrorKind::AboveMax
        );
        assert_eq!(
            port.data().check_value(10.2).unwrap_err().kind,
            ErrorKind::InvalidStep
        );

        let port = number().integer();
        assert_eq!(
            port.data().check_value(10.5).unwrap_err().kind,
            ErrorKind::NotInteger
        );

        let port = number().choices(vec![Choice::new(1., "Low"), Choice::value(2.)]);
        assert!(port.data().check_value(2.).is_ok());
        assert_eq!(
            port.data().check_value(3.).unwrap_err().kind,
            ErrorKind::NotInChoices
        );

        let port = Port::new("relay", PortType::Boolean, VirtualDriver);
        assert!(port.data().check_value(1.).is_ok());
        assert_eq!(
            port.data().check_value(2.).unwrap_err().kind,
            ErrorKind::NotInChoices
        );
    }

    #[test]
    fn test_coerce() {
        let port = number().integer();
        assert_eq!(port.data().coerce(150.), 100.);
        assert_eq!(port.data().coerce(-3.), 0.);
        assert_eq!(port.data().coerce(4.6), 5.);
        assert!(is_undefined(port.data().coerce(UNDEFINED)));

        let port = Port::new("relay", PortType::Boolean, VirtualDriver);
        assert_eq!(port.data().coerce(42.), 1.);
        assert_eq!(port.data().coerce(0.), 0.);
    }

    #[test]
    fn test_visible_value() {
        let port = number().initial_value(3.);
        assert_eq!(port.data().visible_value(), 3.);
        assert!(is_undefined(number().initial_value(3.).disabled().data().visible_value()));
    }
}
