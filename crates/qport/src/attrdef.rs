use alloc::format;
use alloc::string::String;

use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};
use crate::layout::Field;
use crate::port::PortFlags;

/// Attribute value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrKind {
    /// A boolean value.
    Boolean,
    /// A numeric value.
    Number,
    /// A string value.
    String,
}

/// An attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// A boolean value.
    Bool(bool),
    /// A numeric value.
    Number(f64),
    /// A string value.
    Str(String),
}

impl AttrValue {
    /// Returns the [`AttrKind`] of the value.
    #[must_use]
    pub const fn kind(&self) -> AttrKind {
        match self {
            Self::Bool(_) => AttrKind::Boolean,
            Self::Number(_) => AttrKind::Number,
            Self::Str(_) => AttrKind::String,
        }
    }

    /// Returns the value as a number, booleans map to `0` and `1`.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Bool(value) => Some(f64::from(u8::from(*value))),
            Self::Number(value) => Some(*value),
            Self::Str(_) => None,
        }
    }

    /// Returns the value as a string slice.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }
}

/// Where an attribute value is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrStorage {
    /// A field inside the per-port extra data blob.
    Extra(Field),
    /// A field inside the parameter block of the owning peripheral.
    Param(Field),
    /// A bit of the port flags.
    Flag(PortFlags),
    /// Accessors supplied by the port driver.
    Custom,
}

/// An attribute definition.
///
/// Describes a configurable, typed property of a port, together with
/// the location where its value is persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttrDef {
    /// Attribute name.
    pub name: &'static str,
    /// Name shown to users.
    pub display_name: &'static str,
    /// Attribute description.
    pub description: &'static str,
    /// Measurement unit.
    pub unit: Option<&'static str>,
    /// Value type.
    pub kind: AttrKind,
    /// Whether clients can modify the value.
    pub modifiable: bool,
    /// Minimum value.
    pub min: Option<f64>,
    /// Maximum value.
    pub max: Option<f64>,
    /// Whether the value must be an integer.
    pub integer: bool,
    /// Granularity of the value, starting from `min`.
    pub step: Option<f64>,
    /// Allowed values and their display names.
    pub choices: &'static [(f64, &'static str)],
    /// Whether changing the value requires reconnecting the hardware.
    pub reconnect: bool,
    /// Persistence location.
    pub storage: AttrStorage,
    /// Value written to the persistence location when a port is created.
    pub default: Option<f64>,
}

impl AttrDef {
    const fn new(name: &'static str, kind: AttrKind, storage: AttrStorage) -> Self {
        Self {
            name,
            display_name: name,
            description: "",
            unit: None,
            kind,
            modifiable: true,
            min: None,
            max: None,
            integer: false,
            step: None,
            choices: &[],
            reconnect: false,
            storage,
            default: None,
        }
    }

    /// Creates a boolean [`AttrDef`].
    #[must_use]
    pub const fn boolean(name: &'static str, storage: AttrStorage) -> Self {
        Self::new(name, AttrKind::Boolean, storage)
    }

    /// Creates a numeric [`AttrDef`].
    #[must_use]
    pub const fn number(name: &'static str, storage: AttrStorage) -> Self {
        Self::new(name, AttrKind::Number, storage)
    }

    /// Creates a string [`AttrDef`].
    ///
    /// String attributes can only be stored through custom accessors.
    #[must_use]
    pub const fn string(name: &'static str) -> Self {
        Self::new(name, AttrKind::String, AttrStorage::Custom)
    }

    /// Sets the display name.
    #[must_use]
    pub const fn display_name(mut self, display_name: &'static str) -> Self {
        self.display_name = display_name;
        self
    }

    /// Sets the description.
    #[must_use]
    pub const fn description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the measurement unit.
    #[must_use]
    pub const fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the minimum value.
    #[must_use]
    pub const fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Sets the maximum value.
    #[must_use]
    pub const fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Requires an integer value.
    #[must_use]
    pub const fn integer(mut self) -> Self {
        self.integer = true;
        self
    }

    /// Sets the step.
    #[must_use]
    pub const fn step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    /// Sets the allowed values.
    #[must_use]
    pub const fn choices(mut self, choices: &'static [(f64, &'static str)]) -> Self {
        self.choices = choices;
        self
    }

    /// Marks the attribute as read-only.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.modifiable = false;
        self
    }

    /// Marks the attribute as requiring a hardware reconnection.
    #[must_use]
    pub const fn reconnect(mut self) -> Self {
        self.reconnect = true;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub const fn default(mut self, default: f64) -> Self {
        self.default = Some(default);
        self
    }

    /// Checks a value against the definition and returns its quantized form.
    ///
    /// Integer attributes truncate and stepped attributes round to the
    /// nearest step, as their persisted form would.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InvalidAttributeValue`] if the value has the
    /// wrong type or violates a constraint.
    pub fn validate(&self, value: AttrValue) -> Result<AttrValue> {
        let invalid = |reason: &str| {
            Error::new(
                ErrorKind::InvalidAttributeValue,
                format!("attribute `{}`: {reason}", self.name),
            )
        };

        if value.kind() != self.kind {
            return Err(invalid("wrong value type"));
        }

        let mut number = match value {
            AttrValue::Number(number) => number,
            other => return Ok(other),
        };

        if !number.is_finite() {
            return Err(invalid("not a finite number"));
        }

        if !self.choices.is_empty() {
            return if self.choices.iter().any(|(choice, _)| *choice == number) {
                Ok(AttrValue::Number(number))
            } else {
                Err(invalid("value not in choices"))
            };
        }

        if self.integer {
            number = libm::trunc(number);
        }

        if let Some(step) = self.step.filter(|step| *step > 0.) {
            let base = self.min.unwrap_or(0.);
            number = base + libm::round((number - base) / step) * step;
        }

        if let Some(min) = self.min.filter(|min| number < *min) {
            return Err(invalid(&format!("{number} < {min}")));
        }

        if let Some(max) = self.max.filter(|max| number > *max) {
            return Err(invalid(&format!("{number} > {max}")));
        }

        Ok(AttrValue::Number(number))
    }
}
