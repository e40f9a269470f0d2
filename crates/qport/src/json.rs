use alloc::string::String;
use alloc::vec::Vec;

use hashbrown::DefaultHashBuilder;
use indexmap::IndexMap;
use serde::Serialize;

use crate::attrdef::{AttrDef, AttrKind, AttrValue};
use crate::port::{Choice, Port, PortFlags, PortType};

/// A port value as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PortValue {
    /// The value of a boolean port.
    Boolean(bool),
    /// The value of a numeric port.
    Number(f64),
}

/// An allowed value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChoiceJson {
    /// Name shown to users.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// The value.
    pub value: f64,
}

impl From<&Choice> for ChoiceJson {
    fn from(choice: &Choice) -> Self {
        Self {
            display_name: choice.display_name.clone(),
            value: choice.value,
        }
    }
}

/// An attribute definition as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttrDefJson {
    /// Name shown to users.
    pub display_name: &'static str,
    /// Description.
    pub description: &'static str,
    /// Measurement unit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    /// Value type.
    #[serde(rename = "type")]
    pub kind: AttrKind,
    /// Whether the value can be modified.
    pub modifiable: bool,
    /// Minimum value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Maximum value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Whether the value must be an integer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integer: Option<bool>,
    /// Step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    /// Allowed values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<ChoiceJson>>,
    /// Whether changing the value reconnects the hardware.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<bool>,
}

impl From<&AttrDef> for AttrDefJson {
    fn from(def: &AttrDef) -> Self {
        Self {
            display_name: def.display_name,
            description: def.description,
            unit: def.unit,
            kind: def.kind,
            modifiable: def.modifiable,
            min: def.min,
            max: def.max,
            integer: def.integer.then_some(true),
            step: def.step,
            choices: (!def.choices.is_empty()).then(|| {
                def.choices
                    .iter()
                    .map(|(value, name)| ChoiceJson {
                        display_name: Some((*name).into()),
                        value: *value,
                    })
                    .collect()
            }),
            reconnect: def.reconnect.then_some(true),
        }
    }
}

/// A port as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortJson {
    /// Identifier.
    pub id: String,
    /// Name shown to users, the identifier when unset.
    pub display_name: String,
    /// Value type.
    #[serde(rename = "type")]
    pub port_type: PortType,
    /// Measurement unit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Minimum value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Maximum value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    /// Whether the value must be an integer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integer: Option<bool>,
    /// Allowed values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<ChoiceJson>>,
    /// Current value, `null` when undefined.
    pub value: Option<PortValue>,
    /// Whether the port is enabled.
    pub enabled: bool,
    /// Whether clients can write the value.
    pub writable: bool,
    /// Whether the value is saved with the configuration.
    pub persisted: bool,
    /// Value expression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Write transform.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform_write: Option<String>,
    /// Read transform.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform_read: Option<String>,
    /// Sampling interval in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_interval: Option<u32>,
    /// Values of the extra attributes.
    #[serde(flatten)]
    pub attrs: IndexMap<&'static str, AttrValue, DefaultHashBuilder>,
    /// Extra attribute definitions.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub attrdefs: IndexMap<&'static str, AttrDefJson, DefaultHashBuilder>,
}

impl PortJson {
    /// Describes a port.
    ///
    /// `value` is the client-facing value, already passed through the read
    /// transform, or `None` when undefined.
    #[must_use]
    pub fn new(port: &Port, value: Option<f64>) -> Self {
        let data = &port.data;
        let source = |expression: &Option<crate::expr::Expression>| {
            expression.as_ref().map(|e| String::from(e.source()))
        };

        let value = value.map(|value| match data.port_type() {
            PortType::Boolean => PortValue::Boolean(value != 0.),
            PortType::Number => PortValue::Number(value),
        });

        let attrdefs = port
            .driver
            .attrdefs()
            .iter()
            .map(|def| (def.name, AttrDefJson::from(def)))
            .collect();

        Self {
            id: data.id.clone(),
            display_name: data.display_name.clone().unwrap_or_else(|| data.id.clone()),
            port_type: data.port_type(),
            unit: data.unit.clone(),
            min: data.min,
            max: data.max,
            step: data.step,
            integer: data.flags.contains(PortFlags::INTEGER).then_some(true),
            choices: (!data.choices.is_empty())
                .then(|| data.choices.iter().map(ChoiceJson::from).collect()),
            value,
            enabled: data.is_enabled(),
            writable: data.is_writable(),
            persisted: data.is_persisted(),
            expression: source(&data.expression),
            transform_write: source(&data.transform_write),
            transform_read: source(&data.transform_read),
            sampling_interval: (data.sampling.default > 0).then_some(data.sampling.interval),
            attrs: data.attrs.clone(),
            attrdefs,
        }
    }
}
