use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::attrdef::{AttrDef, AttrKind, AttrStorage, AttrValue};
use crate::config::{ConfigImage, ConfigStore, PeripheralRecord, PortRecord};
use crate::deps::Propagation;
use crate::error::{Error, ErrorKind, Result};
use crate::expr::Expression;
use crate::json::PortJson;
use crate::peripheral::{MAX_PERIPHERALS, ParamBlock, Peripheral, PeripheralConfig, PeripheralTypes};
use crate::port::{ChangeReason, Port, PortFlags, PortType, SlotCategory, is_undefined};
use crate::registry::{Ports, is_valid_id};
use crate::sequence::{Sequence, SequenceEvent};
use crate::settings::Settings;
use crate::system::{EventSink, NoSystem, System};
use crate::virtual_port::virtual_port;

fn attr_type_error(name: &str) -> Error {
    Error::new(
        ErrorKind::InvalidAttributeValue,
        format!("attribute `{name}`: wrong value type"),
    )
}

fn parse_optional(source: &str) -> Result<Option<Expression>> {
    if source.is_empty() {
        Ok(None)
    } else {
        Expression::parse(source).map(Some)
    }
}

/// A device: the single owner of ports, peripherals and their
/// configuration.
///
/// All operations run to completion on the caller's thread. Time is never
/// read from a clock: callers pass the milliseconds elapsed since boot.
pub struct Device {
    settings: Settings,
    ports: Ports,
    peripherals: [Option<Peripheral>; MAX_PERIPHERALS],
    types: PeripheralTypes,
    store: Option<Box<dyn ConfigStore>>,
    sink: Option<Box<dyn EventSink>>,
    system: Box<dyn System>,
    save_due: Option<u64>,
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("settings", &self.settings)
            .field("ports", &self.ports)
            .field("peripherals", &self.peripherals)
            .field("types", &self.types)
            .field("save_due", &self.save_due)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Creates an empty [`Device`].
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            ports: Ports::new(),
            peripherals: core::array::from_fn(|_| None),
            types: PeripheralTypes::new(),
            store: None,
            sink: None,
            system: Box::new(NoSystem),
            save_due: None,
        }
    }

    /// Sets the known peripheral types.
    #[must_use]
    pub fn peripheral_types(mut self, types: PeripheralTypes) -> Self {
        self.types = types;
        self
    }

    /// Sets the configuration store.
    #[must_use]
    pub fn config_store(mut self, store: impl ConfigStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Sets the receiver of value changes.
    #[must_use]
    pub fn event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Sets the system hooks.
    #[must_use]
    pub fn system(mut self, system: impl System + 'static) -> Self {
        self.system = Box::new(system);
        self
    }

    /// Returns the settings.
    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns the registered ports.
    #[must_use]
    pub const fn ports(&self) -> &Ports {
        &self.ports
    }

    /// Finds a port by identifier.
    #[must_use]
    pub fn port(&self, id: &str) -> Option<&Port> {
        self.ports.find_by_id(id)
    }

    /// Returns the peripheral at an index.
    #[must_use]
    pub fn peripheral(&self, index: u8) -> Option<&Peripheral> {
        self.peripherals.get(usize::from(index))?.as_ref()
    }

    fn set_value(
        &mut self,
        index: usize,
        value: f64,
        reason: ChangeReason,
        now_ms: u64,
    ) -> Result<bool> {
        let mut propagation = Propagation {
            sink: &mut self.sink,
            max_depth: self.settings.max_propagation_depth,
            now_ms,
            persisted_changed: false,
        };
        let result = self.ports.set_value(index, value, reason, &mut propagation);

        if propagation.persisted_changed && self.save_due.is_none() {
            self.save_due = Some(now_ms + u64::from(self.settings.save_delay_ms));
        }

        result
    }

    // Recomputes the value of a port from its expression.
    fn recompute(&mut self, index: usize, now_ms: u64) {
        let data = &self.ports.ports[index].data;
        let Some(expression) = data.expression.as_ref().filter(|_| data.is_enabled()) else {
            return;
        };

        let value = data.coerce(self.ports.eval(expression, f64::NAN, now_ms));
        if is_undefined(value) {
            return;
        }

        if let Err(e) = self.set_value(index, value, ChangeReason::Expression, now_ms) {
            log::warn!("{e}");
        }
    }

    /// Registers a port defined by the firmware and enables its hardware.
    ///
    /// # Errors
    ///
    /// Fails as [`Ports::register`] does.
    pub fn add_port(&mut self, port: Port) -> Result<u8> {
        let id = port.data.id.clone();
        let slot = self.ports.register(port)?;
        self.activate_port(&id);
        Ok(slot)
    }

    /// Registers a virtual port and saves the configuration.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::NoFreeSlot`] if the port is not in the virtual
    ///   category or no virtual slot is left
    /// - the errors of [`Ports::register`] and [`Self::save`]
    pub fn add_virtual_port(&mut self, port: Port) -> Result<u8> {
        if port.data.category != SlotCategory::Virtual {
            return Err(Error::new(
                ErrorKind::NoFreeSlot,
                format!("port `{}` is not a virtual port", port.data.id),
            ));
        }

        let slot = self.add_port(port)?;
        self.save()?;
        Ok(slot)
    }

    /// Unregisters a port and saves the configuration.
    ///
    /// A port produced by a peripheral comes back when the peripheral is
    /// rebuilt.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnknownPort`] if no port has the identifier,
    /// or as [`Self::save`] does.
    pub fn remove_port(&mut self, id: &str) -> Result<()> {
        self.drop_port(id)?;
        self.save()
    }

    fn drop_port(&mut self, id: &str) -> Result<()> {
        let index = self.ports.require(id)?;
        let port = &mut self.ports.ports[index];
        if port.data.is_enabled() {
            port.driver.configure(&port.data, false);
        }
        drop(self.ports.unregister(id)?);
        Ok(())
    }

    // Loads the attribute cache and enables the hardware of a freshly
    // registered port.
    fn activate_port(&mut self, id: &str) {
        let Some(index) = self.ports.position(id) else {
            return;
        };

        for def in self.ports.ports[index].driver.attrdefs() {
            match self.read_attr(index, def) {
                Ok(value) => {
                    let _ = self.ports.ports[index].data.attrs.insert(def.name, value);
                }
                Err(e) => log::warn!("{e}"),
            }
        }

        let port = &mut self.ports.ports[index];
        if port.data.is_enabled() {
            port.driver.configure(&port.data, true);
        }
    }

    /// Writes a value on behalf of a client.
    ///
    /// The value is checked against the port constraints, passed through the
    /// write transform, then written to the hardware.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::UnknownPort`], [`ErrorKind::NotEnabled`] or
    ///   [`ErrorKind::NotWritable`]
    /// - the constraint errors of [`PortData::check_value`](crate::PortData::check_value)
    /// - [`ErrorKind::WriteFailed`] if the transformed value is undefined or
    ///   the hardware rejected it; the stored value is then unchanged
    pub fn write_port_value(&mut self, id: &str, value: f64, now_ms: u64) -> Result<()> {
        let index = self.ports.require(id)?;
        let data = &self.ports.ports[index].data;

        if !data.is_enabled() {
            return Err(Error::new(
                ErrorKind::NotEnabled,
                format!("port `{id}` is disabled"),
            ));
        }

        if !data.is_writable() {
            return Err(Error::new(
                ErrorKind::NotWritable,
                format!("port `{id}` is read-only"),
            ));
        }

        data.check_value(value)?;

        let value = match &data.transform_write {
            Some(transform) => self.ports.eval(transform, value, now_ms),
            None => value,
        };
        if is_undefined(value) {
            return Err(Error::new(
                ErrorKind::WriteFailed,
                format!("write transform of port `{id}` is undefined"),
            ));
        }

        self.set_value(index, value, ChangeReason::Api, now_ms)
            .map(|_| ())
    }

    /// Reads a value on behalf of a client.
    ///
    /// Returns `None` when the port is disabled or its value is undefined.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnknownPort`] if no port has the identifier.
    pub fn read_port_value(&self, id: &str, now_ms: u64) -> Result<Option<f64>> {
        let index = self.ports.require(id)?;
        let data = &self.ports.ports[index].data;

        let value = data.visible_value();
        let value = match &data.transform_read {
            Some(transform) if !is_undefined(value) => self.ports.eval(transform, value, now_ms),
            _ => value,
        };

        Ok((!is_undefined(value)).then_some(value))
    }

    /// Describes a port for clients.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnknownPort`] if no port has the identifier.
    pub fn port_to_json(&self, id: &str, now_ms: u64) -> Result<PortJson> {
        let value = self.read_port_value(id, now_ms)?;
        let index = self.ports.require(id)?;
        Ok(PortJson::new(&self.ports.ports[index], value))
    }

    /// Describes every port that is not internal.
    #[must_use]
    pub fn device_to_json(&self, now_ms: u64) -> Vec<PortJson> {
        self.ports
            .iter()
            .filter(|port| !port.data.flags.contains(PortFlags::INTERNAL))
            .filter_map(|port| self.port_to_json(&port.data.id, now_ms).ok())
            .collect()
    }

    fn find_attrdef(&self, index: usize, name: &str) -> Result<&'static AttrDef> {
        let port = &self.ports.ports[index];
        port.driver
            .attrdefs()
            .iter()
            .find(|def| def.name == name)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::UnknownAttribute,
                    format!("port `{}` has no attribute `{name}`", port.data.id),
                )
            })
    }

    fn params_of(&self, index: usize) -> Result<(u8, ParamBlock)> {
        let data = &self.ports.ports[index].data;
        data.peripheral
            .and_then(|p| Some((p, self.peripheral(p)?.config.params)))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::UnknownPeripheral,
                    format!("port `{}` has no peripheral", data.id),
                )
            })
    }

    // Reads an attribute from its persisted location.
    fn read_attr(&self, index: usize, def: &AttrDef) -> Result<AttrValue> {
        let port = &self.ports.ports[index];

        let number = match def.storage {
            AttrStorage::Extra(field) => field.read(&port.data.extra).unwrap_or(0.),
            AttrStorage::Param(field) => self.params_of(index)?.1.get(field),
            AttrStorage::Flag(flag) => f64::from(u8::from(port.data.flags.contains(flag))),
            AttrStorage::Custom => {
                return port.driver.get_attr(&port.data, def.name).ok_or_else(|| {
                    Error::new(
                        ErrorKind::UnknownAttribute,
                        format!("port `{}`: no value for `{}`", port.data.id, def.name),
                    )
                });
            }
        };

        match def.kind {
            AttrKind::Boolean => Ok(AttrValue::Bool(number != 0.)),
            AttrKind::Number => Ok(AttrValue::Number(number)),
            AttrKind::String => Err(attr_type_error(def.name)),
        }
    }

    fn standard_attr(&self, index: usize, name: &str) -> Option<AttrValue> {
        let data = &self.ports.ports[index].data;
        let text = |value: Option<&str>| AttrValue::Str(value.unwrap_or_default().to_string());
        let source = |expression: &Option<Expression>| text(expression.as_ref().map(Expression::source));
        let number = |value: Option<f64>| AttrValue::Number(value.unwrap_or(f64::NAN));

        Some(match name {
            "id" => text(Some(data.id.as_str())),
            "display_name" => text(data.display_name.as_deref()),
            "unit" => text(data.unit.as_deref()),
            "enabled" => AttrValue::Bool(data.is_enabled()),
            "persisted" => AttrValue::Bool(data.is_persisted()),
            "expression" => source(&data.expression),
            "transform_write" => source(&data.transform_write),
            "transform_read" => source(&data.transform_read),
            "sampling_interval" => AttrValue::Number(f64::from(data.sampling.interval)),
            "min" => number(data.min),
            "max" => number(data.max),
            "step" => number(data.step),
            _ => return None,
        })
    }

    /// Returns an attribute value.
    ///
    /// Extra attributes are re-read from their persisted location, and the
    /// attribute cache is refreshed with the result.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnknownPort`] or
    /// [`ErrorKind::UnknownAttribute`].
    pub fn get_port_attr(&mut self, id: &str, name: &str) -> Result<AttrValue> {
        let index = self.ports.require(id)?;
        if let Some(value) = self.standard_attr(index, name) {
            return Ok(value);
        }

        let def = self.find_attrdef(index, name)?;
        let value = self.read_attr(index, def)?;
        let _ = self.ports.ports[index]
            .data
            .attrs
            .insert(def.name, value.clone());
        Ok(value)
    }

    /// Sets an attribute value and saves the configuration.
    ///
    /// The value is validated before anything is modified. Attributes stored
    /// in the parameter block rebuild the whole peripheral, other attributes
    /// marked as `reconnect` reconfigure the port hardware.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::UnknownPort`] or [`ErrorKind::UnknownAttribute`]
    /// - [`ErrorKind::AttributeNotModifiable`] for read-only attributes
    /// - [`ErrorKind::InvalidAttributeValue`], [`ErrorKind::ParamOverflow`]
    ///   and the expression errors for rejected values
    /// - the errors of [`Self::save`]
    pub fn set_port_attr(&mut self, id: &str, name: &str, value: AttrValue, now_ms: u64) -> Result<()> {
        let index = self.ports.require(id)?;

        if !self.set_standard_attr(index, name, &value, now_ms)? {
            self.set_extra_attr(index, name, value)?;
        }

        self.save()
    }

    fn set_standard_attr(
        &mut self,
        index: usize,
        name: &str,
        value: &AttrValue,
        now_ms: u64,
    ) -> Result<bool> {
        let text = || match value.as_str() {
            Some(text) if text.contains('\0') => Err(Error::new(
                ErrorKind::InvalidAttributeValue,
                format!("attribute `{name}` contains a NUL character"),
            )),
            Some(text) => Ok(text),
            None => Err(attr_type_error(name)),
        };
        let flag = || match value {
            AttrValue::Bool(value) => Ok(*value),
            _ => Err(attr_type_error(name)),
        };
        let number = || match value {
            AttrValue::Number(value) if value.is_finite() => Ok(*value),
            _ => Err(attr_type_error(name)),
        };
        let optional_text = |text: &str| (!text.is_empty()).then(|| text.to_string());

        match name {
            "id" => self.rename_port(index, text()?)?,
            "display_name" => {
                self.ports.ports[index].data.display_name = optional_text(text()?);
            }
            "unit" => self.ports.ports[index].data.unit = optional_text(text()?),
            "enabled" => self.set_enabled(index, flag()?, now_ms),
            "persisted" => {
                let persisted = flag()?;
                self.ports.ports[index]
                    .data
                    .flags
                    .set(PortFlags::PERSISTED, persisted);
            }
            "expression" => self.set_expression(index, text()?, now_ms)?,
            "transform_write" => {
                self.ports.ports[index].data.transform_write = parse_optional(text()?)?;
            }
            "transform_read" => {
                self.ports.ports[index].data.transform_read = parse_optional(text()?)?;
            }
            "sampling_interval" => {
                let interval = number()?;
                let sampling = &mut self.ports.ports[index].data.sampling;
                if sampling.default == 0 {
                    return Err(Error::new(
                        ErrorKind::AttributeNotModifiable,
                        "port is not sampled",
                    ));
                }
                if interval < f64::from(sampling.min) || interval > f64::from(sampling.max) {
                    return Err(Error::new(
                        ErrorKind::InvalidAttributeValue,
                        format!(
                            "sampling interval {interval} outside of {}..={}",
                            sampling.min, sampling.max
                        ),
                    ));
                }
                sampling.interval = interval as u32;
            }
            "min" | "max" | "step" => {
                let value = number()?;
                let data = &mut self.ports.ports[index].data;
                if data.category != SlotCategory::Virtual || data.port_type() != PortType::Number {
                    return Err(Error::new(
                        ErrorKind::AttributeNotModifiable,
                        format!("`{name}` of port `{}` is fixed by its driver", data.id),
                    ));
                }
                let (min, max) = match name {
                    "min" => (Some(value), data.max),
                    "max" => (data.min, Some(value)),
                    _ => (data.min, data.max),
                };
                if let (Some(min), Some(max)) = (min, max)
                    && min > max
                {
                    return Err(Error::new(
                        ErrorKind::InvalidAttributeValue,
                        format!("port `{}`: min {min} above max {max}", data.id),
                    ));
                }
                match name {
                    "min" => data.min = min,
                    "max" => data.max = max,
                    _ => data.step = Some(value).filter(|step| *step > 0.),
                }
            }
            _ => return Ok(false),
        }

        Ok(true)
    }

    fn rename_port(&mut self, index: usize, id: &str) -> Result<()> {
        if self.ports.ports[index].data.id == id {
            return Ok(());
        }

        if !is_valid_id(id) {
            return Err(Error::new(
                ErrorKind::InvalidAttributeValue,
                format!("invalid port id `{id}`"),
            ));
        }

        if self.ports.position(id).is_some() {
            return Err(Error::new(
                ErrorKind::DuplicateId,
                format!("port id `{id}` already in use"),
            ));
        }

        let old = core::mem::replace(&mut self.ports.ports[index].data.id, id.to_string());

        // The new id may be read by other expressions, including the port's own.
        let checked = self.ports.iter().try_for_each(|port| match &port.data.expression {
            Some(expression) => self.ports.check_expression(&port.data.id, expression),
            None => Ok(()),
        });
        if let Err(e) = checked {
            self.ports.ports[index].data.id = old;
            return Err(e);
        }

        self.ports.rebuild_change_dep_masks();
        Ok(())
    }

    fn set_enabled(&mut self, index: usize, enabled: bool, now_ms: u64) {
        let port = &mut self.ports.ports[index];
        if port.data.is_enabled() == enabled {
            return;
        }

        port.data.flags.set(PortFlags::ENABLED, enabled);
        if !enabled {
            port.sequence = None;
        }
        port.driver.configure(&port.data, enabled);
        log::info!(
            "Port `{}` {}",
            port.data.id,
            if enabled { "enabled" } else { "disabled" }
        );

        if enabled {
            self.recompute(index, now_ms);
        }
    }

    fn set_expression(&mut self, index: usize, source: &str, now_ms: u64) -> Result<()> {
        let expression = parse_optional(source)?;
        if let Some(expression) = &expression {
            self.ports
                .check_expression(&self.ports.ports[index].data.id, expression)?;
        }

        self.ports.ports[index].data.expression = expression;
        self.ports.rebuild_change_dep_masks();
        self.recompute(index, now_ms);
        Ok(())
    }

    fn set_extra_attr(&mut self, index: usize, name: &str, value: AttrValue) -> Result<()> {
        let def = self.find_attrdef(index, name)?;
        if !def.modifiable {
            return Err(Error::new(
                ErrorKind::AttributeNotModifiable,
                format!("attribute `{name}` is read-only"),
            ));
        }

        let value = def.validate(value)?;
        let number = value.as_number().unwrap_or_default();

        match def.storage {
            AttrStorage::Extra(field) => {
                field.write(&mut self.ports.ports[index].data.extra, number)?;
            }
            AttrStorage::Flag(flag) => {
                self.ports.ports[index].data.flags.set(flag, number != 0.);
            }
            AttrStorage::Custom => {
                let Port { data, driver, .. } = &mut self.ports.ports[index];
                driver.set_attr(data, def.name, &value)?;
            }
            AttrStorage::Param(field) => {
                let (peripheral, mut params) = self.params_of(index)?;
                params.set(field, number)?;
                return self.reconfigure_peripheral(peripheral, params);
            }
        }

        // The storage may have narrowed the value.
        let stored = self.read_attr(index, def).unwrap_or(value);
        let port = &mut self.ports.ports[index];
        let _ = port.data.attrs.insert(def.name, stored);

        if def.reconnect && port.data.is_enabled() {
            port.driver.configure(&port.data, false);
            port.driver.configure(&port.data, true);
        }

        Ok(())
    }

    /// Starts a sequence on a port, replacing any running one.
    ///
    /// The first value is written at once.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::UnknownPort`], [`ErrorKind::NotEnabled`] or
    ///   [`ErrorKind::NotWritable`]
    /// - the constraint errors of a value
    /// - [`ErrorKind::InvalidSequence`] if the lists are malformed
    pub fn start_sequence(
        &mut self,
        id: &str,
        values: Vec<f64>,
        delays: Vec<u32>,
        repeat: u32,
        now_ms: u64,
    ) -> Result<()> {
        let index = self.ports.require(id)?;
        let data = &self.ports.ports[index].data;

        if !data.is_enabled() {
            return Err(Error::new(
                ErrorKind::NotEnabled,
                format!("port `{id}` is disabled"),
            ));
        }

        if !data.is_writable() {
            return Err(Error::new(
                ErrorKind::NotWritable,
                format!("port `{id}` is read-only"),
            ));
        }

        for value in &values {
            data.check_value(*value)?;
        }

        let sequence = Sequence::new(values, delays, repeat, now_ms)?;
        self.ports.ports[index].sequence = Some(sequence);
        log::debug!("Sequence started on port `{id}`");

        self.run_sequence(index, now_ms);
        Ok(())
    }

    /// Cancels the sequence of a port, if any.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnknownPort`] if no port has the identifier.
    pub fn cancel_sequence(&mut self, id: &str) -> Result<()> {
        let index = self.ports.require(id)?;
        if self.ports.ports[index].sequence.take().is_some() {
            log::debug!("Sequence cancelled on port `{id}`");
        }
        Ok(())
    }

    fn run_sequence(&mut self, index: usize, now_ms: u64) {
        let Some(mut sequence) = self.ports.ports[index].sequence.take() else {
            return;
        };

        while let Some(event) = sequence.poll(now_ms) {
            match event {
                SequenceEvent::Fire(value) => {
                    // A failed step does not stop the sequence.
                    if let Err(e) = self.set_value(index, value, ChangeReason::Sequence, now_ms) {
                        log::debug!("{e}");
                    }
                }
                SequenceEvent::Finished => {
                    log::debug!("Sequence finished on port `{}`", self.ports.ports[index].data.id);
                    return;
                }
            }
        }

        self.ports.ports[index].sequence = Some(sequence);
    }

    /// Runs every due heartbeat, sequence step and sampling poll, then the
    /// deferred save of changed persisted values.
    pub fn tick(&mut self, now_ms: u64) {
        for port in &mut self.ports.ports {
            let Port { data, driver, .. } = port;
            if data.is_enabled()
                && data.heart_beat_interval > 0
                && now_ms.saturating_sub(data.last_heart_beat) >= u64::from(data.heart_beat_interval)
            {
                driver.heart_beat(data, now_ms);
                data.last_heart_beat = now_ms;
            }
        }

        for index in 0..self.ports.len() {
            self.run_sequence(index, now_ms);
        }

        for index in 0..self.ports.len() {
            let Port { data, driver, .. } = &mut self.ports.ports[index];
            if !data.is_enabled()
                || data.expression.is_some()
                || data.sampling.interval == 0
                || now_ms.saturating_sub(data.sampling.last) < u64::from(data.sampling.interval)
            {
                continue;
            }

            data.sampling.last = now_ms;
            let value = driver.read_value(data, now_ms);
            if let Err(e) = self.set_value(index, value, ChangeReason::Native, now_ms) {
                log::debug!("{e}");
            }
        }

        // Clock-driven expressions change without any port changing.
        for index in 0..self.ports.len() {
            let data = &self.ports.ports[index].data;
            if data.expression.as_ref().is_some_and(Expression::uses_time) {
                self.recompute(index, now_ms);
            }
        }

        if self.save_due.is_some_and(|due| now_ms >= due) {
            if let Err(e) = self.save() {
                log::error!("Configuration not saved: {e}");
            }
        }
    }

    /// Adds a peripheral, registers its ports and saves the configuration.
    ///
    /// Returns the index of the peripheral. On failure the peripheral and
    /// any of its ports are discarded.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::TooManyPeripherals`] if every index is used
    /// - [`ErrorKind::UnknownPeripheralType`] if no driver handles the type
    /// - the errors of the driver and of [`Ports::register`]
    pub fn add_peripheral(&mut self, mut config: PeripheralConfig) -> Result<u8> {
        let index = self
            .peripherals
            .iter()
            .position(Option::is_none)
            .and_then(|index| u8::try_from(index).ok())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::TooManyPeripherals,
                    format!("all {MAX_PERIPHERALS} peripherals are in use"),
                )
            })?;

        config.index = index;
        let driver = self.types.create(&config)?;
        self.peripherals[usize::from(index)] = Some(Peripheral { config, driver });

        if let Err(e) = self.start_peripheral(index, &[]) {
            self.peripherals[usize::from(index)] = None;
            return Err(e);
        }

        self.save()?;
        Ok(index)
    }

    /// Removes a peripheral and its ports, then saves the configuration.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnknownPeripheral`] if no peripheral has the
    /// index, or as [`Self::save`] does.
    pub fn remove_peripheral(&mut self, index: u8) -> Result<()> {
        self.stop_peripheral(index)?;
        self.peripherals[usize::from(index)] = None;
        log::info!("Peripheral {index} removed");
        self.save()
    }

    /// Replaces the parameters of a peripheral, rebuilds it and saves the
    /// configuration.
    ///
    /// The ports keep their slots and user settings.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnknownPeripheral`], with the errors of the
    /// driver, or as [`Self::save`] does.
    pub fn set_peripheral_params(&mut self, index: u8, params: ParamBlock) -> Result<()> {
        self.reconfigure_peripheral(index, params)?;
        self.save()
    }

    /// Restarts a peripheral: its ports are dropped, the driver goes through
    /// `cleanup` and `init`, and the new ports take the slots and user
    /// settings of the old ones.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnknownPeripheral`] or with the errors of the
    /// driver. The peripheral is then kept without ports.
    pub fn rebuild_peripheral(&mut self, index: u8) -> Result<()> {
        let records = self.peripheral_records(index);
        self.stop_peripheral(index)?;
        self.start_peripheral(index, &records)
    }

    // Rebuilds a peripheral with new parameters. If the driver rejects
    // them, the previous parameters and ports are restored.
    fn reconfigure_peripheral(&mut self, index: u8, params: ParamBlock) -> Result<()> {
        let old = self
            .peripheral(index)
            .map(|peripheral| peripheral.config.params)
            .ok_or_else(|| unknown_peripheral(index))?;
        let records = self.peripheral_records(index);

        self.stop_peripheral(index)?;
        self.store_params(index, params);
        let Err(e) = self.start_peripheral(index, &records) else {
            return Ok(());
        };

        log::warn!("Peripheral {index}: parameters rejected, previous ones restored");
        self.store_params(index, old);
        if let Err(restart) = self.start_peripheral(index, &records) {
            log::error!("Peripheral {index} not restarted: {restart}");
        }
        Err(e)
    }

    fn store_params(&mut self, index: u8, params: ParamBlock) {
        if let Some(peripheral) = self.peripherals[usize::from(index)].as_mut() {
            peripheral.config.params = params;
        }
    }

    fn peripheral_records(&self, index: u8) -> Vec<(u8, PortRecord)> {
        self.ports
            .iter()
            .filter(|port| port.data.peripheral == Some(index))
            .filter_map(|port| Some((port.data.slot?, PortRecord::from_port(&port.data))))
            .collect()
    }

    fn stop_peripheral(&mut self, index: u8) -> Result<()> {
        if self.peripheral(index).is_none() {
            return Err(unknown_peripheral(index));
        }

        let owned: Vec<String> = self
            .ports
            .iter()
            .filter(|port| port.data.peripheral == Some(index))
            .map(|port| port.data.id.clone())
            .collect();
        for id in owned {
            self.drop_port(&id)?;
        }

        if let Some(peripheral) = self.peripherals[usize::from(index)].as_mut() {
            peripheral.driver.cleanup();
        }
        Ok(())
    }

    // Initializes a placed peripheral and registers its ports, restoring
    // the matching records. Every port is rolled back on failure.
    fn start_peripheral(&mut self, index: u8, records: &[(u8, PortRecord)]) -> Result<()> {
        let peripheral = self
            .peripherals
            .get_mut(usize::from(index))
            .and_then(Option::as_mut)
            .ok_or_else(|| unknown_peripheral(index))?;
        let config = peripheral.config;

        peripheral.driver.init(&config)?;
        let ports = match peripheral.driver.make_ports(&config) {
            Ok(ports) => ports,
            Err(e) => {
                peripheral.driver.cleanup();
                return Err(e);
            }
        };

        let mut registered: Vec<String> = Vec::new();
        for (ordinal, mut port) in (0u8..).zip(ports) {
            port.data.peripheral = Some(index);
            port.data.ordinal = ordinal;

            if let Some((slot, record)) = records
                .iter()
                .find(|(_, record)| record.owner == Some(index) && record.ordinal == ordinal)
            {
                if self.ports.find_by_slot(*slot).is_none() {
                    port.data.slot = Some(*slot);
                }
                record.apply(&mut port.data, false);
            }

            let id = port.data.id.clone();
            if let Err(e) = self.ports.register(port) {
                for id in &registered {
                    drop(self.ports.unregister(id));
                }
                peripheral.driver.cleanup();
                log::warn!("Peripheral {index} discarded: {e}");
                return Err(e);
            }
            registered.push(id);
        }

        for id in &registered {
            self.activate_port(id);
        }

        log::info!(
            "Peripheral {index} (type {}) started with {} ports",
            config.type_id,
            registered.len()
        );
        Ok(())
    }

    /// Captures the whole configuration.
    #[must_use]
    pub fn config_image(&self) -> ConfigImage {
        let mut image = ConfigImage::new();

        for (record, peripheral) in image.peripherals.iter_mut().zip(&self.peripherals) {
            *record = peripheral.as_ref().map(|peripheral| PeripheralRecord {
                type_id: peripheral.config.type_id,
                flags: peripheral.config.flags,
                params: peripheral.config.params,
            });
        }

        for port in self.ports.iter() {
            if let Some(slot) = port.data.slot {
                image.ports[usize::from(slot)] = Some(PortRecord::from_port(&port.data));
            }
        }

        image
    }

    /// Saves the configuration, if a store is attached.
    ///
    /// # Errors
    ///
    /// Fails with the errors of the store, or with
    /// [`ErrorKind::InvalidConfig`] if a string cannot be stored.
    pub fn save(&mut self) -> Result<()> {
        self.save_due = None;
        if self.store.is_none() {
            return Ok(());
        }

        let image = self.config_image().encode()?;
        if let Some(store) = self.store.as_mut() {
            store.save(&image)?;
        }

        log::info!("Configuration saved ({} bytes)", image.len());
        self.system.on_config_saved();
        Ok(())
    }

    /// Restores the configuration from the store, if any.
    ///
    /// Firmware ports must be added beforehand: their records are matched
    /// by slot. Peripherals are rebuilt from their records, and virtual
    /// ports are recreated. Peripherals of unknown types and invalid
    /// expressions are dropped with a warning.
    ///
    /// # Errors
    ///
    /// Fails with the errors of the store, or with
    /// [`ErrorKind::InvalidConfig`] for a malformed image.
    pub fn load(&mut self, now_ms: u64) -> Result<()> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        let Some(bytes) = store.load()? else {
            log::info!("No stored configuration");
            return Ok(());
        };

        let image = ConfigImage::decode(&bytes)?;
        let records: Vec<(u8, PortRecord)> = (0u8..)
            .zip(image.ports)
            .filter_map(|(slot, record)| Some((slot, record?)))
            .collect();

        for port in &mut self.ports.ports {
            if let Some((_, record)) = records
                .iter()
                .find(|(slot, record)| Some(*slot) == port.data.slot && record.owner.is_none())
            {
                record.apply(&mut port.data, false);
            }
        }

        for (index, record) in (0u8..).zip(image.peripherals) {
            let Some(record) = record else {
                continue;
            };

            let config = PeripheralConfig {
                index,
                type_id: record.type_id,
                flags: record.flags,
                params: record.params,
            };

            match self.types.create(&config) {
                Ok(driver) => {
                    self.peripherals[usize::from(index)] = Some(Peripheral { config, driver });
                    if let Err(e) = self.start_peripheral(index, &records) {
                        log::error!("Peripheral {index} not started: {e}");
                    }
                }
                Err(e) => log::warn!("Peripheral {index} dropped: {e}"),
            }
        }

        for (slot, record) in &records {
            if record.owner.is_some()
                || SlotCategory::of_slot(*slot) != SlotCategory::Virtual
                || self.ports.find_by_slot(*slot).is_some()
            {
                continue;
            }

            let port_type = if record.flags.contains(PortFlags::NUMBER) {
                PortType::Number
            } else {
                PortType::Boolean
            };
            let mut port = virtual_port(record.id.clone(), port_type).slot(*slot);
            record.apply(&mut port.data, true);

            if let Err(e) = self.ports.register(port) {
                log::warn!("Virtual port `{}` dropped: {e}", record.id);
            }
        }

        self.validate_expressions();

        for index in 0..self.ports.len() {
            self.recompute(index, now_ms);
        }
        self.save_due = None;

        log::info!(
            "Configuration loaded: {} peripherals, {} ports",
            self.peripherals.iter().flatten().count(),
            self.ports.len()
        );
        Ok(())
    }

    // Drops stored expressions that would create a self-dependency or a
    // cycle.
    fn validate_expressions(&mut self) {
        for index in 0..self.ports.len() {
            let Some(expression) = self.ports.ports[index].data.expression.take() else {
                continue;
            };

            let id = &self.ports.ports[index].data.id;
            match self.ports.check_expression(id, &expression) {
                Ok(()) => self.ports.ports[index].data.expression = Some(expression),
                Err(e) => log::warn!("Expression `{expression}` dropped: {e}"),
            }
        }

        self.ports.rebuild_change_dep_masks();
    }

    /// Restarts the device.
    pub fn reset(&mut self) {
        self.system.reset(false);
    }

    /// Erases the stored configuration and restarts the device.
    ///
    /// # Errors
    ///
    /// Fails with the errors of the store, the device is then not
    /// restarted.
    pub fn factory_reset(&mut self) -> Result<()> {
        if let Some(store) = self.store.as_mut() {
            store.erase()?;
        }
        log::info!("Factory reset");
        self.system.reset(true);
        Ok(())
    }
}

fn unknown_peripheral(index: u8) -> Error {
    Error::new(
        ErrorKind::UnknownPeripheral,
        format!("no peripheral at index {index}"),
    )
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use alloc::string::{String, ToString};
    use alloc::vec;
    use alloc::vec::Vec;

    use core::cell::RefCell;

    use crate::attrdef::{AttrDef, AttrStorage, AttrValue};
    use crate::config::{ConfigImage, RamStore};
    use crate::error::{Error, ErrorKind, Result};
    use crate::layout::{Field, Width};
    use crate::peripheral::{ParamBlock, PeripheralConfig, PeripheralDriver, PeripheralTypes};
    use crate::port::{ChangeReason, Port, PortData, PortDriver, PortFlags, PortType, SlotCategory};
    use crate::settings::Settings;
    use crate::system::{EventSink, System};
    use crate::virtual_port::virtual_port;

    use super::Device;

    const METER: u16 = 6;
    const EMPTY: u16 = 9;
    const GAIN: Field = Field::new(0, Width::U8);

    #[derive(Default)]
    struct State {
        power: f64,
        reject: bool,
        writes: Vec<f64>,
        beats: u32,
        inits: u32,
        cleanups: u32,
        label: String,
    }

    type Shared = Rc<RefCell<State>>;

    struct Power(Shared);

    impl PortDriver for Power {
        fn read_value(&mut self, _port: &PortData, _now_ms: u64) -> f64 {
            self.0.borrow().power
        }

        fn attrdefs(&self) -> &'static [AttrDef] {
            const ATTRDEFS: &[AttrDef] = &[
                AttrDef::number("gain", AttrStorage::Param(GAIN))
                    .integer()
                    .max(100.)
                    .reconnect(),
                AttrDef::number("offset", AttrStorage::Extra(Field::new(0, Width::I16)))
                    .min(-100.)
                    .max(100.)
                    .step(5.),
                AttrDef::boolean("inverted", AttrStorage::Flag(PortFlags::CUSTOM0)),
                AttrDef::number("threshold", AttrStorage::Extra(Field::new(2, Width::U16))),
                AttrDef::string("label"),
            ];
            ATTRDEFS
        }

        fn get_attr(&self, _port: &PortData, name: &str) -> Option<AttrValue> {
            (name == "label").then(|| AttrValue::Str(self.0.borrow().label.clone()))
        }

        fn set_attr(&mut self, _port: &mut PortData, _name: &str, value: &AttrValue) -> Result<()> {
            self.0.borrow_mut().label = value.as_str().unwrap_or_default().to_string();
            Ok(())
        }
    }

    struct Relay(Shared);

    impl PortDriver for Relay {
        fn read_value(&mut self, port: &PortData, _now_ms: u64) -> f64 {
            port.value
        }

        fn write_value(&mut self, _port: &PortData, value: f64, _now_ms: u64) -> bool {
            let mut state = self.0.borrow_mut();
            if state.reject {
                return false;
            }
            state.writes.push(value);
            true
        }

        fn heart_beat(&mut self, _port: &PortData, _now_ms: u64) {
            self.0.borrow_mut().beats += 1;
        }
    }

    struct Meter(Shared);

    impl PeripheralDriver for Meter {
        fn init(&mut self, config: &PeripheralConfig) -> Result<()> {
            self.0.borrow_mut().inits += 1;
            if config.params.get(GAIN) > 50. {
                return Err(Error::new(ErrorKind::InvalidAttributeValue, "gain too high"));
            }
            Ok(())
        }

        fn make_ports(&mut self, _config: &PeripheralConfig) -> Result<Vec<Port>> {
            Ok(vec![
                Port::new("power", PortType::Number, Power(self.0.clone()))
                    .category(SlotCategory::Peripheral)
                    .unit("W")
                    .sampling(1000, 100, 60_000),
                Port::new("relay", PortType::Boolean, Relay(self.0.clone()))
                    .category(SlotCategory::Peripheral)
                    .writable()
                    .persisted()
                    .heart_beat(500),
            ])
        }

        fn cleanup(&mut self) {
            self.0.borrow_mut().cleanups += 1;
        }
    }

    struct Empty;

    impl PeripheralDriver for Empty {
        fn init(&mut self, _config: &PeripheralConfig) -> Result<()> {
            Ok(())
        }

        fn make_ports(&mut self, _config: &PeripheralConfig) -> Result<Vec<Port>> {
            Ok(Vec::new())
        }
    }

    type Changes = Rc<RefCell<Vec<(String, f64, ChangeReason)>>>;

    struct Recorder(Changes);

    impl EventSink for Recorder {
        fn value_changed(&mut self, port: &PortData, reason: ChangeReason) {
            self.0.borrow_mut().push((port.id.clone(), port.value, reason));
        }
    }

    struct Resets(Rc<RefCell<Vec<bool>>>);

    impl System for Resets {
        fn reset(&mut self, factory: bool) {
            self.0.borrow_mut().push(factory);
        }
    }

    fn types(state: &Shared) -> PeripheralTypes {
        let state = state.clone();
        PeripheralTypes::new()
            .with(METER, "meter", move |_| Ok(Box::new(Meter(state.clone()))))
            .with(EMPTY, "empty", |_| Ok(Box::new(Empty)))
    }

    fn device(state: &Shared) -> Device {
        Device::new(Settings::new()).peripheral_types(types(state))
    }

    fn meter() -> PeripheralConfig {
        PeripheralConfig::new(METER, ParamBlock::new().with(GAIN, 1.).unwrap())
    }

    fn value(device: &Device, id: &str) -> f64 {
        device.port(id).unwrap().value()
    }

    #[test]
    fn test_write_validation() {
        let state = Shared::default();
        let mut device = device(&state);
        let _ = device.add_peripheral(meter()).unwrap();
        let _ = device
            .add_virtual_port(
                virtual_port("level", PortType::Number)
                    .min(0.)
                    .max(100.)
                    .step(5.),
            )
            .unwrap();

        device.write_port_value("level", 50., 0).unwrap();
        assert_eq!(device.read_port_value("level", 0).unwrap(), Some(50.));

        let kind = |result: crate::Result<()>| result.unwrap_err().kind;
        assert_eq!(kind(device.write_port_value("level", 150., 0)), ErrorKind::AboveMax);
        assert_eq!(kind(device.write_port_value("level", -5., 0)), ErrorKind::BelowMin);
        assert_eq!(kind(device.write_port_value("level", 52., 0)), ErrorKind::InvalidStep);
        assert_eq!(kind(device.write_port_value("relay", 2., 0)), ErrorKind::NotInChoices);
        assert_eq!(kind(device.write_port_value("power", 1., 0)), ErrorKind::NotWritable);
        assert_eq!(kind(device.write_port_value("nowhere", 1., 0)), ErrorKind::UnknownPort);
        assert_eq!(value(&device, "level"), 50.);

        device.write_port_value("relay", 1., 0).unwrap();
        assert_eq!(state.borrow().writes, [1.]);

        // A rejected write leaves the value untouched.
        state.borrow_mut().reject = true;
        assert_eq!(kind(device.write_port_value("relay", 0., 0)), ErrorKind::WriteFailed);
        assert_eq!(value(&device, "relay"), 1.);

        device
            .set_port_attr("level", "enabled", AttrValue::Bool(false), 0)
            .unwrap();
        assert_eq!(kind(device.write_port_value("level", 10., 0)), ErrorKind::NotEnabled);
        assert_eq!(device.read_port_value("level", 0).unwrap(), None);
    }

    #[test]
    fn test_transforms() {
        let mut device = Device::new(Settings::new());
        let _ = device
            .add_virtual_port(virtual_port("temperature", PortType::Number))
            .unwrap();

        device
            .set_port_attr("temperature", "transform_write", AttrValue::Str("MUL($, 10)".into()), 0)
            .unwrap();
        device
            .set_port_attr("temperature", "transform_read", AttrValue::Str("DIV($, 10)".into()), 0)
            .unwrap();

        device.write_port_value("temperature", 2.5, 0).unwrap();
        assert_eq!(value(&device, "temperature"), 25.);
        assert_eq!(device.read_port_value("temperature", 0).unwrap(), Some(2.5));

        let err = device
            .set_port_attr("temperature", "transform_read", AttrValue::Str("DIV($, ".into()), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidExpression);
    }

    #[test]
    fn test_expression_attribute() {
        let changes = Changes::default();
        let mut device = Device::new(Settings::new()).event_sink(Recorder(changes.clone()));
        let _ = device
            .add_virtual_port(virtual_port("a", PortType::Number))
            .unwrap();
        let _ = device
            .add_virtual_port(virtual_port("b", PortType::Number))
            .unwrap();

        device
            .set_port_attr("b", "expression", AttrValue::Str("ADD($a, 1)".into()), 0)
            .unwrap();
        device.write_port_value("a", 1., 0).unwrap();
        assert_eq!(value(&device, "b"), 2.);
        assert_eq!(
            changes.borrow().last().unwrap(),
            &("b".to_string(), 2., ChangeReason::Expression)
        );

        let err = device
            .set_port_attr("a", "expression", AttrValue::Str("ADD($b, 1)".into()), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CyclicDependency);

        let err = device
            .set_port_attr("b", "expression", AttrValue::Str("ADD($b, 1)".into()), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SelfDependency);

        device
            .set_port_attr("a", "id", AttrValue::Str("source".into()), 0)
            .unwrap();
        let err = device
            .set_port_attr("source", "id", AttrValue::Str("b".into()), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateId);

        // Clearing the expression stops the propagation.
        device
            .set_port_attr("b", "expression", AttrValue::Str(String::new()), 0)
            .unwrap();
        device.write_port_value("source", 5., 0).unwrap();
        assert_eq!(value(&device, "b"), 2.);

        // Renaming must not close a loop through a port that reads the new id.
        device
            .set_port_attr("source", "expression", AttrValue::Str("ADD($zz, 1)".into()), 0)
            .unwrap();
        device
            .set_port_attr("b", "expression", AttrValue::Str("ADD($source, 1)".into()), 0)
            .unwrap();
        let err = device
            .set_port_attr("b", "id", AttrValue::Str("zz".into()), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CyclicDependency);
        assert!(device.port("b").is_some());
        assert!(device.port("zz").is_none());

        // Nor make a port read itself.
        let _ = device
            .add_virtual_port(virtual_port("p", PortType::Number))
            .unwrap();
        device
            .set_port_attr("p", "expression", AttrValue::Str("ADD($q, 1)".into()), 0)
            .unwrap();
        let err = device
            .set_port_attr("p", "id", AttrValue::Str("q".into()), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SelfDependency);
        assert!(device.port("p").is_some());

        device
            .set_port_attr("p", "id", AttrValue::Str("r".into()), 0)
            .unwrap();
        assert_eq!(
            device.get_port_attr("r", "expression").unwrap(),
            AttrValue::Str("ADD($q, 1)".into())
        );
    }

    #[test]
    fn test_time_expression() {
        let mut device = Device::new(Settings::new());
        let _ = device
            .add_virtual_port(virtual_port("clock", PortType::Number))
            .unwrap();

        device
            .set_port_attr("clock", "expression", AttrValue::Str("TIME()".into()), 5000)
            .unwrap();
        assert_eq!(value(&device, "clock"), 5.);

        device.tick(6000);
        assert_eq!(value(&device, "clock"), 6.);
        device.tick(10_000);
        assert_eq!(value(&device, "clock"), 10.);
    }

    #[test]
    fn test_text_attributes() {
        let mut device = Device::new(Settings::new()).config_store(RamStore::new());
        let _ = device
            .add_virtual_port(virtual_port("level", PortType::Number))
            .unwrap();
        device
            .set_port_attr("level", "display_name", AttrValue::Str("Level".into()), 0)
            .unwrap();

        let err = device
            .set_port_attr("level", "display_name", AttrValue::Str("bad\0name".into()), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAttributeValue);
        let err = device
            .set_port_attr("level", "expression", AttrValue::Str("ADD(1,\0 2)".into()), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAttributeValue);
        assert_eq!(
            device.get_port_attr("level", "display_name").unwrap(),
            AttrValue::Str("Level".into())
        );

        // The configuration can still be saved.
        device
            .set_port_attr("level", "unit", AttrValue::Str("%".into()), 0)
            .unwrap();
        device.save().unwrap();
    }

    #[test]
    fn test_range_attributes() {
        let mut device = Device::new(Settings::new());
        let _ = device
            .add_virtual_port(virtual_port("level", PortType::Number))
            .unwrap();

        device
            .set_port_attr("level", "min", AttrValue::Number(0.), 0)
            .unwrap();
        device
            .set_port_attr("level", "max", AttrValue::Number(100.), 0)
            .unwrap();

        let err = device
            .set_port_attr("level", "min", AttrValue::Number(150.), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAttributeValue);
        let err = device
            .set_port_attr("level", "max", AttrValue::Number(-1.), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAttributeValue);

        assert_eq!(
            device.get_port_attr("level", "min").unwrap(),
            AttrValue::Number(0.)
        );
        assert_eq!(
            device.get_port_attr("level", "max").unwrap(),
            AttrValue::Number(100.)
        );

        // Equal bounds pin the value.
        device
            .set_port_attr("level", "min", AttrValue::Number(100.), 0)
            .unwrap();
        device.write_port_value("level", 100., 0).unwrap();
    }

    #[test]
    fn test_attribute_storage() {
        let state = Shared::default();
        let mut device = device(&state);
        let index = device.add_peripheral(meter()).unwrap();
        let slot = device.port("power").unwrap().slot_number();

        assert_eq!(
            device.get_port_attr("power", "unit").unwrap(),
            AttrValue::Str("W".into())
        );

        // Extra blob, quantized to the step.
        device
            .set_port_attr("power", "offset", AttrValue::Number(12.), 0)
            .unwrap();
        assert_eq!(
            device.get_port_attr("power", "offset").unwrap(),
            AttrValue::Number(10.)
        );
        let err = device
            .set_port_attr("power", "offset", AttrValue::Number(200.), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAttributeValue);

        // Flag.
        device
            .set_port_attr("power", "inverted", AttrValue::Bool(true), 0)
            .unwrap();
        assert!(device.port("power").unwrap().data().flags.contains(PortFlags::CUSTOM0));

        // Custom accessors.
        device
            .set_port_attr("power", "label", AttrValue::Str("mains".into()), 0)
            .unwrap();
        assert_eq!(
            device.get_port_attr("power", "label").unwrap(),
            AttrValue::Str("mains".into())
        );

        // Parameter block: the peripheral is rebuilt in place.
        assert_eq!(state.borrow().inits, 1);
        device
            .set_port_attr("power", "gain", AttrValue::Number(7.), 0)
            .unwrap();
        assert_eq!(state.borrow().inits, 2);
        assert_eq!(state.borrow().cleanups, 1);
        assert_eq!(device.peripheral(index).unwrap().config().params.get(GAIN), 7.);
        assert_eq!(
            device.get_port_attr("power", "gain").unwrap(),
            AttrValue::Number(7.)
        );

        // The rebuilt port keeps its slot and settings.
        assert_eq!(device.port("power").unwrap().slot_number(), slot);
        assert_eq!(
            device.get_port_attr("power", "offset").unwrap(),
            AttrValue::Number(10.)
        );
        assert_eq!(
            device.get_port_attr("power", "inverted").unwrap(),
            AttrValue::Bool(true)
        );

        let err = device
            .set_port_attr("power", "gain", AttrValue::Str("high".into()), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAttributeValue);
        let err = device.get_port_attr("power", "colour").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownAttribute);
        let err = device
            .set_port_attr("power", "min", AttrValue::Number(0.), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AttributeNotModifiable);
    }

    #[test]
    fn test_sequence() {
        let changes = Changes::default();
        let mut device = Device::new(Settings::new()).event_sink(Recorder(changes.clone()));
        let _ = device
            .add_virtual_port(virtual_port("out", PortType::Number))
            .unwrap();

        device
            .start_sequence("out", vec![1., 2., 3.], vec![100, 200, 300], 1, 0)
            .unwrap();
        assert_eq!(value(&device, "out"), 1.);

        let mut fired = Vec::new();
        for now in (10..=1500).step_by(10) {
            let before = changes.borrow().len();
            device.tick(now);
            if changes.borrow().len() > before {
                fired.push((now, value(&device, "out")));
            }
        }

        assert_eq!(
            fired,
            [(100, 2.), (300, 3.), (600, 1.), (700, 2.), (900, 3.)]
        );
        assert!(!device.port("out").unwrap().has_sequence());
        assert!(
            changes
                .borrow()
                .iter()
                .all(|(_, _, reason)| *reason == ChangeReason::Sequence)
        );

        device
            .start_sequence("out", vec![5., 6.], vec![100, 100], 0, 2000)
            .unwrap();
        device.cancel_sequence("out").unwrap();
        device.tick(2100);
        assert_eq!(value(&device, "out"), 5.);

        let err = device
            .start_sequence("out", vec![1.], vec![], 0, 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidSequence);
    }

    #[test]
    fn test_heart_beat_and_sampling() {
        let state = Shared::default();
        let changes = Changes::default();
        let mut device = device(&state).event_sink(Recorder(changes.clone()));
        let _ = device.add_peripheral(meter()).unwrap();
        state.borrow_mut().power = 230.;

        device.tick(0);
        device.tick(499);
        assert!(value(&device, "power").is_nan());
        assert_eq!(state.borrow().beats, 0);

        device.tick(999);
        assert!(value(&device, "power").is_nan());
        assert_eq!(state.borrow().beats, 1);

        device.tick(1000);
        assert_eq!(value(&device, "power"), 230.);
        assert_eq!(
            changes.borrow().last().unwrap(),
            &("power".to_string(), 230., ChangeReason::Native)
        );

        device.tick(1498);
        assert_eq!(state.borrow().beats, 1);
        device.tick(1499);
        assert_eq!(state.borrow().beats, 2);

        let err = device
            .set_port_attr("power", "sampling_interval", AttrValue::Number(50.), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAttributeValue);
        let err = device
            .set_port_attr("relay", "sampling_interval", AttrValue::Number(500.), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AttributeNotModifiable);

        // Disabled ports are neither sampled nor beaten.
        device
            .set_port_attr("power", "enabled", AttrValue::Bool(false), 0)
            .unwrap();
        state.borrow_mut().power = 100.;
        device.tick(5000);
        assert_eq!(value(&device, "power"), 230.);
    }

    #[test]
    fn test_peripheral_rollback() {
        let state = Shared::default();
        let mut device = device(&state);
        let _ = device
            .add_virtual_port(virtual_port("relay", PortType::Boolean))
            .unwrap();

        let err = device.add_peripheral(meter()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateId);
        assert_eq!(device.ports().len(), 1);
        assert!(device.port("power").is_none());
        assert!(device.peripheral(0).is_none());
        assert_eq!(state.borrow().cleanups, 1);

        let err = device
            .add_peripheral(PeripheralConfig::new(42, ParamBlock::new()))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownPeripheralType);
    }

    #[test]
    fn test_rejected_params() {
        let state = Shared::default();
        let mut device = device(&state).config_store(RamStore::new());
        let index = device.add_peripheral(meter()).unwrap();
        device
            .set_port_attr("power", "offset", AttrValue::Number(20.), 0)
            .unwrap();
        let slot = device.port("power").unwrap().slot_number();

        let err = device
            .set_peripheral_params(index, ParamBlock::new().with(GAIN, 99.).unwrap())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAttributeValue);
        assert_eq!(device.peripheral(index).unwrap().config().params.get(GAIN), 1.);
        assert_eq!(device.port("power").unwrap().slot_number(), slot);
        assert_eq!(
            device.get_port_attr("power", "offset").unwrap(),
            AttrValue::Number(20.)
        );

        let err = device
            .set_port_attr("power", "gain", AttrValue::Number(60.), 0)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAttributeValue);
        assert_eq!(
            device.get_port_attr("power", "gain").unwrap(),
            AttrValue::Number(1.)
        );
        assert!(device.port("relay").is_some());

        device
            .set_peripheral_params(index, ParamBlock::new().with(GAIN, 30.).unwrap())
            .unwrap();
        assert_eq!(device.peripheral(index).unwrap().config().params.get(GAIN), 30.);
    }

    #[test]
    fn test_narrowed_attribute() {
        let state = Shared::default();
        let mut device = device(&state);
        let _ = device.add_peripheral(meter()).unwrap();

        device
            .set_port_attr("power", "threshold", AttrValue::Number(12.9), 0)
            .unwrap();
        let json = device.port_to_json("power", 0).unwrap();
        assert_eq!(json.attrs.get("threshold"), Some(&AttrValue::Number(12.)));
        assert_eq!(
            device.get_port_attr("power", "threshold").unwrap(),
            AttrValue::Number(12.)
        );
    }

    #[test]
    fn test_peripheral_table() {
        let state = Shared::default();
        let mut device = device(&state);

        let index = device.add_peripheral(meter()).unwrap();
        assert_eq!(device.port("relay").unwrap().data().peripheral, Some(index));
        assert_eq!(device.port("relay").unwrap().data().ordinal, 1);

        for _ in 1..16 {
            let _ = device
                .add_peripheral(PeripheralConfig::new(EMPTY, ParamBlock::new()))
                .unwrap();
        }
        let err = device
            .add_peripheral(PeripheralConfig::new(EMPTY, ParamBlock::new()))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TooManyPeripherals);

        device.remove_peripheral(index).unwrap();
        assert!(device.ports().is_empty());
        assert_eq!(state.borrow().cleanups, 1);
        assert_eq!(device.add_peripheral(meter()).unwrap(), index);

        let err = device.remove_peripheral(99).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownPeripheral);
    }

    #[test]
    fn test_json() {
        let state = Shared::default();
        let mut device = device(&state);
        let _ = device.add_peripheral(meter()).unwrap();
        let _ = device
            .add_port(
                virtual_port("uptime", PortType::Number)
                    .category(SlotCategory::Extra)
                    .internal(),
            )
            .unwrap();
        device.write_port_value("relay", 1., 0).unwrap();

        let ports = device.device_to_json(0);
        let ids: Vec<_> = ports.iter().map(|port| port.id.as_str()).collect();
        assert_eq!(ids, ["power", "relay"]);

        let power = device.port_to_json("power", 0).unwrap();
        assert_eq!(power.value, None);
        assert_eq!(power.attrs.get("gain"), Some(&AttrValue::Number(1.)));
        assert_eq!(power.attrdefs.len(), 4);

        let relay = device.port_to_json("relay", 0).unwrap();
        assert_eq!(relay.value, Some(crate::json::PortValue::Boolean(true)));
    }

    #[test]
    fn test_config_round_trip() {
        let store = RamStore::new();

        let state = Shared::default();
        let mut device = device(&state).config_store(store.clone());
        let _ = device.add_peripheral(meter()).unwrap();
        let _ = device
            .add_virtual_port(virtual_port("setpoint", PortType::Number).max(50.))
            .unwrap();
        let _ = device
            .add_virtual_port(virtual_port("double", PortType::Number))
            .unwrap();

        device.write_port_value("setpoint", 21., 0).unwrap();
        device.write_port_value("relay", 1., 0).unwrap();
        device
            .set_port_attr("setpoint", "display_name", AttrValue::Str("Setpoint".into()), 0)
            .unwrap();
        device
            .set_port_attr("double", "expression", AttrValue::Str("MUL($setpoint, 2)".into()), 0)
            .unwrap();
        device
            .set_port_attr("power", "offset", AttrValue::Number(-20.), 0)
            .unwrap();
        device.save().unwrap();

        let restored_state = Shared::default();
        let mut restored = self::device(&restored_state).config_store(store.clone());
        restored.load(0).unwrap();

        assert_eq!(restored.peripheral(0).unwrap().config().type_id, METER);
        for id in ["power", "relay", "setpoint", "double"] {
            assert_eq!(
                restored.port(id).unwrap().slot_number(),
                device.port(id).unwrap().slot_number(),
                "{id}"
            );
        }

        let setpoint = restored.port("setpoint").unwrap().data();
        assert_eq!(setpoint.value, 21.);
        assert_eq!(setpoint.max, Some(50.));
        assert_eq!(setpoint.display_name.as_deref(), Some("Setpoint"));

        assert_eq!(value(&restored, "double"), 42.);
        assert_eq!(value(&restored, "relay"), 1.);
        assert_eq!(
            restored.get_port_attr("power", "offset").unwrap(),
            AttrValue::Number(-20.)
        );

        // The dependency survives the reload.
        restored.write_port_value("setpoint", 10., 0).unwrap();
        assert_eq!(value(&restored, "double"), 20.);
    }

    #[test]
    fn test_load_drops_unknown_types() {
        let store = RamStore::new();
        let state = Shared::default();
        let mut device = device(&state).config_store(store.clone());
        let _ = device.add_peripheral(meter()).unwrap();

        let mut restored = Device::new(Settings::new()).config_store(store);
        restored.load(0).unwrap();
        assert!(restored.peripheral(0).is_none());
        assert!(restored.ports().is_empty());
    }

    #[test]
    fn test_deferred_save() {
        let store = RamStore::new();
        let mut device = Device::new(Settings::new().save_delay(1000)).config_store(store.clone());
        let slot = device
            .add_virtual_port(virtual_port("counter", PortType::Number))
            .unwrap();

        let saved = |store: &RamStore| {
            let image = ConfigImage::decode(&store.image().unwrap()).unwrap();
            image.ports[usize::from(slot)].as_ref().unwrap().value
        };
        assert!(saved(&store).is_nan());

        device.write_port_value("counter", 5., 100).unwrap();
        device.write_port_value("counter", 6., 200).unwrap();
        device.tick(1099);
        assert!(saved(&store).is_nan());

        device.tick(1100);
        assert_eq!(saved(&store), 6.);
    }

    #[test]
    fn test_resets() {
        let store = RamStore::new();
        let resets = Rc::new(RefCell::new(Vec::new()));
        let mut device = Device::new(Settings::new())
            .config_store(store.clone())
            .system(Resets(resets.clone()));
        device.save().unwrap();
        assert!(store.image().is_some());

        device.reset();
        device.factory_reset().unwrap();
        assert!(store.image().is_none());
        assert_eq!(*resets.borrow(), [false, true]);
    }
}
