//! Expressions make a port value a function of other port values.
//!
//! Instead of scanning every expression when a value changes, each source
//! port carries a dependency mask naming the slots of its dependents. A
//! change walks that mask in slot order and recomputes each dependent,
//! which in turn propagates its own change depth-first.

use alloc::boxed::Box;
use alloc::format;
use alloc::vec::Vec;

use crate::error::{Error, ErrorKind, Result};
use crate::expr::{Expression, Scope};
use crate::port::{ChangeReason, MAX_PORTS, PortFlags, Port, UNDEFINED, is_undefined};
use crate::registry::Ports;
use crate::system::EventSink;

// Values are equal when they compare equal or are both undefined.
#[inline]
fn same_value(a: f64, b: f64) -> bool {
    a == b || (is_undefined(a) && is_undefined(b))
}

/// The port values seen by an expression.
pub(crate) struct PortsScope<'a> {
    pub(crate) ports: &'a [Port],
    pub(crate) own: f64,
    pub(crate) now_ms: u64,
}

impl Scope for PortsScope<'_> {
    fn port_value(&self, id: &str) -> f64 {
        self.ports
            .iter()
            .find(|port| port.data.id == id)
            .map_or(UNDEFINED, |port| port.data.visible_value())
    }

    fn own_value(&self) -> f64 {
        self.own
    }

    fn now_ms(&self) -> u64 {
        self.now_ms
    }
}

/// The context of a value change.
pub struct Propagation<'a> {
    /// Receiver of every change, including the propagated ones.
    pub sink: &'a mut Option<Box<dyn EventSink>>,
    /// Maximum number of expression levels traversed.
    pub max_depth: u8,
    /// Current time.
    pub now_ms: u64,
    /// Set when the value of a persisted port changed.
    pub persisted_changed: bool,
}

impl Ports {
    /// Checks that an expression can be attached to a port.
    ///
    /// Referenced ports do not need to exist: a missing port evaluates to
    /// [`UNDEFINED`].
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::InvalidExpression`] if the expression reads `$`
    /// - [`ErrorKind::SelfDependency`] if the expression reads its own port
    /// - [`ErrorKind::CyclicDependency`] if a port the expression reads
    ///   depends, directly or not, on the port
    pub fn check_expression(&self, port_id: &str, expression: &Expression) -> Result<()> {
        if expression.uses_own_value() {
            return Err(Error::new(
                ErrorKind::InvalidExpression,
                format!("port `{port_id}`: `$` is only allowed in transforms"),
            ));
        }

        let mut pending = expression.port_refs();
        if pending.contains(&port_id) {
            return Err(Error::new(
                ErrorKind::SelfDependency,
                format!("port `{port_id}` cannot depend on itself"),
            ));
        }

        let mut visited: Vec<&str> = Vec::new();
        while let Some(id) = pending.pop() {
            if id == port_id {
                return Err(Error::new(
                    ErrorKind::CyclicDependency,
                    format!("port `{port_id}` would depend on itself through other ports"),
                ));
            }

            if visited.contains(&id) {
                continue;
            }
            visited.push(id);

            if let Some(expression) = self.find_by_id(id).and_then(|p| p.data.expression.as_ref()) {
                pending.extend(expression.port_refs());
            }
        }

        Ok(())
    }

    /// Evaluates an expression against the registered ports.
    #[must_use]
    pub fn eval(&self, expression: &Expression, own: f64, now_ms: u64) -> f64 {
        expression.eval(&PortsScope {
            ports: &self.ports,
            own,
            now_ms,
        })
    }

    /// Sets the value of the port at `index` and recomputes its dependents.
    ///
    /// Writable ports forward the value to their driver unless it comes
    /// from the hardware itself. Returns whether the value changed.
    ///
    /// Dependents are recomputed depth first, in slot order. When a port
    /// reads both the changed port and one of its dependents placed in a
    /// higher slot, the sink may first see it computed from the old value
    /// of that dependent, then again with the final value.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::WriteFailed`] if the driver rejected the
    /// value, which is then not stored. Failures of dependents are logged
    /// and do not stop the propagation.
    pub fn set_value(
        &mut self,
        index: usize,
        value: f64,
        reason: ChangeReason,
        propagation: &mut Propagation<'_>,
    ) -> Result<bool> {
        self.set_value_at_depth(index, value, reason, propagation, 0)
    }

    fn set_value_at_depth(
        &mut self,
        index: usize,
        value: f64,
        reason: ChangeReason,
        propagation: &mut Propagation<'_>,
        depth: u8,
    ) -> Result<bool> {
        let port = &mut self.ports[index];

        if port.data.flags.contains(PortFlags::SET) && same_value(port.data.value, value) {
            return Ok(false);
        }

        if reason != ChangeReason::Native
            && port.data.is_writable()
            && !is_undefined(value)
            && !port.driver.write_value(&port.data, value, propagation.now_ms)
        {
            return Err(Error::new(
                ErrorKind::WriteFailed,
                format!("port `{}` rejected {value}", port.data.id),
            ));
        }

        port.data.value = value;
        port.data.flags.insert(PortFlags::SET);
        propagation.persisted_changed |= port.data.is_persisted();
        log::debug!("Port `{}` = {value} ({reason:?})", port.data.id);

        if let Some(sink) = propagation.sink.as_mut() {
            sink.value_changed(&port.data, reason);
        }

        let mask = port.data.change_dep_mask;
        if mask == 0 {
            return Ok(true);
        }

        if depth >= propagation.max_depth {
            log::warn!(
                "Propagation from port `{}` stopped at depth {depth}",
                self.ports[index].data.id
            );
            return Ok(true);
        }

        for slot in 0..MAX_PORTS as u8 {
            if mask & (1 << slot) == 0 {
                continue;
            }

            let Some(dependent) = self.position_by_slot(slot) else {
                continue;
            };

            let data = &self.ports[dependent].data;
            let Some(expression) = data.expression.as_ref().filter(|_| data.is_enabled()) else {
                continue;
            };

            let computed = data.coerce(self.eval(expression, UNDEFINED, propagation.now_ms));
            if is_undefined(computed) {
                continue;
            }

            if let Err(e) = self.set_value_at_depth(
                dependent,
                computed,
                ChangeReason::Expression,
                propagation,
                depth + 1,
            ) {
                log::warn!("{e}");
            }
        }

        Ok(true)
    }
}
