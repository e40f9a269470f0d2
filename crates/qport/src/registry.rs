use alloc::format;
use alloc::vec::Vec;

use crate::error::{Error, ErrorKind, Result};
use crate::port::{DepMask, MAX_PORTS, Port, SlotCategory};

/// The registered ports.
///
/// Lookups are linear scans: the table is bounded by [`MAX_PORTS`] and
/// small enough that hashing would cost more than it saves.
#[derive(Debug, Default)]
pub struct Ports {
    pub(crate) ports: Vec<Port>,
}

impl Ports {
    /// Creates an empty [`Ports`].
    #[must_use]
    pub const fn new() -> Self {
        Self { ports: Vec::new() }
    }

    /// Returns the number of registered ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Returns whether no port is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Returns an iterator over the registered ports.
    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter()
    }

    /// Finds a port by identifier.
    #[must_use]
    pub fn find_by_id(&self, id: &str) -> Option<&Port> {
        self.ports.iter().find(|port| port.data.id == id)
    }

    /// Finds a port by slot.
    #[must_use]
    pub fn find_by_slot(&self, slot: u8) -> Option<&Port> {
        self.ports.iter().find(|port| port.data.slot == Some(slot))
    }

    pub(crate) fn position(&self, id: &str) -> Option<usize> {
        self.ports.iter().position(|port| port.data.id == id)
    }

    pub(crate) fn position_by_slot(&self, slot: u8) -> Option<usize> {
        self.ports
            .iter()
            .position(|port| port.data.slot == Some(slot))
    }

    pub(crate) fn require(&self, id: &str) -> Result<usize> {
        self.position(id).ok_or_else(|| {
            Error::new(ErrorKind::UnknownPort, format!("no port with id `{id}`"))
        })
    }

    /// Returns the lowest free slot of a category.
    #[must_use]
    pub fn free_slot(&self, category: SlotCategory) -> Option<u8> {
        let used = self.used_slots();
        category
            .range()
            .find(|slot| used & (1 << slot) == 0)
            .and_then(|slot| u8::try_from(slot).ok())
    }

    fn used_slots(&self) -> DepMask {
        self.ports
            .iter()
            .filter_map(|port| port.data.slot)
            .fold(0, |mask, slot| mask | (1 << slot))
    }

    /// Registers a port and returns its slot.
    ///
    /// A port without a slot receives the lowest free slot of its category.
    /// On failure the port is dropped.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::InvalidAttributeValue`] if the identifier is empty or
    ///   contains characters not allowed in expressions
    /// - [`ErrorKind::DuplicateId`] if the identifier is already in use
    /// - [`ErrorKind::NoFreeSlot`] if the requested slot is taken or out of
    ///   range, or if the category is full
    pub fn register(&mut self, mut port: Port) -> Result<u8> {
        if !is_valid_id(&port.data.id) {
            return Err(Error::new(
                ErrorKind::InvalidAttributeValue,
                format!("invalid port id `{}`", port.data.id),
            ));
        }

        if self.position(&port.data.id).is_some() {
            return Err(Error::new(
                ErrorKind::DuplicateId,
                format!("port id `{}` already in use", port.data.id),
            ));
        }

        let slot = match port.data.slot {
            Some(slot) => {
                if usize::from(slot) >= MAX_PORTS || self.used_slots() & (1 << slot) != 0 {
                    return Err(Error::new(
                        ErrorKind::NoFreeSlot,
                        format!("slot {slot} not available for `{}`", port.data.id),
                    ));
                }
                slot
            }
            None => self.free_slot(port.data.category).ok_or_else(|| {
                Error::new(
                    ErrorKind::NoFreeSlot,
                    format!("{:?} slots exhausted", port.data.category),
                )
            })?,
        };

        port.data.slot = Some(slot);
        log::debug!("Port `{}` registered in slot {slot}", port.data.id);

        self.ports.push(port);
        self.rebuild_change_dep_masks();

        Ok(slot)
    }

    /// Unregisters a port and returns it, freeing its slot.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnknownPort`] if no port has the identifier.
    pub fn unregister(&mut self, id: &str) -> Result<Port> {
        let index = self.require(id)?;
        let mut port = self.ports.remove(index);
        port.data.slot = None;
        port.data.change_dep_mask = 0;

        log::debug!("Port `{id}` unregistered");
        self.rebuild_change_dep_masks();

        Ok(port)
    }

    /// Rebuilds every dependency mask from the current expressions.
    ///
    /// Must run after any structural change, since a mask may still point
    /// at a freed or reused slot.
    pub fn rebuild_change_dep_masks(&mut self) {
        let mut masks = [0 as DepMask; MAX_PORTS];

        for dependent in &self.ports {
            let (Some(expression), Some(slot)) = (&dependent.data.expression, dependent.data.slot)
            else {
                continue;
            };

            for source_id in expression.port_refs() {
                if source_id == dependent.data.id {
                    continue;
                }
                if let Some(source_slot) = self.find_by_id(source_id).and_then(|p| p.data.slot) {
                    masks[usize::from(source_slot)] |= 1 << slot;
                }
            }
        }

        for port in &mut self.ports {
            port.data.change_dep_mask = port
                .data
                .slot
                .map_or(0, |slot| masks[usize::from(slot)]);
        }
    }
}

/// Returns whether a string can be used as a port identifier.
#[must_use]
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
        && id
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'-')
}

#[cfg(test)]
mod tests {
    use alloc::format;

    use crate::error::ErrorKind;
    use crate::expr::Expression;
    use crate::port::{PortType, SlotCategory};
    use crate::virtual_port::virtual_port;

    use super::Ports;

    #[test]
    fn test_lowest_free_slot() {
        let mut ports = Ports::new();
        assert_eq!(ports.register(virtual_port("a", PortType::Number)), Ok(48));
        assert_eq!(ports.register(virtual_port("b", PortType::Number)), Ok(49));
        assert_eq!(ports.register(virtual_port("c", PortType::Number)), Ok(50));

        let _ = ports.unregister("b").unwrap();
        assert_eq!(ports.find_by_slot(49).map(|p| p.id()), None);
        assert_eq!(ports.register(virtual_port("d", PortType::Number)), Ok(49));
        assert_eq!(ports.find_by_id("d").unwrap().slot_number(), Some(49));
    }

    #[test]
    fn test_slot_collisions() {
        let mut ports = Ports::new();
        assert_eq!(
            ports.register(virtual_port("a", PortType::Boolean).slot(10)),
            Ok(10)
        );

        let err = ports
            .register(virtual_port("b", PortType::Boolean).slot(10))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoFreeSlot);

        let err = ports
            .register(virtual_port("a", PortType::Boolean))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateId);

        let err = ports
            .register(virtual_port("9lives", PortType::Boolean))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAttributeValue);

        assert_eq!(ports.len(), 1);
    }

    #[test]
    fn test_category_exhaustion() {
        let mut ports = Ports::new();
        for i in SlotCategory::Virtual.range() {
            let _ = ports
                .register(virtual_port(format!("v{i}"), PortType::Number))
                .unwrap();
        }

        let err = ports
            .register(virtual_port("overflow", PortType::Number))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoFreeSlot);

        // Other categories are unaffected.
        let port = virtual_port("gpio", PortType::Boolean).category(SlotCategory::Gpio);
        assert_eq!(ports.register(port), Ok(0));
    }

    #[test]
    fn test_slot_uniqueness() {
        let mut ports = Ports::new();
        // A deterministic interleaving of registrations and removals.
        for round in 0..21u32 {
            let id = format!("p{round}");
            let _ = ports.register(virtual_port(id, PortType::Number)).unwrap();
            if round % 3 == 2 {
                let victim = format!("p{}", round - 1);
                let _ = ports.unregister(&victim).unwrap();
            }

            let mut seen = 0u64;
            for port in ports.iter() {
                let bit = 1 << port.slot_number().unwrap();
                assert_eq!(seen & bit, 0);
                seen |= bit;
            }
        }
    }

    #[test]
    fn test_masks_follow_slots() {
        let mut ports = Ports::new();
        let _ = ports.register(virtual_port("a", PortType::Number)).unwrap();

        let mut b = virtual_port("b", PortType::Number);
        b.data.expression = Some(Expression::parse("ADD($a, 1)").unwrap());
        let _ = ports.register(b).unwrap();

        assert_eq!(ports.find_by_id("a").unwrap().data().change_dep_mask, 1 << 49);

        let _ = ports.unregister("b").unwrap();
        assert_eq!(ports.find_by_id("a").unwrap().data().change_dep_mask, 0);
    }
}
