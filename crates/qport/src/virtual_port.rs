use alloc::string::String;

use crate::port::{Port, PortData, PortDriver, PortType, SlotCategory};

/// The driver of a virtual port: the stored value is the hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualDriver;

impl PortDriver for VirtualDriver {
    fn read_value(&mut self, port: &PortData, _now_ms: u64) -> f64 {
        port.value
    }

    fn write_value(&mut self, _port: &PortData, _value: f64, _now_ms: u64) -> bool {
        true
    }
}

/// Creates a writable, persisted virtual [`Port`].
#[must_use]
pub fn virtual_port(id: impl Into<String>, port_type: PortType) -> Port {
    Port::new(id, port_type, VirtualDriver)
        .category(SlotCategory::Virtual)
        .writable()
        .persisted()
}
