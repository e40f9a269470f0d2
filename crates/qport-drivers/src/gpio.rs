//! Digital ports backed by a single pin.
//!
//! Both drivers honor the `inverted` attribute, stored in the
//! [`INVERTED`] port flag: when set, a low level means active.

use alloc::string::String;

use embedded_hal::digital::{InputPin, OutputPin, PinState};

use qport::attrdef::{AttrDef, AttrStorage};
use qport::port::{Port, PortData, PortDriver, PortFlags, PortType, SlotCategory, UNDEFINED};

/// Port flag marking an inverted pin.
pub const INVERTED: PortFlags = PortFlags::CUSTOM0;

const ATTRDEFS: &[AttrDef] = &[AttrDef::boolean("inverted", AttrStorage::Flag(INVERTED))
    .display_name("Inverted")
    .description("Whether a low level means active.")
    .reconnect()];

#[inline]
fn active_level(port: &PortData, active: bool) -> PinState {
    PinState::from(active != port.flags.contains(INVERTED))
}

/// A digital input port.
pub struct DigitalInput<P: InputPin> {
    pin: P,
}

impl<P: InputPin + 'static> DigitalInput<P> {
    /// Creates a boolean port reading the pin.
    #[must_use]
    pub fn port(id: impl Into<String>, pin: P) -> Port {
        Port::new(id, PortType::Boolean, Self { pin })
            .category(SlotCategory::Gpio)
            .sampling(50, 10, 60_000)
    }
}

impl<P: InputPin> PortDriver for DigitalInput<P> {
    fn read_value(&mut self, port: &PortData, _now_ms: u64) -> f64 {
        match self.pin.is_high() {
            Ok(high) => f64::from(u8::from(high != port.flags.contains(INVERTED))),
            Err(e) => {
                log::debug!("Port `{}`: {e:?}", port.id);
                UNDEFINED
            }
        }
    }

    fn attrdefs(&self) -> &'static [AttrDef] {
        ATTRDEFS
    }
}

/// A digital output port.
pub struct DigitalOutput<P: OutputPin> {
    pin: P,
}

impl<P: OutputPin + 'static> DigitalOutput<P> {
    /// Creates a writable boolean port driving the pin.
    #[must_use]
    pub fn port(id: impl Into<String>, pin: P) -> Port {
        Port::new(id, PortType::Boolean, Self { pin })
            .category(SlotCategory::Gpio)
            .writable()
            .persisted()
    }
}

impl<P: OutputPin> DigitalOutput<P> {
    fn drive(&mut self, port: &PortData, active: bool) -> bool {
        match self.pin.set_state(active_level(port, active)) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Port `{}`: {e:?}", port.id);
                false
            }
        }
    }
}

impl<P: OutputPin> PortDriver for DigitalOutput<P> {
    fn read_value(&mut self, port: &PortData, _now_ms: u64) -> f64 {
        port.value
    }

    fn write_value(&mut self, port: &PortData, value: f64, _now_ms: u64) -> bool {
        self.drive(port, value != 0.)
    }

    fn configure(&mut self, port: &PortData, enabled: bool) {
        if !enabled {
            let _ = self.drive(port, false);
        } else if port.flags.contains(PortFlags::SET) {
            let _ = self.drive(port, port.value != 0.);
        }
    }

    fn attrdefs(&self) -> &'static [AttrDef] {
        ATTRDEFS
    }
}
