use alloc::string::String;

use embedded_hal::pwm::SetDutyCycle;

use qport::port::{Port, PortData, PortDriver, PortFlags, PortType, SlotCategory};

/// A duty-cycle output port, in percent.
pub struct PwmOutput<C: SetDutyCycle> {
    channel: C,
}

impl<C: SetDutyCycle + 'static> PwmOutput<C> {
    /// Creates a writable numeric port driving the channel.
    #[must_use]
    pub fn port(id: impl Into<String>, channel: C) -> Port {
        Port::new(id, PortType::Number, Self { channel })
            .category(SlotCategory::Gpio)
            .unit("%")
            .min(0.)
            .max(100.)
            .integer()
            .writable()
            .persisted()
    }
}

impl<C: SetDutyCycle> PortDriver for PwmOutput<C> {
    fn read_value(&mut self, port: &PortData, _now_ms: u64) -> f64 {
        port.value
    }

    fn write_value(&mut self, port: &PortData, value: f64, _now_ms: u64) -> bool {
        // Values are integers within 0..=100.
        match self.channel.set_duty_cycle_percent(value as u8) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Port `{}`: {e:?}", port.id);
                false
            }
        }
    }

    fn configure(&mut self, port: &PortData, enabled: bool) {
        if !enabled {
            if let Err(e) = self.channel.set_duty_cycle_fully_off() {
                log::debug!("Port `{}`: {e:?}", port.id);
            }
        } else if port.flags.contains(PortFlags::SET) {
            let _ = self.write_value(port, port.value, 0);
        }
    }
}
