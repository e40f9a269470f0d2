//! Counts pulses signalled by an interrupt handler.
//!
//! The handler only increments an [`IsrCounter`]. The `count` port drains
//! it on every heartbeat and accumulates the total, the `rate` port reports
//! the pulses per minute measured over a configurable window.

use alloc::format;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;

use core::cell::RefCell;

use qport::attrdef::{AttrDef, AttrStorage};
use qport::error::{Error, ErrorKind, Result};
use qport::isr::IsrCounter;
use qport::layout::{Field, Width};
use qport::peripheral::{PeripheralConfig, PeripheralDriver};
use qport::port::{Port, PortData, PortDriver, PortFlags, PortType, SlotCategory, is_undefined};

/// Length of the rate measurement window, in milliseconds.
pub const WINDOW: Field = Field::new(0, Width::U16);

const DEFAULT_WINDOW_MS: u64 = 10_000;
const HEART_BEAT_MS: u32 = 100;

const RATE_ATTRDEFS: &[AttrDef] = &[AttrDef::number("window", AttrStorage::Param(WINDOW))
    .display_name("Window")
    .description("Length of the rate measurement window.")
    .unit("ms")
    .min(1000.)
    .max(60_000.)
    .integer()];

#[derive(Debug)]
struct Counter {
    isr: &'static IsrCounter,
    total: f64,
    window_ms: u64,
    window_start: u64,
    window_pulses: u32,
    rate: f64,
}

impl Counter {
    fn drain(&mut self, now_ms: u64) {
        let pulses = self.isr.take();
        self.total += f64::from(pulses);
        self.window_pulses = self.window_pulses.saturating_add(pulses);

        let elapsed = now_ms.saturating_sub(self.window_start);
        if elapsed >= self.window_ms {
            self.rate = f64::from(self.window_pulses) * 60_000. / elapsed as f64;
            self.window_pulses = 0;
            self.window_start = now_ms;
        }
    }
}

type Shared = Rc<RefCell<Counter>>;

/// The pulse counter peripheral.
pub struct PulseCounter {
    isr: &'static IsrCounter,
    prefix: &'static str,
    counter: Option<Shared>,
}

impl PulseCounter {
    /// Creates a [`PulseCounter`] draining the given counter.
    #[must_use]
    pub const fn new(isr: &'static IsrCounter) -> Self {
        Self {
            isr,
            prefix: "",
            counter: None,
        }
    }

    /// Sets a prefix prepended to the port identifiers.
    #[must_use]
    pub const fn prefix(mut self, prefix: &'static str) -> Self {
        self.prefix = prefix;
        self
    }
}

impl PeripheralDriver for PulseCounter {
    fn init(&mut self, config: &PeripheralConfig) -> Result<()> {
        let window_ms = match config.params.get(WINDOW) as u64 {
            0 => DEFAULT_WINDOW_MS,
            window => window,
        };

        // Pulses counted while the peripheral was down are discarded.
        let _ = self.isr.take();
        self.counter = Some(Rc::new(RefCell::new(Counter {
            isr: self.isr,
            total: 0.,
            window_ms,
            window_start: 0,
            window_pulses: 0,
            rate: 0.,
        })));
        Ok(())
    }

    fn make_ports(&mut self, _config: &PeripheralConfig) -> Result<Vec<Port>> {
        let counter = self.counter.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidConfig, "pulse counter not initialized")
        })?;

        Ok(vec![
            Port::new(
                format!("{}count", self.prefix),
                PortType::Number,
                CountPort(counter.clone()),
            )
            .category(SlotCategory::Peripheral)
            .display_name("Pulse count")
            .min(0.)
            .integer()
            .writable()
            .persisted()
            .heart_beat(HEART_BEAT_MS)
            .sampling(1000, 100, 3_600_000),
            Port::new(
                format!("{}rate", self.prefix),
                PortType::Number,
                RatePort(counter.clone()),
            )
            .category(SlotCategory::Peripheral)
            .display_name("Pulse rate")
            .unit("1/min")
            .sampling(1000, 100, 3_600_000),
        ])
    }

    fn cleanup(&mut self) {
        self.counter = None;
    }
}

struct CountPort(Shared);

impl PortDriver for CountPort {
    fn read_value(&mut self, _port: &PortData, _now_ms: u64) -> f64 {
        self.0.borrow().total
    }

    // Writing sets the total, usually to reset it.
    fn write_value(&mut self, _port: &PortData, value: f64, _now_ms: u64) -> bool {
        self.0.borrow_mut().total = value;
        true
    }

    fn configure(&mut self, port: &PortData, enabled: bool) {
        // The total resumes from the persisted value.
        if enabled && port.flags.contains(PortFlags::SET) && !is_undefined(port.value) {
            self.0.borrow_mut().total = port.value;
        }
    }

    fn heart_beat(&mut self, _port: &PortData, now_ms: u64) {
        self.0.borrow_mut().drain(now_ms);
    }
}

struct RatePort(Shared);

impl PortDriver for RatePort {
    fn read_value(&mut self, _port: &PortData, _now_ms: u64) -> f64 {
        self.0.borrow().rate
    }

    fn attrdefs(&self) -> &'static [AttrDef] {
        RATE_ATTRDEFS
    }
}
