//! Energy meters reached through a request/response transport.
//!
//! The vendor protocol stays behind the [`MeterTransport`] trait: the
//! driver only sees decoded readings. One transaction serves the four
//! ports of the meter, and a failed transaction keeps the previous reading
//! valid for twice the sampling interval.

use alloc::format;
use alloc::rc::Rc;
use alloc::vec::Vec;

use core::cell::RefCell;
use core::fmt::Debug;

use qport::attrdef::{AttrDef, AttrStorage};
use qport::error::Result as PortResult;
use qport::layout::{Field, Width};
use qport::peripheral::{ParamBlock, PeripheralConfig, PeripheralDriver};
use qport::port::{Port, PortData, PortDriver, PortType, SlotCategory, UNDEFINED};
use qport::sampling::SampleCache;

use crate::ENERGY_METER;

/// Voltage calibration factor.
pub const VOLTAGE_GAIN: Field = Field::new(0, Width::F64);
/// Current calibration factor.
pub const CURRENT_GAIN: Field = Field::new(8, Width::F64);
/// Power and energy calibration factor.
pub const POWER_GAIN: Field = Field::new(16, Width::F64);

const fn gain_attrdef(field: Field) -> AttrDef {
    AttrDef::number("calibration", AttrStorage::Param(field))
        .display_name("Calibration")
        .description("Factor applied to the raw reading.")
        .min(0.5)
        .max(2.)
        .default(1.)
}

const VOLTAGE_ATTRDEFS: &[AttrDef] = &[gain_attrdef(VOLTAGE_GAIN)];
const CURRENT_ATTRDEFS: &[AttrDef] = &[gain_attrdef(CURRENT_GAIN)];
const POWER_ATTRDEFS: &[AttrDef] = &[gain_attrdef(POWER_GAIN)];

/// A decoded meter reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReading {
    /// RMS voltage, in volts.
    pub voltage: f64,
    /// RMS current, in amperes.
    pub current: f64,
    /// Active power, in watts.
    pub active_power: f64,
    /// Accumulated energy, in watt-hours.
    pub energy: f64,
}

/// The link to a meter.
///
/// A transaction must complete, or fail, within a bounded time.
pub trait MeterTransport {
    /// Transport error.
    type Error: Debug;

    /// Performs a request/response transaction and decodes the reading.
    ///
    /// # Errors
    ///
    /// Fails on timeouts, framing or checksum errors.
    fn read(&mut self) -> Result<MeterReading, Self::Error>;
}

/// Errors that may occur when reading a meter.
#[derive(Debug)]
pub enum MeterError<E> {
    /// Transport errors.
    Transport(E),
    /// The reading is outside of the physical range.
    Implausible,
}

fn check(reading: MeterReading) -> bool {
    [reading.voltage, reading.current, reading.energy]
        .iter()
        .all(|value| value.is_finite() && *value >= 0.)
        && reading.active_power.is_finite()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quantity {
    Voltage,
    Current,
    Power,
    Energy,
}

struct Meter<T: MeterTransport> {
    transport: T,
    cache: SampleCache<MeterReading>,
    gains: [f64; 3],
}

impl<T: MeterTransport> Meter<T> {
    fn sample(&mut self, port: &PortData, now_ms: u64, quantity: Quantity) -> f64 {
        let Self {
            transport, cache, ..
        } = self;

        let reading = cache.get(now_ms, port.sampling.interval, || {
            let reading = transport.read().map_err(MeterError::Transport)?;
            if check(reading) {
                Ok(reading)
            } else {
                Err(MeterError::Implausible)
            }
        });

        let [voltage, current, power] = self.gains;
        reading.map_or(UNDEFINED, |reading| match quantity {
            Quantity::Voltage => reading.voltage * voltage,
            Quantity::Current => reading.current * current,
            Quantity::Power => reading.active_power * power,
            Quantity::Energy => reading.energy * power / 1000.,
        })
    }
}

/// The energy meter peripheral, exposing `voltage`, `current`, `power` and
/// `energy` ports.
pub struct EnergyMeter<T: MeterTransport> {
    meter: Rc<RefCell<Meter<T>>>,
    prefix: &'static str,
}

impl<T: MeterTransport> EnergyMeter<T> {
    /// Creates an [`EnergyMeter`] reading through the given transport.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self {
            meter: Rc::new(RefCell::new(Meter {
                transport,
                cache: SampleCache::new(),
                gains: [1.; 3],
            })),
            prefix: "",
        }
    }

    /// Sets a prefix prepended to the port identifiers.
    #[must_use]
    pub fn prefix(mut self, prefix: &'static str) -> Self {
        self.prefix = prefix;
        self
    }

    /// Returns the configuration of an uncalibrated meter.
    #[must_use]
    pub fn config() -> PeripheralConfig {
        let mut params = ParamBlock::new();
        for field in [VOLTAGE_GAIN, CURRENT_GAIN, POWER_GAIN] {
            // The fields lie within the block.
            let _ = params.set(field, 1.);
        }
        PeripheralConfig::new(ENERGY_METER, params)
    }
}

impl<T: MeterTransport + 'static> PeripheralDriver for EnergyMeter<T> {
    fn init(&mut self, config: &PeripheralConfig) -> PortResult<()> {
        // An unset factor reads as zero.
        let gain = |field: Field| {
            let gain = config.params.get(field);
            if gain == 0. { 1. } else { gain }
        };

        let mut meter = self.meter.borrow_mut();
        meter.gains = [gain(VOLTAGE_GAIN), gain(CURRENT_GAIN), gain(POWER_GAIN)];
        meter.cache.invalidate();

        log::debug!("Energy meter calibrated with {:?}", meter.gains);
        Ok(())
    }

    fn make_ports(&mut self, _config: &PeripheralConfig) -> PortResult<Vec<Port>> {
        let port = |name: &str, display_name: &'static str, unit: &'static str, quantity: Quantity| {
            Port::new(
                format!("{}{name}", self.prefix),
                PortType::Number,
                MeterPort {
                    meter: self.meter.clone(),
                    quantity,
                },
            )
            .category(SlotCategory::Peripheral)
            .display_name(display_name)
            .unit(unit)
            .sampling(1000, 500, 3_600_000)
        };

        Ok(alloc::vec![
            port("voltage", "Voltage", "V", Quantity::Voltage),
            port("current", "Current", "A", Quantity::Current),
            port("power", "Active power", "W", Quantity::Power),
            port("energy", "Energy", "kWh", Quantity::Energy),
        ])
    }
}

struct MeterPort<T: MeterTransport> {
    meter: Rc<RefCell<Meter<T>>>,
    quantity: Quantity,
}

impl<T: MeterTransport> PortDriver for MeterPort<T> {
    fn read_value(&mut self, port: &PortData, now_ms: u64) -> f64 {
        self.meter.borrow_mut().sample(port, now_ms, self.quantity)
    }

    fn attrdefs(&self) -> &'static [AttrDef] {
        match self.quantity {
            Quantity::Voltage => VOLTAGE_ATTRDEFS,
            Quantity::Current => CURRENT_ATTRDEFS,
            Quantity::Power | Quantity::Energy => POWER_ATTRDEFS,
        }
    }
}
