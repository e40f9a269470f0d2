//! # DHT22 Driver
//!
//! This module provides an architecture-agnostic driver for the `DHT22`
//! temperature and humidity sensor, and the peripheral exposing its
//! measurements as ports.
//! The driver is synchronous to meet the strict timing requirements of the
//! sensor's single-wire protocol.
//!
//! The `DHT22` sensor provides the following measurements:
//! - **Humidity**: Relative humidity as a percentage (% RH)
//! - **Temperature**: Temperature in degrees Celsius (°C)
//!
//! A transaction takes several milliseconds and the sensor cannot be read
//! more than once every two seconds, so both ports share a
//! [`SampleCache`]: a single transaction serves both readings.
//!
//! For detailed specifications, refer to the
//! [datasheet](https://www.alldatasheet.com/datasheet-pdf/pdf/1132459/ETC2/DHT22.html).

use alloc::format;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;

use core::cell::RefCell;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin, PinState};

use qport::error::Result as PortResult;
use qport::peripheral::{PeripheralConfig, PeripheralDriver};
use qport::port::{Port, PortData, PortDriver, PortType, SlotCategory, UNDEFINED};
use qport::sampling::SampleCache;

// Protocol-specific timing constants.
const START_SIGNAL_LOW_MS: u32 = 18; // MCU pulls line low for at least 18 ms to initiate communication.
const START_SIGNAL_HIGH_US: u32 = 40; // Then releases the line (high) for ~20–40 µs.
const BIT_SAMPLE_DELAY_US: u32 = 35; // Time after which to sample the data bit.
const POLL_DELAY_US: u32 = 1; // Delay between pin state polls when waiting for edges.
const MAX_ATTEMPTS: usize = 100; // Maximum polling iterations before timeout.

// The sensor needs two seconds between transactions.
const MIN_SAMPLING_INTERVAL_MS: u32 = 2000;

/// A single humidity and temperature measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Relative humidity as a percentage (% RH).
    pub humidity: f32,
    /// Temperature in degrees Celsius (°C).
    pub temperature: f32,
}

/// Errors that may occur when interacting with the `DHT22` sensor.
#[derive(Debug)]
pub enum Dht22Error<E> {
    /// GPIO pin errors.
    Pin(E),
    /// Data checksum mismatch.
    ChecksumMismatch,
    /// Timeout waiting for sensor response.
    Timeout,
}

impl<E> From<E> for Dht22Error<E> {
    fn from(e: E) -> Self {
        Dht22Error::Pin(e)
    }
}

/// The `DHT22` driver.
pub struct Dht22<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    pin: P,
    delay: D,
}

// Raw sensor data: humidity high and low, temperature high and low, checksum.
type RawData = [u8; 5];

impl<P, D> Dht22<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    /// Creates a [`Dht22`] driver for the given pin and delay provider.
    #[must_use]
    pub fn new(pin: P, delay: D) -> Self {
        Self { pin, delay }
    }

    /// Reads a single humidity and temperature measurement.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Reading from the pin fails
    /// - The sensor does not respond within the expected timing window
    /// - The received data fails checksum validation
    pub fn read(&mut self) -> Result<Measurement, Dht22Error<P::Error>> {
        self.send_start_signal()?;
        self.wait_for_sensor_response()?;

        let [hh, hl, th, tl, checksum] = self.read_raw_data()?;
        Self::validate_checksum([hh, hl, th, tl], checksum)?;

        Ok(Measurement {
            humidity: Self::decode_humidity(hh, hl),
            temperature: Self::decode_temperature(th, tl),
        })
    }

    fn send_start_signal(&mut self) -> Result<(), Dht22Error<P::Error>> {
        self.pin.set_low()?;
        self.delay.delay_ms(START_SIGNAL_LOW_MS);

        // The sensor takes control of the line right after.
        self.pin.set_high()?;
        self.delay.delay_us(START_SIGNAL_HIGH_US);

        Ok(())
    }

    fn wait_for_sensor_response(&mut self) -> Result<(), Dht22Error<P::Error>> {
        // The sensor pulls the line low and then high to acknowledge.
        self.wait_until_state(PinState::Low)?;
        self.wait_until_state(PinState::High)
    }

    fn read_raw_data(&mut self) -> Result<RawData, Dht22Error<P::Error>> {
        let mut data = [0; 5];
        for byte in &mut data {
            *byte = self.read_byte()?;
        }
        Ok(data)
    }

    #[inline]
    fn validate_checksum(bytes: [u8; 4], checksum: u8) -> Result<(), Dht22Error<P::Error>> {
        // The checksum is the low 8 bits of the sum of the first four bytes.
        let sum = bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte));

        if sum == checksum {
            Ok(())
        } else {
            Err(Dht22Error::ChecksumMismatch)
        }
    }

    #[inline]
    fn decode_humidity(high: u8, low: u8) -> f32 {
        // Tenths of percent.
        f32::from(u16::from_be_bytes([high, low])) / 10.0
    }

    #[inline]
    fn decode_temperature(high: u8, low: u8) -> f32 {
        // Tenths of degree, sign in the most significant bit.
        let t = f32::from(u16::from_be_bytes([high & 0x7F, low])) / 10.0;
        if high & 0x80 != 0 { -t } else { t }
    }

    fn wait_until_state(&mut self, state: PinState) -> Result<(), Dht22Error<P::Error>> {
        for _ in 0..MAX_ATTEMPTS {
            let reached = match state {
                PinState::High => self.pin.is_high()?,
                PinState::Low => self.pin.is_low()?,
            };
            if reached {
                return Ok(());
            }
            self.delay.delay_us(POLL_DELAY_US);
        }

        Err(Dht22Error::Timeout)
    }

    fn read_byte(&mut self) -> Result<u8, Dht22Error<P::Error>> {
        let mut byte = 0;

        // The duration of the high pulse following each low pulse encodes
        // the bit, most significant first.
        for i in 0..8 {
            self.wait_until_state(PinState::Low)?;
            self.wait_until_state(PinState::High)?;

            self.delay.delay_us(BIT_SAMPLE_DELAY_US);

            if self.pin.is_high()? {
                byte |= 1 << (7 - i);
            }
        }

        Ok(byte)
    }
}

struct Sensor<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    dht22: Dht22<P, D>,
    cache: SampleCache<Measurement>,
}

impl<P, D> Sensor<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    fn sample(&mut self, port: &PortData, now_ms: u64) -> Option<Measurement> {
        let Self { dht22, cache } = self;
        cache.get(now_ms, port.sampling.interval, || dht22.read())
    }
}

/// The `DHT22` peripheral, exposing a `temperature` and a `humidity` port.
pub struct Dht22Sensor<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    sensor: Rc<RefCell<Sensor<P, D>>>,
    prefix: &'static str,
}

impl<P, D> Dht22Sensor<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    /// Creates a [`Dht22Sensor`] reading through the given driver.
    #[must_use]
    pub fn new(dht22: Dht22<P, D>) -> Self {
        Self {
            sensor: Rc::new(RefCell::new(Sensor {
                dht22,
                cache: SampleCache::new(),
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
}

impl<P, D> PeripheralDriver for Dht22Sensor<P, D>
where
    P: InputPin + OutputPin + 'static,
    D: DelayNs + 'static,
{
    fn init(&mut self, _config: &PeripheralConfig) -> PortResult<()> {
        self.sensor.borrow_mut().cache.invalidate();
        Ok(())
    }

    fn make_ports(&mut self, _config: &PeripheralConfig) -> PortResult<Vec<Port>> {
        Ok(vec![
            Port::new(
                format!("{}temperature", self.prefix),
                PortType::Number,
                TemperaturePort(self.sensor.clone()),
            )
            .category(SlotCategory::Peripheral)
            .display_name("Temperature")
            .unit("°C")
            .min(-40.)
            .max(80.)
            .sampling(MIN_SAMPLING_INTERVAL_MS, MIN_SAMPLING_INTERVAL_MS, 3_600_000),
            Port::new(
                format!("{}humidity", self.prefix),
                PortType::Number,
                HumidityPort(self.sensor.clone()),
            )
            .category(SlotCategory::Peripheral)
            .display_name("Humidity")
            .unit("%")
            .min(0.)
            .max(100.)
            .sampling(MIN_SAMPLING_INTERVAL_MS, MIN_SAMPLING_INTERVAL_MS, 3_600_000),
        ])
    }
}

struct TemperaturePort<P, D>(Rc<RefCell<Sensor<P, D>>>)
where
    P: InputPin + OutputPin,
    D: DelayNs;

impl<P, D> PortDriver for TemperaturePort<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    fn read_value(&mut self, port: &PortData, now_ms: u64) -> f64 {
        self.0
            .borrow_mut()
            .sample(port, now_ms)
            .map_or(UNDEFINED, |m| f64::from(m.temperature))
    }
}

struct HumidityPort<P, D>(Rc<RefCell<Sensor<P, D>>>)
where
    P: InputPin + OutputPin,
    D: DelayNs;

impl<P, D> PortDriver for HumidityPort<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    fn read_value(&mut self, port: &PortData, now_ms: u64) -> f64 {
        self.0
            .borrow_mut()
            .sample(port, now_ms)
            .map_or(UNDEFINED, |m| f64::from(m.humidity))
    }
}
