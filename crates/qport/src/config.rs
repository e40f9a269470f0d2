//! The persisted configuration is a single binary image:
//!
//! ```text
//! header        16 bytes     magic "QPRT", version, string table length
//! peripherals   16 x 0x40    indexed by peripheral index
//! ports         64 x 0x60    indexed by slot
//! string table  variable     NUL-terminated entries, offset 0 = none
//! ```
//!
//! All integers are little-endian. A record whose type or identifier
//! reference is zero is empty, so both tables are sparse.

use alloc::format;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use core::cell::RefCell;

use crate::error::{Error, ErrorKind, Result};
use crate::expr::Expression;
use crate::layout::{get_f64, get_u16, get_u32, put_f64, put_u16, put_u32};
use crate::peripheral::{MAX_PERIPHERALS, PARAMS_LEN, ParamBlock};
use crate::port::{Choice, EXTRA_LEN, MAX_PORTS, PortData, PortFlags, is_undefined};

/// Image magic number.
pub const MAGIC: [u8; 4] = *b"QPRT";

/// Image format version.
pub const VERSION: u16 = 1;

/// Length of the image header.
pub const HEADER_LEN: usize = 16;

/// Length of a peripheral record.
pub const PERIPHERAL_RECORD_LEN: usize = 0x40;

/// Length of a port record.
pub const PORT_RECORD_LEN: usize = 0x60;

const PERIPHERALS_OFFSET: usize = HEADER_LEN;
const PORTS_OFFSET: usize = PERIPHERALS_OFFSET + MAX_PERIPHERALS * PERIPHERAL_RECORD_LEN;
const STRINGS_OFFSET: usize = PORTS_OFFSET + MAX_PORTS * PORT_RECORD_LEN;

// Port record fields.
const PORT_ID: usize = 0x00;
const PORT_DISPLAY_NAME: usize = 0x04;
const PORT_UNIT: usize = 0x08;
const PORT_MIN: usize = 0x0C;
const PORT_MAX: usize = 0x14;
const PORT_STEP: usize = 0x1C;
const PORT_CHOICES: usize = 0x24;
const PORT_FLAGS: usize = 0x28;
const PORT_VALUE: usize = 0x2C;
const PORT_EXPRESSION: usize = 0x34;
const PORT_TRANSFORM_WRITE: usize = 0x38;
const PORT_TRANSFORM_READ: usize = 0x3C;
const PORT_SAMPLING_INTERVAL: usize = 0x40;
const PORT_OWNER: usize = 0x44;
const PORT_ORDINAL: usize = 0x45;
const PORT_EXTRA: usize = 0x48;

// Peripheral record fields.
const PERIPHERAL_TYPE: usize = 0x00;
const PERIPHERAL_FLAGS: usize = 0x02;
const PERIPHERAL_PARAMS: usize = 0x08;

fn invalid(reason: impl Into<alloc::borrow::Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::InvalidConfig, reason)
}

/// Storage for the configuration image.
///
/// Wear levelling and atomicity are up to the implementation.
pub trait ConfigStore {
    /// Loads the image, `None` if nothing was saved yet.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Storage`] when the storage is unreadable.
    fn load(&mut self) -> Result<Option<Vec<u8>>>;

    /// Replaces the image.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Storage`] when the storage is unwritable.
    fn save(&mut self, image: &[u8]) -> Result<()>;

    /// Erases the image.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Storage`] when the storage is unwritable.
    fn erase(&mut self) -> Result<()>;
}

/// An in-memory [`ConfigStore`].
///
/// Clones share the same image, so a test can inspect what a device saved.
#[derive(Debug, Clone, Default)]
pub struct RamStore(Rc<RefCell<Option<Vec<u8>>>>);

impl RamStore {
    /// Creates an empty [`RamStore`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the stored image.
    #[must_use]
    pub fn image(&self) -> Option<Vec<u8>> {
        self.0.borrow().clone()
    }
}

impl ConfigStore for RamStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.0.borrow().clone())
    }

    fn save(&mut self, image: &[u8]) -> Result<()> {
        *self.0.borrow_mut() = Some(image.to_vec());
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        *self.0.borrow_mut() = None;
        Ok(())
    }
}

// An append-only table of deduplicated strings.
struct StringTable {
    bytes: Vec<u8>,
}

impl StringTable {
    fn new() -> Self {
        // Offset 0 is reserved for "no string".
        Self { bytes: vec![0] }
    }

    fn add(&mut self, value: Option<&str>) -> Result<u32> {
        let Some(value) = value.filter(|value| !value.is_empty()) else {
            return Ok(0);
        };

        if value.contains('\0') {
            return Err(invalid(format!("string `{value}` contains a NUL byte")));
        }

        let mut offset = 1;
        while offset < self.bytes.len() {
            let end = self.bytes[offset..]
                .iter()
                .position(|b| *b == 0)
                .map_or(self.bytes.len(), |len| offset + len);
            if &self.bytes[offset..end] == value.as_bytes() {
                return to_offset(offset);
            }
            offset = end + 1;
        }

        let offset = self.bytes.len();
        self.bytes.extend_from_slice(value.as_bytes());
        self.bytes.push(0);
        to_offset(offset)
    }
}

fn to_offset(offset: usize) -> Result<u32> {
    u32::try_from(offset).map_err(|_| invalid("string table too large"))
}

fn read_string(table: &[u8], offset: u32) -> Result<Option<String>> {
    if offset == 0 {
        return Ok(None);
    }

    let start = usize::try_from(offset).map_err(|_| invalid("string offset too large"))?;
    let tail = table
        .get(start..)
        .ok_or_else(|| invalid(format!("string offset {offset} out of the table")))?;
    let len = tail
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| invalid(format!("unterminated string at {offset}")))?;

    core::str::from_utf8(&tail[..len])
        .map(|value| Some(value.to_string()))
        .map_err(|_| invalid(format!("string at {offset} is not UTF-8")))
}

fn encode_choices(choices: &[Choice]) -> Option<String> {
    if choices.is_empty() {
        return None;
    }

    let encoded = choices
        .iter()
        .map(|choice| match &choice.display_name {
            Some(name) => format!("{}:{}", choice.value, escape_choice(name)),
            None => choice.value.to_string(),
        })
        .collect::<Vec<_>>()
        .join("|");
    Some(encoded)
}

// Display names may hold the separator, escaped with a backslash.
fn escape_choice(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, '|' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn split_choices(encoded: &str) -> Vec<String> {
    let mut entries = vec![String::new()];
    let mut chars = encoded.chars();
    while let Some(c) = chars.next() {
        let Some(entry) = entries.last_mut() else {
            break;
        };
        match c {
            '\\' => entry.extend(chars.next()),
            '|' => entries.push(String::new()),
            c => entry.push(c),
        }
    }
    entries
}

fn decode_choices(encoded: &str) -> Result<Vec<Choice>> {
    split_choices(encoded)
        .into_iter()
        .map(|entry| {
            let (value, name) = match entry.split_once(':') {
                Some((value, name)) => (value, Some(name.to_string())),
                None => (entry.as_str(), None),
            };
            let value = value
                .parse::<f64>()
                .map_err(|_| invalid(format!("invalid choice `{entry}`")))?;
            Ok(Choice {
                value,
                display_name: name,
            })
        })
        .collect()
}

#[inline]
fn optional(value: Option<f64>) -> f64 {
    value.unwrap_or(f64::NAN)
}

#[inline]
fn defined(value: f64) -> Option<f64> {
    (!is_undefined(value)).then_some(value)
}

/// The persisted state of a port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortRecord {
    /// Port identifier.
    pub id: String,
    /// Name shown to users.
    pub display_name: Option<String>,
    /// Measurement unit.
    pub unit: Option<String>,
    /// Minimum value.
    pub min: Option<f64>,
    /// Maximum value.
    pub max: Option<f64>,
    /// Step.
    pub step: Option<f64>,
    /// Allowed values.
    pub choices: Vec<Choice>,
    /// Flags.
    pub flags: PortFlags,
    /// Last value, meaningful for persisted ports only.
    pub value: f64,
    /// Value expression.
    pub expression: Option<String>,
    /// Write transform.
    pub transform_write: Option<String>,
    /// Read transform.
    pub transform_read: Option<String>,
    /// Sampling interval.
    pub sampling_interval: u32,
    /// Index of the owning peripheral.
    pub owner: Option<u8>,
    /// Position among the ports of the owning peripheral.
    pub ordinal: u8,
    /// Driver-defined data.
    pub extra: [u8; EXTRA_LEN],
}

impl PortRecord {
    /// Captures the persisted state of a port.
    #[must_use]
    pub fn from_port(data: &PortData) -> Self {
        let source = |expression: &Option<Expression>| {
            expression
                .as_ref()
                .map(|expression| expression.source().to_string())
        };

        Self {
            id: data.id.clone(),
            display_name: data.display_name.clone(),
            unit: data.unit.clone(),
            min: data.min,
            max: data.max,
            step: data.step,
            choices: data.choices.clone(),
            flags: data.flags.difference(PortFlags::SET),
            value: data.value,
            expression: source(&data.expression),
            transform_write: source(&data.transform_write),
            transform_read: source(&data.transform_read),
            sampling_interval: data.sampling.interval,
            owner: data.peripheral,
            ordinal: data.ordinal,
            extra: data.extra,
        }
    }

    /// Restores the persisted state into a port.
    ///
    /// Unless `full` is set, the type and constraints stay those of the
    /// driver and only the user-modifiable state is restored. Expressions
    /// are parsed but not checked against other ports.
    pub fn apply(&self, data: &mut PortData, full: bool) {
        data.id.clone_from(&self.id);
        data.display_name.clone_from(&self.display_name);
        data.unit.clone_from(&self.unit);
        data.extra = self.extra;

        let keep = if full {
            PortFlags::SET
        } else {
            PortFlags::STATIC | PortFlags::SET
        };
        data.flags = (data.flags & keep) | (self.flags & !keep);

        if full {
            data.min = self.min;
            data.max = self.max;
            data.step = self.step;
            data.choices.clone_from(&self.choices);
        }

        if data.is_persisted() && !is_undefined(self.value) {
            data.value = self.value;
            data.flags.insert(PortFlags::SET);
        }

        let sampling = &mut data.sampling;
        if sampling.default > 0
            && (sampling.min..=sampling.max).contains(&self.sampling_interval)
        {
            sampling.interval = self.sampling_interval;
        }

        let parse = |source: &Option<String>| {
            source.as_deref().and_then(|source| match Expression::parse(source) {
                Ok(expression) => Some(expression),
                Err(e) => {
                    log::warn!("Port `{}`: stored expression dropped: {e}", self.id);
                    None
                }
            })
        };
        data.expression = parse(&self.expression);
        data.transform_write = parse(&self.transform_write);
        data.transform_read = parse(&self.transform_read);
    }

    fn write(&self, record: &mut [u8], strings: &mut StringTable) -> Result<()> {
        put_u32(record, PORT_ID, strings.add(Some(&self.id))?);
        put_u32(record, PORT_DISPLAY_NAME, strings.add(self.display_name.as_deref())?);
        put_u32(record, PORT_UNIT, strings.add(self.unit.as_deref())?);
        put_f64(record, PORT_MIN, optional(self.min));
        put_f64(record, PORT_MAX, optional(self.max));
        put_f64(record, PORT_STEP, optional(self.step));
        let choices = encode_choices(&self.choices);
        put_u32(record, PORT_CHOICES, strings.add(choices.as_deref())?);
        put_u32(record, PORT_FLAGS, self.flags.bits());
        put_f64(record, PORT_VALUE, self.value);
        put_u32(record, PORT_EXPRESSION, strings.add(self.expression.as_deref())?);
        put_u32(
            record,
            PORT_TRANSFORM_WRITE,
            strings.add(self.transform_write.as_deref())?,
        );
        put_u32(
            record,
            PORT_TRANSFORM_READ,
            strings.add(self.transform_read.as_deref())?,
        );
        put_u32(record, PORT_SAMPLING_INTERVAL, self.sampling_interval);
        record[PORT_OWNER] = self.owner.map_or(0, |index| index + 1);
        record[PORT_ORDINAL] = self.ordinal;
        record[PORT_EXTRA..PORT_EXTRA + EXTRA_LEN].copy_from_slice(&self.extra);
        Ok(())
    }

    fn read(record: &[u8], strings: &[u8]) -> Result<Option<Self>> {
        let Some(id) = read_string(strings, get_u32(record, PORT_ID))? else {
            return Ok(None);
        };

        let string = |offset| read_string(strings, get_u32(record, offset));
        let choices = match string(PORT_CHOICES)? {
            Some(encoded) => decode_choices(&encoded)?,
            None => Vec::new(),
        };

        let mut extra = [0; EXTRA_LEN];
        extra.copy_from_slice(&record[PORT_EXTRA..PORT_EXTRA + EXTRA_LEN]);

        Ok(Some(Self {
            id,
            display_name: string(PORT_DISPLAY_NAME)?,
            unit: string(PORT_UNIT)?,
            min: defined(get_f64(record, PORT_MIN)),
            max: defined(get_f64(record, PORT_MAX)),
            step: defined(get_f64(record, PORT_STEP)),
            choices,
            flags: PortFlags::from_bits_truncate(get_u32(record, PORT_FLAGS)),
            value: get_f64(record, PORT_VALUE),
            expression: string(PORT_EXPRESSION)?,
            transform_write: string(PORT_TRANSFORM_WRITE)?,
            transform_read: string(PORT_TRANSFORM_READ)?,
            sampling_interval: get_u32(record, PORT_SAMPLING_INTERVAL),
            owner: record[PORT_OWNER].checked_sub(1),
            ordinal: record[PORT_ORDINAL],
            extra,
        }))
    }
}

/// The persisted state of a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeripheralRecord {
    /// Driver type, never zero.
    pub type_id: u16,
    /// Driver-defined flags.
    pub flags: u16,
    /// Parameter block.
    pub params: ParamBlock,
}

impl PeripheralRecord {
    fn write(&self, record: &mut [u8]) {
        put_u16(record, PERIPHERAL_TYPE, self.type_id);
        put_u16(record, PERIPHERAL_FLAGS, self.flags);
        record[PERIPHERAL_PARAMS..PERIPHERAL_PARAMS + PARAMS_LEN]
            .copy_from_slice(self.params.as_bytes());
    }

    fn read(record: &[u8]) -> Option<Self> {
        let type_id = get_u16(record, PERIPHERAL_TYPE);
        if type_id == 0 {
            return None;
        }

        let mut params = [0; PARAMS_LEN];
        params.copy_from_slice(&record[PERIPHERAL_PARAMS..PERIPHERAL_PARAMS + PARAMS_LEN]);

        Some(Self {
            type_id,
            flags: get_u16(record, PERIPHERAL_FLAGS),
            params: ParamBlock::from_bytes(params),
        })
    }
}

/// The whole persisted configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigImage {
    /// Peripheral records, indexed by peripheral index.
    pub peripherals: [Option<PeripheralRecord>; MAX_PERIPHERALS],
    /// Port records, indexed by slot.
    pub ports: [Option<PortRecord>; MAX_PORTS],
}

impl Default for ConfigImage {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigImage {
    /// Creates an empty [`ConfigImage`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            peripherals: [None; MAX_PERIPHERALS],
            ports: core::array::from_fn(|_| None),
        }
    }

    /// Serializes the image.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InvalidConfig`] if a string contains a NUL
    /// byte.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut image = vec![0; STRINGS_OFFSET];
        let mut strings = StringTable::new();

        image[..4].copy_from_slice(&MAGIC);
        put_u16(&mut image, 4, VERSION);

        for (index, record) in self.peripherals.iter().enumerate() {
            if let Some(record) = record {
                let start = PERIPHERALS_OFFSET + index * PERIPHERAL_RECORD_LEN;
                record.write(&mut image[start..start + PERIPHERAL_RECORD_LEN]);
            }
        }

        for (slot, record) in self.ports.iter().enumerate() {
            if let Some(record) = record {
                let start = PORTS_OFFSET + slot * PORT_RECORD_LEN;
                record.write(&mut image[start..start + PORT_RECORD_LEN], &mut strings)?;
            }
        }

        put_u32(&mut image, 8, to_offset(strings.bytes.len())?);
        image.extend_from_slice(&strings.bytes);

        Ok(image)
    }

    /// Deserializes an image.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InvalidConfig`] on a wrong magic number or
    /// version, or a truncated image. A port record with a malformed string
    /// is dropped with a warning.
    pub fn decode(image: &[u8]) -> Result<Self> {
        if image.len() < STRINGS_OFFSET || image[..4] != MAGIC {
            return Err(invalid("not a configuration image"));
        }

        let version = get_u16(image, 4);
        if version != VERSION {
            return Err(invalid(format!("unsupported image version {version}")));
        }

        let strings_len = usize::try_from(get_u32(image, 8))
            .map_err(|_| invalid("string table too large"))?;
        let strings = image
            .get(STRINGS_OFFSET..STRINGS_OFFSET + strings_len)
            .ok_or_else(|| invalid("truncated string table"))?;

        let mut config = Self::new();

        for (index, slot) in config.peripherals.iter_mut().enumerate() {
            let start = PERIPHERALS_OFFSET + index * PERIPHERAL_RECORD_LEN;
            *slot = PeripheralRecord::read(&image[start..start + PERIPHERAL_RECORD_LEN]);
        }

        for (index, slot) in config.ports.iter_mut().enumerate() {
            let start = PORTS_OFFSET + index * PORT_RECORD_LEN;
            *slot = PortRecord::read(&image[start..start + PORT_RECORD_LEN], strings)
                .unwrap_or_else(|e| {
                    log::warn!("Port record {index} dropped: {e}");
                    None
                });
        }

        Ok(config)
    }
}
