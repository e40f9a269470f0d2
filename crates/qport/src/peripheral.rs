use alloc::boxed::Box;
use alloc::format;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::error::{Error, ErrorKind, Result};
use crate::layout::Field;
use crate::port::Port;

/// Maximum number of peripherals.
pub const MAX_PERIPHERALS: usize = 16;

/// Length of a peripheral parameter block.
pub const PARAMS_LEN: usize = 56;

/// The fixed-size parameter block of a peripheral.
///
/// Drivers interpret the block through [`Field`] schemas, so its bytes
/// are persisted unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamBlock([u8; PARAMS_LEN]);

impl Default for ParamBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamBlock {
    /// Creates a zeroed [`ParamBlock`].
    #[must_use]
    pub const fn new() -> Self {
        Self([0; PARAMS_LEN])
    }

    /// Creates a [`ParamBlock`] from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PARAMS_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PARAMS_LEN] {
        &self.0
    }

    /// Reads a field, `0` if it lies outside of the block.
    #[must_use]
    pub fn get(&self, field: Field) -> f64 {
        field.read(&self.0).unwrap_or(0.)
    }

    /// Writes a field.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::ParamOverflow`] if the field lies outside of
    /// the block or the value does not fit in it.
    pub fn set(&mut self, field: Field, value: f64) -> Result<()> {
        field.write(&mut self.0, value)
    }

    /// Writes a field and returns the block, for building defaults.
    ///
    /// # Errors
    ///
    /// Same as [`Self::set`].
    pub fn with(mut self, field: Field, value: f64) -> Result<Self> {
        self.set(field, value)?;
        Ok(self)
    }
}

/// The persisted description of a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeripheralConfig {
    /// Index in the peripheral table.
    pub index: u8,
    /// Driver type.
    pub type_id: u16,
    /// Driver-defined flags.
    pub flags: u16,
    /// Parameter block.
    pub params: ParamBlock,
}

impl PeripheralConfig {
    /// Creates a [`PeripheralConfig`] for a not yet placed peripheral.
    #[must_use]
    pub const fn new(type_id: u16, params: ParamBlock) -> Self {
        Self {
            index: 0,
            type_id,
            flags: 0,
            params,
        }
    }

    /// Sets the driver-defined flags.
    #[must_use]
    pub const fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }
}

/// The hardware-specific behavior of a peripheral.
///
/// The lifecycle is `init`, `make_ports`, then `cleanup` on removal or
/// reconfiguration. A driver may go through it several times: the state
/// allocated by `init` must be released by `cleanup`.
pub trait PeripheralDriver {
    /// Allocates the driver state from the configuration.
    ///
    /// # Errors
    ///
    /// Fails when the parameters cannot be used.
    fn init(&mut self, config: &PeripheralConfig) -> Result<()>;

    /// Produces the ports of the peripheral, in a stable order.
    ///
    /// # Errors
    ///
    /// Fails when the ports cannot be built.
    fn make_ports(&mut self, config: &PeripheralConfig) -> Result<Vec<Port>>;

    /// Releases the driver state.
    ///
    /// Called after every port of the peripheral has been dropped.
    fn cleanup(&mut self) {}
}

/// A registered peripheral.
pub struct Peripheral {
    pub(crate) config: PeripheralConfig,
    pub(crate) driver: Box<dyn PeripheralDriver>,
}

impl core::fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Peripheral")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Peripheral {
    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &PeripheralConfig {
        &self.config
    }
}

/// Builds a driver from a configuration.
pub type PeripheralFactory = Box<dyn FnMut(&PeripheralConfig) -> Result<Box<dyn PeripheralDriver>>>;

/// The known peripheral types.
#[derive(Default)]
pub struct PeripheralTypes {
    factories: HashMap<u16, (&'static str, PeripheralFactory)>,
}

impl core::fmt::Debug for PeripheralTypes {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map()
            .entries(self.factories.iter().map(|(id, (name, _))| (id, name)))
            .finish()
    }
}

impl PeripheralTypes {
    /// Creates an empty [`PeripheralTypes`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers a peripheral type, replacing any previous one with the
    /// same identifier.
    #[must_use]
    pub fn with(
        mut self,
        type_id: u16,
        name: &'static str,
        factory: impl FnMut(&PeripheralConfig) -> Result<Box<dyn PeripheralDriver>> + 'static,
    ) -> Self {
        if let Some((previous, _)) = self.factories.insert(type_id, (name, Box::new(factory))) {
            log::warn!("Peripheral type {type_id} `{previous}` replaced by `{name}`");
        }
        self
    }

    /// Returns the name of a peripheral type.
    #[must_use]
    pub fn name(&self, type_id: u16) -> Option<&'static str> {
        self.factories.get(&type_id).map(|(name, _)| *name)
    }

    pub(crate) fn create(&mut self, config: &PeripheralConfig) -> Result<Box<dyn PeripheralDriver>> {
        let (_, factory) = self.factories.get_mut(&config.type_id).ok_or_else(|| {
            Error::new(
                ErrorKind::UnknownPeripheralType,
                format!("no driver for peripheral type {}", config.type_id),
            )
        })?;
        factory(config)
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    use crate::error::{ErrorKind, Result};
    use crate::layout::{Field, Width};
    use crate::port::Port;

    use super::{ParamBlock, PeripheralConfig, PeripheralDriver, PeripheralTypes};

    const RATE: Field = Field::new(0, Width::U16);
    const FACTOR: Field = Field::new(8, Width::F64);

    struct Nothing;

    impl PeripheralDriver for Nothing {
        fn init(&mut self, _config: &PeripheralConfig) -> Result<()> {
            Ok(())
        }

        fn make_ports(&mut self, _config: &PeripheralConfig) -> Result<Vec<Port>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_param_block() {
        let params = ParamBlock::new()
            .with(RATE, 9600.)
            .and_then(|p| p.with(FACTOR, 0.25))
            .unwrap();

        assert_eq!(params.get(RATE), 9600.);
        assert_eq!(params.get(FACTOR), 0.25);
        assert_eq!(&params.as_bytes()[..2], &9600u16.to_le_bytes());

        let err = ParamBlock::new()
            .with(Field::new(52, Width::F64), 1.)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParamOverflow);
    }

    #[test]
    fn test_types() {
        let mut types = PeripheralTypes::new().with(7, "nothing", |_| Ok(Box::new(Nothing)));
        assert_eq!(types.name(7), Some("nothing"));

        assert!(types.create(&PeripheralConfig::new(7, ParamBlock::new())).is_ok());

        let err = types
            .create(&PeripheralConfig::new(8, ParamBlock::new()))
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::UnknownPeripheralType);
    }
}
