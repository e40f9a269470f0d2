use alloc::borrow::Cow;

use serde::Serialize;

/// All possible error kinds.
///
/// Each kind names the precise constraint that was violated, so the API
/// layer can report it to the client without further analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The port is disabled.
    NotEnabled,
    /// The port does not accept writes.
    NotWritable,
    /// The value is not one of the port choices.
    NotInChoices,
    /// The value is lower than the minimum.
    BelowMin,
    /// The value is greater than the maximum.
    AboveMax,
    /// The value must be an integer.
    NotInteger,
    /// The value is not a multiple of the step.
    InvalidStep,
    /// The expression cannot be parsed.
    InvalidExpression,
    /// The expression refers to its own port.
    SelfDependency,
    /// The expression would close a dependency cycle.
    CyclicDependency,
    /// No free slot is left for the port category.
    NoFreeSlot,
    /// No free peripheral index is left.
    TooManyPeripherals,
    /// A value does not fit in its packed field.
    ParamOverflow,
    /// Another port already uses the same identifier.
    DuplicateId,
    /// No port with the given identifier or slot.
    UnknownPort,
    /// No peripheral at the given index.
    UnknownPeripheral,
    /// No driver registered for the peripheral type.
    UnknownPeripheralType,
    /// The port has no attribute with the given name.
    UnknownAttribute,
    /// The attribute cannot be modified.
    AttributeNotModifiable,
    /// The attribute value has a wrong type or violates a constraint.
    InvalidAttributeValue,
    /// The hardware rejected the write.
    WriteFailed,
    /// The sequence arguments are malformed.
    InvalidSequence,
    /// The configuration storage failed.
    Storage,
    /// The stored configuration is malformed.
    InvalidConfig,
}

impl ErrorKind {
    const fn name(self) -> &'static str {
        match self {
            Self::NotEnabled => "Port not enabled",
            Self::NotWritable => "Port not writable",
            Self::NotInChoices => "Value not in choices",
            Self::BelowMin => "Value below minimum",
            Self::AboveMax => "Value above maximum",
            Self::NotInteger => "Value not an integer",
            Self::InvalidStep => "Value does not match step",
            Self::InvalidExpression => "Invalid expression",
            Self::SelfDependency => "Expression depends on its own port",
            Self::CyclicDependency => "Expression creates a dependency cycle",
            Self::NoFreeSlot => "No free port slot",
            Self::TooManyPeripherals => "Too many peripherals",
            Self::ParamOverflow => "Parameter overflow",
            Self::DuplicateId => "Duplicate port identifier",
            Self::UnknownPort => "Unknown port",
            Self::UnknownPeripheral => "Unknown peripheral",
            Self::UnknownPeripheralType => "Unknown peripheral type",
            Self::UnknownAttribute => "Unknown attribute",
            Self::AttributeNotModifiable => "Attribute not modifiable",
            Self::InvalidAttributeValue => "Invalid attribute value",
            Self::WriteFailed => "Write failed",
            Self::InvalidSequence => "Invalid sequence",
            Self::Storage => "Storage error",
            Self::InvalidConfig => "Invalid configuration",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.name().fmt(f)
    }
}

/// A runtime error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Error description.
    pub description: Cow<'static, str>,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

impl core::error::Error for Error {}

impl Error {
    /// Creates an [`Error`].
    #[inline]
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }
}

/// A specialized [`Result`](core::result::Result) type for [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
