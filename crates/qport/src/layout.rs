//! Packed byte blocks are described by explicit field schemas instead of
//! being reinterpreted in place: a [`Field`] names an offset and a
//! [`Width`], and all accesses go through little-endian conversions.

use crate::error::{Error, ErrorKind, Result};

/// Storage width and signedness of a packed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 16-bit integer.
    I16,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 32-bit integer.
    I32,
    /// 64-bit floating point number.
    F64,
}

impl Width {
    /// Returns the number of bytes occupied by the field.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 => 4,
            Self::F64 => 8,
        }
    }

    /// Returns whether the field holds an integer.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        !matches!(self, Self::F64)
    }

    const fn bounds(self) -> (f64, f64) {
        match self {
            Self::U8 => (0., u8::MAX as f64),
            Self::I8 => (i8::MIN as f64, i8::MAX as f64),
            Self::U16 => (0., u16::MAX as f64),
            Self::I16 => (i16::MIN as f64, i16::MAX as f64),
            Self::U32 => (0., u32::MAX as f64),
            Self::I32 => (i32::MIN as f64, i32::MAX as f64),
            Self::F64 => (f64::MIN, f64::MAX),
        }
    }
}

/// A field at a fixed offset inside a packed byte block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Byte offset from the start of the block.
    pub offset: usize,
    /// Width and signedness.
    pub width: Width,
}

impl Field {
    /// Creates a [`Field`].
    #[must_use]
    pub const fn new(offset: usize, width: Width) -> Self {
        Self { offset, width }
    }

    /// Returns the offset of the first byte after the field.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.width.size()
    }

    /// Reads the field as a number.
    ///
    /// Returns `None` if the field does not fit in the block.
    #[must_use]
    pub fn read(&self, block: &[u8]) -> Option<f64> {
        let bytes = block.get(self.offset..self.end())?;
        Some(match self.width {
            Width::U8 => f64::from(bytes[0]),
            Width::I8 => f64::from(bytes[0] as i8),
            Width::U16 => f64::from(read_u16(bytes)),
            Width::I16 => f64::from(read_u16(bytes) as i16),
            Width::U32 => f64::from(read_u32(bytes)),
            Width::I32 => f64::from(read_u32(bytes) as i32),
            Width::F64 => f64::from_le_bytes(read_array(bytes)),
        })
    }

    /// Writes a number into the field.
    ///
    /// Integer fields truncate the fractional part.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::ParamOverflow`] if the field does not fit in
    /// the block or the value does not fit in the field.
    pub fn write(&self, block: &mut [u8], value: f64) -> Result<()> {
        let end = self.end();
        let len = block.len();
        let bytes = block.get_mut(self.offset..end).ok_or_else(|| {
            Error::new(
                ErrorKind::ParamOverflow,
                alloc::format!("field at {} exceeds a block of {len} bytes", self.offset),
            )
        })?;

        let (low, high) = self.width.bounds();
        if value.is_nan() || value < low || value > high {
            return Err(Error::new(
                ErrorKind::ParamOverflow,
                alloc::format!("{value} does not fit in a {:?} field", self.width),
            ));
        }

        match self.width {
            Width::U8 => bytes[0] = value as u8,
            Width::I8 => bytes[0] = (value as i8) as u8,
            Width::U16 => bytes.copy_from_slice(&(value as u16).to_le_bytes()),
            Width::I16 => bytes.copy_from_slice(&(value as i16).to_le_bytes()),
            Width::U32 => bytes.copy_from_slice(&(value as u32).to_le_bytes()),
            Width::I32 => bytes.copy_from_slice(&(value as i32).to_le_bytes()),
            Width::F64 => bytes.copy_from_slice(&value.to_le_bytes()),
        }

        Ok(())
    }
}

#[inline]
fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut array = [0; N];
    array.copy_from_slice(&bytes[..N]);
    array
}

#[inline]
fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes(read_array(bytes))
}

#[inline]
fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(read_array(bytes))
}

/// Reads a little-endian `u16` at `offset`.
#[inline]
#[must_use]
pub fn get_u16(block: &[u8], offset: usize) -> u16 {
    read_u16(&block[offset..offset + 2])
}

/// Reads a little-endian `u32` at `offset`.
#[inline]
#[must_use]
pub fn get_u32(block: &[u8], offset: usize) -> u32 {
    read_u32(&block[offset..offset + 4])
}

/// Reads a little-endian `f64` at `offset`.
#[inline]
#[must_use]
pub fn get_f64(block: &[u8], offset: usize) -> f64 {
    f64::from_le_bytes(read_array(&block[offset..offset + 8]))
}

/// Writes a little-endian `u16` at `offset`.
#[inline]
pub fn put_u16(block: &mut [u8], offset: usize, value: u16) {
    block[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Writes a little-endian `u32` at `offset`.
#[inline]
pub fn put_u32(block: &mut [u8], offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Writes a little-endian `f64` at `offset`.
#[inline]
pub fn put_f64(block: &mut [u8], offset: usize, value: f64) {
    block[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
