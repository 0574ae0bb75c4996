//! Typed views over the raw bytes of one holding register read.
//!
//! Registers are addressed absolutely, every accessor goes through [`Registers::offset_of`]
//! so that a field map pointing outside of its block is caught in exactly one place.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Borrowed register buffer starting at a known register number.
#[derive(Debug, Clone, Copy)]
pub struct Registers<'a> {
    data: &'a [u8],
    start: u16,
}

impl<'a> Registers<'a> {
    pub fn new(data: &'a [u8], start: u16) -> Self {
        Registers { data, start }
    }

    /// First register past the end of the buffer, widened so that a block ending at 65535 fits.
    pub fn end(&self) -> u32 {
        u32::from(self.start) + (self.data.len() / 2) as u32
    }

    /// Byte offset of `register` in the buffer.
    pub fn offset_of(&self, register: u16) -> Result<usize> {
        if register < self.start {
            return Err(self.out_of_range(register, 1));
        }
        Ok(usize::from(register - self.start) * 2)
    }

    fn bytes(&self, register: u16, span: u16) -> Result<&'a [u8]> {
        let offset = self.offset_of(register)?;
        let length = usize::from(span) * 2;
        self.data
            .get(offset..offset + length)
            .ok_or_else(|| self.out_of_range(register, span))
    }

    fn out_of_range(&self, register: u16, span: u16) -> Error {
        Error::OutOfRange {
            register,
            span,
            start: self.start,
            end: u16::try_from(self.end()).unwrap_or(u16::MAX),
        }
    }

    pub fn u16_at(&self, register: u16) -> Result<u16> {
        let bytes = self.bytes(register, 1)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn i16_at(&self, register: u16) -> Result<i16> {
        let bytes = self.bytes(register, 1)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Two consecutive registers, the lower-numbered one holds the most significant half.
    pub fn u32_at(&self, register: u16) -> Result<u32> {
        let bytes = self.bytes(register, 2)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn i32_at(&self, register: u16) -> Result<i32> {
        let bytes = self.bytes(register, 2)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn high_byte_at(&self, register: u16) -> Result<u8> {
        Ok(self.bytes(register, 1)?[0])
    }

    pub fn low_byte_at(&self, register: u16) -> Result<u8> {
        Ok(self.bytes(register, 1)?[1])
    }

    /// Fixed-width string of `length` registers with the trailing run of NUL padding removed.
    ///
    /// Interior NULs are kept as data.
    pub fn ascii_at(&self, register: u16, length: u16) -> Result<String> {
        let bytes = self.bytes(register, length)?;
        let used = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        Ok(bytes[..used].iter().copied().map(char::from).collect())
    }

    pub fn decode(&self, spec: FieldSpec) -> Result<Value> {
        Ok(match spec {
            FieldSpec::U16 { register } => Value::Unsigned(self.u16_at(register)?.into()),
            FieldSpec::I16 { register } => Value::Signed(self.i16_at(register)?.into()),
            FieldSpec::U32 { register } => Value::Unsigned(self.u32_at(register)?.into()),
            FieldSpec::I32 { register } => Value::Signed(self.i32_at(register)?.into()),
            FieldSpec::Ascii { register, length } => Value::Text(self.ascii_at(register, length)?),
            FieldSpec::HighByte { register, signed } => byte_value(self.high_byte_at(register)?, signed),
            FieldSpec::LowByte { register, signed } => byte_value(self.low_byte_at(register)?, signed),
        })
    }
}

fn byte_value(byte: u8, signed: bool) -> Value {
    if signed {
        Value::Signed(i8::from_be_bytes([byte]).into())
    } else {
        Value::Unsigned(byte.into())
    }
}

/// How to extract one named value from a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum FieldSpec {
    U16 {
        register: u16,
    },
    I16 {
        register: u16,
    },
    U32 {
        register: u16,
    },
    I32 {
        register: u16,
    },
    Ascii {
        register: u16,
        length: u16,
    },
    HighByte {
        register: u16,
        #[serde(default)]
        signed: bool,
    },
    LowByte {
        register: u16,
        #[serde(default)]
        signed: bool,
    },
}

impl FieldSpec {
    pub fn register(&self) -> u16 {
        match *self {
            FieldSpec::U16 { register }
            | FieldSpec::I16 { register }
            | FieldSpec::U32 { register }
            | FieldSpec::I32 { register }
            | FieldSpec::Ascii { register, .. }
            | FieldSpec::HighByte { register, .. }
            | FieldSpec::LowByte { register, .. } => register,
        }
    }

    /// Number of registers the field covers.
    pub fn span(&self) -> u16 {
        match *self {
            FieldSpec::U32 { .. } | FieldSpec::I32 { .. } => 2,
            FieldSpec::Ascii { length, .. } => length,
            _ => 1,
        }
    }
}

pub type FieldMap = BTreeMap<String, FieldSpec>;

/// Applies every field of `fields` to `data`, failing on the first field that does not fit.
pub fn decode(data: &[u8], start: u16, fields: &FieldMap) -> Result<BTreeMap<String, Value>> {
    let registers = Registers::new(data, start);
    fields
        .iter()
        .map(|(name, spec)| Ok((name.clone(), registers.decode(*spec)?)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Unsigned(u32),
    Signed(i32),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Unsigned(value) => Some(f64::from(*value)),
            Value::Signed(value) => Some(f64::from(*value)),
            Value::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unsigned(value) => write!(f, "{value}"),
            Value::Signed(value) => write!(f, "{value}"),
            Value::Text(value) => f.write_str(value),
        }
    }
}

/// All fields decoded for one device in one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRecord {
    fields: BTreeMap<String, Value>,
}

impl DeviceRecord {
    /// Unions partial results, later blocks win on duplicate names.
    pub fn merge(partials: impl IntoIterator<Item = BTreeMap<String, Value>>) -> Self {
        let mut fields = BTreeMap::new();
        for partial in partials {
            fields.extend(partial);
        }
        DeviceRecord { fields }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
