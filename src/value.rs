use std::fmt;

use bytes::Bytes;

use crate::collection::Collection;
use crate::errors::{Error, Result};

/// Wire-level database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum UType {
    Null,
    Char,
    String,
    Short,
    Int,
    Bigint,
    Float,
    Double,
    Numeric,
    Date,
    Time,
    Timestamp,
    Datetime,
    Object,
    Set,
    Multiset,
    Sequence,
    Blob,
    Clob,
    Bit,
}

impl UType {
    pub fn is_collection(&self) -> bool {
        matches!(self, UType::Set | UType::Multiset | UType::Sequence)
    }
}

/// A reference to a server-side object instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Oid {
    pub volume: i16,
    pub page: i32,
    pub slot: i16,
}

impl Oid {
    pub fn parse(s: &str) -> Result<Self> {
        let body = s.strip_prefix('@').ok_or(Error::CasObject)?;
        let mut parts = body.split('|');
        let volume = parts.next().and_then(|p| p.parse().ok());
        let page = parts.next().and_then(|p| p.parse().ok());
        let slot = parts.next().and_then(|p| p.parse().ok());
        match (volume, page, slot, parts.next()) {
            (Some(volume), Some(page), Some(slot), None) => Ok(Oid { volume, page, slot }),
            _ => Err(Error::CasObject),
        }
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}|{}|{}", self.volume, self.page, self.slot)
    }
}

/// A decoded column or parameter value.
///
/// Conversions between native and wire forms happen in the protocol layer;
/// the driver core only dispatches on this decoded representation.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    Oid(Oid),
    Collection(Collection),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Float(v) => Ok(*v as i64),
            Value::Str(s) => s.trim().parse().map_err(|_| Error::TypeConversion),
            _ => Err(Error::TypeConversion),
        }
    }

    pub fn as_i32(&self) -> Result<i32> {
        i32::try_from(self.as_i64()?).map_err(|_| Error::TypeConversion)
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Int(v) => Ok(*v as f64),
            Value::Float(v) => Ok(*v),
            Value::Str(s) => s.trim().parse().map_err(|_| Error::TypeConversion),
            _ => Err(Error::TypeConversion),
        }
    }

    pub fn as_string(&self) -> Result<String> {
        match self {
            Value::Null => Err(Error::TypeConversion),
            Value::Int(v) => Ok(v.to_string()),
            Value::Float(v) => Ok(v.to_string()),
            Value::Str(s) => Ok(s.clone()),
            Value::Bytes(b) => Ok(b.iter().map(|b| format!("{b:02X}")).collect()),
            Value::Oid(oid) => Ok(oid.to_string()),
            Value::Collection(_) => Err(Error::TypeConversion),
        }
    }

    pub fn as_bytes(&self) -> Result<Bytes> {
        match self {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Str(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            _ => Err(Error::TypeConversion),
        }
    }

    pub fn as_oid(&self) -> Result<Oid> {
        match self {
            Value::Oid(oid) => Ok(*oid),
            Value::Str(s) => Oid::parse(s),
            _ => Err(Error::TypeConversion),
        }
    }

    pub fn as_collection(&self) -> Result<&Collection> {
        match self {
            Value::Collection(c) => Ok(c),
            _ => Err(Error::TypeConversion),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Oid> for Value {
    fn from(v: Oid) -> Self {
        Value::Oid(v)
    }
}

impl From<Collection> for Value {
    fn from(v: Collection) -> Self {
        Value::Collection(v)
    }
}

/// Binding direction for a statement parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamMode {
    #[default]
    In,
    Out,
    InOut,
}

impl ParamMode {
    pub fn is_out(&self) -> bool {
        matches!(self, ParamMode::Out | ParamMode::InOut)
    }
}

/// One bound parameter slot of a request handle.
#[derive(Debug, Clone, Default)]
pub struct BindValue {
    pub u_type: UType,
    pub value: Value,
    pub mode: ParamMode,
}

impl Default for UType {
    fn default() -> Self {
        UType::Null
    }
}
