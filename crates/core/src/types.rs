use std::fmt;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Opaque handle to an object owned by the host. The engine never looks inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub u32);

/// Any datum that can sit on a port or cross the VM boundary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Int8(i8),
    Uint8(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    ObjectRef(ObjectHandle),
}

/// Type tag of a [`Value`]. The numeric tag is the one written into VM slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float,
    Double,
    String,
    Array,
    ObjectRef,
}

impl ValueKind {
    pub fn tag(self) -> u8 {
        match self {
            Self::Undefined => 0,
            Self::Null => 1,
            Self::Boolean => 2,
            Self::Int8 => 3,
            Self::Uint8 => 4,
            Self::Int16 => 5,
            Self::Uint16 => 6,
            Self::Int32 => 7,
            Self::Uint32 => 8,
            Self::Int64 => 9,
            Self::Uint64 => 10,
            Self::Float => 11,
            Self::Double => 12,
            Self::String => 13,
            Self::Array => 14,
            Self::ObjectRef => 16,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Uint8
                | Self::Int16
                | Self::Uint16
                | Self::Int32
                | Self::Uint32
                | Self::Int64
                | Self::Uint64
        )
    }
}

impl TryFrom<u8> for ValueKind {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => Self::Undefined,
            1 => Self::Null,
            2 => Self::Boolean,
            3 => Self::Int8,
            4 => Self::Uint8,
            5 => Self::Int16,
            6 => Self::Uint16,
            7 => Self::Int32,
            8 => Self::Uint32,
            9 => Self::Int64,
            10 => Self::Uint64,
            11 => Self::Float,
            12 => Self::Double,
            13 => Self::String,
            14 => Self::Array,
            16 => Self::ObjectRef,
            other => bail!("unknown value tag: {other}"),
        })
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Undefined => ValueKind::Undefined,
            Self::Null => ValueKind::Null,
            Self::Boolean(_) => ValueKind::Boolean,
            Self::Int8(_) => ValueKind::Int8,
            Self::Uint8(_) => ValueKind::Uint8,
            Self::Int16(_) => ValueKind::Int16,
            Self::Uint16(_) => ValueKind::Uint16,
            Self::Int32(_) => ValueKind::Int32,
            Self::Uint32(_) => ValueKind::Uint32,
            Self::Int64(_) => ValueKind::Int64,
            Self::Uint64(_) => ValueKind::Uint64,
            Self::Float(_) => ValueKind::Float,
            Self::Double(_) => ValueKind::Double,
            Self::String(_) => ValueKind::String,
            Self::Array(_) => ValueKind::Array,
            Self::ObjectRef(_) => ValueKind::ObjectRef,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Integer view of any integer variant. Floats are not truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Int8(v) => Some(v.into()),
            Self::Uint8(v) => Some(v.into()),
            Self::Int16(v) => Some(v.into()),
            Self::Uint16(v) => Some(v.into()),
            Self::Int32(v) => Some(v.into()),
            Self::Uint32(v) => Some(v.into()),
            Self::Int64(v) => Some(v),
            Self::Uint64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Float(v) => Some(v.into()),
            Self::Double(v) => Some(v),
            Self::Uint64(v) => Some(v as f64),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Boolean(v) => *v,
            Self::String(v) => !v.is_empty(),
            Self::Array(_) | Self::ObjectRef(_) => true,
            other => other.as_f64().is_some_and(|v| v != 0.0),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int32(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int8(v) => write!(f, "{v}"),
            Self::Uint8(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::Uint16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Uint32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Uint64(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::ObjectRef(handle) => write!(f, "object#{}", handle.0),
        }
    }
}

/// Port type identifier for connection validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    Any,
    Boolean,
    Integer,
    Float,
    Str,
    Array,
    Object,
}

impl PortType {
    pub fn is_compatible(&self, other: &PortType) -> bool {
        self == other || *self == PortType::Any || *other == PortType::Any
    }

    pub fn accepts(&self, kind: ValueKind) -> bool {
        match self {
            Self::Any => true,
            Self::Boolean => kind == ValueKind::Boolean,
            Self::Integer => kind.is_integer(),
            Self::Float => matches!(kind, ValueKind::Float | ValueKind::Double),
            Self::Str => kind == ValueKind::String,
            Self::Array => kind == ValueKind::Array,
            Self::Object => kind == ValueKind::ObjectRef,
        }
    }
}
