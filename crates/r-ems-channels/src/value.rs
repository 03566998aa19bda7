//! ---
//! ems_section: "04-field-device-channels"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel registry, device sampling, and driver contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::locator::ChannelLocator;

/// Logical value carried by a channel.
///
/// Equality is by representation: floats compare bit for bit with every NaN
/// equal to every other NaN, so a sensor stuck at NaN is not "changed".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    ByteArray(Vec<u8>),
}

impl Value {
    /// Numeric view of the value; booleans map to 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Integer(v) => Some(f64::from(*v)),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            Value::String(_) | Value::ByteArray(_) => None,
        }
    }

    /// Integral view of the value; floating point values are truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Boolean(v) => Some(i64::from(*v)),
            Value::Integer(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            Value::Double(v) => Some(*v as i64),
            Value::String(_) | Value::ByteArray(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            other => other.as_i64().map(|v| v != 0),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::ByteArray(_) => "byte_array",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => {
                a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
            }
            (Value::Double(a), Value::Double(b)) => {
                a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::ByteArray(a), Value::ByteArray(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::ByteArray(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::ByteArray(v)
    }
}

/// Quality flag attached to every sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    #[default]
    Good,
    Bad,
}

/// A value as observed at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledValue {
    pub value: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub quality: Quality,
}

impl SampledValue {
    pub fn good(value: impl Into<Value>, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: Some(value.into()),
            timestamp,
            quality: Quality::Good,
        }
    }

    pub fn bad(timestamp: DateTime<Utc>) -> Self {
        Self {
            value: None,
            timestamp,
            quality: Quality::Bad,
        }
    }

    /// BAD sample stamped with the current wall-clock time.
    pub fn bad_now() -> Self {
        Self::bad(Utc::now())
    }

    pub fn is_good(&self) -> bool {
        self.quality == Quality::Good
    }

    /// Whether this sample should raise a "changed" event relative to `previous`.
    ///
    /// Timestamps are ignored; only the logical value and the quality count.
    pub fn differs_from(&self, previous: Option<&SampledValue>) -> bool {
        match previous {
            None => true,
            Some(previous) => self.value != previous.value || self.quality != previous.quality,
        }
    }
}

/// Batch element pairing a channel with a sample, used for pushed deliveries and events.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledValueContainer {
    pub locator: ChannelLocator,
    pub sample: SampledValue,
}

impl SampledValueContainer {
    pub fn new(locator: ChannelLocator, sample: SampledValue) -> Self {
        Self { locator, sample }
    }
}

/// Batch element for driver writes.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueContainer {
    pub locator: ChannelLocator,
    pub value: Value,
}

impl ValueContainer {
    pub fn new(locator: ChannelLocator, value: impl Into<Value>) -> Self {
        Self {
            locator,
            value: value.into(),
        }
    }
}
