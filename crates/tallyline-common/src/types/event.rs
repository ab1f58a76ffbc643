//! Usage events and their dynamically-typed property bag
//!
//! Event properties arrive as a flat JSON object whose values may be integers,
//! floats, numeric strings or arbitrary strings. [`PropertyValue`] closes that
//! set into a sum type with a total coercion to [`Decimal`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A single event property value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Arbitrary-precision numeric literal carried as text (e.g. a JSON number
    /// that must not round-trip through f64)
    Number(String),
    String(String),
    /// Null, arrays and objects: kept for display, never numeric
    Structured(serde_json::Value),
}

/// Why a property value could not become a decimal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoercionError {
    /// Text that is not a decimal literal
    Unparsable(String),
    /// A type with no numeric meaning (bool, null, array, object)
    NonNumeric(&'static str),
}

impl fmt::Display for CoercionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoercionError::Unparsable(v) => write!(f, "cannot parse {:?} as decimal", v),
            CoercionError::NonNumeric(kind) => write!(f, "{} values are not numeric", kind),
        }
    }
}

impl PropertyValue {
    /// Name of the variant, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::UInt(_) => "uint",
            PropertyValue::Float(_) => "float",
            PropertyValue::Number(_) => "number",
            PropertyValue::String(_) => "string",
            PropertyValue::Structured(serde_json::Value::Null) => "null",
            PropertyValue::Structured(serde_json::Value::Array(_)) => "array",
            PropertyValue::Structured(_) => "object",
        }
    }

    /// Coerce to a decimal without going through binary floating point for
    /// anything that arrived as text.
    ///
    /// Floats use their shortest round-trip representation, so `0.1f64`
    /// becomes exactly `0.1`.
    pub fn to_decimal(&self) -> Result<Decimal, CoercionError> {
        match self {
            PropertyValue::Int(v) => Ok(Decimal::from(*v)),
            PropertyValue::UInt(v) => Ok(Decimal::from(*v)),
            PropertyValue::Float(v) => parse_decimal(&v.to_string()),
            PropertyValue::Number(s) | PropertyValue::String(s) => parse_decimal(s.trim()),
            other => Err(CoercionError::NonNumeric(other.kind())),
        }
    }
}

fn parse_decimal(text: &str) -> Result<Decimal, CoercionError> {
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|_| CoercionError::Unparsable(text.to_string()))
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::UInt(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Number(s) | PropertyValue::String(s) => f.write_str(s),
            PropertyValue::Structured(v) => write!(f, "{}", v),
        }
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(b) => PropertyValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PropertyValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    PropertyValue::UInt(u)
                } else {
                    // The literal as written; serde_json keeps it with arbitrary_precision
                    PropertyValue::Number(n.to_string())
                }
            }
            serde_json::Value::String(s) => PropertyValue::String(s),
            other => PropertyValue::Structured(other),
        }
    }
}

impl From<&PropertyValue> for serde_json::Value {
    fn from(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Bool(b) => serde_json::Value::Bool(*b),
            PropertyValue::Int(i) => serde_json::Value::from(*i),
            PropertyValue::UInt(u) => serde_json::Value::from(*u),
            PropertyValue::Float(f) => serde_json::Value::from(*f),
            PropertyValue::Number(s) => serde_json::Number::from_str(s)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|_| serde_json::Value::String(s.clone())),
            PropertyValue::String(s) => serde_json::Value::String(s.clone()),
            PropertyValue::Structured(v) => v.clone(),
        }
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_json::Value::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(PropertyValue::from)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

/// Immutable usage event as ingested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event ID (unique per tenant)
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    /// Internal customer ID, filled in by the pipeline when absent
    #[serde(default)]
    pub customer_id: String,
    pub external_customer_id: String,
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
    /// Ingestion source (sdk, api, import...)
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Event {
    /// Create a new event with no properties
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        external_customer_id: impl Into<String>,
        event_name: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            environment_id: String::new(),
            customer_id: String::new(),
            external_customer_id: external_customer_id.into(),
            event_name: event_name.into(),
            timestamp,
            source: String::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Set environment
    pub fn with_environment(mut self, environment_id: impl Into<String>) -> Self {
        self.environment_id = environment_id.into();
        self
    }

    /// Set ingestion source
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Partition key keeping one customer's events on one partition
    pub fn partition_key(&self) -> String {
        if self.external_customer_id.is_empty() {
            self.tenant_id.clone()
        } else {
            format!("{}:{}", self.tenant_id, self.external_customer_id)
        }
    }
}
