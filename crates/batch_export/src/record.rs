//! Telemetry record model carried through the pipeline by the demo and the
//! JSON serializer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Span,
    Log,
    Metric,
}

/// Instrumentation scope that produced a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Scope {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Double(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

/// A finished span, log record or metric point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub kind: SignalKind,
    pub scope: Scope,
    pub name: String,
    #[serde(with = "hex_u128")]
    pub trace_id: u128,
    #[serde(with = "hex_u64")]
    pub span_id: u64,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Sampling decision; unrecorded records are usually filtered out before
    /// export.
    #[serde(skip, default = "recorded_default")]
    pub recorded: bool,
}

fn recorded_default() -> bool {
    true
}

impl TelemetryRecord {
    pub fn new(kind: SignalKind, scope: Scope, name: impl Into<String>) -> Self {
        Self {
            kind,
            scope,
            name: name.into(),
            trace_id: 0,
            span_id: 0,
            start_time_unix_nano: 0,
            end_time_unix_nano: 0,
            attributes: BTreeMap::new(),
            recorded: true,
        }
    }

    pub fn span(scope: Scope, name: impl Into<String>) -> Self {
        Self::new(SignalKind::Span, scope, name)
    }

    pub fn log(scope: Scope, body: impl Into<String>) -> Self {
        Self::new(SignalKind::Log, scope, body)
    }

    pub fn with_ids(mut self, trace_id: u128, span_id: u64) -> Self {
        self.trace_id = trace_id;
        self.span_id = span_id;
        self
    }

    pub fn with_times(mut self, start_unix_nano: u64, end_unix_nano: u64) -> Self {
        self.start_time_unix_nano = start_unix_nano;
        self.end_time_unix_nano = end_unix_nano;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_recorded(mut self, recorded: bool) -> Self {
        self.recorded = recorded;
        self
    }

    pub fn is_recorded(&self) -> bool {
        self.recorded
    }

    pub fn duration_nanos(&self) -> u64 {
        self.end_time_unix_nano
            .saturating_sub(self.start_time_unix_nano)
    }
}

mod hex_u128 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&format_args!("{id:032x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let s = <&str>::deserialize(d)?;
        u128::from_str_radix(s, 16).map_err(de::Error::custom)
    }
}

mod hex_u64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&format_args!("{id:016x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let s = <&str>::deserialize(d)?;
        u64::from_str_radix(s, 16).map_err(de::Error::custom)
    }
}
