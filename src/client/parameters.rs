//! Analyzer parameter mirror
//!
//! On connect the driver enumerates every analyzer parameter name and its
//! value type; the mirror then backs typed get/set calls. Names are matched
//! byte-for-byte (they routinely contain spaces and bracketed units, e.g.
//! `"Maximum Count Rate [kcps]"`), and a parameter's type may not change
//! within a session.
//!
//! The cache is write-through: after a successful set the value is re-read
//! from the server and the cached copy updated, so a read-back always
//! reflects what the hardware accepted.

use super::{ClientError, ProdigyClient};
use crate::protocol::{self, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Declared value type of an analyzer parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Double,
    Integer,
    String,
    Bool,
}

impl ValueType {
    /// Parse the server's `ValueType` token
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "double" => Some(ValueType::Double),
            "integer" => Some(ValueType::Integer),
            "string" => Some(ValueType::String),
            "bool" => Some(ValueType::Bool),
            _ => None,
        }
    }
}

/// A typed analyzer parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Double(f64),
    Integer(i64),
    String(String),
    Bool(bool),
}

impl ParameterValue {
    /// The type this value belongs to
    pub fn value_type(&self) -> ValueType {
        match self {
            ParameterValue::Double(_) => ValueType::Double,
            ParameterValue::Integer(_) => ValueType::Integer,
            ParameterValue::String(_) => ValueType::String,
            ParameterValue::Bool(_) => ValueType::Bool,
        }
    }

    /// Coerce a raw reply value according to the declared type
    pub fn parse(raw: &str, value_type: ValueType) -> Option<Self> {
        match value_type {
            ValueType::Double => raw.parse().ok().map(ParameterValue::Double),
            ValueType::Integer => raw.parse().ok().map(ParameterValue::Integer),
            ValueType::String => Some(ParameterValue::String(raw.to_string())),
            ValueType::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" => Some(ParameterValue::Bool(true)),
                "false" | "0" => Some(ParameterValue::Bool(false)),
                _ => None,
            },
        }
    }

    /// Wire representation for `SetAnalyzerParameterValue`
    pub fn to_wire(&self) -> Value {
        match self {
            ParameterValue::Double(v) => Value::Double(*v),
            ParameterValue::Integer(v) => Value::Integer(*v),
            ParameterValue::String(v) => Value::Quoted(v.clone()),
            ParameterValue::Bool(v) => Value::Bool(*v),
        }
    }

    /// Integer view (integers only)
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ParameterValue::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

/// Mirror entry for one analyzer parameter
#[derive(Debug, Clone)]
pub struct AnalyzerParameter {
    pub value_type: ValueType,
    pub unit: Option<String>,
    /// Last value seen from the server; filled lazily by get, refreshed by set
    pub cached: Option<ParameterValue>,
}

/// Name → (type, cached value) mapping, built at connect
#[derive(Debug, Default)]
pub struct ParameterMirror {
    entries: HashMap<String, AnalyzerParameter>,
}

impl ParameterMirror {
    /// Number of enumerated parameters
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no parameters were enumerated
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declared type of a parameter
    pub fn value_type(&self, name: &str) -> Option<ValueType> {
        self.entries.get(name).map(|p| p.value_type)
    }

    /// Cached value, if any read has happened
    pub fn cached(&self, name: &str) -> Option<&ParameterValue> {
        self.entries.get(name).and_then(|p| p.cached.as_ref())
    }

    /// All enumerated names, unsorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    fn entry(&self, name: &str) -> Result<&AnalyzerParameter, ClientError> {
        self.entries
            .get(name)
            .ok_or_else(|| ClientError::UnknownParameter(name.to_string()))
    }
}

impl ProdigyClient {
    /// Enumerate analyzer parameters and their types
    ///
    /// Issues `GetAllAnalyzerParameterNames`, then one
    /// `GetAnalyzerParameterInfo` per name. Called once right after connect;
    /// the enumeration cost is paid a single time per session.
    pub async fn load_parameters(&mut self) -> Result<(), ClientError> {
        let outcome = self.exchange("GetAllAnalyzerParameterNames", &[]).await?;
        let raw = outcome.require("ParameterNames")?.to_string();
        let names = protocol::parse_string_array(&raw)?;

        let mut entries = HashMap::with_capacity(names.len());
        for name in names {
            let info = self
                .exchange(
                    "GetAnalyzerParameterInfo",
                    &[("ParameterName", Value::Quoted(name.clone()))],
                )
                .await?;
            let type_token = info.require("ValueType")?;
            let value_type =
                ValueType::parse(type_token).ok_or_else(|| ClientError::BadValue {
                    field: "ValueType".to_string(),
                    value: type_token.to_string(),
                })?;
            let unit = info.get("Unit").map(|u| u.to_string());
            debug!(name = %name, value_type = ?value_type, "Enumerated analyzer parameter");
            entries.insert(
                name,
                AnalyzerParameter {
                    value_type,
                    unit,
                    cached: None,
                },
            );
        }

        info!(count = entries.len(), "Analyzer parameters enumerated");
        self.mirror = ParameterMirror { entries };
        Ok(())
    }

    /// The parameter mirror
    pub fn parameters(&self) -> &ParameterMirror {
        &self.mirror
    }

    /// Read an analyzer parameter, coerced to its declared type
    pub async fn get_parameter(&mut self, name: &str) -> Result<ParameterValue, ClientError> {
        let value_type = self.mirror.entry(name)?.value_type;
        let outcome = self
            .exchange(
                "GetAnalyzerParameterValue",
                &[("ParameterName", Value::Quoted(name.to_string()))],
            )
            .await?;
        let raw = outcome.require("Value")?;
        let value =
            ParameterValue::parse(raw, value_type).ok_or_else(|| ClientError::BadValue {
                field: "Value".to_string(),
                value: raw.to_string(),
            })?;
        if let Some(entry) = self.mirror.entries.get_mut(name) {
            entry.cached = Some(value.clone());
        }
        Ok(value)
    }

    /// Read an integer analyzer parameter
    pub async fn get_integer_parameter(&mut self, name: &str) -> Result<i64, ClientError> {
        let value = self.get_parameter(name).await?;
        value.as_integer().ok_or_else(|| ClientError::TypeMismatch {
            name: name.to_string(),
            expected: self.mirror.value_type(name).unwrap_or(ValueType::Integer),
            requested: ValueType::Integer,
        })
    }

    /// Write an analyzer parameter, then read it back
    ///
    /// The value must match the parameter's enumerated type. On success the
    /// returned value is the server's read-back, which also replaces the
    /// cached copy.
    pub async fn set_parameter(
        &mut self,
        name: &str,
        value: ParameterValue,
    ) -> Result<ParameterValue, ClientError> {
        let expected = self.mirror.entry(name)?.value_type;
        if value.value_type() != expected {
            return Err(ClientError::TypeMismatch {
                name: name.to_string(),
                expected,
                requested: value.value_type(),
            });
        }

        self.exchange(
            "SetAnalyzerParameterValue",
            &[
                ("ParameterName", Value::Quoted(name.to_string())),
                ("Value", value.to_wire()),
            ],
        )
        .await?;

        self.get_parameter(name).await
    }
}
