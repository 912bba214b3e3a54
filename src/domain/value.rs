//! The variant type backing `Reading` and `SystemState` values (spec.md
//! §3, design note in §9: "Implementers SHOULD define a closed enum/tagged
//! union... Unknown keys become warnings, not silent bags").

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single published value. Mirrors the `Scalar|List<Scalar>|Mapping`
/// shape from spec.md §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Int(i64),
    Bool(bool),
    Text(String),
    NumList(Vec<f64>),
    Mapping(BTreeMap<String, Value>),
}

impl Value {
    /// Numeric projection used by the filter and by derived-field math;
    /// `None` for non-numeric variants.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}
