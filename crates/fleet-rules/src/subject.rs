//! Values rules are evaluated against.

use crate::version::KernelVersion;
use serde_json::Value;

/// A field value as seen by the rule engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Scalar(String),
    List(Vec<String>),
}

impl FieldValue {
    /// Convert a JSON value. `null` and objects carry no comparable value.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null | Value::Object(_) => None,
            Value::Array(items) => Some(FieldValue::List(
                items.iter().filter_map(scalar_string).collect(),
            )),
            other => scalar_string(other).map(FieldValue::Scalar),
        }
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            FieldValue::Scalar(s) => Some(s),
            FieldValue::List(_) => None,
        }
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Anything the rule engine can inspect.
pub trait RuleSubject {
    /// Look up a field by rule key.
    fn field(&self, key: &str) -> Option<FieldValue>;

    /// Kernel version of the revision this subject was built from.
    fn kernel_version(&self) -> Option<KernelVersion>;
}

/// Plain JSON objects are subjects too; handy for tests and ad hoc checks.
impl RuleSubject for Value {
    fn field(&self, key: &str) -> Option<FieldValue> {
        self.get(key).and_then(FieldValue::from_json)
    }

    fn kernel_version(&self) -> Option<KernelVersion> {
        self.get("version")
            .and_then(|v| KernelVersion::from_json(v).ok())
    }
}
