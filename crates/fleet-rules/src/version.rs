//! Kernel version bounds.

use crate::error::RuleError;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A `major.minor` kernel version, ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion {
    pub version: u32,
    pub patchlevel: u32,
}

impl KernelVersion {
    pub fn new(version: u32, patchlevel: u32) -> Self {
        Self {
            version,
            patchlevel,
        }
    }

    /// Parse either `"6.1"` or `{"version": 6, "patchlevel": 1}`.
    pub fn from_json(value: &Value) -> Result<Self, RuleError> {
        match value {
            Value::String(s) => s.parse(),
            Value::Object(map) => {
                let field = |name: &str| -> Result<u32, RuleError> {
                    match map.get(name) {
                        Some(Value::Number(n)) => n
                            .as_u64()
                            .and_then(|n| u32::try_from(n).ok())
                            .ok_or_else(|| RuleError::InvalidVersion(value.to_string())),
                        Some(Value::String(s)) => s
                            .trim()
                            .parse()
                            .map_err(|_| RuleError::InvalidVersion(value.to_string())),
                        None if name == "patchlevel" => Ok(0),
                        _ => Err(RuleError::InvalidVersion(value.to_string())),
                    }
                };
                Ok(Self::new(field("version")?, field("patchlevel")?))
            }
            other => Err(RuleError::InvalidVersion(other.to_string())),
        }
    }
}

impl FromStr for KernelVersion {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        let mut parts = trimmed.split('.');
        let version = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| RuleError::InvalidVersion(s.to_string()))?;
        let patchlevel = match parts.next() {
            Some(p) => p
                .parse()
                .map_err(|_| RuleError::InvalidVersion(s.to_string()))?,
            None => 0,
        };
        Ok(Self::new(version, patchlevel))
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.version, self.patchlevel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_string() {
        assert_eq!("6.1".parse::<KernelVersion>().unwrap(), KernelVersion::new(6, 1));
        assert_eq!("v5".parse::<KernelVersion>().unwrap(), KernelVersion::new(5, 0));
        assert!("six".parse::<KernelVersion>().is_err());
    }

    #[test]
    fn test_parse_object() {
        let v = KernelVersion::from_json(&json!({"version": 6, "patchlevel": "12"})).unwrap();
        assert_eq!(v, KernelVersion::new(6, 12));
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        assert!(KernelVersion::new(5, 19) < KernelVersion::new(6, 0));
        assert!(KernelVersion::new(6, 2) > KernelVersion::new(6, 1));
    }
}
