//! Errors raised while compiling admission rules.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("Invalid value for rule `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Invalid tree/branch combination `{0}`")]
    InvalidCombo(String),

    #[error("Invalid kernel version `{0}`")]
    InvalidVersion(String),
}
