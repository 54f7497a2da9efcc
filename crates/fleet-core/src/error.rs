//! Error types for Fleet CI.

use crate::node::NodeState;
use thiserror::Error;

/// `data.error_code` for submissions that exhausted their retries.
pub const SUBMIT_ERROR: &str = "submit_error";
/// `data.error_code` for jobs whose definition could not be rendered.
pub const INVALID_JOB_PARAMS: &str = "invalid_job_params";
/// `data.error_code` for generic infrastructure failures.
pub const INFRASTRUCTURE_ERROR: &str = "Infrastructure";
/// `data.error_code` for jobs that outlived their wait deadline.
pub const NODE_TIMEOUT: &str = "node_timeout";

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{kind} not found in configuration: {name}")]
    ConfigurationMismatch { kind: &'static str, name: String },

    // Dispatch errors
    #[error("Template render failed for {template}: {reason}")]
    Render { template: String, reason: String },

    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Wait timed out after {seconds} seconds")]
    WaitTimeout { seconds: u64 },

    #[error("Invalid result payload: {0}")]
    ResultParse(String),

    // Node errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid node state transition: {from} -> {to}")]
    InvalidStateTransition { from: NodeState, to: NodeState },

    // Infrastructure errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Event source error: {0}")]
    EventSource(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Submission(_) | Error::Network(_) | Error::Storage(_) | Error::EventSource(_)
        )
    }

    /// Code recorded as `data.error_code` when this error ends a job.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Submission(_) => SUBMIT_ERROR,
            Error::Render { .. } | Error::ConfigurationMismatch { .. } => INVALID_JOB_PARAMS,
            Error::WaitTimeout { .. } => NODE_TIMEOUT,
            _ => INFRASTRUCTURE_ERROR,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Submission("503".into()).error_code(), "submit_error");
        assert_eq!(Error::WaitTimeout { seconds: 5 }.error_code(), "node_timeout");
        assert_eq!(Error::Internal("x".into()).error_code(), "Infrastructure");
        assert_eq!(Error::ResultParse("x".into()).error_code(), "Infrastructure");
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(!Error::ResultParse("bad".into()).is_retryable());
    }
}
