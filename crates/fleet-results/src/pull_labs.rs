//! Pull-labs callback payloads.
//!
//! Labs polling for work post one JSON document per finished job:
//! `metadata` about the run, a `summary` of counts, per-test `tests` with
//! optional nested `subtests`, and `artifacts` which may include the job log.

use crate::hierarchy::ResultHierarchy;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use fleet_core::node::NodeResult;
use fleet_core::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Artifact key holding the inline job log.
pub const LOG_ARTIFACT: &str = "log";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackMetadata {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Summary {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub failed: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestReport {
    pub status: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub metrics: Option<Value>,
    #[serde(default)]
    pub subtests: BTreeMap<String, TestReport>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackPayload {
    #[serde(default)]
    pub metadata: CallbackMetadata,
    #[serde(default)]
    pub summary: Summary,
    #[serde(default)]
    pub tests: BTreeMap<String, TestReport>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

impl CallbackPayload {
    pub fn from_json(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone())
            .map_err(|e| Error::ResultParse(format!("callback payload: {}", e)))
    }

    /// Job-level result from the metadata and summary.
    pub fn job_result(&self) -> NodeResult {
        if self.metadata.error_code.is_some() || self.summary.total == 0 {
            NodeResult::Incomplete
        } else if self.summary.failed > 0 {
            NodeResult::Fail
        } else {
            NodeResult::Pass
        }
    }

    /// Inline log, still encoded.
    pub fn log(&self) -> Option<&str> {
        self.artifacts.get(LOG_ARTIFACT).map(String::as_str)
    }

    pub fn to_hierarchy(&self, name: &str) -> Result<ResultHierarchy> {
        let mut root = ResultHierarchy::new(name, Some(self.job_result()));
        if let Some(device) = &self.metadata.device_id {
            root.node.data.insert("device".into(), device.clone().into());
        }
        match &self.metadata.error_code {
            Some(code) => {
                let message = self.metadata.error_msg.clone().unwrap_or_default();
                root.set_error(code, message);
            }
            None if self.summary.total == 0 => {
                root.set_error(fleet_core::error::INFRASTRUCTURE_ERROR, "no tests reported");
            }
            None => {}
        }
        root.node.artifacts = self
            .artifacts
            .iter()
            .filter(|(key, _)| key.as_str() != LOG_ARTIFACT)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (test_name, report) in &self.tests {
            root.push(test_tree(test_name, report)?);
        }
        Ok(root)
    }
}

fn test_tree(name: &str, report: &TestReport) -> Result<ResultHierarchy> {
    let mut tree = ResultHierarchy::new(name, Some(status_result(&report.status)?));
    if let Some(duration) = report.duration_ms {
        tree.node.data.insert("duration_ms".into(), duration.into());
    }
    if let Some(metrics) = &report.metrics {
        tree.node.data.insert("metrics".into(), metrics.clone());
    }
    for (sub_name, sub) in &report.subtests {
        tree.push(test_tree(sub_name, sub)?);
    }
    Ok(tree)
}

fn status_result(status: &str) -> Result<NodeResult> {
    match status.to_ascii_lowercase().as_str() {
        "pass" | "passed" => Ok(NodeResult::Pass),
        "fail" | "failed" | "error" => Ok(NodeResult::Fail),
        "skip" | "skipped" => Ok(NodeResult::Skip),
        "incomplete" => Ok(NodeResult::Incomplete),
        other => Err(Error::ResultParse(format!("unknown test status '{}'", other))),
    }
}

/// Log content from a callback: base64 when it decodes, plain text otherwise.
pub fn decode_log(log: &str) -> Vec<u8> {
    STANDARD
        .decode(log.trim())
        .unwrap_or_else(|_| log.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn callback(total: u64, failed: u64) -> CallbackPayload {
        CallbackPayload::from_json(&json!({
            "metadata": {"device_id": "qemu-x86-01"},
            "summary": {"total": total, "failed": failed},
            "tests": {
                "kselftest-timers": {
                    "status": "fail",
                    "duration_ms": 5400,
                    "subtests": {
                        "posix_timers": {"status": "pass"},
                        "nanosleep": {"status": "fail", "metrics": {"latency_us": 12}},
                    },
                },
            },
            "artifacts": {"dmesg": "https://storage/dmesg.txt", "log": "Ym9vdCBvaw=="},
        }))
        .unwrap()
    }

    #[test]
    fn test_job_result_from_summary() {
        assert_eq!(callback(5, 0).job_result(), NodeResult::Pass);
        assert_eq!(callback(5, 2).job_result(), NodeResult::Fail);
        assert_eq!(callback(0, 0).job_result(), NodeResult::Incomplete);
    }

    #[test]
    fn test_error_code_forces_incomplete() {
        let payload = CallbackPayload::from_json(&json!({
            "metadata": {"error_code": "device_offline", "error_msg": "no devices"},
            "summary": {"total": 3, "failed": 0},
        }))
        .unwrap();
        let tree = payload.to_hierarchy("baseline").unwrap();
        assert_eq!(tree.result(), Some(NodeResult::Incomplete));
        assert_eq!(tree.node.data["error_code"], "device_offline");
    }

    #[test]
    fn test_hierarchy_nests_subtests() {
        let tree = callback(5, 2).to_hierarchy("kselftest").unwrap();
        assert_eq!(tree.node.data["device"], "qemu-x86-01");
        assert_eq!(tree.node.artifacts.len(), 1);
        assert!(tree.node.artifacts.contains_key("dmesg"));

        let timers = tree.child("kselftest-timers").unwrap();
        assert_eq!(timers.node.data["duration_ms"], 5400);
        assert_eq!(timers.child_nodes.len(), 2);
        assert_eq!(timers.child("nanosleep").unwrap().node.data["metrics"]["latency_us"], 12);
    }

    #[test]
    fn test_unknown_status_rejected() {
        let payload = CallbackPayload::from_json(&json!({
            "summary": {"total": 1},
            "tests": {"boot": {"status": "on-fire"}},
        }))
        .unwrap();
        assert!(matches!(payload.to_hierarchy("boot"), Err(Error::ResultParse(_))));
    }

    #[test]
    fn test_decode_log() {
        assert_eq!(decode_log("Ym9vdCBvaw=="), b"boot ok".to_vec());
        let plain = "[    0.000000] Linux version 6.8";
        assert_eq!(decode_log(plain), plain.as_bytes().to_vec());
    }
}
