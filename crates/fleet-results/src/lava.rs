//! LAVA poll responses.
//!
//! A finished LAVA job exposes its numeric status, its health, the device it
//! ran on, the original job definition and one YAML-encoded result list per
//! test suite. The suite named `lava` holds LAVA's own actions and becomes the
//! `setup` stage of the hierarchy.

use crate::aggregate::SETUP_STAGE;
use crate::hierarchy::ResultHierarchy;
use fleet_core::node::NodeResult;
use fleet_core::{Error, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::{debug, warn};

static SUITE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+_").expect("valid regex"));

const LAVA_SUITE: &str = "lava";
const JOB_CASE: &str = "job";

/// `error_type` values that mean the lab, not the kernel, failed.
const INFRASTRUCTURE_ERROR_TYPES: &[&str] = &["Infrastructure", "Job", "Canceled"];

/// Job health as reported by LAVA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LavaHealth {
    Unknown,
    Complete,
    Incomplete,
    Canceled,
}

impl LavaHealth {
    /// From LAVA's numeric job status (2 complete, 3 incomplete, 4 canceled).
    pub fn from_status(status: i64) -> Self {
        match status {
            2 => LavaHealth::Complete,
            3 => LavaHealth::Incomplete,
            4 => LavaHealth::Canceled,
            _ => LavaHealth::Unknown,
        }
    }

    pub fn parse(health: &str) -> Self {
        match health {
            "Complete" => LavaHealth::Complete,
            "Incomplete" => LavaHealth::Incomplete,
            "Canceled" => LavaHealth::Canceled,
            _ => LavaHealth::Unknown,
        }
    }

    /// Exit code of a wait on a job with this health.
    pub fn wait_code(&self) -> i32 {
        match self {
            LavaHealth::Complete => 0,
            LavaHealth::Incomplete => 1,
            LavaHealth::Canceled | LavaHealth::Unknown => 2,
        }
    }

    pub fn job_result(&self) -> Option<NodeResult> {
        match self {
            LavaHealth::Complete => Some(NodeResult::Pass),
            LavaHealth::Incomplete | LavaHealth::Canceled => Some(NodeResult::Incomplete),
            LavaHealth::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TestCase {
    name: String,
    result: String,
    #[serde(default)]
    metadata: Map<String, Value>,
}

/// Poll response of a finished LAVA job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LavaJobResults {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub health: Option<String>,
    #[serde(default)]
    pub actual_device_id: Option<String>,
    /// Suite name to result list, either YAML text or already decoded.
    #[serde(default)]
    pub results: BTreeMap<String, Value>,
    #[serde(default)]
    pub definition: Option<String>,
}

impl LavaJobResults {
    pub fn from_json(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone())
            .map_err(|e| Error::ResultParse(format!("LAVA payload: {}", e)))
    }

    /// Health from the explicit field, falling back to the numeric status.
    pub fn health(&self) -> LavaHealth {
        if let Some(health) = self.health.as_deref() {
            return LavaHealth::parse(health);
        }
        match &self.status {
            Some(Value::Number(n)) => n
                .as_i64()
                .map(LavaHealth::from_status)
                .unwrap_or(LavaHealth::Unknown),
            Some(Value::String(s)) => s
                .parse::<i64>()
                .map(LavaHealth::from_status)
                .unwrap_or_else(|_| LavaHealth::parse(s)),
            _ => LavaHealth::Unknown,
        }
    }

    /// `job_name` from the original definition, if it still parses.
    pub fn job_name(&self) -> Option<String> {
        let definition = self.definition.as_deref()?;
        let parsed: Value = serde_yaml::from_str(definition)
            .map_err(|e| warn!(error = %e, "LAVA job definition does not parse"))
            .ok()?;
        parsed.get("job_name")?.as_str().map(str::to_string)
    }

    /// Build the result tree; `name` is used when the definition has no name.
    pub fn to_hierarchy(&self, name: &str) -> Result<ResultHierarchy> {
        let job_name = self.job_name().unwrap_or_else(|| name.to_string());
        let mut root = ResultHierarchy::new(job_name, self.health().job_result());
        if let Some(device) = &self.actual_device_id {
            root.node.data.insert("device".into(), device.clone().into());
        }

        for (suite_name, raw) in &self.results {
            let cases = decode_cases(suite_name, raw)?;
            let is_lava = suite_name == LAVA_SUITE;
            if is_lava {
                classify_infrastructure(&mut root, &cases);
            }
            let display = if is_lava {
                SETUP_STAGE.to_string()
            } else {
                SUITE_PREFIX.replace(suite_name, "").into_owned()
            };
            root.push(suite_tree(&display, &cases)?);
        }

        debug!(job = %root.name(), nodes = root.descendant_count(), "Parsed LAVA results");
        Ok(root)
    }
}

fn decode_cases(suite: &str, raw: &Value) -> Result<Vec<TestCase>> {
    let parsed = match raw {
        Value::String(text) => serde_yaml::from_str::<Option<Vec<TestCase>>>(text)
            .map(Option::unwrap_or_default)
            .map_err(|e| e.to_string()),
        Value::Null => Ok(Vec::new()),
        other => serde_json::from_value(other.clone()).map_err(|e| e.to_string()),
    };
    parsed.map_err(|e| Error::ResultParse(format!("suite {}: {}", suite, e)))
}

fn suite_tree(name: &str, cases: &[TestCase]) -> Result<ResultHierarchy> {
    let mut suite = ResultHierarchy::new(name, None);
    for case in cases {
        let mut leaf = ResultHierarchy::new(&case.name, Some(case_result(&case.result)?));
        for key in ["measurement", "units"] {
            if let Some(value) = case.metadata.get(key) {
                leaf.node.data.insert(key.to_string(), value.clone());
            }
        }
        match case.metadata.get("set").and_then(Value::as_str) {
            Some(set) => suite.child_or_insert(set).push(leaf),
            None => suite.push(leaf),
        }
    }
    Ok(suite)
}

fn case_result(result: &str) -> Result<NodeResult> {
    match result {
        "pass" => Ok(NodeResult::Pass),
        "fail" => Ok(NodeResult::Fail),
        "skip" | "unknown" => Ok(NodeResult::Skip),
        "incomplete" => Ok(NodeResult::Incomplete),
        other => Err(Error::ResultParse(format!("unknown test result '{}'", other))),
    }
}

fn classify_infrastructure(root: &mut ResultHierarchy, cases: &[TestCase]) {
    let Some(job) = cases
        .iter()
        .find(|c| c.name == JOB_CASE && c.result == "fail")
    else {
        return;
    };
    let Some(error_type) = job.metadata.get("error_type").and_then(Value::as_str) else {
        return;
    };
    if INFRASTRUCTURE_ERROR_TYPES.contains(&error_type) {
        let message = job
            .metadata
            .get("error_msg")
            .and_then(Value::as_str)
            .unwrap_or("LAVA job failed");
        warn!(job = %root.name(), error_type, "LAVA infrastructure failure");
        root.node.result = Some(NodeResult::Incomplete);
        root.set_error(error_type, message);
    }
}
