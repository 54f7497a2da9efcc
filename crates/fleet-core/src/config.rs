//! Pipeline configuration types.
//!
//! These types represent the jobs, scheduler entries, runtimes and platforms
//! loaded from YAML. Names come from the map keys they are declared under.

use crate::error::{Error, Result};
use crate::events::NodeEvent;
use crate::node::NodeKind;
use crate::retry::RetryPolicy;
use fleet_rules::AdmissionRules;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
    #[serde(default)]
    pub scheduler: Vec<SchedulerEntry>,
    #[serde(default)]
    pub runtimes: BTreeMap<String, RuntimeConfig>,
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
}

impl PipelineConfig {
    /// Parse and finalize a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Configuration(format!("Invalid pipeline configuration: {}", e)))?;
        Ok(config.finalize())
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Fill names from map keys, resolve platform inheritance and report
    /// dangling references. Dangling references are not fatal: partial
    /// configurations are expected while rolling out.
    pub fn finalize(mut self) -> Self {
        for (name, job) in self.jobs.iter_mut() {
            job.name = name.clone();
        }
        for (name, runtime) in self.runtimes.iter_mut() {
            runtime.name = name.clone();
        }
        for (name, platform) in self.platforms.iter_mut() {
            platform.name = name.clone();
        }

        let bases: BTreeMap<String, PlatformConfig> = self.platforms.clone();
        for platform in self.platforms.values_mut() {
            if let Some(base) = platform
                .base_name
                .as_ref()
                .filter(|b| **b != platform.name)
                .and_then(|b| bases.get(b))
            {
                platform.inherit(base);
            }
        }

        for entry in &self.scheduler {
            if !self.jobs.contains_key(&entry.job) {
                warn!(job = %entry.job, "Scheduler entry references unknown job");
            }
            if let RuntimeSelector::Name(name) = &entry.runtime
                && !self.runtimes.contains_key(name)
            {
                warn!(
                    job = %entry.job,
                    runtime = %name,
                    "Scheduler entry references unknown runtime"
                );
            }
        }

        self
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.get(name)
    }

    pub fn runtime(&self, name: &str) -> Option<&RuntimeConfig> {
        self.runtimes.get(name)
    }

    pub fn platform(&self, name: &str) -> Option<&PlatformConfig> {
        self.platforms.get(name)
    }

    /// All runtimes of a backend type, in name order.
    pub fn runtimes_of_type(&self, runtime_type: RuntimeType) -> Vec<&RuntimeConfig> {
        self.runtimes
            .values()
            .filter(|r| r.runtime_type == runtime_type)
            .collect()
    }
}

/// Event criteria: a channel plus field values the event must carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOn {
    pub channel: String,
    #[serde(flatten)]
    pub criteria: BTreeMap<String, Value>,
}

impl RunOn {
    pub fn matches(&self, event: &NodeEvent, channel: &str) -> bool {
        self.channel == channel && event.matches(&self.criteria)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    #[serde(skip)]
    pub name: String,
    pub template: String,
    #[serde(default = "default_job_kind")]
    pub kind: NodeKind,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub run_on: Vec<RunOn>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub rules: Option<AdmissionRules>,
    /// Explicit logical priority: 0-100 or `high`/`medium`/`low`.
    #[serde(default)]
    pub priority: Option<Value>,
}

fn default_job_kind() -> NodeKind {
    NodeKind::Job
}

/// How a scheduler entry picks its runtime.
///
/// Written as `{name: <runtime>}` or `{type: <runtime type>}`; exactly one
/// of the two must be set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawRuntimeSelector")]
pub enum RuntimeSelector {
    Name(String),
    Type(RuntimeType),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRuntimeSelector {
    name: Option<String>,
    #[serde(rename = "type")]
    runtime_type: Option<RuntimeType>,
}

impl TryFrom<RawRuntimeSelector> for RuntimeSelector {
    type Error = String;

    fn try_from(raw: RawRuntimeSelector) -> std::result::Result<Self, Self::Error> {
        match (raw.name, raw.runtime_type) {
            (Some(name), None) => Ok(RuntimeSelector::Name(name)),
            (None, Some(runtime_type)) => Ok(RuntimeSelector::Type(runtime_type)),
            (Some(_), Some(_)) => Err("runtime selector sets both name and type".to_string()),
            (None, None) => Err("runtime selector needs a name or a type".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerEntry {
    pub job: String,
    pub runtime: RuntimeSelector,
    /// Extra event criteria; when present the event must match them too.
    #[serde(default)]
    pub event: Option<RunOn>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub rules: Option<AdmissionRules>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    Lava,
    Docker,
    Shell,
    PullLabs,
}

impl RuntimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeType::Lava => "lava",
            RuntimeType::Docker => "docker",
            RuntimeType::Shell => "shell",
            RuntimeType::PullLabs => "pull_labs",
        }
    }
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend priority scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityScale {
    /// Scale logical priority by a percentage.
    Percentage(u32),
    /// Map logical priority onto `[min, max]`.
    Range { min: i64, max: i64 },
    Unscaled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub runtime_type: RuntimeType,
    /// Backend API or storage URL.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Token expected on inbound callbacks.
    #[serde(default)]
    pub callback_token: Option<String>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub priority_min: Option<i64>,
    #[serde(default)]
    pub priority_max: Option<i64>,
    #[serde(default)]
    pub template_paths: Vec<PathBuf>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Work directory for the shell runtime.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Storage path prefix for submit-and-forget job definitions.
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

fn default_poll_interval() -> u64 {
    10
}

fn default_wait_timeout() -> u64 {
    3 * 3600
}

fn default_storage_prefix() -> String {
    "pull-labs".to_string()
}

impl RuntimeConfig {
    pub fn new(name: impl Into<String>, runtime_type: RuntimeType) -> Self {
        Self {
            name: name.into(),
            runtime_type,
            url: None,
            token: None,
            callback_token: None,
            priority: None,
            priority_min: None,
            priority_max: None,
            template_paths: vec![],
            poll_interval_secs: default_poll_interval(),
            wait_timeout_secs: default_wait_timeout(),
            retry: RetryPolicy::default(),
            work_dir: None,
            storage_prefix: default_storage_prefix(),
            params: Map::new(),
        }
    }

    /// A `(min, max)` range wins over a flat percentage.
    pub fn scale(&self) -> PriorityScale {
        match (self.priority_min, self.priority_max, self.priority) {
            (Some(min), Some(max), _) => PriorityScale::Range { min, max },
            (_, _, Some(p)) => PriorityScale::Percentage(p),
            _ => PriorityScale::Unscaled,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlatformConfig {
    #[serde(skip)]
    pub name: String,
    /// Device type or alias; may name another platform to inherit from.
    #[serde(default)]
    pub base_name: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub boot_method: Option<String>,
    #[serde(default)]
    pub rules: Option<AdmissionRules>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl PlatformConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Name the backend knows this platform by.
    pub fn device_type(&self) -> &str {
        self.base_name.as_deref().unwrap_or(&self.name)
    }

    fn inherit(&mut self, base: &PlatformConfig) {
        if self.arch.is_none() {
            self.arch = base.arch.clone();
        }
        if self.boot_method.is_none() {
            self.boot_method = base.boot_method.clone();
        }
        for (key, value) in &base.params {
            self.params
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}
