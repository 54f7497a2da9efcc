//! Core runtime trait and types.

use crate::params::JobParams;
use async_trait::async_trait;
use fleet_core::config::{JobConfig, RuntimeConfig, RuntimeType};
use fleet_core::node::Node;
use fleet_core::ports::TemplateRenderer;
use fleet_core::{Error, Result};
use fleet_results::ResultHierarchy;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// How completion is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// `wait` blocks until the backend reports a terminal state.
    SubmitAndWait,
    /// `wait` returns at once; results arrive later through a callback.
    SubmitAndForget,
}

/// Serialization of a rendered job definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Yaml,
    Json,
}

impl DefinitionFormat {
    /// Parse `text`, failing when it is not valid in this format.
    pub fn parse(&self, text: &str) -> std::result::Result<Value, String> {
        match self {
            DefinitionFormat::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
            DefinitionFormat::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
        }
    }
}

/// A rendered, validated job definition.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefinition {
    pub name: String,
    pub format: DefinitionFormat,
    pub text: String,
    /// Parsed form of `text`.
    pub document: Value,
}

/// Opaque reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobHandle {
    /// A job known to the backend by this id.
    Backend(String),
    /// A job definition stored for a lab to pick up.
    Stored { url: String },
}

impl JobHandle {
    pub fn backend_id(&self) -> Option<&str> {
        match self {
            JobHandle::Backend(id) => Some(id),
            JobHandle::Stored { .. } => None,
        }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobHandle::Backend(id) => f.write_str(id),
            JobHandle::Stored { url } => f.write_str(url),
        }
    }
}

/// Terminal status of a waited-on job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Success,
    Failure,
    Infrastructure,
}

impl WaitStatus {
    pub fn code(&self) -> i32 {
        match self {
            WaitStatus::Success => 0,
            WaitStatus::Failure => 1,
            WaitStatus::Infrastructure => 2,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => WaitStatus::Success,
            1 => WaitStatus::Failure,
            _ => WaitStatus::Infrastructure,
        }
    }
}

/// A configured execution backend.
#[async_trait]
pub trait Runtime: Send + Sync {
    fn config(&self) -> &RuntimeConfig;

    fn protocol(&self) -> Protocol;

    fn name(&self) -> &str {
        &self.config().name
    }

    fn runtime_type(&self) -> RuntimeType {
        self.config().runtime_type
    }

    /// Render the job definition for `job` with `params`.
    fn generate(&self, job: &JobConfig, params: &JobParams) -> Result<JobDefinition>;

    /// Submit a definition on behalf of `node`.
    async fn submit(&self, definition: &JobDefinition, node: &Node) -> Result<JobHandle>;

    /// Identifier stored on the node, if the backend has one.
    fn job_id(&self, handle: &JobHandle) -> Option<String> {
        handle.backend_id().map(str::to_string)
    }

    /// Block until the job is done.
    async fn wait(&self, handle: &JobHandle) -> Result<WaitStatus>;

    /// Detailed results of a finished job, when the backend provides them.
    async fn fetch_results(
        &self,
        _handle: &JobHandle,
        _node: &Node,
    ) -> Result<Option<ResultHierarchy>> {
        Ok(None)
    }

    /// Release whatever the backend still holds for an abandoned job.
    async fn cancel(&self, _handle: &JobHandle) {}
}

/// `wait` bounded by `timeout`.
///
/// On expiry the runtime is asked to cancel the job before the timeout is
/// reported.
pub async fn wait_with_timeout(
    runtime: &dyn Runtime,
    handle: &JobHandle,
    timeout: Duration,
) -> Result<WaitStatus> {
    match tokio::time::timeout(timeout, runtime.wait(handle)).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                runtime = %runtime.name(),
                job = %handle,
                timeout_secs = timeout.as_secs(),
                "Wait timed out"
            );
            runtime.cancel(handle).await;
            Err(Error::WaitTimeout {
                seconds: timeout.as_secs(),
            })
        }
    }
}

/// Render `job.template` from the runtime's search paths and validate it.
pub(crate) fn render_definition(
    renderer: &dyn TemplateRenderer,
    config: &RuntimeConfig,
    job: &JobConfig,
    params: &JobParams,
    format: DefinitionFormat,
) -> Result<JobDefinition> {
    let text = renderer.render(&job.template, &config.template_paths, params.as_map())?;
    let document = format.parse(&text).map_err(|reason| Error::Render {
        template: job.template.clone(),
        reason: format!("rendered definition is not valid: {}", reason),
    })?;
    debug!(job = %job.name, runtime = %config.name, bytes = text.len(), "Generated job definition");
    Ok(JobDefinition {
        name: job.name.clone(),
        format,
        text,
        document,
    })
}
