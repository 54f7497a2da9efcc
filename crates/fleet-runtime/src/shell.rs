//! Local shell backend.
//!
//! Each job gets its own directory under the work directory, holding the
//! rendered script and its combined output in `log.txt`.

use crate::params::JobParams;
use crate::runtime::{
    DefinitionFormat, JobDefinition, JobHandle, Protocol, Runtime, WaitStatus, render_definition,
};
use async_trait::async_trait;
use fleet_core::config::{JobConfig, RuntimeConfig};
use fleet_core::node::Node;
use fleet_core::ports::TemplateRenderer;
use fleet_core::{Error, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const SCRIPT_FILE: &str = "script.sh";
pub const LOG_FILE: &str = "log.txt";

#[derive(Debug, Clone, Deserialize)]
struct ShellJob {
    script: String,
    #[serde(default)]
    env: BTreeMap<String, Value>,
}

pub struct ShellRuntime {
    config: RuntimeConfig,
    work_dir: PathBuf,
    renderer: Arc<dyn TemplateRenderer>,
    running: Mutex<HashMap<String, Child>>,
}

impl ShellRuntime {
    pub fn new(config: RuntimeConfig, renderer: Arc<dyn TemplateRenderer>) -> Self {
        let work_dir = config
            .work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("fleet-shell"));
        Self {
            config,
            work_dir,
            renderer,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Directory of the job behind `handle`.
    pub fn job_dir(&self, handle: &JobHandle) -> Option<PathBuf> {
        handle.backend_id().map(|id| self.work_dir.join(id))
    }

    fn parse(definition: &JobDefinition) -> Result<ShellJob> {
        serde_json::from_value(definition.document.clone()).map_err(|e| Error::Render {
            template: definition.name.clone(),
            reason: format!("not a shell job: {}", e),
        })
    }
}

#[async_trait]
impl Runtime for ShellRuntime {
    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn protocol(&self) -> Protocol {
        Protocol::SubmitAndWait
    }

    fn generate(&self, job: &JobConfig, params: &JobParams) -> Result<JobDefinition> {
        let definition = render_definition(
            self.renderer.as_ref(),
            &self.config,
            job,
            params,
            DefinitionFormat::Yaml,
        )?;
        Self::parse(&definition)?;
        Ok(definition)
    }

    async fn submit(&self, definition: &JobDefinition, node: &Node) -> Result<JobHandle> {
        let job = Self::parse(definition)?;
        let id = format!("{}-{}", node.id_str(), uuid::Uuid::new_v4().simple());
        let dir = self.work_dir.join(&id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(SCRIPT_FILE), &job.script).await?;

        let log = std::fs::File::create(dir.join(LOG_FILE))?;
        let env: Vec<(String, String)> = job
            .env
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k.clone(), s.clone()),
                other => (k.clone(), other.to_string()),
            })
            .collect();

        let child = Command::new("sh")
            .arg(SCRIPT_FILE)
            .current_dir(&dir)
            .envs(env)
            .env("FLEET_NODE_ID", node.id_str())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Infrastructure(format!("Failed to spawn process: {}", e)))?;

        info!(
            runtime = %self.config.name,
            node_id = %node.id_str(),
            dir = %dir.display(),
            "Started shell job"
        );
        self.running.lock().await.insert(id.clone(), child);
        Ok(JobHandle::Backend(id))
    }

    async fn wait(&self, handle: &JobHandle) -> Result<WaitStatus> {
        let id = handle
            .backend_id()
            .ok_or_else(|| Error::Internal(format!("Shell cannot track {}", handle)))?;
        let mut child = self
            .running
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| Error::Internal(format!("Unknown shell job {}", id)))?;

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Infrastructure(format!("Failed to wait for process: {}", e)))?;

        debug!(job = id, exit_code = ?status.code(), "Shell job finished");
        Ok(match status.code() {
            Some(0) => WaitStatus::Success,
            Some(_) => WaitStatus::Failure,
            None => WaitStatus::Infrastructure,
        })
    }
}
