//! Docker backend: one container per job, waited on through the Engine API.

use crate::params::JobParams;
use crate::runtime::{
    DefinitionFormat, JobDefinition, JobHandle, Protocol, Runtime, WaitStatus, render_definition,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use fleet_core::config::{JobConfig, RuntimeConfig};
use fleet_core::node::Node;
use fleet_core::ports::TemplateRenderer;
use fleet_core::{Error, Result};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Job definition understood by the Docker backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContainerJob {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, Value>,
}

impl ContainerJob {
    pub fn from_definition(definition: &JobDefinition) -> Result<Self> {
        serde_json::from_value(definition.document.clone()).map_err(|e| Error::Render {
            template: definition.name.clone(),
            reason: format!("not a container job: {}", e),
        })
    }

    /// Command to run: explicit argv, else the script through `sh -c`.
    pub fn cmd(&self) -> Option<Vec<String>> {
        if !self.command.is_empty() {
            return Some(self.command.clone());
        }
        self.script
            .as_ref()
            .map(|script| vec!["sh".to_string(), "-c".to_string(), script.clone()])
    }

    pub fn env_list(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{}={}", k, s),
                other => format!("{}={}", k, other),
            })
            .collect()
    }
}

pub struct DockerRuntime {
    config: RuntimeConfig,
    docker: Docker,
    renderer: Arc<dyn TemplateRenderer>,
}

impl DockerRuntime {
    /// Connect to `config.url` when set, else to the local daemon.
    pub fn new(config: RuntimeConfig, renderer: Arc<dyn TemplateRenderer>) -> Result<Self> {
        let docker = match config.url.as_deref() {
            Some(url) => {
                Docker::connect_with_http(url, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| Error::Configuration(format!("Failed to connect to Docker: {}", e)))?;

        Ok(Self::with_docker(config, docker, renderer))
    }

    /// Create with an existing Docker client.
    pub fn with_docker(
        config: RuntimeConfig,
        docker: Docker,
        renderer: Arc<dyn TemplateRenderer>,
    ) -> Self {
        Self {
            config,
            docker,
            renderer,
        }
    }

    async fn remove(&self, container: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(container, Some(options)).await {
            warn!(container, error = %e, "Failed to remove container");
        }
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
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
        ContainerJob::from_definition(&definition)?;
        Ok(definition)
    }

    async fn submit(&self, definition: &JobDefinition, node: &Node) -> Result<JobHandle> {
        let job = ContainerJob::from_definition(definition)?;
        let container_name = format!(
            "fleet-{}-{}",
            node.id_str(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let mut labels = std::collections::HashMap::new();
        labels.insert("fleet.node_id".to_string(), node.id_str().to_string());
        labels.insert("fleet.job".to_string(), definition.name.clone());

        let container_config = Config {
            image: Some(job.image.clone()),
            cmd: job.cmd(),
            env: Some(job.env_list()),
            labels: Some(labels),
            ..Default::default()
        };
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        self.docker
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| Error::Submission(format!("Failed to create container: {}", e)))?;

        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&container_name).await;
            return Err(Error::Submission(format!("Failed to start container: {}", e)));
        }

        info!(
            runtime = %self.config.name,
            node_id = %node.id_str(),
            image = %job.image,
            container = %container_name,
            "Started container"
        );
        Ok(JobHandle::Backend(container_name))
    }

    async fn wait(&self, handle: &JobHandle) -> Result<WaitStatus> {
        let container = handle
            .backend_id()
            .ok_or_else(|| Error::Internal(format!("Docker cannot track {}", handle)))?;
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let outcome = self
            .docker
            .wait_container(container, Some(options))
            .next()
            .await;

        let status = match outcome {
            Some(Ok(response)) if response.status_code == 0 => Ok(WaitStatus::Success),
            Some(Ok(response)) => {
                debug!(container, exit_code = response.status_code, "Container failed");
                Ok(WaitStatus::Failure)
            }
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                debug!(container, exit_code = code, "Container failed");
                Ok(WaitStatus::Failure)
            }
            Some(Err(e)) => Err(Error::Infrastructure(format!("Container wait failed: {}", e))),
            None => Err(Error::Infrastructure(
                "Container wait returned no result".to_string(),
            )),
        };

        self.remove(container).await;
        status
    }

    async fn cancel(&self, handle: &JobHandle) {
        if let Some(container) = handle.backend_id() {
            info!(runtime = %self.config.name, container, "Removing abandoned container");
            self.remove(container).await;
        }
    }
}
