//! Pull-labs backend: store the definition, results come back by callback.

use crate::params::JobParams;
use crate::runtime::{
    DefinitionFormat, JobDefinition, JobHandle, Protocol, Runtime, WaitStatus, render_definition,
};
use async_trait::async_trait;
use fleet_core::config::{JobConfig, RuntimeConfig};
use fleet_core::node::Node;
use fleet_core::ports::{ArtifactStorage, TemplateRenderer};
use fleet_core::Result;
use std::io::Write;
use std::sync::Arc;
use tracing::info;

pub struct PullLabsRuntime {
    config: RuntimeConfig,
    renderer: Arc<dyn TemplateRenderer>,
    storage: Arc<dyn ArtifactStorage>,
}

impl PullLabsRuntime {
    pub fn new(
        config: RuntimeConfig,
        renderer: Arc<dyn TemplateRenderer>,
        storage: Arc<dyn ArtifactStorage>,
    ) -> Self {
        Self {
            config,
            renderer,
            storage,
        }
    }

    /// Storage directory of the definitions for `node`.
    pub fn storage_path(&self, node: &Node) -> String {
        format!(
            "{}/{}",
            self.config.storage_prefix.trim_end_matches('/'),
            node.id_str()
        )
    }
}

#[async_trait]
impl Runtime for PullLabsRuntime {
    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn protocol(&self) -> Protocol {
        Protocol::SubmitAndForget
    }

    fn generate(&self, job: &JobConfig, params: &JobParams) -> Result<JobDefinition> {
        render_definition(
            self.renderer.as_ref(),
            &self.config,
            job,
            params,
            DefinitionFormat::Json,
        )
    }

    async fn submit(&self, definition: &JobDefinition, node: &Node) -> Result<JobHandle> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(definition.text.as_bytes())?;
        file.flush()?;

        let dest_name = format!("{}.json", uuid::Uuid::new_v4());
        let dest_path = self.storage_path(node);
        let url = self
            .storage
            .upload_single(file.path(), &dest_name, &dest_path)
            .await?;

        info!(
            runtime = %self.config.name,
            node_id = %node.id_str(),
            url = %url,
            "Stored job definition for pull lab"
        );
        Ok(JobHandle::Stored { url })
    }

    async fn wait(&self, _handle: &JobHandle) -> Result<WaitStatus> {
        Ok(WaitStatus::Success)
    }
}

impl std::fmt::Debug for PullLabsRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullLabsRuntime")
            .field("name", &self.config.name)
            .finish()
    }
}
