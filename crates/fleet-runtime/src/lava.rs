//! LAVA backend: submit over the REST API, poll until finished.

use crate::params::JobParams;
use crate::runtime::{
    DefinitionFormat, JobDefinition, JobHandle, Protocol, Runtime, WaitStatus, render_definition,
};
use async_trait::async_trait;
use fleet_core::config::{JobConfig, RuntimeConfig};
use fleet_core::node::Node;
use fleet_core::ports::TemplateRenderer;
use fleet_core::{Error, Result};
use fleet_results::{LavaHealth, LavaJobResults, ResultHierarchy};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace};
use url::Url;

const FINISHED: &str = "Finished";

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_ids: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct JobDetail {
    #[serde(default)]
    state: String,
    #[serde(default)]
    health: String,
    #[serde(default)]
    actual_device_id: Option<String>,
    #[serde(default)]
    definition: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SuiteList {
    results: Vec<Suite>,
}

#[derive(Debug, Deserialize)]
struct Suite {
    name: String,
}

pub struct LavaRuntime {
    config: RuntimeConfig,
    client: Client,
    base: Url,
    renderer: Arc<dyn TemplateRenderer>,
}

impl LavaRuntime {
    pub fn new(config: RuntimeConfig, renderer: Arc<dyn TemplateRenderer>) -> Result<Self> {
        let raw = config.url.as_deref().ok_or_else(|| {
            Error::Configuration(format!("LAVA runtime {} has no url", config.name))
        })?;
        let normalized = if raw.ends_with('/') {
            raw.to_string()
        } else {
            format!("{}/", raw)
        };
        let base = Url::parse(&normalized)
            .map_err(|e| Error::Configuration(format!("LAVA runtime {}: {}", config.name, e)))?;
        Ok(Self {
            config,
            client: Client::new(),
            base,
            renderer,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Internal(format!("Invalid LAVA endpoint {}: {}", path, e)))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.header("Authorization", format!("Token {}", token)),
            None => request,
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.endpoint(path)?;
        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(|e| Error::Network(format!("LAVA GET {}: {}", path, e)))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Network(format!("LAVA GET {}: {}", path, status)));
        }
        if !status.is_success() {
            return Err(Error::Infrastructure(format!("LAVA GET {}: {}", path, status)));
        }
        Ok(response)
    }

    async fn job_detail(&self, id: &str) -> Result<JobDetail> {
        self.get(&format!("api/v0.2/jobs/{}/", id))
            .await?
            .json()
            .await
            .map_err(|e| Error::ResultParse(format!("LAVA job {}: {}", id, e)))
    }

    async fn suite_results(&self, id: &str, suite: &str) -> Result<String> {
        self.get(&format!("results/{}/{}/yaml", id, suite))
            .await?
            .text()
            .await
            .map_err(|e| Error::Network(format!("LAVA results {}/{}: {}", id, suite, e)))
    }

    fn handle_id<'a>(&self, handle: &'a JobHandle) -> Result<&'a str> {
        handle
            .backend_id()
            .ok_or_else(|| Error::Internal(format!("LAVA cannot track {}", handle)))
    }
}

#[async_trait]
impl Runtime for LavaRuntime {
    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn protocol(&self) -> Protocol {
        Protocol::SubmitAndWait
    }

    fn generate(&self, job: &JobConfig, params: &JobParams) -> Result<JobDefinition> {
        render_definition(
            self.renderer.as_ref(),
            &self.config,
            job,
            params,
            DefinitionFormat::Yaml,
        )
    }

    async fn submit(&self, definition: &JobDefinition, node: &Node) -> Result<JobHandle> {
        let url = self.endpoint("api/v0.2/jobs/")?;
        let response = self
            .authorized(self.client.post(url))
            .json(&json!({ "definition": definition.text }))
            .send()
            .await
            .map_err(|e| Error::Submission(format!("LAVA {}: {}", self.config.name, e)))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::Submission(format!("LAVA {}: {}", self.config.name, status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Infrastructure(format!(
                "LAVA {} rejected job {}: {} {}",
                self.config.name, definition.name, status, body
            )));
        }

        // The job may already be queued; resubmitting could run it twice.
        let submitted: SubmitResponse = response.json().await.map_err(|e| {
            Error::Infrastructure(format!("LAVA {} response: {}", self.config.name, e))
        })?;
        let id = submitted
            .job_ids
            .first()
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| {
                Error::Infrastructure(format!("LAVA {} returned no job id", self.config.name))
            })?;

        info!(
            runtime = %self.config.name,
            node_id = %node.id_str(),
            job_id = %id,
            "Submitted LAVA job"
        );
        Ok(JobHandle::Backend(id))
    }

    async fn wait(&self, handle: &JobHandle) -> Result<WaitStatus> {
        let id = self.handle_id(handle)?;
        loop {
            let detail = self
                .config
                .retry
                .run("lava.poll", || self.job_detail(id))
                .await?;
            if detail.state == FINISHED {
                let health = LavaHealth::parse(&detail.health);
                debug!(
                    runtime = %self.config.name,
                    job_id = id,
                    health = %detail.health,
                    "LAVA job finished"
                );
                return Ok(WaitStatus::from_code(health.wait_code()));
            }
            trace!(job_id = id, state = %detail.state, "LAVA job still running");
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn fetch_results(
        &self,
        handle: &JobHandle,
        node: &Node,
    ) -> Result<Option<ResultHierarchy>> {
        let id = self.handle_id(handle)?;
        let detail = self.job_detail(id).await?;
        let suites: SuiteList = self
            .get(&format!("api/v0.2/jobs/{}/suites/", id))
            .await?
            .json()
            .await
            .map_err(|e| Error::ResultParse(format!("LAVA suites of {}: {}", id, e)))?;

        let mut results = BTreeMap::new();
        for suite in suites.results {
            let yaml = self.suite_results(id, &suite.name).await?;
            results.insert(suite.name, Value::String(yaml));
        }

        let payload = LavaJobResults {
            id: Some(Value::String(id.to_string())),
            status: None,
            health: Some(detail.health),
            actual_device_id: detail.actual_device_id,
            results,
            definition: detail.definition,
        };
        payload.to_hierarchy(&node.name).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support;
    use fleet_core::config::RuntimeType;
    use fleet_core::node::NodeResult;
    use fleet_core::retry::RetryPolicy;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn runtime(server: &MockServer) -> LavaRuntime {
        let mut config = RuntimeConfig::new("lava-collabora", RuntimeType::Lava);
        config.url = Some(server.uri());
        config.token = Some("secret".into());
        config.poll_interval_secs = 0;
        config.retry = RetryPolicy::immediate(2);
        LavaRuntime::new(config, test_support::renderer()).unwrap()
    }

    fn detail(state: &str, health: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"state": state, "health": health}))
    }

    fn definition() -> JobDefinition {
        JobDefinition {
            name: "baseline-arm64".into(),
            format: DefinitionFormat::Yaml,
            text: "job_name: baseline-arm64\n".into(),
            document: json!({"job_name": "baseline-arm64"}),
        }
    }

    #[test]
    fn test_requires_url() {
        let config = RuntimeConfig::new("lava", RuntimeType::Lava);
        assert!(matches!(
            LavaRuntime::new(config, test_support::renderer()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_generate_renders_yaml() {
        let dir = tempfile::tempdir().unwrap();
        test_support::write_template(
            dir.path(),
            "baseline.jinja2",
            "job_name: ${{ name }}\ndevice_type: ${{ device_type }}\npriority: ${{ priority }}\n",
        );
        let mut config = RuntimeConfig::new("lava", RuntimeType::Lava);
        config.url = Some("https://lava.example.org".into());
        config.template_paths = vec![dir.path().to_path_buf()];
        let lava = LavaRuntime::new(config, test_support::renderer()).unwrap();

        let mut params = JobParams::default();
        params.insert("name", "baseline-arm64");
        params.insert("device_type", "rk3399-gru-kevin");
        params.insert("priority", 35);

        let definition = lava
            .generate(&test_support::job("baseline-arm64", "baseline.jinja2"), &params)
            .unwrap();
        assert_eq!(definition.document["device_type"], "rk3399-gru-kevin");
        assert_eq!(definition.document["priority"], 35);

        let mut incomplete = JobParams::default();
        incomplete.insert("name", "baseline-arm64");
        let err = lava
            .generate(&test_support::job("baseline-arm64", "baseline.jinja2"), &incomplete)
            .unwrap_err();
        assert!(matches!(err, Error::Render { .. }));
    }

    #[tokio::test]
    async fn test_submit_returns_job_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0.2/jobs/"))
            .and(header("Authorization", "Token secret"))
            .and(body_partial_json(json!({"definition": "job_name: baseline-arm64\n"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"job_ids": [4242]})))
            .mount(&server)
            .await;

        let lava = runtime(&server);
        let handle = lava.submit(&definition(), &test_support::node("n1")).await.unwrap();
        assert_eq!(handle, JobHandle::Backend("4242".into()));
        assert_eq!(lava.job_id(&handle), Some("4242".to_string()));
    }

    #[tokio::test]
    async fn test_submit_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = runtime(&server)
            .submit(&definition(), &test_support::node("n1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Submission(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_submit_rejected_definition_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid device type"))
            .mount(&server)
            .await;

        let err = runtime(&server)
            .submit(&definition(), &test_support::node("n1"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_submit_unreadable_response_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_string("<html>queued</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let lava = runtime(&server);
        let policy = lava.config().retry.clone();
        let definition = definition();
        let node = test_support::node("n1");
        let err = policy
            .run("submit", || lava.submit(&definition, &node))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Infrastructure(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_submit_without_job_id_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"job_ids": []})))
            .expect(1)
            .mount(&server)
            .await;

        let err = runtime(&server)
            .submit(&definition(), &test_support::node("n1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Infrastructure(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_wait_polls_until_finished() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v0.2/jobs/7/"))
            .respond_with(detail("Running", "Unknown"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v0.2/jobs/7/"))
            .respond_with(detail("Finished", "Complete"))
            .mount(&server)
            .await;

        let status = runtime(&server)
            .wait(&JobHandle::Backend("7".into()))
            .await
            .unwrap();
        assert_eq!(status, WaitStatus::Success);
    }

    #[tokio::test]
    async fn test_wait_incomplete_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v0.2/jobs/8/"))
            .respond_with(detail("Finished", "Incomplete"))
            .mount(&server)
            .await;

        let status = runtime(&server)
            .wait(&JobHandle::Backend("8".into()))
            .await
            .unwrap();
        assert_eq!(status.code(), 1);
    }

    #[tokio::test]
    async fn test_fetch_results_builds_hierarchy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v0.2/jobs/9/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": "Finished",
                "health": "Complete",
                "actual_device_id": "kevin-03",
                "definition": "job_name: baseline-arm64\n",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v0.2/jobs/9/suites/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"id": 1, "name": "lava"}, {"id": 2, "name": "1_baseline"}],
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/results/9/lava/yaml"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("- name: job\n  result: pass\n"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/results/9/1_baseline/yaml"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("- name: login\n  result: pass\n"),
            )
            .mount(&server)
            .await;

        let tree = runtime(&server)
            .fetch_results(&JobHandle::Backend("9".into()), &test_support::node("n9"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tree.name(), "baseline-arm64");
        assert_eq!(tree.result(), Some(NodeResult::Pass));
        assert_eq!(tree.node.data["device"], "kevin-03");
        assert!(tree.child("setup").is_some());
        assert_eq!(
            tree.child("baseline").unwrap().child("login").unwrap().result(),
            Some(NodeResult::Pass)
        );
    }
}
