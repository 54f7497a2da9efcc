//! Dispatch pipeline.
//!
//! The orchestrator consumes node events, plans dispatch targets, and runs
//! each target concurrently: admission, priority, node creation, job
//! generation, submission, and for submit-and-wait runtimes the wait and
//! result collection. Callbacks from submit-and-forget labs come in through
//! [`Orchestrator::handle_callback`].

use crate::priority::PriorityPolicy;
use crate::scheduler::{DispatchTarget, ResolvedTarget, Scheduler};
use crate::updater::NodeUpdater;
use chrono::Utc;
use fleet_core::config::{PipelineConfig, RuntimeConfig, RuntimeType};
use fleet_core::error::{INFRASTRUCTURE_ERROR, NODE_TIMEOUT, SUBMIT_ERROR};
use fleet_core::events::NodeEvent;
use fleet_core::node::{DEFAULT_NODE_TIMEOUT_HOURS, Node, NodeKind, NodeResult, NodeState};
use fleet_core::ports::{ArtifactStorage, NodeService};
use fleet_core::subscription::Subscription;
use fleet_core::{Error, NodeId, Result};
use fleet_results::pull_labs::LOG_ARTIFACT;
use fleet_results::{CallbackPayload, LavaJobResults, ResultHierarchy, decode_log, finalize};
use fleet_rules::{Admission, RuleSubject, admit};
use fleet_runtime::{
    JobHandle, JobParams, Protocol, Runtime, WaitStatus, resolve_priority, wait_with_timeout,
};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pause before receiving again after a transient event-source error.
const EVENT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What happened to one dispatch target.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Part of the configuration vanished between planning and dispatch.
    Skipped { job: String, runtime: String },
    /// Admission rules turned the node down; no node was created.
    Rejected {
        job: String,
        platform: String,
        rule: String,
        reason: String,
    },
    /// Handed to a submit-and-forget runtime; a callback will finish it.
    Submitted {
        node_id: NodeId,
        job_id: Option<String>,
    },
    /// Waited for and finalized.
    Completed {
        node_id: NodeId,
        result: Option<NodeResult>,
    },
    /// Ended early; the node, if created, is marked incomplete.
    Failed {
        node_id: Option<NodeId>,
        error_code: String,
    },
}

impl DispatchOutcome {
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            DispatchOutcome::Submitted { node_id, .. }
            | DispatchOutcome::Completed { node_id, .. } => Some(node_id),
            DispatchOutcome::Failed { node_id, .. } => node_id.as_ref(),
            DispatchOutcome::Skipped { .. } | DispatchOutcome::Rejected { .. } => None,
        }
    }
}

pub struct Orchestrator {
    scheduler: Scheduler,
    runtimes: BTreeMap<String, Arc<dyn Runtime>>,
    nodes: Arc<dyn NodeService>,
    storage: Arc<dyn ArtifactStorage>,
    updater: NodeUpdater,
    policy: PriorityPolicy,
}

impl Orchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        runtimes: BTreeMap<String, Arc<dyn Runtime>>,
        nodes: Arc<dyn NodeService>,
        storage: Arc<dyn ArtifactStorage>,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(config),
            runtimes,
            updater: NodeUpdater::new(nodes.clone()),
            nodes,
            storage,
            policy: PriorityPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: PriorityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        self.scheduler.config()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn runtime(&self, name: &str) -> Option<&Arc<dyn Runtime>> {
        self.runtimes.get(name)
    }

    /// Consume events from `channel` until `shutdown` resolves.
    ///
    /// Dispatches already in flight are drained before returning.
    pub async fn run<S>(
        self: Arc<Self>,
        channel: &str,
        filter: BTreeMap<String, Value>,
        shutdown: S,
    ) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let subscription = Subscription::open(self.nodes.as_ref(), channel, filter).await?;
        info!(channel, subscription = %subscription.id(), "Orchestrator started");

        tokio::pin!(shutdown);
        let mut tasks: JoinSet<Vec<DispatchOutcome>> = JoinSet::new();
        let result = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = done {
                        error!(error = %e, "Event task failed");
                    }
                }
                event = subscription.next_event(self.nodes.as_ref()) => match event {
                    Ok(event) => {
                        debug!(
                            node_id = %event.node.id_str(),
                            op = event.op.as_str(),
                            "Event received"
                        );
                        let orchestrator = self.clone();
                        let channel = channel.to_string();
                        tasks.spawn(
                            async move { orchestrator.handle_event(event, &channel).await },
                        );
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(error = %e, "Receiving event failed, retrying");
                        tokio::time::sleep(EVENT_RETRY_DELAY).await;
                    }
                    Err(e) => break Err(e),
                },
            }
        };

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for in-flight dispatches");
        }
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "Event task failed");
            }
        }
        if let Err(e) = subscription.close(self.nodes.as_ref()).await {
            warn!(error = %e, "Failed to close subscription");
        }
        info!(channel, "Orchestrator stopped");
        result
    }

    /// Dispatch every target planned for `event`, one task per target.
    pub async fn handle_event(
        self: &Arc<Self>,
        event: NodeEvent,
        channel: &str,
    ) -> Vec<DispatchOutcome> {
        let targets = self.scheduler.dispatch(&event, channel);
        if targets.is_empty() {
            return Vec::new();
        }

        let parent = Arc::new(event.node);
        let mut tasks = JoinSet::new();
        for target in targets {
            tasks.spawn(self.clone().process_target(parent.clone(), target));
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Dispatch task failed"),
            }
        }
        outcomes
    }

    async fn process_target(
        self: Arc<Self>,
        parent: Arc<Node>,
        target: DispatchTarget,
    ) -> DispatchOutcome {
        let skipped = || DispatchOutcome::Skipped {
            job: target.job.clone(),
            runtime: target.runtime.clone(),
        };
        let Some(resolved) = self.scheduler.resolve(&target) else {
            return skipped();
        };
        let Some(runtime) = self.runtimes.get(&target.runtime).cloned() else {
            warn!(job = %target.job, runtime = %target.runtime, "Runtime not created, skipping");
            return skipped();
        };

        let mut candidate = Node::child_of(&parent, resolved.job.kind, &resolved.job.name);
        candidate.group = Some(resolved.job.name.clone());
        candidate.set_data("runtime", runtime.name());
        candidate.set_data("platform", resolved.platform.name.as_str());
        let arch = parent
            .lookup("arch")
            .or_else(|| resolved.platform.arch.clone().map(Value::from));
        if let Some(arch) = arch {
            candidate.set_data("arch", arch);
        }

        if let Some(rejected) = self.check_rules(&resolved, &candidate, parent.as_ref()) {
            return rejected;
        }

        let logical = self.policy.logical_priority(&parent, resolved.job);
        let priority = resolve_priority(logical, runtime.config());
        candidate.set_data("priority", priority);
        candidate.timeout = Utc::now()
            + chrono::Duration::from_std(runtime.config().wait_timeout())
                .unwrap_or_else(|_| chrono::Duration::hours(DEFAULT_NODE_TIMEOUT_HOURS));

        let retry = &runtime.config().retry;
        let node = match retry.run("create_node", || self.nodes.create_node(&candidate)).await {
            Ok(node) => node,
            Err(e) => {
                error!(job = %resolved.job.name, error = %e, "Failed to create job node");
                return DispatchOutcome::Failed {
                    node_id: None,
                    error_code: e.error_code().to_string(),
                };
            }
        };
        let Some(node_id) = node.id.clone() else {
            error!(job = %resolved.job.name, "Node service returned a node without id");
            return DispatchOutcome::Failed {
                node_id: None,
                error_code: INFRASTRUCTURE_ERROR.to_string(),
            };
        };
        debug!(node_id = %node_id, job = %resolved.job.name, logical, priority, "Created job node");

        let params = JobParams::build(
            &node,
            resolved.job,
            resolved.platform,
            runtime.config(),
            priority,
        );
        let definition = match runtime.generate(resolved.job, &params) {
            Ok(definition) => definition,
            Err(e) => return self.fail(&node_id, e).await,
        };
        let handle = match retry.run("submit", || runtime.submit(&definition, &node)).await {
            Ok(handle) => handle,
            Err(e) => return self.fail_with_code(&node_id, SUBMIT_ERROR, e).await,
        };

        let job_id = runtime.job_id(&handle);
        if let Err(e) = self.record_submission(&node_id, job_id.as_deref(), &handle).await {
            warn!(node_id = %node_id, error = %e, "Failed to record submission");
        }

        match runtime.protocol() {
            Protocol::SubmitAndForget => {
                self.clone()
                    .watch_deadline(node_id.clone(), runtime.config().wait_timeout());
                DispatchOutcome::Submitted { node_id, job_id }
            }
            Protocol::SubmitAndWait => self.complete(runtime.as_ref(), &node, &handle).await,
        }
    }

    /// Platform architecture, then job, platform and scheduler-entry rules.
    fn check_rules(
        &self,
        resolved: &ResolvedTarget<'_>,
        candidate: &Node,
        parent: &Node,
    ) -> Option<DispatchOutcome> {
        if let (Some(wanted), Some(Value::String(arch))) =
            (&resolved.platform.arch, candidate.lookup("arch"))
            && *wanted != arch
        {
            info!(
                job = %resolved.job.name,
                platform = %resolved.platform.name,
                arch = %arch,
                "Node rejected, platform architecture does not match"
            );
            return Some(DispatchOutcome::Rejected {
                job: resolved.job.name.clone(),
                platform: resolved.platform.name.clone(),
                rule: "arch".to_string(),
                reason: format!("platform is {}, node is {}", wanted, arch),
            });
        }

        let parent: &dyn RuleSubject = parent;
        let scopes = [
            ("job", resolved.job.rules.as_ref()),
            ("platform", resolved.platform.rules.as_ref()),
            ("scheduler", resolved.entry.rules.as_ref()),
        ];
        for (scope, rules) in scopes {
            if let Admission::Rejected(rejection) = admit(rules, candidate, Some(parent)) {
                info!(
                    job = %resolved.job.name,
                    platform = %resolved.platform.name,
                    parent = %candidate.parent.as_ref().map(NodeId::as_str).unwrap_or("-"),
                    scope,
                    reason = %rejection,
                    "Node rejected"
                );
                return Some(DispatchOutcome::Rejected {
                    job: resolved.job.name.clone(),
                    platform: resolved.platform.name.clone(),
                    rule: rejection.rule,
                    reason: rejection.reason,
                });
            }
        }
        None
    }

    async fn record_submission(
        &self,
        node_id: &NodeId,
        job_id: Option<&str>,
        handle: &JobHandle,
    ) -> Result<()> {
        self.updater
            .update(node_id, |node| {
                if let Some(job_id) = job_id {
                    node.set_data("job_id", job_id);
                }
                if let JobHandle::Stored { url } = handle {
                    node.artifacts.insert("job_definition".into(), url.clone());
                }
                Ok(true)
            })
            .await
            .map(|_| ())
    }

    async fn complete(
        &self,
        runtime: &dyn Runtime,
        node: &Node,
        handle: &JobHandle,
    ) -> DispatchOutcome {
        let Some(node_id) = node.id.clone() else {
            return DispatchOutcome::Failed {
                node_id: None,
                error_code: INFRASTRUCTURE_ERROR.to_string(),
            };
        };

        let timeout = runtime.config().wait_timeout();
        let status = match wait_with_timeout(runtime, handle, timeout).await {
            Ok(status) => status,
            Err(e) => return self.fail(&node_id, e).await,
        };
        let tree = match runtime.fetch_results(handle, node).await {
            Ok(Some(tree)) => tree,
            Ok(None) => status_tree(&node.name, status),
            Err(e) => return self.fail(&node_id, e).await,
        };

        match self.apply_hierarchy(&node_id, tree).await {
            Ok(node) => DispatchOutcome::Completed {
                node_id,
                result: node.result,
            },
            Err(e) => self.fail(&node_id, e).await,
        }
    }

    async fn fail(&self, node_id: &NodeId, error: Error) -> DispatchOutcome {
        self.fail_with_code(node_id, error.error_code(), error).await
    }

    async fn fail_with_code(
        &self,
        node_id: &NodeId,
        error_code: &str,
        error: Error,
    ) -> DispatchOutcome {
        warn!(node_id = %node_id, error = %error, error_code, "Dispatch failed");
        if let Err(e) = self.mark_incomplete(node_id, error_code, &error.to_string()).await {
            error!(node_id = %node_id, error = %e, "Failed to mark node incomplete");
        }
        DispatchOutcome::Failed {
            node_id: Some(node_id.clone()),
            error_code: error_code.to_string(),
        }
    }

    async fn mark_incomplete(
        &self,
        node_id: &NodeId,
        error_code: &str,
        message: &str,
    ) -> Result<Option<Node>> {
        self.updater
            .update(node_id, |node| {
                if node.is_done() {
                    return Ok(false);
                }
                node.fail_incomplete(error_code, message)?;
                Ok(true)
            })
            .await
    }

    fn watch_deadline(self: Arc<Self>, node_id: NodeId, timeout: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Err(e) = self.expire(&node_id).await {
                error!(node_id = %node_id, error = %e, "Failed to expire node");
            }
        });
    }

    /// Mark the node timed out unless a result already closed it.
    pub async fn expire(&self, node_id: &NodeId) -> Result<bool> {
        let expired = self
            .mark_incomplete(node_id, NODE_TIMEOUT, "no result before the node timeout")
            .await?;
        if expired.is_some() {
            warn!(node_id = %node_id, "Node timed out");
        }
        Ok(expired.is_some())
    }

    /// Process a result callback for `node_id` sent by `runtime`.
    ///
    /// A node dispatched to another runtime is left untouched and the callback
    /// is refused with [`Error::ConfigurationMismatch`]. An unparseable body
    /// marks the node incomplete and is returned as [`Error::ResultParse`].
    pub async fn handle_callback(
        &self,
        node_id: &NodeId,
        runtime: &str,
        body: &[u8],
    ) -> Result<Node> {
        let runtime = self
            .config()
            .runtime(runtime)
            .ok_or_else(|| Error::ConfigurationMismatch {
                kind: "runtime",
                name: runtime.to_string(),
            })?;
        let node = self
            .nodes
            .get_node(node_id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        if node.data_str("runtime") != Some(runtime.name.as_str()) {
            warn!(
                node_id = %node_id,
                runtime = %runtime.name,
                expected = node.data_str("runtime").unwrap_or("none"),
                "Callback from a runtime the node was not dispatched to"
            );
            return Err(Error::ConfigurationMismatch {
                kind: "runtime",
                name: runtime.name.clone(),
            });
        }

        info!(node_id = %node_id, runtime = %runtime.name, "Callback received");
        let tree = match self.parse_callback(runtime, &node, body).await {
            Ok(tree) => tree,
            Err(e) => {
                warn!(node_id = %node_id, runtime = %runtime.name, error = %e, "Invalid callback");
                self.mark_incomplete(node_id, e.error_code(), &e.to_string())
                    .await?;
                return Err(e);
            }
        };
        self.apply_hierarchy(node_id, tree).await
    }

    async fn parse_callback(
        &self,
        runtime: &RuntimeConfig,
        node: &Node,
        body: &[u8],
    ) -> Result<ResultHierarchy> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| Error::ResultParse(format!("callback body is not JSON: {}", e)))?;
        match runtime.runtime_type {
            RuntimeType::PullLabs => {
                let callback = CallbackPayload::from_json(&payload)?;
                let mut tree = callback.to_hierarchy(&node.name)?;
                if let Some(log) = callback.log() {
                    match self.upload_log(runtime, node, log).await {
                        Ok(url) => {
                            tree.node.artifacts.insert(LOG_ARTIFACT.into(), url);
                        }
                        Err(e) => warn!(
                            node_id = %node.id_str(),
                            error = %e,
                            "Failed to upload callback log"
                        ),
                    }
                }
                Ok(tree)
            }
            RuntimeType::Lava => LavaJobResults::from_json(&payload)?.to_hierarchy(&node.name),
            other => Err(Error::ResultParse(format!("{} runtimes do not send callbacks", other))),
        }
    }

    async fn upload_log(&self, runtime: &RuntimeConfig, node: &Node, log: &str) -> Result<String> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&decode_log(log))?;
        file.flush()?;
        let dest_path = format!(
            "{}/{}",
            runtime.storage_prefix.trim_end_matches('/'),
            node.id_str()
        );
        runtime
            .retry
            .run("upload_log", || {
                self.storage.upload_single(file.path(), "log.txt", &dest_path)
            })
            .await
    }

    /// Finalize `tree` and apply it: the job node is closed with the
    /// top-level result, every descendant becomes a `test` node.
    ///
    /// A node that is already done keeps its state and is returned as is.
    pub async fn apply_hierarchy(
        &self,
        node_id: &NodeId,
        mut tree: ResultHierarchy,
    ) -> Result<Node> {
        let kind = self
            .nodes
            .get_node(node_id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?
            .kind;
        finalize(&mut tree, kind);

        let root = &tree.node;
        let updated = self
            .updater
            .update(node_id, |node| {
                if node.is_done() {
                    warn!(node_id = %node_id, "Node already done, dropping results");
                    return Ok(false);
                }
                node.data.extend(root.data.clone());
                node.artifacts.extend(root.artifacts.clone());
                match root.result {
                    Some(result) => node.finish(result)?,
                    None => node.fail_incomplete(INFRASTRUCTURE_ERROR, "no result reported")?,
                }
                Ok(true)
            })
            .await?;

        let Some(job_node) = updated else {
            return self
                .nodes
                .get_node(node_id)
                .await?
                .ok_or_else(|| Error::NodeNotFound(node_id.to_string()));
        };

        let created = match self.create_children(&job_node, &tree.child_nodes).await {
            Ok(created) => created,
            Err((created, e)) => {
                error!(node_id = %node_id, created, error = %e, "Failed to store test results");
                let message =
                    format!("failed to store test results after {} nodes: {}", created, e);
                self.updater
                    .update(node_id, |node| {
                        node.fail_incomplete(INFRASTRUCTURE_ERROR, message.as_str())?;
                        Ok(true)
                    })
                    .await?;
                return Err(e);
            }
        };
        info!(
            node_id = %node_id,
            result = %job_node.result.map(|r| r.as_str()).unwrap_or("none"),
            children = created,
            "Results applied"
        );
        Ok(job_node)
    }

    /// Store `children` breadth first. On failure, returns how many were
    /// stored before it.
    async fn create_children(
        &self,
        parent: &Node,
        children: &[ResultHierarchy],
    ) -> std::result::Result<usize, (usize, Error)> {
        let mut pending: VecDeque<(Node, &ResultHierarchy)> =
            children.iter().map(|c| (parent.clone(), c)).collect();
        let mut created = 0;
        while let Some((parent, tree)) = pending.pop_front() {
            let mut node = Node::child_of(&parent, NodeKind::Test, &tree.node.name);
            node.group = parent.group.clone();
            node.data.extend(tree.node.data.clone());
            node.artifacts = tree.node.artifacts.clone();
            node.result = tree.node.result;
            node.set_state(NodeState::Done).map_err(|e| (created, e))?;

            let stored = self.nodes.create_node(&node).await.map_err(|e| (created, e))?;
            created += 1;
            pending.extend(tree.child_nodes.iter().map(|c| (stored.clone(), c)));
        }
        Ok(created)
    }
}

/// Single-node tree for runtimes that only report an exit status.
fn status_tree(name: &str, status: WaitStatus) -> ResultHierarchy {
    match status {
        WaitStatus::Success => ResultHierarchy::new(name, Some(NodeResult::Pass)),
        WaitStatus::Failure => ResultHierarchy::new(name, Some(NodeResult::Fail)),
        WaitStatus::Infrastructure => {
            let mut tree = ResultHierarchy::new(name, Some(NodeResult::Incomplete));
            tree.set_error(INFRASTRUCTURE_ERROR, "runtime reported an infrastructure failure");
            tree
        }
    }
}
