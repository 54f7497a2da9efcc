//! Node types.
//!
//! A node is one unit of work or result in the hierarchy rooted at a
//! checkout: builds, jobs and the tests they produce.

use crate::error::{Error, Result};
use crate::ids::NodeId;
use chrono::{DateTime, Duration, Utc};
use fleet_rules::{FieldValue, KernelVersion, RuleSubject};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Default lifetime of a node before it is considered timed out.
pub const DEFAULT_NODE_TIMEOUT_HOURS: i64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Checkout,
    Kbuild,
    Job,
    Test,
    Regression,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Checkout => "checkout",
            NodeKind::Kbuild => "kbuild",
            NodeKind::Job => "job",
            NodeKind::Test => "test",
            NodeKind::Regression => "regression",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Running,
    Available,
    Closing,
    Done,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Running => "running",
            NodeState::Available => "available",
            NodeState::Closing => "closing",
            NodeState::Done => "done",
        }
    }

    /// Running -> {Available, Closing, Done}; Available -> {Closing, Done};
    /// Closing -> Done. Done is terminal.
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        matches!(
            (self, next),
            (
                NodeState::Running,
                NodeState::Available | NodeState::Closing | NodeState::Done
            ) | (NodeState::Available, NodeState::Closing | NodeState::Done)
                | (NodeState::Closing, NodeState::Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Done)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a node. An unset result is represented as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeResult {
    Pass,
    Fail,
    Skip,
    Incomplete,
}

impl NodeResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeResult::Pass => "pass",
            NodeResult::Fail => "fail",
            NodeResult::Skip => "skip",
            NodeResult::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for NodeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
    pub kind: NodeKind,
    pub name: String,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Parent reference, used for lookups only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeId>,
    pub state: NodeState,
    #[serde(default)]
    pub result: Option<NodeResult>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub timeout: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holdoff: Option<DateTime<Utc>>,
}

impl Node {
    /// A new root node in the running state.
    pub fn new(kind: NodeKind, name: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: None,
            kind,
            path: vec![name.clone()],
            name,
            group: None,
            parent: None,
            state: NodeState::Running,
            result: None,
            data: Map::new(),
            artifacts: BTreeMap::new(),
            submitter: None,
            created: now,
            updated: now,
            timeout: now + Duration::hours(DEFAULT_NODE_TIMEOUT_HOURS),
            holdoff: None,
        }
    }

    /// A new node below `parent`, inheriting its path and kernel revision.
    pub fn child_of(parent: &Node, kind: NodeKind, name: impl Into<String>) -> Self {
        let mut node = Self::new(kind, name);
        node.parent = parent.id.clone();
        node.path = parent.path.clone();
        node.path.push(node.name.clone());
        node.submitter = parent.submitter.clone();
        if let Some(revision) = parent.data.get("kernel_revision") {
            node.data
                .insert("kernel_revision".to_string(), revision.clone());
        }
        node
    }

    /// Move to `next`, enforcing the state machine.
    pub fn set_state(&mut self, next: NodeState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated = Utc::now();
        Ok(())
    }

    /// Close the node with a final result.
    pub fn finish(&mut self, result: NodeResult) -> Result<()> {
        if self.state != NodeState::Done {
            self.set_state(NodeState::Done)?;
        }
        self.result = Some(result);
        Ok(())
    }

    /// Mark the node incomplete and record why.
    pub fn fail_incomplete(
        &mut self,
        error_code: &str,
        error_msg: impl Into<String>,
    ) -> Result<()> {
        self.set_error(error_code, error_msg);
        self.finish(NodeResult::Incomplete)
    }

    pub fn set_error(&mut self, error_code: &str, error_msg: impl Into<String>) {
        self.set_data("error_code", error_code);
        self.set_data("error_msg", error_msg.into());
    }

    pub fn set_data(&mut self, key: &str, value: impl Into<Value>) {
        self.data.insert(key.to_string(), value.into());
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn kernel_revision(&self) -> Option<&Map<String, Value>> {
        self.data.get("kernel_revision").and_then(Value::as_object)
    }

    pub fn job_id(&self) -> Option<&str> {
        self.data_str("job_id")
    }

    pub fn error_code(&self) -> Option<&str> {
        self.data_str("error_code")
    }

    /// Look a field up by name: node attributes first, then `data`, then
    /// `data.kernel_revision`.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        let attribute = match key {
            "id" => self.id.as_ref().map(|id| Value::from(id.as_str())),
            "kind" => Some(Value::from(self.kind.as_str())),
            "name" => Some(Value::from(self.name.as_str())),
            "group" => self.group.as_deref().map(Value::from),
            "state" => Some(Value::from(self.state.as_str())),
            "result" => self.result.map(|r| Value::from(r.as_str())),
            "submitter" => self.submitter.as_deref().map(Value::from),
            "parent" => self.parent.as_ref().map(|id| Value::from(id.as_str())),
            _ => None,
        };
        attribute
            .or_else(|| self.data.get(key).cloned())
            .or_else(|| self.kernel_revision().and_then(|r| r.get(key)).cloned())
    }

    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn id_str(&self) -> &str {
        self.id.as_ref().map(NodeId::as_str).unwrap_or("<unsaved>")
    }
}

impl RuleSubject for Node {
    fn field(&self, key: &str) -> Option<FieldValue> {
        self.lookup(key).as_ref().and_then(FieldValue::from_json)
    }

    fn kernel_version(&self) -> Option<KernelVersion> {
        self.kernel_revision()
            .and_then(|r| r.get("version"))
            .and_then(|v| KernelVersion::from_json(v).ok())
    }
}
