//! Canonical result tree.

use fleet_core::node::NodeResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The partial node carried by each level of a [`ResultHierarchy`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultNode {
    pub name: String,
    #[serde(default)]
    pub result: Option<NodeResult>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultHierarchy {
    pub node: ResultNode,
    #[serde(default)]
    pub child_nodes: Vec<ResultHierarchy>,
}

impl ResultHierarchy {
    pub fn new(name: impl Into<String>, result: Option<NodeResult>) -> Self {
        Self {
            node: ResultNode {
                name: name.into(),
                result,
                ..Default::default()
            },
            child_nodes: Vec::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.node.data.insert(key.to_string(), value.into());
        self
    }

    pub fn push(&mut self, child: ResultHierarchy) {
        self.child_nodes.push(child);
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn result(&self) -> Option<NodeResult> {
        self.node.result
    }

    pub fn child(&self, name: &str) -> Option<&ResultHierarchy> {
        self.child_nodes.iter().find(|c| c.node.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut ResultHierarchy> {
        self.child_nodes.iter_mut().find(|c| c.node.name == name)
    }

    /// Child `name`, created empty if missing.
    pub fn child_or_insert(&mut self, name: &str) -> &mut ResultHierarchy {
        let index = match self.child_nodes.iter().position(|c| c.node.name == name) {
            Some(index) => index,
            None => {
                self.child_nodes.push(ResultHierarchy::new(name, None));
                self.child_nodes.len() - 1
            }
        };
        &mut self.child_nodes[index]
    }

    /// Number of nodes below this one.
    pub fn descendant_count(&self) -> usize {
        self.child_nodes
            .iter()
            .map(|c| 1 + c.descendant_count())
            .sum()
    }

    pub fn set_error(&mut self, code: &str, message: impl Into<String>) {
        self.node.data.insert("error_code".into(), code.into());
        self.node.data.insert("error_msg".into(), message.into().into());
    }
}
