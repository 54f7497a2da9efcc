//! Node events delivered by the node/event service.

use crate::ids::NodeId;
use crate::node::Node;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOp {
    Created,
    Updated,
}

impl EventOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOp::Created => "created",
            EventOp::Updated => "updated",
        }
    }
}

/// An event payload: the operation plus the full node snapshot.
///
/// On the wire the snapshot is flattened next to `op`, so `id` is the node id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub op: EventOp,
    #[serde(flatten)]
    pub node: Node,
}

impl NodeEvent {
    pub fn new(op: EventOp, node: Node) -> Self {
        Self { op, node }
    }

    pub fn id(&self) -> Option<&NodeId> {
        self.node.id.as_ref()
    }

    /// Event field by name; `op` is the only field not taken from the node.
    pub fn field(&self, key: &str) -> Option<Value> {
        match key {
            "op" => Some(Value::from(self.op.as_str())),
            _ => self.node.lookup(key),
        }
    }

    /// Whether every listed criterion equals the event's field.
    pub fn matches(&self, criteria: &BTreeMap<String, Value>) -> bool {
        criteria.iter().all(|(key, expected)| {
            self.field(key)
                .is_some_and(|actual| values_equal(&actual, expected))
        })
    }
}

/// Equality tolerant of scalar representation (`1` == `"1"`).
fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::Number(b)) | (Value::Number(b), Value::String(a)) => {
            a == &b.to_string()
        }
        (Value::String(a), Value::Bool(b)) | (Value::Bool(b), Value::String(a)) => {
            a == &b.to_string()
        }
        _ => actual == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, NodeState};
    use serde_json::json;

    fn criteria(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    fn checkout_event() -> NodeEvent {
        let mut node = Node::new(NodeKind::Checkout, "checkout");
        node.id = Some(NodeId::new("n1"));
        node.set_data("kernel_revision", json!({"tree": "mainline", "branch": "master"}));
        NodeEvent::new(EventOp::Created, node)
    }

    #[test]
    fn test_wire_format_is_flat() {
        let event = checkout_event();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["op"], json!("created"));
        assert_eq!(value["id"], json!("n1"));
        assert_eq!(value["kind"], json!("checkout"));

        let back: NodeEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.id(), Some(&NodeId::new("n1")));
    }

    #[test]
    fn test_matches_subset() {
        let event = checkout_event();
        assert!(event.matches(&criteria(json!({"kind": "checkout"}))));
        assert!(event.matches(&criteria(json!({"kind": "checkout", "tree": "mainline"}))));
        assert!(event.matches(&criteria(json!({"op": "created"}))));
        assert!(event.matches(&BTreeMap::new()));

        assert!(!event.matches(&criteria(json!({"kind": "kbuild"}))));
        assert!(!event.matches(&criteria(json!({"result": "pass"}))));
    }

    #[test]
    fn test_matches_state_changes() {
        let mut event = checkout_event();
        event.node.set_state(NodeState::Available).unwrap();
        event.op = EventOp::Updated;
        assert!(event.matches(&criteria(json!({"state": "available", "op": "updated"}))));
    }
}
