//! Logical priority policy.
//!
//! The logical priority (0-100) of a dispatch does not depend on the backend;
//! runtimes scale it to their own range afterwards.

use fleet_core::config::JobConfig;
use fleet_core::node::Node;
use serde_json::Value;
use tracing::warn;

/// Submitters starting with this prefix are automated services.
pub const SERVICE_SUBMITTER_PREFIX: &str = "service:";

pub const PRIORITY_HIGH: u32 = 75;
pub const PRIORITY_MEDIUM: u32 = 50;
pub const PRIORITY_LOW: u32 = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityPolicy {
    /// Priority of user submissions.
    pub interactive: u32,
    /// Priority of an explicit value that cannot be interpreted.
    pub default: u32,
    /// Upper bound for automated, tree-priority-driven submissions.
    pub automated_ceiling: u32,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            interactive: 100,
            default: PRIORITY_MEDIUM,
            automated_ceiling: 40,
        }
    }
}

impl PriorityPolicy {
    /// Logical priority of running `job` for an event on `parent`.
    pub fn logical_priority(&self, parent: &Node, job: &JobConfig) -> u32 {
        if is_interactive(parent) {
            return self.interactive;
        }
        if let Some(explicit) = &job.priority {
            return self.explicit(&job.name, explicit);
        }
        let tree_priority = parent
            .lookup("tree_priority")
            .as_ref()
            .and_then(as_priority)
            .unwrap_or(0);
        tree_priority.min(self.automated_ceiling)
    }

    fn explicit(&self, job: &str, value: &Value) -> u32 {
        if let Some(numeric) = as_priority(value) {
            return numeric;
        }
        match value.as_str() {
            Some("high") => PRIORITY_HIGH,
            Some("medium") => PRIORITY_MEDIUM,
            Some("low") => PRIORITY_LOW,
            _ => {
                warn!(job, priority = %value, "Unrecognized priority, using default");
                self.default
            }
        }
    }
}

fn is_interactive(node: &Node) -> bool {
    node.submitter
        .as_deref()
        .is_some_and(|s| !s.starts_with(SERVICE_SUBMITTER_PREFIX))
}

fn as_priority(value: &Value) -> Option<u32> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    Some(number.clamp(0.0, 100.0).round() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::node::NodeKind;
    use serde_json::json;

    fn job(priority: Option<Value>) -> JobConfig {
        let mut job: JobConfig = serde_json::from_value(json!({"template": "t"})).unwrap();
        job.name = "baseline".into();
        job.priority = priority;
        job
    }

    fn checkout(submitter: Option<&str>, tree_priority: Option<u32>) -> Node {
        let mut node = Node::new(NodeKind::Checkout, "checkout");
        node.submitter = submitter.map(str::to_string);
        if let Some(p) = tree_priority {
            node.set_data("kernel_revision", json!({"tree": "mainline", "tree_priority": p}));
        }
        node
    }

    #[test]
    fn test_interactive_wins() {
        let policy = PriorityPolicy::default();
        let node = checkout(Some("user:alice"), Some(10));
        assert_eq!(policy.logical_priority(&node, &job(Some(json!("low")))), 100);
    }

    #[test]
    fn test_explicit_priorities() {
        let policy = PriorityPolicy::default();
        let node = checkout(Some("service:pipeline"), None);
        assert_eq!(policy.logical_priority(&node, &job(Some(json!("high")))), 75);
        assert_eq!(policy.logical_priority(&node, &job(Some(json!("low")))), 25);
        assert_eq!(policy.logical_priority(&node, &job(Some(json!(60)))), 60);
        assert_eq!(policy.logical_priority(&node, &job(Some(json!(400)))), 100);
        assert_eq!(policy.logical_priority(&node, &job(Some(json!("urgent")))), 50);
    }

    #[test]
    fn test_automated_capped() {
        let policy = PriorityPolicy::default();
        assert_eq!(policy.logical_priority(&checkout(None, Some(30)), &job(None)), 30);
        assert_eq!(policy.logical_priority(&checkout(None, Some(90)), &job(None)), 40);
        let service = checkout(Some("service:pipeline"), None);
        assert_eq!(policy.logical_priority(&service, &job(None)), 0);
    }
}
