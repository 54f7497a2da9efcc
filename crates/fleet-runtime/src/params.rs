//! Template parameters for one dispatch.

use fleet_core::config::{JobConfig, PlatformConfig, RuntimeConfig};
use fleet_core::node::Node;
use serde_json::{Map, Value};

/// Node data copied into the parameters when present.
const NODE_FIELDS: &[&str] = &["arch", "defconfig", "compiler", "config_full", "fragments"];

/// Kernel revision fields flattened into the parameters.
const REVISION_FIELDS: &[&str] = &["tree", "branch", "commit", "describe", "url"];

/// Parameters a job template is rendered with.
///
/// Sources are merged in increasing precedence: node data, runtime params,
/// platform params, job params. Identity fields (job name, node id, runtime,
/// platform, priority, artifacts) are set last.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobParams(Map<String, Value>);

impl JobParams {
    pub fn build(
        node: &Node,
        job: &JobConfig,
        platform: &PlatformConfig,
        runtime: &RuntimeConfig,
        priority: i64,
    ) -> Self {
        let mut params = Map::new();

        if let Some(revision) = node.kernel_revision() {
            for key in REVISION_FIELDS {
                if let Some(value) = revision.get(*key) {
                    params.insert((*key).to_string(), value.clone());
                }
            }
            params.insert("kernel_revision".into(), Value::Object(revision.clone()));
        }
        for key in NODE_FIELDS {
            if let Some(value) = node.data.get(*key) {
                params.insert((*key).to_string(), value.clone());
            }
        }

        params.extend(runtime.params.clone());

        if let Some(arch) = &platform.arch {
            params.insert("arch".into(), arch.clone().into());
        }
        if let Some(boot_method) = &platform.boot_method {
            params.insert("boot_method".into(), boot_method.clone().into());
        }
        params.extend(platform.params.clone());

        if let Some(image) = &job.image {
            params.insert("image".into(), image.clone().into());
        }
        params.extend(job.params.clone());

        params.insert("name".into(), job.name.clone().into());
        params.insert("node_id".into(), node.id_str().into());
        params.insert("runtime".into(), runtime.name.clone().into());
        params.insert("runtime_type".into(), runtime.runtime_type.as_str().into());
        params.insert("platform".into(), platform.name.clone().into());
        params.insert("device_type".into(), platform.device_type().into());
        params.insert("priority".into(), priority.into());
        params.insert(
            "artifacts".into(),
            Value::Object(
                node.artifacts
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                    .collect(),
            ),
        );

        Self(params)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }
}

impl From<Map<String, Value>> for JobParams {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support;
    use fleet_core::config::RuntimeType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_precedence() {
        let mut node = test_support::node("n1");
        node.set_data("arch", "x86_64");
        node.set_data("defconfig", "defconfig");
        node.set_data(
            "kernel_revision",
            json!({"tree": "mainline", "branch": "master", "commit": "abc"}),
        );
        node.artifacts.insert("kernel".into(), "https://storage/bzImage".into());

        let mut runtime = RuntimeConfig::new("lava-collabora", RuntimeType::Lava);
        runtime.params.insert("lab".into(), json!("collabora"));
        runtime.params.insert("timeout".into(), json!(10));

        let mut platform = PlatformConfig::new("rk3399-gru-kevin");
        platform.arch = Some("arm64".into());
        platform.params.insert("timeout".into(), json!(20));

        let mut job = test_support::job("baseline-arm64", "baseline.jinja2");
        job.params.insert("timeout".into(), json!(30));
        job.params.insert("name".into(), json!("ignored"));

        let params = JobParams::build(&node, &job, &platform, &runtime, 42);

        assert_eq!(params.get_str("arch"), Some("arm64"));
        assert_eq!(params.get_str("defconfig"), Some("defconfig"));
        assert_eq!(params.get_str("tree"), Some("mainline"));
        assert_eq!(params.get_str("lab"), Some("collabora"));
        assert_eq!(params.get("timeout"), Some(&json!(30)));
        assert_eq!(params.get_str("name"), Some("baseline-arm64"));
        assert_eq!(params.get_str("node_id"), Some("n1"));
        assert_eq!(params.get_str("device_type"), Some("rk3399-gru-kevin"));
        assert_eq!(params.get("priority"), Some(&json!(42)));
        assert_eq!(params.get("artifacts"), Some(&json!({"kernel": "https://storage/bzImage"})));
    }
}
