//! Test fixtures: a pipeline configuration, its templates, nodes and
//! backend payloads.

use fleet_core::node::{Node, NodeKind, NodeResult, NodeState};
use serde_json::{Value, json};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A pipeline with one backend of each protocol family:
///
/// - checkout available: `kunit` and `kbuild-gcc-12-arm64` on the local shell
/// - kbuild passed: `baseline-arm64` on LAVA, `kselftest` on a pull lab
pub const PIPELINE_YAML: &str = r#"
jobs:
  kunit:
    template: kunit.yaml
    run_on:
      - channel: node
        kind: checkout
        state: available
    params:
      exit_code: 0

  kbuild-gcc-12-arm64:
    template: kbuild.yaml
    kind: kbuild
    run_on:
      - channel: node
        kind: checkout
        state: available
    params:
      defconfig: defconfig
      compiler: gcc-12
    rules:
      tree:
        - '!android'

  baseline-arm64:
    template: baseline.yaml
    run_on:
      - channel: node
        kind: kbuild
        result: pass
    rules:
      arch:
        - arm64
      tree:
        - 'linus:master'
        - mainline
        - stable
      branch:
        - '!stable:master'

  kselftest:
    template: kselftest.json
    priority: high
    run_on:
      - channel: node
        kind: kbuild
        result: pass
    params:
      tests:
        - cpufreq
        - timers

scheduler:
  - job: kunit
    runtime:
      type: shell
  - job: kbuild-gcc-12-arm64
    runtime:
      name: shell-local
  - job: baseline-arm64
    runtime:
      name: lava-collabora
    platforms:
      - bcm2711-rpi-4-b
      - qemu-arm64
  - job: kselftest
    runtime:
      name: pull-labs-demo
    platforms:
      - qemu-arm64

runtimes:
  lava-collabora:
    type: lava
    url: http://127.0.0.1:9/
    token: lava-secret
    priority_min: 40
    priority_max: 80
    poll_interval_secs: 0
    retry:
      max_attempts: 2
      initial_delay_ms: 0
      max_delay_ms: 0
  shell-local:
    type: shell
    retry:
      max_attempts: 1
  pull-labs-demo:
    type: pull_labs
    callback_token: lab-token
    priority: 50

platforms:
  shell: {}
  qemu:
    boot_method: qemu
    params:
      machine: virt
  qemu-arm64:
    base_name: qemu
    arch: arm64
  bcm2711-rpi-4-b:
    arch: arm64
    boot_method: u-boot
"#;

/// Templates referenced by [`PIPELINE_YAML`], by file name.
pub const TEMPLATES: &[(&str, &str)] = &[
    (
        "kunit.yaml",
        r#"script: |
  echo "kunit ${{ tree }}/${{ branch }}"
  exit ${{ exit_code }}
env:
  JOB_NAME: "${{ name }}"
"#,
    ),
    (
        "sleep.yaml",
        r#"script: "sleep ${{ seconds }}"
"#,
    ),
    (
        "kbuild.yaml",
        r#"script: |
  echo "make ${{ defconfig }} with ${{ compiler }}"
env:
  NODE: "${{ node_id }}"
"#,
    ),
    (
        "baseline.yaml",
        r#"job_name: ${{ name }}
device_type: ${{ device_type }}
priority: ${{ priority }}
context:
  arch: ${{ arch }}
actions: []
"#,
    ),
    (
        "kselftest.json",
        r#"{
  "name": "${{ name }}",
  "node_id": "${{ node_id }}",
  "platform": "${{ platform }}",
  "priority": ${{ priority }},
  "tests": ${{ tests | json }}
}
"#,
    ),
];

/// Factory for nodes at each level of the tree.
pub struct NodeFixture;

impl NodeFixture {
    /// An available checkout submitted by the pipeline service.
    pub fn checkout(tree: &str, branch: &str) -> Node {
        let mut node = Node::new(NodeKind::Checkout, "checkout");
        node.submitter = Some("service:pipeline".to_string());
        node.set_data(
            "kernel_revision",
            json!({
                "tree": tree,
                "branch": branch,
                "commit": "4fe89d07dcc2804c8b562f6c7896a45643d34b2f",
                "version": {"version": 6, "patchlevel": 8},
            }),
        );
        node.state = NodeState::Available;
        node
    }

    /// A passed kbuild below `checkout`.
    pub fn kbuild(checkout: &Node, arch: &str) -> Node {
        let name = format!("kbuild-gcc-12-{}", arch);
        let mut node = Node::child_of(checkout, NodeKind::Kbuild, name);
        node.set_data("arch", arch);
        node.set_data("defconfig", "defconfig");
        node.set_data("compiler", "gcc-12");
        node.state = NodeState::Done;
        node.result = Some(NodeResult::Pass);
        node
    }

    /// A running job node dispatched to `runtime`, waiting for a callback.
    pub fn pending_job(parent: &Node, name: &str, runtime: &str) -> Node {
        let mut node = Node::child_of(parent, NodeKind::Job, name);
        node.group = Some(name.to_string());
        node.set_data("runtime", runtime);
        node
    }
}

/// Pull-lab callback bodies.
pub struct CallbackFixture;

impl CallbackFixture {
    pub fn summary(total: u64, failed: u64) -> Value {
        json!({
            "metadata": {"device_id": "qemu-arm64-01"},
            "summary": {"total": total, "failed": failed},
            "tests": {},
            "artifacts": {},
        })
    }

    /// Two suites, one failure, and a base64 log ("boot ok\n").
    pub fn kselftest() -> Value {
        json!({
            "metadata": {"device_id": "qemu-arm64-01"},
            "summary": {"total": 3, "failed": 1},
            "tests": {
                "cpufreq": {
                    "status": "pass",
                    "duration_ms": 1200,
                    "subtests": {
                        "governors": {"status": "pass"},
                        "boost": {"status": "fail"},
                    },
                },
                "timers": {"status": "pass", "duration_ms": 300},
            },
            "artifacts": {
                "log": "Ym9vdCBvawo=",
                "dmesg": "https://lab.example.org/dmesg.txt",
            },
        })
    }

    pub fn lab_error() -> Value {
        json!({
            "metadata": {
                "device_id": "qemu-arm64-01",
                "error_code": "Infrastructure",
                "error_msg": "device did not boot",
            },
            "summary": {"total": 0, "failed": 0},
            "tests": {},
            "artifacts": {},
        })
    }
}

/// LAVA REST responses.
pub struct LavaFixture;

impl LavaFixture {
    pub const JOB_ID: u64 = 4242;

    pub fn submitted() -> Value {
        json!({"job_ids": [Self::JOB_ID]})
    }

    pub fn detail(state: &str, health: &str) -> Value {
        json!({
            "id": Self::JOB_ID,
            "state": state,
            "health": health,
            "actual_device_id": "bcm2711-rpi-4-b-01",
            "definition": "job_name: baseline-arm64\ndevice_type: bcm2711-rpi-4-b\n",
        })
    }

    pub fn suites() -> Value {
        json!({"results": [{"name": "lava"}, {"name": "0_baseline"}]})
    }

    pub fn lava_suite(job_result: &str) -> String {
        format!(
            concat!(
                "- name: http-download\n  result: pass\n  metadata: {{}}\n",
                "- name: job\n  result: {}\n  metadata:\n    error_type: Job\n",
            ),
            job_result
        )
    }

    /// Setup stage where the image download failed.
    pub fn setup_failure() -> &'static str {
        concat!(
            "- name: http-download\n  result: fail\n  metadata: {}\n",
            "- name: job\n  result: pass\n  metadata: {}\n",
        )
    }

    /// Callback-style poll payload, as a LAVA lab notification would post it.
    pub fn notification(lava_suite: &str) -> Value {
        json!({
            "id": Self::JOB_ID,
            "status": 2,
            "health": "Complete",
            "actual_device_id": "bcm2711-rpi-4-b-01",
            "definition": "job_name: baseline-arm64\n",
            "results": {
                "lava": lava_suite,
                "0_baseline": Self::baseline_suite(),
            },
        })
    }

    /// Serve a finished job whose `lava` suite is `lava_suite`.
    pub async fn mount(server: &MockServer, lava_suite: &str) {
        Mock::given(method("POST"))
            .and(path("/api/v0.2/jobs/"))
            .and(header("Authorization", "Token lava-secret"))
            .respond_with(ResponseTemplate::new(201).set_body_json(Self::submitted()))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/api/v0.2/jobs/{}/", Self::JOB_ID)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(Self::detail("Finished", "Complete")),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/api/v0.2/jobs/{}/suites/", Self::JOB_ID)))
            .respond_with(ResponseTemplate::new(200).set_body_json(Self::suites()))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/results/{}/lava/yaml", Self::JOB_ID)))
            .respond_with(ResponseTemplate::new(200).set_body_string(lava_suite.to_string()))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/results/{}/0_baseline/yaml", Self::JOB_ID)))
            .respond_with(ResponseTemplate::new(200).set_body_string(Self::baseline_suite()))
            .mount(server)
            .await;
    }

    pub fn baseline_suite() -> &'static str {
        concat!(
            "- name: dmesg-emerg\n  result: pass\n  metadata:\n    set: dmesg\n",
            "- name: dmesg-crit\n  result: pass\n  metadata:\n    set: dmesg\n",
            "- name: login\n  result: pass\n  metadata: {}\n",
        )
    }
}
