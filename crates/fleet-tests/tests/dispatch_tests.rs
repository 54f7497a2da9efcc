//! Dispatch pipeline tests over submit-and-wait runtimes.

use fleet_core::node::{NodeKind, NodeResult, NodeState};
use fleet_scheduler::DispatchOutcome;
use fleet_tests::TestContext;
use fleet_tests::fixtures::{LavaFixture, NodeFixture, PIPELINE_YAML};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rejected_rules(outcomes: &[DispatchOutcome], job: &str) -> Vec<String> {
    outcomes
        .iter()
        .filter_map(|o| match o {
            DispatchOutcome::Rejected { job: j, rule, .. } if j == job => Some(rule.clone()),
            _ => None,
        })
        .collect()
}

fn count_matching(outcomes: &[DispatchOutcome], pred: impl Fn(&DispatchOutcome) -> bool) -> usize {
    outcomes.iter().filter(|o| pred(o)).count()
}

#[tokio::test]
async fn test_checkout_runs_shell_jobs() {
    let ctx = TestContext::new(PIPELINE_YAML).unwrap();
    let checkout = ctx.seed(NodeFixture::checkout("mainline", "master"));

    let outcomes = ctx.dispatch(&checkout).await;
    assert_eq!(outcomes.len(), 2, "{:?}", outcomes);
    for outcome in &outcomes {
        assert!(
            matches!(outcome, DispatchOutcome::Completed { result: Some(NodeResult::Pass), .. }),
            "{:?}",
            outcome
        );
    }

    let kunit = ctx.job_nodes("kunit");
    assert_eq!(kunit.len(), 1);
    let kunit = &kunit[0];
    assert_eq!(kunit.kind, NodeKind::Job);
    assert_eq!(kunit.state, NodeState::Done);
    assert_eq!(kunit.parent, checkout.id);
    assert_eq!(kunit.path, vec!["checkout".to_string(), "kunit".to_string()]);
    assert_eq!(kunit.data["runtime"], json!("shell-local"));
    assert_eq!(kunit.data["platform"], json!("shell"));
    assert_eq!(kunit.data["priority"], json!(0));
    assert!(kunit.job_id().is_some());

    let kbuild = &ctx.job_nodes("kbuild-gcc-12-arm64")[0];
    assert_eq!(kbuild.kind, NodeKind::Kbuild);
    assert_eq!(kbuild.result, Some(NodeResult::Pass));
}

#[tokio::test]
async fn test_failing_script_fails_job() {
    let ctx = TestContext::with_config(PIPELINE_YAML, |config| {
        if let Some(job) = config.jobs.get_mut("kunit") {
            job.params.insert("exit_code".into(), json!(3));
        }
    })
    .unwrap();
    let checkout = ctx.seed(NodeFixture::checkout("mainline", "master"));

    ctx.dispatch(&checkout).await;

    let kunit = &ctx.job_nodes("kunit")[0];
    assert_eq!(kunit.result, Some(NodeResult::Fail));
    assert_eq!(kunit.error_code(), None);
}

#[tokio::test]
async fn test_denied_tree_rejects_only_that_job() {
    let ctx = TestContext::new(PIPELINE_YAML).unwrap();
    let checkout = ctx.seed(NodeFixture::checkout("android", "android-mainline"));

    let outcomes = ctx.dispatch(&checkout).await;

    assert_eq!(rejected_rules(&outcomes, "kbuild-gcc-12-arm64"), vec!["tree".to_string()]);
    assert!(ctx.job_nodes("kbuild-gcc-12-arm64").is_empty());
    assert_eq!(ctx.job_nodes("kunit")[0].result, Some(NodeResult::Pass));
}

#[tokio::test]
async fn test_denied_tree_branch_combo() {
    let ctx = TestContext::new(PIPELINE_YAML).unwrap();
    let checkout = ctx.seed(NodeFixture::checkout("stable", "master"));
    let kbuild = ctx.seed(NodeFixture::kbuild(&checkout, "arm64"));

    let outcomes = ctx.dispatch(&kbuild).await;

    // one rejection per platform; `stable` alone is allowed
    assert_eq!(
        rejected_rules(&outcomes, "baseline-arm64"),
        vec!["branch".to_string(), "branch".to_string()]
    );
    assert!(ctx.job_nodes("baseline-arm64").is_empty());
    assert_eq!(
        count_matching(&outcomes, |o| matches!(o, DispatchOutcome::Submitted { .. })),
        1
    );
}

#[tokio::test]
async fn test_platform_architecture_must_match() {
    let ctx = TestContext::new(PIPELINE_YAML).unwrap();
    let checkout = ctx.seed(NodeFixture::checkout("mainline", "master"));
    let kbuild = ctx.seed(NodeFixture::kbuild(&checkout, "x86_64"));

    let outcomes = ctx.dispatch(&kbuild).await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(
        rejected_rules(&outcomes, "baseline-arm64"),
        vec!["arch".to_string(), "arch".to_string()]
    );
    assert_eq!(rejected_rules(&outcomes, "kselftest"), vec!["arch".to_string()]);
    assert!(ctx.nodes.children_of(kbuild.id.as_ref().unwrap()).is_empty());
}

#[tokio::test]
async fn test_render_failure_does_not_abort_siblings() {
    let ctx = TestContext::with_config(PIPELINE_YAML, |config| {
        if let Some(job) = config.jobs.get_mut("kunit") {
            job.params.remove("exit_code");
        }
    })
    .unwrap();
    let checkout = ctx.seed(NodeFixture::checkout("mainline", "master"));

    let outcomes = ctx.dispatch(&checkout).await;

    assert_eq!(
        count_matching(&outcomes, |o| matches!(
            o,
            DispatchOutcome::Failed { error_code, .. } if error_code == "invalid_job_params"
        )),
        1
    );
    let kunit = &ctx.job_nodes("kunit")[0];
    assert_eq!(kunit.state, NodeState::Done);
    assert_eq!(kunit.result, Some(NodeResult::Incomplete));
    assert_eq!(kunit.error_code(), Some("invalid_job_params"));
    assert!(kunit.data_str("error_msg").unwrap().contains("exit_code"));

    assert_eq!(ctx.job_nodes("kbuild-gcc-12-arm64")[0].result, Some(NodeResult::Pass));
}

#[tokio::test]
async fn test_wait_timeout_marks_node_timed_out() {
    let ctx = TestContext::with_config(PIPELINE_YAML, |config| {
        if let Some(runtime) = config.runtimes.get_mut("shell-local") {
            runtime.wait_timeout_secs = 1;
        }
        if let Some(job) = config.jobs.get_mut("kunit") {
            job.template = "sleep.yaml".into();
            job.params.insert("seconds".into(), json!(10));
        }
    })
    .unwrap();
    let checkout = ctx.seed(NodeFixture::checkout("mainline", "master"));

    let outcomes = ctx.dispatch(&checkout).await;

    assert_eq!(
        count_matching(&outcomes, |o| matches!(
            o,
            DispatchOutcome::Failed { error_code, .. } if error_code == "node_timeout"
        )),
        1
    );
    let kunit = &ctx.job_nodes("kunit")[0];
    assert_eq!(kunit.result, Some(NodeResult::Incomplete));
    assert_eq!(kunit.error_code(), Some("node_timeout"));
}

#[tokio::test]
async fn test_lava_results_become_test_nodes() {
    let server = MockServer::start().await;
    LavaFixture::mount(&server, &LavaFixture::lava_suite("pass")).await;
    let ctx = TestContext::with_lava(PIPELINE_YAML, &server.uri()).unwrap();
    let checkout = ctx.seed(NodeFixture::checkout("mainline", "master"));
    let kbuild = ctx.seed(NodeFixture::kbuild(&checkout, "arm64"));

    let outcomes = ctx.dispatch(&kbuild).await;

    assert_eq!(
        count_matching(&outcomes, |o| matches!(
            o,
            DispatchOutcome::Completed { result: Some(NodeResult::Pass), .. }
        )),
        2
    );

    let jobs = ctx.job_nodes("baseline-arm64");
    assert_eq!(jobs.len(), 2);
    let mut platforms: Vec<&str> = jobs.iter().filter_map(|j| j.data_str("platform")).collect();
    platforms.sort();
    assert_eq!(platforms, vec!["bcm2711-rpi-4-b", "qemu-arm64"]);

    let job = &jobs[0];
    assert_eq!(job.job_id(), Some("4242"));
    assert_eq!(job.data["device"], json!("bcm2711-rpi-4-b-01"));
    assert_eq!(job.data["priority"], json!(40));
    assert_eq!(job.data["arch"], json!("arm64"));

    let job_id = job.id.clone().unwrap();
    let mut suites: Vec<String> =
        ctx.nodes.children_of(&job_id).into_iter().map(|n| n.name).collect();
    suites.sort();
    assert_eq!(suites, vec!["baseline".to_string(), "setup".to_string()]);

    let emerg = ctx
        .nodes
        .all()
        .into_iter()
        .find(|n| n.name == "dmesg-emerg")
        .unwrap();
    assert_eq!(emerg.kind, NodeKind::Test);
    assert_eq!(emerg.state, NodeState::Done);
    assert_eq!(emerg.result, Some(NodeResult::Pass));
    assert_eq!(
        emerg.path,
        vec![
            "checkout",
            "kbuild-gcc-12-arm64",
            "baseline-arm64",
            "baseline",
            "dmesg",
            "dmesg-emerg",
        ]
    );
}

#[tokio::test]
async fn test_lava_setup_failure_is_incomplete() {
    let server = MockServer::start().await;
    LavaFixture::mount(&server, LavaFixture::setup_failure()).await;
    let ctx = TestContext::with_lava(PIPELINE_YAML, &server.uri()).unwrap();
    let checkout = ctx.seed(NodeFixture::checkout("mainline", "master"));
    let kbuild = ctx.seed(NodeFixture::kbuild(&checkout, "arm64"));

    ctx.dispatch(&kbuild).await;

    for job in ctx.job_nodes("baseline-arm64") {
        assert_eq!(job.result, Some(NodeResult::Incomplete));
        assert_eq!(job.error_code(), Some("Infrastructure"));
        assert_eq!(job.data["error_msg"], Value::from("setup stage failed"));
    }
}

#[tokio::test]
async fn test_lava_submit_retries_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v0.2/jobs/"))
        .respond_with(ResponseTemplate::new(503))
        .expect(4)
        .mount(&server)
        .await;
    let ctx = TestContext::with_lava(PIPELINE_YAML, &server.uri()).unwrap();
    let checkout = ctx.seed(NodeFixture::checkout("mainline", "master"));
    let kbuild = ctx.seed(NodeFixture::kbuild(&checkout, "arm64"));

    let outcomes = ctx.dispatch(&kbuild).await;

    assert_eq!(
        count_matching(&outcomes, |o| matches!(
            o,
            DispatchOutcome::Failed { error_code, node_id: Some(_) } if error_code == "submit_error"
        )),
        2
    );
    for job in ctx.job_nodes("baseline-arm64") {
        assert_eq!(job.result, Some(NodeResult::Incomplete));
        assert_eq!(job.error_code(), Some("submit_error"));
    }
    // the pull lab is unaffected
    assert_eq!(ctx.job_nodes("kselftest").len(), 1);
}

#[tokio::test]
async fn test_node_creation_retried() {
    let ctx = TestContext::with_config(PIPELINE_YAML, |config| {
        if let Some(runtime) = config.runtimes.get_mut("shell-local") {
            runtime.retry = fleet_core::retry::RetryPolicy::immediate(3);
        }
    })
    .unwrap();
    let checkout = ctx.seed(NodeFixture::checkout("mainline", "master"));
    ctx.nodes.fail_next_creates(1);

    let outcomes = ctx.dispatch(&checkout).await;

    assert_eq!(
        count_matching(&outcomes, |o| matches!(o, DispatchOutcome::Completed { .. })),
        2
    );
}

#[tokio::test]
async fn test_pull_lab_upload_failure_is_submit_error() {
    let ctx = TestContext::with_config(PIPELINE_YAML, |config| {
        config.scheduler.retain(|entry| entry.job != "baseline-arm64");
        if let Some(runtime) = config.runtimes.get_mut("pull-labs-demo") {
            runtime.retry = fleet_core::retry::RetryPolicy::immediate(2);
        }
    })
    .unwrap();
    let checkout = ctx.seed(NodeFixture::checkout("mainline", "master"));
    let kbuild = ctx.seed(NodeFixture::kbuild(&checkout, "arm64"));
    ctx.storage.set_offline(true);

    let outcomes = ctx.dispatch(&kbuild).await;

    assert_eq!(outcomes.len(), 1, "{:?}", outcomes);
    assert!(
        matches!(
            &outcomes[0],
            DispatchOutcome::Failed { error_code, node_id: Some(_) } if error_code == "submit_error"
        ),
        "{:?}",
        outcomes[0]
    );
    let job = ctx.job_nodes("kselftest").remove(0);
    assert_eq!(job.state, NodeState::Done);
    assert_eq!(job.result, Some(NodeResult::Incomplete));
    assert_eq!(job.error_code(), Some("submit_error"));
    assert!(ctx.storage.uploads().is_empty());
}
