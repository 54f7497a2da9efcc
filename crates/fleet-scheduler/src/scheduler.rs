//! Dispatch planning.
//!
//! Turning an event into `(job, runtime, platform)` targets is a pure
//! computation over the configuration. Runtimes or platforms that do not
//! resolve are skipped: partial configurations are expected during rollout.

use crate::triggers::TriggerMatcher;
use fleet_core::config::{
    JobConfig, PipelineConfig, PlatformConfig, RuntimeConfig, RuntimeSelector, SchedulerEntry,
};
use fleet_core::events::NodeEvent;
use rand::Rng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, trace};

/// One job to run on one platform of one runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub job: String,
    pub runtime: String,
    pub platform: String,
    /// Index of the scheduler entry that produced this target.
    pub entry: usize,
}

/// Resolved view of a [`DispatchTarget`].
#[derive(Debug, Clone, Copy)]
pub struct ResolvedTarget<'a> {
    pub job: &'a JobConfig,
    pub entry: &'a SchedulerEntry,
    pub runtime: &'a RuntimeConfig,
    pub platform: &'a PlatformConfig,
}

pub struct Scheduler {
    config: Arc<PipelineConfig>,
    matcher: TriggerMatcher,
}

impl Scheduler {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self {
            config,
            matcher: TriggerMatcher::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Jobs triggered by `event` on `channel`.
    pub fn match_jobs(&self, event: &NodeEvent, channel: &str) -> Vec<&JobConfig> {
        self.matcher.matching_jobs(&self.config, event, channel)
    }

    /// Scheduler entries of the triggered jobs, with their index.
    pub fn match_entries(&self, event: &NodeEvent, channel: &str) -> Vec<(usize, &SchedulerEntry)> {
        let jobs = self.match_jobs(event, channel);
        self.config
            .scheduler
            .iter()
            .enumerate()
            .filter(|(_, entry)| jobs.iter().any(|job| job.name == entry.job))
            .filter(|(_, entry)| {
                entry
                    .event
                    .as_ref()
                    .is_none_or(|criteria| criteria.matches(event, channel))
            })
            .collect()
    }

    pub fn dispatch(&self, event: &NodeEvent, channel: &str) -> Vec<DispatchTarget> {
        self.dispatch_with_rng(event, channel, &mut rand::thread_rng())
    }

    /// [`Scheduler::dispatch`] with the RNG picking among same-type runtimes.
    pub fn dispatch_with_rng<R: Rng + ?Sized>(
        &self,
        event: &NodeEvent,
        channel: &str,
        rng: &mut R,
    ) -> Vec<DispatchTarget> {
        let mut targets = Vec::new();
        for (index, entry) in self.match_entries(event, channel) {
            let Some(runtime) = self.select_runtime(&entry.runtime, rng) else {
                debug!(
                    job = %entry.job,
                    runtime = ?entry.runtime,
                    "Runtime not configured, skipping"
                );
                continue;
            };
            if self.config.job(&entry.job).is_none() {
                debug!(job = %entry.job, "Job not configured, skipping");
                continue;
            }

            let platforms = if entry.platforms.is_empty() {
                vec![runtime.runtime_type.as_str().to_string()]
            } else {
                entry.platforms.clone()
            };
            for platform in platforms {
                if self.config.platform(&platform).is_none() {
                    trace!(
                        job = %entry.job,
                        platform = %platform,
                        "Platform not configured, skipping"
                    );
                    continue;
                }
                targets.push(DispatchTarget {
                    job: entry.job.clone(),
                    runtime: runtime.name.clone(),
                    platform,
                    entry: index,
                });
            }
        }
        debug!(node_id = %event.node.id_str(), targets = targets.len(), "Planned dispatch");
        targets
    }

    fn select_runtime<R: Rng + ?Sized>(
        &self,
        selector: &RuntimeSelector,
        rng: &mut R,
    ) -> Option<&RuntimeConfig> {
        match selector {
            RuntimeSelector::Name(name) => self.config.runtime(name),
            RuntimeSelector::Type(runtime_type) => self
                .config
                .runtimes_of_type(*runtime_type)
                .choose(rng)
                .copied(),
        }
    }

    /// Look every part of `target` up in the configuration.
    pub fn resolve(&self, target: &DispatchTarget) -> Option<ResolvedTarget<'_>> {
        Some(ResolvedTarget {
            job: self.config.job(&target.job)?,
            entry: self.config.scheduler.get(target.entry)?,
            runtime: self.config.runtime(&target.runtime)?,
            platform: self.config.platform(&target.platform)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::NodeId;
    use fleet_core::events::EventOp;
    use fleet_core::node::{Node, NodeKind};
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;
    use std::collections::BTreeSet;

    const CONFIG: &str = r#"
jobs:
  baseline-arm64:
    template: baseline.jinja2
    run_on:
      - channel: node
        kind: checkout
  kunit:
    template: kunit.jinja2
    run_on:
      - channel: node
        kind: checkout
  kbuild-clang:
    template: kbuild.jinja2
    kind: kbuild
    run_on:
      - channel: node
        kind: kbuild

runtimes:
  lava-collabora:
    type: lava
    url: https://lava.collabora.dev
  lava-baylibre:
    type: lava
    url: https://lava.baylibre.com
  docker:
    type: docker

platforms:
  rk3399-gru-kevin:
    arch: arm64
  bcm2711-rpi-4-b:
    arch: arm64
  docker:
    arch: x86_64

scheduler:
  - job: baseline-arm64
    runtime:
      type: lava
    platforms:
      - rk3399-gru-kevin
      - bcm2711-rpi-4-b
      - not-a-platform
  - job: kunit
    runtime:
      name: docker
  - job: kunit
    runtime:
      name: lava-missing
  - job: kunit
    runtime:
      name: docker
    event:
      channel: node
      tree: next
"#;

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(PipelineConfig::from_yaml_str(CONFIG).unwrap()))
    }

    fn checkout(tree: &str) -> NodeEvent {
        let mut node = Node::new(NodeKind::Checkout, "checkout");
        node.id = Some(NodeId::new("c1"));
        node.set_data("kernel_revision", json!({"tree": tree, "branch": "master"}));
        NodeEvent::new(EventOp::Created, node)
    }

    #[test]
    fn test_match_entries() {
        let scheduler = scheduler();
        let event = checkout("mainline");
        let jobs: Vec<&str> = scheduler
            .match_jobs(&event, "node")
            .iter()
            .map(|j| j.name.as_str())
            .collect();
        assert_eq!(jobs, vec!["baseline-arm64", "kunit"]);

        let entries: Vec<usize> = scheduler
            .match_entries(&event, "node")
            .iter()
            .map(|(i, _)| *i)
            .collect();
        assert_eq!(entries, vec![0, 1, 2]);

        let next: Vec<usize> = scheduler
            .match_entries(&checkout("next"), "node")
            .iter()
            .map(|(i, _)| *i)
            .collect();
        assert_eq!(next, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_dispatch_skips_unresolved() {
        let scheduler = scheduler();
        let mut rng = StdRng::seed_from_u64(7);
        let targets = scheduler.dispatch_with_rng(&checkout("mainline"), "node", &mut rng);

        let summary: Vec<(&str, &str)> = targets
            .iter()
            .map(|t| (t.job.as_str(), t.platform.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("baseline-arm64", "rk3399-gru-kevin"),
                ("baseline-arm64", "bcm2711-rpi-4-b"),
                ("kunit", "docker"),
            ]
        );
        assert_eq!(targets[0].runtime, targets[1].runtime);
        assert!(targets[0].runtime.starts_with("lava-"));
        assert_eq!(targets[2].runtime, "docker");
        assert!(targets.iter().all(|t| scheduler.resolve(t).is_some()));
    }

    #[test]
    fn test_type_selector_covers_all_runtimes() {
        let scheduler = scheduler();
        let mut rng = StdRng::seed_from_u64(1);
        let chosen: BTreeSet<String> = (0..64)
            .map(|_| scheduler.dispatch_with_rng(&checkout("mainline"), "node", &mut rng))
            .map(|targets| targets[0].runtime.clone())
            .collect();
        assert_eq!(
            chosen,
            BTreeSet::from(["lava-baylibre".to_string(), "lava-collabora".to_string()])
        );
    }

    #[test]
    fn test_no_match_no_targets() {
        let scheduler = scheduler();
        let mut node = Node::new(NodeKind::Test, "login");
        node.id = Some(NodeId::new("t1"));
        let event = NodeEvent::new(EventOp::Created, node);
        assert!(scheduler.dispatch(&event, "node").is_empty());
    }
}
