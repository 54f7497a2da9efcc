//! Trigger matching.

use fleet_core::config::{JobConfig, PipelineConfig};
use fleet_core::events::NodeEvent;

/// Matcher for determining which jobs an event triggers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Jobs with a `run_on` entry for `channel` whose criteria the event meets.
    pub fn matching_jobs<'a>(
        &self,
        config: &'a PipelineConfig,
        event: &NodeEvent,
        channel: &str,
    ) -> Vec<&'a JobConfig> {
        config
            .jobs
            .values()
            .filter(|job| self.triggers(job, event, channel))
            .collect()
    }

    pub fn triggers(&self, job: &JobConfig, event: &NodeEvent, channel: &str) -> bool {
        job.run_on.iter().any(|run_on| run_on.matches(event, channel))
    }
}
