// Ingestion run orchestrator
//
// Runs the selected catalog groups one after another against a shared
// context. A failing group is reported and the run moves on to the next.

use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::catalog::GroupConfig;
use crate::config::IngestConfig;
use crate::error::Result;
use crate::pipeline::{GroupPipeline, GroupReport, PipelineContext};

/// Outcome of one run over several groups
#[derive(Debug)]
pub struct RunSummary {
    pub reports: Vec<GroupReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn failed_groups(&self) -> impl Iterator<Item = &GroupReport> {
        self.reports.iter().filter(|r| !r.succeeded())
    }
}

pub struct Orchestrator {
    context: PipelineContext,
}

impl Orchestrator {
    pub fn new(context: PipelineContext) -> Self {
        Self { context }
    }

    /// Open the store and API client described by `config`
    pub async fn from_config(config: &IngestConfig) -> Result<Self> {
        Ok(Self::new(PipelineContext::from_config(config).await?))
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Run every group in order
    pub async fn run(&self, groups: &[GroupConfig]) -> RunSummary {
        let start_time = Instant::now();
        info!(groups = groups.len(), "Starting ingestion run");

        let mut reports = Vec::with_capacity(groups.len());
        for group in groups {
            let report = GroupPipeline::new(&self.context, group).run().await;
            if let Some(err) = &report.error {
                error!(group = %report.group, error = %err, "Group failed, continuing");
            }
            reports.push(report);
        }

        let succeeded = reports.iter().filter(|r| r.succeeded()).count();
        let summary = RunSummary {
            failed: reports.len() - succeeded,
            succeeded,
            reports,
            duration: start_time.elapsed(),
        };

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Ingestion run complete in {:.2}s",
            summary.duration.as_secs_f64()
        );

        summary
    }
}
