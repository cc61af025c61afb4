use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::progress::{RunState, StatusTransition};
use crate::task::BenchmarkFamily;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage_name: String,
    pub model: String,
    pub jobs: usize,
    pub failed: usize,
    pub execution_time_ms: u64,
    pub artifact: String,
}

/// Ordered record of the stages a run went through.
#[derive(Debug, Default)]
pub struct StageLedger {
    stages: Vec<StageRecord>,
}

impl StageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stage(
        &mut self,
        stage_name: impl Into<String>,
        model: impl Into<String>,
        jobs: usize,
        failed: usize,
        execution_time_ms: u64,
        artifact: impl Into<String>,
    ) {
        let name = stage_name.into();
        debug!(
            stage = %name,
            jobs = %jobs,
            failed = %failed,
            execution_time_ms = %execution_time_ms,
            "Recording pipeline stage result"
        );
        self.stages.push(StageRecord {
            stage_name: name,
            model: model.into(),
            jobs,
            failed,
            execution_time_ms,
            artifact: artifact.into(),
        });
    }

    pub fn total_execution_time_ms(&self) -> u64 {
        self.stages.iter().map(|s| s.execution_time_ms).sum()
    }

    pub fn failure_rate(&self) -> f64 {
        let jobs: usize = self.stages.iter().map(|s| s.jobs).sum();
        if jobs == 0 {
            return 0.0;
        }
        let failed: usize = self.stages.iter().map(|s| s.failed).sum();
        failed as f64 / jobs as f64
    }

    pub fn stage_results(&self) -> &[StageRecord] {
        &self.stages
    }
}

/// Contents of `run_summary.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub task: String,
    pub family: BenchmarkFamily,
    pub source_language: String,
    pub target_language: Option<String>,
    pub config_fingerprint: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: RunState,
    pub transitions: Vec<StatusTransition>,
    pub stages: Vec<StageRecord>,
    pub total_stage_time_ms: u64,
    /// Share of planned stages that finished, 0 to 100.
    pub progress_percent: f64,
    /// Failed jobs over all jobs of the recorded stages.
    pub failure_rate: f64,
    pub average: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
