use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    LoadCategories,
    SameLanguage,
    CrossLanguage,
    Scoring,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Init => "init",
            RunState::LoadCategories => "load_categories",
            RunState::SameLanguage => "same_language",
            RunState::CrossLanguage => "cross_language",
            RunState::Scoring => "scoring",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: RunState,
    pub to: RunState,
    pub elapsed_ms: u64,
}

pub struct EvaluationProgress {
    run_id: Uuid,
    task: String,
    state: RunState,
    started_at: Instant,
    last_transition: Instant,
    transitions: Vec<StatusTransition>,
    total_stages: usize,
    completed_stages: usize,
    current_stage_name: Option<String>,
}

impl EvaluationProgress {
    pub fn new(task: impl Into<String>) -> Self {
        let now = Instant::now();
        let run_id = Uuid::new_v4();
        let task = task.into();
        info!(run_id = %run_id, task = %task, "Starting evaluation run");
        Self {
            run_id,
            task,
            state: RunState::Init,
            started_at: now,
            last_transition: now,
            transitions: Vec::new(),
            total_stages: 0,
            completed_stages: 0,
            current_stage_name: None,
        }
    }

    pub fn with_total_stages(mut self, total: usize) -> Self {
        self.total_stages = total;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_stages == 0 {
            return if self.state == RunState::Done { 100.0 } else { 0.0 };
        }
        (self.completed_stages as f64 / self.total_stages as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn transitions(&self) -> &[StatusTransition] {
        &self.transitions
    }

    pub fn transition_to(&mut self, next: RunState) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_transition).as_millis() as u64;

        debug!(
            run_id = %self.run_id,
            from = %self.state,
            to = %next,
            elapsed_ms = %elapsed,
            "Run state transition"
        );

        self.transitions.push(StatusTransition {
            from: self.state,
            to: next,
            elapsed_ms: elapsed,
        });
        self.state = next;
        self.last_transition = now;
    }

    pub fn begin_stage(&mut self, stage_name: impl Into<String>) {
        let name = stage_name.into();
        info!(
            run_id = %self.run_id,
            stage = %name,
            step = self.completed_stages + 1,
            of = self.total_stages,
            "Beginning pipeline stage"
        );
        self.current_stage_name = Some(name);
    }

    pub fn complete_stage(&mut self) {
        if let Some(ref name) = self.current_stage_name {
            debug!(run_id = %self.run_id, stage = %name, "Completed pipeline stage");
        }
        self.completed_stages += 1;
        self.current_stage_name = None;
    }

    pub fn complete(&mut self) {
        self.transition_to(RunState::Done);
        info!(
            run_id = %self.run_id,
            task = %self.task,
            elapsed_ms = %self.elapsed_ms(),
            stages_completed = %self.completed_stages,
            "Evaluation completed"
        );
    }

    pub fn fail(&mut self) {
        let stage = self.current_stage_name.clone().unwrap_or_default();
        self.transition_to(RunState::Failed);
        warn!(
            run_id = %self.run_id,
            task = %self.task,
            stage = %stage,
            elapsed_ms = %self.elapsed_ms(),
            stages_completed = %self.completed_stages,
            "Evaluation failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_progress() {
        let progress = EvaluationProgress::new("mmlu");
        assert_eq!(progress.state(), RunState::Init);
        assert_eq!(progress.progress_percent(), 0.0);
        assert!(progress.transitions().is_empty());
    }

    #[test]
    fn test_same_language_path() {
        let mut progress = EvaluationProgress::new("mmlu").with_total_stages(2);
        progress.transition_to(RunState::LoadCategories);
        progress.transition_to(RunState::SameLanguage);

        progress.begin_stage("inference");
        progress.complete_stage();
        assert!((progress.progress_percent() - 50.0).abs() < f64::EPSILON);

        progress.begin_stage("check");
        progress.complete_stage();
        progress.transition_to(RunState::Scoring);
        progress.complete();

        let states: Vec<_> = progress.transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                RunState::LoadCategories,
                RunState::SameLanguage,
                RunState::Scoring,
                RunState::Done
            ]
        );
        assert_eq!(progress.state(), RunState::Done);
        assert_eq!(progress.progress_percent(), 100.0);
    }

    #[test]
    fn test_fail_keeps_history() {
        let mut progress = EvaluationProgress::new("gsm8k");
        progress.transition_to(RunState::LoadCategories);
        progress.transition_to(RunState::CrossLanguage);
        progress.begin_stage("translate_questions");
        progress.fail();

        assert_eq!(progress.state(), RunState::Failed);
        let last = progress.transitions().last().unwrap();
        assert_eq!(last.from, RunState::CrossLanguage);
        assert_eq!(last.to, RunState::Failed);
        assert_eq!(progress.progress_percent(), 0.0);
    }

    #[test]
    fn test_state_display_matches_serde() {
        let json = serde_json::to_string(&RunState::LoadCategories).unwrap();
        assert_eq!(json, format!("\"{}\"", RunState::LoadCategories));
    }
}
