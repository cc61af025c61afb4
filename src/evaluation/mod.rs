pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod scoring;
pub mod translation;

pub use orchestrator::{Evaluator, StageKind};
pub use pipeline::{RunSummary, StageLedger};
pub use progress::{EvaluationProgress, RunState};
pub use scoring::ScoreRecord;
