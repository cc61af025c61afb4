//! Run directory layout and JSON artifact writing.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{EvalError, Result};

pub const INFERENCE_RESULTS: &str = "inference_results.json";
pub const TRANSLATED_QUESTIONS: &str = "translated_question_record.json";
pub const TRANSLATED_RESPONSES: &str = "translated_response_record.json";
pub const CHECK_RESULTS: &str = "check_results.json";
pub const SCORE: &str = "score.json";
pub const RUN_SUMMARY: &str = "run_summary.json";
pub const METRICS: &str = "metrics.prom";

#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    /// Create `<output_dir>/<task>/<run_name>`. Fails when the run directory
    /// already exists so a previous run is never overwritten.
    pub fn create(output_dir: &Path, task: &str, run_name: &str) -> Result<Self> {
        let parent = output_dir.join(task);
        std::fs::create_dir_all(&parent).map_err(|e| EvalError::io(&parent, e))?;

        let root = parent.join(run_name);
        std::fs::create_dir(&root).map_err(|e| EvalError::io(&root, e))?;

        info!(path = %root.display(), "Created run directory");
        Ok(Self { root })
    }

    /// Wrap an existing directory without creating anything.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, artifact: &str) -> PathBuf {
        self.root.join(artifact)
    }
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(path, body).map_err(|e| EvalError::io(path, e))?;
    debug!(path = %path.display(), "Wrote artifact");
    Ok(())
}

pub fn write_text(path: &Path, body: &str) -> Result<()> {
    std::fs::write(path, body).map_err(|e| EvalError::io(path, e))
}
