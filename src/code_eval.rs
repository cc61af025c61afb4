//! Functional-correctness scoring of generated code.
//!
//! Each sample is written next to its problem's tests and executed in the
//! sandbox. pass@k is estimated per problem and averaged.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{EvalError, Result};
use crate::evaluation::scoring::pass_at_k;
use crate::sandbox::{self, SandboxConfig};
use crate::task::CodeExample;

const DEFAULT_PARALLELISM: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSample {
    pub task_id: String,
    pub completion: String,
}

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Returns `{"pass@k": fraction}` for every k that all problems support.
    async fn evaluate_functional_correctness(
        &self,
        samples: &[CodeSample],
        problems: &[CodeExample],
        ks: &[usize],
    ) -> Result<BTreeMap<String, f64>>;
}

fn source_extension(language: &str) -> &str {
    match language {
        "python" | "py" => ".py",
        "javascript" | "js" | "node" => ".js",
        _ => ".sh",
    }
}

fn source_runner(language: &str, script_path: &str) -> Vec<String> {
    match language {
        "python" | "py" => vec!["python3".into(), script_path.into()],
        "javascript" | "js" | "node" => vec!["node".into(), script_path.into()],
        _ => vec!["sh".into(), script_path.into()],
    }
}

fn check_call(language: &str, entry_point: &str) -> String {
    match language {
        "python" | "py" => format!("check({})", entry_point),
        "javascript" | "js" | "node" => format!("check({});", entry_point),
        _ => format!("check {}", entry_point),
    }
}

fn fenced_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[\w+-]*[ \t]*\r?\n(.*?)```").expect("fence pattern is valid"))
}

/// First fenced code block of a completion, or the whole text when none.
pub fn extract_code(completion: &str) -> String {
    fenced_block()
        .captures(completion)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| completion.to_string())
}

/// Program text for one sample: the solution, the problem's tests and the
/// call that runs them. The prompt is prepended when the completion does not
/// define the entry point itself.
pub fn assemble_program(language: &str, problem: &CodeExample, completion: &str) -> String {
    let code = extract_code(completion);
    let defines_entry = code.contains(&format!("def {}", problem.entry_point))
        || code.contains(&format!("function {}", problem.entry_point))
        || code.contains(&format!("{}()", problem.entry_point));
    let body = if defines_entry {
        code
    } else {
        format!("{}{}", problem.prompt, code)
    };
    format!(
        "{}\n\n{}\n\n{}\n",
        body,
        problem.test,
        check_call(language, &problem.entry_point)
    )
}

/// Adds one sample to its problem's `(samples, passed)` tally. A sample that
/// could not be executed counts as a failed attempt.
fn record_sample(
    tallies: &mut BTreeMap<String, (usize, usize)>,
    task_id: String,
    outcome: Result<bool>,
) {
    let passed = match outcome {
        Ok(passed) => passed,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Sample could not be executed, counting as failed");
            false
        }
    };
    let entry = tallies.entry(task_id).or_insert((0, 0));
    entry.0 += 1;
    if passed {
        entry.1 += 1;
    }
}

pub struct SandboxCodeExecutor {
    language: String,
    config: SandboxConfig,
    parallelism: usize,
}

impl Default for SandboxCodeExecutor {
    fn default() -> Self {
        Self::new("python")
    }
}

impl SandboxCodeExecutor {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            config: SandboxConfig::default(),
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    pub fn with_config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    async fn run_sample(
        language: &str,
        config: &SandboxConfig,
        problem: &CodeExample,
        completion: &str,
    ) -> Result<bool> {
        let dir = tempfile::tempdir().map_err(|e| EvalError::io(std::env::temp_dir(), e))?;
        let script_name = format!("solution{}", source_extension(language));
        let script = dir.path().join(&script_name);
        tokio::fs::write(&script, assemble_program(language, problem, completion))
            .await
            .map_err(|e| EvalError::io(&script, e))?;

        let argv = source_runner(language, &script_name);
        let out = sandbox::run(&argv, dir.path(), config).await?;
        if !out.passed() {
            debug!(
                task_id = %problem.task_id,
                exit_code = out.exit_code,
                timed_out = out.timed_out,
                "Sample failed"
            );
        }
        Ok(out.passed())
    }
}

#[async_trait]
impl CodeExecutor for SandboxCodeExecutor {
    async fn evaluate_functional_correctness(
        &self,
        samples: &[CodeSample],
        problems: &[CodeExample],
        ks: &[usize],
    ) -> Result<BTreeMap<String, f64>> {
        let by_id: BTreeMap<&str, &CodeExample> =
            problems.iter().map(|p| (p.task_id.as_str(), p)).collect();

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut set = JoinSet::new();
        for sample in samples {
            let Some(problem) = by_id.get(sample.task_id.as_str()) else {
                warn!(task_id = %sample.task_id, "Sample for unknown problem, skipping");
                continue;
            };
            let problem = (*problem).clone();
            let completion = sample.completion.clone();
            let language = self.language.clone();
            let config = self.config.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let passed = Self::run_sample(&language, &config, &problem, &completion).await;
                (problem.task_id, passed)
            });
        }

        // task_id -> (samples, passed)
        let mut tallies: BTreeMap<String, (usize, usize)> = problems
            .iter()
            .map(|p| (p.task_id.clone(), (0, 0)))
            .collect();
        while let Some(joined) = set.join_next().await {
            let (task_id, passed) = match joined {
                Ok(v) => v,
                Err(e) => {
                    warn!("Sample task panicked: {}", e);
                    continue;
                }
            };
            record_sample(&mut tallies, task_id, passed);
        }

        // Problems whose generations all failed are not scorable
        tallies.retain(|_, (n, _)| *n > 0);
        if tallies.is_empty() {
            return Ok(BTreeMap::new());
        }

        let min_samples = tallies.values().map(|(n, _)| *n).min().unwrap_or(0);
        let mut result = BTreeMap::new();
        for &k in ks {
            if k == 0 || k > min_samples {
                warn!(k, min_samples, "Not enough samples per problem for pass@k, skipping");
                continue;
            }
            let mean = tallies
                .values()
                .map(|(n, c)| pass_at_k(*n, *c, k))
                .sum::<f64>()
                / tallies.len() as f64;
            result.insert(format!("pass@{}", k), mean);
        }

        info!(
            problems = tallies.len(),
            samples = samples.len(),
            "Functional correctness evaluated"
        );
        Ok(result)
    }
}
