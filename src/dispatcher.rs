//! Concurrency-bounded batch execution of one pipeline stage.
//!
//! Categories run one after another. Inside a category every job is its own
//! task gated by a semaphore, and each outcome lands at `results[category][index]`
//! regardless of completion order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{Client, GenerateArgs, Message, Role};
use crate::error::{EvalError, Result};
use crate::metrics::Metrics;
use crate::persist::write_json;
use crate::supervisor::{ServerHandle, ServerLauncher};

pub const DEFAULT_MAX_CONCURRENCY: usize = 256;

/// Where a translated fragment came from, so it can be put back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationMeta {
    pub turn: usize,
    pub conversation: Uuid,
    pub origin: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPayload {
    Chat(Vec<Message>),
    /// Questions are asked one at a time, each with the full history so far.
    MultiTurn {
        prefix: Vec<Message>,
        questions: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub category: String,
    pub index: usize,
    pub payload: JobPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<TranslationMeta>,
}

impl Job {
    pub fn chat(category: impl Into<String>, index: usize, messages: Vec<Message>) -> Self {
        Self {
            category: category.into(),
            index,
            payload: JobPayload::Chat(messages),
            meta: None,
        }
    }

    pub fn multi_turn(
        category: impl Into<String>,
        index: usize,
        prefix: Vec<Message>,
        questions: Vec<String>,
    ) -> Self {
        Self {
            category: category.into(),
            index,
            payload: JobPayload::MultiTurn { prefix, questions },
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: TranslationMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// A single reply, or the generated turns of a multi-turn job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Completion {
    Text(String),
    Conversation(Vec<Message>),
}

impl Completion {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Completion::Text(t) => Some(t),
            Completion::Conversation(_) => None,
        }
    }

    /// Assistant replies in order. A plain text completion is one reply.
    pub fn assistant_turns(&self) -> Vec<&str> {
        match self {
            Completion::Text(t) => vec![t.as_str()],
            Completion::Conversation(msgs) => msgs
                .iter()
                .filter(|m| m.role == Role::Assistant)
                .map(|m| m.content.as_str())
                .collect(),
        }
    }

    pub fn last_reply(&self) -> Option<&str> {
        self.assistant_turns().last().copied()
    }
}

pub type JobsByCategory = BTreeMap<String, Vec<Job>>;
pub type StageResults = BTreeMap<String, Vec<Option<Completion>>>;

/// Everything a stage needs to call its model.
#[derive(Clone)]
pub struct StageClient {
    pub name: String,
    pub client: Arc<Client>,
    pub model: String,
    pub args: GenerateArgs,
    pub system_prompt: Option<String>,
}

impl StageClient {
    pub async fn generate(&self, messages: &[Message]) -> Result<String> {
        self.client
            .generate(
                &self.model,
                self.system_prompt.as_deref(),
                messages,
                &self.args,
            )
            .await
    }

    async fn run_job(&self, job: &Job) -> Result<Completion> {
        let outcome = match &job.payload {
            JobPayload::Chat(messages) => self.generate(messages).await.map(Completion::Text),
            JobPayload::MultiTurn { prefix, questions } => {
                let mut history = prefix.clone();
                for question in questions {
                    history.push(Message::user(question.clone()));
                    let reply = self.generate(&history).await?;
                    history.push(Message::assistant(reply));
                }
                Ok(Completion::Conversation(history.split_off(prefix.len())))
            }
        };

        outcome.map_err(|e| match e {
            fatal if fatal.is_fatal() => fatal,
            EvalError::ItemProcessing { message, .. } => {
                EvalError::item(job.category.clone(), job.index, message)
            }
            other => EvalError::item(job.category.clone(), job.index, other.to_string()),
        })
    }
}

/// Job indices of a category must be exactly `0..len`, each used once.
fn check_dense_indices(category: &str, jobs: &[Job]) -> Result<()> {
    let mut seen = vec![false; jobs.len()];
    for job in jobs {
        match seen.get_mut(job.index) {
            Some(slot) if !*slot => *slot = true,
            Some(_) => {
                return Err(EvalError::config(format!(
                    "duplicate job index {} in category {}",
                    job.index, category
                )))
            }
            None => {
                return Err(EvalError::config(format!(
                    "job index {} out of range for {} jobs in category {}",
                    job.index,
                    jobs.len(),
                    category
                )))
            }
        }
    }
    Ok(())
}

/// Count of slots left empty by per-item failures.
pub fn count_failed(results: &StageResults) -> usize {
    results
        .values()
        .map(|slots| slots.iter().filter(|s| s.is_none()).count())
        .sum()
}

pub struct Dispatcher {
    max_concurrency: usize,
    launcher: Arc<dyn ServerLauncher>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(max_concurrency: usize, launcher: Arc<dyn ServerLauncher>) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            launcher,
            metrics: Metrics::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run every job of the stage and persist the results.
    ///
    /// The server handle is terminated and the results (partial on a fatal
    /// error) are written to `output_path` on every path out of this call.
    pub async fn process_subjects(
        &self,
        stage: StageClient,
        server: Option<ServerHandle>,
        jobs: &JobsByCategory,
        output_path: &Path,
    ) -> Result<StageResults> {
        let stage_name = stage.name.clone();
        let (results, fatal) = self.run_categories(&stage, jobs).await;

        self.launcher.terminate_server(server).await;
        drop(stage);

        let persisted = write_json(output_path, &results);

        if let Some(e) = fatal {
            if let Err(pe) = persisted {
                warn!(stage = %stage_name, "Failed to persist partial results: {}", pe);
            }
            return Err(e);
        }
        persisted?;
        Ok(results)
    }

    async fn run_categories(
        &self,
        stage: &StageClient,
        jobs: &JobsByCategory,
    ) -> (StageResults, Option<EvalError>) {
        let mut results: StageResults = BTreeMap::new();

        for (category, category_jobs) in jobs {
            if let Err(e) = check_dense_indices(category, category_jobs) {
                return (results, Some(e));
            }
            let mut slots: Vec<Option<Completion>> = vec![None; category_jobs.len()];

            info!(
                stage = %stage.name,
                category = %category,
                jobs = category_jobs.len(),
                "Processing category"
            );
            let start = Instant::now();

            let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
            let mut set = JoinSet::new();

            for job in category_jobs {
                let semaphore = semaphore.clone();
                let stage = stage.clone();
                let job = job.clone();
                set.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => {
                            return (
                                job.index,
                                Err(EvalError::item(job.category, job.index, "semaphore closed")),
                            )
                        }
                    };
                    let outcome = stage.run_job(&job).await;
                    (job.index, outcome)
                });
            }

            let mut failed = 0usize;
            while let Some(joined) = set.join_next().await {
                let (index, outcome) = match joined {
                    Ok(v) => v,
                    Err(e) if e.is_cancelled() => continue,
                    Err(e) => {
                        failed += 1;
                        self.metrics.record_item_failed();
                        warn!(stage = %stage.name, category = %category, "Job task panicked: {}", e);
                        continue;
                    }
                };

                match outcome {
                    Ok(completion) => slots[index] = Some(completion),
                    Err(e) if e.is_fatal() => {
                        error!(
                            stage = %stage.name,
                            category = %category,
                            index,
                            error = %e,
                            "Fatal error, aborting stage"
                        );
                        set.abort_all();
                        results.insert(category.clone(), slots);
                        return (results, Some(e));
                    }
                    Err(e) => {
                        failed += 1;
                        self.metrics.record_item_failed();
                        warn!(stage = %stage.name, category = %category, index, error = %e, "Job failed");
                    }
                }
            }

            info!(
                stage = %stage.name,
                category = %category,
                failed,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Category complete"
            );
            debug!(stage = %stage.name, category = %category, slots = slots.len(), "Results collected");
            results.insert(category.clone(), slots);
        }

        (results, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ChatBackend, ChatRequest, ProviderError, RetryPolicy};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Echoes the last user message after a random delay and tracks the
    /// peak number of concurrent calls.
    struct EchoBackend {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        max_delay_ms: u64,
        fail_on: Option<String>,
        fatal_on: Option<String>,
    }

    impl EchoBackend {
        fn new(max_delay_ms: u64) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                max_delay_ms,
                fail_on: None,
                fatal_on: None,
            }
        }
    }

    #[async_trait]
    impl ChatBackend for EchoBackend {
        async fn complete(
            &self,
            request: &ChatRequest,
        ) -> std::result::Result<String, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = if self.max_delay_ms == 0 {
                0
            } else {
                rand::thread_rng().gen_range(0..self.max_delay_ms)
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let last = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default();

            if self.fatal_on.as_deref() == Some(last.as_str()) {
                return Err(ProviderError::ModelNotFound("gone".into()));
            }
            if self.fail_on.as_deref() == Some(last.as_str()) {
                return Err(ProviderError::BadResponse("empty choices".into()));
            }
            Ok(format!("echo:{}", last))
        }
    }

    #[derive(Default)]
    struct RecordingLauncher {
        terminated: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl ServerLauncher for RecordingLauncher {
        async fn setup_server(&self, spec: &crate::supervisor::ServerSpec) -> Result<ServerHandle> {
            Ok(ServerHandle::detached(spec.host.clone(), spec.port))
        }

        async fn terminate_server(&self, handle: Option<ServerHandle>) {
            self.terminated.lock().push(handle.map(|h| h.address()));
        }
    }

    fn stage(backend: Arc<dyn ChatBackend>) -> StageClient {
        StageClient {
            name: "inference".into(),
            client: Arc::new(Client::new(backend).with_policy(RetryPolicy::immediate())),
            model: "stub".into(),
            args: GenerateArgs::default(),
            system_prompt: None,
        }
    }

    fn jobs(categories: &[&str], per_category: usize) -> JobsByCategory {
        categories
            .iter()
            .map(|c| {
                let list = (0..per_category)
                    .map(|i| Job::chat(*c, i, vec![Message::user(format!("{}-{}", c, i))]))
                    .collect();
                (c.to_string(), list)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_results_are_positional() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let dispatcher = Dispatcher::new(8, launcher);
        let backend = Arc::new(EchoBackend::new(15));

        let jobs = jobs(&["algebra", "biology"], 40);
        let results = dispatcher
            .process_subjects(stage(backend), None, &jobs, &tmp.path().join("out.json"))
            .await
            .unwrap();

        for (category, slots) in &results {
            assert_eq!(slots.len(), 40);
            for (i, slot) in slots.iter().enumerate() {
                let text = slot.as_ref().unwrap().as_text().unwrap();
                assert_eq!(text, format!("echo:{}-{}", category, i));
            }
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(4, Arc::new(RecordingLauncher::default()));
        let backend = Arc::new(EchoBackend::new(10));

        dispatcher
            .process_subjects(
                stage(backend.clone()),
                None,
                &jobs(&["a"], 50),
                &tmp.path().join("out.json"),
            )
            .await
            .unwrap();

        let peak = backend.peak.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak concurrency {} exceeded bound", peak);
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn test_item_failure_leaves_none_and_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(4, Arc::new(RecordingLauncher::default()));
        let mut backend = EchoBackend::new(0);
        backend.fail_on = Some("a-2".into());

        let results = dispatcher
            .process_subjects(
                stage(Arc::new(backend)),
                None,
                &jobs(&["a"], 5),
                &tmp.path().join("out.json"),
            )
            .await
            .unwrap();

        let slots = &results["a"];
        assert!(slots[2].is_none());
        assert_eq!(slots.iter().filter(|s| s.is_some()).count(), 4);
        assert_eq!(count_failed(&results), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_and_still_tears_down() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let dispatcher = Dispatcher::new(1, launcher.clone());
        let mut backend = EchoBackend::new(0);
        backend.fatal_on = Some("a-0".into());
        let out = tmp.path().join("out.json");

        let err = dispatcher
            .process_subjects(
                stage(Arc::new(backend)),
                Some(ServerHandle::detached("127.0.0.1", 8000)),
                &jobs(&["a", "b"], 3),
                &out,
            )
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(
            *launcher.terminated.lock(),
            vec![Some("127.0.0.1:8000".to_string())]
        );
        let partial: StageResults =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert!(partial.contains_key("a"));
        assert!(!partial.contains_key("b"));
    }

    #[tokio::test]
    async fn test_malformed_response_carries_job_context() {
        let mut backend = EchoBackend::new(0);
        backend.fail_on = Some("physics-4".into());
        let stage = stage(Arc::new(backend));

        let job = Job::chat("physics", 4, vec![Message::user("physics-4")]);
        match stage.run_job(&job).await.unwrap_err() {
            EvalError::ItemProcessing {
                category,
                index,
                message,
            } => {
                assert_eq!(category, "physics");
                assert_eq!(index, 4);
                assert!(message.contains("malformed response"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_sparse_indices_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let dispatcher = Dispatcher::new(2, launcher.clone());

        let mut sparse = JobsByCategory::new();
        sparse.insert(
            "a".into(),
            vec![
                Job::chat("a", 0, vec![Message::user("a-0")]),
                Job::chat("a", 1_000_000, vec![Message::user("a-1")]),
            ],
        );

        let err = dispatcher
            .process_subjects(
                stage(Arc::new(EchoBackend::new(0))),
                Some(ServerHandle::detached("127.0.0.1", 8000)),
                &sparse,
                &tmp.path().join("out.json"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Configuration(_)));
        assert_eq!(launcher.terminated.lock().len(), 1);

        let mut duplicated = JobsByCategory::new();
        duplicated.insert(
            "a".into(),
            vec![
                Job::chat("a", 0, vec![Message::user("a-0")]),
                Job::chat("a", 0, vec![Message::user("a-0")]),
            ],
        );
        let err = dispatcher
            .process_subjects(
                stage(Arc::new(EchoBackend::new(0))),
                None,
                &duplicated,
                &tmp.path().join("dup.json"),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate job index 0"));
    }

    #[tokio::test]
    async fn test_multi_turn_job_keeps_history() {
        let tmp = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(2, Arc::new(RecordingLauncher::default()));
        let backend = Arc::new(EchoBackend::new(0));

        let mut jobs = JobsByCategory::new();
        jobs.insert(
            "writing".into(),
            vec![Job::multi_turn(
                "writing",
                0,
                vec![Message::user("shot"), Message::assistant("shot answer")],
                vec!["first".into(), "second".into()],
            )],
        );

        let results = dispatcher
            .process_subjects(stage(backend), None, &jobs, &tmp.path().join("out.json"))
            .await
            .unwrap();

        let completion = results["writing"][0].as_ref().unwrap();
        assert_eq!(completion.assistant_turns(), vec!["echo:first", "echo:second"]);
        match completion {
            Completion::Conversation(msgs) => assert_eq!(msgs.len(), 4),
            other => panic!("unexpected completion {:?}", other),
        }
    }

    #[test]
    fn test_completion_json_shape() {
        let text = serde_json::to_value(Completion::Text("hi".into())).unwrap();
        assert_eq!(text, serde_json::json!("hi"));

        let conv: Completion =
            serde_json::from_str(r#"[{"role":"user","content":"q"},{"role":"assistant","content":"a"}]"#)
                .unwrap();
        assert_eq!(conv.last_reply(), Some("a"));
    }
}
