//! Run state machine: load categories, run the same- or cross-language
//! stages, then score.
//!
//! Each stage activates its own client (and local server when configured),
//! and the dispatcher tears that server down before the next stage starts,
//! so at most one model server is alive at any time.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::pipeline::{RunSummary, StageLedger};
use super::progress::{EvaluationProgress, RunState};
use super::scoring::{
    bool_signals, compute_code_score, compute_score, mcqa_correctness, open_correctness,
    ExactMatch, ScoreRecord, TextMetric,
};
use super::translation::{
    apply_question_translations, assign_conversations, plan_question_translation,
    plan_response_translation, recombine, ExamplesByCategory,
};
use crate::client::{ChatBackend, Client, HttpBackend, Provider};
use crate::code_eval::{CodeExecutor, CodeSample, SandboxCodeExecutor};
use crate::config::{ClientConfig, ClientMode, RunConfig};
use crate::dispatcher::{
    count_failed, Completion, Dispatcher, Job, JobPayload, JobsByCategory, StageClient,
    StageResults,
};
use crate::error::{EvalError, Result};
use crate::metrics::Metrics;
use crate::persist::{self, write_json, write_text, RunDir};
use crate::sandbox::SandboxConfig;
use crate::supervisor::{LocalServerLauncher, ServerHandle, ServerLauncher};
use crate::task::dataset::DatasetSource;
use crate::task::{BenchmarkFamily, Example, Task, TranslationExample};
use crate::template::{TemplateRegistry, TemplateStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Inference,
    Checker,
    Translator,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Inference => "inference",
            StageKind::Checker => "checker",
            StageKind::Translator => "translator",
        }
    }
}

/// Where each judged item's verdicts live in the check results.
enum JudgeLayout {
    /// (first slot, option count, gold option) per item
    Mcqa(Vec<Option<(usize, usize, usize)>>),
    Open(Vec<Option<usize>>),
}

/// Final stage outputs, ready to score.
enum Graded {
    Judged {
        judge: StageResults,
        layout: BTreeMap<String, JudgeLayout>,
    },
    Code(StageResults),
    Text(StageResults),
}

pub struct Evaluator {
    config: RunConfig,
    task: Task,
    dataset: Arc<dyn DatasetSource>,
    templates: Arc<TemplateRegistry>,
    launcher: Option<Arc<dyn ServerLauncher>>,
    code_executor: Arc<dyn CodeExecutor>,
    text_metric: Arc<dyn TextMetric>,
    metrics: Arc<Metrics>,
    backends: HashMap<StageKind, Arc<dyn ChatBackend>>,
    reference: Option<Task>,
    progress: EvaluationProgress,
    ledger: StageLedger,
}

impl Evaluator {
    pub fn new(
        config: RunConfig,
        task: Task,
        dataset: Arc<dyn DatasetSource>,
        templates: Arc<TemplateRegistry>,
    ) -> Result<Self> {
        config.validate(&task)?;

        let sandbox = SandboxConfig {
            timeout: Duration::from_secs(config.code_timeout_secs),
            ..SandboxConfig::default()
        };
        let code_executor =
            Arc::new(SandboxCodeExecutor::new(config.code_language.clone()).with_config(sandbox));
        let progress = EvaluationProgress::new(task.name.clone());

        Ok(Self {
            config,
            task,
            dataset,
            templates,
            launcher: None,
            code_executor,
            text_metric: Arc::new(ExactMatch),
            metrics: Metrics::new(),
            backends: HashMap::new(),
            reference: None,
            progress,
            ledger: StageLedger::new(),
        })
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ServerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Route a stage to `backend` instead of an HTTP endpoint.
    pub fn with_backend(mut self, stage: StageKind, backend: Arc<dyn ChatBackend>) -> Self {
        self.backends.insert(stage, backend);
        self
    }

    pub fn with_code_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.code_executor = executor;
        self
    }

    pub fn with_text_metric(mut self, metric: Arc<dyn TextMetric>) -> Self {
        self.text_metric = metric;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Translation task whose examples seed the translator with few-shot pairs.
    pub fn with_reference_task(mut self, reference: Task) -> Result<Self> {
        if reference.family != BenchmarkFamily::Translation {
            return Err(EvalError::config(format!(
                "reference task '{}' is not a translation task",
                reference.name
            )));
        }
        self.reference = Some(reference);
        Ok(self)
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn progress(&self) -> &EvaluationProgress {
        &self.progress
    }

    fn total_stages(&self) -> usize {
        let family = self.task.family;
        let judge = usize::from(family.uses_checker());
        if self.task.is_cross_language() {
            let back = usize::from(family != BenchmarkFamily::Code);
            2 + back + judge
        } else {
            1 + judge
        }
    }

    pub async fn run(&mut self) -> Result<ScoreRecord> {
        let started_at = Utc::now();
        let run_dir = RunDir::create(
            &self.config.output_dir,
            &self.task.name,
            &self.config.run_name(),
        )?;

        if self.launcher.is_none() {
            let mut launcher = LocalServerLauncher::new(self.config.server.command.clone())
                .with_extra_args(self.config.server.extra_args.clone())
                .with_policy(self.config.server.startup.clone());
            if self.config.server.log_to_run_dir {
                launcher = launcher.with_log_dir(run_dir.root().to_path_buf());
            }
            self.launcher = Some(Arc::new(launcher));
        }

        let total = self.total_stages();
        self.progress = EvaluationProgress::new(self.task.name.clone()).with_total_stages(total);

        let outcome = self.execute(&run_dir).await;
        match outcome {
            Ok(ref record) => {
                self.progress.complete();
                info!(
                    task = %self.task.name,
                    average = ?record.average(),
                    run_dir = %run_dir.root().display(),
                    "Scores written"
                );
            }
            Err(ref e) => {
                self.progress.fail();
                warn!(task = %self.task.name, error = %e, "Run failed, partial artifacts kept");
            }
        }

        let (record, error) = match outcome {
            Ok(ref r) => (Some(r), None),
            Err(ref e) => (None, Some(e.to_string())),
        };
        if let Err(e) = self.write_summary(&run_dir, started_at, record, error) {
            warn!("Failed to write run summary: {}", e);
        }
        outcome
    }

    async fn execute(&mut self, run_dir: &RunDir) -> Result<ScoreRecord> {
        self.progress.transition_to(RunState::LoadCategories);
        let (examples, shots) = self.load_categories().await?;

        let graded = if self.task.is_cross_language() {
            self.progress.transition_to(RunState::CrossLanguage);
            self.run_cross_language(&examples, run_dir).await?
        } else {
            self.progress.transition_to(RunState::SameLanguage);
            self.run_same_language(&examples, &shots, run_dir).await?
        };

        self.progress.transition_to(RunState::Scoring);
        let record = self.score(&examples, graded).await?;
        write_json(&run_dir.path(persist::SCORE), &record)?;
        Ok(record)
    }

    /// Examples per category plus the seeded few-shot sample for each.
    async fn load_categories(&self) -> Result<(ExamplesByCategory, ExamplesByCategory)> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut examples = ExamplesByCategory::new();
        let mut shots = ExamplesByCategory::new();

        for category in &self.task.categories {
            let list = self
                .dataset
                .load(&self.task, category, &self.task.split)
                .await?;

            let sampled = if self.config.num_fewshot > 0 {
                let support = self.dataset.support(&self.task, category).await?;
                if support.len() < self.config.num_fewshot {
                    warn!(
                        category = %category.key,
                        available = support.len(),
                        requested = self.config.num_fewshot,
                        "Support split smaller than num_fewshot"
                    );
                }
                support
                    .choose_multiple(&mut rng, self.config.num_fewshot)
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };

            info!(
                category = %category.key,
                display_name = %category.display_name,
                examples = list.len(),
                shots = sampled.len(),
                "Loaded category"
            );
            examples.insert(category.key.clone(), list);
            shots.insert(category.key.clone(), sampled);
        }
        Ok((examples, shots))
    }

    async fn run_same_language(
        &mut self,
        examples: &ExamplesByCategory,
        shots: &ExamplesByCategory,
        run_dir: &RunDir,
    ) -> Result<Graded> {
        let present: BTreeMap<String, Vec<Option<Example>>> = examples
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().map(Some).collect()))
            .collect();
        let language = self.task.source_language.clone();
        let inference = self
            .run_inference(&present, shots, &language, run_dir)
            .await?;
        self.finish(examples, inference, run_dir).await
    }

    async fn run_cross_language(
        &mut self,
        examples: &ExamplesByCategory,
        run_dir: &RunDir,
    ) -> Result<Graded> {
        let family = self.task.family;
        let source = self.task.source_language.clone();
        let target = self.task.inference_language().to_string();
        let translator = self.stage_config(StageKind::Translator)?;
        if self.config.num_fewshot > 0 {
            warn!("Few-shot examples are not used in cross-language runs");
        }

        let forward_shots = self.reference_shots().await?;
        let backward_shots: Vec<TranslationExample> = forward_shots
            .iter()
            .map(|s| TranslationExample {
                source: s.target.clone(),
                target: s.source.clone(),
            })
            .collect();

        let ids = assign_conversations(examples);

        let strategy = self.templates.get(family, &source)?;
        let plan = plan_question_translation(
            examples,
            &ids,
            strategy.as_ref(),
            &source,
            &target,
            &forward_shots,
        );
        let translated = self
            .dispatch_stage(
                "translate_questions",
                StageKind::Translator,
                &translator,
                &plan.jobs,
                persist::TRANSLATED_QUESTIONS,
                run_dir,
            )
            .await?;
        let translated_examples = apply_question_translations(examples, &plan, &translated);

        let inference = self
            .run_inference(&translated_examples, &BTreeMap::new(), &target, run_dir)
            .await?;

        // Generated code is language-neutral and goes straight to execution
        if family == BenchmarkFamily::Code {
            return Ok(Graded::Code(inference));
        }

        let back_strategy = self.templates.get(family, &target)?;
        let response_plan = plan_response_translation(
            &inference,
            &ids,
            back_strategy.as_ref(),
            &target,
            &source,
            &backward_shots,
        );
        let translated_responses = self
            .dispatch_stage(
                "translate_responses",
                StageKind::Translator,
                &translator,
                &response_plan.jobs,
                persist::TRANSLATED_RESPONSES,
                run_dir,
            )
            .await?;
        let responses = recombine(examples, &inference, &response_plan, &translated_responses);

        self.finish(examples, responses, run_dir).await
    }

    /// Run the judge stage for judged families; others pass through.
    async fn finish(
        &mut self,
        examples: &ExamplesByCategory,
        responses: StageResults,
        run_dir: &RunDir,
    ) -> Result<Graded> {
        match self.task.family {
            BenchmarkFamily::Code => Ok(Graded::Code(responses)),
            BenchmarkFamily::Translation => Ok(Graded::Text(responses)),
            family => {
                let strategy = self.templates.get(family, &self.task.source_language)?;
                let (jobs, layout) = build_judge_jobs(strategy.as_ref(), examples, &responses)?;
                let checker = self.stage_config(StageKind::Checker)?;
                let judge = self
                    .dispatch_stage(
                        "check",
                        StageKind::Checker,
                        &checker,
                        &jobs,
                        persist::CHECK_RESULTS,
                        run_dir,
                    )
                    .await?;
                Ok(Graded::Judged { judge, layout })
            }
        }
    }

    async fn run_inference(
        &mut self,
        examples: &BTreeMap<String, Vec<Option<Example>>>,
        shots: &ExamplesByCategory,
        language: &str,
        run_dir: &RunDir,
    ) -> Result<StageResults> {
        let strategy = self.templates.get(self.task.family, language)?;
        let samples = self.samples_per_item();
        let mut jobs = JobsByCategory::new();

        for (category, list) in examples {
            let category_shots = shots.get(category).map(Vec::as_slice).unwrap_or(&[]);
            let mut category_jobs = Vec::with_capacity(list.len() * samples);
            for (i, example) in list.iter().enumerate() {
                let Some(example) = example else { continue };
                let payload = match strategy.format_inference_example(example, category_shots) {
                    Ok(p) => p,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(category = %category, index = i, error = %e, "Could not format example, skipping");
                        continue;
                    }
                };
                for s in 0..samples {
                    category_jobs.push(Job {
                        category: category.clone(),
                        index: i * samples + s,
                        payload: payload.clone(),
                        meta: None,
                    });
                }
            }
            jobs.insert(category.clone(), category_jobs);
        }

        let inference = self.stage_config(StageKind::Inference)?;
        self.dispatch_stage(
            "inference",
            StageKind::Inference,
            &inference,
            &jobs,
            persist::INFERENCE_RESULTS,
            run_dir,
        )
        .await
    }

    fn samples_per_item(&self) -> usize {
        if self.task.family == BenchmarkFamily::Code {
            self.config.num_samples.max(1)
        } else {
            1
        }
    }

    fn stage_config(&self, kind: StageKind) -> Result<ClientConfig> {
        let cfg = match kind {
            StageKind::Inference => Some(&self.config.inference),
            StageKind::Checker => self.config.checker.as_ref(),
            StageKind::Translator => self.config.translator.as_ref(),
        };
        cfg.cloned().ok_or_else(|| {
            EvalError::config(format!("no {} model configured", kind.as_str()))
        })
    }

    async fn reference_shots(&self) -> Result<Vec<TranslationExample>> {
        let Some(ref reference) = self.reference else {
            return Ok(Vec::new());
        };
        let Some(category) = reference.categories.first() else {
            return Ok(Vec::new());
        };

        let mut pool = self.dataset.support(reference, category).await?;
        if pool.is_empty() {
            pool = self.dataset.load(reference, category, &reference.split).await?;
        }
        let shots: Vec<TranslationExample> = pool
            .into_iter()
            .filter_map(|e| match e {
                Example::Translation(t) => Some(t),
                _ => None,
            })
            .take(self.config.translation_shots)
            .collect();
        info!(reference = %reference.name, shots = shots.len(), "Loaded translation few-shot pairs");
        Ok(shots)
    }

    /// Build the client for a stage, starting its local server when needed.
    async fn activate(
        &self,
        kind: StageKind,
        name: &str,
        cfg: &ClientConfig,
    ) -> Result<(StageClient, Option<ServerHandle>)> {
        let api_key = cfg.api_key()?;
        let launcher = self.launcher()?;

        let server = match cfg.mode {
            ClientMode::Local => Some(launcher.setup_server(&cfg.server_spec()).await?),
            ClientMode::Api | ClientMode::Endpoint => None,
        };

        let backend: Arc<dyn ChatBackend> = match self.backends.get(&kind) {
            Some(backend) => backend.clone(),
            None => {
                let (url, provider) = match server {
                    Some(ref handle) => (handle.base_url(), Provider::OpenAi),
                    None => (cfg.endpoint_url(), cfg.provider),
                };
                let timeout = Duration::from_secs(self.config.request_timeout_secs);
                match HttpBackend::new(url, api_key, provider, timeout) {
                    Ok(b) => Arc::new(b),
                    Err(e) => {
                        launcher.terminate_server(server).await;
                        return Err(e);
                    }
                }
            }
        };

        let mut client = Client::new(backend)
            .with_policy(self.config.retry.clone())
            .with_metrics(self.metrics.clone());
        if let Some(ref models) = cfg.no_parameter_models {
            client = client.with_no_parameter_models(models.iter().cloned());
        }

        let stage = StageClient {
            name: name.to_string(),
            client: Arc::new(client),
            model: cfg.model_name.clone(),
            args: cfg.generation.clone(),
            system_prompt: cfg.system_prompt.clone(),
        };
        Ok((stage, server))
    }

    fn launcher(&self) -> Result<Arc<dyn ServerLauncher>> {
        self.launcher
            .clone()
            .ok_or_else(|| EvalError::config("server launcher not initialized"))
    }

    async fn dispatch_stage(
        &mut self,
        name: &str,
        kind: StageKind,
        cfg: &ClientConfig,
        jobs: &JobsByCategory,
        artifact: &str,
        run_dir: &RunDir,
    ) -> Result<StageResults> {
        self.progress.begin_stage(name);
        let start = Instant::now();
        let job_count: usize = jobs.values().map(Vec::len).sum();
        let output_path = run_dir.path(artifact);

        let results = if job_count == 0 {
            warn!(stage = %name, "No jobs to run, skipping model activation");
            let empty: StageResults = jobs.keys().map(|k| (k.clone(), Vec::new())).collect();
            write_json(&output_path, &empty)?;
            empty
        } else {
            let (stage, server) = self.activate(kind, name, cfg).await?;
            let dispatcher = Dispatcher::new(self.config.max_concurrency, self.launcher()?)
                .with_metrics(self.metrics.clone());
            dispatcher
                .process_subjects(stage, server, jobs, &output_path)
                .await?
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let failed = count_failed(&results);
        self.ledger
            .record_stage(name, &cfg.model_name, job_count, failed, elapsed_ms, artifact);
        self.metrics.finish_stage(elapsed_ms);
        self.progress.complete_stage();
        info!(
            stage = %name,
            model = %cfg.model_name,
            jobs = job_count,
            failed,
            elapsed_ms,
            progress_percent = self.progress.progress_percent(),
            "Stage finished"
        );
        Ok(results)
    }

    async fn score(&self, examples: &ExamplesByCategory, graded: Graded) -> Result<ScoreRecord> {
        let groups = self.task.groups();
        let policy = self.config.unknown_verdict;

        match graded {
            Graded::Judged { judge, layout } => {
                let empty = Vec::new();
                let signals = layout
                    .iter()
                    .map(|(category, layout)| {
                        let slots = judge.get(category).unwrap_or(&empty);
                        let correct = match layout {
                            JudgeLayout::Mcqa(l) => mcqa_correctness(slots, l, policy),
                            JudgeLayout::Open(l) => open_correctness(slots, l, policy),
                        };
                        (category.clone(), bool_signals(&correct))
                    })
                    .collect();
                Ok(compute_score(&signals, &groups))
            }
            Graded::Text(responses) => {
                let signals = examples
                    .iter()
                    .map(|(category, list)| {
                        let slots = responses.get(category);
                        let values = list
                            .iter()
                            .enumerate()
                            .map(|(i, example)| {
                                let hypothesis = slots
                                    .and_then(|s| s.get(i))
                                    .and_then(Option::as_ref)
                                    .and_then(Completion::last_reply)?;
                                match example {
                                    Example::Translation(t) => {
                                        Some(self.text_metric.score(hypothesis, &t.target))
                                    }
                                    _ => None,
                                }
                            })
                            .collect();
                        (category.clone(), values)
                    })
                    .collect();
                Ok(compute_score(&signals, &groups))
            }
            Graded::Code(responses) => {
                let samples_per_item = self.samples_per_item();
                let mut per_category = BTreeMap::new();
                for (category, list) in examples {
                    let problems: Vec<_> = list
                        .iter()
                        .filter_map(|e| match e {
                            Example::Code(c) => Some(c.clone()),
                            _ => None,
                        })
                        .collect();
                    let slots = responses.get(category);
                    let mut samples = Vec::new();
                    for (i, problem) in problems.iter().enumerate() {
                        for s in 0..samples_per_item {
                            let completion = slots
                                .and_then(|v| v.get(i * samples_per_item + s))
                                .and_then(Option::as_ref)
                                .and_then(Completion::last_reply);
                            if let Some(text) = completion {
                                samples.push(CodeSample {
                                    task_id: problem.task_id.clone(),
                                    completion: text.to_string(),
                                });
                            }
                        }
                    }
                    let result = self
                        .code_executor
                        .evaluate_functional_correctness(&samples, &problems, &self.config.pass_k)
                        .await?;
                    info!(category = %category, samples = samples.len(), ?result, "Code executed");
                    per_category.insert(category.clone(), result);
                }
                Ok(compute_code_score(&per_category, &self.config.pass_k))
            }
        }
    }

    fn write_summary(
        &self,
        run_dir: &RunDir,
        started_at: chrono::DateTime<Utc>,
        record: Option<&ScoreRecord>,
        error: Option<String>,
    ) -> Result<()> {
        let summary = RunSummary {
            run_id: self.progress.run_id(),
            task: self.task.name.clone(),
            family: self.task.family,
            source_language: self.task.source_language.clone(),
            target_language: self.task.target_language.clone(),
            config_fingerprint: self.config.fingerprint(),
            started_at,
            finished_at: Utc::now(),
            state: self.progress.state(),
            transitions: self.progress.transitions().to_vec(),
            stages: self.ledger.stage_results().to_vec(),
            total_stage_time_ms: self.ledger.total_execution_time_ms(),
            progress_percent: self.progress.progress_percent(),
            failure_rate: self.ledger.failure_rate(),
            average: record.and_then(ScoreRecord::average),
            error,
        };
        write_json(&run_dir.path(persist::RUN_SUMMARY), &summary)?;
        write_text(
            &run_dir.path(persist::METRICS),
            &self.metrics.render_prometheus(),
        )
    }
}

/// Judge jobs for every example with a response. Items that cannot be
/// formatted are logged and left unscored.
fn build_judge_jobs(
    strategy: &dyn TemplateStrategy,
    examples: &ExamplesByCategory,
    responses: &StageResults,
) -> Result<(JobsByCategory, BTreeMap<String, JudgeLayout>)> {
    let mut jobs = JobsByCategory::new();
    let mut layouts = BTreeMap::new();

    for (category, list) in examples {
        let slots = responses.get(category);
        let mut category_jobs: Vec<Job> = Vec::new();
        let mut mcqa = Vec::with_capacity(list.len());
        let mut open = Vec::with_capacity(list.len());

        for (i, example) in list.iter().enumerate() {
            let response = slots.and_then(|s| s.get(i)).and_then(Option::as_ref);
            let checker_jobs = match response.map(|r| strategy.format_checker_example(example, r)) {
                None => {
                    mcqa.push(None);
                    open.push(None);
                    continue;
                }
                Some(Ok(j)) => j,
                Some(Err(e)) if e.is_fatal() => return Err(e),
                Some(Err(e)) => {
                    warn!(category = %category, index = i, error = %e, "Could not build judge prompt");
                    mcqa.push(None);
                    open.push(None);
                    continue;
                }
            };

            let start = category_jobs.len();
            let count = checker_jobs.len();
            let gold = checker_jobs.iter().position(|j| j.gold == Some(true));
            for checker in checker_jobs {
                let index = category_jobs.len();
                category_jobs.push(Job {
                    category: category.clone(),
                    index,
                    payload: JobPayload::Chat(checker.messages),
                    meta: None,
                });
            }
            mcqa.push(gold.map(|g| (start, count, g)));
            open.push(Some(start));
        }

        let layout = if matches!(list.first(), Some(Example::Mcqa(_))) {
            JudgeLayout::Mcqa(mcqa)
        } else {
            JudgeLayout::Open(open)
        };
        jobs.insert(category.clone(), category_jobs);
        layouts.insert(category.clone(), layout);
    }
    Ok((jobs, layouts))
}
