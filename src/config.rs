use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::client::{GenerateArgs, Provider, RetryPolicy};
use crate::error::EvalError;
use crate::evaluation::scoring::UnknownPolicy;
use crate::supervisor::{ServerSpec, StartupPolicy};
use crate::task::registry::TaskRegistry;
use crate::task::{BenchmarkFamily, Task};

const DEFAULT_MAX_CONCURRENCY: usize = crate::dispatcher::DEFAULT_MAX_CONCURRENCY;
const DEFAULT_SEED: u64 = 1234;
const DEFAULT_OUTPUT_DIR: &str = "results";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_REQUEST_TIMEOUT: u64 = 300;
const DEFAULT_CODE_TIMEOUT: u64 = 10;
const DEFAULT_TRANSLATION_SHOTS: usize = 3;
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMode {
    /// Hosted API reached over HTTPS with a key from the environment.
    #[default]
    Api,
    /// Serving engine spawned for the duration of the stage.
    Local,
    /// Already-running server this process does not manage.
    Endpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub mode: ClientMode,
    pub provider: Provider,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model_name: String,
    pub model_path: Option<String>,
    pub host: String,
    pub port: u16,
    pub max_model_len: u32,
    pub max_num_seqs: u32,
    pub dtype: String,
    pub generation: GenerateArgs,
    pub system_prompt: Option<String>,
    /// Replaces the built-in list of models that reject sampling parameters.
    pub no_parameter_models: Option<Vec<String>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let spec = ServerSpec::default();
        Self {
            mode: ClientMode::default(),
            provider: Provider::default(),
            base_url: None,
            api_key_env: None,
            model_name: String::new(),
            model_path: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_model_len: spec.max_model_len,
            max_num_seqs: spec.max_num_seqs,
            dtype: spec.dtype,
            generation: GenerateArgs::default(),
            system_prompt: None,
            no_parameter_models: None,
        }
    }
}

impl ClientConfig {
    pub fn server_spec(&self) -> ServerSpec {
        ServerSpec {
            model_path: self
                .model_path
                .clone()
                .unwrap_or_else(|| self.model_name.clone()),
            model_name: self.model_name.clone(),
            max_model_len: self.max_model_len,
            max_num_seqs: self.max_num_seqs,
            dtype: self.dtype.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Base URL for api and endpoint modes.
    pub fn endpoint_url(&self) -> String {
        if let Some(ref url) = self.base_url {
            return url.trim_end_matches('/').to_string();
        }
        match self.mode {
            ClientMode::Api => self.provider.default_base_url().to_string(),
            _ => format!("http://{}:{}/v1", self.host, self.port),
        }
    }

    /// API key from `api_key_env` (or the provider's usual variable). Missing
    /// keys are only an error in api mode.
    pub fn api_key(&self) -> crate::error::Result<Option<String>> {
        let var = self
            .api_key_env
            .clone()
            .unwrap_or_else(|| self.provider.default_api_key_env().to_string());
        match (std::env::var(&var).ok(), self.mode) {
            (Some(key), _) => Ok(Some(key)),
            (None, ClientMode::Api) => Err(EvalError::config(format!(
                "environment variable {} is not set for model {}",
                var, self.model_name
            ))),
            (None, _) => Ok(None),
        }
    }

    fn validate(&self, stage: &str) -> crate::error::Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(EvalError::config(format!("{}: model_name is required", stage)));
        }
        if self.mode == ClientMode::Local && self.port == 0 {
            return Err(EvalError::config(format!("{}: local mode needs a fixed port", stage)));
        }
        self.api_key().map_err(|e| match e {
            EvalError::Configuration(msg) => EvalError::config(format!("{}: {}", stage, msg)),
            other => other,
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub command: Vec<String>,
    pub extra_args: Vec<String>,
    pub startup: StartupPolicy,
    /// Write server stdout/stderr to the run directory.
    pub log_to_run_dir: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: vec!["vllm".to_string(), "serve".to_string()],
            extra_args: Vec::new(),
            startup: StartupPolicy::default(),
            log_to_run_dir: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub task: String,
    pub split: Option<String>,
    /// Overrides the dataset language of the task definition.
    pub source_language: Option<String>,
    /// Set to a language other than the source for a cross-language run.
    pub target_language: Option<String>,
    /// Only evaluate these categories. Empty means all.
    pub categories: Vec<String>,
    pub num_fewshot: usize,
    pub seed: u64,
    pub max_concurrency: usize,
    pub output_dir: PathBuf,
    pub run_name: Option<String>,
    pub data_dir: PathBuf,
    pub templates: Option<PathBuf>,
    pub task_definitions: Option<PathBuf>,
    /// Translation-family task supplying few-shot pairs to the translator.
    pub reference_task: Option<String>,
    pub translation_shots: usize,
    pub pass_k: Vec<usize>,
    pub num_samples: usize,
    pub code_language: String,
    pub code_timeout_secs: u64,
    pub unknown_verdict: UnknownPolicy,
    pub retry: RetryPolicy,
    pub request_timeout_secs: u64,
    pub inference: ClientConfig,
    pub checker: Option<ClientConfig>,
    pub translator: Option<ClientConfig>,
    pub server: ServerConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            task: String::new(),
            split: None,
            source_language: None,
            target_language: None,
            categories: Vec::new(),
            num_fewshot: 0,
            seed: DEFAULT_SEED,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            run_name: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            templates: None,
            task_definitions: None,
            reference_task: None,
            translation_shots: DEFAULT_TRANSLATION_SHOTS,
            pass_k: vec![1],
            num_samples: 1,
            code_language: "python".to_string(),
            code_timeout_secs: DEFAULT_CODE_TIMEOUT,
            unknown_verdict: UnknownPolicy::default(),
            retry: RetryPolicy::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT,
            inference: ClientConfig::default(),
            checker: None,
            translator: None,
            server: ServerConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: RunConfig = serde_yaml::from_str(&body)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.max_concurrency = env_parse("POLYEVAL_MAX_CONCURRENCY", self.max_concurrency);
        self.output_dir = env_parse("POLYEVAL_OUTPUT_DIR", self.output_dir.clone());
        self.data_dir = env_parse("POLYEVAL_DATA_DIR", self.data_dir.clone());
        self.server.startup.timeout_secs = env_parse(
            "POLYEVAL_STARTUP_TIMEOUT_SECS",
            self.server.startup.timeout_secs,
        );
    }

    pub fn resolve_task(&self, registry: &TaskRegistry) -> crate::error::Result<Task> {
        let mut task = registry.resolve(
            &self.task,
            self.split.as_deref(),
            self.target_language.as_deref(),
            &self.categories,
        )?;
        if let Some(ref lang) = self.source_language {
            task.source_language = lang.clone();
        }
        Ok(task)
    }

    /// Stage wiring checks that must pass before any work starts.
    pub fn validate(&self, task: &Task) -> crate::error::Result<()> {
        if self.max_concurrency == 0 {
            return Err(EvalError::config("max_concurrency must be at least 1"));
        }
        self.inference.validate("inference")?;

        if task.family.uses_checker() {
            match self.checker {
                Some(ref checker) => checker.validate("checker")?,
                None => {
                    return Err(EvalError::config(format!(
                        "{} tasks need a checker model",
                        task.family
                    )))
                }
            }
        }

        if task.is_cross_language() {
            if task.family == BenchmarkFamily::Translation {
                return Err(EvalError::config(
                    "translation tasks cannot run in cross-language mode",
                ));
            }
            match self.translator {
                Some(ref translator) => translator.validate("translator")?,
                None => {
                    return Err(EvalError::config(
                        "cross-language runs need a translator model",
                    ))
                }
            }
        }

        if task.family == BenchmarkFamily::Code {
            let max_k = self.pass_k.iter().copied().max().unwrap_or(0);
            if self.pass_k.is_empty() || self.pass_k.contains(&0) {
                return Err(EvalError::config("pass_k must list positive k values"));
            }
            if self.num_samples < max_k {
                return Err(EvalError::config(format!(
                    "num_samples ({}) must be at least the largest pass_k ({})",
                    self.num_samples, max_k
                )));
            }
        }
        Ok(())
    }

    pub fn run_name(&self) -> String {
        self.run_name.clone().unwrap_or_else(|| {
            let model = self.inference.model_name.replace(['/', ' ', ':'], "_");
            format!("{}-{}", model, chrono::Utc::now().format("%Y%m%d-%H%M%S"))
        })
    }

    /// SHA-256 of the serialized config, hex encoded.
    pub fn fingerprint(&self) -> String {
        let body = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&body))
    }

    pub fn print_banner(&self, task: &Task) {
        let target = task.target_language.as_deref().unwrap_or("-");
        let checker = self
            .checker
            .as_ref()
            .map(|c| c.model_name.as_str())
            .unwrap_or("-");
        let translator = self
            .translator
            .as_ref()
            .map(|c| c.model_name.as_str())
            .unwrap_or("-");
        tracing::info!("╔══════════════════════════════════════════════════╗");
        tracing::info!("║              polyeval v{:<26}║", env!("CARGO_PKG_VERSION"));
        tracing::info!("╠══════════════════════════════════════════════════╣");
        tracing::info!("║  Task:              {:<28}║", task.name);
        tracing::info!("║  Family:            {:<28}║", task.family);
        tracing::info!("║  Split:             {:<28}║", task.split);
        tracing::info!("║  Categories:        {:<28}║", task.categories.len());
        tracing::info!("║  Languages:         {:<28}║", format!("{} -> {}", task.source_language, target));
        tracing::info!("║  Inference model:   {:<28}║", self.inference.model_name);
        tracing::info!("║  Checker model:     {:<28}║", checker);
        tracing::info!("║  Translator model:  {:<28}║", translator);
        tracing::info!("║  Max concurrency:   {:<28}║", self.max_concurrency);
        tracing::info!("║  Few-shot:          {:<28}║", self.num_fewshot);
        tracing::info!("║  Output:            {:<28}║", self.output_dir.display());
        tracing::info!("╚══════════════════════════════════════════════════╝");
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
