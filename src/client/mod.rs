//! Chat-completion client with per-error-class retry budgets.
//!
//! `Client::generate` never surfaces recoverable provider conditions:
//! rate limits and timeouts are retried, content-policy refusals become
//! [`CONTENT_POLICY_SENTINEL`]. Errors that reach the caller are either
//! per-item (`TransientProvider`, `MalformedResponse`) or fatal for the
//! stage (`FatalProvider`). The caller attaches the item context.

mod backend;
mod message;

pub use backend::{classify_status, ChatBackend, ChatRequest, HttpBackend, Provider, ProviderError};
pub use message::{is_alternating, Message, Role};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::{EvalError, Result};
use crate::metrics::Metrics;

pub const CONTENT_POLICY_SENTINEL: &str =
    "[no response: the provider refused this request under its content policy]";

/// Models that reject sampling parameters and need a bare request.
pub const DEFAULT_NO_PARAMETER_MODELS: &[&str] =
    &["o1", "o1-mini", "o1-preview", "o3", "o3-mini", "o4-mini"];

const DEFAULT_RATE_LIMIT_BACKOFF_MS: u64 = 10_000;
const DEFAULT_MAX_RATE_LIMIT_RETRIES: u32 = 30;
const DEFAULT_TIMEOUT_BACKOFF_MS: u64 = 3_000;
const DEFAULT_MAX_TIMEOUT_RETRIES: u32 = 1;
const DEFAULT_TRANSIENT_BACKOFF_MS: u64 = 2_000;
const DEFAULT_MAX_TRANSIENT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateArgs {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub rate_limit_backoff_ms: u64,
    pub max_rate_limit_retries: u32,
    pub timeout_backoff_ms: u64,
    pub max_timeout_retries: u32,
    pub transient_backoff_ms: u64,
    pub max_transient_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_backoff_ms: DEFAULT_RATE_LIMIT_BACKOFF_MS,
            max_rate_limit_retries: DEFAULT_MAX_RATE_LIMIT_RETRIES,
            timeout_backoff_ms: DEFAULT_TIMEOUT_BACKOFF_MS,
            max_timeout_retries: DEFAULT_MAX_TIMEOUT_RETRIES,
            transient_backoff_ms: DEFAULT_TRANSIENT_BACKOFF_MS,
            max_transient_retries: DEFAULT_MAX_TRANSIENT_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Zero-wait policy with the default retry counts.
    pub fn immediate() -> Self {
        Self {
            rate_limit_backoff_ms: 0,
            timeout_backoff_ms: 0,
            transient_backoff_ms: 0,
            ..Self::default()
        }
    }
}

pub struct Client {
    backend: Arc<dyn ChatBackend>,
    policy: RetryPolicy,
    no_parameter_models: HashSet<String>,
    metrics: Arc<Metrics>,
    backoffs: AtomicU64,
}

impl Client {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            policy: RetryPolicy::default(),
            no_parameter_models: DEFAULT_NO_PARAMETER_MODELS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            metrics: Metrics::new(),
            backoffs: AtomicU64::new(0),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_no_parameter_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.no_parameter_models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Number of backoff sleeps taken across all calls.
    pub fn backoff_count(&self) -> u64 {
        self.backoffs.load(Ordering::Relaxed)
    }

    /// Accepts both bare names and provider-prefixed ones (`openai/o1`).
    pub fn accepts_sampling_params(&self, model: &str) -> bool {
        let base = model.rsplit('/').next().unwrap_or(model);
        !(self.no_parameter_models.contains(model) || self.no_parameter_models.contains(base))
    }

    pub fn build_request(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        messages: &[Message],
        args: &GenerateArgs,
    ) -> Result<ChatRequest> {
        if messages.is_empty() {
            return Err(EvalError::InvalidRequest(format!(
                "empty conversation for model {}",
                model
            )));
        }

        let mut full = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
            full.push(Message::system(system));
        }
        full.extend(messages.iter().cloned());

        let request = if self.accepts_sampling_params(model) {
            ChatRequest {
                model: model.to_string(),
                messages: full,
                temperature: args.temperature,
                top_p: args.top_p,
                max_tokens: args.max_tokens,
            }
        } else {
            ChatRequest {
                model: model.to_string(),
                messages: full,
                temperature: None,
                top_p: None,
                max_tokens: None,
            }
        };
        Ok(request)
    }

    pub async fn generate(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        messages: &[Message],
        args: &GenerateArgs,
    ) -> Result<String> {
        let request = self.build_request(model, system_prompt, messages, args)?;

        let mut rate_limited = 0u32;
        let mut timeouts = 0u32;
        let mut transient = 0u32;

        loop {
            self.metrics.record_request();
            let err = match self.backend.complete(&request).await {
                Ok(text) => return Ok(text),
                Err(e) => e,
            };
            self.metrics.record_request_failed();

            match err {
                ProviderError::RateLimited(msg) => {
                    rate_limited += 1;
                    self.metrics.record_rate_limited();
                    if rate_limited > self.policy.max_rate_limit_retries {
                        return Err(EvalError::TransientProvider {
                            model: model.to_string(),
                            message: format!(
                                "rate limit persisted after {} retries: {}",
                                self.policy.max_rate_limit_retries, msg
                            ),
                        });
                    }
                    self.metrics.record_retry();
                    warn!(
                        model = %model,
                        attempt = rate_limited,
                        backoff_ms = self.policy.rate_limit_backoff_ms,
                        "Rate limited, backing off"
                    );
                    self.backoff(self.policy.rate_limit_backoff_ms).await;
                }
                ProviderError::Timeout => {
                    timeouts += 1;
                    if timeouts > self.policy.max_timeout_retries {
                        return Err(EvalError::TransientProvider {
                            model: model.to_string(),
                            message: format!("request timed out {} times", timeouts),
                        });
                    }
                    self.metrics.record_timeout();
                    warn!(model = %model, attempt = timeouts, "Request timed out, retrying");
                    self.backoff(self.policy.timeout_backoff_ms).await;
                }
                ProviderError::Transient(msg) => {
                    transient += 1;
                    if transient > self.policy.max_transient_retries {
                        return Err(EvalError::TransientProvider {
                            model: model.to_string(),
                            message: msg,
                        });
                    }
                    self.metrics.record_retry();
                    warn!(model = %model, attempt = transient, error = %msg, "Transient provider failure, retrying");
                    self.backoff(self.policy.transient_backoff_ms).await;
                }
                ProviderError::ContentPolicy(msg) => {
                    self.metrics.record_content_policy();
                    let refusal = EvalError::ContentPolicy {
                        model: model.to_string(),
                        message: msg,
                    };
                    warn!(error = %refusal, "Request refused, substituting sentinel");
                    return Ok(CONTENT_POLICY_SENTINEL.to_string());
                }
                ProviderError::BadResponse(msg) => {
                    return Err(EvalError::MalformedResponse {
                        model: model.to_string(),
                        message: msg,
                    });
                }
                fatal @ (ProviderError::ModelNotFound(_)
                | ProviderError::Auth(_)
                | ProviderError::Connection(_)
                | ProviderError::Other { .. }) => {
                    error!(model = %model, error = %fatal, "Fatal provider error");
                    return Err(EvalError::FatalProvider {
                        model: model.to_string(),
                        message: fatal.to_string(),
                    });
                }
            }
        }
    }

    async fn backoff(&self, ms: u64) {
        self.backoffs.fetch_add(1, Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a scripted sequence of outcomes, then keeps returning "ok".
    struct ScriptedBackend {
        script: Mutex<VecDeque<std::result::Result<String, ProviderError>>>,
        calls: AtomicU64,
        last_request: Mutex<Option<ChatRequest>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<std::result::Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU64::new(0),
                last_request: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn complete(
            &self,
            request: &ChatRequest,
        ) -> std::result::Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            *self.last_request.lock() = Some(request.clone());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("ok".to_string()))
        }
    }

    fn args() -> GenerateArgs {
        GenerateArgs {
            temperature: Some(0.7),
            top_p: Some(0.9),
            max_tokens: Some(128),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_twice_then_success() {
        let backend = ScriptedBackend::new(vec![
            Err(ProviderError::RateLimited("429".into())),
            Err(ProviderError::RateLimited("429".into())),
            Ok("answer".into()),
        ]);
        let client = Client::new(backend.clone()).with_policy(RetryPolicy::immediate());

        let out = client
            .generate("gpt-4o", None, &[Message::user("q")], &args())
            .await
            .unwrap();

        assert_eq!(out, "answer");
        assert_eq!(client.backoff_count(), 2);
        assert_eq!(backend.calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_are_bounded() {
        let script = (0..10)
            .map(|_| Err(ProviderError::RateLimited("429".into())))
            .collect();
        let backend = ScriptedBackend::new(script);
        let policy = RetryPolicy {
            max_rate_limit_retries: 3,
            ..RetryPolicy::immediate()
        };
        let client = Client::new(backend.clone()).with_policy(policy);

        let err = client
            .generate("gpt-4o", None, &[Message::user("q")], &args())
            .await
            .unwrap_err();

        assert!(matches!(err, EvalError::TransientProvider { .. }));
        assert!(!err.is_fatal());
        assert_eq!(client.backoff_count(), 3);
        assert_eq!(backend.calls.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_every_rate_limit_is_counted() {
        let script = (0..10)
            .map(|_| Err(ProviderError::RateLimited("429".into())))
            .collect();
        let backend = ScriptedBackend::new(script);
        let metrics = Metrics::new();
        let policy = RetryPolicy {
            max_rate_limit_retries: 2,
            ..RetryPolicy::immediate()
        };
        let client = Client::new(backend.clone())
            .with_policy(policy)
            .with_metrics(metrics.clone());

        client
            .generate("gpt-4o", None, &[Message::user("q")], &args())
            .await
            .unwrap_err();

        assert_eq!(backend.calls.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.rate_limited.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.retries.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.requests_failed.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_malformed_response_is_per_item() {
        let backend =
            ScriptedBackend::new(vec![Err(ProviderError::BadResponse("no choices".into()))]);
        let client = Client::new(backend.clone()).with_policy(RetryPolicy::immediate());

        let err = client
            .generate("m", None, &[Message::user("q")], &args())
            .await
            .unwrap_err();

        assert!(!err.is_fatal());
        match err {
            EvalError::MalformedResponse { model, message } => {
                assert_eq!(model, "m");
                assert_eq!(message, "no choices");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_timeout_retried_once() {
        let backend = ScriptedBackend::new(vec![
            Err(ProviderError::Timeout),
            Err(ProviderError::Timeout),
        ]);
        let client = Client::new(backend.clone()).with_policy(RetryPolicy::immediate());

        let err = client
            .generate("m", None, &[Message::user("q")], &args())
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::TransientProvider { .. }));
        assert_eq!(backend.calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_content_policy_returns_sentinel() {
        let backend =
            ScriptedBackend::new(vec![Err(ProviderError::ContentPolicy("refused".into()))]);
        let client = Client::new(backend).with_policy(RetryPolicy::immediate());

        let out = client
            .generate("m", None, &[Message::user("q")], &args())
            .await
            .unwrap();
        assert_eq!(out, CONTENT_POLICY_SENTINEL);
        assert_eq!(client.backoff_count(), 0);
    }

    #[tokio::test]
    async fn test_model_not_found_is_fatal() {
        let backend = ScriptedBackend::new(vec![Err(ProviderError::ModelNotFound(
            "no such model".into(),
        ))]);
        let client = Client::new(backend.clone()).with_policy(RetryPolicy::immediate());

        let err = client
            .generate("missing", None, &[Message::user("q")], &args())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(backend.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_no_parameter_models_get_minimal_request() {
        let backend = ScriptedBackend::new(vec![]);
        let client = Client::new(backend.clone());

        client
            .generate("openai/o1", Some("sys"), &[Message::user("q")], &args())
            .await
            .unwrap();
        let req = backend.last_request.lock().clone().unwrap();
        assert_eq!(req.temperature, None);
        assert_eq!(req.max_tokens, None);
        assert_eq!(req.messages.len(), 2);

        client
            .generate("gpt-4o", None, &[Message::user("q")], &args())
            .await
            .unwrap();
        let req = backend.last_request.lock().clone().unwrap();
        assert_eq!(req.temperature, Some(0.7));
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn test_empty_conversation_rejected() {
        let client = Client::new(ScriptedBackend::new(vec![]));
        let err = client
            .build_request("m", Some("sys"), &[], &GenerateArgs::default())
            .unwrap_err();
        assert!(matches!(err, EvalError::InvalidRequest(_)));
    }
}
