use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::message::{Message, Role};
use crate::error::{EvalError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 1024;
const MAX_ERROR_BODY: usize = 500;

/// Markers providers use in error bodies when they refuse a payload.
const CONTENT_POLICY_MARKERS: &[&str] = &[
    "content_policy",
    "content_filter",
    "content management policy",
    "safety system",
    "responsible ai",
];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("request timed out")]
    Timeout,
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("content policy: {0}")]
    ContentPolicy(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("malformed response: {0}")]
    BadResponse(String),
    #[error("provider error (HTTP {status}): {body}")]
    Other { status: u16, body: String },
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[default]
    OpenAi,
    Anthropic,
}

impl Provider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com/v1",
        }
    }

    pub fn default_api_key_env(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    provider: Provider,
}

impl HttpBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        provider: Provider,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EvalError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
            provider,
        })
    }

    pub fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.provider {
            Provider::OpenAi => format!("{}/chat/completions", base),
            Provider::Anthropic => format!("{}/messages", base),
        }
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let url = self.endpoint();
        debug!(model = %request.model, url = %url, "Sending chat completion");

        let mut builder = self.http.post(&url);
        builder = match self.provider {
            Provider::OpenAi => {
                let builder = builder.json(request);
                match self.api_key {
                    Some(ref key) => builder.bearer_auth(key),
                    None => builder,
                }
            }
            Provider::Anthropic => {
                let builder = builder
                    .json(&anthropic_body(request))
                    .header("anthropic-version", ANTHROPIC_VERSION);
                match self.api_key {
                    Some(ref key) => builder.header("x-api-key", key),
                    None => builder,
                }
            }
        };

        let resp = builder.send().await.map_err(map_transport)?;
        let status = resp.status();
        let body = resp.text().await.map_err(map_transport)?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }

        match self.provider {
            Provider::OpenAi => parse_openai(&body),
            Provider::Anthropic => parse_anthropic(&body),
        }
    }
}

fn map_transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else if e.is_connect() {
        ProviderError::Connection(e.to_string())
    } else {
        ProviderError::Transient(e.to_string())
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

fn is_content_policy(body: &str) -> bool {
    let lower = body.to_lowercase();
    CONTENT_POLICY_MARKERS.iter().any(|m| lower.contains(m))
}

/// Map a non-success HTTP status and body to a provider error class.
pub fn classify_status(status: u16, body: &str) -> ProviderError {
    let body = truncate_body(body);
    match status {
        429 => ProviderError::RateLimited(body),
        401 | 403 => ProviderError::Auth(body),
        404 => ProviderError::ModelNotFound(body),
        400 | 422 if is_content_policy(&body) => ProviderError::ContentPolicy(body),
        408 => ProviderError::Timeout,
        500..=599 => ProviderError::Transient(format!("HTTP {}: {}", status, body)),
        _ => ProviderError::Other { status, body },
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

fn parse_openai(body: &str) -> Result<String, ProviderError> {
    let resp: OpenAiResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::BadResponse(e.to_string()))?;
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::BadResponse("no choices in response".to_string()))?;

    match choice.message.content {
        Some(content) => Ok(content),
        None if choice.finish_reason.as_deref() == Some("content_filter") => Err(
            ProviderError::ContentPolicy("completion removed by content filter".to_string()),
        ),
        None => Err(ProviderError::BadResponse(
            "choice has no message content".to_string(),
        )),
    }
}

#[derive(Serialize)]
struct AnthropicBody<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<&'a Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

fn anthropic_body(request: &ChatRequest) -> AnthropicBody<'_> {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    AnthropicBody {
        model: &request.model,
        max_tokens: request.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
        system: if system.is_empty() {
            None
        } else {
            Some(system.join("\n\n"))
        },
        messages: request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect(),
        temperature: request.temperature,
        top_p: request.top_p,
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

fn parse_anthropic(body: &str) -> Result<String, ProviderError> {
    let resp: AnthropicResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::BadResponse(e.to_string()))?;
    let text: Vec<String> = resp
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect();
    if text.is_empty() {
        return Err(ProviderError::BadResponse(
            "no text blocks in response".to_string(),
        ));
    }
    Ok(text.join(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message::system("be terse"), Message::user("2+2=?")],
            temperature: Some(0.0),
            top_p: None,
            max_tokens: Some(64),
        }
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(429, "slow down"),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(404, "no such model"),
            ProviderError::ModelNotFound(_)
        ));
        assert!(matches!(classify_status(401, ""), ProviderError::Auth(_)));
        assert!(matches!(
            classify_status(400, r#"{"error":{"code":"content_policy_violation"}}"#),
            ProviderError::ContentPolicy(_)
        ));
        assert!(matches!(
            classify_status(400, r#"{"error":"bad field"}"#),
            ProviderError::Other { status: 400, .. }
        ));
        assert!(matches!(
            classify_status(503, "overloaded"),
            ProviderError::Transient(_)
        ));
        assert!(matches!(classify_status(408, ""), ProviderError::Timeout));
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let long = "é".repeat(600);
        let t = truncate_body(&long);
        assert!(t.ends_with("..."));
        assert!(t.len() <= MAX_ERROR_BODY + 3);
    }

    #[test]
    fn test_openai_request_omits_unset_params() {
        let json = serde_json::to_value(request()).unwrap();
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["max_tokens"], 64);
        assert!(json.get("top_p").is_none());
        assert_eq!(json["messages"][1]["role"], "user");
    }

    #[test]
    fn test_parse_openai() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"4"},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_openai(body).unwrap(), "4");

        let filtered = r#"{"choices":[{"message":{"role":"assistant","content":null},"finish_reason":"content_filter"}]}"#;
        assert!(matches!(
            parse_openai(filtered),
            Err(ProviderError::ContentPolicy(_))
        ));

        assert!(matches!(
            parse_openai(r#"{"choices":[]}"#),
            Err(ProviderError::BadResponse(_))
        ));
    }

    #[test]
    fn test_anthropic_body_moves_system_prompt() {
        let req = request();
        let body = serde_json::to_value(anthropic_body(&req)).unwrap();
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], 64);
    }

    #[test]
    fn test_parse_anthropic() {
        let body = r#"{"content":[{"type":"text","text":"fo"},{"type":"text","text":"ur"}],"stop_reason":"end_turn"}"#;
        assert_eq!(parse_anthropic(body).unwrap(), "four");
        assert!(parse_anthropic(r#"{"content":[]}"#).is_err());
    }

    #[test]
    fn test_endpoint_paths() {
        let b = HttpBackend::new(
            "http://127.0.0.1:8000/v1/",
            None,
            Provider::OpenAi,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(b.endpoint(), "http://127.0.0.1:8000/v1/chat/completions");

        let a = HttpBackend::new(
            Provider::Anthropic.default_base_url(),
            Some("k".into()),
            Provider::Anthropic,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(a.endpoint(), "https://api.anthropic.com/v1/messages");
    }
}
