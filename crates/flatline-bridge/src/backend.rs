//! Reasoning backends.
//!
//! A backend turns `(role, system prompt, user prompt)` into raw text. It
//! does not parse, time out, or retry; the adapter and the retry executor
//! own those concerns. Every failure is mapped onto the typed
//! [`InvocationErrorKind`] taxonomy here, at the edge.

use std::sync::Arc;

use async_trait::async_trait;
use flatline_coordination::{InvocationError, InvocationErrorKind, Pricing, ReviewRole, TokenUsage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{BackendConfig, ConfigError};

/// Raw text of one completion and the tokens it was billed for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

impl Completion {
    pub fn new(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }
}

impl From<String> for Completion {
    fn from(text: String) -> Self {
        Self::new(text, TokenUsage::default())
    }
}

impl From<&str> for Completion {
    fn from(text: &str) -> Self {
        Self::new(text, TokenUsage::default())
    }
}

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Stable identity, used for circuit state and metrics.
    fn name(&self) -> &str;

    /// Price list used to meter this backend's calls.
    fn pricing(&self) -> Option<Pricing> {
        None
    }

    async fn complete(
        &self,
        role: ReviewRole,
        system: &str,
        prompt: &str,
    ) -> Result<Completion, InvocationError>;
}

/// OpenAI-compatible `/chat/completions` backend.
pub struct HttpBackend {
    name: String,
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    max_tokens: u32,
    pricing: Option<Pricing>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpBackend {
    pub fn from_config(config: &BackendConfig) -> Result<Self, ConfigError> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                ConfigError::Invalid(format!(
                    "backend '{}': environment variable {var} is not set",
                    config.name
                ))
            })?),
            None => None,
        };
        // Per-call deadlines come from the adapter, not the client.
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ConfigError::Invalid(format!("backend '{}': {e}", config.name)))?;
        Ok(Self {
            name: config.name.clone(),
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            pricing: config.pricing,
        })
    }
}

#[async_trait]
impl ReasoningBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn pricing(&self) -> Option<Pricing> {
        self.pricing
    }

    async fn complete(
        &self,
        role: ReviewRole,
        system: &str,
        prompt: &str,
    ) -> Result<Completion, InvocationError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        debug!(backend = %self.name, %role, model = %self.model, "Sending completion request");

        let response = request.send().await.map_err(|e| transport_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), retry_after.as_deref(), &text));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            InvocationError::new(
                InvocationErrorKind::MalformedResponse,
                format!("response body is not a chat completion: {e}"),
            )
        })?;
        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                InvocationError::new(
                    InvocationErrorKind::MalformedResponse,
                    "completion has no content",
                )
            })?;
        Ok(Completion::new(text, usage))
    }
}

/// Map an HTTP error status onto the invocation error taxonomy.
pub fn status_error(status: u16, retry_after: Option<&str>, body: &str) -> InvocationError {
    let kind = match status {
        429 => InvocationErrorKind::RateLimit,
        401 => InvocationErrorKind::Auth,
        402 => InvocationErrorKind::BudgetExceeded,
        403 => InvocationErrorKind::PermissionDenied,
        408 => InvocationErrorKind::Timeout,
        400 | 404 | 413 | 422 => InvocationErrorKind::InvalidRequest,
        500..=599 => InvocationErrorKind::Overloaded,
        _ => InvocationErrorKind::InvalidRequest,
    };
    let snippet: String = body.chars().take(200).collect();
    let err = InvocationError::new(kind, format!("HTTP {status}: {}", snippet.trim()));
    match retry_after.and_then(parse_retry_after) {
        Some(ms) if kind == InvocationErrorKind::RateLimit => err.with_retry_after(ms),
        _ => err,
    }
}

/// `Retry-After` in (possibly fractional) seconds, as milliseconds.
/// HTTP-date values are not honored.
fn parse_retry_after(value: &str) -> Option<u64> {
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| (secs * 1000.0) as u64)
}

fn transport_error(e: &reqwest::Error) -> InvocationError {
    let kind = if e.is_timeout() {
        InvocationErrorKind::Timeout
    } else if e.is_decode() {
        InvocationErrorKind::MalformedResponse
    } else {
        InvocationErrorKind::Network
    };
    InvocationError::new(kind, e.to_string())
}

/// Backends available to a run, with the roles each may serve.
#[derive(Clone, Default)]
pub struct BackendPool {
    entries: Vec<(Arc<dyn ReasoningBackend>, Vec<ReviewRole>)>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[BackendConfig]) -> Result<Self, ConfigError> {
        let mut pool = Self::new();
        for config in configs {
            let backend: Arc<dyn ReasoningBackend> = Arc::new(HttpBackend::from_config(config)?);
            pool.add(backend, config.roles.clone());
        }
        Ok(pool)
    }

    pub fn add(&mut self, backend: Arc<dyn ReasoningBackend>, roles: Vec<ReviewRole>) {
        self.entries.push((backend, roles));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn serving(&self, role: ReviewRole) -> Vec<&Arc<dyn ReasoningBackend>> {
        self.entries
            .iter()
            .filter(|(_, roles)| roles.contains(&role))
            .map(|(b, _)| b)
            .collect()
    }

    /// Backend for `role` in `slot`, rotating through eligible backends.
    /// Skeptics are offset by one so a skeptic is not, where avoidable, the
    /// same backend as the reviewer it is paired with.
    pub fn for_slot(&self, role: ReviewRole, slot: usize) -> Option<Arc<dyn ReasoningBackend>> {
        self.chain_for_slot(role, slot).into_iter().next()
    }

    /// Every backend serving `role`, starting at the slot's primary and
    /// continuing in rotation order. The tail is the fallback chain.
    pub fn chain_for_slot(&self, role: ReviewRole, slot: usize) -> Vec<Arc<dyn ReasoningBackend>> {
        let eligible = self.serving(role);
        if eligible.is_empty() {
            return Vec::new();
        }
        let offset = usize::from(role == ReviewRole::Skeptic);
        let start = (slot + offset) % eligible.len();
        (0..eligible.len())
            .map(|i| Arc::clone(eligible[(start + i) % eligible.len()]))
            .collect()
    }

    /// Whether any backend serves `role`.
    pub fn covers(&self, role: ReviewRole) -> bool {
        !self.serving(role).is_empty()
    }
}
