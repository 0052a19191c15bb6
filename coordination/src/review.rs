//! Review requests, results, and the invocation error taxonomy.
//!
//! A [`ReviewRequest`] is built once per invocation and shared read-only
//! with the task that performs the call. The call produces exactly one
//! [`ReviewResult`], which is either a parsed [`ReviewPayload`] or a typed
//! [`InvocationError`]. Backend failures never surface as panics or untyped
//! errors; the retry layer decides what to do with them based on
//! [`InvocationErrorKind::is_transient`].

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Upper bound of the score scale used by every reviewer role.
pub const MAX_SCORE: u32 = 1000;

/// Role a backend plays for a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewRole {
    /// Proposes and scores improvements.
    Reviewer,
    /// Hunts for problems the reviewers missed; high concern scores block.
    Skeptic,
    /// Cross-scores proposals from the other reviewers.
    Scorer,
}

impl std::fmt::Display for ReviewRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reviewer => write!(f, "reviewer"),
            Self::Skeptic => write!(f, "skeptic"),
            Self::Scorer => write!(f, "scorer"),
        }
    }
}

/// One invocation unit. Fields are private so a request cannot change after
/// it has been handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    target: String,
    content: String,
    role: ReviewRole,
    #[serde(default)]
    prior_findings: Vec<String>,
}

impl ReviewRequest {
    pub fn new(target: impl Into<String>, content: impl Into<String>, role: ReviewRole) -> Self {
        Self {
            target: target.into(),
            content: content.into(),
            role,
            prior_findings: Vec::new(),
        }
    }

    /// Attach summaries of earlier findings for iterative re-review.
    pub fn with_prior_findings(mut self, prior: Vec<String>) -> Self {
        self.prior_findings = prior;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn role(&self) -> ReviewRole {
        self.role
    }

    pub fn prior_findings(&self) -> &[String] {
        &self.prior_findings
    }
}

/// Classification of a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationErrorKind {
    RateLimit,
    Timeout,
    Network,
    Overloaded,
    /// Backend answered, but the body did not contain a usable payload.
    MalformedResponse,
    Auth,
    InvalidRequest,
    BudgetExceeded,
    PermissionDenied,
    /// Transient failures persisted past the retry budget.
    Exhausted,
}

impl InvocationErrorKind {
    /// Whether the retry layer may try again.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::RateLimit
                | Self::Timeout
                | Self::Network
                | Self::Overloaded
                | Self::MalformedResponse
        )
    }
}

impl std::fmt::Display for InvocationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Timeout => write!(f, "timeout"),
            Self::Network => write!(f, "network"),
            Self::Overloaded => write!(f, "overloaded"),
            Self::MalformedResponse => write!(f, "malformed_response"),
            Self::Auth => write!(f, "auth"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::BudgetExceeded => write!(f, "budget_exceeded"),
            Self::PermissionDenied => write!(f, "permission_denied"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Typed failure of a single backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct InvocationError {
    pub kind: InvocationErrorKind,
    pub message: String,
    /// Server-provided minimum wait before the next attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl InvocationError {
    pub fn new(kind: InvocationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            InvocationErrorKind::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    /// Wrap the last transient error once the retry budget is spent.
    pub fn exhausted(last: &InvocationError, attempts: u32, reason: &str) -> Self {
        Self::new(
            InvocationErrorKind::Exhausted,
            format!("{reason} after {attempts} attempt(s); last error {last}"),
        )
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Token counts a backend reported for one or more calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Outcome of one invocation as seen by the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReviewOutcome {
    Completed { payload: ReviewPayload },
    Failed { error: InvocationError },
}

/// Adapter output for one role/slot. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub role: ReviewRole,
    /// Reviewer slot (0-based). Skeptic slot `n` is paired with reviewer `n`.
    pub slot: usize,
    /// Backend identity that served (or failed) the call.
    pub backend: String,
    pub outcome: ReviewOutcome,
    pub latency_ms: u64,
    /// Attempts made by the retry layer, including the first.
    pub attempts: u32,
    /// Tokens billed across every attempt.
    #[serde(default)]
    pub usage: TokenUsage,
    /// Metered cost across every attempt, in micro-USD.
    #[serde(default)]
    pub cost_micros: u64,
}

impl ReviewResult {
    pub fn payload(&self) -> Option<&ReviewPayload> {
        match &self.outcome {
            ReviewOutcome::Completed { payload } => Some(payload),
            ReviewOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&InvocationError> {
        match &self.outcome {
            ReviewOutcome::Completed { .. } => None,
            ReviewOutcome::Failed { error } => Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.payload().is_some()
    }
}

/// Literal anchored replacement. The first occurrence of `anchor` is replaced
/// by `replacement`; an empty anchor appends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedEdit {
    #[serde(default)]
    pub anchor: String,
    pub replacement: String,
}

/// A change proposed by a primary reviewer, with that reviewer's own score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedFinding {
    pub location: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<ProposedEdit>,
    #[serde(default, deserialize_with = "de_score")]
    pub score: u32,
    /// Purely positive observation; never integrated.
    #[serde(default)]
    pub praise: bool,
}

/// A skeptic concern. Matched to proposals by normalized location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concern {
    pub location: String,
    pub description: String,
    #[serde(default, deserialize_with = "de_score")]
    pub score: u32,
}

/// Cross-scoring vote for a proposal identified by its short key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerScore {
    pub key: String,
    #[serde(deserialize_with = "de_score")]
    pub score: u32,
}

/// Structured body returned by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPayload {
    #[serde(default)]
    pub findings: Vec<ProposedFinding>,
    #[serde(default)]
    pub concerns: Vec<Concern>,
    #[serde(default)]
    pub scores: Vec<PeerScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Payload extraction failure.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("response contained no JSON object")]
    NoJson,
    #[error("response JSON did not match the review schema: {0}")]
    Invalid(String),
}

impl ReviewPayload {
    /// Parse backend text. Accepts bare JSON, JSON inside a fenced code block,
    /// or JSON surrounded by prose.
    pub fn parse(text: &str) -> Result<Self, PayloadError> {
        let body = extract_json(text).ok_or(PayloadError::NoJson)?;
        serde_json::from_str(body).map_err(|e| PayloadError::Invalid(e.to_string()))
    }
}

fn extract_json(text: &str) -> Option<&str> {
    if let Some(open) = text.find("```") {
        let after = &text[open + 3..];
        // Skip the info string (```json).
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(close) = body.find("```") {
            let inner = body[..close].trim();
            if inner.starts_with('{') {
                return Some(inner);
            }
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn de_score<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    Ok(clamp_score(raw))
}

/// Clamp an arbitrary number onto the 0..=1000 scale.
pub fn clamp_score(raw: f64) -> u32 {
    if raw.is_nan() || raw <= 0.0 {
        0
    } else if raw >= MAX_SCORE as f64 {
        MAX_SCORE
    } else {
        raw.round() as u32
    }
}
