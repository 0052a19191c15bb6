//! Model invocation adapter: one bounded call, one [`ReviewResult`].
//!
//! ```text
//! ReviewRequest ──► prompts::render ──► backend.complete ──► ReviewPayload::parse
//!                                          │ (tokio timeout)        │
//!                                          ▼                        ▼
//!                                   InvocationError ──────────► ReviewResult
//! ```
//!
//! The adapter never retries and never blocks past its timeout. A response
//! that cannot be parsed is a transient `malformed_response` error so the
//! retry layer may ask again. Any completion that came back is metered,
//! parseable or not.

use std::time::{Duration, Instant};

use flatline_coordination::review::{ReviewOutcome, ReviewPayload};
use flatline_coordination::{
    InvocationError, InvocationErrorKind, ReviewRequest, ReviewResult, TokenUsage,
};
use tracing::debug;

use crate::backend::ReasoningBackend;
use crate::prompts;
use crate::telemetry::InvocationMetric;

pub async fn invoke(
    backend: &dyn ReasoningBackend,
    request: &ReviewRequest,
    slot: usize,
    timeout: Duration,
) -> ReviewResult {
    let role = request.role();
    let prompt = prompts::render(request);
    let started = Instant::now();

    let mut usage = TokenUsage::default();
    let outcome =
        match tokio::time::timeout(timeout, backend.complete(role, prompts::preamble(role), &prompt))
            .await
        {
            Err(_) => Err(InvocationError::timeout(timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(completion)) => {
                usage = completion.usage;
                ReviewPayload::parse(&completion.text).map_err(|e| {
                    InvocationError::new(InvocationErrorKind::MalformedResponse, e.to_string())
                })
            }
        };
    let latency_ms = started.elapsed().as_millis() as u64;
    let cost_micros = backend
        .pricing()
        .map(|p| p.cost_micros(&usage))
        .unwrap_or(0);

    InvocationMetric {
        backend: backend.name(),
        role,
        slot,
        latency_ms,
        usage,
        cost_micros,
        error: outcome.as_ref().err(),
    }
    .emit();
    debug!(
        backend = backend.name(),
        %role,
        slot,
        prompt_version = prompts::PROMPT_VERSION,
        ok = outcome.is_ok(),
        "Invocation finished"
    );

    ReviewResult {
        role,
        slot,
        backend: backend.name().to_string(),
        outcome: match outcome {
            Ok(payload) => ReviewOutcome::Completed { payload },
            Err(error) => ReviewOutcome::Failed { error },
        },
        latency_ms,
        attempts: 1,
        usage,
        cost_micros,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Completion;
    use async_trait::async_trait;
    use flatline_coordination::{Pricing, ReviewRole};

    struct Fixed {
        delay: Duration,
        reply: Result<String, InvocationError>,
        usage: TokenUsage,
        pricing: Option<Pricing>,
    }

    impl Fixed {
        fn new(delay: Duration, reply: Result<String, InvocationError>) -> Self {
            Self {
                delay,
                reply,
                usage: TokenUsage::default(),
                pricing: None,
            }
        }
    }

    #[async_trait]
    impl ReasoningBackend for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn pricing(&self) -> Option<Pricing> {
            self.pricing
        }

        async fn complete(
            &self,
            _role: ReviewRole,
            _system: &str,
            _prompt: &str,
        ) -> Result<Completion, InvocationError> {
            tokio::time::sleep(self.delay).await;
            self.reply
                .clone()
                .map(|text| Completion::new(text, self.usage))
        }
    }

    fn request() -> ReviewRequest {
        ReviewRequest::new("prd.md", "# Goals", ReviewRole::Reviewer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_transient_error() {
        let backend = Fixed::new(Duration::from_secs(30), Ok("{}".into()));
        let result = invoke(&backend, &request(), 0, Duration::from_secs(5)).await;
        let err = result.error().unwrap();
        assert_eq!(err.kind, InvocationErrorKind::Timeout);
        assert!(err.is_transient());
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_parses_payload() {
        let backend = Fixed::new(
            Duration::ZERO,
            Ok("Here you go:\n```json\n{\"findings\": [{\"location\": \"Goals\", \"description\": \"add metric\", \"score\": 812}]}\n```".into()),
        );
        let result = invoke(&backend, &request(), 1, Duration::from_secs(5)).await;
        assert!(result.is_success());
        assert_eq!(result.slot, 1);
        assert_eq!(result.payload().unwrap().findings[0].score, 812);
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_malformed() {
        let backend = Fixed::new(Duration::ZERO, Ok("I could not review this.".into()));
        let result = invoke(&backend, &request(), 0, Duration::from_secs(5)).await;
        assert_eq!(
            result.error().unwrap().kind,
            InvocationErrorKind::MalformedResponse
        );
    }

    #[tokio::test]
    async fn test_backend_error_passes_through() {
        let backend = Fixed::new(
            Duration::ZERO,
            Err(InvocationError::new(InvocationErrorKind::Auth, "bad key")),
        );
        let result = invoke(&backend, &request(), 0, Duration::from_secs(5)).await;
        assert_eq!(result.error().unwrap().kind, InvocationErrorKind::Auth);
        assert_eq!(result.cost_micros, 0);
    }

    #[tokio::test]
    async fn test_usage_is_metered_even_when_unparseable() {
        let mut backend = Fixed::new(Duration::ZERO, Ok("no json here".into()));
        backend.usage = TokenUsage::new(2_000, 500);
        backend.pricing = Some(Pricing {
            input_per_mtok: 1_000_000,
            output_per_mtok: 4_000_000,
            per_call: 0,
        });
        let result = invoke(&backend, &request(), 0, Duration::from_secs(5)).await;
        assert!(!result.is_success());
        assert_eq!(result.usage, TokenUsage::new(2_000, 500));
        assert_eq!(result.cost_micros, 2_000 + 2_000);
    }
}
