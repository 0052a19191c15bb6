//! Shared fixtures: scripted backends and orchestrators over a temp dir.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flatline_bridge::{BackendPool, Completion, FlatlineConfig, Orchestrator, ReasoningBackend};
use flatline_coordination::integration::FsDocumentStore;
use flatline_coordination::{InvocationError, InvocationErrorKind, Pricing, ReviewRole, TokenUsage};
use serde_json::json;

type Script = dyn Fn(ReviewRole, usize) -> Result<String, InvocationError> + Send + Sync;

/// Answers from a closure over (role, call number for that backend).
pub struct ScriptedBackend {
    name: String,
    calls: AtomicUsize,
    script: Box<Script>,
    delay: Duration,
    usage: TokenUsage,
    pricing: Option<Pricing>,
}

impl ScriptedBackend {
    fn build(
        name: &str,
        script: impl Fn(ReviewRole, usize) -> Result<String, InvocationError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
            script: Box::new(script),
            delay: Duration::ZERO,
            usage: TokenUsage::default(),
            pricing: None,
        }
    }

    pub fn new(
        name: &str,
        script: impl Fn(ReviewRole, usize) -> Result<String, InvocationError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self::build(name, script))
    }

    /// Answers `body` after sleeping `delay` on every call.
    pub fn slow(name: &str, delay: Duration, body: String) -> Arc<Self> {
        let mut backend = Self::build(name, move |_, _| Ok(body.clone()));
        backend.delay = delay;
        Arc::new(backend)
    }

    /// Answers `body`, reporting `usage` billed at `pricing` on every call.
    pub fn priced(name: &str, body: String, usage: TokenUsage, pricing: Pricing) -> Arc<Self> {
        let mut backend = Self::build(name, move |_, _| Ok(body.clone()));
        backend.usage = usage;
        backend.pricing = Some(pricing);
        Arc::new(backend)
    }

    /// Every role gets the same body on every call.
    pub fn fixed(name: &str, body: String) -> Arc<Self> {
        Self::new(name, move |_, _| Ok(body.clone()))
    }

    /// Every call fails with a fatal auth error.
    pub fn denied(name: &str) -> Arc<Self> {
        Self::new(name, |_, _| {
            Err(InvocationError::new(InvocationErrorKind::Auth, "invalid api key"))
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn pricing(&self) -> Option<Pricing> {
        self.pricing
    }

    async fn complete(
        &self,
        role: ReviewRole,
        _system: &str,
        _prompt: &str,
    ) -> Result<Completion, InvocationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(role, n).map(|text| Completion::new(text, self.usage))
    }
}

pub const DOC: &str = "# Checkout PRD\n\n## Open questions\n\nStorage engine: TBD\n";

/// A reviewer body proposing one anchored edit.
pub fn proposal(location: &str, description: &str, anchor: &str, replacement: &str, score: u32) -> String {
    json!({
        "findings": [{
            "location": location,
            "description": description,
            "edit": { "anchor": anchor, "replacement": replacement },
            "score": score
        }]
    })
    .to_string()
}

/// A skeptic body raising one concern.
pub fn concern(location: &str, description: &str, score: u32) -> String {
    json!({
        "concerns": [{ "location": location, "description": description, "score": score }]
    })
    .to_string()
}

pub fn storage_proposal() -> String {
    proposal(
        "## Open questions",
        "Pick a storage engine",
        "TBD",
        "PostgreSQL 16",
        850,
    )
}

/// Two reviewers, no skeptics, no cross-scoring; state under `dir/state`.
pub fn config(dir: &Path) -> FlatlineConfig {
    let mut config = FlatlineConfig {
        state_dir: dir.join("state"),
        ..Default::default()
    };
    config.invocation.reviewers = 2;
    config.invocation.skeptics = false;
    config.invocation.cross_score = false;
    config.invocation.timeout_secs = 5;
    config.lock.max_wait_secs = 2;
    config
}

pub fn pool(backends: &[(Arc<ScriptedBackend>, Vec<ReviewRole>)]) -> BackendPool {
    let mut pool = BackendPool::new();
    for (backend, roles) in backends {
        let backend: Arc<dyn ReasoningBackend> = backend.clone();
        pool.add(backend, roles.clone());
    }
    pool
}

/// Writes [`DOC`] to `dir/prd.md` and builds an orchestrator over `dir`.
pub fn orchestrator(dir: &Path, config: FlatlineConfig, pool: BackendPool) -> Orchestrator {
    std::fs::write(dir.join("prd.md"), DOC).unwrap();
    Orchestrator::new(config, pool, Arc::new(FsDocumentStore::rooted(dir))).unwrap()
}

pub fn read_doc(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("prd.md")).unwrap()
}
