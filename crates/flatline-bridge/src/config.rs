use std::path::{Path, PathBuf};
use std::time::Duration;

use flatline_coordination::bridge::{BreakerConfig, ConvergenceConfig, RunMode};
use flatline_coordination::consensus::{ThresholdError, Thresholds};
use flatline_coordination::integration::RetentionPolicy;
use flatline_coordination::retry::RetryPolicy;
use flatline_coordination::{Pricing, ReviewRole};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid thresholds: {0}")]
    Thresholds(#[from] ThresholdError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Reviewer fan-out and per-call limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvocationConfig {
    /// Per-invocation timeout enforced by the adapter.
    pub timeout_secs: u64,
    /// Primary reviewer slots.
    pub reviewers: usize,
    /// Run one skeptic paired with each reviewer.
    pub skeptics: bool,
    /// Ask each reviewer to score the other reviewers' proposals.
    pub cross_score: bool,
    /// Concurrent invocations per round.
    pub max_concurrency: usize,
    /// Consecutive failures before a backend's circuit opens.
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_secs: u64,
    /// Walk to the next backend serving the same role while a backend's
    /// circuit is open.
    pub fallback: bool,
    /// Pause between iterations.
    pub inter_iteration_pause_ms: u64,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            reviewers: 2,
            skeptics: true,
            cross_score: true,
            max_concurrency: 4,
            circuit_failure_threshold: 5,
            circuit_cooldown_secs: 60,
            fallback: true,
            inter_iteration_pause_ms: 0,
        }
    }
}

impl InvocationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// A lock record older than this is reclaimed even if its owner is alive.
    pub stale_after_secs: u64,
    /// How long a transaction waits for the lock.
    pub max_wait_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 600,
            max_wait_secs: 30,
        }
    }
}

/// Spend limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Per-run spend limit in micro-USD. Unset means unlimited.
    pub max_cost_micros: Option<u64>,
}

/// One OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    /// e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key. Unset means no auth header.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Roles this backend may serve.
    #[serde(default = "all_roles")]
    pub roles: Vec<ReviewRole>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Unpriced backends are metered at zero cost.
    #[serde(default)]
    pub pricing: Option<Pricing>,
}

fn all_roles() -> Vec<ReviewRole> {
    vec![ReviewRole::Reviewer, ReviewRole::Skeptic, ReviewRole::Scorer]
}

fn default_max_tokens() -> u32 {
    4096
}

/// Top-level configuration, read from `flatline.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatlineConfig {
    /// Root for `locks/`, `snapshots/`, `manifests/` and `runs/`.
    pub state_dir: PathBuf,
    pub mode: RunMode,
    /// Iterations to run when convergence is not detected first.
    pub depth: u32,
    pub thresholds: Thresholds,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub convergence: ConvergenceConfig,
    pub snapshots: RetentionPolicy,
    pub lock: LockConfig,
    pub invocation: InvocationConfig,
    pub budget: BudgetConfig,
    pub backends: Vec<BackendConfig>,
}

impl Default for FlatlineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".flatline"),
            mode: RunMode::Interactive,
            depth: 3,
            thresholds: Thresholds::default(),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            convergence: ConvergenceConfig::default(),
            snapshots: RetentionPolicy::default(),
            lock: LockConfig::default(),
            invocation: InvocationConfig::default(),
            budget: BudgetConfig::default(),
            backends: Vec::new(),
        }
    }
}

impl FlatlineConfig {
    /// Read a TOML file, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// `FLATLINE_STATE_DIR`, `FLATLINE_MAX_ITERATIONS`, `FLATLINE_TIMEOUT_SECS`,
    /// `FLATLINE_MAX_COST_MICROS`. Unparseable numbers are ignored with a
    /// warning.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FLATLINE_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("FLATLINE_MAX_ITERATIONS") {
            match raw.trim().parse() {
                Ok(n) => self.breaker.max_iterations = n,
                Err(_) => warn!(value = %raw, "Ignoring invalid FLATLINE_MAX_ITERATIONS"),
            }
        }
        if let Some(raw) = lookup("FLATLINE_TIMEOUT_SECS") {
            match raw.trim().parse() {
                Ok(n) => self.invocation.timeout_secs = n,
                Err(_) => warn!(value = %raw, "Ignoring invalid FLATLINE_TIMEOUT_SECS"),
            }
        }
        if let Some(raw) = lookup("FLATLINE_MAX_COST_MICROS") {
            match raw.trim().parse() {
                Ok(n) => self.budget.max_cost_micros = Some(n),
                Err(_) => warn!(value = %raw, "Ignoring invalid FLATLINE_MAX_COST_MICROS"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()?;
        if self.invocation.reviewers == 0 {
            return Err(ConfigError::Invalid("invocation.reviewers must be at least 1".into()));
        }
        if self.invocation.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "invocation.max_concurrency must be at least 1".into(),
            ));
        }
        if self.invocation.timeout_secs == 0 {
            return Err(ConfigError::Invalid("invocation.timeout_secs must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.depth == 0 {
            return Err(ConfigError::Invalid("depth must be at least 1".into()));
        }
        let mut names = std::collections::HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
            if backend.roles.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}' serves no roles",
                    backend.name
                )));
            }
        }
        Ok(())
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock.stale_after_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock.max_wait_secs)
    }
}
