//! Bounded review fan-out.
//!
//! ```text
//!                ┌─► reviewer[0] ─┐
//! jobs ──► JoinSet ─► reviewer[1] ─┼─► Vec<ReviewResult> (sorted by role, slot)
//!   (Semaphore)  ├─► skeptic[0]  ─┤
//!                └─► skeptic[1]  ─┘
//! ```
//!
//! Each job runs the retry executor with its own per-attempt timeout, all
//! jobs drawing on the same run budget. A failed slot still produces a
//! result carrying its error; a panicked task is logged and its slot is
//! simply missing. The classifier works with whatever arrives.
//!
//! Dropping the future returned by [`FanOut::run`] aborts every job still
//! in flight.

use std::sync::Arc;
use std::time::Duration;

use flatline_coordination::{ReviewRequest, ReviewResult, ReviewRole, RunBudget};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::backend::ReasoningBackend;
use crate::retry::RetryExecutor;

/// One invocation to run in a round.
pub struct ReviewJob {
    pub slot: usize,
    pub backend: Arc<dyn ReasoningBackend>,
    /// Tried in order while `backend`'s circuit is open.
    pub fallbacks: Vec<Arc<dyn ReasoningBackend>>,
    pub request: ReviewRequest,
}

pub struct FanOut {
    executor: Arc<RetryExecutor>,
    max_concurrency: usize,
    timeout: Duration,
}

impl FanOut {
    pub fn new(executor: Arc<RetryExecutor>, max_concurrency: usize, timeout: Duration) -> Self {
        Self {
            executor,
            max_concurrency: max_concurrency.max(1),
            timeout,
        }
    }

    pub async fn run(&self, jobs: Vec<ReviewJob>, budget: Arc<RunBudget>) -> Vec<ReviewResult> {
        let sem = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set: JoinSet<Option<ReviewResult>> = JoinSet::new();
        let submitted = jobs.len();

        for job in jobs {
            let sem = sem.clone();
            let executor = self.executor.clone();
            let budget = budget.clone();
            let timeout = self.timeout;
            join_set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                Some(executor.invoke(&job, timeout, &budget).await)
            });
        }

        let mut results = Vec::with_capacity(submitted);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(result)) => {
                    debug!(
                        role = %result.role,
                        slot = result.slot,
                        backend = %result.backend,
                        ok = result.is_success(),
                        latency_ms = result.latency_ms,
                        "Review slot finished"
                    );
                    results.push(result);
                }
                Ok(None) => warn!("Review slot skipped: semaphore closed"),
                Err(e) => warn!(error = %e, "Review task panicked"),
            }
        }
        results.sort_by_key(|r| (role_order(r.role), r.slot));
        results
    }
}

fn role_order(role: ReviewRole) -> u8 {
    match role {
        ReviewRole::Reviewer => 0,
        ReviewRole::Skeptic => 1,
        ReviewRole::Scorer => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flatline_coordination::retry::{BackendCircuit, RetryPolicy};
    use crate::backend::Completion;
    use flatline_coordination::{InvocationError, InvocationErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records peak concurrency.
    struct Gauge {
        name: &'static str,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ReasoningBackend for Gauge {
        fn name(&self) -> &str {
            self.name
        }

        async fn complete(
            &self,
            _role: ReviewRole,
            _system: &str,
            _prompt: &str,
        ) -> Result<Completion, InvocationError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(InvocationError::new(InvocationErrorKind::Auth, "denied"))
            } else {
                Ok(r#"{"findings": []}"#.into())
            }
        }
    }

    fn fanout(max: usize) -> FanOut {
        let exec = Arc::new(RetryExecutor::new(
            RetryPolicy::default(),
            BackendCircuit::default(),
        ));
        FanOut::new(exec, max, Duration::from_secs(5))
    }

    fn jobs(n: usize, failing_slot: Option<usize>) -> (Vec<ReviewJob>, Arc<AtomicUsize>) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs = (0..n)
            .map(|slot| ReviewJob {
                slot,
                backend: Arc::new(Gauge {
                    name: if Some(slot) == failing_slot { "bad" } else { "good" },
                    active: active.clone(),
                    peak: peak.clone(),
                    fail: Some(slot) == failing_slot,
                }),
                fallbacks: Vec::new(),
                request: ReviewRequest::new("prd.md", "x", ReviewRole::Reviewer),
            })
            .collect();
        (jobs, peak)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let (jobs, peak) = jobs(6, None);
        let results = fanout(2).run(jobs, Arc::new(RunBudget::unlimited())).await;
        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        let slots: Vec<_> = results.iter().map(|r| r.slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_slot_is_reported_not_dropped() {
        let (jobs, _) = jobs(2, Some(1));
        let results = fanout(4).run(jobs, Arc::new(RunBudget::unlimited())).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_success());
        assert_eq!(results[1].error().unwrap().kind, InvocationErrorKind::Auth);
    }
}
