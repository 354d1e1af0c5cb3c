//! The iteration executor: runs one scenario function and turns whatever
//! happens inside it into a recorded outcome.
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use tokio::time::Instant;

use crate::{
    context::{CheckTally, IterationContext, RunContext},
    metric::{IterationOutcome, IterationRecord, Sample, Tags},
};

/// A failure that ends one iteration early.
///
/// Returned from a scenario function with `?`; the run keeps going.
#[derive(Debug, thiserror::Error)]
pub enum IterationError {
    /// Something the iteration needs is missing, e.g. an empty fixture entry.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("could not decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl IterationError {
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::Precondition(reason.into())
    }
}

pub type IterationResult = Result<(), IterationError>;

/// A scenario function, type-erased so scenarios with different closures can
/// share one run.
pub type Action<D> =
    Arc<dyn Fn(IterationContext<D>) -> BoxFuture<'static, IterationResult> + Send + Sync>;

/// Wraps a closure into an [`Action`].
pub fn action<D, F, Fut>(f: F) -> Action<D>
where
    F: Fn(IterationContext<D>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = IterationResult> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Runs iterations of one scenario on behalf of any VU.
///
/// Executors share one runner per scenario and call [`IterationRunner::run`]
/// from as many VU tasks as they like.
pub struct IterationRunner<D> {
    run: Arc<RunContext<D>>,
    action: Action<D>,
    scenario: Arc<str>,
    tags: Tags,
    counter: AtomicU64,
}

impl<D: Send + Sync + 'static> IterationRunner<D> {
    pub(crate) fn new(
        run: Arc<RunContext<D>>,
        action: Action<D>,
        scenario: &str,
        tags: Tags,
    ) -> Self {
        Self {
            run,
            action,
            scenario: scenario.into(),
            tags: tags.with("scenario", scenario),
            counter: AtomicU64::new(0),
        }
    }

    pub fn run_context(&self) -> &Arc<RunContext<D>> {
        &self.run
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Runs one iteration to completion on VU `vu`.
    ///
    /// Errors and panics raised by the scenario function stop here.
    pub async fn run(&self, vu: u64) -> IterationOutcome {
        let checks = Arc::new(CheckTally::default());
        let ctx = IterationContext::new(
            self.run.next_iteration_id(),
            self.counter.fetch_add(1, Ordering::Relaxed),
            vu,
            self.scenario.clone(),
            self.tags.clone(),
            self.run.fixture().clone(),
            self.run.sink().clone(),
            checks.clone(),
        );
        let (id, seed) = (ctx.id, ctx.seed);

        let started = Instant::now();
        let result = AssertUnwindSafe((self.action)(ctx)).catch_unwind().await;
        let duration = started.elapsed();

        let outcome = match result {
            Ok(Ok(())) => match checks.failed() {
                0 => IterationOutcome::Success,
                failed_checks => IterationOutcome::CheckFailure { failed_checks },
            },
            Ok(Err(e)) => {
                tracing::debug!("Iteration {id} (seed {seed}) on VU {vu} failed: {e}");
                IterationOutcome::HardFailure {
                    reason: e.to_string(),
                }
            }
            Err(panic) => {
                let reason = panic_message(&*panic);
                tracing::warn!("Iteration {id} (seed {seed}) on VU {vu} panicked: {reason}");
                IterationOutcome::HardFailure { reason }
            }
        };
        self.record(vu, outcome.clone(), duration);
        outcome
    }

    fn record(&self, vu: u64, outcome: IterationOutcome, duration: Duration) {
        self.run.sink().record(Sample::Iteration(IterationRecord {
            tags: self.tags.clone(),
            vu,
            outcome,
            duration,
        }));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with a non-string payload".to_owned())
}
