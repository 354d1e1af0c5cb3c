use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use rand::{SeedableRng, prelude::IndexedRandom, rngs::StdRng};
use serde::Serialize;
use tokio::{sync::watch, time::Instant};

use crate::{
    metric::{CheckRecord, Sample, Tags},
    metrics::MetricsSink,
};

/// Why a run stopped emitting new iteration starts before its schedule ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum StopReason {
    ThresholdAbort { threshold: String },
    CapacityShortfall { scenario: String },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThresholdAbort { threshold } => write!(f, "threshold `{threshold}` breached"),
            Self::CapacityShortfall { scenario } => {
                write!(f, "scenario `{scenario}` ran out of VUs")
            }
        }
    }
}

/// What the run does when an arrival-rate scenario cannot find a free VU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShortfallPolicy {
    /// Record `dropped_iterations` and carry on.
    #[default]
    Advisory,
    /// Carry on, but mark the run failed.
    FailRun,
    /// Mark the run failed and stop new iteration starts.
    Abort,
}

/// Sets the run-wide stop signal. Only the first reason is kept.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<Option<StopReason>>>);

impl StopHandle {
    pub fn stop(&self, reason: StopReason) {
        let first = self.0.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if first {
            tracing::warn!("Stopping new iterations: {reason}");
        }
    }
}

/// Per-run state shared by every component.
///
/// Built once by [`crate::Run`] after setup succeeded and handed to executors
/// behind an `Arc`; there is no ambient global state.
pub struct RunContext<D> {
    fixture: Arc<D>,
    sink: MetricsSink,
    started: Instant,
    next_iteration: AtomicU64,
    next_vu: AtomicU64,
    stop_tx: StopHandle,
    stop_rx: watch::Receiver<Option<StopReason>>,
    shortfall: ShortfallPolicy,
    shortfall_hit: AtomicBool,
}

impl<D> RunContext<D> {
    pub fn new(fixture: Arc<D>, sink: MetricsSink, shortfall: ShortfallPolicy) -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            fixture,
            sink,
            started: Instant::now(),
            next_iteration: AtomicU64::new(0),
            next_vu: AtomicU64::new(1),
            stop_tx: StopHandle(Arc::new(tx)),
            stop_rx: rx,
            shortfall,
            shortfall_hit: AtomicBool::new(false),
        }
    }

    pub fn fixture(&self) -> &Arc<D> {
        &self.fixture
    }

    pub fn sink(&self) -> &MetricsSink {
        &self.sink
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop_tx.clone()
    }

    /// A receiver that resolves `wait_for(Option::is_some)` once the run stops.
    pub fn stop_signal(&self) -> watch::Receiver<Option<StopReason>> {
        self.stop_rx.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_rx.borrow().is_some()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_rx.borrow().clone()
    }

    pub(crate) fn next_iteration_id(&self) -> u64 {
        self.next_iteration.fetch_add(1, Ordering::Relaxed)
    }

    /// VU ids are unique across scenarios and start at 1.
    pub(crate) fn allocate_vu(&self) -> u64 {
        self.next_vu.fetch_add(1, Ordering::Relaxed)
    }

    /// Records an iteration start that no VU could take, applying the policy.
    pub(crate) fn record_dropped(&self, scenario: &str, tags: &Tags) {
        self.sink.record(Sample::Dropped { tags: tags.clone() });
        match self.shortfall {
            ShortfallPolicy::Advisory => {}
            ShortfallPolicy::FailRun => self.shortfall_hit.store(true, Ordering::Relaxed),
            ShortfallPolicy::Abort => {
                self.shortfall_hit.store(true, Ordering::Relaxed);
                self.stop_tx.stop(StopReason::CapacityShortfall {
                    scenario: scenario.to_owned(),
                });
            }
        }
    }

    /// Whether a shortfall happened under a policy that fails the run.
    pub fn shortfall_failed(&self) -> bool {
        self.shortfall_hit.load(Ordering::Relaxed)
    }
}

/// Counts failed checks of one iteration; shared with the iteration executor.
#[derive(Debug, Default)]
pub(crate) struct CheckTally(AtomicU32);

impl CheckTally {
    pub(crate) fn failed(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything one iteration may touch.
///
/// Created fresh for each iteration and dropped when it completes, so scratch
/// state (the RNG, tags) never leaks between iterations. The fixture is only
/// reachable through `&D`.
pub struct IterationContext<D> {
    /// Run-wide iteration sequence number.
    pub id: u64,
    /// Sequence number within the scenario.
    pub scenario_iteration: u64,
    /// The VU running this iteration.
    pub vu: u64,
    pub scenario: Arc<str>,
    /// Wall-clock start of the iteration.
    pub started_at: SystemTime,
    /// Seed of [`IterationContext::rng`], logged to replay an iteration.
    pub seed: u64,
    pub rng: StdRng,
    /// Tags attached to every record this iteration emits.
    pub tags: Tags,
    fixture: Arc<D>,
    sink: MetricsSink,
    checks: Arc<CheckTally>,
}

impl<D> IterationContext<D> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        scenario_iteration: u64,
        vu: u64,
        scenario: Arc<str>,
        tags: Tags,
        fixture: Arc<D>,
        sink: MetricsSink,
        checks: Arc<CheckTally>,
    ) -> Self {
        let seed = rand::random();
        Self {
            id,
            scenario_iteration,
            vu,
            scenario,
            started_at: SystemTime::now(),
            seed,
            rng: StdRng::seed_from_u64(seed),
            tags,
            fixture,
            sink,
            checks,
        }
    }

    pub fn fixture(&self) -> &D {
        &self.fixture
    }

    pub fn sink(&self) -> &MetricsSink {
        &self.sink
    }

    /// Records a named assertion. A failed check marks the iteration as a
    /// check failure but never stops it.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        if !passed {
            self.checks.0.fetch_add(1, Ordering::Relaxed);
        }
        self.sink.record(Sample::Check(CheckRecord {
            tags: self.tags.clone().with("check", name),
            passed,
        }));
        passed
    }

    /// Think time. Suspends only this VU.
    pub fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        tokio::time::sleep(duration)
    }

    /// Picks a random element using the iteration RNG.
    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        items.choose(&mut self.rng)
    }
}
