use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use super::{ExecutionSummary, Executor, ensure};
use crate::{config::duration, error::Result, iteration::IterationRunner};

fn ten_minutes() -> Duration {
    Duration::from_secs(600)
}

/// `iterations` shared by `vus` VUs; whichever VU is free takes the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct SharedIterations {
    #[builder(default = 1)]
    #[serde(default = "one")]
    pub vus: usize,
    pub iterations: u64,
    #[builder(default = ten_minutes())]
    #[serde(default = "ten_minutes", with = "duration")]
    pub max_duration: Duration,
}

/// Every one of `vus` VUs runs exactly `iterations` iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct PerVuIterations {
    #[builder(default = 1)]
    #[serde(default = "one")]
    pub vus: usize,
    pub iterations: u64,
    #[builder(default = ten_minutes())]
    #[serde(default = "ten_minutes", with = "duration")]
    pub max_duration: Duration,
}

fn one() -> usize {
    1
}

/// Where a VU gets its next iteration from.
#[derive(Clone)]
enum Quota {
    Shared(Arc<AtomicU64>),
    PerVu(u64),
}

impl Quota {
    fn claim(&mut self) -> bool {
        match self {
            Self::Shared(remaining) => remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok(),
            Self::PerVu(remaining) => match remaining.checked_sub(1) {
                Some(left) => {
                    *remaining = left;
                    true
                }
                None => false,
            },
        }
    }
}

impl<D: Send + Sync + 'static> Executor<D> for SharedIterations {
    fn validate(&self, scenario: &str) -> Result<()> {
        ensure(self.vus >= 1, scenario, "vus must be at least 1")?;
        ensure(!self.max_duration.is_zero(), scenario, "maxDuration must be greater than zero")
    }

    async fn exec(&self, runner: Arc<IterationRunner<D>>) -> Result<ExecutionSummary> {
        // More VUs than iterations would only idle
        let vus = self.vus.min(usize::try_from(self.iterations).unwrap_or(usize::MAX));
        let quota = Quota::Shared(Arc::new(AtomicU64::new(self.iterations)));
        Ok(run_quota(runner, vus, quota, self.max_duration, "shared-iterations").await)
    }
}

impl<D: Send + Sync + 'static> Executor<D> for PerVuIterations {
    fn validate(&self, scenario: &str) -> Result<()> {
        ensure(self.vus >= 1, scenario, "vus must be at least 1")?;
        ensure(!self.max_duration.is_zero(), scenario, "maxDuration must be greater than zero")
    }

    async fn exec(&self, runner: Arc<IterationRunner<D>>) -> Result<ExecutionSummary> {
        let quota = Quota::PerVu(self.iterations);
        Ok(run_quota(runner, self.vus, quota, self.max_duration, "per-vu-iterations").await)
    }
}

async fn run_quota<D: Send + Sync + 'static>(
    runner: Arc<IterationRunner<D>>,
    vus: usize,
    quota: Quota,
    max_duration: Duration,
    executor: &'static str,
) -> ExecutionSummary {
    let run = runner.run_context().clone();
    tracing::info!(
        "Starting {executor} scenario {} on {vus} VUs (max {max_duration:?})",
        runner.scenario()
    );
    let start = Instant::now();
    let deadline = start + max_duration;

    let handles: Vec<_> = (0..vus)
        .map(|_| {
            let runner = runner.clone();
            let mut quota = quota.clone();
            tokio::spawn(async move {
                let run = runner.run_context().clone();
                let vu = run.allocate_vu();
                let mut done = 0u64;
                // Deadline and stop are checked between iterations only
                while Instant::now() < deadline && !run.is_stopped() && quota.claim() {
                    runner.run(vu).await;
                    done += 1;
                }
                done
            })
        })
        .collect();

    let started = join_all(handles)
        .await
        .into_iter()
        .filter_map(|res| {
            res.inspect_err(|e| tracing::error!("VU task of {} failed: {e}", runner.scenario()))
                .ok()
        })
        .sum();
    if Instant::now() >= deadline {
        tracing::warn!("{}: maxDuration reached before all iterations ran", runner.scenario());
    }

    ExecutionSummary {
        scenario: runner.scenario().to_owned(),
        executor,
        started,
        dropped: 0,
        peak_vus: vus as u64,
        elapsed: start.elapsed(),
        interrupted_by: run.stop_reason(),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use super::*;
    use crate::{
        context::{RunContext, ShortfallPolicy},
        iteration::action,
        metric::Tags,
        metrics::spawn_aggregator,
    };

    type PerVu = Arc<Mutex<BTreeMap<u64, u64>>>;

    fn runner(iteration: Duration) -> (Arc<IterationRunner<()>>, PerVu) {
        let (sink, _) = spawn_aggregator(Default::default(), 64);
        let run = Arc::new(RunContext::new(Arc::new(()), sink, ShortfallPolicy::Advisory));
        let per_vu: PerVu = Default::default();
        let seen = per_vu.clone();
        let act = action(move |ctx| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap().entry(ctx.vu).or_default() += 1;
                ctx.sleep(iteration).await;
                Ok(())
            }
        });
        (
            Arc::new(IterationRunner::new(run, act, "quota", Tags::new())),
            per_vu,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn shared_iterations_run_exactly_the_configured_count() {
        for vus in [1, 3, 7, 40] {
            let (runner, per_vu) = runner(Duration::from_millis(10));
            let profile = SharedIterations::builder().vus(vus).iterations(20).build();

            let summary = profile.exec(runner).await.unwrap();
            let total: u64 = per_vu.lock().unwrap().values().sum();
            assert_eq!(summary.started, 20, "vus = {vus}");
            assert_eq!(total, 20, "vus = {vus}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn per_vu_iterations_meet_every_quota() {
        let (runner, per_vu) = runner(Duration::from_millis(10));
        let profile = PerVuIterations::builder().vus(4).iterations(5).build();

        let summary = profile.exec(runner).await.unwrap();
        assert_eq!(summary.started, 20);
        let per_vu = per_vu.lock().unwrap();
        assert_eq!(per_vu.len(), 4);
        assert!(per_vu.values().all(|&n| n == 5), "{per_vu:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn max_duration_cuts_quotas_short_without_interrupting() {
        let (runner, per_vu) = runner(Duration::from_secs(1));
        let profile = PerVuIterations::builder()
            .vus(2)
            .iterations(100)
            .max_duration(Duration::from_millis(2_500))
            .build();

        let summary = profile.exec(runner).await.unwrap();
        // Iterations start at 0s, 1s and 2s; the one started at 2s finishes at 3s
        assert_eq!(summary.started, 6);
        assert!(summary.elapsed >= Duration::from_secs(3));
        assert!(per_vu.lock().unwrap().values().all(|&n| n == 3));
    }
}
