use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use super::{
    ExecutionSummary, Executor, ensure, ensure_finite,
    pool::{Dispatch, WorkerPool},
    ramp::{Ramp, Stage},
};
use crate::{config::duration, error::Result, iteration::IterationRunner};

fn one_second() -> Duration {
    Duration::from_secs(1)
}

/// Starts `rate` iterations per `time_unit` for `duration`, whatever they cost.
///
/// ```
/// # use std::time::Duration;
/// # use stampede::executor::ConstantArrivalRate;
/// let steady = ConstantArrivalRate::builder()
///     .rate(400.0)
///     .duration(Duration::from_secs(30))
///     .pre_allocated_vus(80)
///     .max_vus(400)
///     .build();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct ConstantArrivalRate {
    pub rate: f64,
    #[builder(default = one_second())]
    #[serde(default = "one_second", with = "duration")]
    pub time_unit: Duration,
    #[serde(with = "duration")]
    pub duration: Duration,
    #[serde(rename = "preAllocatedVUs")]
    pub pre_allocated_vus: usize,
    #[serde(rename = "maxVUs")]
    pub max_vus: usize,
}

/// Ramps the arrival rate through `stages`, starting from `start_rate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct RampingArrivalRate {
    #[builder(default)]
    #[serde(default)]
    pub start_rate: f64,
    #[builder(default = one_second())]
    #[serde(default = "one_second", with = "duration")]
    pub time_unit: Duration,
    pub stages: Vec<Stage>,
    #[serde(rename = "preAllocatedVUs")]
    pub pre_allocated_vus: usize,
    #[serde(rename = "maxVUs")]
    pub max_vus: usize,
}

impl ConstantArrivalRate {
    fn ramp(&self) -> Ramp {
        Ramp::new(self.rate, vec![Stage::new(self.duration, self.rate)])
            .scaled(1.0 / self.time_unit.as_secs_f64())
    }
}

impl RampingArrivalRate {
    fn ramp(&self) -> Ramp {
        Ramp::new(self.start_rate, self.stages.clone()).scaled(1.0 / self.time_unit.as_secs_f64())
    }
}

fn validate_pool(
    scenario: &str,
    time_unit: Duration,
    pre_allocated_vus: usize,
    max_vus: usize,
) -> Result<()> {
    ensure(!time_unit.is_zero(), scenario, "timeUnit must be greater than zero")?;
    ensure(
        max_vus >= pre_allocated_vus,
        scenario,
        "maxVUs must not be lower than preAllocatedVUs",
    )?;
    ensure(max_vus > 0, scenario, "maxVUs must be at least 1")
}

impl<D: Send + Sync + 'static> Executor<D> for ConstantArrivalRate {
    fn validate(&self, scenario: &str) -> Result<()> {
        ensure_finite(self.rate, scenario, "rate")?;
        validate_pool(scenario, self.time_unit, self.pre_allocated_vus, self.max_vus)
    }

    async fn exec(&self, runner: Arc<IterationRunner<D>>) -> Result<ExecutionSummary> {
        let pool = WorkerPool::new(runner.clone(), self.pre_allocated_vus, self.max_vus);
        Ok(govern(runner, pool, self.ramp(), "constant-arrival-rate").await)
    }
}

impl<D: Send + Sync + 'static> Executor<D> for RampingArrivalRate {
    fn validate(&self, scenario: &str) -> Result<()> {
        ensure_finite(self.start_rate, scenario, "startRate")?;
        for stage in &self.stages {
            ensure_finite(stage.target, scenario, "stage target")?;
        }
        ensure(!self.stages.is_empty(), scenario, "at least one stage is required")?;
        validate_pool(scenario, self.time_unit, self.pre_allocated_vus, self.max_vus)
    }

    async fn exec(&self, runner: Arc<IterationRunner<D>>) -> Result<ExecutionSummary> {
        let pool = WorkerPool::new(runner.clone(), self.pre_allocated_vus, self.max_vus);
        Ok(govern(runner, pool, self.ramp(), "ramping-arrival-rate").await)
    }
}

/// Governor task: emits the `k`-th start at the time the cumulative arrival
/// curve reaches `k`, never waiting on the pool.
async fn govern<D: Send + Sync + 'static>(
    runner: Arc<IterationRunner<D>>,
    pool: WorkerPool<D>,
    ramp: Ramp,
    executor: &'static str,
) -> ExecutionSummary {
    let run = runner.run_context().clone();
    let mut stop = run.stop_signal();
    let (mut started, mut dropped) = (0u64, 0u64);

    tracing::info!(
        "Starting {executor} scenario {} for {:?}",
        runner.scenario(),
        ramp.duration()
    );
    let start = Instant::now();
    let mut k = 0u64;
    while let Some(offset) = ramp.time_of(k as f64) {
        tokio::select! {
            biased;
            _ = stop.wait_for(Option::is_some) => break,
            _ = tokio::time::sleep_until(start + offset) => {}
        }
        match pool.try_dispatch() {
            Dispatch::Idle | Dispatch::Grown => started += 1,
            Dispatch::Dropped => {
                dropped += 1;
                run.record_dropped(runner.scenario(), runner.tags());
                tracing::debug!("No free VU in {}, iteration dropped", runner.scenario());
            }
        }
        k += 1;
    }

    tracing::info!("Draining {} in-flight iterations...", runner.scenario());
    pool.drain().await;
    if dropped > 0 {
        tracing::warn!(
            "{}: {dropped} iterations dropped, all {} VUs were busy",
            runner.scenario(),
            pool.spawned()
        );
    }

    ExecutionSummary {
        scenario: runner.scenario().to_owned(),
        executor,
        started,
        dropped,
        peak_vus: pool.spawned() as u64,
        elapsed: start.elapsed(),
        interrupted_by: run.stop_reason(),
    }
}
