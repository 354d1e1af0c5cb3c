use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use typed_builder::TypedBuilder;

use super::{
    ExecutionSummary, Executor, ensure, ensure_finite,
    ramp::{Ramp, Stage},
};
use crate::{config::duration, error::Result, iteration::IterationRunner};

fn default_tick() -> Duration {
    Duration::from_millis(100)
}

/// A fixed number of VUs looping for `duration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct ConstantVus {
    pub vus: usize,
    #[serde(with = "duration")]
    pub duration: Duration,
}

/// VUs ramped through `stages`, starting from `start_vus`.
///
/// The desired count is sampled every `tick`. VUs above it park once their
/// current iteration ends; they are never interrupted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct RampingVus {
    #[builder(default)]
    #[serde(default, rename = "startVUs")]
    pub start_vus: usize,
    pub stages: Vec<Stage>,
    #[builder(default = default_tick())]
    #[serde(default = "default_tick", with = "duration")]
    pub tick: Duration,
}

impl<D: Send + Sync + 'static> Executor<D> for ConstantVus {
    fn validate(&self, scenario: &str) -> Result<()> {
        ensure(self.vus >= 1, scenario, "vus must be at least 1")
    }

    async fn exec(&self, runner: Arc<IterationRunner<D>>) -> Result<ExecutionSummary> {
        let ramp = Ramp::new(
            self.vus as f64,
            vec![Stage::new(self.duration, self.vus as f64)],
        );
        Ok(follow(runner, ramp, default_tick(), "constant-vus").await)
    }
}

impl<D: Send + Sync + 'static> Executor<D> for RampingVus {
    fn validate(&self, scenario: &str) -> Result<()> {
        ensure(!self.stages.is_empty(), scenario, "at least one stage is required")?;
        ensure(!self.tick.is_zero(), scenario, "tick must be greater than zero")?;
        for stage in &self.stages {
            ensure_finite(stage.target, scenario, "stage target")?;
        }
        Ok(())
    }

    async fn exec(&self, runner: Arc<IterationRunner<D>>) -> Result<ExecutionSummary> {
        let ramp = Ramp::new(self.start_vus as f64, self.stages.clone());
        Ok(follow(runner, ramp, self.tick, "ramping-vus").await)
    }
}

/// What VUs are currently allowed to do.
#[derive(Debug, Clone, Copy)]
struct Gate {
    /// VU slots below this index may start iterations.
    desired: usize,
    open: bool,
}

/// Keeps the number of looping VUs at the ramp's value until it ends.
async fn follow<D: Send + Sync + 'static>(
    runner: Arc<IterationRunner<D>>,
    ramp: Ramp,
    tick: Duration,
    executor: &'static str,
) -> ExecutionSummary {
    let run = runner.run_context().clone();
    let mut stop = run.stop_signal();
    let (gate, _) = watch::channel(Gate {
        desired: 0,
        open: true,
    });
    let mut handles: Vec<JoinHandle<u64>> = Vec::new();
    let total = ramp.duration();

    tracing::info!(
        "Starting {executor} scenario {} for {total:?}",
        runner.scenario()
    );
    let start = Instant::now();
    let mut next_tick = start;
    loop {
        let elapsed = start.elapsed();
        if elapsed >= total {
            break;
        }
        let desired = ramp.value_at(elapsed).round() as usize;
        while handles.len() < desired {
            let slot = handles.len();
            handles.push(tokio::spawn(vu_loop(
                slot,
                runner.clone(),
                gate.subscribe(),
            )));
        }
        gate.send_if_modified(|g| {
            let changed = g.desired != desired;
            g.desired = desired;
            changed
        });

        next_tick += tick;
        tokio::select! {
            biased;
            _ = stop.wait_for(Option::is_some) => break,
            _ = tokio::time::sleep_until(next_tick.min(start + total)) => {}
        }
    }

    tracing::info!("Draining {} in-flight iterations...", runner.scenario());
    gate.send_modify(|g| g.open = false);
    let peak_vus = handles.len() as u64;
    let started = join_all(handles)
        .await
        .into_iter()
        .filter_map(|res| {
            res.inspect_err(|e| tracing::error!("VU task of {} failed: {e}", runner.scenario()))
                .ok()
        })
        .sum();

    ExecutionSummary {
        scenario: runner.scenario().to_owned(),
        executor,
        started,
        dropped: 0,
        peak_vus,
        elapsed: start.elapsed(),
        interrupted_by: run.stop_reason(),
    }
}

/// One VU slot: loops while the gate admits it, parks otherwise.
async fn vu_loop<D: Send + Sync + 'static>(
    slot: usize,
    runner: Arc<IterationRunner<D>>,
    mut gate: watch::Receiver<Gate>,
) -> u64 {
    let vu = runner.run_context().allocate_vu();
    let mut iterations = 0;
    loop {
        let admitted = match gate.wait_for(|g| !g.open || g.desired > slot).await {
            Ok(g) => g.open,
            Err(_) => false,
        };
        if !admitted {
            break;
        }
        runner.run(vu).await;
        iterations += 1;
    }
    iterations
}
