//! Executor — scheduling of iteration starts and VU concurrency
//!
//! An [`Executor`] turns a scenario profile into iteration starts. Every
//! executor drives the same [`IterationRunner`]; they differ only in *when*
//! iterations start and *which* VU runs them.
//!
//! Two families exist:
//!
//! - **Arrival-rate** executors ([`ConstantArrivalRate`], [`RampingArrivalRate`])
//!   run a governor task that emits starts on a precomputed timetable,
//!   independent of how long iterations take. Starts are handed to an elastic
//!   [`pool::WorkerPool`]; when no VU is free and the pool is at `maxVUs`, the
//!   start is recorded as a dropped iteration instead of blocking the governor.
//! - **Closed-model** executors ([`ConstantVus`], [`RampingVus`],
//!   [`SharedIterations`], [`PerVuIterations`]) keep a number of VUs looping;
//!   each VU starts its next iteration as soon as the previous one finished.
//!
//! # Rates and stages
//! A [`Stage`] ramps a target linearly from the previous value to `target` over
//! `duration`. A zero-duration stage is an instantaneous step.
//!
//! For arrival-rate executors the instantaneous rate `r(t)` is integrated into
//! the expected number of starts `N(t)`, and the `k`-th start (zero based)
//! happens at the exact time where `N(t) = k`:
//!
//! ```text
//! r(t) = r0 + a·e                     (e = time into the stage)
//! N(t) = N0 + r0·e + a·e²/2
//! e(k) = 2·(k - N0) / (r0 + sqrt(r0² + 2a·(k - N0)))
//! ```
//!
//! The last form avoids the cancellation the textbook root suffers from when
//! `a` is small, so constant and ramping stages go through the same code. A
//! constant rate `R` over `D` therefore yields exactly `R·D` starts, the first
//! one at `t = 0`.
//!
//! VU executors instead sample the interpolated target every `tick` (100ms by
//! default) and wake or park VUs to follow it.
//!
//! # Draining
//! When a schedule ends, its duration ceiling passes or the run is stopped, no
//! new iteration starts. Iterations already running are never interrupted;
//! `exec` returns once every VU has finished its current one.
pub mod arrival;
pub mod iterations;
pub mod pool;
pub mod ramp;
pub mod vus;

pub use arrival::{ConstantArrivalRate, RampingArrivalRate};
pub use iterations::{PerVuIterations, SharedIterations};
pub use ramp::Stage;
pub use vus::{ConstantVus, RampingVus};

use std::{sync::Arc, time::Duration};

use serde::Serialize;

use crate::{context::StopReason, error::Result, iteration::IterationRunner};

/// What happened while one scenario was executed.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub scenario: String,
    pub executor: &'static str,
    /// Iterations that started on a VU.
    pub started: u64,
    /// Starts no VU could take.
    pub dropped: u64,
    /// Highest number of VUs alive at once.
    pub peak_vus: u64,
    pub elapsed: Duration,
    /// Set when the run was stopped before the schedule ended.
    pub interrupted_by: Option<StopReason>,
}

pub trait Executor<D>
where
    Self: Send + Sync,
    D: Send + Sync + 'static,
{
    /// Checks the profile before anything runs.
    fn validate(&self, scenario: &str) -> Result<()>;

    /// Runs the schedule to completion and drains in-flight iterations.
    fn exec(
        &self,
        runner: Arc<IterationRunner<D>>,
    ) -> impl Future<Output = Result<ExecutionSummary>> + Send;
}

/// Shared validation for `maxVUs ≥ preAllocatedVUs` style invariants.
pub(crate) fn ensure(condition: bool, scenario: &str, reason: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(crate::error::Error::profile(scenario, reason))
    }
}

pub(crate) fn ensure_finite(value: f64, scenario: &str, what: &str) -> Result<()> {
    ensure(
        value.is_finite() && value >= 0.0,
        scenario,
        &format!("{what} must be a non-negative finite number, got {value}"),
    )
}
