use std::{collections::BTreeSet, sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::{
    config::RunOptions,
    context::{RunContext, ShortfallPolicy},
    error::{Error, Result},
    fixture::Setup,
    iteration::Action,
    metrics::{LiveMetrics, spawn_aggregator},
    report::{MetricsReport, RunReport, ThresholdReport},
    scenario::Scenario,
    threshold::{ThresholdRule, ThresholdWatch},
};

/// A complete load test: scenarios, thresholds and run-wide policies.
///
/// ```no_run
/// # use std::time::Duration;
/// # use stampede::{Run, Scenario, ThresholdRule, executor::ConstantVus, fixture::NoSetup};
/// # async fn demo() -> stampede::Result<()> {
/// let report = Run::builder()
///     .scenarios(vec![Scenario::new(
///         "health",
///         ConstantVus::builder().vus(10).duration(Duration::from_secs(30)).build(),
///         |ctx| async move {
///             ctx.sleep(Duration::from_secs(1)).await;
///             Ok(())
///         },
///     )])
///     .thresholds(vec![ThresholdRule::parse("http_req_failed", "rate<0.01")?])
///     .build()
///     .execute(NoSetup)
///     .await?;
/// std::process::exit(report.exit_code());
/// # }
/// ```
#[derive(TypedBuilder)]
pub struct Run<D> {
    scenarios: Vec<Scenario<D>>,
    #[builder(default)]
    thresholds: Vec<ThresholdRule>,
    /// How often thresholds are evaluated while the run is live.
    #[builder(default = Duration::from_secs(2))]
    threshold_cadence: Duration,
    #[builder(default)]
    shortfall_policy: ShortfallPolicy,
    /// Most samples folded into the aggregate per lock acquisition.
    #[builder(default = 1024)]
    metrics_batch: usize,
}

impl<D: Send + Sync + 'static> Run<D> {
    /// Builds a run from k6-style options, resolving `exec` names with `resolve`.
    pub fn from_options(
        options: &RunOptions,
        resolve: impl Fn(&str) -> Option<Action<D>>,
    ) -> Result<Self> {
        Ok(Self::builder()
            .scenarios(options.scenarios(resolve)?)
            .thresholds(options.threshold_rules()?)
            .build())
    }

    /// Checks every profile before anything runs.
    pub fn validate(&self) -> Result<()> {
        if self.scenarios.is_empty() {
            return Err(Error::NoScenarios);
        }
        let mut names = BTreeSet::new();
        for scenario in &self.scenarios {
            if !names.insert(scenario.name.as_str()) {
                return Err(Error::DuplicateScenario(scenario.name.clone()));
            }
            scenario.validate()?;
        }
        if self.threshold_cadence.is_zero() {
            return Err(Error::InvalidDuration {
                input: "0s".into(),
                reason: "threshold cadence must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Validates, runs `setup` once, then every scenario concurrently.
    ///
    /// A setup failure aborts the run before any iteration starts.
    pub async fn execute(&self, setup: impl Setup<D>) -> Result<RunReport> {
        self.validate()?;
        tracing::info!("Running setup...");
        let fixture = setup.setup().await.inspect_err(|e| {
            tracing::error!("Setup failed, no scenario will run: {e}");
        })?;
        self.run(fixture).await
    }

    /// Like [`Run::execute`] with an already built fixture.
    pub async fn execute_with_fixture(&self, fixture: D) -> Result<RunReport> {
        self.validate()?;
        self.run(fixture).await
    }

    async fn run(&self, fixture: D) -> Result<RunReport> {
        let live = LiveMetrics::default();
        let (sink, aggregator) = spawn_aggregator(live.clone(), self.metrics_batch);
        let run = Arc::new(RunContext::new(
            Arc::new(fixture),
            sink,
            self.shortfall_policy,
        ));
        let rules: Arc<[ThresholdRule]> = self.thresholds.clone().into();
        let watch = ThresholdWatch::spawn(
            rules.clone(),
            live.clone(),
            run.stop_handle(),
            self.threshold_cadence,
        );

        tracing::info!("Starting {} scenario(s)", self.scenarios.len());
        let started = Instant::now();
        let results = join_all(self.scenarios.iter().map(|s| s.run(run.clone()))).await;
        let duration = started.elapsed();

        let breached = watch.finish().await?;
        let stopped_by = run.stop_reason();
        let shortfall_failed = run.shortfall_failed();
        // The aggregator ends once the last sink, held by the run context, is gone
        drop(run);
        aggregator.await?;
        let scenarios = results.into_iter().collect::<Result<Vec<_>>>()?;

        let aggregate = live.take().await;
        let thresholds: Vec<_> = rules
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                let verdict = rule.evaluate(&aggregate);
                let breached_during_run = breached.contains(&i);
                ThresholdReport {
                    rule: rule.to_string(),
                    metric: rule.metric,
                    verdict,
                    abort_on_fail: rule.abort_on_fail,
                    breached_during_run,
                    failed: verdict.is_breach() || (rule.abort_on_fail && breached_during_run),
                }
            })
            .collect();
        for t in thresholds.iter().filter(|t| t.failed) {
            tracing::warn!("Threshold `{}` failed: {:?}", t.rule, t.verdict);
        }

        let report = RunReport {
            duration,
            scenarios,
            metrics: MetricsReport::from(aggregate),
            thresholds,
            stopped_by,
            shortfall_failed,
        };
        tracing::info!(
            "Run finished in {duration:?}, {}",
            if report.passed() { "passed" } else { "failed" }
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use super::*;
    use crate::{
        context::{IterationContext, StopReason},
        executor::{ConstantArrivalRate, ConstantVus, SharedIterations},
        fixture::{NoSetup, SetupError},
        iteration::IterationError,
        threshold::Verdict,
    };

    fn shared(iterations: u64) -> SharedIterations {
        SharedIterations::builder().vus(2).iterations(iterations).build()
    }

    #[tokio::test(start_paused = true)]
    async fn setup_runs_once_and_feeds_every_iteration() {
        let setups = Arc::new(AtomicU64::new(0));
        let counted = setups.clone();
        let setup = move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SetupError>(vec![7u64, 8, 9])
            }
        };
        let sum = Arc::new(AtomicU64::new(0));
        let seen = sum.clone();
        let add_fixture = move |ctx: IterationContext<Vec<u64>>| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(ctx.fixture().iter().sum(), Ordering::SeqCst);
                Ok(())
            }
        };

        let report = Run::builder()
            .scenarios(vec![Scenario::new("sum", shared(10), add_fixture)])
            .build()
            .execute(setup)
            .await
            .unwrap();

        assert_eq!(setups.load(Ordering::SeqCst), 1);
        assert_eq!(sum.load(Ordering::SeqCst), 240);
        assert_eq!(report.metrics.iterations.iterations, 10);
        assert!(report.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn setup_failure_aborts_before_any_iteration() {
        let ran = Arc::new(AtomicU64::new(0));
        let counted = ran.clone();
        let run = Run::builder()
            .scenarios(vec![Scenario::new("never", shared(5), move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })])
            .build();

        let err = run
            .execute(|| async { Err::<(), _>(SetupError::new("GET /rooms", "status 503")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Setup(_)), "{err}");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn validation_catches_run_level_mistakes() {
        let empty = Run::<()>::builder().scenarios(Vec::new()).build();
        assert!(matches!(empty.validate(), Err(Error::NoScenarios)));

        let twice = Run::<()>::builder()
            .scenarios(vec![
                Scenario::new("a", shared(1), |_| async { Ok(()) }),
                Scenario::new("a", shared(1), |_| async { Ok(()) }),
            ])
            .build();
        assert!(matches!(twice.validate(), Err(Error::DuplicateScenario(n)) if n == "a"));
    }

    #[tokio::test(start_paused = true)]
    async fn aborting_threshold_stops_the_run_and_fails_it() {
        let report = Run::<()>::builder()
            .scenarios(vec![Scenario::new(
                "failing",
                ConstantArrivalRate::builder()
                    .rate(10.0)
                    .duration(Duration::from_secs(60))
                    .pre_allocated_vus(2)
                    .max_vus(5)
                    .build(),
                |_| async { Err(IterationError::precondition("backend down")) },
            )])
            .thresholds(vec![
                ThresholdRule::parse("iterations", "count<5")
                    .unwrap()
                    .abort_on_fail(),
            ])
            .threshold_cadence(Duration::from_secs(1))
            .build()
            .execute(NoSetup)
            .await
            .unwrap();

        assert!(matches!(
            report.stopped_by,
            Some(StopReason::ThresholdAbort { .. })
        ));
        // Stopped at the first tick that saw 5 or more iterations
        assert!(report.duration < Duration::from_secs(3), "{:?}", report.duration);
        assert!(report.thresholds[0].breached_during_run);
        assert!(report.thresholds[0].failed);
        assert_eq!(report.metrics.iterations.hard_failed, report.metrics.iterations.iterations);
        assert_eq!(report.exit_code(), 99);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_drains_iterations_that_were_in_flight() {
        let slow = |ctx: IterationContext<()>| async move {
            ctx.sleep(Duration::from_secs(3)).await;
            Ok(())
        };
        let report = Run::builder()
            .scenarios(vec![Scenario::new(
                "slow",
                ConstantArrivalRate::builder()
                    .rate(10.0)
                    .duration(Duration::from_secs(60))
                    .pre_allocated_vus(40)
                    .max_vus(40)
                    .build(),
                slow,
            )])
            .thresholds(vec![
                ThresholdRule::parse("iterations", "count<3")
                    .unwrap()
                    .abort_on_fail(),
            ])
            .threshold_cadence(Duration::from_secs(1))
            .build()
            .execute(NoSetup)
            .await
            .unwrap();

        assert!(matches!(
            report.stopped_by,
            Some(StopReason::ThresholdAbort { .. })
        ));
        // Nothing finishes before 3s, so every start up to the abort was still running
        let started: u64 = report.scenarios.iter().map(|s| s.started).sum();
        assert!(started > 3, "{started} started");
        assert_eq!(started, report.metrics.iterations.iterations);
        assert_eq!(report.metrics.dropped_iterations, 0);
        assert!(report.duration < Duration::from_secs(8), "{:?}", report.duration);
    }

    #[tokio::test(start_paused = true)]
    async fn scenarios_run_concurrently_with_start_times() {
        let vus = |secs| {
            ConstantVus::builder()
                .vus(1)
                .duration(Duration::from_secs(secs))
                .build()
        };
        let think = |ctx: IterationContext<()>| async move {
            ctx.sleep(Duration::from_millis(500)).await;
            Ok(())
        };
        let report = Run::builder()
            .scenarios(vec![
                Scenario::new("first", vus(2), think),
                Scenario::new("second", vus(2), think).start_time(Duration::from_secs(1)),
            ])
            .thresholds(vec![ThresholdRule::parse("iterations{scenario:second}", "count>0").unwrap()])
            .build()
            .execute(NoSetup)
            .await
            .unwrap();

        assert_eq!(report.scenarios.len(), 2);
        // Overlapping, so the run lasts about 3s rather than 4s
        assert!(report.duration < Duration::from_millis(3_600), "{:?}", report.duration);
        assert!(matches!(report.thresholds[0].verdict, Verdict::Pass(n) if n >= 4.0));
    }
}
