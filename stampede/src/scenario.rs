use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    context::{IterationContext, RunContext},
    error::Result,
    executor::{
        ConstantArrivalRate, ConstantVus, ExecutionSummary, Executor, PerVuIterations,
        RampingArrivalRate, RampingVus, SharedIterations,
    },
    iteration::{Action, IterationResult, IterationRunner, action},
    metric::Tags,
};

/// The executor of a scenario, tagged the way k6 options name them.
///
/// ```json
/// { "executor": "ramping-arrival-rate", "startRate": 10, "timeUnit": "1s",
///   "preAllocatedVUs": 50, "maxVUs": 500,
///   "stages": [{ "target": 100, "duration": "30s" }] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum ScenarioProfile {
    ConstantVus(ConstantVus),
    RampingVus(RampingVus),
    ConstantArrivalRate(ConstantArrivalRate),
    RampingArrivalRate(RampingArrivalRate),
    SharedIterations(SharedIterations),
    PerVuIterations(PerVuIterations),
}

impl ScenarioProfile {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConstantVus(_) => "constant-vus",
            Self::RampingVus(_) => "ramping-vus",
            Self::ConstantArrivalRate(_) => "constant-arrival-rate",
            Self::RampingArrivalRate(_) => "ramping-arrival-rate",
            Self::SharedIterations(_) => "shared-iterations",
            Self::PerVuIterations(_) => "per-vu-iterations",
        }
    }
}

impl<D: Send + Sync + 'static> Executor<D> for ScenarioProfile {
    fn validate(&self, scenario: &str) -> Result<()> {
        match self {
            Self::ConstantVus(e) => Executor::<D>::validate(e, scenario),
            Self::RampingVus(e) => Executor::<D>::validate(e, scenario),
            Self::ConstantArrivalRate(e) => Executor::<D>::validate(e, scenario),
            Self::RampingArrivalRate(e) => Executor::<D>::validate(e, scenario),
            Self::SharedIterations(e) => Executor::<D>::validate(e, scenario),
            Self::PerVuIterations(e) => Executor::<D>::validate(e, scenario),
        }
    }

    async fn exec(&self, runner: Arc<IterationRunner<D>>) -> Result<ExecutionSummary> {
        match self {
            Self::ConstantVus(e) => e.exec(runner).await,
            Self::RampingVus(e) => e.exec(runner).await,
            Self::ConstantArrivalRate(e) => e.exec(runner).await,
            Self::RampingArrivalRate(e) => e.exec(runner).await,
            Self::SharedIterations(e) => e.exec(runner).await,
            Self::PerVuIterations(e) => e.exec(runner).await,
        }
    }
}

macro_rules! profile_from {
    ($($executor:ident),+ $(,)?) => {
        $(impl From<$executor> for ScenarioProfile {
            fn from(value: $executor) -> Self {
                Self::$executor(value)
            }
        })+
    };
}

profile_from!(
    ConstantVus,
    RampingVus,
    ConstantArrivalRate,
    RampingArrivalRate,
    SharedIterations,
    PerVuIterations,
);

/// A named profile plus the function every iteration runs.
///
/// Several scenarios can share one run; each keeps its own schedule, VUs and
/// tags, and all of them see the same fixture.
pub struct Scenario<D> {
    pub name: String,
    pub profile: ScenarioProfile,
    pub action: Action<D>,
    /// Attached to every record the scenario emits, next to `scenario:<name>`.
    pub tags: Tags,
    /// Delay between the start of the run and the start of this scenario.
    pub start_time: Duration,
}

impl<D> Scenario<D> {
    pub fn new<F, Fut>(name: impl Into<String>, profile: impl Into<ScenarioProfile>, f: F) -> Self
    where
        F: Fn(IterationContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IterationResult> + Send + 'static,
    {
        Self::from_action(name, profile, action(f))
    }

    pub fn from_action(
        name: impl Into<String>,
        profile: impl Into<ScenarioProfile>,
        action: Action<D>,
    ) -> Self {
        Self {
            name: name.into(),
            profile: profile.into(),
            action,
            tags: Tags::new(),
            start_time: Duration::ZERO,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }

    pub fn tags(mut self, tags: Tags) -> Self {
        self.tags = self.tags.merged(&tags);
        self
    }

    pub fn start_time(mut self, start_time: Duration) -> Self {
        self.start_time = start_time;
        self
    }
}

impl<D: Send + Sync + 'static> Scenario<D> {
    pub fn validate(&self) -> Result<()> {
        Executor::<D>::validate(&self.profile, &self.name)
    }

    /// Waits for `start_time`, then runs the profile to completion.
    pub(crate) async fn run(&self, run: Arc<RunContext<D>>) -> Result<ExecutionSummary> {
        if !self.start_time.is_zero() {
            let mut stop = run.stop_signal();
            tokio::select! {
                _ = stop.wait_for(Option::is_some) => {
                    tracing::info!("Scenario {} skipped, run stopped before it began", self.name);
                    return Ok(self.skipped(&run));
                }
                _ = tokio::time::sleep(self.start_time) => {}
            }
        }
        let runner = Arc::new(IterationRunner::new(
            run,
            self.action.clone(),
            &self.name,
            self.tags.clone(),
        ));
        let summary = self.profile.exec(runner).await?;
        tracing::info!(
            "Done running scenario {}: {} iterations, {} dropped",
            self.name,
            summary.started,
            summary.dropped
        );
        Ok(summary)
    }

    fn skipped(&self, run: &RunContext<D>) -> ExecutionSummary {
        ExecutionSummary {
            scenario: self.name.clone(),
            executor: self.profile.kind(),
            started: 0,
            dropped: 0,
            peak_vus: 0,
            elapsed: Duration::ZERO,
            interrupted_by: run.stop_reason(),
        }
    }
}

impl<D> fmt::Debug for Scenario<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("profile", &self.profile)
            .field("tags", &self.tags)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_deserialize_from_k6_options() {
        let profile: ScenarioProfile = serde_json::from_str(
            r#"{
                "executor": "ramping-arrival-rate",
                "startRate": 10, "timeUnit": "1s",
                "preAllocatedVUs": 50, "maxVUs": 500,
                "stages": [
                    { "target": 100, "duration": "30s" },
                    { "target": 300, "duration": "1m" },
                    { "target": 500, "duration": "1m30s" }
                ]
            }"#,
        )
        .unwrap();
        let ScenarioProfile::RampingArrivalRate(ramping) = &profile else {
            panic!("wrong executor: {profile:?}");
        };
        assert_eq!(ramping.start_rate, 10.0);
        assert_eq!(ramping.max_vus, 500);
        assert_eq!(ramping.stages[2].duration, Duration::from_secs(90));

        let shared: ScenarioProfile = serde_json::from_str(
            r#"{ "executor": "shared-iterations", "vus": 5, "iterations": 20, "maxDuration": "30s" }"#,
        )
        .unwrap();
        assert_eq!(
            shared,
            SharedIterations::builder()
                .vus(5)
                .iterations(20)
                .max_duration(Duration::from_secs(30))
                .build()
                .into()
        );

        let vus: ScenarioProfile =
            serde_json::from_str(r#"{ "executor": "constant-vus", "vus": 10, "duration": 30 }"#)
                .unwrap();
        assert_eq!(vus.kind(), "constant-vus");
    }

    #[test]
    fn invalid_profiles_fail_validation() {
        let scenario = Scenario::<()>::new(
            "broken",
            PerVuIterations::builder().vus(0).iterations(1).build(),
            |_| async { Ok(()) },
        );
        assert!(scenario.validate().is_err());

        let scenario = Scenario::<()>::new(
            "fine",
            ConstantVus::builder().vus(1).duration(Duration::from_secs(1)).build(),
            |_| async { Ok(()) },
        )
        .tag("api", "quiz");
        assert!(scenario.validate().is_ok());
        assert_eq!(scenario.tags.get("api"), Some("quiz"));
    }
}
