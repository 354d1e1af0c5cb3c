//! Stampede — a load-generation engine for HTTP and WebSocket/STOMP backends.
//!
//! Stampede follows the model k6 made popular: scenarios with executors that
//! decide *when* iterations start, thresholds that decide whether a run
//! passed, and a setup phase that runs once before any virtual user exists.
//! Scenarios are plain async Rust closures.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Run`]: glue that ties everything together. It runs setup once, starts
//!   every [`Scenario`] concurrently, evaluates thresholds while they run and
//!   returns a [`report::RunReport`].
//! - [`Scenario`]: a named [`ScenarioProfile`] plus the async function every
//!   iteration executes.
//! - [`Executor`]: turns a profile into iteration starts. Arrival-rate
//!   executors start iterations on a timetable regardless of how long they
//!   take, backed by an elastic pool of VUs; closed-model executors keep a
//!   number of VUs looping.
//! - [`IterationContext`]: what one iteration sees. The immutable fixture,
//!   its VU and iteration ids, a seeded RNG and the tags its records carry.
//! - [`protocol`]: request/response over HTTP and duplex sessions over
//!   WebSocket with a hard timeout.
//! - [`Metric`]: the records iterations produce. They flow to a single
//!   aggregator task that folds them into an [`Aggregate`].
//! - [`ThresholdRule`]: a k6-style pass/fail condition such as
//!   `http_req_duration{type:start} p(95)<2500`, optionally aborting the run.
//! - [`Report`] and [`Reporter`]: turn the final aggregate into output.
//!
//! # Design goals
//!
//! - Faithful scheduling: a constant rate `R` over `D` starts exactly `R·D`
//!   iterations, and a missing VU is reported as a dropped iteration instead
//!   of silently slowing the schedule down.
//! - Iterations are never interrupted. Stopping a run, for any reason, only
//!   stops new starts.
//! - No ambient state: everything a run shares lives in one
//!   [`context::RunContext`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use stampede::{
//!     Reporter, Run, Scenario, ThresholdRule,
//!     executor::ConstantArrivalRate,
//!     fixture::NoSetup,
//!     protocol::{Http, RequestSpec},
//!     report::StdoutReporter,
//! };
//!
//! #[tokio::main]
//! async fn main() -> stampede::Result<()> {
//!     // Build clients once and clone them into the scenario.
//!     let http = Http::default();
//!     let scenario = Scenario::new(
//!         "steady",
//!         ConstantArrivalRate::builder()
//!             .rate(50.0)
//!             .duration(Duration::from_secs(30))
//!             .pre_allocated_vus(10)
//!             .max_vus(100)
//!             .build(),
//!         move |ctx| {
//!             let http = http.clone();
//!             async move {
//!                 let res = http
//!                     .request(&ctx, RequestSpec::get("http://localhost:8080/health").tag("type", "health"))
//!                     .await;
//!                 ctx.check("status is 200", res.status == 200);
//!                 Ok(())
//!             }
//!         },
//!     );
//!
//!     let report = Run::builder()
//!         .scenarios(vec![scenario])
//!         .thresholds(vec![
//!             ThresholdRule::parse("http_req_failed", "rate<0.01")?.abort_on_fail(),
//!             ThresholdRule::parse("http_req_duration{type:health}", "p(95)<500")?,
//!         ])
//!         .build()
//!         .execute(NoSetup)
//!         .await?;
//!
//!     StdoutReporter.report(&report).await?;
//!     std::process::exit(report.exit_code());
//! }
//! ```
//!
//! See `stampede/examples/` for ports of complete test plans.

/// Mergeable metric state
pub mod aggregate;
/// k6-style options, durations and credentials
pub mod config;
/// Run-wide and per-iteration state
pub mod context;
pub mod error;
/// Schedulers that decide when iterations start
pub mod executor;
/// Ordered lookups with per-step timeouts
pub mod fallback;
/// One-time setup producing the shared fixture
pub mod fixture;
/// Running one scenario function with isolation
pub mod iteration;
/// Single records
pub mod metric;
/// The aggregator task
pub mod metrics;
/// HTTP and duplex session strategies
pub mod protocol;
/// Reports and Reporters
pub mod report;
/// Whole-run orchestration
pub mod run;
/// Profiles and scenario functions
pub mod scenario;
/// Pass/fail rules over aggregates
pub mod threshold;

pub use aggregate::Aggregate;
pub use context::{IterationContext, ShortfallPolicy, StopReason};
pub use error::{Error, Result};
pub use executor::Executor;
pub use fixture::{Setup, SetupError};
pub use iteration::{IterationError, IterationResult};
pub use metric::{Metric, Tags};
pub use report::{Report, Reporter};
pub use run::Run;
pub use scenario::{Scenario, ScenarioProfile};
pub use threshold::ThresholdRule;
