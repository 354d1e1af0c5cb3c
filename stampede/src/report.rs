use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display},
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize, Serializer, de::DeserializeOwned};

use crate::{
    Aggregate,
    aggregate::{IterationStats, RateCounter, RunAggregate, Series, SessionStats, Trend},
    context::StopReason,
    error::Result,
    executor::ExecutionSummary,
    metric::Tags,
    threshold::{MetricName, Verdict},
};

/// Exit status of a run that failed its thresholds, as k6 reports it.
pub const THRESHOLDS_FAILED_EXIT_CODE: i32 = 99;

/// A `Report` is the final, human- or machine-facing view of an [`Aggregate`].
///
/// Reports derive everything they show from the aggregate they are built
/// from, so they can be serialized, stored and read back without the engine.
pub trait Report<A>
where
    Self: Send + Sync + Debug + From<A> + Serialize + DeserializeOwned,
    A: Aggregate,
{
}

/// Sends finished reports somewhere: stdout, a file, a database.
pub trait Reporter<R> {
    fn report(&self, report: &R) -> impl Future<Output = Result<()>> + Send;
}

/// Milliseconds statistics of a [`Trend`]. Empty trends report zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

impl From<&Trend> for TrendSummary {
    fn from(trend: &Trend) -> Self {
        let pct = |p| trend.percentile_ms(p).unwrap_or_default();
        Self {
            count: trend.count(),
            avg: trend.avg_ms().unwrap_or_default(),
            min: trend.min_ms().unwrap_or_default(),
            med: pct(50.0),
            p90: pct(90.0),
            p95: pct(95.0),
            p99: pct(99.0),
            max: trend.max_ms().unwrap_or_default(),
        }
    }
}

impl Display for TrendSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "avg={} min={} med={} max={} p(90)={} p(95)={}",
            ms(self.avg),
            ms(self.min),
            ms(self.med),
            ms(self.max),
            ms(self.p90),
            ms(self.p95)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateSummary {
    pub passes: u64,
    pub fails: u64,
    /// Share of passes, `None` without samples.
    pub rate: Option<f64>,
}

impl From<&RateCounter> for RateSummary {
    fn from(counter: &RateCounter) -> Self {
        Self {
            passes: counter.hits,
            fails: counter.total - counter.hits,
            rate: counter.rate(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestSeries {
    pub tags: Tags,
    pub requests: u64,
    pub failed: RateSummary,
    pub duration: TrendSummary,
    pub bytes: u64,
}

impl RequestSeries {
    fn new(tags: Tags, series: &Series) -> Self {
        Self {
            tags,
            requests: series.duration.count(),
            failed: (&series.failed).into(),
            duration: (&series.duration).into(),
            bytes: series.bytes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationSeries {
    pub tags: Tags,
    pub iterations: u64,
    pub succeeded: u64,
    pub check_failed: u64,
    pub hard_failed: u64,
    pub duration: TrendSummary,
}

impl IterationSeries {
    fn new(tags: Tags, stats: &IterationStats) -> Self {
        Self {
            tags,
            iterations: stats.count(),
            succeeded: stats.succeeded,
            check_failed: stats.check_failed,
            hard_failed: stats.hard_failed,
            duration: (&stats.duration).into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSeries {
    pub tags: Tags,
    pub sessions: u64,
    pub connect_failed: u64,
    pub acknowledged: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub duration: TrendSummary,
}

impl SessionSeries {
    fn new(tags: Tags, stats: &SessionStats) -> Self {
        Self {
            tags,
            sessions: stats.connect_failed.total,
            connect_failed: stats.connect_failed.hits,
            acknowledged: stats.acknowledged,
            frames_sent: stats.frames_sent,
            frames_received: stats.frames_received,
            duration: (&stats.duration).into(),
        }
    }
}

/// Everything the aggregator saw, in total and per tag set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub http: RequestSeries,
    pub checks: RateSummary,
    pub iterations: IterationSeries,
    pub sessions: SessionSeries,
    pub dropped_iterations: u64,
    pub http_by_tags: Vec<RequestSeries>,
    pub checks_by_name: Vec<(String, RateSummary)>,
    pub iterations_by_tags: Vec<IterationSeries>,
    pub sessions_by_tags: Vec<SessionSeries>,
    pub dropped_by_tags: Vec<(Tags, u64)>,
}

impl From<RunAggregate> for MetricsReport {
    fn from(agg: RunAggregate) -> Self {
        let all = Tags::new();
        let mut checks_by_name = BTreeMap::<String, RateCounter>::new();
        for (tags, counter) in &agg.checks {
            checks_by_name
                .entry(tags.get("check").unwrap_or_default().to_owned())
                .or_default()
                .merge(counter);
        }
        Self {
            http: RequestSeries::new(all.clone(), &agg.requests_matching(&all)),
            checks: (&agg.checks_matching(&all)).into(),
            iterations: IterationSeries::new(all.clone(), &agg.iterations_matching(&all)),
            sessions: SessionSeries::new(all.clone(), &agg.sessions_matching(&all)),
            dropped_iterations: agg.dropped_matching(&all),
            http_by_tags: agg
                .requests
                .iter()
                .map(|(tags, series)| RequestSeries::new(tags.clone(), series))
                .collect(),
            checks_by_name: checks_by_name
                .iter()
                .map(|(name, counter)| (name.clone(), counter.into()))
                .collect(),
            iterations_by_tags: agg
                .iterations
                .iter()
                .map(|(tags, stats)| IterationSeries::new(tags.clone(), stats))
                .collect(),
            sessions_by_tags: agg
                .sessions
                .iter()
                .map(|(tags, stats)| SessionSeries::new(tags.clone(), stats))
                .collect(),
            dropped_by_tags: agg.dropped.into_iter().collect(),
        }
    }
}

impl Report<RunAggregate> for MetricsReport {}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdReport {
    pub rule: String,
    pub metric: MetricName,
    pub verdict: Verdict,
    pub abort_on_fail: bool,
    /// Crossed at least once while the run was live.
    pub breached_during_run: bool,
    /// Failed at the end, or was an aborting rule crossed during the run.
    pub failed: bool,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    #[serde(serialize_with = "seconds")]
    pub duration: Duration,
    pub scenarios: Vec<ExecutionSummary>,
    pub metrics: MetricsReport,
    pub thresholds: Vec<ThresholdReport>,
    pub stopped_by: Option<StopReason>,
    /// Iterations were dropped under a policy that fails the run.
    pub shortfall_failed: bool,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        !self.shortfall_failed && self.thresholds.iter().all(|t| !t.failed)
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdReport> {
        self.thresholds.iter().filter(|t| t.failed)
    }

    /// `0` when the run passed, [`THRESHOLDS_FAILED_EXIT_CODE`] otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            THRESHOLDS_FAILED_EXIT_CODE
        }
    }
}

fn seconds<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

fn ms(value: f64) -> String {
    if value >= 1_000.0 {
        format!("{:.2}s", value / 1_000.0)
    } else {
        format!("{value:.2}ms")
    }
}

fn pct(rate: Option<f64>) -> String {
    rate.map_or_else(|| "-".to_owned(), |r| format!("{:.2}%", r * 100.0))
}

fn line(f: &mut fmt::Formatter<'_>, name: &str, value: impl Display) -> fmt::Result {
    writeln!(f, "     {name:.<40}: {value}")
}

/// The end-of-test summary, laid out like k6's.
impl Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        for s in &self.scenarios {
            writeln!(
                f,
                "     scenario {} ({}): {} iterations, {} dropped, {} VUs peak, {:.1}s",
                s.scenario,
                s.executor,
                s.started,
                s.dropped,
                s.peak_vus,
                s.elapsed.as_secs_f64()
            )?;
        }
        writeln!(f)?;

        for t in &self.thresholds {
            let mark = if t.failed { '✗' } else { '✓' };
            let observed = match t.verdict {
                Verdict::NoData => "no data".to_owned(),
                Verdict::Pass(v) | Verdict::Fail(v) => format!("{v:.4}"),
            };
            writeln!(f, "     {mark} {} (observed {observed})", t.rule)?;
        }
        if !self.thresholds.is_empty() {
            writeln!(f)?;
        }

        let m = &self.metrics;
        if m.checks.passes + m.checks.fails > 0 {
            line(
                f,
                "checks",
                format_args!(
                    "{} ✓ {} ✗ {}",
                    pct(m.checks.rate),
                    m.checks.passes,
                    m.checks.fails
                ),
            )?;
        }
        if m.http.requests > 0 {
            line(f, "http_req_duration", m.http.duration)?;
            line(
                f,
                "http_req_failed",
                format_args!(
                    "{} ✓ {} ✗ {}",
                    pct(m.http.failed.rate),
                    m.http.failed.passes,
                    m.http.failed.fails
                ),
            )?;
            line(f, "http_reqs", m.http.requests)?;
        }
        line(f, "iteration_duration", m.iterations.duration)?;
        line(
            f,
            "iterations",
            format_args!(
                "{} ({} check-failed, {} hard-failed)",
                m.iterations.iterations, m.iterations.check_failed, m.iterations.hard_failed
            ),
        )?;
        if m.dropped_iterations > 0 {
            line(f, "dropped_iterations", m.dropped_iterations)?;
        }
        if m.sessions.sessions > 0 {
            line(
                f,
                "ws_sessions",
                format_args!(
                    "{} ({} connect-failed, {} acknowledged)",
                    m.sessions.sessions, m.sessions.connect_failed, m.sessions.acknowledged
                ),
            )?;
            line(f, "ws_session_duration", m.sessions.duration)?;
        }

        writeln!(f)?;
        if let Some(reason) = &self.stopped_by {
            writeln!(f, "     stopped early: {reason}")?;
        }
        if self.shortfall_failed {
            writeln!(f, "     failed: iterations were dropped for lack of VUs")?;
        }
        let verdict = if self.passed() { "PASSED" } else { "FAILED" };
        writeln!(f, "     run {verdict} in {:.1}s", self.duration.as_secs_f64())
    }
}

/// Prints the human-readable summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutReporter;

impl<R: Display + Sync> Reporter<R> for StdoutReporter {
    async fn report(&self, report: &R) -> Result<()> {
        println!("{report}");
        Ok(())
    }
}

/// Writes the report as pretty JSON to `path`, or stdout without one.
#[derive(Debug, Clone, Default)]
pub struct JsonReporter {
    pub path: Option<PathBuf>,
}

impl JsonReporter {
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

impl<R: Serialize + Sync> Reporter<R> for JsonReporter {
    async fn report(&self, report: &R) -> Result<()> {
        let json = serde_json::to_string_pretty(report)?;
        match &self.path {
            Some(path) => {
                tokio::fs::write(path, json).await?;
                tracing::info!("Report written to {}", path.display());
            }
            None => println!("{json}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::{
        metric::{CheckRecord, RequestRecord, Sample},
        threshold::ThresholdRule,
    };

    fn aggregate() -> RunAggregate {
        let mut agg = RunAggregate::new();
        for (kind, status, millis) in [("start", 200, 10), ("start", 500, 30), ("submit", 201, 20)] {
            agg.consume(&Sample::Request(RequestRecord {
                tags: Tags::new().with("type", kind),
                status,
                failed: status >= 400,
                latency: Duration::from_millis(millis),
                timestamp: SystemTime::now(),
                bytes: 100,
            }));
        }
        for passed in [true, true, false] {
            agg.consume(&Sample::Check(CheckRecord {
                tags: Tags::new().with("check", "status is 200"),
                passed,
            }));
        }
        agg
    }

    fn report(thresholds: Vec<ThresholdReport>) -> RunReport {
        RunReport {
            duration: Duration::from_secs(2),
            scenarios: Vec::new(),
            metrics: aggregate().into(),
            thresholds,
            stopped_by: None,
            shortfall_failed: false,
        }
    }

    fn threshold(failed: bool) -> ThresholdReport {
        let rule = ThresholdRule::parse("http_req_failed", "rate<0.01").unwrap();
        ThresholdReport {
            rule: rule.to_string(),
            metric: rule.metric,
            verdict: Verdict::Fail(0.33),
            abort_on_fail: false,
            breached_during_run: failed,
            failed,
        }
    }

    #[test]
    fn metrics_report_totals_and_series() {
        let metrics = MetricsReport::from(aggregate());
        assert_eq!(metrics.http.requests, 3);
        assert_eq!(metrics.http.failed.passes, 1);
        assert_eq!(metrics.http.bytes, 300);
        assert_eq!(metrics.http_by_tags.len(), 2);
        assert_eq!(metrics.checks.passes, 2);
        assert_eq!(metrics.checks.fails, 1);
        assert_eq!(metrics.checks_by_name.len(), 1);
        assert_eq!(metrics.checks_by_name[0].0, "status is 200");
        assert!(metrics.http.duration.max >= 29.0);

        let json = serde_json::to_string(&metrics).unwrap();
        let back: MetricsReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metrics);
    }

    #[test]
    fn failed_thresholds_fail_the_run() {
        let passing = report(vec![threshold(false)]);
        assert!(passing.passed());
        assert_eq!(passing.exit_code(), 0);

        let failing = report(vec![threshold(false), threshold(true)]);
        assert!(!failing.passed());
        assert_eq!(failing.exit_code(), THRESHOLDS_FAILED_EXIT_CODE);
        assert_eq!(failing.failed_thresholds().count(), 1);

        let short = RunReport {
            shortfall_failed: true,
            ..report(Vec::new())
        };
        assert_eq!(short.exit_code(), THRESHOLDS_FAILED_EXIT_CODE);
    }

    #[test]
    fn summary_lists_thresholds_and_metrics() {
        let text = report(vec![threshold(true)]).to_string();
        assert!(text.contains("✗ http_req_failed rate<0.01"), "{text}");
        assert!(text.contains("http_reqs"), "{text}");
        assert!(text.contains("66.67% ✓ 2 ✗ 1"), "{text}");
        assert!(text.contains("run FAILED"), "{text}");
    }

    #[tokio::test]
    async fn json_reporter_writes_files() {
        let path = std::env::temp_dir().join(format!("stampede-report-{}.json", std::process::id()));
        let report = report(vec![threshold(false)]);
        JsonReporter::to_file(&path).report(&report).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(written["metrics"]["http"]["requests"], 3);
        assert_eq!(written["thresholds"][0]["failed"], false);
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
