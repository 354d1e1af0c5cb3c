use std::{collections::BTreeMap, fmt::Debug, time::Duration};

use hdrhistogram::Histogram;

use crate::{
    Metric,
    metric::{IterationOutcome, RequestRecord, Sample, Tags},
};

/// The `Aggregate` trait defines how raw [`Metric`] values are collected and
/// combined into an intermediate, mergeable representation.
///
/// Aggregates store compact raw data (counts, sums, histograms) and leave the
/// final derivations (averages, percentiles, ratios) to the threshold and
/// report stages, so different consumers can read the same state.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: thresholds merge every
///   series matching a tag filter, in arbitrary order.
/// - `consume` runs on the aggregator task for every sample and should stay cheap.
pub trait Aggregate
where
    Self: Send + Sync + Debug + Clone,
{
    /// The metric type this aggregate summarizes.
    type Metric: Metric;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple metrics into the current instance.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single metric into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);

    /// Combine two aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Highest latency the histograms track: one hour, in microseconds.
const MAX_TRACKABLE_MICROS: u64 = 3_600_000_000;
const SIGNIFICANT_FIGURES: u8 = 3;

/// A streaming latency distribution.
///
/// Values are recorded in microseconds with three significant figures, which
/// keeps percentile error below 0.1% at a fixed memory cost.
#[derive(Debug, Clone)]
pub struct Trend {
    histogram: Histogram<u64>,
    sum_micros: u128,
}

impl Default for Trend {
    fn default() -> Self {
        Self {
            histogram: Histogram::new_with_bounds(1, MAX_TRACKABLE_MICROS, SIGNIFICANT_FIGURES)
                .expect("static histogram bounds are valid"),
            sum_micros: 0,
        }
    }
}

impl Trend {
    pub fn record(&mut self, value: Duration) {
        let micros = u64::try_from(value.as_micros()).unwrap_or(u64::MAX);
        self.histogram.saturating_record(micros.max(1));
        self.sum_micros += u128::from(micros);
    }

    pub fn merge(&mut self, other: &Trend) {
        if let Err(e) = self.histogram.add(&other.histogram) {
            tracing::warn!("Dropping latency samples while merging trends: {e}");
            return;
        }
        self.sum_micros += other.sum_micros;
    }

    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    /// Percentile in milliseconds, `pct` in `0.0..=100.0`.
    pub fn percentile_ms(&self, pct: f64) -> Option<f64> {
        (!self.histogram.is_empty())
            .then(|| micros_to_ms(self.histogram.value_at_percentile(pct)))
    }

    pub fn avg_ms(&self) -> Option<f64> {
        let n = self.count();
        (n > 0).then(|| self.sum_micros as f64 / n as f64 / 1_000.0)
    }

    pub fn min_ms(&self) -> Option<f64> {
        (!self.histogram.is_empty()).then(|| micros_to_ms(self.histogram.min()))
    }

    pub fn max_ms(&self) -> Option<f64> {
        (!self.histogram.is_empty()).then(|| micros_to_ms(self.histogram.max()))
    }
}

fn micros_to_ms(micros: u64) -> f64 {
    micros as f64 / 1_000.0
}

/// Pass/fail tally behind every rate metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateCounter {
    pub hits: u64,
    pub total: u64,
}

impl RateCounter {
    pub fn add(&mut self, hit: bool) {
        self.total += 1;
        self.hits += u64::from(hit);
    }

    pub fn merge(&mut self, other: &RateCounter) {
        self.hits += other.hits;
        self.total += other.total;
    }

    pub fn rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.hits as f64 / self.total as f64)
    }
}

/// Request statistics for one tag set.
#[derive(Debug, Clone, Default)]
pub struct Series {
    pub duration: Trend,
    /// `hits` counts failed requests.
    pub failed: RateCounter,
    pub bytes: u64,
}

impl Aggregate for Series {
    type Metric = RequestRecord;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, metric: &Self::Metric) {
        self.duration.record(metric.latency);
        self.failed.add(metric.failed);
        self.bytes += metric.bytes as u64;
    }

    fn merge(&mut self, other: Self) {
        self.merge_from(&other);
    }
}

impl Series {
    /// [`Aggregate::merge`] without giving up `other`.
    pub fn merge_from(&mut self, other: &Series) {
        self.duration.merge(&other.duration);
        self.failed.merge(&other.failed);
        self.bytes += other.bytes;
    }
}

#[derive(Debug, Clone, Default)]
pub struct IterationStats {
    pub duration: Trend,
    pub succeeded: u64,
    pub check_failed: u64,
    pub hard_failed: u64,
}

impl IterationStats {
    pub fn count(&self) -> u64 {
        self.succeeded + self.check_failed + self.hard_failed
    }

    fn merge(&mut self, other: &IterationStats) {
        self.duration.merge(&other.duration);
        self.succeeded += other.succeeded;
        self.check_failed += other.check_failed;
        self.hard_failed += other.hard_failed;
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub duration: Trend,
    /// `hits` counts sessions that never connected.
    pub connect_failed: RateCounter,
    pub acknowledged: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
}

impl SessionStats {
    fn merge(&mut self, other: &SessionStats) {
        self.duration.merge(&other.duration);
        self.connect_failed.merge(&other.connect_failed);
        self.acknowledged += other.acknowledged;
        self.frames_sent += other.frames_sent;
        self.frames_received += other.frames_received;
    }
}

/// Live state of a whole run, partitioned by tag set.
///
/// Owned by the aggregator task; thresholds and reports read it under a lock.
#[derive(Debug, Clone, Default)]
pub struct RunAggregate {
    pub requests: BTreeMap<Tags, Series>,
    pub checks: BTreeMap<Tags, RateCounter>,
    pub iterations: BTreeMap<Tags, IterationStats>,
    pub sessions: BTreeMap<Tags, SessionStats>,
    pub dropped: BTreeMap<Tags, u64>,
}

impl RunAggregate {
    /// All request series matching `filter`, merged into one.
    pub fn requests_matching(&self, filter: &Tags) -> Series {
        let mut out = Series::new();
        matching(&self.requests, filter).for_each(|(_, s)| out.merge_from(s));
        out
    }

    pub fn checks_matching(&self, filter: &Tags) -> RateCounter {
        let mut out = RateCounter::default();
        matching(&self.checks, filter).for_each(|(_, c)| out.merge(c));
        out
    }

    pub fn iterations_matching(&self, filter: &Tags) -> IterationStats {
        let mut out = IterationStats::default();
        matching(&self.iterations, filter).for_each(|(_, s)| out.merge(s));
        out
    }

    pub fn sessions_matching(&self, filter: &Tags) -> SessionStats {
        let mut out = SessionStats::default();
        matching(&self.sessions, filter).for_each(|(_, s)| out.merge(s));
        out
    }

    pub fn dropped_matching(&self, filter: &Tags) -> u64 {
        matching(&self.dropped, filter).map(|(_, n)| *n).sum()
    }
}

fn matching<'a, V>(
    map: &'a BTreeMap<Tags, V>,
    filter: &'a Tags,
) -> impl Iterator<Item = (&'a Tags, &'a V)> {
    map.iter().filter(move |(tags, _)| tags.contains(filter))
}

impl Aggregate for RunAggregate {
    type Metric = Sample;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, metric: &Self::Metric) {
        match metric {
            Sample::Request(record) => self
                .requests
                .entry(record.tags.clone())
                .or_default()
                .consume(record),
            Sample::Check(record) => self
                .checks
                .entry(record.tags.clone())
                .or_default()
                .add(record.passed),
            Sample::Iteration(record) => {
                let stats = self.iterations.entry(record.tags.clone()).or_default();
                stats.duration.record(record.duration);
                match record.outcome {
                    IterationOutcome::Success => stats.succeeded += 1,
                    IterationOutcome::CheckFailure { .. } => stats.check_failed += 1,
                    IterationOutcome::HardFailure { .. } => stats.hard_failed += 1,
                }
            }
            Sample::Session(record) => {
                let stats = self.sessions.entry(record.tags.clone()).or_default();
                stats.duration.record(record.duration);
                stats.connect_failed.add(!record.connected);
                stats.acknowledged += u64::from(record.acknowledged);
                stats.frames_sent += record.frames_sent;
                stats.frames_received += record.frames_received;
            }
            Sample::Dropped { tags } => *self.dropped.entry(tags.clone()).or_default() += 1,
        }
    }

    fn merge(&mut self, other: Self) {
        for (tags, series) in other.requests {
            self.requests.entry(tags).or_default().merge(series);
        }
        for (tags, counter) in other.checks {
            self.checks.entry(tags).or_default().merge(&counter);
        }
        for (tags, stats) in other.iterations {
            self.iterations.entry(tags).or_default().merge(&stats);
        }
        for (tags, stats) in other.sessions {
            self.sessions.entry(tags).or_default().merge(&stats);
        }
        for (tags, n) in other.dropped {
            *self.dropped.entry(tags).or_default() += n;
        }
    }
}
