//! Thresholds: declared pass/fail conditions over aggregate metrics.
//!
//! Rules use the k6 syntax: a metric selector with an optional tag filter and
//! an expression comparing one statistic against a limit.
//!
//! ```text
//! http_req_duration{type:start}   p(95)<2500
//! http_req_failed{api:quiz}       rate<0.05
//! dropped_iterations              count==0
//! ```
//!
//! Durations are compared in milliseconds. A rule with no samples yet has no
//! verdict and is neither passed nor breached until data arrives.
use std::{collections::BTreeSet, fmt, str::FromStr, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    aggregate::{RunAggregate, Trend},
    context::{StopHandle, StopReason},
    error::{Error, Result},
    metric::Tags,
    metrics::LiveMetrics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Trend,
    Rate,
    Counter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    HttpReqDuration,
    HttpReqFailed,
    HttpReqs,
    Checks,
    Iterations,
    IterationDuration,
    DroppedIterations,
    WsSessions,
    WsConnectFailed,
}

impl MetricName {
    pub fn kind(self) -> MetricKind {
        match self {
            Self::HttpReqDuration | Self::IterationDuration => MetricKind::Trend,
            Self::HttpReqFailed | Self::Checks | Self::WsConnectFailed => MetricKind::Rate,
            Self::HttpReqs | Self::Iterations | Self::DroppedIterations | Self::WsSessions => {
                MetricKind::Counter
            }
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::HttpReqDuration => "http_req_duration",
            Self::HttpReqFailed => "http_req_failed",
            Self::HttpReqs => "http_reqs",
            Self::Checks => "checks",
            Self::Iterations => "iterations",
            Self::IterationDuration => "iteration_duration",
            Self::DroppedIterations => "dropped_iterations",
            Self::WsSessions => "ws_sessions",
            Self::WsConnectFailed => "ws_connect_failed",
        }
    }
}

impl FromStr for MetricName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "http_req_duration" => Self::HttpReqDuration,
            "http_req_failed" => Self::HttpReqFailed,
            "http_reqs" => Self::HttpReqs,
            "checks" => Self::Checks,
            "iterations" => Self::Iterations,
            "iteration_duration" => Self::IterationDuration,
            "dropped_iterations" => Self::DroppedIterations,
            "ws_sessions" => Self::WsSessions,
            "ws_connect_failed" => Self::WsConnectFailed,
            other => return Err(format!("unknown metric `{other}`")),
        })
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stat {
    Avg,
    Min,
    Med,
    Max,
    Percentile(f64),
    Rate,
    Count,
}

impl Stat {
    fn applies_to(self, kind: MetricKind) -> bool {
        match self {
            Self::Avg | Self::Min | Self::Med | Self::Max | Self::Percentile(_) => {
                kind == MetricKind::Trend
            }
            Self::Rate => kind == MetricKind::Rate,
            Self::Count => kind == MetricKind::Counter,
        }
    }

    fn of_trend(self, trend: &Trend) -> Option<f64> {
        match self {
            Self::Avg => trend.avg_ms(),
            Self::Min => trend.min_ms(),
            Self::Med => trend.percentile_ms(50.0),
            Self::Max => trend.max_ms(),
            Self::Percentile(p) => trend.percentile_ms(p),
            Self::Rate | Self::Count => None,
        }
    }
}

impl FromStr for Stat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" => Ok(Self::Avg),
            "min" => Ok(Self::Min),
            "med" => Ok(Self::Med),
            "max" => Ok(Self::Max),
            "rate" => Ok(Self::Rate),
            "count" => Ok(Self::Count),
            other => {
                let inner = other
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown statistic `{other}`"))?;
                let pct: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad percentile `{inner}`"))?;
                if !(0.0..=100.0).contains(&pct) {
                    return Err(format!("percentile {pct} is outside 0..=100"));
                }
                Ok(Self::Percentile(pct))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    // Two-character operators first so `<=` is not read as `<`.
    const TOKENS: [(&'static str, Comparator); 7] = [
        ("<=", Self::Le),
        (">=", Self::Ge),
        ("==", Self::Eq),
        ("!=", Self::Ne),
        ("<", Self::Lt),
        (">", Self::Gt),
        ("=", Self::Eq),
    ];

    pub fn holds(self, value: f64, limit: f64) -> bool {
        match self {
            Self::Lt => value < limit,
            Self::Le => value <= limit,
            Self::Gt => value > limit,
            Self::Ge => value >= limit,
            Self::Eq => value == limit,
            Self::Ne => value != limit,
        }
    }
}

/// Result of evaluating one rule against an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "kebab-case")]
pub enum Verdict {
    NoData,
    Pass(f64),
    Fail(f64),
}

impl Verdict {
    pub fn is_breach(self) -> bool {
        matches!(self, Self::Fail(_))
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdRule {
    pub metric: MetricName,
    pub filter: Tags,
    pub stat: Stat,
    pub comparator: Comparator,
    pub limit: f64,
    /// Stop new iteration starts as soon as this rule is breached.
    pub abort_on_fail: bool,
    /// Ignore breaches of an aborting rule until the run is at least this old.
    pub delay_abort_eval: Duration,
    selector: String,
    expr: String,
}

impl ThresholdRule {
    /// Parses a rule from a k6 selector and expression.
    pub fn parse(selector: &str, expr: &str) -> Result<Self> {
        let (metric, filter) = parse_selector(selector)?;

        let compact: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
        let (at, token, comparator) = Comparator::TOKENS
            .iter()
            .filter_map(|(token, cmp)| compact.find(token).map(|at| (at, *token, *cmp)))
            .min_by_key(|(at, token, _)| (*at, std::cmp::Reverse(token.len())))
            .ok_or_else(|| Error::threshold(expr, "missing comparison operator"))?;

        let stat: Stat = compact[..at]
            .parse()
            .map_err(|reason: String| Error::threshold(expr, reason))?;
        if !stat.applies_to(metric.kind()) {
            return Err(Error::threshold(
                expr,
                format!("statistic does not apply to `{metric}`"),
            ));
        }
        let limit: f64 = compact[at + token.len()..]
            .parse()
            .map_err(|_| Error::threshold(expr, "limit is not a number"))?;

        Ok(Self {
            metric,
            filter,
            stat,
            comparator,
            limit,
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
            selector: selector.trim().to_owned(),
            expr: compact,
        })
    }

    pub fn abort_on_fail(mut self) -> Self {
        self.abort_on_fail = true;
        self
    }

    pub fn delay_abort_eval(mut self, delay: Duration) -> Self {
        self.delay_abort_eval = delay;
        self
    }

    /// Current value of the selected statistic, `None` without samples.
    pub fn observe(&self, agg: &RunAggregate) -> Option<f64> {
        let filter = &self.filter;
        match self.metric {
            MetricName::HttpReqDuration => {
                self.stat.of_trend(&agg.requests_matching(filter).duration)
            }
            MetricName::IterationDuration => {
                self.stat.of_trend(&agg.iterations_matching(filter).duration)
            }
            MetricName::HttpReqFailed => agg.requests_matching(filter).failed.rate(),
            MetricName::Checks => agg.checks_matching(filter).rate(),
            MetricName::WsConnectFailed => agg.sessions_matching(filter).connect_failed.rate(),
            MetricName::HttpReqs => Some(agg.requests_matching(filter).duration.count() as f64),
            MetricName::Iterations => Some(agg.iterations_matching(filter).count() as f64),
            MetricName::DroppedIterations => Some(agg.dropped_matching(filter) as f64),
            MetricName::WsSessions => {
                Some(agg.sessions_matching(filter).connect_failed.total as f64)
            }
        }
    }

    pub fn evaluate(&self, agg: &RunAggregate) -> Verdict {
        match self.observe(agg) {
            None => Verdict::NoData,
            Some(v) if self.comparator.holds(v, self.limit) => Verdict::Pass(v),
            Some(v) => Verdict::Fail(v),
        }
    }
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.selector, self.expr)
    }
}

fn parse_selector(selector: &str) -> Result<(MetricName, Tags)> {
    let selector = selector.trim();
    let (name, filter) = match selector.split_once('{') {
        None => (selector, Tags::new()),
        Some((name, rest)) => {
            let body = rest
                .strip_suffix('}')
                .ok_or_else(|| Error::threshold(selector, "unterminated tag filter"))?;
            let filter = body
                .split(',')
                .filter(|pair| !pair.trim().is_empty())
                .map(|pair| {
                    pair.split_once(':')
                        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
                        .ok_or_else(|| Error::threshold(selector, "tag filter entry needs `key:value`"))
                })
                .collect::<Result<Tags>>()?;
            (name.trim(), filter)
        }
    };
    let metric = name
        .parse()
        .map_err(|reason: String| Error::threshold(selector, reason))?;
    Ok((metric, filter))
}

/// Background evaluation of thresholds while the run is live.
pub(crate) struct ThresholdWatch {
    handle: JoinHandle<BTreeSet<usize>>,
    done: oneshot::Sender<()>,
}

impl ThresholdWatch {
    pub(crate) fn spawn(
        rules: Arc<[ThresholdRule]>,
        live: LiveMetrics,
        stop: StopHandle,
        cadence: Duration,
    ) -> Self {
        let (done, mut done_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut breached = BTreeSet::new();
            let mut ticker = tokio::time::interval_at(started + cadence, cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut done_rx => break,
                }
                let agg = live.read().await;
                for (i, rule) in rules.iter().enumerate() {
                    let Verdict::Fail(value) = rule.evaluate(&agg) else {
                        continue;
                    };
                    if breached.insert(i) {
                        tracing::warn!("Threshold `{rule}` crossed (observed {value:.4})");
                    }
                    if rule.abort_on_fail && started.elapsed() >= rule.delay_abort_eval {
                        stop.stop(StopReason::ThresholdAbort {
                            threshold: rule.to_string(),
                        });
                    }
                }
            }
            breached
        });
        Self { handle, done }
    }

    /// Stops the watch and returns the indices of rules breached at any tick.
    pub(crate) async fn finish(self) -> Result<BTreeSet<usize>> {
        let _ = self.done.send(());
        Ok(self.handle.await?)
    }
}
