use std::{
    collections::BTreeMap,
    fmt::{self, Debug},
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};

/// A `Metric` is a single observation produced while a scenario runs.
///
/// Metrics are the most granular level of data the engine handles. Workers
/// emit them as iterations progress, and an [`crate::Aggregate`] folds them
/// into mergeable state that thresholds and reports read from.
///
/// Metrics are immutable once recorded: they are moved into the aggregator and
/// never touched again.
pub trait Metric
where
    Self: Send + Sync + Debug + Clone,
{
}

/// An ordered set of `key:value` labels attached to every record.
///
/// Tags partition aggregates into series. A threshold such as
/// `http_req_duration{type:start}` selects every series whose tags contain
/// `type=start`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Entries of `other` override entries of `self`.
    pub fn merged(&self, other: &Tags) -> Tags {
        let mut out = self.clone();
        out.0
            .extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }

    /// Whether every entry of `filter` is present in `self` with the same value.
    pub fn contains(&self, filter: &Tags) -> bool {
        filter
            .0
            .iter()
            .all(|(k, v)| self.0.get(k).is_some_and(|own| own == v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}:{v}")?;
        }
        f.write_str("}")
    }
}

/// One completed request/response exchange.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub tags: Tags,
    /// HTTP status, or `0` when no response arrived.
    pub status: u16,
    /// Whether the status fell outside the expected set.
    pub failed: bool,
    pub latency: Duration,
    pub timestamp: SystemTime,
    pub bytes: usize,
}

/// The result of one `check` evaluated inside an iteration.
#[derive(Debug, Clone, Serialize)]
pub struct CheckRecord {
    /// Includes `check:<name>` alongside the iteration tags.
    pub tags: Tags,
    pub passed: bool,
}

/// Terminal state of an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum IterationOutcome {
    Success,
    /// At least one check did not hold; the iteration still ran to completion.
    CheckFailure { failed_checks: u32 },
    /// The scenario returned an error or panicked.
    HardFailure { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub tags: Tags,
    pub vu: u64,
    pub outcome: IterationOutcome,
    pub duration: Duration,
}

/// Summary of a duplex session once it reached `Closed`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub tags: Tags,
    pub connected: bool,
    pub acknowledged: bool,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub duration: Duration,
}

/// Everything a worker can report to the aggregator.
#[derive(Debug, Clone)]
pub enum Sample {
    Request(RequestRecord),
    Check(CheckRecord),
    Iteration(IterationRecord),
    Session(SessionRecord),
    /// An iteration start the pool could not serve.
    Dropped { tags: Tags },
}

impl Metric for RequestRecord {}
impl Metric for Sample {}
