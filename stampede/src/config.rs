//! Configuration helpers: durations, credentials and k6-style JSON options.
use std::{
    collections::BTreeMap,
    fmt,
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    iteration::Action,
    metric::Tags,
    scenario::{Scenario, ScenarioProfile},
    threshold::ThresholdRule,
};

/// Parses `"1m30s"`, `"250ms"` or a bare integer number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(trimmed).map_err(|e| Error::InvalidDuration {
        input: input.to_owned(),
        reason: e.to_string(),
    })
}

/// Serde adapter for [`Duration`] fields written as `"30s"` or as seconds.
pub mod duration {
    use std::time::Duration;

    use serde::{Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(Visitor)
    }

    pub(super) struct Visitor;

    impl de::Visitor<'_> for Visitor {
        type Value = Duration;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a duration such as \"30s\" or a number of seconds")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            Duration::try_from_secs_f64(v).map_err(E::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(E::custom)
        }
    }
}

/// Like [`duration`], for optional fields.
pub mod duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => super::duration::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super::duration")] Duration);

        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(d)| d))
    }
}

/// Bearer tokens spread across iterations.
///
/// Loaded from a newline-delimited file first, then a comma-separated list.
/// With neither, a single empty token stands in, which request builders skip,
/// so scenarios also run against unauthenticated endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    tokens: Vec<String>,
}

impl Credentials {
    pub fn load(tokens_file: Option<&Path>, tokens: Option<&str>) -> Self {
        if let Some(path) = tokens_file {
            match read_lines(path) {
                Ok(lines) if !lines.is_empty() => return Self { tokens: lines },
                Ok(_) => tracing::warn!("Token file {} is empty", path.display()),
                Err(e) => tracing::warn!("Could not read token file {}: {e}", path.display()),
            }
        }
        let listed: Vec<String> = tokens
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect();
        if listed.is_empty() {
            return Self::anonymous();
        }
        Self { tokens: listed }
    }

    pub fn anonymous() -> Self {
        Self {
            tokens: vec![String::new()],
        }
    }

    pub fn first(&self) -> &str {
        self.tokens.first().map(String::as_str).unwrap_or_default()
    }

    pub fn pick(&self, rng: &mut impl rand::Rng) -> &str {
        use rand::seq::IndexedRandom;
        self.tokens
            .choose(rng)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.iter().all(String::is_empty)
    }
}

/// Trimmed, non-empty lines of a text file.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}

/// One entry of a `thresholds` list: a bare expression or the long form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Expr(String),
    #[serde(rename_all = "camelCase")]
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
        #[serde(default, with = "duration_opt")]
        delay_abort_eval: Option<Duration>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioOptions {
    #[serde(flatten)]
    pub profile: ScenarioProfile,
    /// Name of the scenario function; `default` when absent.
    #[serde(default)]
    pub exec: Option<String>,
    #[serde(default, with = "duration_opt")]
    pub start_time: Option<Duration>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// The `scenarios` and `thresholds` blocks of a k6 `options` object.
///
/// ```json
/// {
///   "scenarios": {
///     "steady": { "executor": "constant-arrival-rate", "rate": 400, "timeUnit": "1s",
///                 "duration": "30s", "preAllocatedVUs": 80, "maxVUs": 400 }
///   },
///   "thresholds": { "http_req_failed{api:quiz}": ["rate<0.05"] }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioOptions>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<ThresholdSpec>>,
}

impl RunOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn threshold_rules(&self) -> Result<Vec<ThresholdRule>> {
        let mut rules = Vec::new();
        for (selector, specs) in &self.thresholds {
            for spec in specs {
                let rule = match spec {
                    ThresholdSpec::Expr(expr) => ThresholdRule::parse(selector, expr)?,
                    ThresholdSpec::Detailed {
                        threshold,
                        abort_on_fail,
                        delay_abort_eval,
                    } => {
                        let mut rule = ThresholdRule::parse(selector, threshold)?;
                        if *abort_on_fail {
                            rule = rule.abort_on_fail();
                        }
                        rule.delay_abort_eval(delay_abort_eval.unwrap_or_default())
                    }
                };
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    /// Builds scenarios, looking each `exec` name up with `resolve`.
    pub fn scenarios<D>(
        &self,
        resolve: impl Fn(&str) -> Option<Action<D>>,
    ) -> Result<Vec<Scenario<D>>> {
        self.scenarios
            .iter()
            .map(|(name, opts)| {
                let exec = opts.exec.as_deref().unwrap_or("default");
                let action = resolve(exec)
                    .ok_or_else(|| Error::profile(name, format!("no scenario function `{exec}`")))?;
                let tags: Tags = opts.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                Ok(Scenario::from_action(name, opts.profile.clone(), action)
                    .tags(tags)
                    .start_time(opts.start_time.unwrap_or_default()))
            })
            .collect()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tokens.as_slice() {
            [only] if only.is_empty() => f.write_str("no tokens"),
            tokens => write!(f, "{} tokens", tokens.len()),
        }
    }
}
