use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A stage defines a target and how long to ramp to it.
///
/// Use `Stage::new(Duration::from_secs(30), 100.0)` to ramp to 100 over 30s.
/// The target is a rate (per `timeUnit`) for arrival-rate executors and a VU
/// count for `ramping-vus`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "crate::config::duration")]
    pub duration: Duration,
    pub target: f64,
}

impl Stage {
    pub fn new(duration: Duration, target: f64) -> Self {
        Self { duration, target }
    }
}

/// Arrivals closer than this to the end of a schedule are not emitted.
const EPSILON: f64 = 1e-9;

/// A piecewise-linear profile starting at `start`.
#[derive(Clone, Debug)]
pub(crate) struct Ramp {
    start: f64,
    stages: Vec<Stage>,
}

impl Ramp {
    pub(crate) fn new(start: f64, stages: Vec<Stage>) -> Self {
        Self { start, stages }
    }

    /// Every value scaled by `factor`.
    pub(crate) fn scaled(&self, factor: f64) -> Self {
        Self {
            start: self.start * factor,
            stages: self
                .stages
                .iter()
                .map(|s| Stage::new(s.duration, s.target * factor))
                .collect(),
        }
    }

    pub(crate) fn duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Highest value the profile ever reaches.
    pub(crate) fn peak(&self) -> f64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start, f64::max)
    }

    /// Segments as `(offset, duration, from, to)` in seconds.
    fn segments(&self) -> impl Iterator<Item = (f64, f64, f64, f64)> + '_ {
        self.stages
            .iter()
            .scan((0.0, self.start), |(offset, from), stage| {
                let segment = (*offset, stage.duration.as_secs_f64(), *from, stage.target);
                *offset += segment.1;
                *from = stage.target;
                Some(segment)
            })
    }

    /// Interpolated target at `t`, clamped to the first and last values.
    pub(crate) fn value_at(&self, t: Duration) -> f64 {
        let t = t.as_secs_f64();
        let mut last = self.start;
        for (offset, duration, from, to) in self.segments() {
            if t < offset + duration {
                let progress = ((t - offset) / duration).clamp(0.0, 1.0);
                return from + (to - from) * progress;
            }
            last = to;
        }
        last
    }

    /// Area under the profile between `0` and `t`.
    pub(crate) fn cumulative(&self, t: Duration) -> f64 {
        let t = t.as_secs_f64();
        let mut area = 0.0;
        for (offset, duration, from, to) in self.segments() {
            if duration == 0.0 {
                continue;
            }
            let e = (t - offset).clamp(0.0, duration);
            if e <= 0.0 {
                break;
            }
            let slope = (to - from) / duration;
            area += from * e + slope * e * e / 2.0;
        }
        area
    }

    /// Exact time at which the area under the profile reaches `k`, or `None`
    /// if that happens at or after the end of the last stage.
    pub(crate) fn time_of(&self, k: f64) -> Option<Duration> {
        let mut area = 0.0;
        for (offset, duration, from, to) in self.segments() {
            let segment = (from + to) / 2.0 * duration;
            if area + segment - k > EPSILON {
                let remaining = (k - area).max(0.0);
                let elapsed = if remaining == 0.0 {
                    0.0
                } else {
                    let slope = (to - from) / duration;
                    let root = (from * from + 2.0 * slope * remaining).max(0.0).sqrt();
                    2.0 * remaining / (from + root)
                };
                return Some(Duration::from_secs_f64(offset + elapsed.min(duration)));
            }
            area += segment;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn chat_ramp() -> Ramp {
        Ramp::new(
            10.0,
            vec![
                Stage::new(secs(30.0), 100.0),
                Stage::new(secs(60.0), 300.0),
                Stage::new(secs(90.0), 500.0),
            ],
        )
    }

    #[test]
    fn interpolation_is_linear_within_a_stage() {
        let ramp = Ramp::new(0.0, vec![Stage::new(secs(10.0), 100.0)]);
        for step in 0..=10 {
            let t = step as f64;
            assert!((ramp.value_at(secs(t)) - 10.0 * t).abs() < 1e-9);
        }
    }

    #[test]
    fn ramp_down() {
        let ramp = Ramp::new(100.0, vec![Stage::new(secs(10.0), 0.0)]);
        assert!((ramp.value_at(secs(2.5)) - 75.0).abs() < 1e-9);
        assert_eq!(ramp.value_at(secs(10.0)), 0.0);
    }

    #[test]
    fn clamps_outside_the_schedule() {
        let ramp = chat_ramp();
        assert_eq!(ramp.value_at(Duration::ZERO), 10.0);
        assert_eq!(ramp.value_at(secs(1_000.0)), 500.0);
        assert_eq!(ramp.duration(), secs(180.0));
        assert_eq!(ramp.peak(), 500.0);
    }

    #[test]
    fn continuous_across_stage_boundaries() {
        let ramp = chat_ramp();
        for boundary in [30.0, 90.0] {
            let before = ramp.value_at(secs(boundary - 1e-6));
            let after = ramp.value_at(secs(boundary));
            assert!((before - after).abs() < 1e-2, "jump at {boundary}s");
        }
    }

    #[test]
    fn zero_duration_stage_is_a_step() {
        let ramp = Ramp::new(
            10.0,
            vec![Stage::new(Duration::ZERO, 50.0), Stage::new(secs(10.0), 50.0)],
        );
        assert_eq!(ramp.value_at(Duration::ZERO), 50.0);
        assert_eq!(ramp.value_at(secs(5.0)), 50.0);
        assert!((ramp.cumulative(secs(10.0)) - 500.0).abs() < 1e-9);
    }

    #[test]
    fn hold_steady_emits_exactly_rate_times_duration() {
        let ramp = Ramp::new(10.0, vec![Stage::new(secs(2.0), 10.0)]);
        let starts: Vec<_> = (0..)
            .map(|k| ramp.time_of(k as f64))
            .take_while(Option::is_some)
            .flatten()
            .collect();

        assert_eq!(starts.len(), 20);
        assert_eq!(starts[0], Duration::ZERO);
        assert!((starts[19].as_secs_f64() - 1.9).abs() < 1e-9);
    }

    #[test]
    fn arrival_times_invert_the_cumulative_curve() {
        let ramp = chat_ramp();
        let total = ramp.cumulative(ramp.duration());
        // 10→100 over 30s, 100→300 over 60s, 300→500 over 90s
        assert!((total - (1_650.0 + 12_000.0 + 36_000.0)).abs() < 1e-6);

        for k in [1.0, 500.0, 1_650.0, 20_000.0, 49_000.0] {
            let t = ramp.time_of(k).unwrap();
            assert!((ramp.cumulative(t) - k).abs() < 1e-5, "k = {k}");
        }
        assert_eq!(ramp.time_of(total), None);
    }

    #[test]
    fn ramp_up_from_zero_starts_when_area_allows() {
        let ramp = Ramp::new(0.0, vec![Stage::new(secs(10.0), 10.0)]);
        assert_eq!(ramp.time_of(0.0), Some(Duration::ZERO));
        // N(t) = t²/2, so the second start happens at sqrt(2)
        let t = ramp.time_of(1.0).unwrap().as_secs_f64();
        assert!((t - 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn scaling_converts_time_units() {
        let per_minute = Ramp::new(60.0, vec![Stage::new(secs(60.0), 60.0)]);
        let per_second = per_minute.scaled(1.0 / 60.0);
        assert!((per_second.cumulative(secs(60.0)) - 60.0).abs() < 1e-9);
    }
}
