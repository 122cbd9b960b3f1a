use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// Key/value labels attached to a sample.
pub type Tags = BTreeMap<String, String>;

/// Built-in metric: one per completed iteration.
pub const ITERATIONS: &str = "iterations";
/// Built-in metric: wall-clock time of an iteration in milliseconds, think-time included.
pub const ITERATION_DURATION: &str = "iteration_duration";
/// Built-in metric: `true` when the workload returned an error or panicked.
pub const ITERATION_ERRORS: &str = "iteration_errors";
/// Built-in metric: outcome of every [`crate::VuContext::check`].
pub const CHECKS: &str = "checks";

/// Tag carrying the ordinal of the virtual user that produced a sample.
pub const VU_TAG: &str = "vu";
/// Tag carrying the name of a check.
pub const CHECK_TAG: &str = "check";

/// How the observations of a metric are accumulated.
///
/// A metric name is bound to exactly one kind for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Running sum of the observed values.
    Counter,
    /// Fraction of non-zero observations.
    Rate,
    /// Every observed value, for min/max/avg/percentiles.
    Trend,
}

impl MetricKind {
    /// Built-in metrics every run registers up front.
    pub fn builtins() -> [(&'static str, MetricKind); 4] {
        [
            (ITERATIONS, MetricKind::Counter),
            (ITERATION_DURATION, MetricKind::Trend),
            (ITERATION_ERRORS, MetricKind::Rate),
            (CHECKS, MetricKind::Rate),
        ]
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        };
        f.write_str(s)
    }
}

/// A single observation produced by one iteration of a virtual user.
///
/// Samples are the smallest unit the engine handles. Rates encode `true` as
/// `1.0` and `false` as `0.0`; any non-zero value counts as `true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: Tags,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, kind: MetricKind, value: f64, tags: Tags) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            tags,
        }
    }

    pub fn counter(name: impl Into<String>, value: f64, tags: Tags) -> Self {
        Self::new(name, MetricKind::Counter, value, tags)
    }

    pub fn rate(name: impl Into<String>, value: bool, tags: Tags) -> Self {
        Self::new(name, MetricKind::Rate, if value { 1.0 } else { 0.0 }, tags)
    }

    pub fn trend(name: impl Into<String>, value: f64, tags: Tags) -> Self {
        Self::new(name, MetricKind::Trend, value, tags)
    }

    /// `true` if the sample carries every tag of `selector` with the same value.
    pub fn matches(&self, selector: &Tags) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.tags.get(k).is_some_and(|own| own == v))
    }
}
