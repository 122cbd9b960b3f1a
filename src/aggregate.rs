use serde::{Deserialize, Serialize};

use crate::metric::MetricKind;

/// Live, per-metric accumulation state.
///
/// An `Accumulator` only stores what is needed to derive the final statistics
/// later: a sum for counters, true/total counts for rates and the raw values for
/// trends. Derivations (averages, percentiles, ratios) happen once, in
/// [`Accumulator::finish`], after the run has stopped producing samples.
///
/// Trends retain every observation. That keeps percentiles exact and
/// reproducible at the cost of memory proportional to the number of samples,
/// which is fine for single-process runs of the size this engine targets.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Counter { sum: f64, samples: u64 },
    Rate { trues: u64, total: u64 },
    Trend { values: Vec<f64> },
}

impl Accumulator {
    /// Create an empty accumulator for `kind`.
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Accumulator::Counter { sum: 0.0, samples: 0 },
            MetricKind::Rate => Accumulator::Rate { trues: 0, total: 0 },
            MetricKind::Trend => Accumulator::Trend { values: Vec::new() },
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Accumulator::Counter { .. } => MetricKind::Counter,
            Accumulator::Rate { .. } => MetricKind::Rate,
            Accumulator::Trend { .. } => MetricKind::Trend,
        }
    }

    /// Incorporate a single observation.
    pub fn consume(&mut self, value: f64) {
        match self {
            Accumulator::Counter { sum, samples } => {
                *sum += value;
                *samples += 1;
            }
            Accumulator::Rate { trues, total } => {
                if value != 0.0 {
                    *trues += 1;
                }
                *total += 1;
            }
            Accumulator::Trend { values } => values.push(value),
        }
    }

    /// Number of observations consumed so far.
    pub fn samples(&self) -> u64 {
        match self {
            Accumulator::Counter { samples, .. } => *samples,
            Accumulator::Rate { total, .. } => *total,
            Accumulator::Trend { values } => values.len() as u64,
        }
    }

    /// Derive the final statistics. Consumes the retained samples.
    pub fn finish(self) -> Aggregate {
        match self {
            Accumulator::Counter { sum, samples } => Aggregate::Counter(CounterSummary {
                count: sum,
                samples,
            }),
            Accumulator::Rate { trues, total } => Aggregate::Rate(RateSummary::new(trues, total)),
            Accumulator::Trend { values } => Aggregate::Trend(TrendSummary::new(values)),
        }
    }
}

/// Final, immutable statistics of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Aggregate {
    Counter(CounterSummary),
    Rate(RateSummary),
    Trend(TrendSummary),
}

impl Aggregate {
    pub fn kind(&self) -> MetricKind {
        match self {
            Aggregate::Counter(_) => MetricKind::Counter,
            Aggregate::Rate(_) => MetricKind::Rate,
            Aggregate::Trend(_) => MetricKind::Trend,
        }
    }

    /// Number of observations the aggregate was built from.
    pub fn samples(&self) -> u64 {
        match self {
            Aggregate::Counter(c) => c.samples,
            Aggregate::Rate(r) => r.total,
            Aggregate::Trend(t) => t.count,
        }
    }

    pub fn as_counter(&self) -> Option<&CounterSummary> {
        match self {
            Aggregate::Counter(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_rate(&self) -> Option<&RateSummary> {
        match self {
            Aggregate::Rate(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_trend(&self) -> Option<&TrendSummary> {
        match self {
            Aggregate::Trend(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterSummary {
    /// Sum of all observed values.
    pub count: f64,
    pub samples: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSummary {
    /// `passes / total`, or `0` when nothing was observed.
    pub rate: f64,
    pub passes: u64,
    pub fails: u64,
    pub total: u64,
}

impl RateSummary {
    pub fn new(trues: u64, total: u64) -> Self {
        let rate = if total == 0 {
            0.0
        } else {
            trues as f64 / total as f64
        };
        Self {
            rate,
            passes: trues,
            fails: total - trues,
            total,
        }
    }
}

/// Distribution statistics of a trend metric.
///
/// The sorted sample set is kept so thresholds can ask for any percentile, but
/// it is not serialized into reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    #[serde(skip)]
    sorted: Vec<f64>,
}

impl TrendSummary {
    pub fn new(mut values: Vec<f64>) -> Self {
        values.sort_by(f64::total_cmp);
        let count = values.len() as u64;
        let (min, max, avg) = match (values.first(), values.last()) {
            (Some(min), Some(max)) => (*min, *max, values.iter().sum::<f64>() / count as f64),
            _ => (0.0, 0.0, 0.0),
        };
        let at = |p: f64| percentile(&values, p).unwrap_or(0.0);
        Self {
            count,
            min,
            max,
            avg,
            med: at(0.5),
            p90: at(0.9),
            p95: at(0.95),
            sorted: values,
        }
    }

    /// Percentile for `p` in `[0, 1]`, `None` when the trend has no samples.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        percentile(&self.sorted, p)
    }
}

/// Linear-interpolation percentile over an ascending slice.
///
/// Returns the value at fractional rank `p * (n - 1)`, interpolating between
/// the two neighbouring samples. `p` is clamped to `[0, 1]`.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = p.clamp(0.0, 1.0) * last as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trend(values: &[f64]) -> TrendSummary {
        let mut acc = Accumulator::new(MetricKind::Trend);
        values.iter().for_each(|v| acc.consume(*v));
        match acc.finish() {
            Aggregate::Trend(t) => t,
            other => panic!("expected a trend, got {other:?}"),
        }
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let sorted = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&sorted, 0.0), Some(10.0));
        assert_eq!(percentile(&sorted, 1.0), Some(40.0));
        // rank 0.5 * 3 = 1.5 -> halfway between 20 and 30
        assert_eq!(percentile(&sorted, 0.5), Some(25.0));
        // rank 0.9 * 3 = 2.7
        let p90 = percentile(&sorted, 0.9).unwrap();
        assert!((p90 - 37.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_of_single_sample_is_that_sample() {
        assert_eq!(percentile(&[7.5], 0.95), Some(7.5));
    }

    #[test]
    fn percentile_of_nothing_is_none() {
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn trend_percentiles_ignore_recording_order() {
        let values: Vec<f64> = (1..=200).map(|v| (v * 37 % 211) as f64).collect();
        let mut reversed = values.clone();
        reversed.reverse();
        let mut interleaved: Vec<f64> = values.iter().step_by(2).copied().collect();
        interleaved.extend(values.iter().skip(1).step_by(2));

        let a = trend(&values);
        let b = trend(&reversed);
        let c = trend(&interleaved);
        for p in [0.0, 0.25, 0.5, 0.9, 0.95, 0.99, 1.0] {
            assert_eq!(a.percentile(p), b.percentile(p));
            assert_eq!(a.percentile(p), c.percentile(p));
        }
        assert_eq!(a, b);
    }

    #[test]
    fn trend_summary_statistics() {
        let t = trend(&[5.0, 1.0, 3.0, 2.0, 4.0]);
        assert_eq!(t.count, 5);
        assert_eq!(t.min, 1.0);
        assert_eq!(t.max, 5.0);
        assert_eq!(t.avg, 3.0);
        assert_eq!(t.med, 3.0);
        assert!((t.p95 - 4.8).abs() < 1e-9);
    }

    #[test]
    fn empty_rate_is_zero() {
        let rate = RateSummary::new(0, 0);
        assert_eq!(rate.rate, 0.0);
        assert_eq!(rate.fails, 0);
    }

    #[test]
    fn rate_counts_non_zero_as_true() {
        let mut acc = Accumulator::new(MetricKind::Rate);
        for v in [1.0, 0.0, 0.0, 2.0] {
            acc.consume(v);
        }
        let Aggregate::Rate(rate) = acc.finish() else {
            panic!("expected a rate");
        };
        assert_eq!(rate.passes, 2);
        assert_eq!(rate.fails, 2);
        assert_eq!(rate.rate, 0.5);
    }

    #[test]
    fn counter_sums_values() {
        let mut acc = Accumulator::new(MetricKind::Counter);
        acc.consume(1.0);
        acc.consume(2.5);
        assert_eq!(acc.samples(), 2);
        assert_eq!(
            acc.finish(),
            Aggregate::Counter(CounterSummary {
                count: 3.5,
                samples: 2
            })
        );
    }

    #[test]
    fn trend_summary_skips_samples_when_serialized() {
        let t = trend(&[1.0, 2.0]);
        let json = serde_json::to_value(Aggregate::Trend(t)).unwrap();
        assert_eq!(json["type"], "trend");
        assert!(json.get("sorted").is_none());
    }
}
