//! Pass/fail predicates over final metric aggregates.
//!
//! Threshold expressions are parsed once, when the run is configured, into a
//! small AST (`[statistic] comparator literal`) and evaluated against the typed
//! aggregates after the registry is finalized:
//!
//! ```text
//! rate<0.01          p(95)<800          avg <= 200
//! count>=100         <0.01              med==12.5
//! ```
//!
//! A metric key may select a sub-metric by tags: `http_req_duration{name:login}`.
use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::Aggregate,
    error::{Error, Result},
    metric::{MetricKind, Tags},
    registry::metric_key,
};

/// The value of an aggregate a threshold compares against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in `[0, 100]`.
    Percentile(f64),
}

impl Statistic {
    /// Statistic used when an expression names none.
    pub fn default_for(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Statistic::Count,
            MetricKind::Rate => Statistic::Rate,
            MetricKind::Trend => Statistic::Avg,
        }
    }

    pub fn applies_to(&self, kind: MetricKind) -> bool {
        match self {
            Statistic::Count => kind == MetricKind::Counter,
            Statistic::Rate => kind == MetricKind::Rate,
            _ => kind == MetricKind::Trend,
        }
    }

    fn extract(&self, aggregate: &Aggregate) -> Option<f64> {
        match (self, aggregate) {
            (Statistic::Count, Aggregate::Counter(c)) => Some(c.count),
            (Statistic::Rate, Aggregate::Rate(r)) => Some(r.rate),
            (Statistic::Avg, Aggregate::Trend(t)) => Some(t.avg),
            (Statistic::Min, Aggregate::Trend(t)) => Some(t.min),
            (Statistic::Max, Aggregate::Trend(t)) => Some(t.max),
            (Statistic::Med, Aggregate::Trend(t)) => Some(t.med),
            (Statistic::Percentile(p), Aggregate::Trend(t)) => t.percentile(p / 100.0),
            _ => None,
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Count => f.write_str("count"),
            Statistic::Rate => f.write_str("rate"),
            Statistic::Avg => f.write_str("avg"),
            Statistic::Min => f.write_str("min"),
            Statistic::Max => f.write_str("max"),
            Statistic::Med => f.write_str("med"),
            Statistic::Percentile(p) => write!(f, "p({p})"),
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
    pub fn holds(&self, observed: f64, literal: f64) -> bool {
        match self {
            Comparator::Lt => observed < literal,
            Comparator::Le => observed <= literal,
            Comparator::Gt => observed > literal,
            Comparator::Ge => observed >= literal,
            Comparator::Eq => observed == literal,
            Comparator::Ne => observed != literal,
        }
    }

    /// Longest-match parse of a comparator prefix; returns the rest.
    fn split(input: &str) -> Option<(Comparator, &str)> {
        const TOKENS: [(&str, Comparator); 7] = [
            ("===", Comparator::Eq),
            ("<=", Comparator::Le),
            (">=", Comparator::Ge),
            ("==", Comparator::Eq),
            ("!=", Comparator::Ne),
            ("<", Comparator::Lt),
            (">", Comparator::Gt),
        ];
        TOKENS
            .iter()
            .find_map(|(tok, cmp)| input.strip_prefix(tok).map(|rest| (*cmp, rest)))
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        })
    }
}

/// Parsed form of a threshold expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    /// `None` means the metric kind's default statistic.
    pub statistic: Option<Statistic>,
    pub comparator: Comparator,
    pub literal: f64,
}

impl Predicate {
    pub fn parse(expression: &str) -> std::result::Result<Self, String> {
        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err("empty expression".into());
        }

        let split_at = compact
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| "missing comparator (one of <, <=, >, >=, ==, !=)".to_string())?;
        let (head, tail) = compact.split_at(split_at);

        let statistic = if head.is_empty() {
            None
        } else {
            Some(parse_statistic(head)?)
        };

        let (comparator, literal) =
            Comparator::split(tail).ok_or_else(|| format!("unknown comparator in `{tail}`"))?;
        let literal: f64 = literal
            .parse()
            .map_err(|_| format!("`{literal}` is not a number"))?;
        if !literal.is_finite() {
            return Err(format!("`{literal}` is not a finite number"));
        }

        Ok(Self {
            statistic,
            comparator,
            literal,
        })
    }

    pub fn statistic_for(&self, kind: MetricKind) -> Statistic {
        self.statistic.unwrap_or(Statistic::default_for(kind))
    }
}

fn parse_statistic(head: &str) -> std::result::Result<Statistic, String> {
    let stat = match head {
        "count" => Statistic::Count,
        "rate" => Statistic::Rate,
        "avg" => Statistic::Avg,
        "min" => Statistic::Min,
        "max" => Statistic::Max,
        "med" => Statistic::Med,
        _ => {
            let inner = head
                .strip_prefix("p(")
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| format!("unknown statistic `{head}`"))?;
            let p: f64 = inner
                .parse()
                .map_err(|_| format!("invalid percentile `{inner}`"))?;
            if !(0.0..=100.0).contains(&p) {
                return Err(format!("percentile {p} is outside 0..=100"));
            }
            Statistic::Percentile(p)
        }
    };
    Ok(stat)
}

/// Split `name{tag:value,...}` into the metric name and its tag selector.
pub fn parse_metric_key(key: &str) -> std::result::Result<(String, Tags), String> {
    let key = key.trim();
    let Some(open) = key.find('{') else {
        if key.is_empty() {
            return Err("empty metric name".into());
        }
        return Ok((key.to_string(), Tags::new()));
    };
    let name = key[..open].trim();
    if name.is_empty() {
        return Err("empty metric name".into());
    }
    let body = key[open + 1..]
        .strip_suffix('}')
        .ok_or_else(|| "unterminated tag selector".to_string())?;

    let mut selector = Tags::new();
    for pair in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = pair
            .split_once(':')
            .ok_or_else(|| format!("tag selector `{pair}` must be key:value"))?;
        selector.insert(k.trim().to_string(), v.trim().to_string());
    }
    if selector.is_empty() {
        return Err("empty tag selector".into());
    }
    Ok((name.to_string(), selector))
}

/// One pass/fail criterion on one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    /// Metric name, without selector.
    pub metric: String,
    /// Tag selector for sub-metric thresholds, empty otherwise.
    pub selector: Tags,
    pub predicate: Predicate,
    /// Expression as written in the configuration.
    pub source: String,
    /// Carried through to the outcome; evaluation only happens at run end.
    pub abort_on_fail: bool,
}

impl Threshold {
    pub fn parse(metric_key: &str, expression: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidThreshold {
            metric: metric_key.to_string(),
            expression: expression.to_string(),
            reason,
        };
        let (metric, selector) = parse_metric_key(metric_key).map_err(invalid)?;
        let predicate = Predicate::parse(expression).map_err(invalid)?;
        Ok(Self {
            metric,
            selector,
            predicate,
            source: expression.trim().to_string(),
            abort_on_fail: false,
        })
    }

    pub fn with_abort_on_fail(mut self, abort: bool) -> Self {
        self.abort_on_fail = abort;
        self
    }

    /// Key the aggregate is reported under.
    pub fn key(&self) -> String {
        metric_key(&self.metric, &self.selector)
    }

    /// Reject statistics that can never apply to a metric of `kind`.
    pub fn validate(&self, kind: MetricKind) -> Result<()> {
        let stat = self.predicate.statistic_for(kind);
        if stat.applies_to(kind) {
            return Ok(());
        }
        Err(Error::InvalidThreshold {
            metric: self.key(),
            expression: self.source.clone(),
            reason: format!("`{stat}` does not apply to a {kind} metric"),
        })
    }

    /// Evaluate against the final aggregates of a run.
    pub fn evaluate(&self, aggregates: &BTreeMap<String, Aggregate>) -> ThresholdOutcome {
        let key = self.key();
        let verdict = |passed: bool, observed: Option<f64>, reason: Option<String>| {
            ThresholdOutcome {
                metric: key.clone(),
                expression: self.source.clone(),
                passed,
                observed,
                reason,
                abort_on_fail: self.abort_on_fail,
            }
        };

        let Some(aggregate) = aggregates.get(&key) else {
            return verdict(false, None, Some("metric has no recorded samples".into()));
        };

        let kind = aggregate.kind();
        let stat = self.predicate.statistic_for(kind);
        if !stat.applies_to(kind) {
            return verdict(
                false,
                None,
                Some(format!("`{stat}` does not apply to a {kind} metric")),
            );
        }
        // Rates default to 0 when empty; nothing else can be asserted on.
        if aggregate.samples() == 0 && kind != MetricKind::Rate {
            return verdict(false, None, Some("metric has no recorded samples".into()));
        }

        match stat.extract(aggregate) {
            Some(observed) => {
                let passed = self.predicate.comparator.holds(observed, self.predicate.literal);
                verdict(passed, Some(observed), None)
            }
            None => verdict(false, None, Some(format!("`{stat}` is unavailable"))),
        }
    }
}

/// A parsed threshold configuration: metric key to expressions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Thresholds(Vec<Threshold>);

impl Thresholds {
    pub fn new(thresholds: Vec<Threshold>) -> Self {
        Self(thresholds)
    }

    /// Parse a `metric key -> [expression]` mapping.
    pub fn parse<K, E, I>(config: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, Vec<E>)>,
        K: AsRef<str>,
        E: AsRef<str>,
    {
        let mut out = Vec::new();
        for (key, expressions) in config {
            for expression in expressions {
                out.push(Threshold::parse(key.as_ref(), expression.as_ref())?);
            }
        }
        Ok(Self(out))
    }

    pub fn push(&mut self, threshold: Threshold) {
        self.0.push(threshold);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Threshold> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluate every threshold; overall pass is the AND of the outcomes.
    pub fn evaluate(&self, aggregates: &BTreeMap<String, Aggregate>) -> Vec<ThresholdOutcome> {
        self.0.iter().map(|t| t.evaluate(aggregates)).collect()
    }
}

impl<'a> IntoIterator for &'a Thresholds {
    type Item = &'a Threshold;
    type IntoIter = std::slice::Iter<'a, Threshold>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Result of evaluating one threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOutcome {
    pub metric: String,
    pub expression: String,
    pub passed: bool,
    /// Statistic value the expression was checked against.
    pub observed: Option<f64>,
    /// Why the threshold could not be checked, if it could not.
    pub reason: Option<String>,
    #[serde(default)]
    pub abort_on_fail: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Accumulator, RateSummary};

    fn aggregate(kind: MetricKind, values: &[f64]) -> Aggregate {
        let mut acc = Accumulator::new(kind);
        values.iter().for_each(|v| acc.consume(*v));
        acc.finish()
    }

    fn aggregates(entries: Vec<(&str, Aggregate)>) -> BTreeMap<String, Aggregate> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn parses_the_supported_grammar() {
        let p = Predicate::parse("p(95)<800").unwrap();
        assert_eq!(p.statistic, Some(Statistic::Percentile(95.0)));
        assert_eq!(p.comparator, Comparator::Lt);
        assert_eq!(p.literal, 800.0);

        let p = Predicate::parse(" rate <= 0.05 ").unwrap();
        assert_eq!(p.statistic, Some(Statistic::Rate));
        assert_eq!(p.comparator, Comparator::Le);

        let p = Predicate::parse("<0.01").unwrap();
        assert_eq!(p.statistic, None);
        assert_eq!(p.literal, 0.01);

        assert_eq!(Predicate::parse("count===3").unwrap().comparator, Comparator::Eq);
        assert_eq!(Predicate::parse("med!=3").unwrap().comparator, Comparator::Ne);
        assert_eq!(
            Predicate::parse("p(99.9)>=1").unwrap().statistic,
            Some(Statistic::Percentile(99.9))
        );
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "", "rate", "rate<", "rate<abc", "p(101)<1", "p(x)<1", "mean<3", "rate=<1", "rate<inf",
        ] {
            assert!(Predicate::parse(bad).is_err(), "`{bad}` should not parse");
        }
        let err = Threshold::parse("errors", "rate<<1").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn parses_metric_keys_with_selectors() {
        let (name, tags) = parse_metric_key("http_req_duration{name:GET_/api/health}").unwrap();
        assert_eq!(name, "http_req_duration");
        assert_eq!(tags.get("name").map(String::as_str), Some("GET_/api/health"));

        assert!(parse_metric_key("x{").is_err());
        assert!(parse_metric_key("{a:b}").is_err());
        assert!(parse_metric_key("x{novalue}").is_err());
    }

    #[test]
    fn strict_inequality_fails_at_the_boundary() {
        let t = Threshold::parse("errors", "rate<0.01").unwrap();
        // exactly 1 failure in 100 observations
        let mut values = vec![0.0; 99];
        values.push(1.0);
        let aggs = aggregates(vec![("errors", aggregate(MetricKind::Rate, &values))]);

        let outcome = t.evaluate(&aggs);
        assert_eq!(outcome.observed, Some(0.01));
        assert!(!outcome.passed);

        let t = Threshold::parse("errors", "rate<=0.01").unwrap();
        assert!(t.evaluate(&aggs).passed);
    }

    #[test]
    fn absent_metric_fails() {
        let t = Threshold::parse("ttfb", "p(95)<800").unwrap();
        let outcome = t.evaluate(&BTreeMap::new());
        assert!(!outcome.passed);
        assert!(outcome.reason.is_some());
    }

    #[test]
    fn empty_rate_uses_zero_but_empty_trend_fails() {
        let aggs = aggregates(vec![
            ("errors", Aggregate::Rate(RateSummary::new(0, 0))),
            ("ttfb", aggregate(MetricKind::Trend, &[])),
        ]);
        let rate = Threshold::parse("errors", "rate<0.01").unwrap().evaluate(&aggs);
        assert!(rate.passed);
        assert_eq!(rate.observed, Some(0.0));

        let trend = Threshold::parse("ttfb", "avg<1").unwrap().evaluate(&aggs);
        assert!(!trend.passed);
    }

    #[test]
    fn percentile_thresholds_use_interpolated_values() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let aggs = aggregates(vec![("http_req_duration", aggregate(MetricKind::Trend, &values))]);

        // rank 0.95 * 99 = 94.05 -> 95.05
        let outcome = Threshold::parse("http_req_duration", "p(95)<95.1")
            .unwrap()
            .evaluate(&aggs);
        assert!(outcome.passed);
        assert!((outcome.observed.unwrap() - 95.05).abs() < 1e-9);

        let outcome = Threshold::parse("http_req_duration", "p(95)<95")
            .unwrap()
            .evaluate(&aggs);
        assert!(!outcome.passed);
    }

    #[test]
    fn default_statistic_follows_kind() {
        let aggs = aggregates(vec![
            ("iterations", aggregate(MetricKind::Counter, &[1.0, 1.0, 1.0])),
            ("ttfb", aggregate(MetricKind::Trend, &[10.0, 30.0])),
        ]);
        assert!(Threshold::parse("iterations", ">=3").unwrap().evaluate(&aggs).passed);
        let avg = Threshold::parse("ttfb", "==20").unwrap().evaluate(&aggs);
        assert!(avg.passed);
    }

    #[test]
    fn mismatched_statistic_is_rejected() {
        let t = Threshold::parse("errors", "p(95)<1").unwrap();
        assert!(t.validate(MetricKind::Rate).is_err());
        assert!(t.validate(MetricKind::Trend).is_ok());

        let aggs = aggregates(vec![("errors", aggregate(MetricKind::Rate, &[0.0]))]);
        assert!(!t.evaluate(&aggs).passed);
    }

    #[test]
    fn parses_threshold_maps() {
        let mut config = BTreeMap::new();
        config.insert("errors", vec!["rate<0.01"]);
        config.insert("http_req_duration", vec!["p(95)<800", "max<2000"]);
        let thresholds = Thresholds::parse(config).unwrap();
        assert_eq!(thresholds.len(), 3);
        assert!(thresholds.iter().any(|t| t.source == "max<2000"));
    }
}
