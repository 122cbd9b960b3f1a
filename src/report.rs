use std::{collections::BTreeMap, fmt, future::Future, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::Aggregate, error::BoxError, executor::ExecutionSummary,
    threshold::ThresholdOutcome,
};

/// Process exit code of a run whose thresholds did not all pass.
pub const EXIT_THRESHOLDS_FAILED: i32 = 99;
/// Process exit code of a run stopped by an engine error.
pub const EXIT_ABORTED: i32 = 108;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every threshold passed.
    Passed,
    /// The run completed but at least one threshold failed.
    Failed,
    /// An invariant violation stopped the run; thresholds were not evaluated.
    Aborted { reason: String },
}

/// Everything a finished run produced. Pure data, no I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub scenario: String,
    pub status: RunStatus,
    #[serde(with = "crate::config::human_duration")]
    pub duration: Duration,
    #[serde(flatten)]
    pub execution: ExecutionSummary,
    pub metrics: BTreeMap<String, Aggregate>,
    pub thresholds: Vec<ThresholdOutcome>,
}

impl RunResult {
    pub fn completed(
        scenario: String,
        metrics: BTreeMap<String, Aggregate>,
        thresholds: Vec<ThresholdOutcome>,
        execution: ExecutionSummary,
        duration: Duration,
    ) -> Self {
        let status = if thresholds.iter().all(|t| t.passed) {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        Self {
            scenario,
            status,
            duration,
            execution,
            metrics,
            thresholds,
        }
    }

    pub fn aborted(
        scenario: String,
        reason: String,
        metrics: BTreeMap<String, Aggregate>,
        execution: ExecutionSummary,
        duration: Duration,
    ) -> Self {
        Self {
            scenario,
            status: RunStatus::Aborted { reason },
            duration,
            execution,
            metrics,
            thresholds: Vec::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.status, RunStatus::Aborted { .. })
    }

    /// `0` when every threshold passed, [`EXIT_THRESHOLDS_FAILED`] or
    /// [`EXIT_ABORTED`] otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Passed => 0,
            RunStatus::Failed => EXIT_THRESHOLDS_FAILED,
            RunStatus::Aborted { .. } => EXIT_ABORTED,
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &self.status {
            RunStatus::Passed => "passed".to_string(),
            RunStatus::Failed => "thresholds failed".to_string(),
            RunStatus::Aborted { reason } => format!("aborted: {reason}"),
        };
        writeln!(f, "scenario: {} ({status})", self.scenario)?;
        writeln!(
            f,
            "duration: {}, iterations: {}, vus: {} peak / {} spawned",
            humantime::format_duration(Duration::from_millis(self.duration.as_millis() as u64)),
            self.execution.iterations,
            self.execution.vus_peak,
            self.execution.vus_spawned,
        )?;
        writeln!(f)?;

        for (name, aggregate) in &self.metrics {
            let dots = ".".repeat(40usize.saturating_sub(name.len()));
            write!(f, "  {name}{dots}: ")?;
            match aggregate {
                Aggregate::Counter(c) => writeln!(f, "{} ({} samples)", c.count, c.samples)?,
                Aggregate::Rate(r) => writeln!(
                    f,
                    "{:.2}% ✓ {} ✗ {}",
                    r.rate * 100.0,
                    r.passes,
                    r.fails
                )?,
                Aggregate::Trend(t) => writeln!(
                    f,
                    "avg={:.2} min={:.2} med={:.2} max={:.2} p(90)={:.2} p(95)={:.2}",
                    t.avg, t.min, t.med, t.max, t.p90, t.p95
                )?,
            }
        }

        if !self.thresholds.is_empty() {
            writeln!(f)?;
            writeln!(f, "thresholds:")?;
            for t in &self.thresholds {
                let mark = if t.passed { "✓" } else { "✗" };
                write!(f, "  {mark} {}: {}", t.metric, t.expression)?;
                match (t.observed, &t.reason) {
                    (Some(observed), _) => writeln!(f, " (observed {observed:.4})")?,
                    (None, Some(reason)) => writeln!(f, " ({reason})")?,
                    (None, None) => writeln!(f)?,
                }
            }
        }
        Ok(())
    }
}

/// A [`Reporter`] consumes a [`RunResult`] and performs side effects:
/// displaying it, sending it to a service, or persisting it somewhere.
///
/// # Example
/// ```rust
/// use stampede::{Reporter, RunResult};
/// struct MyReporter;
/// impl Reporter for MyReporter {
///     async fn report(&self, result: &RunResult) -> Result<(), stampede::BoxError> {
///         println!("{} exited with {}", result.scenario, result.exit_code());
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter {
    fn report(&self, result: &RunResult) -> impl Future<Output = Result<(), BoxError>>;
}

/// Prints the end-of-run summary to stdout.
pub struct StdoutReporter;

impl Reporter for StdoutReporter {
    async fn report(&self, result: &RunResult) -> Result<(), BoxError> {
        println!("{result}");
        Ok(())
    }
}

/// Writes the result as pretty JSON to a file, or to stdout without one.
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

impl Reporter for JsonReporter {
    async fn report(&self, result: &RunResult) -> Result<(), BoxError> {
        let json = serde_json::to_string_pretty(result)?;
        match &self.path {
            Some(path) => {
                tokio::fs::write(path, json).await?;
                tracing::info!("Wrote run summary to {}", path.display());
            }
            None => println!("{json}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{aggregate::Accumulator, metric::MetricKind};

    fn outcome(passed: bool) -> ThresholdOutcome {
        ThresholdOutcome {
            metric: "errors".into(),
            expression: "rate<0.01".into(),
            passed,
            observed: Some(if passed { 0.0 } else { 0.5 }),
            reason: None,
            abort_on_fail: false,
        }
    }

    fn metrics() -> BTreeMap<String, Aggregate> {
        let mut errors = Accumulator::new(MetricKind::Rate);
        errors.consume(0.0);
        let mut ttfb = Accumulator::new(MetricKind::Trend);
        ttfb.consume(12.0);
        BTreeMap::from([
            ("errors".to_string(), errors.finish()),
            ("ttfb".to_string(), ttfb.finish()),
        ])
    }

    #[test]
    fn exit_codes_follow_status() {
        let summary = ExecutionSummary::default();
        let secs = Duration::from_secs(1);
        let pass = RunResult::completed(
            "s".into(),
            metrics(),
            vec![outcome(true)],
            summary.clone(),
            secs,
        );
        let fail = RunResult::completed(
            "s".into(),
            metrics(),
            vec![outcome(true), outcome(false)],
            summary.clone(),
            secs,
        );
        let abort = RunResult::aborted("s".into(), "boom".into(), BTreeMap::new(), summary, secs);

        assert!(pass.passed());
        assert_eq!(pass.exit_code(), 0);
        assert_eq!(fail.status, RunStatus::Failed);
        assert_eq!(fail.exit_code(), EXIT_THRESHOLDS_FAILED);
        assert!(abort.is_aborted());
        assert_eq!(abort.exit_code(), EXIT_ABORTED);
    }

    #[test]
    fn no_thresholds_means_passed() {
        let result = RunResult::completed(
            "s".into(),
            BTreeMap::new(),
            vec![],
            ExecutionSummary::default(),
            Duration::ZERO,
        );
        assert!(result.passed());
    }

    #[test]
    fn summary_renders_metrics_and_thresholds() {
        let result = RunResult::completed(
            "smoke".into(),
            metrics(),
            vec![outcome(false)],
            ExecutionSummary::default(),
            Duration::from_secs(90),
        );
        let text = result.to_string();
        assert!(text.contains("scenario: smoke (thresholds failed)"));
        assert!(text.contains("1m 30s"));
        assert!(text.contains("0.00% ✓ 0 ✗ 1"));
        assert!(text.contains("avg=12.00"));
        assert!(text.contains("✗ errors: rate<0.01 (observed 0.5000)"));
    }

    #[test]
    fn json_shape_is_stable() {
        let result = RunResult::aborted(
            "smoke".into(),
            "registry finalized".into(),
            metrics(),
            ExecutionSummary {
                iterations: 3,
                ..Default::default()
            },
            Duration::from_millis(1_500),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"]["aborted"]["reason"], "registry finalized");
        assert_eq!(json["duration"], "1s 500ms");
        assert_eq!(json["iterations"], 3);
        assert_eq!(json["metrics"]["errors"]["type"], "rate");
    }

    #[tokio::test]
    async fn json_reporter_writes_file() {
        let path =
            std::env::temp_dir().join(format!("stampede-report-{}.json", std::process::id()));
        let result = RunResult::completed(
            "smoke".into(),
            metrics(),
            vec![outcome(true)],
            ExecutionSummary::default(),
            Duration::from_secs(1),
        );
        JsonReporter::to_file(&path).report(&result).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["scenario"], "smoke");
        assert_eq!(written["status"], "passed");
        std::fs::remove_file(path).unwrap();
    }
}
