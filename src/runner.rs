//! Run controller: owns the registry, drives the executor and walks the run
//! through its phases.
//!
//! ```text
//! Idle -> Ramping -> Draining -> Finalizing -> Done
//! ```
//!
//! Phases only move forward. A run-fatal error jumps straight to `Done` and
//! yields an aborted [`RunResult`].
use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, watch},
    time::Instant,
};

use crate::{
    error::{Error, Result},
    executor::{ExecutionContext, ExecutionSummary, Executor},
    metric::MetricKind,
    registry::MetricRegistry,
    report::RunResult,
    scenario::{Scenario, Workload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Ramping,
    Draining,
    Finalizing,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Ramping => "ramping",
            RunPhase::Draining => "draining",
            RunPhase::Finalizing => "finalizing",
            RunPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Current phase plus a broadcast of every transition.
#[derive(Clone)]
pub(crate) struct PhaseSignal {
    current: Arc<Mutex<RunPhase>>,
    tx: broadcast::Sender<RunPhase>,
}

impl PhaseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            current: Arc::new(Mutex::new(RunPhase::Idle)),
            tx,
        }
    }

    pub(crate) fn current(&self) -> RunPhase {
        *self.current.lock()
    }

    /// Move to `to` unless the run is already there or past it.
    pub(crate) fn advance(&self, to: RunPhase) -> bool {
        let mut current = self.current.lock();
        if *current >= to {
            return false;
        }
        tracing::info!("Run phase {} -> {}", *current, to);
        *current = to;
        // no subscribers is fine
        let _ = self.tx.send(to);
        true
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RunPhase> {
        self.tx.subscribe()
    }
}

/// Runs one scenario with one executor, start to finish.
///
/// # Example
/// ```rust,no_run
/// use std::time::Duration;
/// use stampede::{BoxError, Runner, Scenario, Stage, StageExecutor, Thresholds, VuContext};
///
/// # async fn demo() -> stampede::Result<()> {
/// let scenario = Scenario::builder()
///     .name("smoke")
///     .action(|ctx: VuContext| async move {
///         ctx.sleep(Duration::from_secs(1)).await;
///         Ok::<(), BoxError>(())
///     })
///     .thresholds(Thresholds::parse([("iteration_errors", vec!["rate<0.01"])])?)
///     .build();
/// let executor = StageExecutor::builder()
///     .stages(vec![Stage::new(Duration::from_secs(30), 5)])
///     .build();
///
/// let result = Runner::new(scenario, executor)?.run().await;
/// std::process::exit(result.exit_code());
/// # }
/// ```
pub struct Runner<E, W> {
    scenario: Scenario<W>,
    executor: E,
    registry: Arc<MetricRegistry>,
    phase: PhaseSignal,
    vus: Arc<watch::Sender<usize>>,
}

impl<E: Executor, W: Workload> Runner<E, W> {
    /// Validate the configuration and prepare the registry.
    ///
    /// Built-in and declared metrics are defined here, and every threshold
    /// is checked against the kind of the metric it names when that kind is
    /// already known.
    pub fn new(scenario: Scenario<W>, executor: E) -> Result<Self> {
        executor.validate()?;

        let registry = MetricRegistry::new();
        for (name, kind) in MetricKind::builtins() {
            registry.define(name, kind)?;
        }
        for (name, kind) in &scenario.metrics {
            registry.define(name, *kind)?;
        }

        for threshold in &scenario.thresholds {
            if let Some(kind) = registry.kind_of(&threshold.metric) {
                threshold.validate(kind)?;
            }
            registry.track_submetric(&threshold.metric, threshold.selector.clone());
            if threshold.abort_on_fail {
                tracing::warn!(
                    "Threshold `{}: {}` sets abortOnFail; it is only checked at run end",
                    threshold.key(),
                    threshold.source
                );
            }
        }

        let (vus, _) = watch::channel(0);
        Ok(Self {
            scenario,
            executor,
            registry: Arc::new(registry),
            phase: PhaseSignal::new(),
            vus: Arc::new(vus),
        })
    }

    /// Every phase transition from now on, in order.
    pub fn subscribe_phases(&self) -> broadcast::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    /// Live virtual-user count, updated every scheduler tick.
    pub fn subscribe_vus(&self) -> watch::Receiver<usize> {
        self.vus.subscribe()
    }

    pub fn phase(&self) -> RunPhase {
        self.phase.current()
    }

    pub fn registry(&self) -> Arc<MetricRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run to completion. Never fails: errors surface as an aborted result.
    pub async fn run(self) -> RunResult {
        let Runner {
            scenario,
            executor,
            registry,
            phase,
            vus,
        } = self;
        let Scenario {
            name,
            action,
            tags,
            thresholds,
            ..
        } = scenario;

        tracing::info!("Running scenario: {name}");
        let started = Instant::now();
        phase.advance(RunPhase::Ramping);

        let ctx = ExecutionContext::with_signals(Arc::clone(&registry), tags, phase.clone(), vus);
        let summary = match executor.exec(Arc::new(action), ctx).await {
            Ok(summary) => summary,
            Err(e) => {
                let summary = ExecutionSummary::default();
                return abort(name, &registry, &phase, e, summary, started);
            }
        };

        phase.advance(RunPhase::Draining);
        phase.advance(RunPhase::Finalizing);
        let metrics = match registry.finalize() {
            Ok(metrics) => metrics,
            Err(e) => return abort(name, &registry, &phase, e, summary, started),
        };

        let outcomes = thresholds.evaluate(&metrics);
        for failed in outcomes.iter().filter(|o| !o.passed) {
            tracing::warn!(
                "Threshold failed: {}: {} (observed {:?})",
                failed.metric,
                failed.expression,
                failed.observed
            );
        }
        phase.advance(RunPhase::Done);

        let result = RunResult::completed(name, metrics, outcomes, summary, started.elapsed());
        tracing::info!("Done running scenario: {}!", result.scenario);
        result
    }
}

fn abort(
    name: String,
    registry: &MetricRegistry,
    phase: &PhaseSignal,
    error: Error,
    summary: ExecutionSummary,
    started: Instant,
) -> RunResult {
    tracing::error!("Aborting scenario {name}: {error}");
    // partial aggregates when the registry is still open
    let metrics = registry.finalize().unwrap_or_default();
    phase.advance(RunPhase::Done);
    RunResult::aborted(name, error.to_string(), metrics, summary, started.elapsed())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        error::BoxError,
        executor::{Stage, StageExecutor, VuContext},
        report::RunStatus,
        threshold::Thresholds,
    };

    fn executor(stages: Vec<Stage>) -> StageExecutor {
        StageExecutor::builder().stages(stages).build()
    }

    #[test]
    fn phases_only_move_forward() {
        let signal = PhaseSignal::new();
        let mut rx = signal.subscribe();
        assert!(signal.advance(RunPhase::Ramping));
        assert!(!signal.advance(RunPhase::Ramping));
        assert!(!signal.advance(RunPhase::Idle));
        assert!(signal.advance(RunPhase::Done));
        assert_eq!(rx.try_recv().unwrap(), RunPhase::Ramping);
        assert_eq!(rx.try_recv().unwrap(), RunPhase::Done);
        assert_eq!(signal.current(), RunPhase::Done);
    }

    #[test]
    fn invalid_configuration_is_rejected_before_running() {
        let scenario = Scenario::builder()
            .name("bad")
            .action(|_: VuContext| async { Ok::<(), BoxError>(()) })
            .thresholds(Thresholds::parse([("iterations", vec!["p(95)<10"])]).unwrap())
            .build();
        let err = Runner::new(scenario, executor(vec![Stage::new(Duration::from_secs(1), 1)]))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidThreshold { .. }));

        let scenario = Scenario::builder()
            .name("bad")
            .action(|_: VuContext| async { Ok::<(), BoxError>(()) })
            .metrics(vec![("checks".to_string(), MetricKind::Trend)])
            .build();
        let err = Runner::new(scenario, executor(vec![Stage::new(Duration::from_secs(1), 1)]))
            .err()
            .unwrap();
        assert!(matches!(err, Error::MetricKindConflict { .. }));

        let scenario = Scenario::builder()
            .name("bad")
            .action(|_: VuContext| async { Ok::<(), BoxError>(()) })
            .build();
        assert!(Runner::new(scenario, executor(vec![])).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn phases_are_visited_in_order() {
        let scenario = Scenario::builder()
            .name("phases")
            .action(|ctx: VuContext| async move {
                ctx.sleep(Duration::from_millis(250)).await;
                Ok::<(), BoxError>(())
            })
            .build();
        let runner = Runner::new(
            scenario,
            executor(vec![
                Stage::new(Duration::from_secs(2), 4),
                Stage::new(Duration::from_secs(2), 0),
            ]),
        )
        .unwrap();
        let mut phases = runner.subscribe_phases();
        assert_eq!(runner.phase(), RunPhase::Idle);

        let result = runner.run().await;
        assert_eq!(result.status, RunStatus::Passed);

        let mut seen = vec![];
        while let Ok(phase) = phases.try_recv() {
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                RunPhase::Ramping,
                RunPhase::Draining,
                RunPhase::Finalizing,
                RunPhase::Done
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_kind_conflict_aborts_the_run() {
        let scenario = Scenario::builder()
            .name("conflict")
            .action(|ctx: VuContext| async move {
                ctx.add_trend("errors", 1.0);
                ctx.sleep(Duration::from_millis(100)).await;
                Ok::<(), BoxError>(())
            })
            .metrics(vec![("errors".to_string(), MetricKind::Rate)])
            .build();
        let runner = Runner::new(
            scenario,
            executor(vec![Stage::new(Duration::from_secs(30), 2)]),
        )
        .unwrap();
        let mut phases = runner.subscribe_phases();

        let result = runner.run().await;
        assert!(matches!(result.status, RunStatus::Aborted { .. }));
        assert_eq!(result.exit_code(), 108);
        assert!(result.thresholds.is_empty());
        assert!(result.duration < Duration::from_secs(30));

        let mut seen = vec![];
        while let Ok(phase) = phases.try_recv() {
            seen.push(phase);
        }
        assert_eq!(seen, vec![RunPhase::Ramping, RunPhase::Done]);
    }
}
