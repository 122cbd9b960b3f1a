//! Stampede, a virtual-user load-testing engine.
//!
//! A run drives a pool of virtual users (VUs) through a list of ramp
//! stages. Every VU loops over a user-supplied workload; each iteration
//! produces metric samples that land in a shared registry. When the schedule
//! is over the registry is frozen into aggregates, thresholds are evaluated
//! against them and the run ends with a pass/fail result and an exit code.
//!
//! # Architecture
//!
//! - [`Scenario`]: the [`Workload`] to run plus its tags, declared metrics
//!   and [`Thresholds`].
//! - [`Executor`]: decides when VUs are spawned and retired. The built-in
//!   [`StageExecutor`] interpolates the VU count between [`Stage`]s.
//! - [`VuContext`]: what a workload sees during one iteration: checks,
//!   custom metrics and think-time.
//! - [`MetricRegistry`]: thread-safe sink of counter, rate and trend samples.
//! - [`Runner`]: owns one run and walks it through
//!   `Idle -> Ramping -> Draining -> Finalizing -> Done`.
//! - [`RunResult`] and [`Reporter`]: the outcome of a run and where it goes.
//!
//! # Where to start
//!
//! Build a [`Scenario`] and a [`StageExecutor`] by hand, or load
//! [`RunOptions`] from YAML/JSON, then hand both to [`Runner::new`].
//! `demos/http.rs` is a complete HTTP load test.

/// Per-metric accumulation and final statistics
pub mod aggregate;
/// Run options from YAML or JSON
pub mod config;
/// Engine errors and result aliases
pub mod error;
/// Orchestrators that define how virtual users actually run
pub mod executor;
/// Samples and metric kinds
pub mod metric;
/// Thread-safe sink for metric samples
pub mod registry;
/// Run results and Reporters
pub mod report;
/// Run lifecycle
pub mod runner;
/// Workloads and the scenario that bundles them
pub mod scenario;
/// Pass/fail criteria over final aggregates
pub mod threshold;

pub use aggregate::{Aggregate, CounterSummary, RateSummary, TrendSummary};
pub use config::RunOptions;
pub use error::{BoxError, Error, Result};
pub use executor::{
    ExecutionContext, ExecutionSummary, Executor, Stage, StageExecutor, VuContext, VuState,
};
pub use metric::{MetricKind, MetricSample, Tags};
pub use registry::MetricRegistry;
pub use report::{JsonReporter, Reporter, RunResult, RunStatus, StdoutReporter};
pub use runner::{RunPhase, Runner};
pub use scenario::{IterationResult, Scenario, Workload};
pub use threshold::{Threshold, ThresholdOutcome, Thresholds};
