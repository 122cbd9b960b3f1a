//! Virtual users: one independent task looping over the workload.
//!
//! Each iteration runs the workload to completion, then the samples it
//! produced, plus the built-in iteration metrics, are flushed to the registry
//! as one set. Workload errors and panics are recorded as failed iterations;
//! only registry invariant violations escape the loop.
use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    error::Result,
    metric::{self, MetricKind, MetricSample, Tags},
    registry::MetricRegistry,
    scenario::Workload,
};

/// Lifecycle of a virtual user as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum VuState {
    Spawned = 0,
    Running = 1,
    Sleeping = 2,
    Retiring = 3,
    Stopped = 4,
}

impl VuState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => VuState::Spawned,
            1 => VuState::Running,
            2 => VuState::Sleeping,
            3 => VuState::Retiring,
            _ => VuState::Stopped,
        }
    }
}

/// Shared state between a virtual user and the scheduler that owns it.
///
/// The scheduler only ever raises the retire flag; the virtual user reads it
/// at iteration boundaries.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    retire: AtomicBool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(VuState::Spawned as u8),
            retire: AtomicBool::new(false),
        }
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state. A retire request shows as `Retiring` until the user stops.
    pub fn state(&self) -> VuState {
        let state = VuState::from_u8(self.state.load(Ordering::Acquire));
        if state != VuState::Stopped && self.is_retiring() {
            VuState::Retiring
        } else {
            state
        }
    }

    /// Ask the virtual user to stop after its current iteration.
    pub fn retire(&self) {
        self.retire.store(true, Ordering::Release);
    }

    pub fn is_retiring(&self) -> bool {
        self.retire.load(Ordering::Acquire)
    }

    pub(super) fn set(&self, state: VuState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Capabilities handed to the workload for one iteration.
///
/// Cheap to clone; every clone writes into the same per-iteration buffer.
#[derive(Clone)]
pub struct VuContext {
    ordinal: usize,
    iteration: u64,
    tags: Arc<Tags>,
    lifecycle: Arc<Lifecycle>,
    samples: Arc<Mutex<Vec<MetricSample>>>,
}

impl VuContext {
    fn new(ordinal: usize, iteration: u64, tags: Arc<Tags>, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            ordinal,
            iteration,
            tags,
            lifecycle,
            samples: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Ordinal of the virtual user running this iteration.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Zero-based iteration number within this virtual user.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Tags every sample of this iteration carries.
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Record a named assertion in the built-in `checks` rate and return it.
    pub fn check(&self, name: &str, ok: bool) -> bool {
        let mut tags = Tags::new();
        tags.insert(metric::CHECK_TAG.to_string(), name.to_string());
        self.add_with_tags(metric::CHECKS, MetricKind::Rate, if ok { 1.0 } else { 0.0 }, tags);
        ok
    }

    /// Record a custom metric observation.
    pub fn add(&self, name: &str, kind: MetricKind, value: f64) {
        self.add_with_tags(name, kind, value, Tags::new());
    }

    /// Record a custom metric observation with extra tags.
    ///
    /// Extra tags override the iteration tags on key collisions. Non-finite
    /// values are dropped.
    pub fn add_with_tags(&self, name: &str, kind: MetricKind, value: f64, extra: Tags) {
        if !value.is_finite() {
            tracing::warn!("VU {} dropped non-finite sample for `{name}`", self.ordinal);
            return;
        }
        let mut tags = (*self.tags).clone();
        tags.extend(extra);
        self.samples
            .lock()
            .push(MetricSample::new(name, kind, value, tags));
    }

    pub fn add_counter(&self, name: &str, value: f64) {
        self.add(name, MetricKind::Counter, value);
    }

    pub fn add_rate(&self, name: &str, value: bool) {
        self.add(name, MetricKind::Rate, if value { 1.0 } else { 0.0 });
    }

    pub fn add_trend(&self, name: &str, value: f64) {
        self.add(name, MetricKind::Trend, value);
    }

    /// Think-time. Suspends only this virtual user.
    pub async fn sleep(&self, duration: Duration) {
        self.lifecycle.set(VuState::Sleeping);
        tokio::time::sleep(duration).await;
        self.lifecycle.set(VuState::Running);
    }

    fn take_samples(&self) -> Vec<MetricSample> {
        std::mem::take(&mut *self.samples.lock())
    }
}

/// One virtual user: identity, lifecycle and the registry it reports to.
pub struct VirtualUser {
    ordinal: usize,
    lifecycle: Arc<Lifecycle>,
    registry: Arc<MetricRegistry>,
    tags: Arc<Tags>,
}

impl VirtualUser {
    /// `scenario_tags` are extended with `vu=<ordinal>`.
    pub fn new(ordinal: usize, registry: Arc<MetricRegistry>, scenario_tags: &Tags) -> Self {
        let mut tags = scenario_tags.clone();
        tags.insert(metric::VU_TAG.to_string(), ordinal.to_string());
        Self {
            ordinal,
            lifecycle: Arc::new(Lifecycle::new()),
            registry,
            tags: Arc::new(tags),
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Loop over the workload until retired. Returns the iteration count.
    pub async fn run<W: Workload>(self, workload: Arc<W>) -> Result<u64> {
        tracing::debug!("VU {} started.", self.ordinal);
        let result = self.iterate(workload.as_ref()).await;
        self.lifecycle.set(VuState::Stopped);
        match &result {
            Ok(n) => tracing::debug!("VU {} stopped after {n} iterations.", self.ordinal),
            Err(e) => tracing::error!("VU {} stopped on a fatal error: {e}", self.ordinal),
        }
        result
    }

    async fn iterate<W: Workload>(&self, workload: &W) -> Result<u64> {
        let mut iterations = 0;
        while !self.lifecycle.is_retiring() {
            self.lifecycle.set(VuState::Running);
            let ctx = VuContext::new(
                self.ordinal,
                iterations,
                Arc::clone(&self.tags),
                Arc::clone(&self.lifecycle),
            );

            let started = Instant::now();
            let outcome = AssertUnwindSafe(workload.iteration(ctx.clone()))
                .catch_unwind()
                .await;
            let elapsed = started.elapsed();

            let failed = match outcome {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    tracing::debug!("VU {} iteration {iterations} failed: {e}", self.ordinal);
                    true
                }
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::warn!("VU {} iteration {iterations} panicked: {msg}", self.ordinal);
                    true
                }
            };

            self.flush(ctx.take_samples(), elapsed, failed)?;
            iterations += 1;
            // a workload that never awaits must not starve the scheduler
            tokio::task::yield_now().await;
        }
        Ok(iterations)
    }

    /// Append the iteration's samples followed by the built-in metrics.
    fn flush(&self, samples: Vec<MetricSample>, elapsed: Duration, failed: bool) -> Result<()> {
        for sample in &samples {
            self.registry.record_sample(sample)?;
        }
        let tags = self.tags.as_ref();
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.registry
            .record(metric::ITERATIONS, MetricKind::Counter, 1.0, tags)?;
        self.registry
            .record(metric::ITERATION_DURATION, MetricKind::Trend, ms, tags)?;
        self.registry.record(
            metric::ITERATION_ERRORS,
            MetricKind::Rate,
            if failed { 1.0 } else { 0.0 },
            tags,
        )
    }
}
