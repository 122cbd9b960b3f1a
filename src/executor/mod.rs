//! Executor: drives virtual users over time.
//!
//! The [`Executor`] trait is the runtime that executes a scenario's workload.
//! The built-in [`StageExecutor`] grows and shrinks a pool of
//! [`VirtualUser`]s following a list of [`Stage`]s.
pub mod stage;
pub mod vu;

pub use stage::{Schedule, Stage, StageExecutor};
pub use vu::{Lifecycle, VirtualUser, VuContext, VuState};

use std::{future::Future, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    error::Result,
    metric::Tags,
    registry::MetricRegistry,
    runner::{PhaseSignal, RunPhase},
    scenario::Workload,
};

/// The runtime hook that executes a workload.
///
/// Implementations own the virtual users: they decide when to spawn and
/// retire them, and they must not return before every virtual user they
/// spawned has stopped. When the time-driven part of the run is over they
/// call [`ExecutionContext::enter_draining`].
pub trait Executor: Send + Sync {
    /// Reject a configuration before anything runs.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Run `workload` to completion.
    ///
    /// An `Err` is a run-fatal invariant violation and aborts the run.
    fn exec<W: Workload>(
        &self,
        workload: Arc<W>,
        ctx: ExecutionContext,
    ) -> impl Future<Output = Result<ExecutionSummary>> + Send;
}

/// Everything an executor shares with the run it belongs to.
#[derive(Clone)]
pub struct ExecutionContext {
    pub registry: Arc<MetricRegistry>,
    /// Scenario-level tags every sample carries.
    pub tags: Tags,
    phase: PhaseSignal,
    vus: Arc<watch::Sender<usize>>,
}

impl ExecutionContext {
    /// A context detached from any runner, for driving an executor directly.
    pub fn new(registry: Arc<MetricRegistry>, tags: Tags) -> Self {
        let (vus, _) = watch::channel(0);
        let phase = PhaseSignal::new();
        phase.advance(RunPhase::Ramping);
        Self::with_signals(registry, tags, phase, Arc::new(vus))
    }

    pub(crate) fn with_signals(
        registry: Arc<MetricRegistry>,
        tags: Tags,
        phase: PhaseSignal,
        vus: Arc<watch::Sender<usize>>,
    ) -> Self {
        Self {
            registry,
            tags,
            phase,
            vus,
        }
    }

    /// The schedule has elapsed; no more virtual users will be spawned.
    pub fn enter_draining(&self) {
        self.phase.advance(RunPhase::Draining);
    }

    pub fn phase(&self) -> RunPhase {
        self.phase.current()
    }

    /// Publish the current number of live virtual users.
    pub fn publish_vus(&self, live: usize) {
        self.vus.send_replace(live);
    }

    pub fn subscribe_vus(&self) -> watch::Receiver<usize> {
        self.vus.subscribe()
    }
}

/// What an executor reports back once every virtual user has stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Iterations completed across all virtual users.
    pub iterations: u64,
    /// Virtual users spawned over the whole run.
    pub vus_spawned: usize,
    /// Largest pool size observed.
    pub vus_peak: usize,
    /// Virtual users aborted mid-iteration after the graceful stop ran out.
    pub vus_interrupted: usize,
}
