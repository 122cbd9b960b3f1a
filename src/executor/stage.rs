use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use typed_builder::TypedBuilder;

use super::{ExecutionContext, ExecutionSummary, Executor, Lifecycle, VirtualUser, VuState};
use crate::{
    error::{Error, Result},
    scenario::Workload,
};

/// Default interval between two reconciliations of the pool.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// A stage ramps the virtual-user count linearly to `target` over `duration`.
///
/// Use `Stage::new(Duration::from_secs(60), 20)` to ramp to 20 VUs over a
/// minute. A zero `duration` jumps to `target` right away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "crate::config::human_duration")]
    pub duration: Duration,
    /// Virtual users
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Target virtual-user count as a function of time since the run started.
///
/// Targets are interpolated linearly inside a stage and rounded to the nearest
/// whole user. A stage's end is inclusive, so its declared target is reached
/// exactly at its boundary. A zero-duration stage takes effect at the boundary
/// it sits on and wins over the stage ending there.
#[derive(Clone, Debug)]
pub struct Schedule {
    stages: Vec<Stage>,
    start_vus: usize,
    total: Duration,
}

impl Schedule {
    pub fn new(stages: Vec<Stage>, start_vus: usize) -> Self {
        let total = stages.iter().map(|s| s.duration).sum();
        Self {
            stages,
            start_vus,
            total,
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Un-rounded target at `elapsed`.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let mut from = self.start_vus as f64;
        let mut start = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            let to = stage.target as f64;
            let end = start + stage.duration;
            if !stage.duration.is_zero() {
                // a zero-duration stage right after takes over the shared boundary
                let jump_next = self
                    .stages
                    .get(i + 1)
                    .is_some_and(|next| next.duration.is_zero());
                if elapsed < end || (elapsed == end && !jump_next) {
                    let progress = elapsed.saturating_sub(start).as_secs_f64()
                        / stage.duration.as_secs_f64();
                    return from + (to - from) * progress;
                }
            }
            from = to;
            start = end;
        }
        from
    }

    /// Rounded target at `elapsed`.
    pub fn desired_vus(&self, elapsed: Duration) -> usize {
        self.target_at(elapsed).round().max(0.0) as usize
    }

    /// Index of the stage running at `elapsed`, skipping zero-duration stages.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let mut end = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            end += stage.duration;
            if !stage.duration.is_zero() && elapsed < end {
                return Some(i);
            }
        }
        None
    }

    /// `true` once nothing is left to run: the schedule has elapsed, or the
    /// target is zero now and stays zero until the end.
    pub fn is_complete(&self, elapsed: Duration) -> bool {
        if elapsed >= self.total {
            return true;
        }
        if self.desired_vus(elapsed) > 0 {
            return false;
        }
        let mut end = Duration::ZERO;
        self.stages.iter().all(|stage| {
            end += stage.duration;
            end <= elapsed || stage.target == 0
        })
    }
}

/// Executor that follows ramp stages with a pool of virtual users.
///
/// - Every `tick` the schedule is sampled and the pool reconciled: missing
///   users are spawned with fresh ordinals, surplus users (highest ordinals
///   first) are asked to retire after their current iteration.
/// - Once the schedule ends every user is retired and the executor waits for
///   them, at most `graceful_stop` if set.
#[derive(Clone, Debug, TypedBuilder)]
pub struct StageExecutor {
    pub stages: Vec<Stage>,
    #[builder(default = DEFAULT_TICK)]
    pub tick: Duration,
    /// Users spawned before the first stage starts ramping.
    #[builder(default = 0)]
    pub start_vus: usize,
    /// Upper bound on the pool, retiring users included.
    #[builder(default, setter(strip_option))]
    pub max_vus: Option<usize>,
    /// How long retiring users may take to finish before they are interrupted.
    #[builder(default, setter(strip_option))]
    pub graceful_stop: Option<Duration>,
}

impl StageExecutor {
    pub fn schedule(&self) -> Schedule {
        Schedule::new(self.stages.clone(), self.start_vus)
    }
}

impl Executor for StageExecutor {
    fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::InvalidStage("at least one stage is required".into()));
        }
        if self.tick.is_zero() {
            return Err(Error::InvalidStage("tick must be greater than zero".into()));
        }
        if self.max_vus == Some(0) {
            return Err(Error::InvalidStage("max_vus must be at least 1".into()));
        }
        Ok(())
    }

    async fn exec<W: Workload>(
        &self,
        workload: Arc<W>,
        ctx: ExecutionContext,
    ) -> Result<ExecutionSummary> {
        self.validate()?;
        let schedule = self.schedule();
        let mut pool = VuPool::new(workload, ctx.clone(), self.max_vus);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            "Running {} stages over {}...",
            self.stages.len(),
            humantime::format_duration(schedule.total_duration())
        );
        let started = Instant::now();
        let mut current_stage = None;
        loop {
            ticker.tick().await;
            if let Err(e) = pool.reap().await {
                pool.interrupt_all().await;
                return Err(e);
            }
            let elapsed = started.elapsed();
            if schedule.is_complete(elapsed) {
                break;
            }

            let stage = schedule.stage_at(elapsed);
            if stage != current_stage {
                if let Some(i) = stage {
                    let s = &self.stages[i];
                    tracing::info!(
                        "Stage {}/{}: {} VUs over {}",
                        i + 1,
                        self.stages.len(),
                        s.target,
                        humantime::format_duration(s.duration)
                    );
                }
                current_stage = stage;
            }

            pool.reconcile(schedule.desired_vus(elapsed));
            ctx.publish_vus(pool.len());
        }

        tracing::info!("Schedule done, draining {} VUs...", pool.len());
        ctx.enter_draining();
        pool.retire_all();
        let deadline = self.graceful_stop.map(|g| Instant::now() + g);
        while !pool.is_empty() {
            ticker.tick().await;
            if let Err(e) = pool.reap().await {
                pool.interrupt_all().await;
                return Err(e);
            }
            if !pool.is_empty() && deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!(
                    "Graceful stop elapsed, interrupting {} VUs mid-iteration",
                    pool.len()
                );
                pool.interrupt_all().await;
            }
            ctx.publish_vus(pool.len());
        }

        ctx.publish_vus(0);
        tracing::info!("All VUs stopped!");
        Ok(pool.summary)
    }
}

struct VuHandle {
    lifecycle: Arc<Lifecycle>,
    task: JoinHandle<Result<u64>>,
}

/// Live virtual users keyed by ordinal.
struct VuPool<W> {
    workload: Arc<W>,
    ctx: ExecutionContext,
    max_vus: Option<usize>,
    users: BTreeMap<usize, VuHandle>,
    next_ordinal: usize,
    summary: ExecutionSummary,
}

impl<W: Workload> VuPool<W> {
    fn new(workload: Arc<W>, ctx: ExecutionContext, max_vus: Option<usize>) -> Self {
        Self {
            workload,
            ctx,
            max_vus,
            users: BTreeMap::new(),
            next_ordinal: 0,
            summary: ExecutionSummary::default(),
        }
    }

    fn len(&self) -> usize {
        self.users.len()
    }

    fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Spawn or retire users until `desired` of them are not retiring.
    fn reconcile(&mut self, desired: usize) {
        let live = self
            .users
            .values()
            .filter(|u| !u.lifecycle.is_retiring())
            .count();

        if live < desired {
            for _ in live..desired {
                if self.max_vus.is_some_and(|max| self.users.len() >= max) {
                    tracing::warn!(
                        "Cannot spawn VU: pool is at max_vus ({}), retrying next tick",
                        self.users.len()
                    );
                    break;
                }
                self.spawn();
            }
        } else if live > desired {
            for (ordinal, user) in self
                .users
                .iter()
                .rev()
                .filter(|(_, u)| !u.lifecycle.is_retiring())
                .take(live - desired)
            {
                tracing::debug!("Retiring VU {ordinal}");
                user.lifecycle.retire();
            }
        }
        self.summary.vus_peak = self.summary.vus_peak.max(self.users.len());
    }

    fn spawn(&mut self) {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        let vu = VirtualUser::new(ordinal, Arc::clone(&self.ctx.registry), &self.ctx.tags);
        let lifecycle = vu.lifecycle();
        let task = tokio::spawn(vu.run(Arc::clone(&self.workload)));
        self.users.insert(ordinal, VuHandle { lifecycle, task });
        self.summary.vus_spawned += 1;
        tracing::debug!("Spawned VU {ordinal}");
    }

    fn retire_all(&self) {
        self.users.values().for_each(|u| u.lifecycle.retire());
    }

    /// Collect users whose task has ended. A fatal error in any of them is returned.
    async fn reap(&mut self) -> Result<()> {
        let finished: Vec<usize> = self
            .users
            .iter()
            .filter(|(_, u)| u.task.is_finished())
            .map(|(ordinal, _)| *ordinal)
            .collect();

        let mut fatal = None;
        for ordinal in finished {
            let Some(user) = self.users.remove(&ordinal) else {
                continue;
            };
            match user.task.await {
                Ok(Ok(iterations)) => self.summary.iterations += iterations,
                Ok(Err(e)) => {
                    fatal.get_or_insert(e);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    fatal.get_or_insert(Error::VirtualUser {
                        ordinal,
                        reason: e.to_string(),
                    });
                }
            }
        }
        fatal.map_or(Ok(()), Err)
    }

    /// Abort every remaining user and wait for the tasks to wind down.
    async fn interrupt_all(&mut self) {
        let users = std::mem::take(&mut self.users);
        for user in users.values() {
            user.task.abort();
        }
        for (ordinal, user) in users {
            match user.task.await {
                Ok(Ok(iterations)) => self.summary.iterations += iterations,
                Ok(Err(e)) => tracing::error!("VU {ordinal} failed while interrupted: {e}"),
                Err(_) => {
                    user.lifecycle.set(VuState::Stopped);
                    self.summary.vus_interrupted += 1;
                    tracing::debug!("Interrupted VU {ordinal}");
                }
            }
        }
    }
}
