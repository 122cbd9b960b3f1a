use std::future::Future;

use typed_builder::TypedBuilder;

use crate::{
    error::BoxError,
    executor::VuContext,
    metric::{MetricKind, Tags},
    threshold::Thresholds,
};

/// What one iteration of a workload resolves to. An `Err` marks the
/// iteration as failed in `iteration_errors`; it never stops the run.
pub type IterationResult = std::result::Result<(), BoxError>;

/// The user-supplied body every virtual user runs in a loop.
///
/// Any `Fn(VuContext) -> impl Future<Output = IterationResult>` closure is a
/// workload:
///
/// ```rust
/// use std::time::Duration;
/// use stampede::{BoxError, VuContext, Workload};
///
/// fn assert_workload<W: Workload>(_: W) {}
///
/// assert_workload(|ctx: VuContext| async move {
///     ctx.check("always", true);
///     ctx.sleep(Duration::from_millis(10)).await;
///     Ok::<(), BoxError>(())
/// });
/// ```
pub trait Workload: Send + Sync + 'static {
    fn iteration(&self, ctx: VuContext) -> impl Future<Output = IterationResult> + Send;
}

impl<F, Fut> Workload for F
where
    F: Fn(VuContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = IterationResult> + Send,
{
    fn iteration(&self, ctx: VuContext) -> impl Future<Output = IterationResult> + Send {
        self(ctx)
    }
}

/// A named workload together with the metrics and thresholds it is judged by.
#[derive(TypedBuilder)]
pub struct Scenario<W> {
    #[builder(setter(into))]
    pub name: String,
    pub action: W,
    /// Tags added to every sample of the run.
    #[builder(default)]
    pub tags: Tags,
    /// Custom metrics declared up front so they exist even without samples.
    #[builder(default)]
    pub metrics: Vec<(String, MetricKind)>,
    #[builder(default)]
    pub thresholds: Thresholds,
}
