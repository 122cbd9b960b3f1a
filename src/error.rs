use std::path::PathBuf;

use thiserror::Error;

use crate::metric::MetricKind;

/// Boxed error a workload returns to mark an iteration as failed.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the engine itself.
///
/// Workload failures are never represented here: they are recorded as failed
/// observations and the run carries on. Everything below either stops a run
/// from starting (configuration) or aborts it (invariant violations).
#[derive(Debug, Error)]
pub enum Error {
    /// A threshold expression or metric key could not be parsed or does not
    /// apply to the metric it targets.
    #[error("invalid threshold `{expression}` on `{metric}`: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    /// A stage list that cannot be scheduled.
    #[error("invalid stage configuration: {0}")]
    InvalidStage(String),

    /// A time-span that is negative or malformed.
    #[error("invalid duration `{value}`: {reason}")]
    InvalidDuration { value: String, reason: String },

    /// A metric declared twice with two different kinds.
    #[error("metric `{name}` is a {existing} metric, cannot use it as a {requested}")]
    MetricKindConflict {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    /// A sample whose kind differs from the one its metric is bound to.
    #[error("sample for `{name}` is a {requested}, but the metric is a {existing} metric")]
    SampleKindConflict {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    /// A sample was recorded after the registry was frozen.
    #[error("metric `{0}` recorded after the registry was finalized")]
    RegistryFinalized(String),

    /// The registry was asked to finalize twice.
    #[error("metric registry already finalized")]
    AlreadyFinalized,

    /// A virtual user task died outside of its iteration guard.
    #[error("virtual user {ordinal} failed: {reason}")]
    VirtualUser { ordinal: usize, reason: String },

    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML options: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON options: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// `true` for errors detected before a run starts.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::InvalidThreshold { .. }
                | Error::InvalidStage(_)
                | Error::MetricKindConflict { .. }
                | Error::InvalidDuration { .. }
                | Error::Io { .. }
                | Error::Yaml(_)
                | Error::Json(_)
        )
    }
}
