//! Metric registry: the one structure every virtual user writes into.
//!
//! Lookups go through a read-mostly map and every metric carries its own
//! mutex, so writers of different metrics never contend with each other and
//! writers of the same metric only hold the lock for a push or an add. The
//! map's write lock is only taken when a metric is first seen and when the
//! registry is finalized, which also fences out any in-flight `record`.
use std::{collections::BTreeMap, collections::HashMap, fmt::Write as _};

use parking_lot::{Mutex, RwLock};

use crate::{
    aggregate::{Accumulator, Aggregate},
    error::{Error, Result},
    metric::{MetricKind, MetricSample, Tags},
};

/// Render a metric key with an optional tag selector, e.g.
/// `http_req_duration{name:GET_/api/health}`.
pub fn metric_key(name: &str, selector: &Tags) -> String {
    if selector.is_empty() {
        return name.to_string();
    }
    let mut key = format!("{name}{{");
    for (i, (k, v)) in selector.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        let _ = write!(key, "{k}:{v}");
    }
    key.push('}');
    key
}

struct SubMetric {
    selector: Tags,
    accumulator: Mutex<Accumulator>,
}

struct MetricEntry {
    kind: MetricKind,
    accumulator: Mutex<Accumulator>,
    submetrics: Vec<SubMetric>,
}

impl SubMetric {
    fn new(kind: MetricKind, selector: Tags) -> Self {
        Self {
            selector,
            accumulator: Mutex::new(Accumulator::new(kind)),
        }
    }
}

impl MetricEntry {
    fn new(kind: MetricKind, selectors: Vec<Tags>) -> Self {
        Self {
            kind,
            accumulator: Mutex::new(Accumulator::new(kind)),
            submetrics: selectors
                .into_iter()
                .map(|selector| SubMetric::new(kind, selector))
                .collect(),
        }
    }
}

#[derive(Default)]
struct Inner {
    metrics: HashMap<String, MetricEntry>,
    /// Sub-metric selectors registered before their parent metric exists.
    pending: HashMap<String, Vec<Tags>>,
    finalized: bool,
}

/// Thread-safe sink for the samples of a single run.
///
/// Create one per run, share it behind an `Arc`, and call
/// [`MetricRegistry::finalize`] exactly once after every writer has stopped.
#[derive(Default)]
pub struct MetricRegistry {
    inner: RwLock<Inner>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `name` with `kind` ahead of any sample.
    ///
    /// Declaring the same name twice with the same kind is a no-op; with a
    /// different kind it is an error.
    pub fn define(&self, name: &str, kind: MetricKind) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.finalized {
            return Err(Error::RegistryFinalized(name.to_string()));
        }
        match inner.metrics.get(name).map(|e| e.kind) {
            Some(existing) if existing != kind => Err(Error::MetricKindConflict {
                name: name.to_string(),
                existing,
                requested: kind,
            }),
            Some(_) => Ok(()),
            None => {
                let selectors = inner.pending.remove(name).unwrap_or_default();
                inner
                    .metrics
                    .insert(name.to_string(), MetricEntry::new(kind, selectors));
                Ok(())
            }
        }
    }

    /// Kind `name` is bound to, if it has been declared or recorded.
    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.inner.read().metrics.get(name).map(|e| e.kind)
    }

    /// Track a filtered view of `name` holding only samples whose tags
    /// contain `selector`. Must be called before samples are recorded.
    pub fn track_submetric(&self, name: &str, selector: Tags) {
        if selector.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        match inner.metrics.get_mut(name) {
            Some(entry) => {
                if entry.submetrics.iter().any(|s| s.selector == selector) {
                    return;
                }
                let kind = entry.kind;
                entry.submetrics.push(SubMetric::new(kind, selector));
            }
            None => {
                let pending = inner.pending.entry(name.to_string()).or_default();
                if !pending.contains(&selector) {
                    pending.push(selector);
                }
            }
        }
    }

    /// Append one observation.
    ///
    /// Fails if the registry has been finalized or if `name` is already bound
    /// to a different kind. Both are run-fatal invariant violations.
    pub fn record(&self, name: &str, kind: MetricKind, value: f64, tags: &Tags) -> Result<()> {
        {
            let inner = self.inner.read();
            if inner.finalized {
                return Err(Error::RegistryFinalized(name.to_string()));
            }
            if let Some(entry) = inner.metrics.get(name) {
                return Self::record_into(entry, name, kind, value, tags);
            }
        }

        // First sample of an undeclared metric. Losing a race to a writer of
        // another kind is a sample conflict, not a declaration one.
        self.define(name, kind).map_err(|e| match e {
            Error::MetricKindConflict {
                name,
                existing,
                requested,
            } => Error::SampleKindConflict {
                name,
                existing,
                requested,
            },
            other => other,
        })?;
        let inner = self.inner.read();
        if inner.finalized {
            return Err(Error::RegistryFinalized(name.to_string()));
        }
        match inner.metrics.get(name) {
            Some(entry) => Self::record_into(entry, name, kind, value, tags),
            None => Err(Error::RegistryFinalized(name.to_string())),
        }
    }

    /// Append a sample produced by a virtual user.
    pub fn record_sample(&self, sample: &MetricSample) -> Result<()> {
        self.record(&sample.name, sample.kind, sample.value, &sample.tags)
    }

    fn record_into(
        entry: &MetricEntry,
        name: &str,
        kind: MetricKind,
        value: f64,
        tags: &Tags,
    ) -> Result<()> {
        if entry.kind != kind {
            return Err(Error::SampleKindConflict {
                name: name.to_string(),
                existing: entry.kind,
                requested: kind,
            });
        }
        entry.accumulator.lock().consume(value);
        for sub in &entry.submetrics {
            if sub.selector.iter().all(|(k, v)| tags.get(k) == Some(v)) {
                sub.accumulator.lock().consume(value);
            }
        }
        Ok(())
    }

    /// Freeze the registry and derive every aggregate.
    ///
    /// Sub-metrics are reported under their rendered key
    /// (`name{tag:value}`). Any later `record` or `finalize` is an error.
    pub fn finalize(&self) -> Result<BTreeMap<String, Aggregate>> {
        let mut inner = self.inner.write();
        if inner.finalized {
            return Err(Error::AlreadyFinalized);
        }
        inner.finalized = true;

        let mut aggregates = BTreeMap::new();
        for (name, entry) in inner.metrics.drain() {
            for sub in entry.submetrics {
                aggregates.insert(
                    metric_key(&name, &sub.selector),
                    sub.accumulator.into_inner().finish(),
                );
            }
            aggregates.insert(name, entry.accumulator.into_inner().finish());
        }
        inner.pending.clear();
        tracing::debug!("Finalized {} metric aggregates", aggregates.len());
        Ok(aggregates)
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.read().finalized
    }
}
