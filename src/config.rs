//! Run options loaded from YAML or JSON.
//!
//! Durations accept humantime strings (`"1m"`, `"1m 30s"`, `"250ms"`) or a
//! plain number of seconds.
//!
//! ```yaml
//! stages:
//!   - { duration: 1m, target: 20 }
//!   - { duration: 3m, target: 20 }
//!   - { duration: 1m, target: 0 }
//! gracefulStop: 30s
//! thresholds:
//!   errors: rate<0.01
//!   http_req_duration:
//!     - p(95)<800
//!     - { threshold: "p(99)<1500", abortOnFail: true }
//! metrics:
//!   errors: rate
//! ```
use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    executor::{Executor, Stage, StageExecutor, stage::DEFAULT_TICK},
    metric::{MetricKind, Tags},
    scenario::{Scenario, Workload},
    threshold::{Threshold, Thresholds},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunOptions {
    pub stages: Vec<Stage>,
    #[serde(default, rename = "startVUs")]
    pub start_vus: usize,
    #[serde(default, rename = "maxVUs", skip_serializing_if = "Option::is_none")]
    pub max_vus: Option<usize>,
    #[serde(default, with = "human_duration::option", skip_serializing_if = "Option::is_none")]
    pub tick: Option<Duration>,
    #[serde(default, with = "human_duration::option", skip_serializing_if = "Option::is_none")]
    pub graceful_stop: Option<Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub thresholds: BTreeMap<String, ThresholdOptions>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, MetricKind>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: Tags,
}

/// One expression or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdOptions {
    One(String),
    Many(Vec<ThresholdEntry>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expr(String),
    Detailed {
        threshold: String,
        #[serde(default, rename = "abortOnFail")]
        abort_on_fail: bool,
    },
}

impl ThresholdOptions {
    fn entries(&self) -> Vec<(&str, bool)> {
        match self {
            ThresholdOptions::One(expr) => vec![(expr.as_str(), false)],
            ThresholdOptions::Many(entries) => entries
                .iter()
                .map(|e| match e {
                    ThresholdEntry::Expr(expr) => (expr.as_str(), false),
                    ThresholdEntry::Detailed {
                        threshold,
                        abort_on_fail,
                    } => (threshold.as_str(), *abort_on_fail),
                })
                .collect(),
        }
    }
}

impl RunOptions {
    /// Load from a file, as JSON when it ends in `.json` and YAML otherwise.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&raw)
        } else {
            Self::from_yaml_str(&raw)
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let options: Self = serde_yaml::from_str(raw)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(raw)?;
        options.validate()?;
        Ok(options)
    }

    /// Reject options that could not drive a run.
    pub fn validate(&self) -> Result<()> {
        self.stage_executor().validate()?;
        self.thresholds()?;
        Ok(())
    }

    pub fn stage_executor(&self) -> StageExecutor {
        StageExecutor {
            stages: self.stages.clone(),
            tick: self.tick.unwrap_or(DEFAULT_TICK),
            start_vus: self.start_vus,
            max_vus: self.max_vus,
            graceful_stop: self.graceful_stop,
        }
    }

    pub fn thresholds(&self) -> Result<Thresholds> {
        let mut thresholds = Thresholds::default();
        for (key, options) in &self.thresholds {
            for (expr, abort_on_fail) in options.entries() {
                thresholds.push(Threshold::parse(key, expr)?.with_abort_on_fail(abort_on_fail));
            }
        }
        Ok(thresholds)
    }

    pub fn metric_declarations(&self) -> Vec<(String, MetricKind)> {
        self.metrics
            .iter()
            .map(|(name, kind)| (name.clone(), *kind))
            .collect()
    }

    /// Bundle `action` with the declared metrics, thresholds and tags.
    pub fn scenario<W: Workload>(&self, name: impl Into<String>, action: W) -> Result<Scenario<W>> {
        Ok(Scenario::builder()
            .name(name)
            .action(action)
            .tags(self.tags.clone())
            .metrics(self.metric_declarations())
            .thresholds(self.thresholds()?)
            .build())
    }
}

/// Parse a humantime span such as `"1m 30s"`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).map_err(|e| Error::InvalidDuration {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Serde adapter for `Duration` fields written as humantime strings or seconds.
pub(crate) mod human_duration {
    use std::{fmt, time::Duration};

    use serde::{
        Deserialize, Deserializer, Serializer,
        de::{self, Visitor},
    };

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        d.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration like \"1m 30s\" or a non-negative number of seconds")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom(format!("negative duration `{v}`")))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            Duration::try_from_secs_f64(v).map_err(|_| {
                E::custom(format!(
                    "invalid duration `{v}`: must be finite and non-negative"
                ))
            })
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(E::custom)
        }
    }

    struct Human(Duration);

    impl<'de> Deserialize<'de> for Human {
        fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
            deserialize(d).map(Human)
        }
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.collect_str(&humantime::format_duration(*d)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<Human>::deserialize(d)?.map(|h| h.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOAD_TEST: &str = r#"
stages:
  - { duration: 1m, target: 20 }
  - { duration: 3m, target: 20 }
  - { duration: 1m, target: 0 }
thresholds:
  errors: rate<0.01
  http_req_duration: ["p(95)<800"]
metrics:
  errors: rate
  ttfb: trend
"#;

    #[test]
    fn parses_a_staged_load_test() {
        let options = RunOptions::from_yaml_str(LOAD_TEST).unwrap();
        assert_eq!(
            options.stages,
            vec![
                Stage::new(Duration::from_secs(60), 20),
                Stage::new(Duration::from_secs(180), 20),
                Stage::new(Duration::from_secs(60), 0),
            ]
        );
        let executor = options.stage_executor();
        assert_eq!(executor.tick, DEFAULT_TICK);
        assert_eq!(executor.graceful_stop, None);

        let thresholds = options.thresholds().unwrap();
        assert_eq!(thresholds.len(), 2);
        assert_eq!(
            options.metric_declarations(),
            vec![
                ("errors".to_string(), MetricKind::Rate),
                ("ttfb".to_string(), MetricKind::Trend)
            ]
        );
    }

    #[test]
    fn durations_accept_seconds_and_humantime() {
        let options = RunOptions::from_yaml_str(
            "stages: [{ duration: 90, target: 1 }, { duration: 0.5, target: 1 }]
tick: 250ms
gracefulStop: 2s",
        )
        .unwrap();
        assert_eq!(options.stages[0].duration, Duration::from_secs(90));
        assert_eq!(options.stages[1].duration, Duration::from_millis(500));
        assert_eq!(options.tick, Some(Duration::from_millis(250)));
        assert_eq!(options.graceful_stop, Some(Duration::from_secs(2)));
    }

    #[test]
    fn negative_and_malformed_durations_are_rejected() {
        assert!(RunOptions::from_yaml_str("stages: [{ duration: -5, target: 1 }]").is_err());
        assert!(RunOptions::from_yaml_str("stages: [{ duration: -0.5, target: 1 }]").is_err());
        let err = RunOptions::from_yaml_str("stages: [{ duration: soon, target: 1 }]").unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("invalid duration `soon`"));
        assert!(matches!(parse_duration("-1s"), Err(Error::InvalidDuration { .. })));
    }

    #[test]
    fn abort_on_fail_entries_are_carried() {
        let options = RunOptions::from_json_str(
            r#"{
                "stages": [{"duration": "10s", "target": 2}],
                "thresholds": {
                    "http_req_duration{name:health}": [
                        "p(95)<800",
                        {"threshold": "p(99)<1500", "abortOnFail": true}
                    ]
                }
            }"#,
        )
        .unwrap();
        let thresholds = options.thresholds().unwrap();
        let flags: Vec<bool> = thresholds.iter().map(|t| t.abort_on_fail).collect();
        assert_eq!(flags, vec![false, true]);
        assert!(thresholds.iter().all(|t| t.key() == "http_req_duration{name:health}"));
    }

    #[test]
    fn invalid_options_fail_validation() {
        let err = RunOptions::from_yaml_str("stages: []").unwrap_err();
        assert!(matches!(err, Error::InvalidStage(_)));

        let err = RunOptions::from_yaml_str(
            "stages: [{ duration: 1s, target: 1 }]\nthresholds: { errors: 'rate<<1' }",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidThreshold { .. }));

        let err =
            RunOptions::from_yaml_str("stages: [{ duration: 1s, target: 1 }]\nvus: 3").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn from_file_picks_the_format_by_extension() {
        let dir = std::env::temp_dir();
        let yaml = dir.join(format!("stampede-options-{}.yaml", std::process::id()));
        let json = dir.join(format!("stampede-options-{}.json", std::process::id()));
        std::fs::write(&yaml, LOAD_TEST).unwrap();
        std::fs::write(&json, r#"{"stages":[{"duration":"1m","target":5}],"startVUs":2}"#).unwrap();

        assert_eq!(RunOptions::from_file(&yaml).unwrap().stages.len(), 3);
        assert_eq!(RunOptions::from_file(&json).unwrap().start_vus, 2);
        let missing = RunOptions::from_file(dir.join("stampede-does-not-exist.yaml")).unwrap_err();
        assert!(matches!(missing, Error::Io { .. }));

        std::fs::remove_file(yaml).unwrap();
        std::fs::remove_file(json).unwrap();
    }

    #[test]
    fn options_round_trip_through_yaml() {
        let options = RunOptions::from_yaml_str(LOAD_TEST).unwrap();
        let yaml = serde_yaml::to_string(&options).unwrap();
        assert_eq!(RunOptions::from_yaml_str(&yaml).unwrap(), options);
    }
}
