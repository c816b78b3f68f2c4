use serde::{Deserialize, Serialize};

use crate::clock::NS_PER_SEC;

/// One subscriber's validated configuration: which atoms to aggregate, how,
/// and under what resource limits.
///
/// Parsing and schema validation happen upstream; this crate receives the
/// already-decoded form and only re-checks the invariants it depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsdConfig {
    pub id: i64,

    #[serde(default)]
    pub metrics: Vec<MetricConfig>,

    /// Lifetime of the config before it is reset from its disk backup.
    /// Zero means no TTL.
    #[serde(default)]
    pub ttl_ns: i64,

    /// Package allowed to query this config's restricted data. Presence
    /// makes every metric in the config restricted.
    #[serde(default)]
    pub restricted_metrics_delegate: Option<String>,

    /// Keep a local copy of erased reports under the history directory.
    #[serde(default)]
    pub persist_local_history: bool,

    /// Whether reports are persisted on shutdown/update paths.
    #[serde(default = "default_true")]
    pub write_to_disk: bool,

    /// Hard cap: above this the config's data is dropped, not flushed.
    #[serde(default = "default_max_metrics_bytes")]
    pub max_metrics_bytes: usize,

    /// Soft cap: above this a broadcast asks the subscriber to pull data.
    #[serde(default = "default_trigger_get_data_bytes")]
    pub trigger_get_data_bytes: usize,

    /// How many bytes of each package certificate hash reports carry.
    #[serde(default = "default_certificate_hash_bytes")]
    pub certificate_hash_bytes: usize,

    /// TTL for rows in the restricted database.
    #[serde(default = "default_restricted_ttl_ns")]
    pub restricted_data_ttl_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Count,
    Duration,
    Value,
    Gauge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConfig {
    pub id: i64,
    pub kind: MetricKind,
    pub atom_id: i32,

    /// Atom that closes an open slice. Duration metrics only.
    #[serde(default)]
    pub stop_atom_id: Option<i32>,

    /// 1-indexed field the value is read from. Value and gauge metrics.
    #[serde(default)]
    pub value_field: Option<usize>,

    /// 1-indexed string field used as the dimension key.
    #[serde(default)]
    pub dimension_field: Option<usize>,

    #[serde(default = "default_bucket_size_ns")]
    pub bucket_size_ns: i64,

    #[serde(default)]
    pub activation: Option<ActivationConfig>,

    #[serde(default)]
    pub condition: Option<ConditionConfig>,

    #[serde(default)]
    pub alert: Option<AlertConfig>,
}

/// Gates a metric on cross-cutting device state.
///
/// The metric only aggregates while the referenced state atom's current
/// value matches `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub state_atom_id: i32,
    pub value: i32,

    /// 1-indexed field of the metric's atom whose value selects the state
    /// group. Absent means the ungrouped state (group 0).
    #[serde(default)]
    pub link_field: Option<usize>,
}

/// Makes a metric dormant until its activation atom arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationConfig {
    pub atom_id: i32,
    pub ttl_ns: i64,
}

/// Threshold alert evaluated against a metric's full-bucket count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub id: i64,
    pub threshold: i64,
    #[serde(default)]
    pub refractory_sec: i64,
}

fn default_true() -> bool {
    true
}

fn default_max_metrics_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_trigger_get_data_bytes() -> usize {
    192 * 1024
}

fn default_certificate_hash_bytes() -> usize {
    8
}

fn default_bucket_size_ns() -> i64 {
    300 * NS_PER_SEC
}

fn default_restricted_ttl_ns() -> i64 {
    90 * 24 * 3600 * NS_PER_SEC
}

impl Default for StatsdConfig {
    fn default() -> Self {
        Self {
            id: 0,
            metrics: Vec::new(),
            ttl_ns: 0,
            restricted_metrics_delegate: None,
            persist_local_history: false,
            write_to_disk: default_true(),
            max_metrics_bytes: default_max_metrics_bytes(),
            trigger_get_data_bytes: default_trigger_get_data_bytes(),
            certificate_hash_bytes: default_certificate_hash_bytes(),
            restricted_data_ttl_ns: default_restricted_ttl_ns(),
        }
    }
}

impl StatsdConfig {
    /// Re-checks the invariants the aggregation pipeline depends on.
    pub fn is_valid(&self) -> bool {
        if self.id == 0 {
            return false;
        }
        if let Some(delegate) = &self.restricted_metrics_delegate {
            if delegate.is_empty() {
                return false;
            }
        }

        let mut seen = std::collections::HashSet::new();
        for metric in &self.metrics {
            if metric.id == 0 || !seen.insert(metric.id) {
                return false;
            }
            if metric.bucket_size_ns <= 0 {
                return false;
            }
            if let Some(condition) = &metric.condition {
                if condition.state_atom_id == 0 {
                    return false;
                }
            }
            match metric.kind {
                MetricKind::Duration if metric.stop_atom_id.is_none() => return false,
                MetricKind::Value | MetricKind::Gauge if metric.value_field.is_none() => {
                    return false
                }
                _ => {}
            }
        }
        true
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_yaml::to_string(self)
            .map(String::into_bytes)
            .unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_yaml::from_slice(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_metric(id: i64, atom_id: i32) -> MetricConfig {
        MetricConfig {
            id,
            kind: MetricKind::Count,
            atom_id,
            stop_atom_id: None,
            value_field: None,
            dimension_field: None,
            bucket_size_ns: default_bucket_size_ns(),
            activation: None,
            condition: None,
            alert: None,
        }
    }

    #[test]
    fn test_condition_requires_state_atom() {
        let mut metric = count_metric(1, 100);
        metric.condition = Some(ConditionConfig {
            state_atom_id: 0,
            value: 1,
            link_field: None,
        });
        let config = StatsdConfig {
            id: 42,
            metrics: vec![metric.clone()],
            ..Default::default()
        };
        assert!(!config.is_valid());

        metric.condition = Some(ConditionConfig {
            state_atom_id: 50,
            value: 1,
            link_field: None,
        });
        let config = StatsdConfig {
            id: 42,
            metrics: vec![metric],
            ..Default::default()
        };
        assert!(config.is_valid());
    }

    #[test]
    fn test_valid_config() {
        let config = StatsdConfig {
            id: 42,
            metrics: vec![count_metric(1, 100), count_metric(2, 101)],
            ..Default::default()
        };
        assert!(config.is_valid());
    }

    #[test]
    fn test_zero_id_invalid() {
        assert!(!StatsdConfig::default().is_valid());
    }

    #[test]
    fn test_duplicate_metric_ids_invalid() {
        let config = StatsdConfig {
            id: 42,
            metrics: vec![count_metric(1, 100), count_metric(1, 101)],
            ..Default::default()
        };
        assert!(!config.is_valid());
    }

    #[test]
    fn test_duration_requires_stop_atom() {
        let mut metric = count_metric(1, 100);
        metric.kind = MetricKind::Duration;
        let config = StatsdConfig {
            id: 42,
            metrics: vec![metric],
            ..Default::default()
        };
        assert!(!config.is_valid());
    }

    #[test]
    fn test_value_requires_value_field() {
        let mut metric = count_metric(1, 100);
        metric.kind = MetricKind::Value;
        let config = StatsdConfig {
            id: 42,
            metrics: vec![metric.clone()],
            ..Default::default()
        };
        assert!(!config.is_valid());

        metric.value_field = Some(2);
        let config = StatsdConfig {
            id: 42,
            metrics: vec![metric],
            ..Default::default()
        };
        assert!(config.is_valid());
    }

    #[test]
    fn test_empty_delegate_invalid() {
        let config = StatsdConfig {
            id: 42,
            restricted_metrics_delegate: Some(String::new()),
            ..Default::default()
        };
        assert!(!config.is_valid());
    }

    #[test]
    fn test_bytes_round_trip() {
        let config = StatsdConfig {
            id: 42,
            metrics: vec![count_metric(1, 100)],
            ttl_ns: 1_000,
            ..Default::default()
        };
        let bytes = config.to_bytes();
        assert_eq!(StatsdConfig::from_bytes(&bytes), Some(config));
    }
}
