use std::collections::{BTreeSet, HashMap};

use crate::clock::NS_PER_SEC;
use crate::event::LogEvent;
use crate::metrics::aggregate::{ValueAggregate, ValueSnapshot};
use crate::metrics::config::{MetricConfig, MetricKind};
use crate::proto::{BucketInfo, StatsLogReport};
use crate::state::StateManager;
use crate::stats::ProcessorStats;

/// Opaque composite key for one (metric, dimension) slice.
pub type DimensionKey = String;

/// Rough per-entry cost used for the in-memory size guardrail.
const BYTES_PER_ENTRY: usize = 40;
const BYTES_PER_BUCKET: usize = 24;

#[derive(Debug, Clone)]
struct PastBucket {
    start_ns: i64,
    end_ns: i64,
    bucket_num: i64,
    entries: Vec<(DimensionKey, ValueSnapshot)>,
}

/// One metric's time-bucketed aggregation state.
///
/// Buckets are aligned to the processor's time base. Events never move time
/// backwards: anything stamped before the current bucket start is ignored,
/// late events inside the current bucket are applied in arrival order.
pub struct MetricProducer {
    config: MetricConfig,
    time_base_ns: i64,
    bucket_start_ns: i64,
    current: HashMap<DimensionKey, ValueAggregate>,
    /// Open duration slices, keyed by dimension. Slices span bucket splits.
    open_slices: HashMap<DimensionKey, i64>,
    past: Vec<PastBucket>,
    active: bool,
    active_until_ns: i64,
    /// Event counts since the last full bucket boundary. Partial buckets
    /// compose into this for anomaly accounting.
    full_bucket_counts: HashMap<DimensionKey, i64>,
    refractory_end_sec: i64,
}

impl MetricProducer {
    pub fn new(config: MetricConfig, time_base_ns: i64, now_ns: i64) -> Self {
        let always_active = config.activation.is_none();
        let mut producer = Self {
            config,
            time_base_ns,
            bucket_start_ns: 0,
            current: HashMap::new(),
            open_slices: HashMap::new(),
            past: Vec::new(),
            active: always_active,
            active_until_ns: 0,
            full_bucket_counts: HashMap::new(),
            refractory_end_sec: 0,
        };
        producer.bucket_start_ns = producer.aligned_start(now_ns.max(time_base_ns));
        producer
    }

    pub fn metric_id(&self) -> i64 {
        self.config.id
    }

    pub fn config(&self) -> &MetricConfig {
        &self.config
    }

    pub fn has_activation(&self) -> bool {
        self.config.activation.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn remaining_activation_ttl_ns(&self, now_ns: i64) -> i64 {
        if !self.has_activation() || !self.active {
            return 0;
        }
        (self.active_until_ns - now_ns).max(0)
    }

    /// Restores activation state persisted across a reboot.
    pub fn load_activation(&mut self, active: bool, remaining_ttl_ns: i64, now_ns: i64) {
        if !self.has_activation() {
            return;
        }
        self.active = active && remaining_ttl_ns > 0;
        self.active_until_ns = if self.active {
            now_ns + remaining_ttl_ns
        } else {
            0
        };
    }

    pub fn refractory_end_sec(&self) -> i64 {
        self.refractory_end_sec
    }

    pub fn set_refractory_end_sec(&mut self, sec: i64) {
        self.refractory_end_sec = sec;
    }

    fn aligned_start(&self, ts_ns: i64) -> i64 {
        let size = self.config.bucket_size_ns;
        let elapsed = (ts_ns - self.time_base_ns).max(0);
        self.time_base_ns + (elapsed / size) * size
    }

    fn current_bucket_end_ns(&self) -> i64 {
        let size = self.config.bucket_size_ns;
        let elapsed = (self.bucket_start_ns - self.time_base_ns).max(0);
        self.time_base_ns + (elapsed / size + 1) * size
    }

    fn bucket_num(&self) -> i64 {
        (self.bucket_start_ns - self.time_base_ns).max(0) / self.config.bucket_size_ns
    }

    /// Applies one event. Returns true when the event matched this metric.
    pub fn on_event(&mut self, event: &LogEvent, state: &StateManager, stats: &ProcessorStats) -> bool {
        let ts = event.elapsed_ns();

        if let Some(activation) = &self.config.activation {
            if event.atom_id() == activation.atom_id {
                self.active = true;
                self.active_until_ns = ts.saturating_add(activation.ttl_ns);
            } else if self.active && ts > self.active_until_ns {
                self.active = false;
            }
        }

        let is_start = event.atom_id() == self.config.atom_id;
        let is_stop = self.config.stop_atom_id == Some(event.atom_id());
        if !is_start && !is_stop {
            return false;
        }
        if !self.active {
            return true;
        }
        // Stops always close their slice; everything else is gated on the
        // metric's condition.
        if !is_stop && !self.condition_met(event, state) {
            return true;
        }
        if ts < self.bucket_start_ns {
            return true;
        }

        // Fast-forward over empty windows, flushing full buckets otherwise.
        if self.current.is_empty() && self.open_slices.is_empty() && ts >= self.current_bucket_end_ns()
        {
            self.bucket_start_ns = self.aligned_start(ts);
            self.full_bucket_counts.clear();
        }
        while ts >= self.current_bucket_end_ns() {
            let end = self.current_bucket_end_ns();
            self.flush_bucket(end);
            self.full_bucket_counts.clear();
        }

        let dim = self.dimension_of(event);
        match self.config.kind {
            MetricKind::Count => {
                self.current.entry(dim.clone()).or_default().record(1);
                self.note_count(dim, ts, stats);
            }
            MetricKind::Duration => {
                if is_start {
                    self.open_slices.entry(dim).or_insert(ts);
                } else if let Some(start) = self.open_slices.remove(&dim) {
                    self.current
                        .entry(dim)
                        .or_default()
                        .record(ts.saturating_sub(start));
                }
            }
            MetricKind::Value | MetricKind::Gauge => {
                let field = self.config.value_field.unwrap_or(0);
                if let Ok(value) = event.long(field) {
                    self.current.entry(dim).or_default().record(value);
                }
            }
        }
        true
    }

    fn note_count(&mut self, dim: DimensionKey, ts_ns: i64, stats: &ProcessorStats) {
        let count = self.full_bucket_counts.entry(dim).or_insert(0);
        *count += 1;
        if let Some(alert) = &self.config.alert {
            let now_sec = ts_ns / NS_PER_SEC;
            if *count > alert.threshold && now_sec >= self.refractory_end_sec {
                stats.note_anomaly_declared(alert.id);
                self.refractory_end_sec = now_sec + alert.refractory_sec;
            }
        }
    }

    fn condition_met(&self, event: &LogEvent, state: &StateManager) -> bool {
        let Some(condition) = &self.config.condition else {
            return true;
        };
        let group = match condition.link_field {
            Some(pos) => match event.long(pos) {
                Ok(value) => value,
                Err(_) => return false,
            },
            None => 0,
        };
        state.state_value(condition.state_atom_id, group) == condition.value
    }

    fn dimension_of(&self, event: &LogEvent) -> DimensionKey {
        let Some(pos) = self.config.dimension_field else {
            return DimensionKey::new();
        };
        if let Ok(s) = event.string(pos) {
            return s.to_string();
        }
        if let Ok(v) = event.long(pos) {
            return v.to_string();
        }
        DimensionKey::new()
    }

    fn flush_bucket(&mut self, end_ns: i64) {
        if !self.current.is_empty() {
            let mut entries: Vec<(DimensionKey, ValueSnapshot)> = self
                .current
                .drain()
                .map(|(dim, agg)| (dim, agg.snapshot()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            self.past.push(PastBucket {
                start_ns: self.bucket_start_ns,
                end_ns,
                bucket_num: self.bucket_num(),
                entries,
            });
        }
        self.bucket_start_ns = end_ns;
    }

    /// Splits the current bucket at `ts_ns`, forming a partial bucket.
    /// Anomaly accounting keeps composing across the split.
    pub fn split_bucket(&mut self, ts_ns: i64) {
        if ts_ns <= self.bucket_start_ns {
            return;
        }
        self.flush_bucket(ts_ns.min(self.current_bucket_end_ns()));
    }

    pub fn byte_size(&self) -> usize {
        let past: usize = self
            .past
            .iter()
            .map(|b| BYTES_PER_BUCKET + b.entries.len() * BYTES_PER_ENTRY)
            .sum();
        past + self.current.len() * BYTES_PER_ENTRY + self.open_slices.len() * 16
    }

    pub fn drop_data(&mut self, now_ns: i64) {
        self.past.clear();
        self.current.clear();
        self.open_slices.clear();
        self.full_bucket_counts.clear();
        self.bucket_start_ns = self.aligned_start(now_ns.max(self.time_base_ns));
    }

    /// Emits the metric's report and optionally clears the reported data.
    pub fn dump_report(
        &mut self,
        dump_time_ns: i64,
        include_partial: bool,
        erase: bool,
        str_set: &mut BTreeSet<String>,
    ) -> StatsLogReport {
        let mut buckets: Vec<BucketInfo> = Vec::with_capacity(self.past.len() + 1);
        for bucket in &self.past {
            for (dim, snap) in &bucket.entries {
                buckets.push(self.bucket_info(bucket.start_ns, bucket.end_ns, bucket.bucket_num, dim, snap));
                if !dim.is_empty() {
                    str_set.insert(dim.clone());
                }
            }
        }

        if include_partial && !self.current.is_empty() {
            let end = dump_time_ns.min(self.current_bucket_end_ns());
            let num = self.bucket_num();
            let mut entries: Vec<(&DimensionKey, ValueSnapshot)> = self
                .current
                .iter()
                .map(|(dim, agg)| (dim, agg.snapshot()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (dim, snap) in entries {
                buckets.push(self.bucket_info(self.bucket_start_ns, end, num, dim, &snap));
                if !dim.is_empty() {
                    str_set.insert(dim.clone());
                }
            }
        }

        if erase {
            self.past.clear();
            if include_partial {
                self.current.clear();
                self.bucket_start_ns = self.aligned_start(dump_time_ns.max(self.time_base_ns));
            }
        }

        StatsLogReport {
            metric_id: self.config.id,
            bucket: buckets,
        }
    }

    fn bucket_info(
        &self,
        start_ns: i64,
        end_ns: i64,
        bucket_num: i64,
        dim: &str,
        snap: &ValueSnapshot,
    ) -> BucketInfo {
        BucketInfo {
            start_bucket_elapsed_nanos: start_ns,
            end_bucket_elapsed_nanos: end_ns,
            count: snap.count,
            sum: snap.sum,
            min: snap.min,
            max: snap.max,
            dimension_key: dim.to_string(),
            bucket_num,
        }
    }

    pub fn has_data(&self) -> bool {
        !self.past.is_empty() || !self.current.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use crate::metrics::config::{ActivationConfig, AlertConfig, ConditionConfig, MetricKind};

    fn count_config() -> MetricConfig {
        MetricConfig {
            id: 1,
            kind: MetricKind::Count,
            atom_id: 100,
            stop_atom_id: None,
            value_field: None,
            dimension_field: None,
            bucket_size_ns: 1_000,
            activation: None,
            condition: None,
            alert: None,
        }
    }

    fn event_at(atom_id: i32, ts: i64) -> LogEvent {
        LogEvent::new(atom_id, ts)
    }

    fn report_of(producer: &mut MetricProducer, dump_ns: i64) -> StatsLogReport {
        let mut strs = BTreeSet::new();
        producer.dump_report(dump_ns, true, false, &mut strs)
    }

    #[test]
    fn test_count_single_bucket() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let mut producer = MetricProducer::new(count_config(), 0, 0);

        producer.on_event(&event_at(100, 10), &state, &stats);
        producer.on_event(&event_at(100, 20), &state, &stats);

        let report = report_of(&mut producer, 500);
        assert_eq!(report.metric_id, 1);
        assert_eq!(report.bucket.len(), 1);
        assert_eq!(report.bucket[0].count, 2);
        assert_eq!(report.bucket[0].start_bucket_elapsed_nanos, 0);
        assert_eq!(report.bucket[0].end_bucket_elapsed_nanos, 500);
    }

    #[test]
    fn test_bucket_rolls_at_boundary() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let mut producer = MetricProducer::new(count_config(), 0, 0);

        producer.on_event(&event_at(100, 10), &state, &stats);
        producer.on_event(&event_at(100, 1_500), &state, &stats);

        let report = report_of(&mut producer, 1_600);
        assert_eq!(report.bucket.len(), 2);
        assert_eq!(report.bucket[0].end_bucket_elapsed_nanos, 1_000);
        assert_eq!(report.bucket[0].bucket_num, 0);
        assert_eq!(report.bucket[1].start_bucket_elapsed_nanos, 1_000);
        assert_eq!(report.bucket[1].bucket_num, 1);
    }

    #[test]
    fn test_event_before_bucket_start_ignored() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let mut producer = MetricProducer::new(count_config(), 0, 5_000);

        producer.on_event(&event_at(100, 100), &state, &stats);
        let report = report_of(&mut producer, 6_000);
        assert!(report.bucket.is_empty());
    }

    #[test]
    fn test_unrelated_atom_not_counted() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let mut producer = MetricProducer::new(count_config(), 0, 0);
        assert!(!producer.on_event(&event_at(999, 10), &state, &stats));
        assert!(!producer.has_data());
    }

    #[test]
    fn test_fast_forward_over_empty_windows() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let mut producer = MetricProducer::new(count_config(), 0, 0);

        producer.on_event(&event_at(100, 1_000_000), &state, &stats);
        let report = report_of(&mut producer, 1_000_500);
        assert_eq!(report.bucket.len(), 1);
        assert_eq!(report.bucket[0].start_bucket_elapsed_nanos, 1_000_000);
        assert_eq!(report.bucket[0].bucket_num, 1_000);
    }

    #[test]
    fn test_duration_slice_spans_buckets() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let config = MetricConfig {
            kind: MetricKind::Duration,
            stop_atom_id: Some(101),
            ..count_config()
        };
        let mut producer = MetricProducer::new(config, 0, 0);

        producer.on_event(&event_at(100, 100), &state, &stats);
        producer.on_event(&event_at(101, 2_500), &state, &stats);

        let report = report_of(&mut producer, 2_600);
        assert_eq!(report.bucket.len(), 1);
        assert_eq!(report.bucket[0].sum, 2_400);
    }

    #[test]
    fn test_value_metric_reads_field() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let config = MetricConfig {
            kind: MetricKind::Value,
            value_field: Some(1),
            ..count_config()
        };
        let mut producer = MetricProducer::new(config, 0, 0);

        let event = LogEvent::new(100, 10).with_values(vec![Value::Long(42)]);
        producer.on_event(&event, &state, &stats);
        let event = LogEvent::new(100, 20).with_values(vec![Value::Long(8)]);
        producer.on_event(&event, &state, &stats);

        let report = report_of(&mut producer, 500);
        assert_eq!(report.bucket[0].sum, 50);
        assert_eq!(report.bucket[0].min, 8);
        assert_eq!(report.bucket[0].max, 42);
    }

    #[test]
    fn test_dimension_key_from_string_field() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let config = MetricConfig {
            dimension_field: Some(1),
            ..count_config()
        };
        let mut producer = MetricProducer::new(config, 0, 0);

        let event = LogEvent::new(100, 10).with_values(vec![Value::Str("wifi".into())]);
        producer.on_event(&event, &state, &stats);
        let event = LogEvent::new(100, 20).with_values(vec![Value::Str("cell".into())]);
        producer.on_event(&event, &state, &stats);

        let mut strs = BTreeSet::new();
        let report = producer.dump_report(500, true, false, &mut strs);
        assert_eq!(report.bucket.len(), 2);
        assert!(strs.contains("wifi"));
        assert!(strs.contains("cell"));
    }

    #[test]
    fn test_activation_gates_counting() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let config = MetricConfig {
            activation: Some(ActivationConfig {
                atom_id: 200,
                ttl_ns: 1_000,
            }),
            ..count_config()
        };
        let mut producer = MetricProducer::new(config, 0, 0);
        assert!(!producer.is_active());

        producer.on_event(&event_at(100, 10), &state, &stats);
        assert!(!producer.has_data());

        producer.on_event(&event_at(200, 20), &state, &stats);
        assert!(producer.is_active());
        producer.on_event(&event_at(100, 30), &state, &stats);
        assert!(producer.has_data());

        // TTL expiry deactivates on the next event past the deadline.
        producer.on_event(&event_at(100, 2_000), &state, &stats);
        assert!(!producer.is_active());
    }

    #[test]
    fn test_condition_gates_counting() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        state.register_state_atom(50);
        let config = MetricConfig {
            condition: Some(ConditionConfig {
                state_atom_id: 50,
                value: 1,
                link_field: None,
            }),
            ..count_config()
        };
        let mut producer = MetricProducer::new(config, 0, 0);

        // No state yet: condition unmet.
        producer.on_event(&event_at(100, 10), &state, &stats);
        assert!(!producer.has_data());

        state.on_log_event(&LogEvent::new(50, 20).with_values(vec![Value::Long(1)]));
        producer.on_event(&event_at(100, 30), &state, &stats);
        assert!(producer.has_data());

        state.on_log_event(&LogEvent::new(50, 40).with_values(vec![Value::Long(0)]));
        producer.on_event(&event_at(100, 50), &state, &stats);

        let report = report_of(&mut producer, 500);
        assert_eq!(report.bucket[0].count, 1);
    }

    #[test]
    fn test_condition_links_group_through_event_field() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        state.register_state_atom(50);
        // Group 7 is in the required state, group 8 is not.
        state.on_log_event(&LogEvent::new(50, 0).with_values(vec![Value::Long(7), Value::Long(1)]));
        state.on_log_event(&LogEvent::new(50, 0).with_values(vec![Value::Long(8), Value::Long(0)]));

        let config = MetricConfig {
            condition: Some(ConditionConfig {
                state_atom_id: 50,
                value: 1,
                link_field: Some(1),
            }),
            ..count_config()
        };
        let mut producer = MetricProducer::new(config, 0, 0);

        let event = LogEvent::new(100, 10).with_values(vec![Value::Long(7)]);
        producer.on_event(&event, &state, &stats);
        let event = LogEvent::new(100, 20).with_values(vec![Value::Long(8)]);
        producer.on_event(&event, &state, &stats);

        let report = report_of(&mut producer, 500);
        assert_eq!(report.bucket[0].count, 1);
    }

    #[test]
    fn test_condition_unmet_still_closes_duration_slice() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        state.register_state_atom(50);
        state.on_log_event(&LogEvent::new(50, 0).with_values(vec![Value::Long(1)]));

        let config = MetricConfig {
            kind: MetricKind::Duration,
            stop_atom_id: Some(101),
            condition: Some(ConditionConfig {
                state_atom_id: 50,
                value: 1,
                link_field: None,
            }),
            ..count_config()
        };
        let mut producer = MetricProducer::new(config, 0, 0);

        producer.on_event(&event_at(100, 100), &state, &stats);
        // Condition flips before the stop; the open slice still closes.
        state.on_log_event(&LogEvent::new(50, 150).with_values(vec![Value::Long(0)]));
        producer.on_event(&event_at(101, 300), &state, &stats);

        let report = report_of(&mut producer, 500);
        assert_eq!(report.bucket.len(), 1);
        assert_eq!(report.bucket[0].sum, 200);

        // With the condition still unmet, no new slice opens.
        producer.on_event(&event_at(100, 400), &state, &stats);
        producer.on_event(&event_at(101, 450), &state, &stats);
        let report = report_of(&mut producer, 500);
        assert_eq!(report.bucket[0].sum, 200);
    }

    #[test]
    fn test_anomaly_declared_once_per_refractory() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let config = MetricConfig {
            alert: Some(AlertConfig {
                id: 77,
                threshold: 2,
                refractory_sec: 10,
            }),
            bucket_size_ns: 100 * NS_PER_SEC,
            ..count_config()
        };
        let mut producer = MetricProducer::new(config, 0, 0);

        for i in 0..5 {
            producer.on_event(&event_at(100, i * 1_000), &state, &stats);
        }
        // Crossed the threshold once; refractory suppresses repeats within
        // the same second.
        assert_eq!(stats.anomalies_declared(), 1);
        assert!(producer.refractory_end_sec() >= 10);

        // After the refractory window, a new crossing declares again.
        producer.set_refractory_end_sec(0);
        producer.on_event(&event_at(100, 5_000), &state, &stats);
        assert_eq!(stats.anomalies_declared(), 2);
    }

    #[test]
    fn test_partial_split_then_report() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let mut producer = MetricProducer::new(count_config(), 0, 0);

        producer.on_event(&event_at(100, 100), &state, &stats);
        producer.split_bucket(500);
        producer.on_event(&event_at(100, 600), &state, &stats);

        let report = report_of(&mut producer, 700);
        assert_eq!(report.bucket.len(), 2);
        assert_eq!(report.bucket[0].end_bucket_elapsed_nanos, 500);
        assert_eq!(report.bucket[1].start_bucket_elapsed_nanos, 500);
        // Both partials carry the same bucket number.
        assert_eq!(report.bucket[0].bucket_num, report.bucket[1].bucket_num);
    }

    #[test]
    fn test_erase_with_partial_clears_everything() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let mut producer = MetricProducer::new(count_config(), 0, 0);
        producer.on_event(&event_at(100, 100), &state, &stats);

        let mut strs = BTreeSet::new();
        let report = producer.dump_report(200, true, true, &mut strs);
        assert_eq!(report.bucket.len(), 1);
        assert!(!producer.has_data());

        let report = producer.dump_report(300, true, false, &mut strs);
        assert!(report.bucket.is_empty());
    }

    #[test]
    fn test_erase_without_partial_keeps_current() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let mut producer = MetricProducer::new(count_config(), 0, 0);
        producer.on_event(&event_at(100, 100), &state, &stats);
        producer.on_event(&event_at(100, 1_200), &state, &stats); // rolls first bucket

        let mut strs = BTreeSet::new();
        let report = producer.dump_report(1_300, false, true, &mut strs);
        assert_eq!(report.bucket.len(), 1); // only the closed bucket
        assert!(producer.has_data()); // current bucket kept
    }

    #[test]
    fn test_byte_size_grows_with_data() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let mut producer = MetricProducer::new(count_config(), 0, 0);
        let empty = producer.byte_size();
        producer.on_event(&event_at(100, 100), &state, &stats);
        assert!(producer.byte_size() > empty);
    }

    #[test]
    fn test_drop_data_clears_all() {
        let stats = ProcessorStats::new(0);
        let state = StateManager::new();
        let mut producer = MetricProducer::new(count_config(), 0, 0);
        producer.on_event(&event_at(100, 100), &state, &stats);
        producer.on_event(&event_at(100, 1_500), &state, &stats);

        producer.drop_data(2_000);
        assert!(!producer.has_data());
        assert_eq!(producer.byte_size(), 0);
    }
}
