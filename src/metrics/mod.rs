pub mod aggregate;
pub mod config;
pub mod producer;

use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::debug;

use crate::clock::AlarmMonitor;
use crate::metrics::config::StatsdConfig;
use crate::metrics::producer::MetricProducer;
use crate::proto::{
    ActiveConfig, ActiveMetricState, AlertMetadata, ConfigKeyMsg, ProtoOutput, StatsMetadata,
    FIELD_ID_METRICS,
};
use crate::state::StateManager;
use crate::stats::ProcessorStats;
use crate::storage::restricted::{RestrictedRow, RestrictedStore};
use crate::uid::UidMap;
use crate::{ConfigKey, DumpLatency};

/// Rough per-row cost of a queued restricted event.
const BYTES_PER_RESTRICTED_ROW: usize = 64;

/// Owns one configuration's metric producers and activation state.
///
/// Everything here runs under the processor's lock; the manager itself is
/// single-threaded. Restricted configs queue rows for the per-config
/// database instead of aggregating in memory.
pub struct MetricsManager {
    key: ConfigKey,
    config: StatsdConfig,
    valid: bool,
    time_base_ns: i64,
    ttl_end_ns: i64,
    last_report_time_ns: i64,
    last_report_wall_ns: i64,
    producers: Vec<MetricProducer>,
    pending_restricted: Vec<RestrictedRow>,
    stats: Arc<ProcessorStats>,
    state_manager: Arc<StateManager>,
}

impl MetricsManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: ConfigKey,
        config: &StatsdConfig,
        time_base_ns: i64,
        created_ns: i64,
        stats: Arc<ProcessorStats>,
        state_manager: Arc<StateManager>,
        _anomaly_monitor: &Arc<AlarmMonitor>,
        _periodic_monitor: &Arc<AlarmMonitor>,
    ) -> Self {
        let valid = config.is_valid();
        let producers = if valid && config.restricted_metrics_delegate.is_none() {
            config
                .metrics
                .iter()
                .map(|m| MetricProducer::new(m.clone(), time_base_ns, created_ns))
                .collect()
        } else {
            Vec::new()
        };
        if valid {
            register_state_atoms(&state_manager, config);
        }

        Self {
            key,
            config: config.clone(),
            valid,
            time_base_ns,
            ttl_end_ns: i64::MAX,
            last_report_time_ns: time_base_ns,
            last_report_wall_ns: 0,
            producers,
            pending_restricted: Vec::new(),
            stats,
            state_manager,
        }
    }

    pub fn key(&self) -> ConfigKey {
        self.key
    }

    pub fn is_config_valid(&self) -> bool {
        self.valid
    }

    pub fn init(&mut self) {
        debug!(key = %self.key, metrics = self.config.metrics.len(), "metrics manager initialized");
    }

    pub fn config(&self) -> &StatsdConfig {
        &self.config
    }

    pub fn on_log_event(&mut self, event: &crate::event::LogEvent) {
        if self.has_restricted_metrics_delegate() {
            let wall_ns = crate::clock::wall_clock_ns();
            for metric in &self.config.metrics {
                if metric.atom_id == event.atom_id() {
                    self.pending_restricted.push(RestrictedRow {
                        metric_id: metric.id,
                        atom_id: event.atom_id(),
                        elapsed_ns: event.elapsed_ns(),
                        wall_ns,
                    });
                }
            }
            return;
        }
        for producer in &mut self.producers {
            producer.on_event(event, &self.state_manager, &self.stats);
        }
    }

    /// Whether any metric is currently collecting.
    pub fn is_active(&self) -> bool {
        if self.producers.is_empty() {
            return true;
        }
        self.producers
            .iter()
            .any(|p| !p.has_activation() || p.is_active())
    }

    pub fn has_restricted_metrics_delegate(&self) -> bool {
        self.config.restricted_metrics_delegate.is_some()
    }

    pub fn restricted_metrics_delegate(&self) -> Option<&str> {
        self.config.restricted_metrics_delegate.as_deref()
    }

    /// Whether `calling_uid` belongs to this config's delegate package.
    pub fn validate_restricted_metrics_delegate(&self, calling_uid: i32, uid_map: &UidMap) -> bool {
        let Some(delegate) = self.restricted_metrics_delegate() else {
            return false;
        };
        if UidMap::well_known_uid(delegate) == Some(calling_uid) {
            return true;
        }
        uid_map.app_uids(delegate).contains(&calling_uid)
    }

    pub fn all_metric_ids(&self) -> Vec<i64> {
        self.config.metrics.iter().map(|m| m.id).collect()
    }

    pub fn num_metrics(&self) -> usize {
        self.config.metrics.len()
    }

    pub fn byte_size(&self) -> usize {
        let producers: usize = self.producers.iter().map(MetricProducer::byte_size).sum();
        producers + self.pending_restricted.len() * BYTES_PER_RESTRICTED_ROW
    }

    pub fn max_metrics_bytes(&self) -> usize {
        self.config.max_metrics_bytes
    }

    pub fn trigger_get_data_bytes(&self) -> usize {
        self.config.trigger_get_data_bytes
    }

    pub fn certificate_hash_bytes(&self) -> usize {
        self.config.certificate_hash_bytes
    }

    pub fn drop_data(&mut self, now_ns: i64) {
        for producer in &mut self.producers {
            producer.drop_data(now_ns);
        }
        self.pending_restricted.clear();
    }

    /// Writes queued restricted rows to the config's database. No-op for
    /// unrestricted configs.
    pub fn flush_restricted_data(&mut self, store: &dyn RestrictedStore) {
        if !self.has_restricted_metrics_delegate() || self.pending_restricted.is_empty() {
            return;
        }
        store.insert_rows(self.key, &self.pending_restricted);
        self.pending_restricted.clear();
    }

    pub fn enforce_restricted_data_ttls(&self, store: &dyn RestrictedStore, wall_ns: i64) {
        if !self.has_restricted_metrics_delegate() {
            return;
        }
        store.enforce_ttl(self.key, wall_ns - self.config.restricted_data_ttl_ns);
    }

    pub fn should_persist_local_history(&self) -> bool {
        self.config.persist_local_history
    }

    pub fn should_write_to_disk(&self) -> bool {
        self.config.write_to_disk
    }

    pub fn last_report_time_ns(&self) -> i64 {
        self.last_report_time_ns
    }

    pub fn last_report_wall_clock_ns(&self) -> i64 {
        self.last_report_wall_ns
    }

    /// Emits every metric's StatsLogReport into `out` (report field 1).
    #[allow(clippy::too_many_arguments)]
    pub fn on_dump_report(
        &mut self,
        dump_time_ns: i64,
        wall_clock_ns: i64,
        include_partial: bool,
        erase: bool,
        _latency: DumpLatency,
        str_set: &mut BTreeSet<String>,
        out: &mut ProtoOutput,
    ) {
        for producer in &mut self.producers {
            let report = producer.dump_report(dump_time_ns, include_partial, erase, str_set);
            out.write_message(FIELD_ID_METRICS, &report);
        }
        if erase {
            self.last_report_time_ns = dump_time_ns;
            self.last_report_wall_ns = wall_clock_ns;
        }
    }

    pub fn is_in_ttl(&self, now_ns: i64) -> bool {
        self.config.ttl_ns <= 0 || now_ns < self.ttl_end_ns
    }

    pub fn refresh_ttl(&mut self, now_ns: i64) {
        self.ttl_end_ns = if self.config.ttl_ns > 0 {
            now_ns.saturating_add(self.config.ttl_ns)
        } else {
            i64::MAX
        };
    }

    /// In-place modular update. Producers for unchanged metrics keep their
    /// bucket state; changed or new metrics start fresh.
    pub fn update_config(
        &mut self,
        config: &StatsdConfig,
        time_base_ns: i64,
        now_ns: i64,
        _anomaly_monitor: &Arc<AlarmMonitor>,
        _periodic_monitor: &Arc<AlarmMonitor>,
    ) -> bool {
        if !config.is_valid() {
            self.valid = false;
            return false;
        }

        let mut kept: Vec<MetricProducer> = Vec::with_capacity(config.metrics.len());
        if config.restricted_metrics_delegate.is_none() {
            let mut old: Vec<MetricProducer> = std::mem::take(&mut self.producers);
            for metric in &config.metrics {
                let existing = old
                    .iter()
                    .position(|p| p.metric_id() == metric.id && p.config() == metric);
                match existing {
                    Some(idx) => kept.push(old.swap_remove(idx)),
                    None => kept.push(MetricProducer::new(metric.clone(), time_base_ns, now_ns)),
                }
            }
        }

        self.producers = kept;
        self.config = config.clone();
        self.time_base_ns = time_base_ns;
        self.valid = true;
        register_state_atoms(&self.state_manager, config);
        true
    }

    pub fn on_anomaly_alarm_fired(
        &mut self,
        _timestamp_ns: i64,
        _alarms: &[Arc<crate::clock::Alarm>],
    ) {
    }

    pub fn on_periodic_alarm_fired(
        &mut self,
        _timestamp_ns: i64,
        _alarms: &[Arc<crate::clock::Alarm>],
    ) {
    }

    /// Adds every atom this config consumes to the ingress filter set.
    pub fn add_all_atom_ids(&self, set: &mut HashSet<i32>) {
        for metric in &self.config.metrics {
            set.insert(metric.atom_id);
            if let Some(stop) = metric.stop_atom_id {
                set.insert(stop);
            }
            if let Some(activation) = &metric.activation {
                set.insert(activation.atom_id);
            }
            if let Some(condition) = &metric.condition {
                set.insert(condition.state_atom_id);
            }
        }
    }

    /// Splits every producer's bucket so pre-upgrade data stays separate.
    pub fn notify_app_upgrade(&mut self, event_time_ns: i64) {
        for producer in &mut self.producers {
            producer.split_bucket(event_time_ns);
        }
    }

    pub fn notify_app_removed(&mut self, event_time_ns: i64) {
        self.notify_app_upgrade(event_time_ns);
    }

    pub fn on_uid_map_received(&mut self, _event_time_ns: i64) {}

    pub fn on_statsd_init_completed(&mut self, elapsed_time_ns: i64) {
        self.notify_app_upgrade(elapsed_time_ns);
    }

    /// Persisted anomaly refractory state, if any alert has one.
    pub fn write_metadata(&self, current_wall_ns: i64, _elapsed_ns: i64) -> Option<StatsMetadata> {
        let wall_sec = current_wall_ns / crate::clock::NS_PER_SEC;
        let alert_metadata: Vec<AlertMetadata> = self
            .producers
            .iter()
            .filter_map(|p| {
                let alert = p.config().alert.as_ref()?;
                if p.refractory_end_sec() <= wall_sec {
                    return None;
                }
                Some(AlertMetadata {
                    alert_id: alert.id,
                    last_refractory_ends_sec: p.refractory_end_sec(),
                })
            })
            .collect();

        if alert_metadata.is_empty() {
            return None;
        }
        Some(StatsMetadata {
            config_key: Some(ConfigKeyMsg {
                uid: self.key.uid,
                id: self.key.id,
            }),
            alert_metadata,
        })
    }

    pub fn load_metadata(&mut self, metadata: &StatsMetadata, _wall_ns: i64, _elapsed_ns: i64) {
        for alert in &metadata.alert_metadata {
            for producer in &mut self.producers {
                let matches = producer
                    .config()
                    .alert
                    .as_ref()
                    .is_some_and(|a| a.id == alert.alert_id);
                if matches {
                    producer.set_refractory_end_sec(alert.last_refractory_ends_sec);
                }
            }
        }
    }

    /// Activation state for persistence, if any metric has an activation.
    pub fn write_active_config(&self, current_ns: i64) -> Option<ActiveConfig> {
        let metric: Vec<ActiveMetricState> = self
            .producers
            .iter()
            .filter(|p| p.has_activation())
            .map(|p| ActiveMetricState {
                metric_id: p.metric_id(),
                active: p.is_active(),
                remaining_ttl_nanos: p.remaining_activation_ttl_ns(current_ns),
            })
            .collect();

        if metric.is_empty() {
            return None;
        }
        Some(ActiveConfig {
            uid: self.key.uid,
            id: self.key.id,
            metric,
        })
    }

    pub fn load_active_config(&mut self, config: &ActiveConfig, current_ns: i64) {
        for state in &config.metric {
            for producer in &mut self.producers {
                if producer.metric_id() == state.metric_id {
                    producer.load_activation(state.active, state.remaining_ttl_nanos, current_ns);
                }
            }
        }
    }

    pub fn dump_states(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "config {}: {} metrics, {} bytes, active={}, restricted={}",
            self.key,
            self.num_metrics(),
            self.byte_size(),
            self.is_active(),
            self.has_restricted_metrics_delegate(),
        );
    }
}

/// Makes every condition's state atom known to the state manager.
fn register_state_atoms(state_manager: &StateManager, config: &StatsdConfig) {
    for metric in &config.metrics {
        if let Some(condition) = &metric.condition {
            state_manager.register_state_atom(condition.state_atom_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{LogEvent, Value};
    use crate::metrics::config::{ActivationConfig, ConditionConfig, MetricConfig, MetricKind};

    fn monitors() -> (Arc<AlarmMonitor>, Arc<AlarmMonitor>) {
        (
            Arc::new(AlarmMonitor::unbacked()),
            Arc::new(AlarmMonitor::unbacked()),
        )
    }

    fn count_metric(id: i64, atom_id: i32) -> MetricConfig {
        MetricConfig {
            id,
            kind: MetricKind::Count,
            atom_id,
            stop_atom_id: None,
            value_field: None,
            dimension_field: None,
            bucket_size_ns: 1_000_000,
            activation: None,
            condition: None,
            alert: None,
        }
    }

    fn manager_with_state(config: &StatsdConfig, state_manager: Arc<StateManager>) -> MetricsManager {
        let (anomaly, periodic) = monitors();
        MetricsManager::new(
            ConfigKey::new(1000, 42),
            config,
            0,
            0,
            Arc::new(ProcessorStats::new(0)),
            state_manager,
            &anomaly,
            &periodic,
        )
    }

    fn manager_for(config: &StatsdConfig) -> MetricsManager {
        manager_with_state(config, Arc::new(StateManager::new()))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let manager = manager_for(&StatsdConfig::default());
        assert!(!manager.is_config_valid());
    }

    #[test]
    fn test_events_flow_into_producers() {
        let config = StatsdConfig {
            id: 42,
            metrics: vec![count_metric(1, 100)],
            ..Default::default()
        };
        let mut manager = manager_for(&config);
        assert_eq!(manager.byte_size(), 0);

        manager.on_log_event(&LogEvent::new(100, 10));
        assert!(manager.byte_size() > 0);
    }

    #[test]
    fn test_dump_report_erase_resets_last_report_times() {
        let config = StatsdConfig {
            id: 42,
            metrics: vec![count_metric(1, 100)],
            ..Default::default()
        };
        let mut manager = manager_for(&config);
        manager.on_log_event(&LogEvent::new(100, 10));

        let mut out = ProtoOutput::new();
        let mut strs = BTreeSet::new();
        manager.on_dump_report(
            500,
            7_000,
            true,
            true,
            DumpLatency::NoTimeConstraints,
            &mut strs,
            &mut out,
        );
        assert!(!out.is_empty());
        assert_eq!(manager.last_report_time_ns(), 500);
        assert_eq!(manager.last_report_wall_clock_ns(), 7_000);
    }

    #[test]
    fn test_ttl_refresh_and_expiry() {
        let config = StatsdConfig {
            id: 42,
            ttl_ns: 1_000,
            ..Default::default()
        };
        let mut manager = manager_for(&config);
        manager.refresh_ttl(100);
        assert!(manager.is_in_ttl(500));
        assert!(!manager.is_in_ttl(1_100));
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let config = StatsdConfig {
            id: 42,
            ..Default::default()
        };
        let mut manager = manager_for(&config);
        manager.refresh_ttl(0);
        assert!(manager.is_in_ttl(i64::MAX - 1));
    }

    #[test]
    fn test_modular_update_keeps_unchanged_producer_state() {
        let config = StatsdConfig {
            id: 42,
            metrics: vec![count_metric(1, 100)],
            ..Default::default()
        };
        let mut manager = manager_for(&config);
        manager.on_log_event(&LogEvent::new(100, 10));
        let size_before = manager.byte_size();

        let (anomaly, periodic) = monitors();
        assert!(manager.update_config(&config, 0, 20, &anomaly, &periodic));
        assert_eq!(manager.byte_size(), size_before);

        // Same update twice yields the same size (idempotence).
        assert!(manager.update_config(&config, 0, 30, &anomaly, &periodic));
        assert_eq!(manager.byte_size(), size_before);
    }

    #[test]
    fn test_modular_update_replaces_changed_metric() {
        let config = StatsdConfig {
            id: 42,
            metrics: vec![count_metric(1, 100)],
            ..Default::default()
        };
        let mut manager = manager_for(&config);
        manager.on_log_event(&LogEvent::new(100, 10));

        let updated = StatsdConfig {
            id: 42,
            metrics: vec![count_metric(1, 101)],
            ..Default::default()
        };
        let (anomaly, periodic) = monitors();
        assert!(manager.update_config(&updated, 0, 20, &anomaly, &periodic));
        assert_eq!(manager.byte_size(), 0);
    }

    #[test]
    fn test_restricted_config_queues_rows() {
        let config = StatsdConfig {
            id: 42,
            metrics: vec![count_metric(1, 100)],
            restricted_metrics_delegate: Some("com.delegate".into()),
            ..Default::default()
        };
        let mut manager = manager_for(&config);
        assert!(manager.has_restricted_metrics_delegate());

        manager.on_log_event(&LogEvent::new(100, 10));
        manager.on_log_event(&LogEvent::new(999, 20));
        assert_eq!(manager.byte_size(), BYTES_PER_RESTRICTED_ROW);
    }

    #[test]
    fn test_validate_delegate_by_package_uid() {
        let config = StatsdConfig {
            id: 42,
            restricted_metrics_delegate: Some("com.delegate".into()),
            ..Default::default()
        };
        let manager = manager_for(&config);

        let uid_map = UidMap::new();
        uid_map.update_app(5000, "com.delegate", 1, "1", "", &[]);

        assert!(manager.validate_restricted_metrics_delegate(5000, &uid_map));
        assert!(!manager.validate_restricted_metrics_delegate(6000, &uid_map));
    }

    #[test]
    fn test_activation_state_round_trip() {
        let mut metric = count_metric(1, 100);
        metric.activation = Some(ActivationConfig {
            atom_id: 200,
            ttl_ns: 1_000_000,
        });
        let config = StatsdConfig {
            id: 42,
            metrics: vec![metric],
            ..Default::default()
        };

        let mut manager = manager_for(&config);
        assert!(!manager.is_active());
        manager.on_log_event(&LogEvent::new(200, 10));
        assert!(manager.is_active());

        let active = manager.write_active_config(20).expect("has activation");
        assert!(active.metric[0].active);
        assert!(active.metric[0].remaining_ttl_nanos > 0);

        // Fresh manager restores the state.
        let mut restored = manager_for(&config);
        assert!(!restored.is_active());
        restored.load_active_config(&active, 0);
        assert!(restored.is_active());
    }

    #[test]
    fn test_atom_id_collection() {
        let mut metric = count_metric(1, 100);
        metric.stop_atom_id = Some(101);
        metric.activation = Some(ActivationConfig {
            atom_id: 200,
            ttl_ns: 1,
        });
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
        let manager = manager_for(&config);

        let mut set = HashSet::new();
        manager.add_all_atom_ids(&mut set);
        assert_eq!(set, [100, 101, 200, 50].into_iter().collect());
    }

    #[test]
    fn test_construction_registers_condition_state_atoms() {
        let mut metric = count_metric(1, 100);
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

        let state_manager = Arc::new(StateManager::new());
        let _manager = manager_with_state(&config, Arc::clone(&state_manager));

        // The state atom is now tracked, so transitions land.
        state_manager.on_log_event(&LogEvent::new(50, 0).with_values(vec![Value::Long(1)]));
        assert_eq!(state_manager.state_value(50, 0), 1);
    }

    #[test]
    fn test_condition_gates_events_through_manager() {
        let mut metric = count_metric(1, 100);
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

        let state_manager = Arc::new(StateManager::new());
        let mut manager = manager_with_state(&config, Arc::clone(&state_manager));

        manager.on_log_event(&LogEvent::new(100, 10));
        assert_eq!(manager.byte_size(), 0);

        state_manager.on_log_event(&LogEvent::new(50, 20).with_values(vec![Value::Long(1)]));
        manager.on_log_event(&LogEvent::new(100, 30));
        assert!(manager.byte_size() > 0);
    }
}
