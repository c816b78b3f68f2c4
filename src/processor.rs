use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{self, Alarm, AlarmMonitor, NS_PER_SEC};
use crate::config::GuardrailConfig;
use crate::event::{atom, LogEvent, Value, DAEMON_UID};
use crate::filter::EventFilter;
use crate::metrics::config::StatsdConfig;
use crate::metrics::MetricsManager;
use crate::proto::{
    ActiveConfigList, ConfigKeyMsg, ExperimentIds, ProtoOutput, StatsMetadataList,
    DATA_CORRUPTED_EVENT_QUEUE_OVERFLOW, DATA_CORRUPTED_SOCKET_LOSS, FIELD_ID_CONFIG_KEY,
    FIELD_ID_CURRENT_REPORT_ELAPSED_NANOS, FIELD_ID_CURRENT_REPORT_WALL_CLOCK_NANOS,
    FIELD_ID_DATA_CORRUPTED_REASON, FIELD_ID_DUMP_REPORT_REASON,
    FIELD_ID_LAST_REPORT_ELAPSED_NANOS, FIELD_ID_LAST_REPORT_WALL_CLOCK_NANOS,
    FIELD_ID_REPORTS, FIELD_ID_REPORT_NUMBER, FIELD_ID_STATS_ID, FIELD_ID_STRINGS,
    FIELD_ID_UID_MAP,
};
use crate::pullers::PullerManager;
use crate::state::StateManager;
use crate::stats::{InvalidQueryReason, ProcessorStats};
use crate::storage::restricted::RestrictedStore;
use crate::storage::{Storage, TrainInfo};
use crate::uid::UidMap;
use crate::{ConfigKey, DumpLatency, DumpReportReason};

/// Asks the subscriber for `key` to pull its data. Returns acceptance.
pub type SendBroadcastFn = Box<dyn Fn(ConfigKey) -> bool + Send + Sync>;
/// Notifies a uid of its currently active config ids. Returns acceptance.
pub type SendActivationBroadcastFn = Box<dyn Fn(i32, &[i64]) -> bool + Send + Sync>;
/// Announces the restricted metric-id set for a config to its delegate.
pub type SendRestrictedMetricsBroadcastFn = Box<dyn Fn(ConfigKey, &str, &[i64]) + Send + Sync>;
/// Whether (uid, pid) may mutate install-train state.
pub type TrainPermissionFn = Box<dyn Fn(i32, i32) -> bool + Send + Sync>;

/// Receives restricted-query results or an error, exactly once per call.
pub trait QueryCallback: Send + Sync {
    fn send_results(
        &self,
        data: Vec<String>,
        column_names: Vec<String>,
        column_types: Vec<i32>,
        row_count: usize,
    );
    fn send_failure(&self, error: &str);
}

/// Outbound callbacks injected at construction.
pub struct Broadcasters {
    pub send_broadcast: SendBroadcastFn,
    pub send_activation_broadcast: SendActivationBroadcastFn,
    pub send_restricted_metrics_broadcast: SendRestrictedMetricsBroadcastFn,
    pub check_train_permission: TrainPermissionFn,
}

impl Default for Broadcasters {
    fn default() -> Self {
        Self {
            send_broadcast: Box::new(|_| false),
            send_activation_broadcast: Box::new(|_, _| false),
            send_restricted_metrics_broadcast: Box::new(|_, _, _| {}),
            check_train_permission: Box::new(|_, _| true),
        }
    }
}

/// Everything guarded by the metrics mutex.
struct ProcessorState {
    managers: BTreeMap<ConfigKey, MetricsManager>,
    last_broadcast_times: HashMap<ConfigKey, i64>,
    last_activation_broadcast_times: HashMap<i32, i64>,
    last_byte_size_times: HashMap<ConfigKey, i64>,
    dump_report_numbers: HashMap<ConfigKey, i32>,
    /// Keys with unreported report files on disk.
    on_disk_data_configs: BTreeSet<ConfigKey>,
    last_ttl_time_ns: i64,
    last_flush_restricted_time_ns: i64,
    last_db_guardrail_time_ns: i64,
    last_puller_cache_clear_sec: i64,
    last_write_time_ns: i64,
    last_active_write_ns: i64,
    last_metadata_write_ns: i64,
}

/// The log event processor: owns the configuration set, routes every event,
/// enforces rate limits and TTLs, and persists reports.
///
/// All state mutation is serialized by one mutex. A second mutex guards only
/// the next anomaly-alarm deadline: it may be taken while the metrics mutex
/// is held, never the other way around — alarm callbacks drop it before
/// touching processor state.
pub struct LogEventProcessor {
    state: Mutex<ProcessorState>,
    /// Next anomaly alarm deadline in elapsed milliseconds; 0 = none.
    next_anomaly_alarm_ms: Mutex<i64>,

    uid_map: Arc<UidMap>,
    pullers: Arc<PullerManager>,
    anomaly_monitor: Arc<AlarmMonitor>,
    periodic_monitor: Arc<AlarmMonitor>,
    stats: Arc<ProcessorStats>,
    state_manager: Arc<StateManager>,
    storage: Arc<Storage>,
    restricted_store: Arc<dyn RestrictedStore>,
    filter: Arc<EventFilter>,

    guardrails: GuardrailConfig,
    restricted_metrics_enabled: bool,
    time_base_ns: i64,

    broadcasters: Broadcasters,
}

impl LogEventProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uid_map: Arc<UidMap>,
        pullers: Arc<PullerManager>,
        anomaly_monitor: Arc<AlarmMonitor>,
        periodic_monitor: Arc<AlarmMonitor>,
        stats: Arc<ProcessorStats>,
        state_manager: Arc<StateManager>,
        storage: Arc<Storage>,
        restricted_store: Arc<dyn RestrictedStore>,
        filter: Arc<EventFilter>,
        time_base_ns: i64,
        guardrails: GuardrailConfig,
        restricted_metrics_enabled: bool,
        broadcasters: Broadcasters,
    ) -> Self {
        let processor = Self {
            state: Mutex::new(ProcessorState {
                managers: BTreeMap::new(),
                last_broadcast_times: HashMap::new(),
                last_activation_broadcast_times: HashMap::new(),
                last_byte_size_times: HashMap::new(),
                dump_report_numbers: HashMap::new(),
                on_disk_data_configs: BTreeSet::new(),
                last_ttl_time_ns: 0,
                last_flush_restricted_time_ns: 0,
                last_db_guardrail_time_ns: 0,
                last_puller_cache_clear_sec: 0,
                last_write_time_ns: 0,
                last_active_write_ns: 0,
                last_metadata_write_ns: 0,
            }),
            next_anomaly_alarm_ms: Mutex::new(0),
            uid_map,
            pullers,
            anomaly_monitor,
            periodic_monitor,
            stats,
            state_manager,
            storage,
            restricted_store,
            filter,
            guardrails,
            restricted_metrics_enabled,
            time_base_ns,
            broadcasters,
        };

        processor.pullers.force_clear_cache();
        {
            let state = processor.state.lock();
            processor.update_event_filter(&state);
        }
        processor
    }

    /// Atom ids the ingress must always parse in full, before any
    /// configuration contributes its own.
    pub fn default_atom_id_set() -> HashSet<i32> {
        [
            atom::BINARY_PUSH_STATE_CHANGED,
            atom::ISOLATED_UID_CHANGED,
            atom::APP_BREADCRUMB_REPORTED,
            atom::WATCHDOG_ROLLBACK_OCCURRED,
            atom::ANOMALY_DETECTED,
            atom::STATS_SOCKET_LOSS_REPORTED,
        ]
        .into_iter()
        .collect()
    }

    pub fn uid_map(&self) -> &Arc<UidMap> {
        &self.uid_map
    }

    pub fn stats(&self) -> &Arc<ProcessorStats> {
        &self.stats
    }

    // --- Event ingest ---

    pub fn on_log_event(&self, event: &mut LogEvent) {
        self.on_log_event_at(event, clock::elapsed_ns());
    }

    /// Applies one event. Always completes; malformed events are counted
    /// and dropped, never surfaced to the producer.
    pub fn on_log_event_at(&self, event: &mut LogEvent, elapsed_realtime_ns: i64) {
        let mut state = self.state.lock();

        let event_elapsed_ns = event.elapsed_ns();
        let atom_id = event.atom_id();
        self.stats.note_atom_logged(atom_id, event.is_header_only());
        if !event.is_valid() {
            self.stats.note_atom_error(atom_id);
            return;
        }

        // Hard-coded handlers may rewrite the event from on-disk train info
        // before any manager sees it.
        if atom_id == atom::BINARY_PUSH_STATE_CHANGED {
            self.on_binary_push_state_changed(event);
        }
        if atom_id == atom::WATCHDOG_ROLLBACK_OCCURRED {
            self.on_watchdog_rollback_occurred(event);
        }

        self.reset_if_config_ttl_expired(&mut state, event_elapsed_ns);

        if atom_id == atom::ISOLATED_UID_CHANGED {
            self.on_isolated_uid_changed(event);
        } else {
            self.remap_isolated_uids(event);
        }

        self.state_manager.on_log_event(event);

        if state.managers.is_empty() {
            return;
        }

        // The anomaly deadline lives under its own mutex; taking it while
        // holding the metrics mutex is the permitted order.
        let fire_alarm = {
            let mut next_ms = self.next_anomaly_alarm_ms.lock();
            if *next_ms != 0 && clock::millis_to_nanos(*next_ms) <= elapsed_realtime_ns {
                *next_ms = 0;
                true
            } else {
                false
            }
        };
        if fire_alarm {
            self.inform_anomaly_alarm_fired(&mut state, clock::nanos_to_millis(elapsed_realtime_ns));
        }

        let cur_time_sec = elapsed_realtime_ns / NS_PER_SEC;
        if cur_time_sec - state.last_puller_cache_clear_sec
            > self.guardrails.puller_cache_clear_interval_sec()
        {
            self.pullers.clear_cache_if_necessary(cur_time_sec * NS_PER_SEC);
            state.last_puller_cache_clear_sec = cur_time_sec;
        }

        self.flush_restricted_data_if_necessary(&mut state, elapsed_realtime_ns);
        self.enforce_data_ttls_if_necessary(&mut state, clock::wall_clock_ns(), elapsed_realtime_ns);
        self.enforce_db_guardrails_if_necessary(&mut state, clock::wall_clock_ns(), elapsed_realtime_ns);

        if !self.validate_app_breadcrumb_event(event) {
            return;
        }

        let mut uids_with_changes: BTreeSet<i32> = BTreeSet::new();
        let mut active_configs_per_uid: HashMap<i32, Vec<i64>> = HashMap::new();

        let keys: Vec<ConfigKey> = state.managers.keys().copied().collect();
        for key in keys {
            let Some(manager) = state.managers.get_mut(&key) else {
                continue;
            };
            if event.is_restricted() && !manager.has_restricted_metrics_delegate() {
                continue;
            }
            let was_active = manager.is_active();
            manager.on_log_event(event);
            let is_active = manager.is_active();

            if is_active {
                active_configs_per_uid.entry(key.uid).or_default().push(key.id);
            }
            if was_active != is_active {
                debug!(uid = key.uid, id = key.id, is_active, "activation state changed");
                uids_with_changes.insert(key.uid);
                self.stats.note_active_status_changed(key, is_active);
            }
            self.flush_if_necessary(&mut state, key, elapsed_realtime_ns);
        }

        for uid in uids_with_changes {
            if let Some(&last) = state.last_activation_broadcast_times.get(&uid) {
                if elapsed_realtime_ns - last < self.guardrails.min_activation_broadcast_period_ns()
                {
                    self.stats.note_activation_broadcast_guardrail_hit(uid);
                    continue;
                }
            }
            let configs = active_configs_per_uid.get(&uid).cloned().unwrap_or_default();
            if (self.broadcasters.send_activation_broadcast)(uid, &configs) {
                state
                    .last_activation_broadcast_times
                    .insert(uid, elapsed_realtime_ns);
            }
        }
    }

    // --- Hard-coded atoms ---

    fn on_binary_push_state_changed(&self, event: &mut LogEvent) {
        if !(self.broadcasters.check_train_permission)(event.logger_uid(), event.logger_pid()) {
            return;
        }

        let parsed = (|| -> Result<(TrainInfo, bool), crate::event::FieldError> {
            let experiment_ids = ExperimentIds::parse(event.bytes(7)?).map_err(|_| {
                crate::event::FieldError::WrongType(7)
            })?;
            Ok((
                TrainInfo {
                    train_name: event.string(1)?.to_string(),
                    train_version_code: event.long(2)?,
                    requires_staging: event.bool(3)?,
                    rollback_enabled: event.bool(4)?,
                    requires_low_latency_monitor: event.bool(5)?,
                    status: event.long(6)? as i32,
                    experiment_ids,
                },
                event.bool(10)?,
            ))
        })();
        let (mut info, is_rollback) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "malformed install-state atom");
                return;
            }
        };

        if !self.update_train_info_on_disk(is_rollback, &mut info) {
            return;
        }

        let serialized = ExperimentIds::serialize(&info.experiment_ids);
        let user_id = event.logger_uid() / 100_000;

        event.set_value(2, Value::Long(info.train_version_code));
        event.set_value(7, Value::Bytes(serialized));
        event.set_value(8, Value::Int(user_id));

        // On rollback the event's own flags describe the rolled-back build;
        // the on-disk flags are authoritative.
        if is_rollback {
            event.set_value(3, Value::Bool(info.requires_staging));
            event.set_value(4, Value::Bool(info.rollback_enabled));
            event.set_value(5, Value::Bool(info.requires_low_latency_monitor));
        }
    }

    /// Reconciles the incoming train record with the on-disk one and writes
    /// the result back. Returns false when the train is unknown, in which
    /// case neither the disk nor the event is touched.
    fn update_train_info_on_disk(&self, is_rollback: bool, info: &mut TrainInfo) -> bool {
        if info.train_name.is_empty() {
            return false;
        }
        let Some(on_disk) = self.storage.read_train_info(&info.train_name) else {
            return false;
        };

        let mut reset_experiment_ids = false;
        // Keep the old train version if we received an empty one.
        if info.train_version_code == -1 {
            info.train_version_code = on_disk.train_version_code;
        } else if info.train_version_code != on_disk.train_version_code {
            reset_experiment_ids = true;
        }
        if !info.experiment_ids.is_empty()
            && (on_disk.experiment_ids.is_empty()
                || info.experiment_ids[0] != on_disk.experiment_ids[0])
        {
            reset_experiment_ids = true;
        }

        // A rollback never resets: the on-disk ids describe the experiment
        // being rolled back.
        if !reset_experiment_ids || is_rollback {
            info.experiment_ids = on_disk.experiment_ids.clone();
        }

        if !info.experiment_ids.is_empty() {
            let first = info.experiment_ids[0];
            let derived = match info.status {
                crate::event::push_state::INSTALL_SUCCESS => Some(first + 1),
                crate::event::push_state::INSTALLER_ROLLBACK_INITIATED => Some(first + 2),
                crate::event::push_state::INSTALLER_ROLLBACK_SUCCESS => Some(first + 3),
                _ => None,
            };
            if let Some(id) = derived {
                if !info.experiment_ids.contains(&id) {
                    info.experiment_ids.push(id);
                }
            }
        }

        if is_rollback {
            info.requires_staging = on_disk.requires_staging;
            info.rollback_enabled = on_disk.rollback_enabled;
            info.requires_low_latency_monitor = on_disk.requires_low_latency_monitor;
        }

        self.storage.write_train_info(info);
        true
    }

    fn on_watchdog_rollback_occurred(&self, event: &mut LogEvent) {
        if !(self.broadcasters.check_train_permission)(event.logger_uid(), event.logger_pid()) {
            return;
        }

        let (rollback_type, package_name) = match (event.int(1), event.string(2)) {
            (Ok(t), Ok(p)) => (t, p.to_string()),
            _ => {
                warn!("malformed watchdog-rollback atom");
                return;
            }
        };
        if package_name.is_empty() {
            return;
        }

        let experiment_ids = self.process_watchdog_rollback(rollback_type, &package_name);
        event.set_value(6, Value::Bytes(ExperimentIds::serialize(&experiment_ids)));
    }

    /// The event's package name doubles as the train name.
    fn process_watchdog_rollback(&self, rollback_type: i32, package_name: &str) -> Vec<i64> {
        let Some(mut on_disk) = self.storage.read_train_info(package_name) else {
            return Vec::new();
        };
        if on_disk.experiment_ids.is_empty() {
            return Vec::new();
        }

        let first = on_disk.experiment_ids[0];
        let derived = match rollback_type {
            crate::event::rollback_type::INITIATE => Some(first + 4),
            crate::event::rollback_type::SUCCESS => Some(first + 5),
            _ => None,
        };
        if let Some(id) = derived {
            if !on_disk.experiment_ids.contains(&id) {
                on_disk.experiment_ids.push(id);
            }
            self.storage.write_train_info(&on_disk);
        }

        on_disk.experiment_ids
    }

    fn on_isolated_uid_changed(&self, event: &LogEvent) {
        let (parent, isolated, is_create) = match (event.long(1), event.long(2), event.bool(3)) {
            (Ok(p), Ok(i), Ok(c)) => (p as i32, i as i32, c),
            _ => {
                warn!("failed to parse isolated uid change event");
                return;
            }
        };
        if is_create {
            self.uid_map.assign_isolated_uid(isolated, parent);
        } else {
            self.uid_map.remove_isolated_uid(isolated);
        }
    }

    fn remap_isolated_uids(&self, event: &mut LogEvent) {
        let positions: Vec<usize> = event.uid_field_positions().to_vec();
        for pos in positions {
            if let Ok(uid) = event.long(pos) {
                let host = self.uid_map.host_uid_or_self(uid as i32);
                event.set_value(pos, Value::Long(i64::from(host)));
            }
        }
    }

    /// A breadcrumb's claimed uid must match its logger (post remap) unless
    /// the logger is the daemon itself, and the state must be in [0, 3].
    fn validate_app_breadcrumb_event(&self, event: &LogEvent) -> bool {
        if event.atom_id() != atom::APP_BREADCRUMB_REPORTED {
            return true;
        }
        let size = event.size();

        // The uid is third from last, the state is the last field.
        let Ok(app_hook_uid) = event.long(size.saturating_sub(2)) else {
            return false;
        };
        let logger_uid = self.uid_map.host_uid_or_self(event.logger_uid());
        if i64::from(logger_uid) != app_hook_uid && logger_uid != DAEMON_UID {
            debug!(app_hook_uid, logger_uid, "breadcrumb uid mismatch");
            return false;
        }

        let Ok(state) = event.long(size) else {
            return false;
        };
        (0..=3).contains(&state)
    }

    // --- Config lifecycle ---

    pub fn on_config_updated(
        &self,
        timestamp_ns: i64,
        wall_clock_ns: i64,
        key: ConfigKey,
        config: &StatsdConfig,
        modular_update: bool,
    ) {
        let mut state = self.state.lock();
        self.write_data_for_key(
            &mut state,
            key,
            timestamp_ns,
            wall_clock_ns,
            DumpReportReason::ConfigUpdated,
            DumpLatency::NoTimeConstraints,
        );
        self.on_config_updated_locked(&mut state, timestamp_ns, key, config, modular_update);
    }

    fn on_config_updated_locked(
        &self,
        state: &mut ProcessorState,
        timestamp_ns: i64,
        key: ConfigKey,
        config: &StatsdConfig,
        mut modular_update: bool,
    ) {
        debug!(key = %key, modular_update, "configuration updated");

        let previous_delegate: Option<String> = state
            .managers
            .get(&key)
            .and_then(|m| m.restricted_metrics_delegate().map(str::to_string));

        if let Some(existing) = state.managers.get(&key) {
            if existing.has_restricted_metrics_delegate()
                != config.restricted_metrics_delegate.is_some()
            {
                // A delegate flip invalidates the stored rows wholesale.
                modular_update = false;
            }
            if !modular_update && existing.has_restricted_metrics_delegate() {
                self.stats.note_db_deletion_config_updated(key);
                self.restricted_store.delete_db(key);
            }
        }

        let config_valid;
        if !modular_update || !state.managers.contains_key(&key) {
            let mut new_manager = MetricsManager::new(
                key,
                config,
                self.time_base_ns,
                timestamp_ns,
                Arc::clone(&self.stats),
                Arc::clone(&self.state_manager),
                &self.anomaly_monitor,
                &self.periodic_monitor,
            );
            config_valid = new_manager.is_config_valid();
            if config_valid {
                new_manager.init();
                new_manager.refresh_ttl(timestamp_ns);
                if let Some(delegate) = new_manager.restricted_metrics_delegate() {
                    (self.broadcasters.send_restricted_metrics_broadcast)(
                        key,
                        delegate,
                        &new_manager.all_metric_ids(),
                    );
                    if let Err(e) = self.restricted_store.update_device_info(key) {
                        warn!(key = %key, error = %e, "preparing restricted db failed");
                        self.stats.note_device_info_table_creation_failed(key);
                    }
                } else if let Some(delegate) = &previous_delegate {
                    (self.broadcasters.send_restricted_metrics_broadcast)(key, delegate, &[]);
                }
                state.managers.insert(key, new_manager);
            }
        } else {
            let manager = state
                .managers
                .get_mut(&key)
                .expect("checked contains_key above");
            config_valid = manager.update_config(
                config,
                self.time_base_ns,
                timestamp_ns,
                &self.anomaly_monitor,
                &self.periodic_monitor,
            );
            if config_valid {
                if let Some(delegate) = manager.restricted_metrics_delegate() {
                    let delegate = delegate.to_string();
                    let metric_ids = manager.all_metric_ids();
                    (self.broadcasters.send_restricted_metrics_broadcast)(
                        key,
                        &delegate,
                        &metric_ids,
                    );
                }
            }
        }

        if config_valid {
            // Restricted data never carries the uid map, so those configs
            // opt out of delta tracking.
            if config.restricted_metrics_delegate.is_none() {
                self.uid_map.on_config_updated(key);
            } else {
                self.uid_map.on_config_removed(key);
            }
            self.storage.write_config(key, &config.to_bytes());
        } else {
            warn!(key = %key, "invalid configuration, dropping");
            if let Some(existing) = state.managers.get(&key) {
                if let Some(delegate) = existing.restricted_metrics_delegate() {
                    (self.broadcasters.send_restricted_metrics_broadcast)(key, delegate, &[]);
                    self.stats.note_db_config_invalid(key);
                    self.restricted_store.delete_db(key);
                }
            }
            state.managers.remove(&key);
            self.uid_map.on_config_removed(key);
            self.storage.delete_config(key);
        }

        self.update_event_filter(state);
    }

    pub fn on_config_removed(&self, key: ConfigKey) {
        let mut state = self.state.lock();

        if state.managers.contains_key(&key) {
            self.write_data_for_key(
                &mut state,
                key,
                clock::elapsed_ns(),
                clock::wall_clock_ns(),
                DumpReportReason::ConfigRemoved,
                DumpLatency::NoTimeConstraints,
            );
            if let Some(manager) = state.managers.get(&key) {
                if let Some(delegate) = manager.restricted_metrics_delegate() {
                    self.stats.note_db_deletion_config_removed(key);
                    self.restricted_store.delete_db(key);
                    (self.broadcasters.send_restricted_metrics_broadcast)(key, delegate, &[]);
                }
            }
            state.managers.remove(&key);
            self.uid_map.on_config_removed(key);
        }
        self.stats.note_config_removed(key);
        self.storage.delete_config(key);

        state.last_broadcast_times.remove(&key);
        state.last_byte_size_times.remove(&key);
        state.dump_report_numbers.remove(&key);
        state.on_disk_data_configs.remove(&key);

        let last_config_for_uid = !state.managers.keys().any(|k| k.uid == key.uid);
        if last_config_for_uid {
            state.last_activation_broadcast_times.remove(&key.uid);
        }

        if state.managers.is_empty() {
            self.pullers.force_clear_cache();
        }

        self.update_event_filter(&state);
    }

    /// Resets every configuration from its disk backup.
    pub fn reset_configs(&self) {
        let mut state = self.state.lock();
        let keys: Vec<ConfigKey> = state.managers.keys().copied().collect();
        let now = clock::elapsed_ns();
        self.reset_configs_locked(&mut state, now, &keys);
    }

    fn reset_if_config_ttl_expired(&self, state: &mut ProcessorState, event_time_ns: i64) {
        let expired: Vec<ConfigKey> = state
            .managers
            .iter()
            .filter(|(_, m)| !m.is_in_ttl(event_time_ns))
            .map(|(k, _)| *k)
            .collect();
        if expired.is_empty() {
            return;
        }

        // The reset write skips the cool-down: losing the dying config's
        // data to the throttle would defeat the reset.
        let wall_clock_ns = clock::wall_clock_ns();
        let keys: Vec<ConfigKey> = state.managers.keys().copied().collect();
        for key in keys {
            self.write_data_for_key(
                state,
                key,
                event_time_ns,
                wall_clock_ns,
                DumpReportReason::ConfigReset,
                DumpLatency::NoTimeConstraints,
            );
        }
        self.reset_configs_locked(state, event_time_ns, &expired);
    }

    fn reset_configs_locked(
        &self,
        state: &mut ProcessorState,
        timestamp_ns: i64,
        keys: &[ConfigKey],
    ) {
        for key in keys {
            let backup = self
                .storage
                .read_config(*key)
                .and_then(|bytes| StatsdConfig::from_bytes(&bytes));
            match backup {
                Some(config) => {
                    self.on_config_updated_locked(state, timestamp_ns, *key, &config, false);
                    self.stats.note_config_reset(*key);
                }
                None => {
                    warn!(key = %key, "no config backup on disk, refreshing ttl in place");
                    if let Some(manager) = state.managers.get_mut(key) {
                        manager.refresh_ttl(timestamp_ns);
                    }
                }
            }
        }
    }

    // --- Reports ---

    /// Serializes the ConfigMetricsReportList for one key, including any
    /// reports persisted by previous boots.
    #[allow(clippy::too_many_arguments)]
    pub fn on_dump_report(
        &self,
        key: ConfigKey,
        dump_time_ns: i64,
        wall_clock_ns: i64,
        include_current_partial_bucket: bool,
        erase_data: bool,
        reason: DumpReportReason,
        latency: DumpLatency,
    ) -> Vec<u8> {
        let mut state = self.state.lock();

        if let Some(manager) = state.managers.get(&key) {
            if manager.has_restricted_metrics_delegate() {
                warn!(key = %key, "restricted configs dump through the query path");
                return Vec::new();
            }
        }

        let mut out = ProtoOutput::new();
        out.write_message(
            FIELD_ID_CONFIG_KEY,
            &ConfigKeyMsg {
                uid: key.uid,
                id: key.id,
            },
        );

        let keep_file = state
            .managers
            .get(&key)
            .is_some_and(MetricsManager::should_persist_local_history);
        self.storage
            .append_reports(key, &mut out, erase_data && !keep_file);

        if state.managers.contains_key(&key) {
            // Erasing restarts the broadcast rate limiter so a refilling
            // buffer can be fetched promptly.
            if erase_data {
                state.last_broadcast_times.remove(&key);
            }

            let manager = state.managers.get_mut(&key).expect("checked above");
            let buffer = self.build_config_metrics_report(
                manager,
                dump_time_ns,
                wall_clock_ns,
                include_current_partial_bucket,
                erase_data,
                reason,
                latency,
                false,
            );
            out.write_blob(FIELD_ID_REPORTS, &buffer);
        } else {
            warn!(key = %key, "config does not exist");
        }

        if erase_data {
            *state.dump_report_numbers.entry(key).or_insert(0) += 1;
        }
        let report_number = state.dump_report_numbers.get(&key).copied().unwrap_or(0);
        out.write_int32(FIELD_ID_REPORT_NUMBER, report_number);
        out.write_int32(FIELD_ID_STATS_ID, self.stats.stats_id() as i32);

        if erase_data {
            self.stats
                .note_metrics_report_sent(key, out.len(), report_number);
        }
        out.into_bytes()
    }

    /// Builds one in-memory ConfigMetricsReport for the manager.
    #[allow(clippy::too_many_arguments)]
    fn build_config_metrics_report(
        &self,
        manager: &mut MetricsManager,
        dump_time_ns: i64,
        wall_clock_ns: i64,
        include_partial: bool,
        erase_data: bool,
        reason: DumpReportReason,
        latency: DumpLatency,
        data_saved_to_disk: bool,
    ) -> Vec<u8> {
        let last_report_ns = manager.last_report_time_ns();
        let last_report_wall_ns = manager.last_report_wall_clock_ns();

        let mut str_set: BTreeSet<String> = BTreeSet::new();
        let mut out = ProtoOutput::new();

        manager.on_dump_report(
            dump_time_ns,
            wall_clock_ns,
            include_partial,
            erase_data,
            latency,
            &mut str_set,
            &mut out,
        );

        // An empty config skips the uid map.
        if manager.num_metrics() > 0 {
            let mapping = self.uid_map.snapshot(
                dump_time_ns,
                manager.key(),
                manager.certificate_hash_bytes(),
            );
            out.write_message(FIELD_ID_UID_MAP, &mapping);
        }

        out.write_int64(FIELD_ID_LAST_REPORT_ELAPSED_NANOS, last_report_ns);
        out.write_int64(FIELD_ID_CURRENT_REPORT_ELAPSED_NANOS, dump_time_ns);
        out.write_int64(FIELD_ID_LAST_REPORT_WALL_CLOCK_NANOS, last_report_wall_ns);
        out.write_int64(FIELD_ID_CURRENT_REPORT_WALL_CLOCK_NANOS, wall_clock_ns);
        out.write_int32(FIELD_ID_DUMP_REPORT_REASON, reason as i32);

        for s in &str_set {
            out.write_string(FIELD_ID_STRINGS, s);
        }

        if self.stats.has_event_queue_overflow() {
            out.write_int32(
                FIELD_ID_DATA_CORRUPTED_REASON,
                DATA_CORRUPTED_EVENT_QUEUE_OVERFLOW,
            );
        }
        if self.stats.has_socket_loss() {
            out.write_int32(FIELD_ID_DATA_CORRUPTED_REASON, DATA_CORRUPTED_SOCKET_LOSS);
        }

        let buffer = out.into_bytes();

        if erase_data && !data_saved_to_disk && manager.should_persist_local_history() {
            self.storage
                .write_history(wall_clock_ns / NS_PER_SEC, manager.key(), &buffer);
        }
        buffer
    }

    // --- Memory pressure ---

    /// Byte-size guardrail for one config, run after each event it saw.
    fn flush_if_necessary(
        &self,
        state: &mut ProcessorState,
        key: ConfigKey,
        elapsed_realtime_ns: i64,
    ) {
        if let Some(&last_check) = state.last_byte_size_times.get(&key) {
            if elapsed_realtime_ns - last_check < self.guardrails.min_byte_size_check_period_ns() {
                return;
            }
        }

        // byteSize() walks every bucket, hence the rate limit above.
        let (total_bytes, max_bytes, trigger_bytes, restricted) = {
            let Some(manager) = state.managers.get(&key) else {
                return;
            };
            let trigger = if manager.has_restricted_metrics_delegate() {
                self.guardrails.bytes_per_restricted_config_trigger_flush
            } else {
                manager.trigger_get_data_bytes()
            };
            (
                manager.byte_size(),
                manager.max_metrics_bytes(),
                trigger,
                manager.has_restricted_metrics_delegate(),
            )
        };
        state.last_byte_size_times.insert(key, elapsed_realtime_ns);

        if total_bytes > max_bytes {
            // Too late to flush; drop.
            if let Some(manager) = state.managers.get_mut(&key) {
                manager.drop_data(elapsed_realtime_ns);
            }
            self.stats.note_data_dropped(key, total_bytes);
            return;
        }

        let request_dump =
            total_bytes > trigger_bytes || state.on_disk_data_configs.contains(&key);
        if !request_dump {
            return;
        }

        if restricted {
            if let Some(manager) = state.managers.get_mut(&key) {
                manager.flush_restricted_data(&*self.restricted_store);
            }
            return;
        }

        if let Some(&last_broadcast) = state.last_broadcast_times.get(&key) {
            if elapsed_realtime_ns - last_broadcast < self.guardrails.min_broadcast_period_ns() {
                debug!(key = %key, "broadcast suppressed by rate limit");
                return;
            }
        }
        if (self.broadcasters.send_broadcast)(key) {
            state.on_disk_data_configs.remove(&key);
            state.last_broadcast_times.insert(key, elapsed_realtime_ns);
            self.stats.note_broadcast_sent(key);
        }
    }

    // --- Persistence ---

    /// Writes every opted-in configuration's pending data to disk. One call
    /// per cool-down period; extra calls are dropped to keep wall-clock
    /// file names unique.
    pub fn write_data_to_disk(
        &self,
        reason: DumpReportReason,
        latency: DumpLatency,
        elapsed_realtime_ns: i64,
        wall_clock_ns: i64,
    ) {
        let mut state = self.state.lock();
        if elapsed_realtime_ns
            < state.last_write_time_ns + self.guardrails.write_data_cooldown_ns()
        {
            info!("skipping data write, wrote within the cool-down period");
            return;
        }
        state.last_write_time_ns = elapsed_realtime_ns;

        let keys: Vec<ConfigKey> = state.managers.keys().copied().collect();
        for key in keys {
            self.write_data_for_key(&mut state, key, elapsed_realtime_ns, wall_clock_ns, reason, latency);
        }
    }

    fn write_data_for_key(
        &self,
        state: &mut ProcessorState,
        key: ConfigKey,
        timestamp_ns: i64,
        wall_clock_ns: i64,
        reason: DumpReportReason,
        latency: DumpLatency,
    ) {
        let Some(manager) = state.managers.get_mut(&key) else {
            return;
        };
        if !manager.should_write_to_disk() {
            return;
        }
        if manager.has_restricted_metrics_delegate() {
            manager.flush_restricted_data(&*self.restricted_store);
            return;
        }

        let buffer = self.build_config_metrics_report(
            manager,
            timestamp_ns,
            wall_clock_ns,
            true,
            true,
            reason,
            latency,
            true,
        );
        self.storage
            .write_report(wall_clock_ns / NS_PER_SEC, key, &buffer);

        // Data is on disk now; trigger collection at the next opportunity.
        state.on_disk_data_configs.insert(key);
    }

    pub fn save_active_configs_to_disk(&self, current_time_ns: i64) {
        let mut state = self.state.lock();
        let now = clock::elapsed_ns();
        if now < state.last_active_write_ns + self.guardrails.write_data_cooldown_ns() {
            info!("skipping active-config write, wrote within the cool-down period");
            return;
        }
        state.last_active_write_ns = now;

        let list = Self::active_configs_proto(&state, current_time_ns);
        self.storage.write_active_configs(&list);
    }

    /// Active state for every manager, for callers that stream it out.
    pub fn write_active_configs_to_proto(
        &self,
        current_time_ns: i64,
        _reason: DumpReportReason,
    ) -> ActiveConfigList {
        let state = self.state.lock();
        Self::active_configs_proto(&state, current_time_ns)
    }

    fn active_configs_proto(state: &ProcessorState, current_time_ns: i64) -> ActiveConfigList {
        ActiveConfigList {
            config: state
                .managers
                .values()
                .filter_map(|m| m.write_active_config(current_time_ns))
                .collect(),
        }
    }

    /// Called once at daemon start, before events flow.
    pub fn load_active_configs_from_disk(&self) {
        let mut state = self.state.lock();
        let Some(list) = self.storage.take_active_configs() else {
            return;
        };
        let time_base_ns = self.time_base_ns;
        Self::set_configs_active_state_locked(&mut state, &list, time_base_ns);
    }

    pub fn set_configs_active_state(&self, list: &ActiveConfigList, current_time_ns: i64) {
        let mut state = self.state.lock();
        Self::set_configs_active_state_locked(&mut state, list, current_time_ns);
    }

    fn set_configs_active_state_locked(
        state: &mut ProcessorState,
        list: &ActiveConfigList,
        current_time_ns: i64,
    ) {
        for config in &list.config {
            let key = ConfigKey::new(config.uid, config.id);
            match state.managers.get_mut(&key) {
                Some(manager) => manager.load_active_config(config, current_time_ns),
                None => warn!(key = %key, "no config found for persisted active state"),
            }
        }
    }

    pub fn save_metadata_to_disk(&self, current_wall_clock_ns: i64, system_elapsed_ns: i64) {
        let mut state = self.state.lock();
        if system_elapsed_ns < state.last_metadata_write_ns + self.guardrails.write_data_cooldown_ns()
        {
            info!("skipping metadata write, wrote within the cool-down period");
            return;
        }
        state.last_metadata_write_ns = system_elapsed_ns;

        let list = Self::metadata_proto(&state, current_wall_clock_ns, system_elapsed_ns);
        self.storage.write_metadata(&list);
    }

    pub fn write_metadata_to_proto(
        &self,
        current_wall_clock_ns: i64,
        system_elapsed_ns: i64,
    ) -> StatsMetadataList {
        let state = self.state.lock();
        Self::metadata_proto(&state, current_wall_clock_ns, system_elapsed_ns)
    }

    fn metadata_proto(
        state: &ProcessorState,
        current_wall_clock_ns: i64,
        system_elapsed_ns: i64,
    ) -> StatsMetadataList {
        StatsMetadataList {
            stats_metadata: state
                .managers
                .values()
                .filter_map(|m| m.write_metadata(current_wall_clock_ns, system_elapsed_ns))
                .collect(),
        }
    }

    pub fn load_metadata_from_disk(&self, current_wall_clock_ns: i64, system_elapsed_ns: i64) {
        let mut state = self.state.lock();
        let Some(list) = self.storage.take_metadata() else {
            return;
        };
        Self::set_metadata_state_locked(&mut state, &list, current_wall_clock_ns, system_elapsed_ns);
    }

    pub fn set_metadata_state(
        &self,
        list: &StatsMetadataList,
        current_wall_clock_ns: i64,
        system_elapsed_ns: i64,
    ) {
        let mut state = self.state.lock();
        Self::set_metadata_state_locked(&mut state, list, current_wall_clock_ns, system_elapsed_ns);
    }

    fn set_metadata_state_locked(
        state: &mut ProcessorState,
        list: &StatsMetadataList,
        current_wall_clock_ns: i64,
        system_elapsed_ns: i64,
    ) {
        for metadata in &list.stats_metadata {
            let Some(key_msg) = &metadata.config_key else {
                continue;
            };
            let key = ConfigKey::new(key_msg.uid, key_msg.id);
            match state.managers.get_mut(&key) {
                Some(manager) => {
                    manager.load_metadata(metadata, current_wall_clock_ns, system_elapsed_ns)
                }
                None => warn!(key = %key, "no config found for persisted metadata"),
            }
        }
    }

    // --- Restricted metrics ---

    /// Runs a restricted query for the unique config `calling_uid` may
    /// access, reporting failure through the callback otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn query_sql(
        &self,
        sql_query: &str,
        min_sql_client_version: i32,
        callback: &dyn QueryCallback,
        config_id: i64,
        config_package: &str,
        calling_uid: i32,
    ) {
        let mut state = self.state.lock();

        if !self.restricted_metrics_enabled {
            warn!("restricted metrics query while the surface is disabled");
            self.stats
                .note_restricted_query_failed(InvalidQueryReason::FlagDisabled);
            return;
        }

        let query_start_ns = clock::elapsed_ns();

        if min_sql_client_version > self.restricted_store.db_version() {
            callback.send_failure(&format!(
                "Unsupported sqlite version. Installed Version: {}, Requested Version: {}.",
                self.restricted_store.db_version(),
                min_sql_client_version
            ));
            self.stats
                .note_restricted_query_failed(InvalidQueryReason::UnsupportedSqliteVersion);
            return;
        }

        let package_uids = self.resolve_package_uids(config_package);
        let (keys, err, reason) =
            self.restricted_keys_to_query(&state, calling_uid, config_id, &package_uids);

        if keys.is_empty() {
            callback.send_failure(&err);
            self.stats.note_restricted_query_failed(reason);
            return;
        }
        if keys.len() > 1 {
            callback.send_failure("Ambiguous ConfigKey");
            self.stats
                .note_restricted_query_failed(InvalidQueryReason::AmbiguousConfigKey);
            return;
        }
        let key = *keys.iter().next().expect("non-empty");

        // Pending rows must be visible to the query, and expired ones not.
        self.flush_restricted_data_locked(&mut state, query_start_ns);
        self.enforce_data_ttls_locked(&mut state, clock::wall_clock_ns(), query_start_ns);

        let result = match self.restricted_store.query(key, sql_query) {
            Ok(result) => result,
            Err(e) => {
                callback.send_failure(&format!("failed to query db {key}: {e}"));
                self.stats
                    .note_restricted_query_failed(InvalidQueryReason::QueryFailure);
                return;
            }
        };

        if result.column_names.len() != result.column_types.len() {
            callback.send_failure("Inconsistent row sizes");
            self.stats
                .note_restricted_query_failed(InvalidQueryReason::InconsistentRowSize);
            return;
        }
        let mut data = Vec::with_capacity(result.rows.len() * result.column_names.len());
        for row in result.rows.iter() {
            if row.len() != result.column_names.len() {
                callback.send_failure("Inconsistent row sizes");
                self.stats
                    .note_restricted_query_failed(InvalidQueryReason::InconsistentRowSize);
                return;
            }
            data.extend(row.iter().cloned());
        }

        let row_count = result.rows.len();
        callback.send_results(data, result.column_names, result.column_types, row_count);
        self.stats
            .note_restricted_query_succeeded(clock::elapsed_ns() - query_start_ns);
    }

    /// Metric ids of the restricted configs `delegate_uid` may query.
    pub fn fill_restricted_metrics(
        &self,
        config_id: i64,
        config_package: &str,
        delegate_uid: i32,
    ) -> Vec<i64> {
        let state = self.state.lock();
        let package_uids = self.resolve_package_uids(config_package);
        let (keys, _, _) =
            self.restricted_keys_to_query(&state, delegate_uid, config_id, &package_uids);

        let mut out = Vec::new();
        for key in keys {
            if let Some(manager) = state.managers.get(&key) {
                out.extend(manager.all_metric_ids());
            }
        }
        out
    }

    fn resolve_package_uids(&self, config_package: &str) -> HashSet<i32> {
        match UidMap::well_known_uid(config_package) {
            Some(uid) => [uid].into_iter().collect(),
            None => self.uid_map.app_uids(config_package),
        }
    }

    fn restricted_keys_to_query(
        &self,
        state: &ProcessorState,
        calling_uid: i32,
        config_id: i64,
        package_uids: &HashSet<i32>,
    ) -> (BTreeSet<ConfigKey>, String, InvalidQueryReason) {
        let matched: BTreeSet<ConfigKey> = package_uids
            .iter()
            .map(|uid| ConfigKey::new(*uid, config_id))
            .filter(|key| state.managers.contains_key(key))
            .collect();

        let result: BTreeSet<ConfigKey> = matched
            .iter()
            .filter(|key| {
                state
                    .managers
                    .get(key)
                    .is_some_and(|m| m.validate_restricted_metrics_delegate(calling_uid, &self.uid_map))
            })
            .copied()
            .collect();

        if matched.is_empty() {
            (
                result,
                "No configs found matching the config key".to_string(),
                InvalidQueryReason::ConfigKeyNotFound,
            )
        } else if result.is_empty() {
            (
                result,
                "No matching configs for restricted metrics delegate".to_string(),
                InvalidQueryReason::ConfigKeyWithUnmatchedDelegate,
            )
        } else {
            (result, String::new(), InvalidQueryReason::QueryFailure)
        }
    }

    pub fn enforce_data_ttls(&self, wall_clock_ns: i64, elapsed_realtime_ns: i64) {
        let mut state = self.state.lock();
        self.enforce_data_ttls_locked(&mut state, wall_clock_ns, elapsed_realtime_ns);
    }

    fn enforce_data_ttls_locked(
        &self,
        state: &mut ProcessorState,
        wall_clock_ns: i64,
        elapsed_realtime_ns: i64,
    ) {
        for manager in state.managers.values() {
            manager.enforce_restricted_data_ttls(&*self.restricted_store, wall_clock_ns);
        }
        state.last_ttl_time_ns = elapsed_realtime_ns;
    }

    fn enforce_data_ttls_if_necessary(
        &self,
        state: &mut ProcessorState,
        wall_clock_ns: i64,
        elapsed_realtime_ns: i64,
    ) {
        if elapsed_realtime_ns - state.last_ttl_time_ns < self.guardrails.min_ttl_check_period_ns()
        {
            return;
        }
        self.enforce_data_ttls_locked(state, wall_clock_ns, elapsed_realtime_ns);
    }

    fn flush_restricted_data_locked(&self, state: &mut ProcessorState, elapsed_realtime_ns: i64) {
        for manager in state.managers.values_mut() {
            manager.flush_restricted_data(&*self.restricted_store);
        }
        state.last_flush_restricted_time_ns = elapsed_realtime_ns;
    }

    fn flush_restricted_data_if_necessary(
        &self,
        state: &mut ProcessorState,
        elapsed_realtime_ns: i64,
    ) {
        if elapsed_realtime_ns - state.last_flush_restricted_time_ns
            < self.guardrails.min_flush_restricted_period_ns()
        {
            return;
        }
        self.flush_restricted_data_locked(state, elapsed_realtime_ns);
    }

    fn enforce_db_guardrails_if_necessary(
        &self,
        state: &mut ProcessorState,
        wall_clock_ns: i64,
        elapsed_realtime_ns: i64,
    ) {
        if elapsed_realtime_ns - state.last_db_guardrail_time_ns
            < self.guardrails.min_db_guardrail_period_ns()
        {
            return;
        }
        self.restricted_store
            .enforce_guardrails(wall_clock_ns / NS_PER_SEC, self.guardrails.max_db_bytes);
        state.last_db_guardrail_time_ns = elapsed_realtime_ns;
    }

    // --- Alarms ---

    pub fn set_anomaly_alarm(&self, elapsed_time_ms: i64) {
        *self.next_anomaly_alarm_ms.lock() = elapsed_time_ms;
    }

    /// A fire already past its deadline becomes a no-op after this.
    pub fn cancel_anomaly_alarm(&self) {
        *self.next_anomaly_alarm_ms.lock() = 0;
    }

    fn inform_anomaly_alarm_fired(&self, state: &mut ProcessorState, elapsed_time_ms: i64) {
        let fired = self
            .anomaly_monitor
            .pop_sooner_than((elapsed_time_ms / 1000) as u32);
        if fired.is_empty() {
            warn!("no anomaly alarm due; it was probably cancelled");
            return;
        }
        debug!(count = fired.len(), "anomaly alarms fired");
        let timestamp_ns = clock::millis_to_nanos(elapsed_time_ms);
        for manager in state.managers.values_mut() {
            manager.on_anomaly_alarm_fired(timestamp_ns, &fired);
        }
    }

    pub fn on_periodic_alarm_fired(&self, timestamp_ns: i64, alarms: &[Arc<Alarm>]) {
        let mut state = self.state.lock();
        for manager in state.managers.values_mut() {
            manager.on_periodic_alarm_fired(timestamp_ns, alarms);
        }
    }

    pub fn periodic_monitor(&self) -> &Arc<AlarmMonitor> {
        &self.periodic_monitor
    }

    pub fn inform_pull_alarm_fired(&self, timestamp_ns: i64) {
        let _state = self.state.lock();
        self.pullers.on_alarm_fired(timestamp_ns);
    }

    // --- Package lifecycle fan-out ---

    pub fn notify_app_upgrade(&self, event_time_ns: i64, apk: &str, _uid: i32, _version: i64) {
        let mut state = self.state.lock();
        debug!(apk, "app upgraded");
        for manager in state.managers.values_mut() {
            manager.notify_app_upgrade(event_time_ns);
        }
    }

    pub fn notify_app_removed(&self, event_time_ns: i64, apk: &str, _uid: i32) {
        let mut state = self.state.lock();
        debug!(apk, "app removed");
        for manager in state.managers.values_mut() {
            manager.notify_app_removed(event_time_ns);
        }
    }

    pub fn on_uid_map_received(&self, event_time_ns: i64) {
        let mut state = self.state.lock();
        for manager in state.managers.values_mut() {
            manager.on_uid_map_received(event_time_ns);
        }
    }

    /// Boot finished: force a bucket split in every manager.
    pub fn on_statsd_init_completed(&self, elapsed_time_ns: i64) {
        let mut state = self.state.lock();
        for manager in state.managers.values_mut() {
            manager.on_statsd_init_completed(elapsed_time_ns);
        }
    }

    // --- Introspection ---

    pub fn get_active_configs(&self, uid: i32) -> Vec<i64> {
        let state = self.state.lock();
        state
            .managers
            .iter()
            .filter(|(key, manager)| key.uid == uid && manager.is_active())
            .map(|(key, _)| key.id)
            .collect()
    }

    pub fn get_metrics_size(&self, key: ConfigKey) -> usize {
        let state = self.state.lock();
        match state.managers.get(&key) {
            Some(manager) => manager.byte_size(),
            None => {
                warn!(key = %key, "config does not exist");
                0
            }
        }
    }

    pub fn get_last_report_time_ns(&self, key: ConfigKey) -> i64 {
        let state = self.state.lock();
        state
            .managers
            .get(&key)
            .map(MetricsManager::last_report_time_ns)
            .unwrap_or(0)
    }

    /// Marks a key as having unreported on-disk data, so the next flush
    /// check requests a dump.
    pub fn note_on_disk_data(&self, key: ConfigKey) {
        let mut state = self.state.lock();
        state.on_disk_data_configs.insert(key);
    }

    pub fn dump_states(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        let _ = writeln!(out, "{} configurations:", state.managers.len());
        for manager in state.managers.values() {
            manager.dump_states(&mut out);
        }
        out
    }

    fn update_event_filter(&self, state: &ProcessorState) {
        let mut atom_ids = Self::default_atom_id_set();
        for manager in state.managers.values() {
            manager.add_all_atom_ids(&mut atom_ids);
        }
        self.state_manager.add_all_atom_ids(&mut atom_ids);
        self.filter.set_atom_ids(atom_ids);
    }
}
