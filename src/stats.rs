use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::ConfigKey;

/// Why a restricted-metrics query was rejected. Values are reported to the
/// caller and recorded here for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum InvalidQueryReason {
    AmbiguousConfigKey = 1,
    ConfigKeyNotFound = 2,
    ConfigKeyWithUnmatchedDelegate = 3,
    FlagDisabled = 4,
    UnsupportedSqliteVersion = 5,
    QueryFailure = 6,
    InconsistentRowSize = 7,
}

/// Process-wide statistics registry.
///
/// Mirrors every side channel the processor needs to account for: per-atom
/// counts, rate-limit hits, drops, restricted-query outcomes. Shared by
/// reference between the processor and the health exporter; counters are
/// lock-free, keyed tables sit behind a mutex off the hot path.
#[derive(Default)]
pub struct ProcessorStats {
    atoms_logged: AtomicU64,
    atom_errors: AtomicU64,
    broadcasts_sent: AtomicU64,
    activation_broadcast_guardrail_hits: AtomicU64,
    data_dropped_events: AtomicU64,
    config_resets: AtomicU64,
    config_removals: AtomicU64,
    anomalies_declared: AtomicU64,
    restricted_query_failures: AtomicU64,
    restricted_query_successes: AtomicU64,
    reports_sent: AtomicU64,

    event_queue_overflow: AtomicBool,
    socket_loss: AtomicBool,

    per_atom_counts: Mutex<HashMap<i32, u64>>,
    per_atom_errors: Mutex<HashMap<i32, u64>>,
    broadcasts_per_key: Mutex<HashMap<ConfigKey, u64>>,
    dropped_bytes_per_key: Mutex<HashMap<ConfigKey, u64>>,
    guardrail_hits_per_uid: Mutex<HashMap<i32, u64>>,
    query_failures_by_reason: Mutex<HashMap<InvalidQueryReason, u64>>,
    db_deletions: Mutex<HashMap<ConfigKey, u64>>,

    /// Distinguishes restarts of the daemon in reports.
    stats_id: i64,
}

impl ProcessorStats {
    pub fn new(stats_id: i64) -> Self {
        Self {
            stats_id,
            ..Default::default()
        }
    }

    pub fn stats_id(&self) -> i64 {
        self.stats_id
    }

    pub fn note_atom_logged(&self, atom_id: i32, _header_only: bool) {
        self.atoms_logged.fetch_add(1, Ordering::Relaxed);
        *self.per_atom_counts.lock().entry(atom_id).or_insert(0) += 1;
    }

    pub fn note_atom_error(&self, atom_id: i32) {
        self.atom_errors.fetch_add(1, Ordering::Relaxed);
        *self.per_atom_errors.lock().entry(atom_id).or_insert(0) += 1;
    }

    pub fn note_broadcast_sent(&self, key: ConfigKey) {
        self.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
        *self.broadcasts_per_key.lock().entry(key).or_insert(0) += 1;
    }

    pub fn note_activation_broadcast_guardrail_hit(&self, uid: i32) {
        self.activation_broadcast_guardrail_hits
            .fetch_add(1, Ordering::Relaxed);
        *self.guardrail_hits_per_uid.lock().entry(uid).or_insert(0) += 1;
    }

    pub fn note_active_status_changed(&self, _key: ConfigKey, _active: bool) {}

    pub fn note_data_dropped(&self, key: ConfigKey, bytes: usize) {
        self.data_dropped_events.fetch_add(1, Ordering::Relaxed);
        *self.dropped_bytes_per_key.lock().entry(key).or_insert(0) += bytes as u64;
    }

    pub fn note_config_reset(&self, _key: ConfigKey) {
        self.config_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_config_removed(&self, _key: ConfigKey) {
        self.config_removals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_anomaly_declared(&self, _alert_id: i64) {
        self.anomalies_declared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_metrics_report_sent(&self, _key: ConfigKey, _size: usize, _report_number: i32) {
        self.reports_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_db_deletion_config_updated(&self, key: ConfigKey) {
        *self.db_deletions.lock().entry(key).or_insert(0) += 1;
    }

    pub fn note_db_deletion_config_removed(&self, key: ConfigKey) {
        *self.db_deletions.lock().entry(key).or_insert(0) += 1;
    }

    pub fn note_db_config_invalid(&self, key: ConfigKey) {
        *self.db_deletions.lock().entry(key).or_insert(0) += 1;
    }

    pub fn note_device_info_table_creation_failed(&self, _key: ConfigKey) {}

    pub fn note_restricted_query_failed(&self, reason: InvalidQueryReason) {
        self.restricted_query_failures.fetch_add(1, Ordering::Relaxed);
        *self
            .query_failures_by_reason
            .lock()
            .entry(reason)
            .or_insert(0) += 1;
    }

    pub fn note_restricted_query_succeeded(&self, _latency_ns: i64) {
        self.restricted_query_successes
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Set by the ingress when its queue overflowed; surfaced in reports.
    pub fn note_event_queue_overflow(&self) {
        self.event_queue_overflow.store(true, Ordering::Relaxed);
    }

    pub fn note_socket_loss(&self) {
        self.socket_loss.store(true, Ordering::Relaxed);
    }

    pub fn has_event_queue_overflow(&self) -> bool {
        self.event_queue_overflow.load(Ordering::Relaxed)
    }

    pub fn has_socket_loss(&self) -> bool {
        self.socket_loss.load(Ordering::Relaxed)
    }

    pub fn atoms_logged(&self) -> u64 {
        self.atoms_logged.load(Ordering::Relaxed)
    }

    pub fn atom_errors(&self) -> u64 {
        self.atom_errors.load(Ordering::Relaxed)
    }

    pub fn broadcasts_sent(&self) -> u64 {
        self.broadcasts_sent.load(Ordering::Relaxed)
    }

    pub fn broadcasts_sent_for(&self, key: ConfigKey) -> u64 {
        self.broadcasts_per_key.lock().get(&key).copied().unwrap_or(0)
    }

    pub fn data_dropped_events(&self) -> u64 {
        self.data_dropped_events.load(Ordering::Relaxed)
    }

    pub fn dropped_bytes_for(&self, key: ConfigKey) -> u64 {
        self.dropped_bytes_per_key
            .lock()
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    pub fn activation_guardrail_hits(&self) -> u64 {
        self.activation_broadcast_guardrail_hits
            .load(Ordering::Relaxed)
    }

    pub fn guardrail_hits_for_uid(&self, uid: i32) -> u64 {
        self.guardrail_hits_per_uid
            .lock()
            .get(&uid)
            .copied()
            .unwrap_or(0)
    }

    pub fn query_failures_for(&self, reason: InvalidQueryReason) -> u64 {
        self.query_failures_by_reason
            .lock()
            .get(&reason)
            .copied()
            .unwrap_or(0)
    }

    pub fn config_resets(&self) -> u64 {
        self.config_resets.load(Ordering::Relaxed)
    }

    pub fn anomalies_declared(&self) -> u64 {
        self.anomalies_declared.load(Ordering::Relaxed)
    }

    pub fn atom_count(&self, atom_id: i32) -> u64 {
        self.per_atom_counts.lock().get(&atom_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_counters() {
        let stats = ProcessorStats::new(7);
        stats.note_atom_logged(47, false);
        stats.note_atom_logged(47, false);
        stats.note_atom_logged(43, true);
        stats.note_atom_error(43);

        assert_eq!(stats.atoms_logged(), 3);
        assert_eq!(stats.atom_count(47), 2);
        assert_eq!(stats.atom_count(43), 1);
        assert_eq!(stats.atom_errors(), 1);
        assert_eq!(stats.stats_id(), 7);
    }

    #[test]
    fn test_broadcast_accounting_per_key() {
        let stats = ProcessorStats::new(0);
        let key = ConfigKey::new(1000, 42);
        stats.note_broadcast_sent(key);
        assert_eq!(stats.broadcasts_sent_for(key), 1);
        assert_eq!(stats.broadcasts_sent_for(ConfigKey::new(1000, 43)), 0);
        assert_eq!(stats.broadcasts_sent(), 1);
    }

    #[test]
    fn test_corruption_flags_latch() {
        let stats = ProcessorStats::new(0);
        assert!(!stats.has_event_queue_overflow());
        assert!(!stats.has_socket_loss());
        stats.note_event_queue_overflow();
        stats.note_socket_loss();
        assert!(stats.has_event_queue_overflow());
        assert!(stats.has_socket_loss());
    }

    #[test]
    fn test_query_failure_reasons() {
        let stats = ProcessorStats::new(0);
        stats.note_restricted_query_failed(InvalidQueryReason::AmbiguousConfigKey);
        stats.note_restricted_query_failed(InvalidQueryReason::AmbiguousConfigKey);
        stats.note_restricted_query_failed(InvalidQueryReason::QueryFailure);
        assert_eq!(
            stats.query_failures_for(InvalidQueryReason::AmbiguousConfigKey),
            2
        );
        assert_eq!(stats.query_failures_for(InvalidQueryReason::QueryFailure), 1);
        assert_eq!(stats.query_failures_for(InvalidQueryReason::FlagDisabled), 0);
    }
}
