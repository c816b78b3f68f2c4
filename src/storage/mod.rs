pub mod restricted;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use prost::Message;
use tracing::warn;

use crate::proto::{
    ActiveConfigList, ProtoOutput, StatsMetadataList, TrainInfoRecord, FIELD_ID_REPORTS,
};
use crate::ConfigKey;

const DATA_DIR: &str = "stats-data";
const HISTORY_DIR: &str = "stats-data-history";
const ACTIVE_DIR: &str = "stats-active-metric";
const METADATA_DIR: &str = "stats-metadata";
const TRAIN_DIR: &str = "train-info";
const CONFIG_DIR: &str = "stats-service";

const ACTIVE_FILE: &str = "active_metrics";
const METADATA_FILE: &str = "metadata";

/// Durable storage for report blobs, train-info records, config backups,
/// and the active/metadata state persisted across reboots.
///
/// Every operation is best-effort: failures are logged and the caller
/// carries on, because the next scheduled write retries anyway.
pub struct Storage {
    root: PathBuf,
}

/// One install-train record, as stored under `train-info/<trainName>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainInfo {
    pub train_name: String,
    pub train_version_code: i64,
    pub requires_staging: bool,
    pub rollback_enabled: bool,
    pub requires_low_latency_monitor: bool,
    pub status: i32,
    pub experiment_ids: Vec<i64>,
}

impl Storage {
    /// Opens (and creates) the storage layout under `root`.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [
            DATA_DIR,
            HISTORY_DIR,
            ACTIVE_DIR,
            METADATA_DIR,
            TRAIN_DIR,
            CONFIG_DIR,
        ] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .with_context(|| format!("creating storage dir {}", path.display()))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn report_file_name(wall_sec: i64, key: ConfigKey) -> String {
        format!("{}_{}_{}", wall_sec, key.uid, key.id)
    }

    /// Parses `<wallSec>_<uid>_<id>` file names back into their parts.
    fn parse_report_file_name(name: &str) -> Option<(i64, ConfigKey)> {
        let mut parts = name.split('_');
        let wall_sec = parts.next()?.parse().ok()?;
        let uid = parts.next()?.parse().ok()?;
        let id = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some((wall_sec, ConfigKey::new(uid, id)))
    }

    /// Persists one serialized report under `stats-data/`.
    pub fn write_report(&self, wall_sec: i64, key: ConfigKey, bytes: &[u8]) {
        let path = self.root.join(DATA_DIR).join(Self::report_file_name(wall_sec, key));
        if let Err(e) = fs::write(&path, bytes) {
            warn!(path = %path.display(), error = %e, "writing report failed");
        }
    }

    /// Persists one locally retained history report.
    pub fn write_history(&self, wall_sec: i64, key: ConfigKey, bytes: &[u8]) {
        let path = self
            .root
            .join(HISTORY_DIR)
            .join(Self::report_file_name(wall_sec, key));
        if let Err(e) = fs::write(&path, bytes) {
            warn!(path = %path.display(), error = %e, "writing history failed");
        }
    }

    /// Appends every persisted report for `key` to `out` as repeated report
    /// fields, oldest first. When `erase` is set the files are deleted after
    /// appending.
    pub fn append_reports(&self, key: ConfigKey, out: &mut ProtoOutput, erase: bool) {
        let dir = self.root.join(DATA_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "scanning report dir failed");
                return;
            }
        };

        let mut matching: Vec<(i64, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((wall_sec, file_key)) = Self::parse_report_file_name(name) else {
                continue;
            };
            if file_key == key {
                matching.push((wall_sec, entry.path()));
            }
        }
        matching.sort();

        for (_, path) in matching {
            match fs::read(&path) {
                Ok(bytes) => {
                    out.write_blob(FIELD_ID_REPORTS, &bytes);
                    if erase {
                        if let Err(e) = fs::remove_file(&path) {
                            warn!(path = %path.display(), error = %e, "deleting report failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "reading report failed");
                }
            }
        }
    }

    /// Whether any persisted report exists for `key`.
    pub fn has_reports(&self, key: ConfigKey) -> bool {
        let dir = self.root.join(DATA_DIR);
        let Ok(entries) = fs::read_dir(&dir) else {
            return false;
        };
        entries.flatten().any(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(Self::parse_report_file_name)
                .is_some_and(|(_, file_key)| file_key == key)
        })
    }

    fn train_path(&self, train_name: &str) -> Option<PathBuf> {
        if train_name.is_empty() || train_name.contains(['/', '\\']) || train_name == ".." {
            return None;
        }
        Some(self.root.join(TRAIN_DIR).join(train_name))
    }

    pub fn read_train_info(&self, train_name: &str) -> Option<TrainInfo> {
        let path = self.train_path(train_name)?;
        let bytes = fs::read(&path).ok()?;
        match TrainInfoRecord::decode(bytes.as_slice()) {
            Ok(record) => Some(TrainInfo {
                train_name: record.train_name,
                train_version_code: record.train_version_code,
                requires_staging: record.requires_staging,
                rollback_enabled: record.rollback_enabled,
                requires_low_latency_monitor: record.requires_low_latency_monitor,
                status: record.status,
                experiment_ids: record.experiment_id,
            }),
            Err(e) => {
                warn!(train = train_name, error = %e, "corrupt train info, deleting");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    pub fn write_train_info(&self, info: &TrainInfo) {
        let Some(path) = self.train_path(&info.train_name) else {
            warn!(train = %info.train_name, "refusing to write train info with bad name");
            return;
        };
        let record = TrainInfoRecord {
            train_version_code: info.train_version_code,
            train_name: info.train_name.clone(),
            status: info.status,
            experiment_id: info.experiment_ids.clone(),
            requires_staging: info.requires_staging,
            rollback_enabled: info.rollback_enabled,
            requires_low_latency_monitor: info.requires_low_latency_monitor,
        };
        if let Err(e) = fs::write(&path, record.encode_to_vec()) {
            warn!(path = %path.display(), error = %e, "writing train info failed");
        }
    }

    /// Backs up a serialized configuration so a TTL reset can reload it.
    pub fn write_config(&self, key: ConfigKey, bytes: &[u8]) {
        let path = self
            .root
            .join(CONFIG_DIR)
            .join(format!("{}_{}", key.uid, key.id));
        if let Err(e) = fs::write(&path, bytes) {
            warn!(path = %path.display(), error = %e, "writing config backup failed");
        }
    }

    pub fn read_config(&self, key: ConfigKey) -> Option<Vec<u8>> {
        let path = self
            .root
            .join(CONFIG_DIR)
            .join(format!("{}_{}", key.uid, key.id));
        fs::read(path).ok()
    }

    pub fn delete_config(&self, key: ConfigKey) {
        let path = self
            .root
            .join(CONFIG_DIR)
            .join(format!("{}_{}", key.uid, key.id));
        let _ = fs::remove_file(path);
    }

    pub fn write_active_configs(&self, list: &ActiveConfigList) {
        let path = self.root.join(ACTIVE_DIR).join(ACTIVE_FILE);
        let _ = fs::remove_file(&path);
        if let Err(e) = fs::write(&path, list.encode_to_vec()) {
            warn!(path = %path.display(), error = %e, "writing active configs failed");
        }
    }

    /// Reads and deletes the persisted active-config list. The file is
    /// consumed on every attempt so stale state never outlives one boot.
    pub fn take_active_configs(&self) -> Option<ActiveConfigList> {
        let path = self.root.join(ACTIVE_DIR).join(ACTIVE_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => {
                let _ = fs::remove_file(&path);
                return None;
            }
        };
        let _ = fs::remove_file(&path);
        match ActiveConfigList::decode(bytes.as_slice()) {
            Ok(list) => Some(list),
            Err(e) => {
                warn!(error = %e, "corrupt active-config list discarded");
                None
            }
        }
    }

    pub fn write_metadata(&self, list: &StatsMetadataList) {
        let path = self.root.join(METADATA_DIR).join(METADATA_FILE);
        let _ = fs::remove_file(&path);
        if list.stats_metadata.is_empty() {
            return;
        }
        if let Err(e) = fs::write(&path, list.encode_to_vec()) {
            warn!(path = %path.display(), error = %e, "writing metadata failed");
        }
    }

    pub fn take_metadata(&self) -> Option<StatsMetadataList> {
        let path = self.root.join(METADATA_DIR).join(METADATA_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => {
                let _ = fs::remove_file(&path);
                return None;
            }
        };
        let _ = fs::remove_file(&path);
        match StatsMetadataList::decode(bytes.as_slice()) {
            Ok(list) => Some(list),
            Err(e) => {
                warn!(error = %e, "corrupt metadata list discarded");
                None
            }
        }
    }

    pub fn restricted_dir(&self) -> PathBuf {
        self.root.join("stats-restricted-data")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("root", &self.root).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_report_round_trip() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let key = ConfigKey::new(1000, 42);

        storage.write_report(100, key, b"first");
        storage.write_report(200, key, b"second");
        storage.write_report(150, ConfigKey::new(2000, 42), b"other");

        assert!(storage.has_reports(key));

        let mut out = ProtoOutput::new();
        storage.append_reports(key, &mut out, true);

        // Two length-delimited blobs for key, oldest first.
        let bytes = out.into_bytes();
        assert!(bytes.windows(5).any(|w| w == b"first"));
        assert!(bytes.windows(6).any(|w| w == b"second"));
        assert!(!bytes.windows(5).any(|w| w == b"other"));

        // Erased after append.
        assert!(!storage.has_reports(key));
        assert!(storage.has_reports(ConfigKey::new(2000, 42)));
    }

    #[test]
    fn test_append_without_erase_keeps_files() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let key = ConfigKey::new(1, 1);

        storage.write_report(100, key, b"blob");
        let mut out = ProtoOutput::new();
        storage.append_reports(key, &mut out, false);
        assert!(storage.has_reports(key));
    }

    #[test]
    fn test_train_info_round_trip() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");

        let info = TrainInfo {
            train_name: "t".into(),
            train_version_code: 5,
            requires_staging: true,
            rollback_enabled: false,
            requires_low_latency_monitor: true,
            status: 3,
            experiment_ids: vec![10, 11],
        };
        storage.write_train_info(&info);

        let read = storage.read_train_info("t").expect("present");
        assert_eq!(read, info);
        assert!(storage.read_train_info("unknown").is_none());
    }

    #[test]
    fn test_train_name_with_separator_rejected() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let info = TrainInfo {
            train_name: "../escape".into(),
            ..Default::default()
        };
        storage.write_train_info(&info);
        assert!(storage.read_train_info("../escape").is_none());
    }

    #[test]
    fn test_active_configs_consumed_on_read() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");

        let list = ActiveConfigList {
            config: vec![crate::proto::ActiveConfig {
                uid: 1000,
                id: 1,
                metric: vec![],
            }],
        };
        storage.write_active_configs(&list);

        assert_eq!(storage.take_active_configs(), Some(list));
        assert_eq!(storage.take_active_configs(), None);
    }

    #[test]
    fn test_empty_metadata_not_written() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        storage.write_metadata(&StatsMetadataList::default());
        assert!(storage.take_metadata().is_none());
    }

    #[test]
    fn test_config_backup_round_trip() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let key = ConfigKey::new(1000, 7);

        storage.write_config(key, b"config-bytes");
        assert_eq!(storage.read_config(key), Some(b"config-bytes".to_vec()));
        storage.delete_config(key);
        assert_eq!(storage.read_config(key), None);
    }
}
