use std::fs;
use std::io::Write;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

use crate::ConfigKey;

/// Column type codes reported with query results.
pub const COLUMN_TYPE_LONG: i32 = 1;
pub const COLUMN_TYPE_TEXT: i32 = 3;

/// Restricted database operation errors.
#[derive(Debug, Error)]
pub enum RestrictedDbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("malformed row for config {0}")]
    MalformedRow(ConfigKey),
}

/// One restricted event row queued by a metrics manager.
#[derive(Debug, Clone, PartialEq)]
pub struct RestrictedRow {
    pub metric_id: i64,
    pub atom_id: i32,
    pub elapsed_ns: i64,
    pub wall_ns: i64,
}

/// Result rows of a restricted query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub rows: Vec<Vec<String>>,
    pub column_names: Vec<String>,
    pub column_types: Vec<i32>,
}

/// Per-config restricted-metrics database, sharded by ConfigKey.
///
/// The SQL engine itself lives outside this crate; the processor only needs
/// this handle. No cross-key transactions exist.
pub trait RestrictedStore: Send + Sync {
    /// Schema version exposed to query clients for compatibility checks.
    fn db_version(&self) -> i32;

    /// Appends flushed rows to the config's database.
    fn insert_rows(&self, key: ConfigKey, rows: &[RestrictedRow]);

    /// Runs a query against the config's database.
    fn query(&self, key: ConfigKey, sql: &str) -> Result<QueryRows, RestrictedDbError>;

    /// Drops the config's database entirely.
    fn delete_db(&self, key: ConfigKey);

    /// Creates or refreshes the device-info table for the config.
    fn update_device_info(&self, key: ConfigKey) -> Result<(), RestrictedDbError>;

    /// Deletes rows whose wall timestamp is older than `cutoff_wall_ns`.
    fn enforce_ttl(&self, key: ConfigKey, cutoff_wall_ns: i64);

    /// Deletes whole databases that exceed `max_bytes`.
    fn enforce_guardrails(&self, wall_sec: i64, max_bytes: u64);
}

/// Flat-file implementation backing the daemon by default.
///
/// Rows are stored one per line as `metricId|atomId|elapsedNs|wallNs` in
/// `<uid>_<id>.db`. Only the canonical full-table query is served; anything
/// else is a query failure, matching the narrow surface delegates use.
pub struct DiskRestrictedStore {
    dir: PathBuf,
}

const DB_VERSION: i32 = 3;

impl DiskRestrictedStore {
    pub fn open(dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn db_path(&self, key: ConfigKey) -> PathBuf {
        self.dir.join(format!("{}_{}.db", key.uid, key.id))
    }
}

impl RestrictedStore for DiskRestrictedStore {
    fn db_version(&self) -> i32 {
        DB_VERSION
    }

    fn insert_rows(&self, key: ConfigKey, rows: &[RestrictedRow]) {
        if rows.is_empty() {
            return;
        }
        let path = self.db_path(key);
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                for row in rows {
                    writeln!(
                        file,
                        "{}|{}|{}|{}",
                        row.metric_id, row.atom_id, row.elapsed_ns, row.wall_ns
                    )?;
                }
                Ok(())
            });
        if let Err(e) = result {
            warn!(key = %key, error = %e, "appending restricted rows failed");
        }
    }

    fn query(&self, key: ConfigKey, sql: &str) -> Result<QueryRows, RestrictedDbError> {
        let normalized = sql.trim().to_ascii_lowercase();
        if !normalized.starts_with("select") {
            return Err(RestrictedDbError::UnsupportedQuery(sql.to_string()));
        }

        let content = fs::read_to_string(self.db_path(key))?;

        let mut rows = Vec::new();
        for line in content.lines() {
            let cols: Vec<String> = line.split('|').map(str::to_string).collect();
            if cols.len() != 4 {
                return Err(RestrictedDbError::MalformedRow(key));
            }
            rows.push(cols);
        }

        Ok(QueryRows {
            rows,
            column_names: vec![
                "metricId".into(),
                "atomId".into(),
                "elapsedTimestampNs".into(),
                "wallTimestampNs".into(),
            ],
            column_types: vec![
                COLUMN_TYPE_LONG,
                COLUMN_TYPE_LONG,
                COLUMN_TYPE_LONG,
                COLUMN_TYPE_LONG,
            ],
        })
    }

    fn delete_db(&self, key: ConfigKey) {
        let _ = fs::remove_file(self.db_path(key));
    }

    fn update_device_info(&self, key: ConfigKey) -> Result<(), RestrictedDbError> {
        // Touching the file is enough to materialize the shard.
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.db_path(key))?;
        Ok(())
    }

    fn enforce_ttl(&self, key: ConfigKey, cutoff_wall_ns: i64) {
        let path = self.db_path(key);
        let Ok(content) = fs::read_to_string(&path) else {
            return;
        };
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| {
                line.rsplit('|')
                    .next()
                    .and_then(|wall| wall.parse::<i64>().ok())
                    .is_some_and(|wall| wall >= cutoff_wall_ns)
            })
            .collect();
        let mut data = kept.join("\n");
        if !data.is_empty() {
            data.push('\n');
        }
        if let Err(e) = fs::write(&path, data) {
            warn!(key = %key, error = %e, "rewriting db after ttl enforcement failed");
        }
    }

    fn enforce_guardrails(&self, _wall_sec: i64, max_bytes: u64) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.len() > max_bytes {
                warn!(path = %entry.path().display(), size = meta.len(), "db over guardrail, deleting");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}
