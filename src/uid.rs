use std::collections::HashSet;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::proto::{PackageRecord, UidMapping};
use crate::ConfigKey;

/// Well-known system uids resolvable without a package lookup.
const WELL_KNOWN_UIDS: &[(&str, i32)] = &[
    ("root", 0),
    ("system", 1000),
    ("shell", 2000),
    ("statsd", crate::event::DAEMON_UID),
];

/// Version and identity of one installed package.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub version: i64,
    pub version_string: String,
    pub installer: String,
    pub certificate_hash: Vec<u8>,
    pub deleted: bool,
}

/// Maps isolated uids to host uids and tracks package versions per uid.
///
/// Internally synchronized: the ingress, the processor, and RPC handlers may
/// all touch it concurrently without the processor's lock.
pub struct UidMap {
    isolated: DashMap<i32, i32>,
    packages: DashMap<(i32, String), PackageInfo>,
    /// Configs that want uid-map deltas in their reports.
    interested_configs: DashMap<ConfigKey, ()>,
}

impl UidMap {
    pub fn new() -> Self {
        Self {
            isolated: DashMap::new(),
            packages: DashMap::new(),
            interested_configs: DashMap::new(),
        }
    }

    pub fn assign_isolated_uid(&self, isolated_uid: i32, parent_uid: i32) {
        debug!(isolated_uid, parent_uid, "isolated uid assigned");
        self.isolated.insert(isolated_uid, parent_uid);
    }

    pub fn remove_isolated_uid(&self, isolated_uid: i32) {
        self.isolated.remove(&isolated_uid);
    }

    /// Resolves an isolated uid to its host, or returns the uid unchanged.
    pub fn host_uid_or_self(&self, uid: i32) -> i32 {
        self.isolated.get(&uid).map(|entry| *entry).unwrap_or(uid)
    }

    /// Records an install or upgrade of a package.
    pub fn update_app(
        &self,
        uid: i32,
        package: &str,
        version: i64,
        version_string: &str,
        installer: &str,
        certificate: &[u8],
    ) {
        let certificate_hash = if certificate.is_empty() {
            Vec::new()
        } else {
            Sha256::digest(certificate).to_vec()
        };
        self.packages.insert(
            (uid, package.to_string()),
            PackageInfo {
                version,
                version_string: version_string.to_string(),
                installer: installer.to_string(),
                certificate_hash,
                deleted: false,
            },
        );
    }

    /// Marks a package removed. The row is kept so deltas can report it.
    pub fn remove_app(&self, uid: i32, package: &str) {
        if let Some(mut entry) = self.packages.get_mut(&(uid, package.to_string())) {
            entry.deleted = true;
        }
    }

    /// All uids that currently have the given package installed.
    pub fn app_uids(&self, package: &str) -> HashSet<i32> {
        self.packages
            .iter()
            .filter(|entry| entry.key().1 == package && !entry.value().deleted)
            .map(|entry| entry.key().0)
            .collect()
    }

    /// Resolves a well-known service name to its fixed uid.
    pub fn well_known_uid(package: &str) -> Option<i32> {
        WELL_KNOWN_UIDS
            .iter()
            .find(|(name, _)| *name == package)
            .map(|(_, uid)| *uid)
    }

    pub fn on_config_updated(&self, key: ConfigKey) {
        self.interested_configs.insert(key, ());
    }

    pub fn on_config_removed(&self, key: ConfigKey) {
        self.interested_configs.remove(&key);
    }

    /// Builds the uid-map snapshot appended to a report.
    ///
    /// Certificate hashes are truncated to `certificate_hash_bytes`, the
    /// per-config cap on identity bytes shipped in reports.
    pub fn snapshot(
        &self,
        dump_time_ns: i64,
        _key: ConfigKey,
        certificate_hash_bytes: usize,
    ) -> UidMapping {
        let mut records: Vec<PackageRecord> = self
            .packages
            .iter()
            .map(|entry| {
                let (uid, name) = entry.key();
                let info = entry.value();
                let mut certificate_hash = info.certificate_hash.clone();
                certificate_hash.truncate(certificate_hash_bytes);
                PackageRecord {
                    name: name.clone(),
                    version: info.version,
                    uid: *uid,
                    version_string: info.version_string.clone(),
                    installer: info.installer.clone(),
                    certificate_hash,
                    deleted: info.deleted,
                }
            })
            .collect();
        records.sort_by(|a, b| (a.uid, &a.name).cmp(&(b.uid, &b.name)));

        UidMapping {
            snapshot_elapsed_nanos: dump_time_ns,
            records,
        }
    }

    pub fn isolated_uid_count(&self) -> usize {
        self.isolated.len()
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }
}

impl Default for UidMap {
    fn default() -> Self {
        Self::new()
    }
}
