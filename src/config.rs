use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock::NS_PER_SEC;

/// Top-level configuration for the atomsink daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Durable storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate limiters and resource guardrails.
    #[serde(default)]
    pub guardrails: GuardrailConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Enable the restricted-metrics query surface.
    #[serde(default = "default_true")]
    pub restricted_metrics_enabled: bool,
}

/// Durable storage configuration.
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Root directory for all persisted state. Default: "/var/lib/atomsink".
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

/// Rate limiters and resource guardrails.
///
/// Each period gates one category of periodic work driven from the event
/// path; the byte thresholds bound per-config memory.
#[derive(Debug, Clone, Deserialize)]
pub struct GuardrailConfig {
    /// Minimum gap between whole-dataset disk writes, to keep wall-clock
    /// file names from colliding. Default: 15s.
    #[serde(default = "default_write_data_cooldown", with = "humantime_serde")]
    pub write_data_cooldown: Duration,

    /// How long pulled-atom snapshots stay cached. Default: 1s.
    #[serde(default = "default_puller_cache_clear_interval", with = "humantime_serde")]
    pub puller_cache_clear_interval: Duration,

    /// Minimum gap between data-fetch broadcasts per config. Default: 60s.
    #[serde(default = "default_min_broadcast_period", with = "humantime_serde")]
    pub min_broadcast_period: Duration,

    /// Minimum gap between activation broadcasts per uid. Default: 10m.
    #[serde(default = "default_min_activation_broadcast_period", with = "humantime_serde")]
    pub min_activation_broadcast_period: Duration,

    /// Minimum gap between byte-size checks per config. Default: 10s.
    #[serde(default = "default_min_byte_size_check_period", with = "humantime_serde")]
    pub min_byte_size_check_period: Duration,

    /// Minimum gap between restricted-data TTL sweeps. Default: 1h.
    #[serde(default = "default_min_ttl_check_period", with = "humantime_serde")]
    pub min_ttl_check_period: Duration,

    /// Minimum gap between restricted-data flushes. Default: 30m.
    #[serde(default = "default_min_flush_restricted_period", with = "humantime_serde")]
    pub min_flush_restricted_period: Duration,

    /// Minimum gap between database guardrail sweeps. Default: 1h.
    #[serde(default = "default_min_db_guardrail_period", with = "humantime_serde")]
    pub min_db_guardrail_period: Duration,

    /// Queued restricted bytes that trigger a flush. Default: 25MiB.
    #[serde(default = "default_restricted_trigger_bytes")]
    pub bytes_per_restricted_config_trigger_flush: usize,

    /// Restricted databases above this are deleted outright. Default: 100MiB.
    #[serde(default = "default_max_db_bytes")]
    pub max_db_bytes: u64,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9464".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/atomsink")
}

fn default_write_data_cooldown() -> Duration {
    Duration::from_secs(15)
}

fn default_puller_cache_clear_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_min_broadcast_period() -> Duration {
    Duration::from_secs(60)
}

fn default_min_activation_broadcast_period() -> Duration {
    Duration::from_secs(600)
}

fn default_min_byte_size_check_period() -> Duration {
    Duration::from_secs(10)
}

fn default_min_ttl_check_period() -> Duration {
    Duration::from_secs(3600)
}

fn default_min_flush_restricted_period() -> Duration {
    Duration::from_secs(1800)
}

fn default_min_db_guardrail_period() -> Duration {
    Duration::from_secs(3600)
}

fn default_restricted_trigger_bytes() -> usize {
    25 * 1024 * 1024
}

fn default_max_db_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_health_addr() -> String {
    ":9464".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            storage: StorageConfig::default(),
            guardrails: GuardrailConfig::default(),
            health: HealthConfig::default(),
            restricted_metrics_enabled: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            write_data_cooldown: default_write_data_cooldown(),
            puller_cache_clear_interval: default_puller_cache_clear_interval(),
            min_broadcast_period: default_min_broadcast_period(),
            min_activation_broadcast_period: default_min_activation_broadcast_period(),
            min_byte_size_check_period: default_min_byte_size_check_period(),
            min_ttl_check_period: default_min_ttl_check_period(),
            min_flush_restricted_period: default_min_flush_restricted_period(),
            min_db_guardrail_period: default_min_db_guardrail_period(),
            bytes_per_restricted_config_trigger_flush: default_restricted_trigger_bytes(),
            max_db_bytes: default_max_db_bytes(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.storage.root.as_os_str().is_empty() {
            bail!("storage.root is required");
        }

        let guardrails = &self.guardrails;
        if guardrails.min_broadcast_period.is_zero() {
            bail!("guardrails.min_broadcast_period must be positive");
        }
        if guardrails.min_activation_broadcast_period.is_zero() {
            bail!("guardrails.min_activation_broadcast_period must be positive");
        }
        if guardrails.bytes_per_restricted_config_trigger_flush == 0 {
            bail!("guardrails.bytes_per_restricted_config_trigger_flush must be positive");
        }
        if guardrails.max_db_bytes == 0 {
            bail!("guardrails.max_db_bytes must be positive");
        }

        Ok(())
    }
}

impl GuardrailConfig {
    pub fn write_data_cooldown_ns(&self) -> i64 {
        duration_ns(self.write_data_cooldown)
    }

    pub fn puller_cache_clear_interval_sec(&self) -> i64 {
        self.puller_cache_clear_interval.as_secs() as i64
    }

    pub fn min_broadcast_period_ns(&self) -> i64 {
        duration_ns(self.min_broadcast_period)
    }

    pub fn min_activation_broadcast_period_ns(&self) -> i64 {
        duration_ns(self.min_activation_broadcast_period)
    }

    pub fn min_byte_size_check_period_ns(&self) -> i64 {
        duration_ns(self.min_byte_size_check_period)
    }

    pub fn min_ttl_check_period_ns(&self) -> i64 {
        duration_ns(self.min_ttl_check_period)
    }

    pub fn min_flush_restricted_period_ns(&self) -> i64 {
        duration_ns(self.min_flush_restricted_period)
    }

    pub fn min_db_guardrail_period_ns(&self) -> i64 {
        duration_ns(self.min_db_guardrail_period)
    }
}

fn duration_ns(d: Duration) -> i64 {
    (d.as_secs() as i64).saturating_mul(NS_PER_SEC) + i64::from(d.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.guardrails.write_data_cooldown, Duration::from_secs(15));
        assert_eq!(cfg.guardrails.min_broadcast_period, Duration::from_secs(60));
        assert_eq!(cfg.health.addr, ":9464");
        assert!(cfg.restricted_metrics_enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_period_conversions() {
        let guardrails = GuardrailConfig::default();
        assert_eq!(guardrails.write_data_cooldown_ns(), 15 * NS_PER_SEC);
        assert_eq!(guardrails.min_broadcast_period_ns(), 60 * NS_PER_SEC);
        assert_eq!(guardrails.puller_cache_clear_interval_sec(), 1);
    }

    #[test]
    fn test_validation_zero_broadcast_period() {
        let mut cfg = Config::default();
        cfg.guardrails.min_broadcast_period = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("min_broadcast_period"));
    }

    #[test]
    fn test_validation_empty_storage_root() {
        let mut cfg = Config::default();
        cfg.storage.root = PathBuf::new();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("storage.root"));
    }

    #[test]
    fn test_yaml_parsing_with_humantime() {
        let yaml = r#"
log_level: debug
storage:
  root: /tmp/atomsink
guardrails:
  min_broadcast_period: 2m
  write_data_cooldown: 30s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.guardrails.min_broadcast_period, Duration::from_secs(120));
        assert_eq!(cfg.guardrails.write_data_cooldown, Duration::from_secs(30));
        // Unset fields keep defaults.
        assert_eq!(
            cfg.guardrails.min_byte_size_check_period,
            Duration::from_secs(10)
        );
    }
}
