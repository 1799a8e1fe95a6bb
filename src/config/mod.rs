//! Engine configuration
//!
//! Loaded from a JSON file. Every field except `data_dir` is optional and
//! falls back to the default below. Values are validated on load; an invalid
//! configuration refuses to boot.

mod errors;

pub use errors::{ConfigError, ConfigResult};

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::observability::{log_event_with_fields, Event};
use crate::substrate::RetryPolicy;

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Data directory (required)
    pub data_dir: PathBuf,

    /// Buffered record count that triggers a flush
    #[serde(default = "default_flush_threshold_records")]
    pub flush_threshold_records: usize,

    /// Buffered byte size that triggers a flush
    #[serde(default = "default_flush_threshold_bytes")]
    pub flush_threshold_bytes: usize,

    /// Sequences ingested since the last image that trigger a new image
    #[serde(default = "default_image_interval_sequences")]
    pub image_interval_sequences: u64,

    /// Live delta layer count that triggers compaction
    #[serde(default = "default_compaction_trigger_layers")]
    pub compaction_trigger_layers: usize,

    /// Total size of live delta layers that triggers compaction
    #[serde(default = "default_compaction_trigger_bytes")]
    pub compaction_trigger_bytes: u64,

    /// Maximum layers merged by one compaction
    #[serde(default = "default_compaction_max_inputs")]
    pub compaction_max_inputs: usize,

    /// Maximum total input size of one compaction
    #[serde(default = "default_compaction_max_input_bytes")]
    pub compaction_max_input_bytes: u64,

    /// Records per compaction output layer
    #[serde(default = "default_compaction_max_output_records")]
    pub compaction_max_output_records: usize,

    /// Minimum tombstones in a run before the tombstone trigger applies
    #[serde(default = "default_compaction_min_tombstones")]
    pub compaction_min_tombstones: u64,

    /// Tombstone ratio (0.0..=1.0) that triggers compaction of a run
    #[serde(default = "default_compaction_tombstone_ratio")]
    pub compaction_tombstone_ratio: f64,

    /// Seconds a deleted snapshot keeps protecting data
    #[serde(default = "default_reclamation_grace_secs")]
    pub reclamation_grace_secs: u64,

    /// Dead log bytes a prune must leave before the log is rewritten
    #[serde(default = "default_log_rewrite_min_dead_bytes")]
    pub log_rewrite_min_dead_bytes: u64,

    /// Dead share of the log (0.0..=1.0) a prune must leave before the log is rewritten
    #[serde(default = "default_log_rewrite_min_dead_ratio")]
    pub log_rewrite_min_dead_ratio: f64,

    /// Maximum number of Active snapshots
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,

    /// Upper bound (and default) for diff page sizes
    #[serde(default = "default_max_diff_page_size")]
    pub max_diff_page_size: usize,

    /// Keys held by the history cache
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// History cache entry lifetime
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// Values larger than this are stored as separate blobs
    #[serde(default = "default_inline_value_limit")]
    pub inline_value_limit: usize,

    /// Target false positive rate of layer membership filters
    #[serde(default = "default_filter_false_positive_rate")]
    pub filter_false_positive_rate: f64,

    /// Key prefix length indexed by layer membership filters
    #[serde(default = "default_filter_prefix_len")]
    pub filter_prefix_len: usize,

    /// Substrate attempts per operation, including the first
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Reject records that skip sequence numbers
    #[serde(default)]
    pub reject_sequence_gaps: bool,

    /// Period of background maintenance checks
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
}

fn default_flush_threshold_records() -> usize {
    1024
}
fn default_flush_threshold_bytes() -> usize {
    4 * 1024 * 1024
} // 4MB
fn default_image_interval_sequences() -> u64 {
    10_000
}
fn default_compaction_trigger_layers() -> usize {
    8
}
fn default_compaction_trigger_bytes() -> u64 {
    64 * 1024 * 1024
} // 64MB
fn default_compaction_max_inputs() -> usize {
    16
}
fn default_compaction_max_input_bytes() -> u64 {
    256 * 1024 * 1024
} // 256MB
fn default_compaction_max_output_records() -> usize {
    16_384
}
fn default_compaction_min_tombstones() -> u64 {
    1_000
}
fn default_compaction_tombstone_ratio() -> f64 {
    0.5
}
fn default_reclamation_grace_secs() -> u64 {
    300
}
fn default_log_rewrite_min_dead_bytes() -> u64 {
    64 * 1024 * 1024
} // 64MB
fn default_log_rewrite_min_dead_ratio() -> f64 {
    0.5
}
fn default_max_snapshots() -> usize {
    10_000
}
fn default_max_diff_page_size() -> usize {
    1_000
}
fn default_cache_max_entries() -> usize {
    10_000
}
fn default_cache_ttl_ms() -> u64 {
    60_000
}
fn default_inline_value_limit() -> usize {
    4096
}
fn default_filter_false_positive_rate() -> f64 {
    0.01
}
fn default_filter_prefix_len() -> usize {
    4
}
fn default_retry_max_attempts() -> u32 {
    5
}
fn default_retry_base_delay_ms() -> u64 {
    10
}
fn default_retry_max_delay_ms() -> u64 {
    1_000
}
fn default_maintenance_interval_ms() -> u64 {
    1_000
}

impl EngineConfig {
    /// Configuration with every default and the given data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            flush_threshold_records: default_flush_threshold_records(),
            flush_threshold_bytes: default_flush_threshold_bytes(),
            image_interval_sequences: default_image_interval_sequences(),
            compaction_trigger_layers: default_compaction_trigger_layers(),
            compaction_trigger_bytes: default_compaction_trigger_bytes(),
            compaction_max_inputs: default_compaction_max_inputs(),
            compaction_max_input_bytes: default_compaction_max_input_bytes(),
            compaction_max_output_records: default_compaction_max_output_records(),
            compaction_min_tombstones: default_compaction_min_tombstones(),
            compaction_tombstone_ratio: default_compaction_tombstone_ratio(),
            reclamation_grace_secs: default_reclamation_grace_secs(),
            log_rewrite_min_dead_bytes: default_log_rewrite_min_dead_bytes(),
            log_rewrite_min_dead_ratio: default_log_rewrite_min_dead_ratio(),
            max_snapshots: default_max_snapshots(),
            max_diff_page_size: default_max_diff_page_size(),
            cache_max_entries: default_cache_max_entries(),
            cache_ttl_ms: default_cache_ttl_ms(),
            inline_value_limit: default_inline_value_limit(),
            filter_false_positive_rate: default_filter_false_positive_rate(),
            filter_prefix_len: default_filter_prefix_len(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            reject_sequence_gaps: false,
            maintenance_interval_ms: default_maintenance_interval_ms(),
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: EngineConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        log_event_with_fields(
            Event::ConfigLoaded,
            &[
                ("path", &path.display().to_string()),
                ("data_dir", &config.data_dir.display().to_string()),
            ],
        );

        Ok(config)
    }

    /// Write configuration as pretty JSON
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        fs::write(path, json).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Validate value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("data_dir", "must not be empty"));
        }
        if self.flush_threshold_records == 0 {
            return Err(ConfigError::invalid("flush_threshold_records", "must be > 0"));
        }
        if self.flush_threshold_bytes == 0 {
            return Err(ConfigError::invalid("flush_threshold_bytes", "must be > 0"));
        }
        if self.image_interval_sequences == 0 {
            return Err(ConfigError::invalid("image_interval_sequences", "must be > 0"));
        }
        if self.compaction_trigger_layers < 2 {
            return Err(ConfigError::invalid("compaction_trigger_layers", "must be >= 2"));
        }
        if self.compaction_trigger_bytes == 0 {
            return Err(ConfigError::invalid("compaction_trigger_bytes", "must be > 0"));
        }
        if self.compaction_max_inputs < 2 {
            return Err(ConfigError::invalid("compaction_max_inputs", "must be >= 2"));
        }
        if self.compaction_max_output_records == 0 {
            return Err(ConfigError::invalid("compaction_max_output_records", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.compaction_tombstone_ratio) {
            return Err(ConfigError::invalid(
                "compaction_tombstone_ratio",
                "must be within 0.0..=1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.log_rewrite_min_dead_ratio) {
            return Err(ConfigError::invalid(
                "log_rewrite_min_dead_ratio",
                "must be within 0.0..=1.0",
            ));
        }
        if self.max_snapshots == 0 {
            return Err(ConfigError::invalid("max_snapshots", "must be > 0"));
        }
        if self.max_diff_page_size == 0 {
            return Err(ConfigError::invalid("max_diff_page_size", "must be > 0"));
        }
        if !(self.filter_false_positive_rate > 0.0 && self.filter_false_positive_rate < 1.0) {
            return Err(ConfigError::invalid(
                "filter_false_positive_rate",
                "must be within (0.0, 1.0)",
            ));
        }
        if self.filter_prefix_len == 0 {
            return Err(ConfigError::invalid("filter_prefix_len", "must be > 0"));
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::invalid("retry_max_attempts", "must be > 0"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::invalid(
                "retry_base_delay_ms",
                "must not exceed retry_max_delay_ms",
            ));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(ConfigError::invalid("maintenance_interval_ms", "must be > 0"));
        }
        Ok(())
    }

    /// Substrate retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
        }
    }

    /// Directory holding the substrate log
    pub fn substrate_dir(&self) -> PathBuf {
        self.data_dir.join("substrate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        EngineConfig::new("/tmp/vault").validate().unwrap();
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seqvault.json");
        fs::write(&path, r#"{"data_dir": "/tmp/vault", "flush_threshold_records": 2}"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.flush_threshold_records, 2);
        assert_eq!(config.max_diff_page_size, default_max_diff_page_size());
        assert!(!config.reject_sequence_gaps);
    }

    #[test]
    fn test_missing_data_dir_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seqvault.json");
        fs::write(&path, r#"{"flush_threshold_records": 2}"#).unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_invalid_ratio_is_rejected() {
        let mut config = EngineConfig::new("/tmp/vault");
        config.compaction_tombstone_ratio = 1.5;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "VAULT_CONFIG_INVALID");
    }

    #[test]
    fn test_zero_size_trigger_is_rejected() {
        let mut config = EngineConfig::new("/tmp/vault");
        config.compaction_trigger_bytes = 0;
        assert!(config.validate().is_err());
        config.compaction_trigger_bytes = 1;
        config.log_rewrite_min_dead_ratio = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seqvault.json");
        let mut config = EngineConfig::new(dir.path().join("data"));
        config.image_interval_sequences = 42;
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().image_interval_sequences, 42);
    }
}
