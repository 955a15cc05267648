//! Configuration for the region core.
//!
//! Loaded in order: `config/default.toml`, `config/{RANGEKV_ENV}.toml`, then
//! environment variables with a `RANGEKV` prefix (`RANGEKV_SPLIT__POLICY=SIZE`
//! overrides `split.policy`). Every struct has working defaults so an empty
//! configuration is valid.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

const MIB: u64 = 1024 * 1024;

/// Split-key selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SplitPolicy {
    Half,
    Size,
    Keys,
}

/// Region-level toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Enables the background split checker.
    #[serde(default = "default_true")]
    pub enable_auto_split: bool,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            enable_auto_split: true,
        }
    }
}

/// Split checker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    #[serde(default = "default_split_policy")]
    pub policy: SplitPolicy,
    /// Size threshold that commits a split (bytes).
    #[serde(default = "default_region_max_size")]
    pub region_max_size: u64,
    /// HALF policy: candidate spacing (bytes).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// SIZE policy: split point as a fraction of `region_max_size`.
    #[serde(default = "default_split_ratio")]
    pub size_ratio: f64,
    /// KEYS policy: key-count threshold that commits a split.
    #[serde(default = "default_keys_number")]
    pub keys_number: u64,
    /// KEYS policy: split point as a fraction of `keys_number`.
    #[serde(default = "default_split_ratio")]
    pub keys_ratio: f64,
    /// Regions below this approximate size are not walked at all.
    #[serde(default = "default_check_approximate_size")]
    pub check_approximate_size: u64,
    /// Size of the split-check worker pool.
    #[serde(default = "default_split_workers")]
    pub worker_num: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            policy: default_split_policy(),
            region_max_size: default_region_max_size(),
            chunk_size: default_chunk_size(),
            size_ratio: default_split_ratio(),
            keys_number: default_keys_number(),
            keys_ratio: default_split_ratio(),
            check_approximate_size: default_check_approximate_size(),
            worker_num: default_split_workers(),
        }
    }
}

/// Timestamp provider tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsProviderConfig {
    /// Timestamps fetched per TSO round trip.
    #[serde(default = "default_ts_batch_size")]
    pub batch_size: u32,
    /// A batch older than this, or this far behind the newest observed
    /// physical clock, is stale.
    #[serde(default = "default_ts_stale_ms")]
    pub stale_interval_ms: i64,
    /// `get_ts` attempts before giving up and returning 0.
    #[serde(default = "default_ts_max_retry")]
    pub max_retry: u32,
    /// Renew attempts against the TSO before emitting a failure event.
    #[serde(default = "default_ts_max_retry")]
    pub renew_max_retry: u32,
    /// Retired batches older than this are reclaimed.
    #[serde(default = "default_ts_clean_ms")]
    pub clean_dead_interval_ms: i64,
}

impl Default for TsProviderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_ts_batch_size(),
            stale_interval_ms: default_ts_stale_ms(),
            max_retry: default_ts_max_retry(),
            renew_max_retry: default_ts_max_retry(),
            clean_dead_interval_ms: default_ts_clean_ms(),
        }
    }
}

/// Vector search tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexConfig {
    /// Records per transient flat index in brute-force mode.
    #[serde(default = "default_bruteforce_batch")]
    pub bruteforce_batch_count: usize,
    /// Per-query cap on range-search results.
    #[serde(default = "default_max_range_results")]
    pub max_range_search_result_count: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            bruteforce_batch_count: default_bruteforce_batch(),
            max_range_search_result_count: default_max_range_results(),
        }
    }
}

/// Per-column-family engine tuning. Unset fields fall back to the engine
/// defaults for that family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CfConfig {
    pub name: String,
    pub block_size: Option<usize>,
    /// Per-CF block cache share (bytes); all CFs share one cache, this is a
    /// sizing hint only.
    pub block_cache: Option<u64>,
    pub write_buffer_size: Option<usize>,
    pub max_write_buffer_number: Option<i32>,
    pub min_write_buffer_number_to_merge: Option<i32>,
    pub max_compaction_bytes: Option<u64>,
    pub target_file_size_base: Option<u64>,
    pub max_bytes_for_level_base: Option<u64>,
    pub max_bytes_for_level_multiplier: Option<f64>,
    /// Fixed-prefix extractor length; 0 disables the extractor.
    pub prefix_extractor: Option<usize>,
    /// Compression per level, e.g. `["none", "none", "lz4", "lz4", "zstd"]`.
    #[serde(default)]
    pub compression_per_level: Vec<String>,
}

/// Raw engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfig {
    /// LSM data directory.
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_block_cache_size")]
    pub block_cache_size: u64,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: i32,
    #[serde(default = "default_true")]
    pub enable_wal: bool,
    /// Per-CF overrides, keyed by `CfConfig::name`.
    #[serde(default)]
    pub column_families: Vec<CfConfig>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            block_cache_size: default_block_cache_size(),
            max_open_files: default_max_open_files(),
            enable_wal: true,
            column_families: Vec::new(),
        }
    }
}

impl RawConfig {
    pub fn cf(&self, name: &str) -> Option<&CfConfig> {
        self.column_families.iter().find(|cf| cf.name == name)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub region: RegionConfig,
    #[serde(default)]
    pub split: SplitConfig,
    #[serde(default)]
    pub ts_provider: TsProviderConfig,
    #[serde(default)]
    pub vector_index: VectorIndexConfig,
    #[serde(default)]
    pub raw: RawConfig,
}

impl Config {
    /// Load configuration from files and environment.
    pub fn load() -> StoreResult<Self> {
        let env = std::env::var("RANGEKV_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(config::Environment::with_prefix("RANGEKV").separator("__"));

        let config: Config = builder
            .build()
            .map_err(|e| StoreError::Internal(format!("config build: {e}")))?
            .try_deserialize()
            .map_err(|e| StoreError::Internal(format!("config parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a single TOML file.
    pub fn from_file(path: &std::path::Path) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Internal(format!("read config {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| StoreError::Internal(format!("parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges that would otherwise fail deep inside a worker.
    pub fn validate(&self) -> StoreResult<()> {
        if self.ts_provider.batch_size == 0 {
            return Err(StoreError::Internal(
                "ts_provider.batch_size must be greater than 0".into(),
            ));
        }
        if self.ts_provider.max_retry == 0 {
            return Err(StoreError::Internal(
                "ts_provider.max_retry must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.split.size_ratio)
            || !(0.0..=1.0).contains(&self.split.keys_ratio)
        {
            return Err(StoreError::Internal(
                "split ratios must be within [0, 1]".into(),
            ));
        }
        if self.split.chunk_size == 0 || self.split.region_max_size == 0 {
            return Err(StoreError::Internal(
                "split sizes must be greater than 0".into(),
            ));
        }
        if self.split.worker_num == 0 {
            return Err(StoreError::Internal(
                "split.worker_num must be greater than 0".into(),
            ));
        }
        if self.vector_index.bruteforce_batch_count == 0 {
            return Err(StoreError::Internal(
                "vector_index.bruteforce_batch_count must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_split_policy() -> SplitPolicy {
    SplitPolicy::Half
}
fn default_region_max_size() -> u64 {
    512 * MIB
}
fn default_chunk_size() -> u64 {
    16 * MIB
}
fn default_split_ratio() -> f64 {
    0.5
}
fn default_keys_number() -> u64 {
    1_000_000
}
fn default_check_approximate_size() -> u64 {
    384 * MIB
}
fn default_split_workers() -> usize {
    3
}
fn default_ts_batch_size() -> u32 {
    100
}
fn default_ts_stale_ms() -> i64 {
    3000
}
fn default_ts_max_retry() -> u32 {
    16
}
fn default_ts_clean_ms() -> i64 {
    3000
}
fn default_bruteforce_batch() -> usize {
    2048
}
fn default_max_range_results() -> usize {
    1024
}
fn default_db_path() -> String {
    "./db".to_string()
}
fn default_block_cache_size() -> u64 {
    256 * MIB
}
fn default_max_open_files() -> i32 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ts_provider.batch_size, 100);
        assert_eq!(config.ts_provider.max_retry, 16);
        assert_eq!(config.vector_index.bruteforce_batch_count, 2048);
        assert_eq!(config.vector_index.max_range_search_result_count, 1024);
        assert_eq!(config.split.region_max_size, 512 * MIB);
        assert_eq!(config.split.worker_num, 3);
        assert!(config.region.enable_auto_split);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [split]
            policy = "SIZE"
            region_max_size = 1048576
            size_ratio = 0.8

            [ts_provider]
            batch_size = 32

            [raw]
            path = "/tmp/rangekv-db"

            [[raw.column_families]]
            name = "data"
            block_size = 65536
            prefix_extractor = 9
            compression_per_level = ["none", "lz4"]
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.split.policy, SplitPolicy::Size);
        assert_eq!(config.split.region_max_size, 1048576);
        assert_eq!(config.ts_provider.batch_size, 32);
        let cf = config.raw.cf("data").unwrap();
        assert_eq!(cf.block_size, Some(65536));
        assert_eq!(cf.prefix_extractor, Some(9));
        assert_eq!(cf.compression_per_level, vec!["none", "lz4"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.ts_provider.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.split.size_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.split.chunk_size = 0;
        assert!(config.validate().is_err());
    }
}
