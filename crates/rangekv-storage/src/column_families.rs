//! Column family definitions for the region keyspace.
//!
//! Column families give each logical namespace its own files, tuning and
//! bloom filters while sharing one block cache.
//!
//! | Name | Purpose | Key layout |
//! |------|---------|------------|
//! | data | user KV or vector float payload | plain key + !ts |
//! | scalar | whole scalar map per vector | vector key + !ts |
//! | scalar_speedup | one row per (vector, scalar key) for pushdown | speedup key + !ts |
//! | table | tabular payload per vector | vector key + !ts |
//! | lock | transaction lock records | plain key + !MAX (one slot per key) |
//! | write | transaction commit records | plain key + !commit_ts |
//! | meta | region-local metadata | plain key |
//!
//! Every versioned family uses a fixed 9-byte prefix extractor (1-byte
//! namespace prefix + 8-byte partition id) so partition-local scans stay
//! within one prefix bloom.

use std::cmp::Ordering;

use rocksdb::{BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, Options,
    SliceTransform};

use rangekv_core::codec::{PARTITION_LEN, PREFIX_LEN, TS_LEN};
use rangekv_core::config::{CfConfig, RawConfig};

/// Column family name constants.
pub mod cf_names {
    /// User KV or vector payload column family.
    pub const DATA: &str = "data";

    /// Per-vector scalar attribute map (whole-map value).
    pub const SCALAR: &str = "scalar";

    /// Per-(vector, scalar-key) inverted records for predicate pushdown.
    pub const SCALAR_SPEEDUP: &str = "scalar_speedup";

    /// Per-vector tabular payload.
    pub const TABLE: &str = "table";

    /// Transaction lock records.
    pub const LOCK: &str = "lock";

    /// Transaction commit records.
    pub const WRITE: &str = "write";

    /// Region-local metadata (rare access).
    pub const META: &str = "meta";

    /// All column family names, in descriptor order.
    pub const ALL: &[&str] = &[DATA, SCALAR, SCALAR_SPEEDUP, TABLE, LOCK, WRITE, META];

    /// Families walked by the split checker for a raw KV region.
    pub const RAW_REGION: &[&str] = &[DATA];

    /// Families walked by the split checker for a transactional region.
    pub const TXN_REGION: &[&str] = &[DATA, LOCK, WRITE];

    /// Families carrying vector payloads.
    pub const VECTOR_REGION: &[&str] = &[DATA, SCALAR, SCALAR_SPEEDUP, TABLE];
}

/// Fixed prefix covered by the per-CF prefix extractor.
pub const CF_PREFIX_LEN: usize = PREFIX_LEN + PARTITION_LEN;

/// Comparator name persisted in versioned families. Changing the order of an
/// existing database is not possible; the name guards against it.
pub const VERSIONED_COMPARATOR: &str = "rangekv.versioned";

/// Families whose keys carry the 8-byte complemented-timestamp suffix.
/// Lock keys use a fixed maximum-timestamp slot so they share the shape.
pub const VERSIONED_CFS: &[&str] = &[
    cf_names::DATA,
    cf_names::SCALAR,
    cf_names::SCALAR_SPEEDUP,
    cf_names::TABLE,
    cf_names::LOCK,
    cf_names::WRITE,
];

fn split_versioned(key: &[u8]) -> (&[u8], &[u8]) {
    if key.len() >= TS_LEN {
        key.split_at(key.len() - TS_LEN)
    } else {
        (key, &key[key.len()..])
    }
}

/// Order for versioned families: plain part first, timestamp suffix second.
///
/// Plain bytewise order would interleave versions of a key with versions of
/// its extensions (the suffix bytes compete with user-key bytes); splitting
/// the comparison at the suffix keeps every user key's versions contiguous,
/// newest first, with user keys in true plain-key order.
pub fn versioned_compare(a: &[u8], b: &[u8]) -> Ordering {
    let (a_plain, a_ts) = split_versioned(a);
    let (b_plain, b_ts) = split_versioned(b);
    a_plain.cmp(b_plain).then_with(|| a_ts.cmp(b_ts))
}

pub fn is_versioned_cf(name: &str) -> bool {
    VERSIONED_CFS.contains(&name)
}

fn parse_compression(name: &str) -> DBCompressionType {
    match name {
        "none" => DBCompressionType::None,
        "snappy" => DBCompressionType::Snappy,
        "zstd" => DBCompressionType::Zstd,
        _ => DBCompressionType::Lz4,
    }
}

/// Build options for one column family, layering config overrides on top of
/// the family defaults.
pub fn cf_options(
    cache: &Cache,
    defaults: &CfDefaults,
    overrides: Option<&CfConfig>,
    versioned: bool,
) -> Options {
    let mut block_opts = BlockBasedOptions::default();
    block_opts.set_block_cache(cache);
    if defaults.bloom_bits > 0.0 {
        block_opts.set_bloom_filter(defaults.bloom_bits, false);
    }
    block_opts.set_cache_index_and_filter_blocks(true);
    let block_size = overrides
        .and_then(|cf| cf.block_size)
        .unwrap_or(defaults.block_size);
    block_opts.set_block_size(block_size);

    let mut opts = Options::default();
    opts.set_block_based_table_factory(&block_opts);
    opts.create_if_missing(true);
    if versioned {
        opts.set_comparator(VERSIONED_COMPARATOR, Box::new(versioned_compare));
    }

    let prefix_len = overrides
        .and_then(|cf| cf.prefix_extractor)
        .unwrap_or(defaults.prefix_len);
    if prefix_len > 0 {
        opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(prefix_len));
    }

    let compression: Vec<DBCompressionType> = overrides
        .map(|cf| cf.compression_per_level.as_slice())
        .filter(|levels| !levels.is_empty())
        .map(|levels| levels.iter().map(|s| parse_compression(s)).collect())
        .unwrap_or_else(|| defaults.compression_per_level.to_vec());
    if !compression.is_empty() {
        opts.set_compression_per_level(&compression);
    } else {
        opts.set_compression_type(defaults.compression);
    }

    if let Some(v) = overrides.and_then(|cf| cf.write_buffer_size) {
        opts.set_write_buffer_size(v);
    }
    if let Some(v) = overrides.and_then(|cf| cf.max_write_buffer_number) {
        opts.set_max_write_buffer_number(v);
    }
    if let Some(v) = overrides.and_then(|cf| cf.min_write_buffer_number_to_merge) {
        opts.set_min_write_buffer_number_to_merge(v);
    }
    if let Some(v) = overrides.and_then(|cf| cf.max_compaction_bytes) {
        opts.set_max_compaction_bytes(v);
    }
    if let Some(v) = overrides.and_then(|cf| cf.target_file_size_base) {
        opts.set_target_file_size_base(v);
    }
    if let Some(v) = overrides.and_then(|cf| cf.max_bytes_for_level_base) {
        opts.set_max_bytes_for_level_base(v);
    }
    if let Some(v) = overrides.and_then(|cf| cf.max_bytes_for_level_multiplier) {
        opts.set_max_bytes_for_level_multiplier(v);
    }

    opts
}

/// Built-in tuning for one family, before config overrides.
pub struct CfDefaults {
    pub block_size: usize,
    pub bloom_bits: f64,
    pub prefix_len: usize,
    pub compression: DBCompressionType,
    pub compression_per_level: &'static [DBCompressionType],
}

/// Payload families: larger blocks, bloom filter, partition prefix.
const PAYLOAD_DEFAULTS: CfDefaults = CfDefaults {
    block_size: 64 * 1024,
    bloom_bits: 10.0,
    prefix_len: CF_PREFIX_LEN,
    compression: DBCompressionType::Lz4,
    compression_per_level: &[],
};

/// Index-like families: point lookups dominate.
const INDEX_DEFAULTS: CfDefaults = CfDefaults {
    block_size: 16 * 1024,
    bloom_bits: 10.0,
    prefix_len: CF_PREFIX_LEN,
    compression: DBCompressionType::Lz4,
    compression_per_level: &[],
};

/// Meta family: tiny and rarely touched; compression overhead not worth it.
const META_DEFAULTS: CfDefaults = CfDefaults {
    block_size: 4 * 1024,
    bloom_bits: 0.0,
    prefix_len: 0,
    compression: DBCompressionType::None,
    compression_per_level: &[],
};

fn defaults_for(name: &str) -> &'static CfDefaults {
    match name {
        cf_names::DATA | cf_names::SCALAR | cf_names::TABLE => &PAYLOAD_DEFAULTS,
        cf_names::META => &META_DEFAULTS,
        _ => &INDEX_DEFAULTS,
    }
}

/// Descriptors for every column family, with config overrides applied.
pub fn get_column_family_descriptors(
    cache: &Cache,
    config: &RawConfig,
) -> Vec<ColumnFamilyDescriptor> {
    cf_names::ALL
        .iter()
        .map(|name| {
            ColumnFamilyDescriptor::new(
                *name,
                cf_options(
                    cache,
                    defaults_for(name),
                    config.cf(name),
                    is_versioned_cf(name),
                ),
            )
        })
        .collect()
}

/// Options matching a versioned family, for SST writers that will be
/// ingested into one.
pub fn versioned_sst_options() -> Options {
    let mut opts = Options::default();
    opts.set_comparator(VERSIONED_COMPARATOR, Box::new(versioned_compare));
    opts
}
