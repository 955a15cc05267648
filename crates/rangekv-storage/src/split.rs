//! Split-key selection over a merged multi-family walk.
//!
//! A region's size lives across several column families; the checker streams
//! them all through one min-heap of per-family iterators and applies a
//! policy (HALF / SIZE / KEYS) to the merged stream. Keys seen here are
//! encoded keys; callers strip the timestamp suffix from the chosen key.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use rangekv_core::codec;
use rangekv_core::config::{SplitConfig, SplitPolicy};
use rangekv_core::error::StoreResult;
use rangekv_core::types::{OpContext, Range};

use crate::column_families::versioned_compare;
use crate::raw::{IterOptions, RawIter, RawSnapshot};

struct HeapEntry {
    key: Vec<u8>,
    value_size: usize,
    pos: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        versioned_compare(&self.key, &other.key).then(self.pos.cmp(&other.pos))
    }
}

/// Min-heap merge of one iterator per column family.
pub struct MergedIterator<'a> {
    iters: Vec<RawIter<'a>>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl<'a> MergedIterator<'a> {
    /// Open one bounded iterator per family on a shared snapshot.
    pub fn new(
        snapshot: &'a RawSnapshot<'a>,
        cf_names: &[&str],
        encoded_end: Option<Vec<u8>>,
    ) -> StoreResult<Self> {
        let mut iters = Vec::with_capacity(cf_names.len());
        for cf in cf_names {
            let mut opts = IterOptions::default();
            opts.upper_bound = encoded_end.clone();
            iters.push(snapshot.iter(cf, opts)?);
        }
        Ok(Self {
            iters,
            heap: BinaryHeap::new(),
        })
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.heap.clear();
        for pos in 0..self.iters.len() {
            self.iters[pos].seek(target);
            self.push_from(pos);
        }
    }

    pub fn valid(&self) -> bool {
        !self.heap.is_empty()
    }

    pub fn next(&mut self) {
        if let Some(Reverse(entry)) = self.heap.pop() {
            self.push_from(entry.pos);
        }
    }

    /// Current (encoded) key.
    pub fn key(&self) -> &[u8] {
        self.heap
            .peek()
            .map(|Reverse(entry)| entry.key.as_slice())
            .unwrap_or(&[])
    }

    /// Key + value size of the current entry.
    pub fn key_value_size(&self) -> usize {
        self.heap
            .peek()
            .map(|Reverse(entry)| entry.key.len() + entry.value_size)
            .unwrap_or(0)
    }

    fn push_from(&mut self, pos: usize) {
        let iter = &mut self.iters[pos];
        if iter.valid() {
            self.heap.push(Reverse(HeapEntry {
                key: iter.key().to_vec(),
                value_size: iter.value().len(),
                pos,
            }));
            iter.next();
        }
    }
}

/// Result of one split-check walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitScan {
    /// Chosen split key (encoded), present only when the policy committed.
    pub split_key: Option<Vec<u8>>,
    /// Total key+value bytes walked.
    pub size: u64,
    /// Logically distinct plain keys walked.
    pub keys: u64,
}

/// Split-key policy, configured once per check.
#[derive(Debug, Clone, Copy)]
pub enum SplitKeyPicker {
    /// Remember a candidate every `chunk_size` bytes; split at the middle
    /// candidate once `threshold_size` is reached.
    Half {
        threshold_size: u64,
        chunk_size: u64,
    },
    /// Split at the first key past `threshold_size * ratio`; commit once the
    /// full threshold is reached.
    Size { threshold_size: u64, ratio: f64 },
    /// Split at the key where the distinct-key count passes
    /// `number * ratio`; commit once `number` keys were seen.
    Keys { number: u64, ratio: f64 },
}

impl SplitKeyPicker {
    pub fn from_config(config: &SplitConfig) -> Self {
        match config.policy {
            SplitPolicy::Half => SplitKeyPicker::Half {
                threshold_size: config.region_max_size,
                chunk_size: config.chunk_size,
            },
            SplitPolicy::Size => SplitKeyPicker::Size {
                threshold_size: config.region_max_size,
                ratio: config.size_ratio,
            },
            SplitPolicy::Keys => SplitKeyPicker::Keys {
                number: config.keys_number,
                ratio: config.keys_ratio,
            },
        }
    }

    pub fn policy_name(&self) -> &'static str {
        match self {
            SplitKeyPicker::Half { .. } => "HALF",
            SplitKeyPicker::Size { .. } => "SIZE",
            SplitKeyPicker::Keys { .. } => "KEYS",
        }
    }

    /// Walk the merged stream of `range` and pick a split key.
    ///
    /// The cancel token is checked at every heap pop; an interrupted walk
    /// returns the error and no split key.
    pub fn pick(
        &self,
        snapshot: &RawSnapshot<'_>,
        cf_names: &[&str],
        plain_range: &Range,
        ctx: &OpContext,
    ) -> StoreResult<SplitScan> {
        let encoded = codec::encode_range(plain_range);
        let mut iter = MergedIterator::new(
            snapshot,
            cf_names,
            if encoded.end_key.is_empty() {
                None
            } else {
                Some(encoded.end_key.clone())
            },
        )?;
        iter.seek(&encoded.start_key);

        match self {
            SplitKeyPicker::Half {
                threshold_size,
                chunk_size,
            } => {
                let mut scan = SplitScan::default();
                let mut chunk = 0u64;
                let mut candidates: Vec<Vec<u8>> = Vec::new();
                let mut prev_plain: Vec<u8> = Vec::new();
                let mut is_split = false;
                while iter.valid() {
                    ctx.check()?;
                    let kv_size = iter.key_value_size() as u64;
                    scan.size += kv_size;
                    chunk += kv_size;
                    if chunk >= *chunk_size {
                        chunk = 0;
                        candidates.push(iter.key().to_vec());
                    }
                    if scan.size >= *threshold_size {
                        is_split = true;
                    }
                    count_distinct(&mut prev_plain, iter.key(), &mut scan.keys)?;
                    iter.next();
                }
                if is_split && !candidates.is_empty() {
                    scan.split_key = Some(candidates[candidates.len() / 2].clone());
                }
                Ok(scan)
            }
            SplitKeyPicker::Size {
                threshold_size,
                ratio,
            } => {
                let mut scan = SplitScan::default();
                let split_pos = (*threshold_size as f64 * ratio) as u64;
                let mut split_key: Option<Vec<u8>> = None;
                let mut prev_plain: Vec<u8> = Vec::new();
                let mut is_split = false;
                while iter.valid() {
                    ctx.check()?;
                    scan.size += iter.key_value_size() as u64;
                    if split_key.is_none() && scan.size >= split_pos {
                        split_key = Some(iter.key().to_vec());
                    } else if scan.size >= *threshold_size {
                        is_split = true;
                    }
                    count_distinct(&mut prev_plain, iter.key(), &mut scan.keys)?;
                    iter.next();
                }
                if is_split {
                    scan.split_key = split_key;
                }
                Ok(scan)
            }
            SplitKeyPicker::Keys { number, ratio } => {
                let mut scan = SplitScan::default();
                let split_at = (*number as f64 * ratio) as u64;
                let mut split_key: Option<Vec<u8>> = None;
                let mut prev_plain: Vec<u8> = Vec::new();
                let mut is_split = false;
                while iter.valid() {
                    ctx.check()?;
                    scan.size += iter.key_value_size() as u64;
                    count_distinct(&mut prev_plain, iter.key(), &mut scan.keys)?;
                    if split_key.is_none() && scan.keys >= split_at {
                        split_key = Some(iter.key().to_vec());
                    } else if scan.keys >= *number {
                        is_split = true;
                    }
                    iter.next();
                }
                if is_split {
                    scan.split_key = split_key;
                }
                Ok(scan)
            }
        }
    }
}

fn count_distinct(prev_plain: &mut Vec<u8>, encoded_key: &[u8], keys: &mut u64) -> StoreResult<()> {
    let (plain, _) = codec::split_encoded(encoded_key)?;
    if plain != prev_plain.as_slice() {
        prev_plain.clear();
        prev_plain.extend_from_slice(plain);
        *keys += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column_families::cf_names;
    use crate::raw::RawStore;
    use rangekv_core::codec::{append_ts, encode_plain_key, pack_value, FLAG_NONE, RAW_PREFIX};
    use rangekv_core::config::RawConfig;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn plain(user: &[u8]) -> Vec<u8> {
        encode_plain_key(RAW_PREFIX, 1, user)
    }

    fn region_range() -> Range {
        Range::new(plain(b""), encode_plain_key(RAW_PREFIX, 2, b""))
    }

    fn open() -> (TempDir, Arc<RawStore>) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(RawStore::open(tmp.path(), &RawConfig::default()).unwrap());
        (tmp, store)
    }

    /// Fill `n` keys of roughly `value_size` bytes each into the data CF.
    fn fill(store: &RawStore, n: usize, value_size: usize) {
        let value = pack_value(FLAG_NONE, &vec![0xAB; value_size]);
        for i in 0..n {
            let key = append_ts(&plain(format!("key-{i:06}").as_bytes()), 100);
            store.put(cf_names::DATA, &key, &value).unwrap();
        }
    }

    #[test]
    fn test_merged_iterator_merges_families() {
        let (_tmp, store) = open();
        store
            .put(cf_names::DATA, &append_ts(&plain(b"b"), 1), b"v")
            .unwrap();
        store
            .put(cf_names::WRITE, &append_ts(&plain(b"a"), 1), b"w")
            .unwrap();
        store
            .put(cf_names::DATA, &append_ts(&plain(b"c"), 1), b"v")
            .unwrap();

        let snapshot = store.snapshot();
        let mut iter =
            MergedIterator::new(&snapshot, &[cf_names::DATA, cf_names::WRITE], None).unwrap();
        iter.seek(&append_ts(&plain(b""), i64::MAX));

        let mut seen = Vec::new();
        while iter.valid() {
            let (p, _) = codec::split_encoded(iter.key()).unwrap();
            seen.push(p.to_vec());
            iter.next();
        }
        assert_eq!(seen, vec![plain(b"a"), plain(b"b"), plain(b"c")]);
    }

    #[test]
    fn test_half_policy_picks_middle_candidate() {
        let (_tmp, store) = open();
        // 256 keys x ~1 KiB; threshold 128 KiB, chunk 16 KiB.
        fill(&store, 256, 1024);
        let picker = SplitKeyPicker::Half {
            threshold_size: 128 * 1024,
            chunk_size: 16 * 1024,
        };
        let snapshot = store.snapshot();
        let scan = picker
            .pick(&snapshot, cf_names::RAW_REGION, &region_range(), &OpContext::none())
            .unwrap();

        assert_eq!(scan.keys, 256);
        assert!(scan.size >= 256 * 1024);
        let split_key = scan.split_key.expect("threshold was exceeded");
        let (split_plain, _) = codec::split_encoded(&split_key).unwrap();
        assert!(region_range().contains(split_plain));
        // The middle candidate sits near the middle of the keyspace.
        let user = &split_plain[9..];
        let idx: usize = std::str::from_utf8(user)
            .unwrap()
            .trim_start_matches("key-")
            .parse()
            .unwrap();
        assert!((64..192).contains(&idx), "split at key index {idx}");
    }

    #[test]
    fn test_half_policy_below_threshold_returns_none() {
        let (_tmp, store) = open();
        fill(&store, 16, 1024);
        let picker = SplitKeyPicker::Half {
            threshold_size: 128 * 1024,
            chunk_size: 16 * 1024,
        };
        let snapshot = store.snapshot();
        let scan = picker
            .pick(&snapshot, cf_names::RAW_REGION, &region_range(), &OpContext::none())
            .unwrap();
        assert_eq!(scan.split_key, None);
        assert_eq!(scan.keys, 16);
    }

    #[test]
    fn test_size_policy_splits_at_ratio() {
        let (_tmp, store) = open();
        fill(&store, 100, 1024);
        let picker = SplitKeyPicker::Size {
            threshold_size: 50 * 1024,
            ratio: 0.5,
        };
        let snapshot = store.snapshot();
        let scan = picker
            .pick(&snapshot, cf_names::RAW_REGION, &region_range(), &OpContext::none())
            .unwrap();
        let split_key = scan.split_key.expect("size exceeded threshold");
        let (split_plain, _) = codec::split_encoded(&split_key).unwrap();
        let idx: usize = std::str::from_utf8(&split_plain[9..])
            .unwrap()
            .trim_start_matches("key-")
            .parse()
            .unwrap();
        // ~25 KiB in: around the 24th key.
        assert!((15..40).contains(&idx), "split at key index {idx}");
    }

    #[test]
    fn test_keys_policy_counts_distinct_keys() {
        let (_tmp, store) = open();
        // Two versions per key must count once.
        for i in 0..60 {
            let key = plain(format!("k{i:03}").as_bytes());
            store
                .put(cf_names::DATA, &append_ts(&key, 100), b"v1")
                .unwrap();
            store
                .put(cf_names::DATA, &append_ts(&key, 200), b"v2")
                .unwrap();
        }
        let picker = SplitKeyPicker::Keys {
            number: 50,
            ratio: 0.5,
        };
        let snapshot = store.snapshot();
        let scan = picker
            .pick(&snapshot, cf_names::RAW_REGION, &region_range(), &OpContext::none())
            .unwrap();
        assert_eq!(scan.keys, 60);
        let split_key = scan.split_key.expect("key count exceeded threshold");
        let (split_plain, _) = codec::split_encoded(&split_key).unwrap();
        assert_eq!(split_plain, plain(b"k024").as_slice());
    }

    #[test]
    fn test_cancelled_walk_stops() {
        let (_tmp, store) = open();
        fill(&store, 50, 128);
        let token = rangekv_core::types::CancelToken::new();
        token.cancel();
        let ctx = OpContext::with_cancel(token);
        let picker = SplitKeyPicker::Size {
            threshold_size: 1,
            ratio: 0.5,
        };
        let snapshot = store.snapshot();
        let result = picker.pick(&snapshot, cf_names::RAW_REGION, &region_range(), &ctx);
        assert!(matches!(
            result,
            Err(rangekv_core::error::StoreError::Cancelled)
        ));
    }
}
