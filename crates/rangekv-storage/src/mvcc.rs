//! Versioned read view over the raw store.
//!
//! All entry points speak *plain* keys (namespace prefix + partition +
//! user key, no timestamp); version resolution, tombstone hiding and TTL
//! expiry happen here. A read at `ts` sees, for every plain key, the newest
//! version with `version_ts <= ts`; `ts = 0` means "latest".

use std::sync::Arc;

use rangekv_core::codec::{self, encode_range};
use rangekv_core::error::StoreResult;
use rangekv_core::types::{current_time_ms, KeyValue, Range};

use crate::raw::{IterOptions, RawIter, RawStore};

/// Outcome of resolving one plain key at a timestamp.
enum Visible {
    Value(Vec<u8>),
    Hidden,
}

pub struct MvccReader {
    store: Arc<RawStore>,
}

impl MvccReader {
    pub fn new(store: Arc<RawStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RawStore> {
        &self.store
    }

    /// Latest visible value of `plain_key` at `ts`, or `None`.
    pub fn kv_get(&self, cf: &str, ts: i64, plain_key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let upper = codec::append_ts(&rangekv_core::types::next_key(plain_key), i64::MAX);
        let mut iter = self.store.iter(cf, IterOptions::upper(upper))?;
        iter.seek(&codec::encode_seek_key(plain_key, ts));
        if !iter.valid() {
            return Ok(None);
        }
        let (found_plain, _) = codec::split_encoded(iter.key())?;
        if found_plain != plain_key {
            return Ok(None);
        }
        match decode_visible(iter.value())? {
            Visible::Value(value) => Ok(Some(value)),
            Visible::Hidden => Ok(None),
        }
    }

    /// Scan visible entries of `[range.start, range.end)` in plain-key order.
    ///
    /// `limit = 0` means unlimited. Returned keys are plain keys.
    pub fn kv_scan(
        &self,
        cf: &str,
        ts: i64,
        range: &Range,
        limit: usize,
        key_only: bool,
    ) -> StoreResult<Vec<KeyValue>> {
        let mut out = Vec::new();
        self.kv_scan_with(cf, ts, range, |key, value| {
            out.push(KeyValue::new(
                key.to_vec(),
                if key_only { Vec::new() } else { value.to_vec() },
            ));
            limit == 0 || out.len() < limit
        })?;
        Ok(out)
    }

    /// Visitor form of [`MvccReader::kv_scan`]; the callback returns `false`
    /// to stop early.
    pub fn kv_scan_with(
        &self,
        cf: &str,
        ts: i64,
        range: &Range,
        mut visit: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> StoreResult<()> {
        let encoded = encode_range(range);
        let mut opts = IterOptions::default();
        if !encoded.end_key.is_empty() {
            opts.upper_bound = Some(encoded.end_key.clone());
        }
        let mut iter = self.store.iter(cf, opts)?;
        iter.seek(&encoded.start_key);

        while iter.valid() {
            let (plain, version_ts) = codec::split_encoded(iter.key())?;
            if version_ts > effective_ts(ts) {
                // Still newer than the read view; try the older version.
                iter.next();
                continue;
            }
            let plain = plain.to_vec();
            let emit = match decode_visible(iter.value())? {
                Visible::Value(value) => visit(&plain, &value),
                Visible::Hidden => true,
            };
            if !emit {
                return Ok(());
            }
            seek_to_next_user_key(&mut iter, &plain);
        }
        Ok(())
    }

    /// Scan visible entries in reverse plain-key order.
    pub fn kv_scan_reverse(
        &self,
        cf: &str,
        ts: i64,
        range: &Range,
        limit: usize,
        key_only: bool,
    ) -> StoreResult<Vec<KeyValue>> {
        let encoded = encode_range(range);
        let mut opts = IterOptions::default();
        if !encoded.end_key.is_empty() {
            opts.upper_bound = Some(encoded.end_key.clone());
        }
        let mut iter = self.store.iter(cf, opts)?;
        if encoded.end_key.is_empty() {
            iter.seek_to_last();
        } else {
            iter.seek_for_prev(&encoded.end_key);
        }

        let mut out = Vec::new();
        while iter.valid() && (limit == 0 || out.len() < limit) {
            let (plain, _) = codec::split_encoded(iter.key())?;
            let plain = plain.to_vec();
            if plain < range.start_key {
                break;
            }
            // The reverse iterator lands on the oldest version of each key;
            // resolve visibility with a forward probe.
            if let Some(value) = self.kv_get(cf, ts, &plain)? {
                out.push(KeyValue::new(
                    plain.clone(),
                    if key_only { Vec::new() } else { value },
                ));
            }
            // Jump before every version of `plain`.
            iter.seek_for_prev(&codec::append_ts(&plain, i64::MAX));
            if iter.valid() {
                let (at, _) = codec::split_encoded(iter.key())?;
                if at == plain {
                    iter.prev();
                }
            }
        }
        Ok(out)
    }

    /// Number of visible user keys in the range.
    pub fn kv_count(&self, cf: &str, ts: i64, range: &Range) -> StoreResult<u64> {
        let mut count = 0u64;
        self.kv_scan_with(cf, ts, range, |_, _| {
            count += 1;
            true
        })?;
        Ok(count)
    }

    /// Smallest visible user key in the range.
    pub fn kv_min_key(&self, cf: &str, ts: i64, range: &Range) -> StoreResult<Option<Vec<u8>>> {
        let mut min = None;
        self.kv_scan_with(cf, ts, range, |key, _| {
            min = Some(key.to_vec());
            false
        })?;
        Ok(min)
    }

    /// Largest visible user key in the range.
    pub fn kv_max_key(&self, cf: &str, ts: i64, range: &Range) -> StoreResult<Option<Vec<u8>>> {
        let found = self.kv_scan_reverse(cf, ts, range, 1, true)?;
        Ok(found.into_iter().next().map(|kv| kv.key))
    }

    /// A plain-key iterator over visible entries.
    pub fn new_iterator(&self, cf: &str, ts: i64, range: Range) -> StoreResult<MvccIterator<'_>> {
        let encoded = encode_range(&range);
        let mut opts = IterOptions::default();
        if !encoded.end_key.is_empty() {
            opts.upper_bound = Some(encoded.end_key.clone());
        }
        let inner = self.store.iter(cf, opts)?;
        let mut iterator = MvccIterator {
            inner,
            ts,
            start: encoded.start_key,
            key: Vec::new(),
            value: Vec::new(),
            valid: false,
        };
        iterator.seek_to_first()?;
        Ok(iterator)
    }
}

fn effective_ts(ts: i64) -> i64 {
    if ts == 0 {
        i64::MAX
    } else {
        ts
    }
}

fn decode_visible(raw_value: &[u8]) -> StoreResult<Visible> {
    let unpacked = codec::unpack_value(raw_value)?;
    if unpacked.is_tombstone() || unpacked.is_expired(current_time_ms()) {
        return Ok(Visible::Hidden);
    }
    Ok(Visible::Value(unpacked.payload.to_vec()))
}

/// Position the iterator past every version of `plain`.
fn seek_to_next_user_key(iter: &mut RawIter<'_>, plain: &[u8]) {
    // ts = 0 sorts after every real version of the key.
    iter.seek(&codec::append_ts(plain, 0));
    if iter.valid() {
        if let Ok((at, version_ts)) = codec::split_encoded(iter.key()) {
            if at == plain && version_ts == 0 {
                iter.next();
            }
        }
    }
}

/// Forward iterator yielding `(plain_key, value)` for visible entries.
pub struct MvccIterator<'a> {
    inner: RawIter<'a>,
    ts: i64,
    start: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
}

impl MvccIterator<'_> {
    fn seek_to_first(&mut self) -> StoreResult<()> {
        let start = std::mem::take(&mut self.start);
        self.inner.seek(&start);
        self.advance_to_visible()
    }

    /// Re-position at the first visible entry at or after `plain_key`.
    pub fn seek(&mut self, plain_key: &[u8]) -> StoreResult<()> {
        self.inner.seek(&codec::encode_seek_key(plain_key, self.ts));
        self.advance_to_visible()
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Plain key of the current entry.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Unpacked value of the current entry.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn next(&mut self) -> StoreResult<()> {
        if !self.valid {
            return Ok(());
        }
        let current = std::mem::take(&mut self.key);
        seek_to_next_user_key(&mut self.inner, &current);
        self.advance_to_visible()
    }

    fn advance_to_visible(&mut self) -> StoreResult<()> {
        self.valid = false;
        while self.inner.valid() {
            let (plain, version_ts) = codec::split_encoded(self.inner.key())?;
            if version_ts > effective_ts(self.ts) {
                self.inner.next();
                continue;
            }
            let plain = plain.to_vec();
            match decode_visible(self.inner.value())? {
                Visible::Value(value) => {
                    self.key = plain;
                    self.value = value;
                    self.valid = true;
                    return Ok(());
                }
                Visible::Hidden => {
                    seek_to_next_user_key(&mut self.inner, &plain);
                }
            }
        }
        Ok(())
    }
}
