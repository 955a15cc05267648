//! Key and value codec for the MVCC keyspace.
//!
//! Encoded key layouts (network order, bit-exact):
//!
//! ```text
//! [1B prefix][8B partition BE][user_key       ][8B !ts BE]   data/scalar/table/write
//! [1B prefix][8B partition BE][8B vector_id BE][8B !ts BE]   vector families
//! [1B prefix][8B partition BE][8B vector_id BE][scalar_key][8B !ts BE]   scalar_speedup
//! ```
//!
//! A *plain* key is everything up to (excluding) the timestamp suffix; region
//! ranges, lock-CF keys and the read surface all speak plain keys. The
//! timestamp is stored bit-complemented so lexicographic ascent within one
//! plain key yields newest-first version order.

use crate::error::{StoreError, StoreResult};
use crate::types::Range;

/// Key prefix for raw (non-transactional) regions.
pub const RAW_PREFIX: u8 = b'r';
/// Key prefix for transactional regions.
pub const TXN_PREFIX: u8 = b't';
/// Key prefix for executor-internal namespaces.
pub const EXEC_PREFIX: u8 = b'e';

/// Number of low bits of a timestamp holding the logical counter.
pub const TS_LOGICAL_BITS: u32 = 18;

pub const PREFIX_LEN: usize = 1;
pub const PARTITION_LEN: usize = 8;
pub const TS_LEN: usize = 8;
pub const VECTOR_ID_LEN: usize = 8;

/// Shortest legal encoded key: prefix + partition + timestamp.
pub const MIN_ENCODED_LEN: usize = PREFIX_LEN + PARTITION_LEN + TS_LEN;

/// Value flag bits (first byte of every stored value).
pub const FLAG_NONE: u8 = 0x00;
pub const FLAG_TOMBSTONE: u8 = 0x01;
pub const FLAG_TTL: u8 = 0x02;
pub const FLAG_COMPRESSED: u8 = 0x04;

/// Compose an MVCC timestamp from a physical millisecond clock and a logical
/// counter.
pub fn compose_ts(physical_ms: i64, logical: i64) -> i64 {
    (physical_ms << TS_LOGICAL_BITS) | logical
}

/// Physical milliseconds component of a timestamp.
pub fn ts_physical_ms(ts: i64) -> i64 {
    ts >> TS_LOGICAL_BITS
}

/// Logical component of a timestamp.
pub fn ts_logical(ts: i64) -> i64 {
    ts & ((1 << TS_LOGICAL_BITS) - 1)
}

fn is_valid_prefix(prefix: u8) -> bool {
    matches!(prefix, RAW_PREFIX | TXN_PREFIX | EXEC_PREFIX)
}

/// Encode a plain key: `[prefix][partition BE][user_key]`.
pub fn encode_plain_key(prefix: u8, partition_id: i64, user_key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PREFIX_LEN + PARTITION_LEN + user_key.len());
    buf.push(prefix);
    buf.extend_from_slice(&partition_id.to_be_bytes());
    buf.extend_from_slice(user_key);
    buf
}

/// Append the complemented timestamp suffix to a plain key.
pub fn append_ts(plain_key: &[u8], ts: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(plain_key.len() + TS_LEN);
    buf.extend_from_slice(plain_key);
    buf.extend_from_slice(&(!(ts as u64)).to_be_bytes());
    buf
}

/// Encode a full versioned key.
pub fn encode_key(prefix: u8, partition_id: i64, user_key: &[u8], ts: i64) -> Vec<u8> {
    append_ts(&encode_plain_key(prefix, partition_id, user_key), ts)
}

/// Seek key for a read at `ts`; `ts = 0` means "latest" and seeks at the
/// maximum timestamp so the newest version is found first.
pub fn encode_seek_key(plain_key: &[u8], ts: i64) -> Vec<u8> {
    let effective = if ts == 0 { i64::MAX } else { ts };
    append_ts(plain_key, effective)
}

/// A decoded versioned key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    pub prefix: u8,
    pub partition_id: i64,
    pub user_key: Vec<u8>,
    pub ts: i64,
}

/// Split an encoded key into its plain part and timestamp.
pub fn split_encoded(encoded: &[u8]) -> StoreResult<(&[u8], i64)> {
    if encoded.len() < MIN_ENCODED_LEN {
        return Err(StoreError::CorruptKey(format!(
            "encoded key too short: {} < {}",
            encoded.len(),
            MIN_ENCODED_LEN
        )));
    }
    let (plain, ts_bytes) = encoded.split_at(encoded.len() - TS_LEN);
    let mut raw = [0u8; TS_LEN];
    raw.copy_from_slice(ts_bytes);
    let ts = !(u64::from_be_bytes(raw)) as i64;
    Ok((plain, ts))
}

/// The plain part of an encoded key.
pub fn strip_ts(encoded: &[u8]) -> StoreResult<&[u8]> {
    split_encoded(encoded).map(|(plain, _)| plain)
}

/// Decode a plain key into `(prefix, partition_id, user_key)`.
pub fn decode_plain_key(plain: &[u8]) -> StoreResult<(u8, i64, &[u8])> {
    if plain.len() < PREFIX_LEN + PARTITION_LEN {
        return Err(StoreError::CorruptKey(format!(
            "plain key too short: {}",
            plain.len()
        )));
    }
    let prefix = plain[0];
    if !is_valid_prefix(prefix) {
        return Err(StoreError::CorruptKey(format!(
            "unknown key prefix: 0x{prefix:02x}"
        )));
    }
    let mut raw = [0u8; PARTITION_LEN];
    raw.copy_from_slice(&plain[PREFIX_LEN..PREFIX_LEN + PARTITION_LEN]);
    let partition_id = i64::from_be_bytes(raw);
    Ok((prefix, partition_id, &plain[PREFIX_LEN + PARTITION_LEN..]))
}

/// Decode a full versioned key.
pub fn decode_key(encoded: &[u8]) -> StoreResult<DecodedKey> {
    let (plain, ts) = split_encoded(encoded)?;
    let (prefix, partition_id, user_key) = decode_plain_key(plain)?;
    Ok(DecodedKey {
        prefix,
        partition_id,
        user_key: user_key.to_vec(),
        ts,
    })
}

/// Encode a plain-key range for iteration over a versioned family.
///
/// Both bounds carry a maximum-timestamp suffix. Versioned families order by
/// (plain key, !ts), and the MAX-ts suffix sorts before every real version of
/// its key: the encoded start bound admits all versions of `start_key`, and
/// the encoded end bound excludes every version of `end_key`. An empty end
/// key stays empty (unbounded).
pub fn encode_range(plain_range: &Range) -> Range {
    Range {
        start_key: append_ts(&plain_range.start_key, i64::MAX),
        end_key: if plain_range.end_key.is_empty() {
            Vec::new()
        } else {
            append_ts(&plain_range.end_key, i64::MAX)
        },
    }
}

/// Plain key for a vector record: `[prefix][partition BE][vector_id BE]`.
pub fn encode_vector_key(prefix: u8, partition_id: i64, vector_id: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PREFIX_LEN + PARTITION_LEN + VECTOR_ID_LEN);
    buf.push(prefix);
    buf.extend_from_slice(&partition_id.to_be_bytes());
    buf.extend_from_slice(&vector_id.to_be_bytes());
    buf
}

/// Versioned vector key.
pub fn encode_vector_key_ts(prefix: u8, partition_id: i64, vector_id: i64, ts: i64) -> Vec<u8> {
    append_ts(&encode_vector_key(prefix, partition_id, vector_id), ts)
}

fn vector_id_at(plain: &[u8]) -> StoreResult<i64> {
    let offset = PREFIX_LEN + PARTITION_LEN;
    if plain.len() < offset + VECTOR_ID_LEN {
        return Err(StoreError::CorruptKey(format!(
            "vector key too short: {}",
            plain.len()
        )));
    }
    let mut raw = [0u8; VECTOR_ID_LEN];
    raw.copy_from_slice(&plain[offset..offset + VECTOR_ID_LEN]);
    Ok(i64::from_be_bytes(raw))
}

/// Vector id from a plain vector key.
pub fn decode_vector_id_plain(plain: &[u8]) -> StoreResult<i64> {
    vector_id_at(plain)
}

/// Vector id from an encoded (timestamped) key of any vector family.
pub fn decode_vector_id(encoded: &[u8]) -> StoreResult<i64> {
    let (plain, _) = split_encoded(encoded)?;
    vector_id_at(plain)
}

/// Plain key in the scalar-speedup family:
/// `[prefix][partition BE][vector_id BE][scalar_key]`.
pub fn encode_scalar_speedup_key(
    prefix: u8,
    partition_id: i64,
    vector_id: i64,
    scalar_key: &str,
) -> Vec<u8> {
    let mut buf = encode_vector_key(prefix, partition_id, vector_id);
    buf.extend_from_slice(scalar_key.as_bytes());
    buf
}

/// Scalar key name from an encoded scalar-speedup key.
pub fn decode_scalar_key(encoded: &[u8]) -> StoreResult<String> {
    let (plain, _) = split_encoded(encoded)?;
    let offset = PREFIX_LEN + PARTITION_LEN + VECTOR_ID_LEN;
    if plain.len() <= offset {
        return Err(StoreError::CorruptKey(
            "scalar speedup key has no scalar name".to_string(),
        ));
    }
    String::from_utf8(plain[offset..].to_vec())
        .map_err(|e| StoreError::CorruptKey(format!("scalar key not utf-8: {e}")))
}

/// A decoded stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedValue<'a> {
    pub flag: u8,
    /// Absolute expiry in milliseconds, present when `FLAG_TTL` is set.
    pub expire_ms: Option<i64>,
    pub payload: &'a [u8],
}

impl UnpackedValue<'_> {
    pub fn is_tombstone(&self) -> bool {
        self.flag & FLAG_TOMBSTONE != 0
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expire_ms, Some(expire) if expire <= now_ms)
    }
}

/// Pack a value: `[1B flag][payload]`.
pub fn pack_value(flag: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(flag);
    buf.extend_from_slice(payload);
    buf
}

/// Pack a value carrying an absolute TTL expiry.
pub fn pack_value_with_ttl(flag: u8, expire_ms: i64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + TS_LEN + payload.len());
    buf.push(flag | FLAG_TTL);
    buf.extend_from_slice(&expire_ms.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// A tombstone value (no payload).
pub fn tombstone_value() -> Vec<u8> {
    vec![FLAG_TOMBSTONE]
}

/// Unpack a stored value into flag, optional expiry and payload.
pub fn unpack_value(value: &[u8]) -> StoreResult<UnpackedValue<'_>> {
    let Some((&flag, rest)) = value.split_first() else {
        return Err(StoreError::Corruption {
            location: "value".to_string(),
            details: "empty stored value".to_string(),
        });
    };
    if flag & FLAG_TTL != 0 {
        if rest.len() < TS_LEN {
            return Err(StoreError::Corruption {
                location: "value".to_string(),
                details: "ttl value missing expiry".to_string(),
            });
        }
        let mut raw = [0u8; TS_LEN];
        raw.copy_from_slice(&rest[..TS_LEN]);
        Ok(UnpackedValue {
            flag,
            expire_ms: Some(i64::from_be_bytes(raw)),
            payload: &rest[TS_LEN..],
        })
    } else {
        Ok(UnpackedValue {
            flag,
            expire_ms: None,
            payload: rest,
        })
    }
}
