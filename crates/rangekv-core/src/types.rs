//! Core data model: regions, ranges, scalar values and vector records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{StoreError, StoreResult};

/// Region identifier assigned by the coordinator.
pub type RegionId = i64;

/// Vector identifier. Valid ids are strictly positive and below
/// [`VECTOR_ID_MAX`].
pub type VectorId = i64;

/// Reserved upper sentinel for vector ids.
pub const VECTOR_ID_MAX: VectorId = i64::MAX;

/// Returns the current wall-clock time in milliseconds.
pub fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Region epoch: `conf_version` advances on membership changes, `version`
/// advances on splits and merges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_version: i64,
    pub version: i64,
}

impl std::fmt::Display for RegionEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.conf_version, self.version)
    }
}

/// What kind of data a region owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionType {
    Kv,
    VectorIndex,
    DocumentIndex,
}

/// Region lifecycle state as tracked by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionState {
    Normal,
    Splitting,
    Deleting,
    ReadOnly,
}

/// A contiguous key range `[start_key, end_key)` in plain-key space.
///
/// An empty `end_key` means "unbounded above".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl Range {
    pub fn new(start_key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            start_key: start_key.into(),
            end_key: end_key.into(),
        }
    }

    /// True when `key` falls inside `[start_key, end_key)`.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice()
            && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// True when the range can hold no key at all.
    pub fn is_empty(&self) -> bool {
        !self.end_key.is_empty() && self.start_key >= self.end_key
    }

    /// Rejects malformed ranges. The all-0xFF end key is reserved for the
    /// end of keyspace and never accepted from callers.
    pub fn validate(&self) -> StoreResult<()> {
        if !self.end_key.is_empty() && self.start_key > self.end_key {
            return Err(StoreError::RangeInvalid(format!(
                "start {:?} > end {:?}",
                self.start_key, self.end_key
            )));
        }
        if !self.end_key.is_empty() && self.end_key.iter().all(|b| *b == 0xFF) {
            return Err(StoreError::RangeInvalid(
                "end_key reserves the end of keyspace".to_string(),
            ));
        }
        Ok(())
    }
}

/// A range plus boundary inclusion flags, as accepted by delete-range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeWithOptions {
    pub range: Range,
    pub with_start: bool,
    pub with_end: bool,
}

impl RangeWithOptions {
    /// Resolve to a half-open `[start, end)` range, or `None` when the
    /// combination selects nothing (e.g. `start == end` without both bounds
    /// inclusive).
    pub fn to_half_open(&self) -> Option<Range> {
        let mut start = self.range.start_key.clone();
        let mut end = self.range.end_key.clone();
        if !self.with_start {
            start = next_key(&start);
        }
        if self.with_end {
            end = next_key(&end);
        }
        let resolved = Range::new(start, end);
        if resolved.is_empty() {
            None
        } else {
            Some(resolved)
        }
    }
}

/// Smallest key strictly greater than `key` (append a zero byte).
pub fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// Smallest key greater than every key with prefix `key`, carrying into
/// shorter prefixes when trailing bytes are 0xFF. Returns empty (unbounded)
/// when the whole prefix is 0xFF.
pub fn prefix_next(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    while let Some(last) = next.last_mut() {
        if *last == 0xFF {
            next.pop();
        } else {
            *last += 1;
            return next;
        }
    }
    Vec::new()
}

/// A plain key/value pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Scalar attribute value attached to a vector record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<ScalarValue>),
}

/// Relative tolerance used when comparing float scalar values.
pub const FLOAT_EPSILON: f64 = 1e-9;

impl ScalarValue {
    /// Type-aware equality: floats compare within [`FLOAT_EPSILON`], lists
    /// compare element-wise, everything else compares exactly. Values of
    /// different types are never equal.
    pub fn approx_eq(&self, other: &ScalarValue) -> bool {
        match (self, other) {
            (ScalarValue::Bool(a), ScalarValue::Bool(b)) => a == b,
            (ScalarValue::Int(a), ScalarValue::Int(b)) => a == b,
            (ScalarValue::Float(a), ScalarValue::Float(b)) => {
                (a - b).abs() <= FLOAT_EPSILON * a.abs().max(b.abs()).max(1.0)
            }
            (ScalarValue::Str(a), ScalarValue::Str(b)) => a == b,
            (ScalarValue::Bytes(a), ScalarValue::Bytes(b)) => a == b,
            (ScalarValue::List(a), ScalarValue::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.approx_eq(y))
            }
            _ => false,
        }
    }

    /// The declared type this value belongs to, if it maps onto one.
    pub fn field_type(&self) -> ScalarFieldType {
        match self {
            ScalarValue::Bool(_) => ScalarFieldType::Bool,
            ScalarValue::Int(_) => ScalarFieldType::Int,
            ScalarValue::Float(_) => ScalarFieldType::Float,
            ScalarValue::Str(_) => ScalarFieldType::Str,
            ScalarValue::Bytes(_) => ScalarFieldType::Bytes,
            ScalarValue::List(_) => ScalarFieldType::List,
        }
    }
}

/// Per-vector scalar attribute map. Ordered so encodings are deterministic.
pub type ScalarMap = BTreeMap<String, ScalarValue>;

/// Declared type of a scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarFieldType {
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
}

/// One field of the region's scalar schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarField {
    pub key: String,
    pub field_type: ScalarFieldType,
    /// When set, every write materializes a per-key record in the
    /// scalar-speedup column family so pre-filters can push the predicate
    /// down instead of loading whole maps.
    pub enable_speed_up: bool,
}

/// Scalar schema declared for a vector region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarSchema {
    pub fields: Vec<ScalarField>,
}

impl ScalarSchema {
    pub fn field(&self, key: &str) -> Option<&ScalarField> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// True when every named key exists in the schema with speed-up enabled.
    pub fn all_keys_speed_up<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> bool {
        let mut any = false;
        for key in keys {
            any = true;
            match self.field(key) {
                Some(f) if f.enable_speed_up => {}
                _ => return false,
            }
        }
        any
    }
}

/// Vector payload: float32 components or a packed binary embedding
/// (one bit per dimension).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Embedding {
    Float(Vec<f32>),
    Binary(Vec<u8>),
}

impl Embedding {
    pub fn dimension(&self) -> usize {
        match self {
            Embedding::Float(v) => v.len(),
            Embedding::Binary(v) => v.len() * 8,
        }
    }

    pub fn as_float(&self) -> Option<&[f32]> {
        match self {
            Embedding::Float(v) => Some(v),
            Embedding::Binary(_) => None,
        }
    }
}

/// Tabular payload attached to a vector record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableData {
    pub table_key: Vec<u8>,
    pub table_value: Vec<u8>,
}

/// A full vector record as stored and returned by the region core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorWithId {
    pub id: VectorId,
    pub embedding: Option<Embedding>,
    #[serde(default)]
    pub scalar: ScalarMap,
    pub table: Option<TableData>,
}

impl VectorWithId {
    pub fn new(id: VectorId, values: Vec<f32>) -> Self {
        Self {
            id,
            embedding: Some(Embedding::Float(values)),
            scalar: ScalarMap::new(),
            table: None,
        }
    }

    /// Vector ids 0 and the reserved maximum are rejected up front.
    pub fn validate_id(id: VectorId) -> StoreResult<()> {
        if id <= 0 || id == VECTOR_ID_MAX {
            return Err(StoreError::KeyEmpty);
        }
        Ok(())
    }
}

/// A search result: record plus its distance under the query metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorWithDistance {
    pub record: VectorWithId,
    pub distance: f32,
}

/// Cooperative cancellation token, checked at batch boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Per-operation deadline and cancel token.
///
/// Long-running loops call [`OpContext::check`] at heap pops and batch
/// boundaries; the default context never expires.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: CancelToken,
}

impl OpContext {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self {
            deadline: None,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn check(&self) -> StoreResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StoreError::DeadlineExceeded);
            }
        }
        Ok(())
    }
}
