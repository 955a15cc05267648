//! Scalar predicate evaluation.
//!
//! Two evaluators over a vector's scalar map, both pure functions of the
//! record:
//! - [`MapFilter`]: every `(key, value)` of the query map must be present
//!   and equal (type-aware; floats within epsilon, lists element-wise).
//! - [`ExprFilter`]: a compiled expression blob (AND/OR/NOT, comparisons,
//!   LIKE, IN, IS_NULL) over a declared column schema. Opening the blob
//!   validates every referenced column against the region's schema.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use rangekv_core::error::{StoreError, StoreResult};
use rangekv_core::types::{ScalarFieldType, ScalarMap, ScalarSchema, ScalarValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Expression tree. The serialized (`bincode`) form of this tree is the
/// "compiled blob" carried in search requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarExpr {
    And(Box<ScalarExpr>, Box<ScalarExpr>),
    Or(Box<ScalarExpr>, Box<ScalarExpr>),
    Not(Box<ScalarExpr>),
    Cmp {
        op: CmpOp,
        column: String,
        operand: ScalarValue,
    },
    Like {
        column: String,
        pattern: String,
    },
    In {
        column: String,
        set: Vec<ScalarValue>,
    },
    IsNull {
        column: String,
    },
}

impl ScalarExpr {
    /// Convenience constructor for the common equality predicate.
    pub fn eq(column: impl Into<String>, operand: ScalarValue) -> Self {
        ScalarExpr::Cmp {
            op: CmpOp::Eq,
            column: column.into(),
            operand,
        }
    }

    pub fn and(self, other: ScalarExpr) -> Self {
        ScalarExpr::And(Box::new(self), Box::new(other))
    }

    /// Serialize into the wire blob.
    pub fn compile(&self) -> Vec<u8> {
        bincode::serialize(self).expect("expression serialization is infallible")
    }

    /// Collect every referenced column.
    pub fn columns(&self, out: &mut BTreeSet<String>) {
        match self {
            ScalarExpr::And(a, b) | ScalarExpr::Or(a, b) => {
                a.columns(out);
                b.columns(out);
            }
            ScalarExpr::Not(inner) => inner.columns(out),
            ScalarExpr::Cmp { column, .. }
            | ScalarExpr::Like { column, .. }
            | ScalarExpr::In { column, .. }
            | ScalarExpr::IsNull { column } => {
                out.insert(column.clone());
            }
        }
    }

    fn validate(&self, schema: &ScalarSchema) -> StoreResult<()> {
        let field_of = |column: &str| {
            schema.field(column).ok_or_else(|| {
                StoreError::SchemaError(format!("column '{column}' not in scalar schema"))
            })
        };
        match self {
            ScalarExpr::And(a, b) | ScalarExpr::Or(a, b) => {
                a.validate(schema)?;
                b.validate(schema)
            }
            ScalarExpr::Not(inner) => inner.validate(schema),
            ScalarExpr::Cmp {
                op,
                column,
                operand,
            } => {
                let field = field_of(column)?;
                if operand.field_type() != field.field_type {
                    return Err(StoreError::SchemaError(format!(
                        "column '{column}' is {:?}, operand is {:?}",
                        field.field_type,
                        operand.field_type()
                    )));
                }
                if *op != CmpOp::Eq
                    && !matches!(
                        field.field_type,
                        ScalarFieldType::Int | ScalarFieldType::Float | ScalarFieldType::Str
                    )
                {
                    return Err(StoreError::SchemaError(format!(
                        "ordering comparison on non-orderable column '{column}'"
                    )));
                }
                Ok(())
            }
            ScalarExpr::Like { column, .. } => {
                let field = field_of(column)?;
                if field.field_type != ScalarFieldType::Str {
                    return Err(StoreError::SchemaError(format!(
                        "LIKE on non-string column '{column}'"
                    )));
                }
                Ok(())
            }
            ScalarExpr::In { column, set } => {
                let field = field_of(column)?;
                for value in set {
                    if value.field_type() != field.field_type {
                        return Err(StoreError::SchemaError(format!(
                            "IN operand type mismatch on column '{column}'"
                        )));
                    }
                }
                Ok(())
            }
            ScalarExpr::IsNull { column } => field_of(column).map(|_| ()),
        }
    }

    fn eval(&self, record: &ScalarMap) -> bool {
        match self {
            ScalarExpr::And(a, b) => a.eval(record) && b.eval(record),
            ScalarExpr::Or(a, b) => a.eval(record) || b.eval(record),
            ScalarExpr::Not(inner) => !inner.eval(record),
            ScalarExpr::Cmp {
                op,
                column,
                operand,
            } => match record.get(column) {
                Some(value) => match op {
                    CmpOp::Eq => value.approx_eq(operand),
                    _ => match value_cmp(value, operand) {
                        Some(ordering) => match op {
                            CmpOp::Lt => ordering == Ordering::Less,
                            CmpOp::Le => ordering != Ordering::Greater,
                            CmpOp::Gt => ordering == Ordering::Greater,
                            CmpOp::Ge => ordering != Ordering::Less,
                            CmpOp::Eq => unreachable!(),
                        },
                        None => false,
                    },
                },
                None => false,
            },
            ScalarExpr::Like { column, pattern } => match record.get(column) {
                Some(ScalarValue::Str(text)) => like_match(text.as_bytes(), pattern.as_bytes()),
                _ => false,
            },
            ScalarExpr::In { column, set } => match record.get(column) {
                Some(value) => set.iter().any(|candidate| value.approx_eq(candidate)),
                None => false,
            },
            ScalarExpr::IsNull { column } => !record.contains_key(column),
        }
    }
}

/// Ordering between two scalar values of the same type.
fn value_cmp(a: &ScalarValue, b: &ScalarValue) -> Option<Ordering> {
    match (a, b) {
        (ScalarValue::Int(x), ScalarValue::Int(y)) => Some(x.cmp(y)),
        (ScalarValue::Float(x), ScalarValue::Float(y)) => x.partial_cmp(y),
        (ScalarValue::Str(x), ScalarValue::Str(y)) => Some(x.cmp(y)),
        (ScalarValue::Bytes(x), ScalarValue::Bytes(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQL-style LIKE: `%` matches any run, `_` matches one byte.
fn like_match(text: &[u8], pattern: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'%', rest)) => {
            (0..=text.len()).any(|skip| like_match(&text[skip..], rest))
        }
        Some((b'_', rest)) => match text.split_first() {
            Some((_, text_rest)) => like_match(text_rest, rest),
            None => false,
        },
        Some((&literal, rest)) => match text.split_first() {
            Some((&first, text_rest)) => first == literal && like_match(text_rest, rest),
            None => false,
        },
    }
}

/// Opened (schema-validated) expression filter.
#[derive(Debug, Clone)]
pub struct ExprFilter {
    expr: ScalarExpr,
}

impl ExprFilter {
    /// Decode and validate a compiled blob against the region schema.
    pub fn open(blob: &[u8], schema: &ScalarSchema) -> StoreResult<Self> {
        let expr: ScalarExpr = bincode::deserialize(blob)
            .map_err(|e| StoreError::SchemaError(format!("malformed expression blob: {e}")))?;
        expr.validate(schema)?;
        Ok(Self { expr })
    }

    pub fn eval(&self, record: &ScalarMap) -> bool {
        self.expr.eval(record)
    }

    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.expr.columns(&mut out);
        out
    }
}

/// Equality-map filter: containment plus type-aware equality.
#[derive(Debug, Clone, Default)]
pub struct MapFilter {
    expected: ScalarMap,
}

impl MapFilter {
    pub fn new(expected: ScalarMap) -> Self {
        Self { expected }
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }

    pub fn eval(&self, record: &ScalarMap) -> bool {
        self.expected.iter().all(|(key, expected)| {
            record
                .get(key)
                .map(|value| value.approx_eq(expected))
                .unwrap_or(false)
        })
    }

    pub fn columns(&self) -> BTreeSet<String> {
        self.expected.keys().cloned().collect()
    }
}

/// The predicate a search request resolved to. When a request carries both
/// an expression and a legacy equality map, the expression wins.
#[derive(Debug, Clone)]
pub enum ScalarPredicate {
    Expr(ExprFilter),
    Map(MapFilter),
}

impl ScalarPredicate {
    /// Resolve a request's filter inputs. Logs a deprecation warning when a
    /// legacy map is supplied alongside an expression.
    pub fn resolve(
        expression: Option<&[u8]>,
        scalar_map: &ScalarMap,
        schema: &ScalarSchema,
    ) -> StoreResult<Option<Self>> {
        match expression {
            Some(blob) => {
                if !scalar_map.is_empty() {
                    tracing::warn!(
                        "request supplies both a scalar expression and a legacy scalar map; \
                         the map is deprecated and ignored"
                    );
                }
                Ok(Some(ScalarPredicate::Expr(ExprFilter::open(blob, schema)?)))
            }
            None if !scalar_map.is_empty() => {
                Ok(Some(ScalarPredicate::Map(MapFilter::new(scalar_map.clone()))))
            }
            None => Ok(None),
        }
    }

    pub fn eval(&self, record: &ScalarMap) -> bool {
        match self {
            ScalarPredicate::Expr(filter) => filter.eval(record),
            ScalarPredicate::Map(filter) => filter.eval(record),
        }
    }

    pub fn columns(&self) -> BTreeSet<String> {
        match self {
            ScalarPredicate::Expr(filter) => filter.columns(),
            ScalarPredicate::Map(filter) => filter.columns(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangekv_core::types::ScalarField;

    fn schema() -> ScalarSchema {
        ScalarSchema {
            fields: vec![
                ScalarField {
                    key: "color".into(),
                    field_type: ScalarFieldType::Str,
                    enable_speed_up: true,
                },
                ScalarField {
                    key: "size".into(),
                    field_type: ScalarFieldType::Int,
                    enable_speed_up: false,
                },
                ScalarField {
                    key: "weight".into(),
                    field_type: ScalarFieldType::Float,
                    enable_speed_up: false,
                },
            ],
        }
    }

    fn record(color: &str, size: i64) -> ScalarMap {
        let mut map = ScalarMap::new();
        map.insert("color".into(), ScalarValue::Str(color.into()));
        map.insert("size".into(), ScalarValue::Int(size));
        map
    }

    #[test]
    fn test_map_filter() {
        let mut expected = ScalarMap::new();
        expected.insert("color".into(), ScalarValue::Str("red".into()));
        let filter = MapFilter::new(expected);

        assert!(filter.eval(&record("red", 1)));
        assert!(!filter.eval(&record("blue", 1)));
        assert!(!filter.eval(&ScalarMap::new()));
    }

    #[test]
    fn test_expression_round_trip_and_eval() {
        let expr = ScalarExpr::eq("color", ScalarValue::Str("red".into())).and(ScalarExpr::Cmp {
            op: CmpOp::Ge,
            column: "size".into(),
            operand: ScalarValue::Int(10),
        });
        let blob = expr.compile();
        let filter = ExprFilter::open(&blob, &schema()).unwrap();

        assert!(filter.eval(&record("red", 10)));
        assert!(!filter.eval(&record("red", 9)));
        assert!(!filter.eval(&record("blue", 10)));
        assert_eq!(
            filter.columns().into_iter().collect::<Vec<_>>(),
            vec!["color".to_string(), "size".to_string()]
        );
    }

    #[test]
    fn test_or_not_in_isnull() {
        let expr = ScalarExpr::Or(
            Box::new(ScalarExpr::In {
                column: "color".into(),
                set: vec![
                    ScalarValue::Str("red".into()),
                    ScalarValue::Str("green".into()),
                ],
            }),
            Box::new(ScalarExpr::Not(Box::new(ScalarExpr::IsNull {
                column: "weight".into(),
            }))),
        );
        let filter = ExprFilter::open(&expr.compile(), &schema()).unwrap();

        assert!(filter.eval(&record("green", 1)));
        assert!(!filter.eval(&record("blue", 1)));
        let mut with_weight = record("blue", 1);
        with_weight.insert("weight".into(), ScalarValue::Float(1.5));
        assert!(filter.eval(&with_weight));
    }

    #[test]
    fn test_like_patterns() {
        assert!(like_match(b"redwood", b"red%"));
        assert!(like_match(b"redwood", b"%wood"));
        assert!(like_match(b"redwood", b"r_dw%d"));
        assert!(!like_match(b"redwood", b"blue%"));
        assert!(like_match(b"", b"%"));
        assert!(!like_match(b"", b"_"));

        let expr = ScalarExpr::Like {
            column: "color".into(),
            pattern: "re%".into(),
        };
        let filter = ExprFilter::open(&expr.compile(), &schema()).unwrap();
        assert!(filter.eval(&record("red", 1)));
    }

    #[test]
    fn test_schema_validation() {
        // Unknown column.
        let expr = ScalarExpr::eq("shape", ScalarValue::Str("round".into()));
        assert!(matches!(
            ExprFilter::open(&expr.compile(), &schema()),
            Err(StoreError::SchemaError(_))
        ));

        // Type mismatch.
        let expr = ScalarExpr::eq("size", ScalarValue::Str("big".into()));
        assert!(matches!(
            ExprFilter::open(&expr.compile(), &schema()),
            Err(StoreError::SchemaError(_))
        ));

        // LIKE on an int column.
        let expr = ScalarExpr::Like {
            column: "size".into(),
            pattern: "1%".into(),
        };
        assert!(matches!(
            ExprFilter::open(&expr.compile(), &schema()),
            Err(StoreError::SchemaError(_))
        ));

        // Garbage blob.
        assert!(matches!(
            ExprFilter::open(&[0xFF, 0x01], &schema()),
            Err(StoreError::SchemaError(_))
        ));
    }

    #[test]
    fn test_float_comparison_uses_epsilon() {
        let expr = ScalarExpr::eq("weight", ScalarValue::Float(2.5));
        let filter = ExprFilter::open(&expr.compile(), &schema()).unwrap();
        let mut map = ScalarMap::new();
        map.insert("weight".into(), ScalarValue::Float(2.5 + 1e-12));
        assert!(filter.eval(&map));
    }

    #[test]
    fn test_predicate_resolution_prefers_expression() {
        let expr = ScalarExpr::eq("color", ScalarValue::Str("red".into()));
        let blob = expr.compile();
        let mut legacy = ScalarMap::new();
        legacy.insert("color".into(), ScalarValue::Str("blue".into()));

        let predicate = ScalarPredicate::resolve(Some(&blob), &legacy, &schema())
            .unwrap()
            .unwrap();
        // The expression (red), not the map (blue), decides.
        assert!(predicate.eval(&record("red", 1)));
        assert!(!predicate.eval(&record("blue", 1)));

        let map_only = ScalarPredicate::resolve(None, &legacy, &schema())
            .unwrap()
            .unwrap();
        assert!(map_only.eval(&record("blue", 1)));

        assert!(ScalarPredicate::resolve(None, &ScalarMap::new(), &schema())
            .unwrap()
            .is_none());
    }
}
