//! Distance metrics.
//!
//! Scores are kept internally in "smaller is better" form: L2 is the squared
//! euclidean distance, inner-product and cosine similarities are negated.
//! [`Metric::display_distance`] converts a score back to the user-facing
//! value at the response edge.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    L2,
    InnerProduct,
    Cosine,
}

impl Metric {
    /// Internal score of `query` against `stored`; smaller is better for
    /// every metric. Cosine assumes both sides are already normalized.
    #[inline]
    pub fn score(&self, query: &[f32], stored: &[f32]) -> f32 {
        match self {
            Metric::L2 => l2_squared(query, stored),
            Metric::InnerProduct | Metric::Cosine => -dot(query, stored),
        }
    }

    /// User-facing distance for a score.
    #[inline]
    pub fn display_distance(&self, score: f32) -> f32 {
        match self {
            Metric::L2 => score,
            Metric::InnerProduct | Metric::Cosine => -score,
        }
    }

    /// Internal score bound equivalent to a user-facing radius. L2 results
    /// lie below the radius; similarity results lie above it.
    #[inline]
    pub fn score_bound(&self, radius: f32) -> f32 {
        match self {
            Metric::L2 => radius,
            Metric::InnerProduct | Metric::Cosine => -radius,
        }
    }

    /// Cosine stores and queries unit vectors.
    pub fn requires_normalization(&self) -> bool {
        matches!(self, Metric::Cosine)
    }

    /// Prepare a vector for storage or querying under this metric.
    pub fn prepare(&self, vector: &[f32]) -> Vec<f32> {
        let mut out = vector.to_vec();
        if self.requires_normalization() {
            normalize(&mut out);
        }
        out
    }
}

/// Normalize in place; the zero vector is left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm_sq: f32 = vector.iter().map(|x| x * x).sum();
    if norm_sq > 0.0 {
        let inv = norm_sq.sqrt().recip();
        for x in vector.iter_mut() {
            *x *= inv;
        }
    }
}

/// Squared euclidean distance with four-lane accumulation (keeps the
/// auto-vectorizer engaged across dimension sizes).
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = [0.0f32; 4];
    let chunks = a.len() / 4;
    for i in 0..chunks {
        let base = i * 4;
        for lane in 0..4 {
            let d = a[base + lane] - b[base + lane];
            acc[lane] += d * d;
        }
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for i in chunks * 4..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = [0.0f32; 4];
    let chunks = a.len() / 4;
    for i in 0..chunks {
        let base = i * 4;
        for lane in 0..4 {
            acc[lane] += a[base + lane] * b[base + lane];
        }
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for i in chunks * 4..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_squared() {
        let a = [1.0, 0.0, 0.0, 0.0, 2.0];
        let b = [0.0, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(l2_squared(&a, &b), 5.0);
        assert_eq!(l2_squared(&a, &a), 0.0);
    }

    #[test]
    fn test_dot() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [1.0, 1.0, 1.0, 1.0, 1.0];
        assert_eq!(dot(&a, &b), 15.0);
    }

    #[test]
    fn test_scores_are_smaller_is_better() {
        let query = [1.0, 0.0];
        let near = [0.9, 0.1];
        let far = [-1.0, 0.0];

        for metric in [Metric::L2, Metric::InnerProduct, Metric::Cosine] {
            let q = metric.prepare(&query);
            let n = metric.prepare(&near);
            let f = metric.prepare(&far);
            assert!(
                metric.score(&q, &n) < metric.score(&q, &f),
                "{metric:?}: nearer vector must score lower"
            );
        }
    }

    #[test]
    fn test_display_round_trip() {
        let score = Metric::InnerProduct.score(&[1.0, 2.0], &[3.0, 4.0]);
        assert_eq!(Metric::InnerProduct.display_distance(score), 11.0);
        assert_eq!(Metric::L2.display_distance(4.0), 4.0);
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
