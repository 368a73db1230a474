//! Identity matching: resolve a query embedding to at most one employee.
//!
//! Each employee is represented by their single best-matching enrolled
//! encoding (minimum distance), never by an average of their encodings.

use crate::error::ValidationError;
use crate::types::{Embedding, EmployeeId, EncodingId, FaceEncoding};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_DIMENSION: usize = 512;
/// Cosine distance 0.60 == cosine similarity 0.40.
pub const DEFAULT_THRESHOLD: f32 = 0.60;
pub const DEFAULT_AMBIGUITY_MARGIN: f32 = 0.05;

/// How two embeddings are compared. Lower distance = more similar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// L2 distance.
    Euclidean,
    /// `1 - cosine similarity`, in [0, 2].
    #[default]
    Cosine,
}

impl DistanceMetric {
    pub fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            Self::Euclidean => a.euclidean_distance(b),
            Self::Cosine => 1.0 - a.similarity(b),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Euclidean => f.write_str("euclidean"),
            Self::Cosine => f.write_str("cosine"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Self::Euclidean),
            "cosine" => Ok(Self::Cosine),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// Decision parameters for [`IdentityMatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub metric: DistanceMetric,
    /// A candidate matches only when its distance is strictly below this.
    pub threshold: f32,
    /// Best and runner-up closer than this (inclusive) is ambiguous.
    pub ambiguity_margin: f32,
}

impl MatchPolicy {
    /// Reject policies that would make the decision rule meaningless.
    ///
    /// A NaN or non-positive threshold matches nobody, and a negative margin
    /// turns exact ties into silent picks.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(ValidationError::InvalidPolicy {
                field: "threshold",
                value: self.threshold,
                reason: "must be finite and greater than 0",
            });
        }
        if !(self.ambiguity_margin.is_finite() && self.ambiguity_margin >= 0.0) {
            return Err(ValidationError::InvalidPolicy {
                field: "ambiguity_margin",
                value: self.ambiguity_margin,
                reason: "must be finite and not negative",
            });
        }
        Ok(())
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::default(),
            threshold: DEFAULT_THRESHOLD,
            ambiguity_margin: DEFAULT_AMBIGUITY_MARGIN,
        }
    }
}

/// One employee's best distance to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub employee_id: EmployeeId,
    pub encoding_id: EncodingId,
    pub distance: f32,
}

/// An unambiguous identification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub employee_id: EmployeeId,
    pub encoding_id: EncodingId,
    pub distance: f32,
    /// `1 - distance / threshold`, clamped to [0, 1].
    pub confidence: f32,
}

/// Outcome of an identification. None of these is an error: callers must
/// branch on all three.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Identification {
    Match(Match),
    NoMatch,
    /// Two or more employees fall below the threshold within the ambiguity
    /// margin of each other. Candidates are ordered best first.
    Ambiguous { candidates: Vec<Candidate> },
}

impl Identification {
    pub fn employee_id(&self) -> Option<&EmployeeId> {
        match self {
            Self::Match(m) => Some(&m.employee_id),
            _ => None,
        }
    }
}

/// Scans a gallery snapshot and resolves a query to an employee.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdentityMatcher {
    dimension: usize,
    policy: MatchPolicy,
}

impl IdentityMatcher {
    pub fn new(dimension: usize, policy: MatchPolicy) -> Self {
        Self { dimension, policy }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Copy of this matcher with a different threshold, for per-request overrides.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidPolicy` if `threshold` is not finite and positive.
    pub fn with_threshold(mut self, threshold: f32) -> Result<Self, ValidationError> {
        self.policy.threshold = threshold;
        self.policy.validate()?;
        Ok(self)
    }

    /// Identify `query` against `gallery`.
    ///
    /// When `scope` is given, only encodings of employees in it are
    /// considered. The result is deterministic for a fixed gallery and query:
    /// exact distance ties are broken by the lowest employee id.
    pub fn identify(
        &self,
        query: &Embedding,
        gallery: &[FaceEncoding],
        scope: Option<&HashSet<EmployeeId>>,
    ) -> Result<Identification, ValidationError> {
        query.validate(self.dimension)?;

        let ranked = self.rank(query, gallery, scope);
        Ok(self.decide(ranked))
    }

    /// Best candidate per employee, sorted by distance then employee id.
    pub fn rank(
        &self,
        query: &Embedding,
        gallery: &[FaceEncoding],
        scope: Option<&HashSet<EmployeeId>>,
    ) -> Vec<Candidate> {
        let mut best: HashMap<&EmployeeId, Candidate> = HashMap::new();

        for encoding in gallery {
            if scope.is_some_and(|s| !s.contains(&encoding.employee_id)) {
                continue;
            }
            if encoding.embedding.dimension() != self.dimension {
                tracing::warn!(
                    encoding_id = %encoding.id,
                    employee_id = %encoding.employee_id,
                    dimension = encoding.embedding.dimension(),
                    expected = self.dimension,
                    "skipping stored encoding with wrong dimension"
                );
                continue;
            }

            let distance = self.policy.metric.distance(query, &encoding.embedding);
            if distance.is_nan() {
                continue;
            }

            let better = match best.get(&encoding.employee_id) {
                None => true,
                Some(prev) => match distance.total_cmp(&prev.distance) {
                    Ordering::Less => true,
                    Ordering::Equal => encoding.id < prev.encoding_id,
                    Ordering::Greater => false,
                },
            };
            if better {
                best.insert(
                    &encoding.employee_id,
                    Candidate {
                        employee_id: encoding.employee_id.clone(),
                        encoding_id: encoding.id,
                        distance,
                    },
                );
            }
        }

        let mut ranked: Vec<Candidate> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.employee_id.cmp(&b.employee_id))
        });
        ranked
    }

    fn decide(&self, ranked: Vec<Candidate>) -> Identification {
        let threshold = self.policy.threshold;
        let mut below = ranked.into_iter().filter(|c| c.distance < threshold);

        let Some(best) = below.next() else {
            return Identification::NoMatch;
        };

        let margin = self.policy.ambiguity_margin;
        let rivals: Vec<Candidate> = below
            .take_while(|c| c.distance - best.distance <= margin)
            .collect();

        if !rivals.is_empty() {
            let mut candidates = Vec::with_capacity(rivals.len() + 1);
            candidates.push(best);
            candidates.extend(rivals);
            return Identification::Ambiguous { candidates };
        }

        let confidence = if threshold > 0.0 {
            (1.0 - best.distance / threshold).clamp(0.0, 1.0)
        } else {
            0.0
        };

        Identification::Match(Match {
            employee_id: best.employee_id,
            encoding_id: best.encoding_id,
            distance: best.distance,
            confidence,
        })
    }
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION, MatchPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageRef;
    use chrono::Utc;

    fn enc(employee: &str, values: Vec<f32>) -> FaceEncoding {
        FaceEncoding {
            id: EncodingId::new(),
            employee_id: EmployeeId::parse(employee).unwrap(),
            embedding: Embedding::new(values),
            image_ref: ImageRef::default(),
            created_at: Utc::now(),
        }
    }

    fn euclidean(threshold: f32, margin: f32) -> IdentityMatcher {
        IdentityMatcher::new(
            2,
            MatchPolicy {
                metric: DistanceMetric::Euclidean,
                threshold,
                ambiguity_margin: margin,
            },
        )
    }

    fn query(values: Vec<f32>) -> Embedding {
        Embedding::new(values)
    }

    #[test]
    fn test_exact_query_matches_single_employee() {
        let gallery = vec![enc("E1", vec![0.3, 0.4])];
        let result = euclidean(0.5, 0.05)
            .identify(&query(vec![0.3, 0.4]), &gallery, None)
            .unwrap();
        match result {
            Identification::Match(m) => {
                assert_eq!(m.employee_id.as_str(), "E1");
                assert_eq!(m.encoding_id, gallery[0].id);
                assert!(m.distance.abs() < 1e-6);
                assert!((m.confidence - 1.0).abs() < 1e-6);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_midpoint_query_is_ambiguous() {
        // A and B are 2.0 apart; the query is 1.0 from both.
        let gallery = vec![enc("A", vec![0.0, 0.0]), enc("B", vec![2.0, 0.0])];
        let result = euclidean(1.5, 0.0)
            .identify(&query(vec![1.0, 0.0]), &gallery, None)
            .unwrap();
        match result {
            Identification::Ambiguous { candidates } => {
                let ids: Vec<_> = candidates.iter().map(|c| c.employee_id.as_str()).collect();
                assert_eq!(ids, ["A", "B"]);
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn test_far_query_is_no_match() {
        let gallery = vec![enc("A", vec![0.0, 0.0]), enc("B", vec![2.0, 0.0])];
        let result = euclidean(0.5, 0.05)
            .identify(&query(vec![1.0, 5.0]), &gallery, None)
            .unwrap();
        assert_eq!(result, Identification::NoMatch);
    }

    #[test]
    fn test_distance_equal_to_threshold_is_no_match() {
        let gallery = vec![enc("A", vec![0.0, 0.0])];
        let result = euclidean(1.0, 0.0)
            .identify(&query(vec![1.0, 0.0]), &gallery, None)
            .unwrap();
        assert_eq!(result, Identification::NoMatch);
    }

    #[test]
    fn test_empty_gallery_is_no_match() {
        let result = euclidean(0.5, 0.05).identify(&query(vec![1.0, 0.0]), &[], None).unwrap();
        assert_eq!(result, Identification::NoMatch);
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let gallery = vec![enc("A", vec![0.0, 0.0])];
        let err = euclidean(0.5, 0.05)
            .identify(&query(vec![0.0, 0.0, 0.0]), &gallery, None)
            .unwrap_err();
        assert_eq!(err, ValidationError::DimensionMismatch { expected: 2, actual: 3 });
    }

    #[test]
    fn test_best_of_multiple_encodings() {
        // E1's average would be far from the query; its best sample is close.
        let gallery = vec![
            enc("E1", vec![5.0, 5.0]),
            enc("E1", vec![0.1, 0.0]),
            enc("E2", vec![0.6, 0.0]),
        ];
        let result = euclidean(1.0, 0.05)
            .identify(&query(vec![0.0, 0.0]), &gallery, None)
            .unwrap();
        match result {
            Identification::Match(m) => {
                assert_eq!(m.employee_id.as_str(), "E1");
                assert_eq!(m.encoding_id, gallery[1].id);
                assert!((m.distance - 0.1).abs() < 1e-6);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_near_tie_within_margin_is_ambiguous() {
        let gallery = vec![enc("A", vec![0.30, 0.0]), enc("B", vec![0.0, 0.32])];
        let result = euclidean(0.5, 0.05)
            .identify(&query(vec![0.0, 0.0]), &gallery, None)
            .unwrap();
        assert!(matches!(result, Identification::Ambiguous { .. }));
    }

    #[test]
    fn test_runner_up_outside_margin_matches() {
        let gallery = vec![enc("A", vec![0.10, 0.0]), enc("B", vec![0.0, 0.40])];
        let result = euclidean(0.5, 0.05)
            .identify(&query(vec![0.0, 0.0]), &gallery, None)
            .unwrap();
        assert_eq!(result.employee_id().map(EmployeeId::as_str), Some("A"));
    }

    #[test]
    fn test_runner_up_above_threshold_is_ignored() {
        // B is within the margin of A but not below the threshold.
        let gallery = vec![enc("A", vec![0.48, 0.0]), enc("B", vec![0.0, 0.52])];
        let result = euclidean(0.5, 0.1)
            .identify(&query(vec![0.0, 0.0]), &gallery, None)
            .unwrap();
        assert_eq!(result.employee_id().map(EmployeeId::as_str), Some("A"));
    }

    #[test]
    fn test_ambiguous_lists_only_candidates_within_margin() {
        let gallery = vec![
            enc("C", vec![0.0, 0.10]),
            enc("A", vec![0.10, 0.0]),
            enc("B", vec![0.0, 0.30]),
        ];
        let result = euclidean(0.5, 0.05)
            .identify(&query(vec![0.0, 0.0]), &gallery, None)
            .unwrap();
        match result {
            Identification::Ambiguous { candidates } => {
                let ids: Vec<_> = candidates.iter().map(|c| c.employee_id.as_str()).collect();
                assert_eq!(ids, ["A", "C"]);
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn test_scope_restricts_candidates() {
        let gallery = vec![enc("A", vec![0.0, 0.0]), enc("B", vec![0.0, 0.01])];
        let scope: HashSet<EmployeeId> = [EmployeeId::parse("B").unwrap()].into_iter().collect();
        let result = euclidean(0.5, 0.05)
            .identify(&query(vec![0.0, 0.0]), &gallery, Some(&scope))
            .unwrap();
        assert_eq!(result.employee_id().map(EmployeeId::as_str), Some("B"));
    }

    #[test]
    fn test_wrong_dimension_rows_are_skipped() {
        let gallery = vec![enc("A", vec![0.0, 0.0, 0.0]), enc("B", vec![0.1, 0.0])];
        let result = euclidean(0.5, 0.05)
            .identify(&query(vec![0.0, 0.0]), &gallery, None)
            .unwrap();
        assert_eq!(result.employee_id().map(EmployeeId::as_str), Some("B"));
    }

    #[test]
    fn test_rank_is_deterministic_on_ties() {
        let gallery = vec![enc("Z", vec![1.0, 0.0]), enc("M", vec![0.0, 1.0]), enc("B", vec![-1.0, 0.0])];
        let matcher = euclidean(0.5, 0.0);
        for _ in 0..5 {
            let ranked = matcher.rank(&query(vec![0.0, 0.0]), &gallery, None);
            let ids: Vec<_> = ranked.iter().map(|c| c.employee_id.as_str()).collect();
            assert_eq!(ids, ["B", "M", "Z"]);
        }
    }

    #[test]
    fn test_policy_rejects_negative_margin() {
        let policy = MatchPolicy {
            metric: DistanceMetric::Euclidean,
            threshold: 1.5,
            ambiguity_margin: "-0.01".parse().unwrap(),
        };
        assert!(matches!(
            policy.validate(),
            Err(ValidationError::InvalidPolicy { field: "ambiguity_margin", .. })
        ));
        let zero = MatchPolicy { ambiguity_margin: 0.0, ..policy };
        assert_eq!(zero.validate(), Ok(()));
    }

    #[test]
    fn test_policy_rejects_nan_and_non_positive_threshold() {
        for threshold in [f32::NAN, f32::INFINITY, 0.0, -0.5] {
            let policy = MatchPolicy { threshold, ..MatchPolicy::default() };
            assert!(
                matches!(
                    policy.validate(),
                    Err(ValidationError::InvalidPolicy { field: "threshold", .. })
                ),
                "threshold {threshold} accepted"
            );
        }
        assert_eq!(MatchPolicy::default().validate(), Ok(()));
    }

    #[test]
    fn test_with_threshold_overrides_and_validates() {
        let gallery = vec![enc("A", vec![0.0, 0.0])];
        let strict = euclidean(1.5, 0.0);
        let result = strict.identify(&query(vec![1.0, 0.0]), &gallery, None).unwrap();
        assert_eq!(result.employee_id().map(EmployeeId::as_str), Some("A"));

        let tight = strict.with_threshold(0.5).unwrap();
        assert_eq!(tight.policy().threshold, 0.5);
        let result = tight.identify(&query(vec![1.0, 0.0]), &gallery, None).unwrap();
        assert_eq!(result, Identification::NoMatch);

        assert!(strict.with_threshold(f32::NAN).is_err());
    }

    #[test]
    fn test_cosine_metric_distance() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!((DistanceMetric::Cosine.distance(&a, &a)).abs() < 1e-6);
        assert!((DistanceMetric::Cosine.distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("Cosine".parse::<DistanceMetric>(), Ok(DistanceMetric::Cosine));
        assert_eq!("l2".parse::<DistanceMetric>(), Ok(DistanceMetric::Euclidean));
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }

    #[test]
    fn test_identification_json_shape() {
        let json = serde_json::to_value(Identification::NoMatch).unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "no_match"}));
    }
}
