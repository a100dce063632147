use crate::config::MatchingConfig;
use crate::embed::FaceEncoding;
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CompareError {
    #[error("Encoding is empty")]
    Empty,
    #[error("Encoding has {actual} values, expected {expected}")]
    Dimension { expected: usize, actual: usize },
    #[error("Encoding must be a flat numeric array: {0}")]
    Shape(String),
    #[error("Encoding contains non-finite values")]
    NonFinite,
}

/// Outcome of comparing two encodings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub matched: bool,
    pub distance: f32,
    pub tolerance: f32,
}

/// Decision stamped with the time it was made.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub matched: bool,
    pub distance: f32,
    pub decision_time: DateTime<Local>,
}

impl VerificationResult {
    pub fn from_decision(decision: Decision, decision_time: DateTime<Local>) -> Self {
        Self {
            matched: decision.matched,
            distance: decision.distance,
            decision_time,
        }
    }
}

/// Euclidean distance between two equal-length encodings.
pub fn euclidean_distance(a: &FaceEncoding, b: &FaceEncoding) -> f32 {
    let diff = a.values() - b.values();
    diff.dot(&diff).sqrt()
}

fn check(encoding: &FaceEncoding, dimension: usize) -> Result<(), CompareError> {
    if encoding.is_empty() {
        return Err(CompareError::Empty);
    }
    if encoding.len() != dimension {
        return Err(CompareError::Dimension {
            expected: dimension,
            actual: encoding.len(),
        });
    }
    if encoding.values().iter().any(|v| !v.is_finite()) {
        return Err(CompareError::NonFinite);
    }
    Ok(())
}

/// Compare a fresh encoding against a stored one.
///
/// Both vectors are validated against `dimension` before any distance is
/// computed. A match is `distance <= tolerance`.
pub fn verify(
    stored: &FaceEncoding,
    candidate: &FaceEncoding,
    tolerance: f32,
    dimension: usize,
) -> Result<Decision, CompareError> {
    check(stored, dimension)?;
    check(candidate, dimension)?;

    let distance = euclidean_distance(stored, candidate);
    Ok(Decision {
        matched: distance <= tolerance,
        distance,
        tolerance,
    })
}

/// Parse an encoding persisted as a JSON array.
pub fn decode_stored(value: &Value, dimension: usize) -> Result<FaceEncoding, CompareError> {
    let items = match value {
        Value::Null => return Err(CompareError::Empty),
        Value::Array(items) => items,
        other => {
            return Err(CompareError::Shape(format!(
                "expected an array, found {}",
                json_kind(other)
            )))
        }
    };

    if items.is_empty() {
        return Err(CompareError::Empty);
    }

    let values = items
        .iter()
        .map(|item| match item {
            Value::Number(n) => n
                .as_f64()
                .map(|v| v as f32)
                .ok_or_else(|| CompareError::Shape(format!("unrepresentable number {}", n))),
            other => Err(CompareError::Shape(format!(
                "expected numbers, found {}",
                json_kind(other)
            ))),
        })
        .collect::<Result<Vec<f32>, _>>()?;

    let encoding = FaceEncoding::from_vec(values);
    check(&encoding, dimension)?;
    Ok(encoding)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a nested array",
        Value::Object(_) => "an object",
    }
}

/// Verifier bound to the configured tolerance and encoder dimension.
#[derive(Debug, Clone, Copy)]
pub struct Verifier {
    tolerance: f32,
    dimension: usize,
}

impl Verifier {
    pub fn new(config: &MatchingConfig, dimension: usize) -> Self {
        Self {
            tolerance: config.tolerance,
            dimension,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn verify(
        &self,
        stored: &FaceEncoding,
        candidate: &FaceEncoding,
    ) -> Result<Decision, CompareError> {
        verify(stored, candidate, self.tolerance, self.dimension)
    }

    pub fn decode_stored(&self, value: &Value) -> Result<FaceEncoding, CompareError> {
        decode_stored(value, self.dimension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit(dim: usize, axis: usize) -> FaceEncoding {
        let mut values = vec![0.0; dim];
        values[axis] = 1.0;
        FaceEncoding::from_vec(values)
    }

    #[test]
    fn test_self_comparison_always_matches() {
        let e = FaceEncoding::from_vec((0..128).map(|i| (i as f32 * 0.37).sin()).collect());
        for tolerance in [0.0, 0.6, 10.0] {
            let decision = verify(&e, &e, tolerance, 128).unwrap();
            assert!(decision.matched);
            assert_eq!(decision.distance, 0.0);
        }
    }

    #[test]
    fn test_distinct_encodings_do_not_match() {
        let decision = verify(&unit(128, 0), &unit(128, 1), 0.6, 128).unwrap();
        assert!(!decision.matched);
        assert!((decision.distance - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_tolerance_boundary_is_inclusive() {
        let a = FaceEncoding::from_vec(vec![0.0, 0.0]);
        let b = FaceEncoding::from_vec(vec![0.5, 0.0]);
        assert!(verify(&a, &b, 0.5, 2).unwrap().matched);
        assert!(!verify(&a, &b, 0.49, 2).unwrap().matched);
    }

    #[test]
    fn test_rejects_bad_shapes_before_comparing() {
        let good = unit(128, 0);
        assert_eq!(
            verify(&good, &unit(64, 0), 0.6, 128),
            Err(CompareError::Dimension {
                expected: 128,
                actual: 64
            })
        );
        assert_eq!(
            verify(&FaceEncoding::from_vec(Vec::new()), &good, 0.6, 128),
            Err(CompareError::Empty)
        );

        let mut values = vec![0.0; 128];
        values[3] = f32::INFINITY;
        assert_eq!(
            verify(&good, &FaceEncoding::from_vec(values), 0.6, 128),
            Err(CompareError::NonFinite)
        );
    }

    #[test]
    fn test_decode_stored_encoding() {
        let stored = json!([0.5, -0.25, 0.0, 1]);
        let encoding = decode_stored(&stored, 4).unwrap();
        assert_eq!(encoding.to_vec(), vec![0.5, -0.25, 0.0, 1.0]);
    }

    #[test]
    fn test_decode_stored_rejects_invalid_values() {
        assert_eq!(decode_stored(&Value::Null, 4), Err(CompareError::Empty));
        assert_eq!(decode_stored(&json!([]), 4), Err(CompareError::Empty));
        assert!(matches!(
            decode_stored(&json!([[0.1, 0.2], [0.3, 0.4]]), 4),
            Err(CompareError::Shape(_))
        ));
        assert!(matches!(
            decode_stored(&json!({"face": [0.1]}), 4),
            Err(CompareError::Shape(_))
        ));
        assert!(matches!(
            decode_stored(&json!([0.1, "x", 0.3, 0.4]), 4),
            Err(CompareError::Shape(_))
        ));
        assert_eq!(
            decode_stored(&json!([0.1, 0.2, 0.3]), 4),
            Err(CompareError::Dimension {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_verifier_uses_configured_tolerance() {
        let verifier = Verifier::new(&MatchingConfig { tolerance: 0.1 }, 2);
        let a = FaceEncoding::from_vec(vec![0.0, 0.0]);
        let b = FaceEncoding::from_vec(vec![0.2, 0.0]);
        let decision = verifier.verify(&a, &b).unwrap();
        assert!(!decision.matched);
        assert_eq!(decision.tolerance, 0.1);
    }
}
