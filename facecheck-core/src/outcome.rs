//! Tagged outcomes of the enrollment and verification flows.

use crate::compare::VerificationResult;
use crate::detect::FaceRegion;
use crate::embed::FaceEncoding;
use crate::media::MediaReference;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    InvalidRequest,
    DecodeError,
    NoFaceDetected,
    EncodingExtractionFailed,
    InvalidEncoding,
    IdentityNotFound,
    NoEnrollment,
    FaceMismatch,
    MediaUploadFailed,
    RecordUpdateFailed,
    Internal,
}

impl FailureKind {
    /// HTTP-style status class reported to callers.
    pub fn status_class(self) -> u16 {
        match self {
            FailureKind::IdentityNotFound => 404,
            FailureKind::MediaUploadFailed
            | FailureKind::RecordUpdateFailed
            | FailureKind::Internal => 500,
            _ => 400,
        }
    }

    /// Expected results of the flow rather than faults.
    pub fn is_business_outcome(self) -> bool {
        matches!(
            self,
            FailureKind::FaceMismatch | FailureKind::NoEnrollment | FailureKind::NoFaceDetected
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnrollStage {
    Decoding,
    Detecting,
    Encoding,
    Persisting,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerifyStage {
    Fetching,
    Decoding,
    Detecting,
    Encoding,
    Comparing,
    Done,
}

/// State a flow was in when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Stage {
    Enroll(EnrollStage),
    Verify(VerifyStage),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Enroll(stage) => write!(f, "enroll/{:?}", stage),
            Stage::Verify(stage) => write!(f, "verify/{:?}", stage),
        }
    }
}

impl From<EnrollStage> for Stage {
    fn from(stage: EnrollStage) -> Self {
        Stage::Enroll(stage)
    }
}

impl From<VerifyStage> for Stage {
    fn from(stage: VerifyStage) -> Self {
        Stage::Verify(stage)
    }
}

/// Structured failure returned by the orchestrators.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} at {stage}: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub stage: Stage,
    pub message: String,
    /// Set when the failure came out of a comparison.
    pub distance: Option<f32>,
}

impl Failure {
    pub fn new(kind: FailureKind, stage: impl Into<Stage>, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage: stage.into(),
            message: message.into(),
            distance: None,
        }
    }

    pub fn with_distance(mut self, distance: f32) -> Self {
        self.distance = Some(distance);
        self
    }

    pub fn status_class(&self) -> u16 {
        self.kind.status_class()
    }
}

pub type Outcome<T> = Result<T, Failure>;

/// Successful enrollment.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub identity_id: String,
    pub encoding: FaceEncoding,
    pub region: FaceRegion,
    pub media_reference: MediaReference,
    pub enrolled_at: DateTime<Local>,
}

/// Successful verification.
#[derive(Debug, Clone)]
pub struct Verification {
    pub identity_id: String,
    pub result: VerificationResult,
    pub region: FaceRegion,
    /// Sink annotation, location hint, or "unknown".
    pub location: String,
}

/// Response body handed back over any request surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub message: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_reference: Option<String>,
}

impl Envelope {
    fn success(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            status: 200,
            kind: None,
            time: None,
            distance: None,
            location: None,
            media_reference: None,
        }
    }

    pub fn failure(failure: &Failure) -> Self {
        Self {
            success: false,
            message: failure.message.clone(),
            status: failure.status_class(),
            kind: Some(failure.kind),
            time: None,
            distance: failure.distance,
            location: None,
            media_reference: None,
        }
    }

    pub fn from_enrollment(outcome: &Outcome<Enrollment>) -> Self {
        match outcome {
            Ok(enrollment) => Self {
                time: Some(enrollment.enrolled_at.to_rfc3339()),
                media_reference: Some(enrollment.media_reference.to_string()),
                ..Self::success("enrolled")
            },
            Err(failure) => Self::failure(failure),
        }
    }

    pub fn from_verification(outcome: &Outcome<Verification>) -> Self {
        match outcome {
            Ok(verification) => Self {
                time: Some(verification.result.decision_time.to_rfc3339()),
                distance: Some(verification.result.distance),
                location: Some(verification.location.clone()),
                ..Self::success("verified")
            },
            Err(failure) => Self::failure(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert_eq!(FailureKind::IdentityNotFound.status_class(), 404);
        assert_eq!(FailureKind::MediaUploadFailed.status_class(), 500);
        assert_eq!(FailureKind::RecordUpdateFailed.status_class(), 500);
        assert_eq!(FailureKind::Internal.status_class(), 500);
        for kind in [
            FailureKind::InvalidRequest,
            FailureKind::DecodeError,
            FailureKind::NoFaceDetected,
            FailureKind::EncodingExtractionFailed,
            FailureKind::InvalidEncoding,
            FailureKind::NoEnrollment,
            FailureKind::FaceMismatch,
        ] {
            assert_eq!(kind.status_class(), 400, "{}", kind);
        }
    }

    #[test]
    fn test_failure_display() {
        let failure = Failure::new(
            FailureKind::NoFaceDetected,
            EnrollStage::Detecting,
            "No face detected in image",
        );
        assert_eq!(
            failure.to_string(),
            "NoFaceDetected at enroll/Detecting: No face detected in image"
        );
    }

    #[test]
    fn test_failure_envelope() {
        let failure = Failure::new(
            FailureKind::FaceMismatch,
            VerifyStage::Comparing,
            "Face does not match",
        )
        .with_distance(0.91);
        let envelope = Envelope::from_verification(&Err(failure));

        assert!(!envelope.success);
        assert_eq!(envelope.status, 400);
        assert_eq!(envelope.kind, Some(FailureKind::FaceMismatch));

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["kind"], "FaceMismatch");
        assert!(json.get("location").is_none());
    }

    #[test]
    fn test_verification_envelope() {
        let decided = Local::now();
        let outcome = Ok(Verification {
            identity_id: "alice".into(),
            result: VerificationResult {
                matched: true,
                distance: 0.25,
                decision_time: decided,
            },
            region: FaceRegion::new(0, 10, 10, 0),
            location: "unknown".into(),
        });

        let envelope = Envelope::from_verification(&outcome);
        assert!(envelope.success);
        assert_eq!(envelope.message, "verified");
        assert_eq!(envelope.status, 200);
        assert_eq!(envelope.time, Some(decided.to_rfc3339()));
        assert_eq!(envelope.location.as_deref(), Some("unknown"));
    }
}
