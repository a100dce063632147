pub mod align;
pub mod cache;
pub mod checkin;
pub mod compare;
pub mod config;
pub mod detect;
pub mod embed;
pub mod media;
pub mod normalize;
pub mod outcome;
pub mod runtime;
pub mod store;

pub use cache::IdentityCache;
pub use checkin::{CheckIn, CheckInSink, LocationHints};
pub use compare::{VerificationResult, Verifier};
pub use config::Config;
pub use detect::{FaceLocator, FaceRegion};
pub use embed::{FaceEncoder, FaceEncoding};
pub use media::{MediaReference, MediaStore};
pub use normalize::{NormalizedImage, RawImage};
pub use outcome::{Enrollment, Envelope, Failure, FailureKind, Outcome, Verification};
pub use store::{IdentityRecord, IdentityStore};

use compare::CompareError;
use image::Rgb;
use imageproc::drawing::{draw_cross_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use normalize::ImageNormalizer;
use outcome::{EnrollStage, Stage, VerifyStage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Runtime error: {0}")]
    Runtime(#[from] runtime::RuntimeError),
    #[error("Detection error: {0}")]
    Detection(#[from] detect::DetectionError),
    #[error("Encoding error: {0}")]
    Embedding(#[from] embed::EmbedError),
    #[error("{0}")]
    Other(String),
}

/// External systems the orchestrators talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub identities: Arc<dyn IdentityStore>,
    pub media: Arc<dyn MediaStore>,
    pub check_ins: Arc<dyn CheckInSink>,
}

impl Collaborators {
    /// Filesystem-backed collaborators rooted at the configured paths.
    pub fn from_config(config: &config::StorageConfig) -> Self {
        Self {
            identities: Arc::new(store::FileIdentityStore::from_config(config)),
            media: Arc::new(media::DirMediaStore::from_config(config)),
            check_ins: Arc::new(checkin::CheckInLog::from_config(config)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub identity_id: String,
    pub image: RawImage,
}

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub identity_id: String,
    pub image: RawImage,
    pub hints: LocationHints,
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Enrollment and verification over an injected pipeline and collaborators.
///
/// Requests share nothing but the identity cache, so one service can be
/// used from many threads at once.
pub struct FaceService {
    config: Config,
    normalizer: ImageNormalizer,
    locator: Box<dyn FaceLocator>,
    encoder: Box<dyn FaceEncoder>,
    verifier: Verifier,
    cache: IdentityCache,
    collaborators: Collaborators,
}

impl FaceService {
    /// Production wiring: ONNX models plus filesystem collaborators.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let runtime = runtime::OnnxRuntime::new(&config.runtime);

        log::info!("Loading face detection model...");
        let locator = detect::ScrfdLocator::new(&config.detection, &runtime)?;

        log::info!("Loading face encoding model...");
        let encoder = embed::OnnxEncoder::new(&config.encoding, &runtime)?;

        let collaborators = Collaborators::from_config(&config.storage);
        Ok(Self::from_parts(
            config,
            Box::new(locator),
            Box::new(encoder),
            collaborators,
        ))
    }

    pub fn from_parts(
        config: Config,
        locator: Box<dyn FaceLocator>,
        encoder: Box<dyn FaceEncoder>,
        collaborators: Collaborators,
    ) -> Self {
        if encoder.dimension() != config.encoding.dimension {
            log::warn!(
                "Encoder produces {} values but configuration expects {}; using the encoder's",
                encoder.dimension(),
                config.encoding.dimension
            );
        }

        Self {
            normalizer: ImageNormalizer::new(&config.normalize),
            verifier: Verifier::new(&config.matching, encoder.dimension()),
            cache: IdentityCache::from_config(&config.cache),
            config,
            locator,
            encoder,
            collaborators,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    /// Register a new encoding for an identity.
    pub fn enroll(&self, request: &EnrollRequest) -> Outcome<Enrollment> {
        let started = Instant::now();
        let outcome = self.run_enroll(request);
        report("enroll", &request.identity_id, &outcome, started);
        outcome
    }

    fn run_enroll(&self, request: &EnrollRequest) -> Outcome<Enrollment> {
        let identity_id = validate_request(&request.identity_id, &request.image, EnrollStage::Decoding)?;
        log::info!("Enrolling identity {}", identity_id);

        let image = self.normalize_image(&request.image, EnrollStage::Decoding)?;
        let region = self.locate_face(&image, EnrollStage::Detecting)?;
        self.save_debug_visualization(&image, &region, identity_id, "enroll");
        let encoding = self.encode_face(&image, &region, EnrollStage::Encoding)?;

        let step = Instant::now();
        let exported = self
            .normalizer
            .export(&image, Some(&region))
            .map_err(|e| {
                Failure::new(
                    FailureKind::Internal,
                    EnrollStage::Persisting,
                    format!("Failed to prepare image for upload: {}", e),
                )
            })?;

        let media_reference = self
            .collaborators
            .media
            .upload(&exported.bytes)
            .map_err(|e| {
                Failure::new(
                    FailureKind::MediaUploadFailed,
                    EnrollStage::Persisting,
                    format!("Failed to upload image: {}", e),
                )
            })?;
        log::debug!(
            "upload: {} bytes as {} in {:.1}ms",
            exported.bytes.len(),
            media_reference,
            elapsed_ms(step)
        );

        let step = Instant::now();
        self.collaborators
            .identities
            .persist(identity_id, &encoding, &media_reference)
            .map_err(|e| {
                Failure::new(
                    FailureKind::RecordUpdateFailed,
                    EnrollStage::Persisting,
                    format!("Failed to update identity record: {}", e),
                )
            })?;
        log::debug!("persist: {:.1}ms", elapsed_ms(step));

        self.cache.put(
            identity_id,
            IdentityRecord::new(identity_id).enrolled(&encoding, &media_reference),
        );

        Ok(Enrollment {
            identity_id: identity_id.to_string(),
            encoding,
            region,
            media_reference,
            enrolled_at: chrono::Local::now(),
        })
    }

    /// Check a fresh image against the identity's enrolled encoding.
    pub fn verify(&self, request: &VerifyRequest) -> Outcome<Verification> {
        let started = Instant::now();
        let outcome = self.run_verify(request);
        report("verify", &request.identity_id, &outcome, started);
        outcome
    }

    fn run_verify(&self, request: &VerifyRequest) -> Outcome<Verification> {
        let identity_id = validate_request(&request.identity_id, &request.image, VerifyStage::Fetching)?;
        log::info!("Verifying identity {}", identity_id);

        let record = self.fetch_identity(identity_id)?;
        let stored = self.stored_encoding(&record)?;

        let image = self.normalize_image(&request.image, VerifyStage::Decoding)?;
        let region = self.locate_face(&image, VerifyStage::Detecting)?;
        self.save_debug_visualization(&image, &region, identity_id, "verify");
        let candidate = self.encode_face(&image, &region, VerifyStage::Encoding)?;

        let decision = self.verifier.verify(&stored, &candidate).map_err(|e| {
            Failure::new(
                FailureKind::InvalidEncoding,
                VerifyStage::Comparing,
                format!("Encodings cannot be compared: {}", e),
            )
        })?;
        log::debug!(
            "compare: distance {:.4} (tolerance {:.2})",
            decision.distance,
            decision.tolerance
        );

        if !decision.matched {
            return Err(Failure::new(
                FailureKind::FaceMismatch,
                VerifyStage::Comparing,
                "Face does not match",
            )
            .with_distance(decision.distance));
        }

        let result = VerificationResult::from_decision(decision, chrono::Local::now());
        let location = self.record_check_in(identity_id, &request.hints, &result);

        Ok(Verification {
            identity_id: identity_id.to_string(),
            result,
            region,
            location,
        })
    }

    /// Read-through lookup; failed or empty lookups are not cached.
    fn fetch_identity(&self, identity_id: &str) -> Outcome<IdentityRecord> {
        if let Some(record) = self.cache.get(identity_id) {
            log::debug!("fetch: cache hit for {}", identity_id);
            return Ok(record);
        }

        let step = Instant::now();
        let fetched = self.collaborators.identities.fetch(identity_id);
        log::debug!("fetch: store lookup in {:.1}ms", elapsed_ms(step));

        match fetched {
            Ok(Some(record)) => {
                self.cache.put(identity_id, record.clone());
                Ok(record)
            }
            Ok(None) => Err(Failure::new(
                FailureKind::IdentityNotFound,
                VerifyStage::Fetching,
                "User not found",
            )),
            Err(e) => Err(Failure::new(
                FailureKind::Internal,
                VerifyStage::Fetching,
                format!("Identity lookup failed: {}", e),
            )),
        }
    }

    fn stored_encoding(&self, record: &IdentityRecord) -> Outcome<FaceEncoding> {
        let no_enrollment = || {
            Failure::new(
                FailureKind::NoEnrollment,
                VerifyStage::Fetching,
                "No face enrolled for this user",
            )
        };

        let face = match &record.face {
            Some(face) if record.has_encoding() => face,
            _ => return Err(no_enrollment()),
        };

        self.verifier.decode_stored(face).map_err(|e| match e {
            CompareError::Empty => no_enrollment(),
            other => Failure::new(
                FailureKind::InvalidEncoding,
                VerifyStage::Fetching,
                format!("Stored face encoding is invalid: {}", other),
            ),
        })
    }

    fn normalize_image(&self, raw: &RawImage, stage: impl Into<Stage>) -> Outcome<NormalizedImage> {
        let step = Instant::now();
        let image = self.normalizer.normalize(raw).map_err(|e| {
            Failure::new(
                FailureKind::DecodeError,
                stage,
                format!("Could not decode image: {}", e),
            )
        })?;
        log::debug!(
            "normalize: {}x{} (from {}x{}, {:?}) in {:.1}ms",
            image.width(),
            image.height(),
            image.source_dimensions().0,
            image.source_dimensions().1,
            image.orientation(),
            elapsed_ms(step)
        );
        Ok(image)
    }

    fn locate_face(&self, image: &NormalizedImage, stage: impl Into<Stage>) -> Outcome<FaceRegion> {
        let stage = stage.into();
        let step = Instant::now();
        let regions = self.locator.locate(image).map_err(|e| {
            Failure::new(
                FailureKind::Internal,
                stage,
                format!("Face detection failed: {}", e),
            )
        })?;
        log::debug!(
            "detect: {} face(s) in {:.1}ms",
            regions.len(),
            elapsed_ms(step)
        );

        let policy = self.config.detection.selection;
        let region = policy
            .select(&regions, image.width(), image.height())
            .cloned()
            .ok_or_else(|| {
                Failure::new(FailureKind::NoFaceDetected, stage, "No face detected in image")
            })?;

        if regions.len() > 1 {
            log::debug!(
                "Using one of {} faces ({:?} policy, confidence {:.2})",
                regions.len(),
                policy,
                region.confidence
            );
        }
        Ok(region)
    }

    fn encode_face(
        &self,
        image: &NormalizedImage,
        region: &FaceRegion,
        stage: impl Into<Stage>,
    ) -> Outcome<FaceEncoding> {
        let stage = stage.into();
        let step = Instant::now();
        let encoding = self.encoder.encode(image, region).map_err(|e| {
            Failure::new(
                FailureKind::EncodingExtractionFailed,
                stage,
                format!("Could not extract face encoding: {}", e),
            )
        })?;

        if encoding.len() != self.verifier.dimension() {
            return Err(Failure::new(
                FailureKind::EncodingExtractionFailed,
                stage,
                format!(
                    "Encoder returned {} values, expected {}",
                    encoding.len(),
                    self.verifier.dimension()
                ),
            ));
        }
        log::debug!("encode: {:.1}ms", elapsed_ms(step));
        Ok(encoding)
    }

    /// Best-effort check-in; returns the location attached to the result.
    fn record_check_in(
        &self,
        identity_id: &str,
        hints: &LocationHints,
        result: &VerificationResult,
    ) -> String {
        let check_in = CheckIn::new(identity_id, hints, result.decision_time);
        let fallback = || {
            check_in
                .location_hint
                .clone()
                .unwrap_or_else(|| "unknown".to_string())
        };

        match self.collaborators.check_ins.record(&check_in) {
            Ok(Some(annotation)) if !annotation.is_empty() => annotation,
            Ok(_) => fallback(),
            Err(e) => {
                log::warn!("Check-in for {} failed: {}", identity_id, e);
                fallback()
            }
        }
    }

    fn save_debug_visualization(
        &self,
        image: &NormalizedImage,
        region: &FaceRegion,
        identity_id: &str,
        operation: &str,
    ) {
        if !self.config.debug.save_visualizations {
            return;
        }

        let saved = ensure_debug_dir(&self.config.debug.output_dir).and_then(|dir| {
            let path = dir.join(debug_filename(identity_id, operation));
            draw_visualization(image, region, &path)?;
            Ok(path)
        });

        match saved {
            Ok(path) => log::info!("Debug visualization saved to: {}", path.display()),
            Err(e) => log::warn!("Failed to save debug visualization: {}", e),
        }
    }
}

fn validate_request<'a>(
    identity_id: &'a str,
    image: &RawImage,
    stage: impl Into<Stage>,
) -> Outcome<&'a str> {
    let stage = stage.into();
    let identity_id = identity_id.trim();
    if identity_id.is_empty() {
        return Err(Failure::new(
            FailureKind::InvalidRequest,
            stage,
            "Identity id is required",
        ));
    }
    if image.is_empty() {
        return Err(Failure::new(
            FailureKind::InvalidRequest,
            stage,
            "Image is required",
        ));
    }
    Ok(identity_id)
}

fn report<T>(operation: &str, identity_id: &str, outcome: &Outcome<T>, started: Instant) {
    let total = elapsed_ms(started);
    match outcome {
        Ok(_) => log::info!("{} {} succeeded in {:.1}ms", operation, identity_id, total),
        Err(failure) if failure.kind.is_business_outcome() => {
            log::info!("{} {}: {} ({:.1}ms)", operation, identity_id, failure, total)
        }
        Err(failure) => log::error!("{} {} failed: {} ({:.1}ms)", operation, identity_id, failure, total),
    }
}

/// Expand a leading `~` and create the directory.
fn ensure_debug_dir(debug_dir: &Path) -> Result<PathBuf, Error> {
    let expanded = match (debug_dir.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => debug_dir.to_path_buf(),
    };

    std::fs::create_dir_all(&expanded)
        .map_err(|e| Error::Other(format!("Failed to create debug directory: {}", e)))?;
    Ok(expanded)
}

fn debug_filename(identity_id: &str, operation: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let safe_id: String = identity_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!(
        "{}_{}_{}_{}.jpg",
        operation,
        safe_id,
        timestamp,
        std::process::id()
    )
}

/// Selected region in green, landmarks as red crosses.
fn draw_visualization(image: &NormalizedImage, region: &FaceRegion, path: &Path) -> Result<(), Error> {
    let mut canvas = image.raster().clone();

    if !region.is_empty() {
        let rect = Rect::at(region.left as i32, region.top as i32)
            .of_size(region.width(), region.height());
        draw_hollow_rect_mut(&mut canvas, rect, Rgb([0, 255, 0]));
    }

    if let Some(landmarks) = &region.landmarks {
        for (x, y) in landmarks.points() {
            draw_cross_mut(&mut canvas, Rgb([255, 0, 0]), x as i32, y as i32);
        }
    }

    canvas
        .save(path)
        .map_err(|e| Error::Other(format!("Failed to save debug image: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::TempDir;

    #[test]
    fn test_validate_request() {
        let image = RawImage::Bytes(vec![1, 2, 3]);
        assert_eq!(
            validate_request("  alice ", &image, VerifyStage::Fetching).unwrap(),
            "alice"
        );

        let err = validate_request("   ", &image, VerifyStage::Fetching).unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidRequest);
        assert_eq!(err.status_class(), 400);

        let err = validate_request("alice", &RawImage::Base64(" ".into()), EnrollStage::Decoding)
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidRequest);
        assert_eq!(err.stage, Stage::Enroll(EnrollStage::Decoding));
    }

    #[test]
    fn test_debug_filename() {
        let name = debug_filename("alice", "verify");
        assert!(name.starts_with("verify_alice_"));
        assert!(name.ends_with(".jpg"));

        let name = debug_filename("../bob", "enroll");
        assert!(name.starts_with("enroll____bob_"));
    }

    #[test]
    fn test_draw_visualization() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("debug.png");
        let image = NormalizedImage::from_raster(RgbImage::new(40, 40));
        let region = FaceRegion {
            landmarks: Some(detect::FacialLandmarks::from_points([(20.0, 20.0); 5])),
            ..FaceRegion::new(5, 35, 35, 5)
        };

        draw_visualization(&image, &region, &path).unwrap();

        let saved = image::open(&path).unwrap().to_rgb8();
        assert_eq!(*saved.get_pixel(5, 5), Rgb([0, 255, 0]));
        assert_eq!(*saved.get_pixel(20, 20), Rgb([255, 0, 0]));
    }
}
