use crate::align::{align_face, ALIGNED_SIZE};
use crate::config::EncodingConfig;
use crate::detect::FaceRegion;
use crate::normalize::{crop_to_region, NormalizedImage};
use crate::runtime::OnnxRuntime;
use image::{imageops, RgbImage};
use ndarray::Array1;
use ort::session::Session;
use ort::value::Value;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Invalid encoding dimension, expected {expected} but got {actual}")]
    InvalidDimension { expected: usize, actual: usize },
    #[error("Face region is empty after clipping to the image")]
    EmptyRegion,
    #[error("Encoder produced a degenerate descriptor")]
    Degenerate,
    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),
}

/// Fixed-length face descriptor. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEncoding(Array1<f32>);

impl FaceEncoding {
    pub fn from_vec(values: Vec<f32>) -> Self {
        Self(Array1::from_vec(values))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &Array1<f32> {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.0.to_vec()
    }

    pub fn norm(&self) -> f32 {
        self.0.dot(&self.0).sqrt()
    }

    /// JSON array form used by identity records.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::from(self.to_vec())
    }
}

/// Maps an image region to a descriptor; deterministic for a given input.
pub trait FaceEncoder: Send + Sync {
    fn dimension(&self) -> usize;

    fn encode(
        &self,
        image: &NormalizedImage,
        region: &FaceRegion,
    ) -> Result<FaceEncoding, EmbedError>;
}

/// L2 normalize a descriptor; `None` for zero or non-finite vectors.
pub fn l2_normalize(mut values: Array1<f32>) -> Option<Array1<f32>> {
    if values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let norm = values.dot(&values).sqrt();
    if norm <= f32::EPSILON {
        return None;
    }
    values /= norm;
    Some(values)
}

/// Square face crop fed to the network: aligned when landmarks are known.
pub fn face_chip(image: &NormalizedImage, region: &FaceRegion) -> Result<RgbImage, EmbedError> {
    if let Some(landmarks) = &region.landmarks {
        match align_face(image.raster(), landmarks) {
            Ok(aligned) => return Ok(aligned),
            Err(e) => log::debug!("Alignment failed ({}), using plain crop", e),
        }
    }

    let crop = crop_to_region(image.raster(), region).ok_or(EmbedError::EmptyRegion)?;
    Ok(imageops::resize(
        &crop,
        ALIGNED_SIZE,
        ALIGNED_SIZE,
        imageops::FilterType::Triangle,
    ))
}

/// Face encoder backed by an ONNX model.
pub struct OnnxEncoder {
    session: Mutex<Session>,
    dimension: usize,
}

impl OnnxEncoder {
    pub fn new(config: &EncodingConfig, runtime: &OnnxRuntime) -> Result<Self, EmbedError> {
        let session = runtime.create_session(&config.model_path)?;
        Ok(Self {
            session: Mutex::new(session),
            dimension: config.dimension,
        })
    }

    /// NCHW tensor with (p - 127.5) / 128 normalization.
    fn preprocess(chip: &RgbImage) -> ([usize; 4], Vec<f32>) {
        let size = ALIGNED_SIZE as usize;
        let mut input_data = Vec::with_capacity(size * size * 3);
        for c in 0..3 {
            for y in 0..ALIGNED_SIZE {
                for x in 0..ALIGNED_SIZE {
                    input_data.push((chip.get_pixel(x, y)[c] as f32 - 127.5) / 128.0);
                }
            }
        }
        ([1, 3, size, size], input_data)
    }
}

impl FaceEncoder for OnnxEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(
        &self,
        image: &NormalizedImage,
        region: &FaceRegion,
    ) -> Result<FaceEncoding, EmbedError> {
        let chip = face_chip(image, region)?;

        let input_value = Value::from_array(Self::preprocess(&chip))
            .map_err(|e| EmbedError::Inference(format!("Failed to create input tensor: {}", e)))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbedError::Inference("Encoder session lock poisoned".into()))?;

        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| EmbedError::Inference(e.to_string()))?;

        let (_shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::Inference(format!("Failed to extract encoding: {}", e)))?;

        if data.len() != self.dimension {
            return Err(EmbedError::InvalidDimension {
                expected: self.dimension,
                actual: data.len(),
            });
        }

        let values = l2_normalize(Array1::from_vec(data.to_vec())).ok_or(EmbedError::Degenerate)?;
        Ok(FaceEncoding(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::FacialLandmarks;
    use image::Rgb;

    #[test]
    fn test_l2_normalize() {
        let normalized = l2_normalize(Array1::from_vec(vec![3.0, 4.0])).unwrap();
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_rejects_degenerate_vectors() {
        assert!(l2_normalize(Array1::zeros(128)).is_none());
        assert!(l2_normalize(Array1::from_vec(vec![1.0, f32::NAN])).is_none());
    }

    #[test]
    fn test_encoding_json_shape() {
        let encoding = FaceEncoding::from_vec(vec![0.25, -0.5, 1.0]);
        assert_eq!(encoding.len(), 3);
        assert_eq!(encoding.to_json(), serde_json::json!([0.25, -0.5, 1.0]));
    }

    #[test]
    fn test_face_chip_crops_without_landmarks() {
        let raster = RgbImage::from_fn(200, 100, |x, _| {
            if x < 100 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        });
        let image = NormalizedImage::from_raster(raster);

        let chip = face_chip(&image, &FaceRegion::new(10, 190, 90, 110)).unwrap();
        assert_eq!(chip.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(*chip.get_pixel(56, 56), Rgb([0, 0, 255]));

        let outside = FaceRegion::new(150, 260, 180, 220);
        assert!(matches!(
            face_chip(&image, &outside),
            Err(EmbedError::EmptyRegion)
        ));
    }

    #[test]
    fn test_face_chip_falls_back_when_alignment_fails() {
        let image = NormalizedImage::from_raster(RgbImage::from_pixel(64, 64, Rgb([9, 9, 9])));
        let region = FaceRegion {
            landmarks: Some(FacialLandmarks::from_points([(5.0, 5.0); 5])),
            ..FaceRegion::new(0, 64, 64, 0)
        };
        let chip = face_chip(&image, &region).unwrap();
        assert_eq!(*chip.get_pixel(0, 0), Rgb([9, 9, 9]));
    }

    #[test]
    #[ignore] // Requires model file
    fn test_onnx_encoder() {
        let runtime = OnnxRuntime::new(&crate::config::RuntimeConfig::default());
        let encoder = OnnxEncoder::new(&EncodingConfig::default(), &runtime).unwrap();
        let image = NormalizedImage::from_raster(RgbImage::from_pixel(112, 112, Rgb([128, 100, 90])));
        let encoding = encoder.encode(&image, &FaceRegion::new(0, 112, 112, 0)).unwrap();
        assert_eq!(encoding.len(), 128);
        assert!((encoding.norm() - 1.0).abs() < 1e-4);
    }
}
