use crate::config::DetectionConfig;
use crate::normalize::NormalizedImage;
use crate::runtime::OnnxRuntime;
use image::{imageops, RgbImage};
use ort::session::Session;
use ort::value::Value;
use std::sync::Mutex;
use thiserror::Error;

pub use crate::config::SelectionPolicy;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),
}

/// SCRFD uses 3 feature pyramid levels with different strides
const FEATURE_STRIDES: [usize; 3] = [8, 16, 32];
const NUM_ANCHORS: usize = 2;

/// Mean/std normalization used by SCRFD: (p - 127.5) / 128
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FacialLandmarks {
    pub left_eye: (f32, f32),
    pub right_eye: (f32, f32),
    pub nose: (f32, f32),
    pub left_mouth: (f32, f32),
    pub right_mouth: (f32, f32),
}

impl FacialLandmarks {
    pub fn from_points(points: [(f32, f32); 5]) -> Self {
        Self {
            left_eye: points[0],
            right_eye: points[1],
            nose: points[2],
            left_mouth: points[3],
            right_mouth: points[4],
        }
    }

    pub fn points(&self) -> [(f32, f32); 5] {
        [
            self.left_eye,
            self.right_eye,
            self.nose,
            self.left_mouth,
            self.right_mouth,
        ]
    }
}

/// Face rectangle in raster coordinates; `right` and `bottom` are exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceRegion {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
    pub confidence: f32,
    pub landmarks: Option<FacialLandmarks>,
}

impl FaceRegion {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
            confidence: 1.0,
            landmarks: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) as f32 / 2.0,
            (self.top + self.bottom) as f32 / 2.0,
        )
    }

    pub fn iou(&self, other: &FaceRegion) -> f32 {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);

        let intersection =
            u64::from(right.saturating_sub(left)) * u64::from(bottom.saturating_sub(top));
        let union = self.area() + other.area() - intersection;

        if union > 0 {
            intersection as f32 / union as f32
        } else {
            0.0
        }
    }

    /// Clip to a `width` × `height` raster; `None` if nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<FaceRegion> {
        let clamped = FaceRegion {
            top: self.top.min(height),
            right: self.right.min(width),
            bottom: self.bottom.min(height),
            left: self.left.min(width),
            ..self.clone()
        };
        (!clamped.is_empty()).then_some(clamped)
    }
}

impl SelectionPolicy {
    /// Pick the single region used for the request.
    ///
    /// Ties always go to the earlier region in locator order.
    pub fn select<'a>(
        self,
        regions: &'a [FaceRegion],
        width: u32,
        height: u32,
    ) -> Option<&'a FaceRegion> {
        match self {
            SelectionPolicy::First => regions.first(),
            SelectionPolicy::Largest => regions
                .iter()
                .reduce(|best, r| if r.area() > best.area() { r } else { best }),
            SelectionPolicy::MostCentral => {
                let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
                let distance = |r: &FaceRegion| {
                    let (x, y) = r.center();
                    (x - cx).powi(2) + (y - cy).powi(2)
                };
                regions
                    .iter()
                    .min_by(|a, b| distance(a).total_cmp(&distance(b)))
            }
        }
    }
}

/// Finds candidate faces in a normalized image.
///
/// An empty result is a valid answer, not an error.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, image: &NormalizedImage) -> Result<Vec<FaceRegion>, DetectionError>;
}

/// Metadata for mapping letterboxed coordinates back to the raster.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Detection in raster space before integer snapping.
#[derive(Debug, Clone)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    landmarks: Option<FacialLandmarks>,
}

impl Candidate {
    fn into_region(self, width: u32, height: u32) -> Option<FaceRegion> {
        let left = self.x1.max(0.0).floor() as u32;
        let top = self.y1.max(0.0).floor() as u32;
        let right = self.x2.max(0.0).ceil() as u32;
        let bottom = self.y2.max(0.0).ceil() as u32;

        FaceRegion {
            top,
            right,
            bottom,
            left,
            confidence: self.score,
            landmarks: self.landmarks,
        }
        .clamp_to(width, height)
    }
}

/// SCRFD face detector running on ONNX Runtime.
pub struct ScrfdLocator {
    session: Mutex<Session>,
    input_size: u32,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl ScrfdLocator {
    pub fn new(config: &DetectionConfig, runtime: &OnnxRuntime) -> Result<Self, DetectionError> {
        let session = runtime.create_session(&config.model_path)?;

        Ok(Self {
            session: Mutex::new(session),
            input_size: config.profile.input_size(),
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
        })
    }

    /// Letterbox into the square network input, NCHW RGB.
    fn preprocess(&self, image: &RgbImage) -> (([usize; 4], Vec<f32>), Letterbox) {
        let size = self.input_size;
        let (width, height) = image.dimensions();

        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
        let pad_x = (size - new_w) / 2;
        let pad_y = (size - new_h) / 2;

        let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);

        let side = size as usize;
        // Padding normalizes to 0.0
        let mut input_data = vec![0.0f32; 3 * side * side];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (px, py) = ((x + pad_x) as usize, (y + pad_y) as usize);
            for c in 0..3 {
                input_data[c * side * side + py * side + px] =
                    (pixel[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
            }
        }

        let letterbox = Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        };
        (([1, 3, side, side], input_data), letterbox)
    }

    fn infer(&self, image: &RgbImage) -> Result<Vec<Candidate>, DetectionError> {
        let (input_tensor, letterbox) = self.preprocess(image);

        let input_value = Value::from_array(input_tensor).map_err(|e| {
            DetectionError::Inference(format!("Failed to create input tensor: {}", e))
        })?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectionError::Inference("Detector session lock poisoned".into()))?;

        // SCRFD models expect the input tensor to be named "input.1"
        let outputs = session
            .run(ort::inputs!["input.1" => input_value])
            .map_err(|e| DetectionError::Inference(e.to_string()))?;

        if outputs.len() < 9 {
            return Err(DetectionError::Inference(format!(
                "Expected 9 outputs (3 strides × 3 tensors), got {}",
                outputs.len()
            )));
        }

        let mut candidates = Vec::new();

        // Output layout: scores (0-2), bboxes (3-5), keypoints (6-8)
        for (stride_idx, &stride) in FEATURE_STRIDES.iter().enumerate() {
            let (_, scores) = outputs[stride_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    DetectionError::Inference(format!("scores stride {}: {}", stride, e))
                })?;
            let (_, bboxes) = outputs[stride_idx + 3]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    DetectionError::Inference(format!("bboxes stride {}: {}", stride, e))
                })?;
            let (_, kps) = outputs[stride_idx + 6]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::Inference(format!("kps stride {}: {}", stride, e)))?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                self.input_size as usize,
                &letterbox,
                self.confidence_threshold,
            ));
        }

        Ok(candidates)
    }
}

impl FaceLocator for ScrfdLocator {
    fn locate(&self, image: &NormalizedImage) -> Result<Vec<FaceRegion>, DetectionError> {
        let candidates = self.infer(image.raster())?;
        log::debug!("Found {} detections before NMS", candidates.len());

        let (width, height) = image.dimensions();
        let regions = candidates
            .into_iter()
            .filter_map(|c| c.into_region(width, height))
            .collect();

        Ok(rank(regions, self.nms_threshold))
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Candidate> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * NUM_ANCHORS;
    let step = stride as f32;

    let mut candidates = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score < threshold {
            continue;
        }

        let cell = idx / NUM_ANCHORS;
        let anchor_x = (cell % grid) as f32 * step;
        let anchor_y = (cell / grid) as f32 * step;

        let Some(pred) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let (x1, y1) = letterbox.unmap(anchor_x - pred[0] * step, anchor_y - pred[1] * step);
        let (x2, y2) = letterbox.unmap(anchor_x + pred[2] * step, anchor_y + pred[3] * step);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|pred| {
            let mut points = [(0.0f32, 0.0f32); 5];
            for (i, point) in points.iter_mut().enumerate() {
                *point = letterbox.unmap(
                    anchor_x + pred[i * 2] * step,
                    anchor_y + pred[i * 2 + 1] * step,
                );
            }
            FacialLandmarks::from_points(points)
        });

        candidates.push(Candidate {
            x1,
            y1,
            x2,
            y2,
            score,
            landmarks,
        });
    }

    candidates
}

/// Non-maximum suppression followed by a stable descending-confidence order.
fn rank(mut regions: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceRegion> = Vec::new();
    for region in regions {
        if keep.iter().all(|kept| kept.iou(&region) <= iou_threshold) {
            keep.push(region);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(top: u32, right: u32, bottom: u32, left: u32, confidence: f32) -> FaceRegion {
        FaceRegion {
            confidence,
            ..FaceRegion::new(top, right, bottom, left)
        }
    }

    #[test]
    fn test_region_geometry() {
        let r = FaceRegion::new(10, 40, 30, 20);
        assert_eq!(r.width(), 20);
        assert_eq!(r.height(), 20);
        assert_eq!(r.area(), 400);
        assert_eq!(r.center(), (30.0, 20.0));
    }

    #[test]
    fn test_region_iou() {
        let a = FaceRegion::new(0, 10, 10, 0);
        let b = FaceRegion::new(5, 15, 15, 5);
        // Intersection = 25, union = 175
        assert!((a.iou(&b) - 25.0 / 175.0).abs() < 1e-6);
        assert_eq!(a.iou(&FaceRegion::new(20, 30, 30, 20)), 0.0);
    }

    #[test]
    fn test_region_clamp() {
        let r = FaceRegion::new(5, 120, 90, 10);
        let clamped = r.clamp_to(100, 50).unwrap();
        assert_eq!((clamped.right, clamped.bottom), (100, 50));
        assert!(FaceRegion::new(60, 80, 90, 70).clamp_to(50, 50).is_none());
    }

    #[test]
    fn test_rank_suppresses_overlaps_and_orders_by_confidence() {
        let regions = vec![
            region(0, 10, 10, 0, 0.7),
            region(100, 150, 150, 100, 0.9),
            region(1, 11, 11, 1, 0.8),
        ];
        let ranked = rank(regions, 0.4);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].confidence, 0.9);
        assert_eq!(ranked[1].confidence, 0.8);
    }

    #[test]
    fn test_rank_is_stable_for_equal_confidence() {
        let regions = vec![
            region(0, 10, 10, 0, 0.8),
            region(50, 60, 60, 50, 0.8),
        ];
        let ranked = rank(regions, 0.4);
        assert_eq!(ranked[0].left, 0);
        assert_eq!(ranked[1].left, 50);
    }

    #[test]
    fn test_decode_stride_maps_anchor_offsets() {
        // stride 32 on a 320 input: 10x10 grid, 2 anchors per cell
        let mut scores = vec![0.0; 200];
        let mut bboxes = vec![0.0; 800];
        let kps = vec![0.0; 2000];

        // Cell (row 1, col 2), first anchor
        let idx = (10 + 2) * NUM_ANCHORS;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let letterbox = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let candidates = decode_stride(&scores, &bboxes, &kps, 32, 320, &letterbox, 0.5);
        assert_eq!(candidates.len(), 1);

        let c = &candidates[0];
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (32.0, 0.0, 96.0, 64.0));
        let landmarks = c.landmarks.unwrap();
        assert_eq!(landmarks.nose, (64.0, 32.0));

        let region = c.clone().into_region(320, 320).unwrap();
        assert_eq!(
            (region.top, region.right, region.bottom, region.left),
            (0, 96, 64, 32)
        );
    }

    #[test]
    fn test_decode_stride_undoes_letterbox() {
        let mut scores = vec![0.0; 200];
        let mut bboxes = vec![0.0; 800];
        scores[0] = 0.95;
        bboxes[..4].copy_from_slice(&[0.0, 0.0, 2.0, 2.0]);

        let letterbox = Letterbox {
            scale: 0.5,
            pad_x: 0.0,
            pad_y: 16.0,
        };
        let candidates = decode_stride(&scores, &bboxes, &[], 32, 320, &letterbox, 0.5);
        let c = &candidates[0];
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (0.0, -32.0, 128.0, 96.0));
        assert!(c.landmarks.is_none());
    }

    #[test]
    fn test_selection_policies() {
        let regions = vec![
            region(0, 20, 20, 0, 0.9),
            region(40, 90, 90, 40, 0.8),
            region(45, 60, 60, 45, 0.7),
        ];

        let first = SelectionPolicy::First.select(&regions, 100, 100).unwrap();
        assert_eq!(first.left, 0);

        let largest = SelectionPolicy::Largest.select(&regions, 100, 100).unwrap();
        assert_eq!(largest.left, 40);

        let central = SelectionPolicy::MostCentral.select(&regions, 100, 100).unwrap();
        assert_eq!(central.left, 45);

        assert!(SelectionPolicy::First.select(&[], 100, 100).is_none());
    }

    #[test]
    fn test_largest_prefers_earlier_on_tie() {
        let regions = vec![region(0, 10, 10, 0, 0.9), region(50, 60, 60, 50, 0.8)];
        let picked = SelectionPolicy::Largest.select(&regions, 100, 100).unwrap();
        assert_eq!(picked.left, 0);
    }

    #[test]
    #[ignore] // Requires model file
    fn test_scrfd_locator() {
        let runtime = OnnxRuntime::new(&crate::config::RuntimeConfig::default());
        let locator = ScrfdLocator::new(&DetectionConfig::default(), &runtime).unwrap();
        let blank = NormalizedImage::from_raster(RgbImage::new(320, 240));
        assert!(locator.locate(&blank).unwrap().is_empty());
    }
}
