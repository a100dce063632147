//! Image normalization: transport decoding, EXIF orientation, bounded resize,
//! and the lossy export copy handed to the media store.

use crate::config::NormalizeConfig;
use crate::detect::FaceRegion;
use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use std::borrow::Cow;
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Image payload is empty")]
    Empty,
    #[error("Invalid base64 payload: {0}")]
    Transport(#[from] base64::DecodeError),
    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("Failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
}

/// EXIF orientation tag (0x0112).
const EXIF_ORIENTATION_NORMAL: u32 = 1;

pub const EXPORT_MIME: &str = "image/jpeg";

/// Encoded image as received from a caller.
#[derive(Debug, Clone)]
pub enum RawImage {
    /// Base64 text, optionally wrapped in a `data:<mime>;base64,` URL.
    Base64(String),
    Bytes(Vec<u8>),
}

impl RawImage {
    pub fn is_empty(&self) -> bool {
        match self {
            RawImage::Base64(text) => text.trim().is_empty(),
            RawImage::Bytes(bytes) => bytes.is_empty(),
        }
    }

    /// Strip the transport encoding, yielding the encoded image bytes.
    pub fn decode_transport(&self) -> Result<Cow<'_, [u8]>, NormalizeError> {
        let bytes = match self {
            RawImage::Bytes(bytes) => Cow::Borrowed(bytes.as_slice()),
            RawImage::Base64(text) => {
                let payload = match text.split_once(";base64,") {
                    Some((prefix, rest)) if prefix.starts_with("data:") => rest,
                    _ => text.as_str(),
                };
                let compact: String = payload
                    .chars()
                    .filter(|c| !c.is_ascii_whitespace())
                    .collect();
                Cow::Owned(general_purpose::STANDARD.decode(compact)?)
            }
        };

        if bytes.is_empty() {
            return Err(NormalizeError::Empty);
        }
        Ok(bytes)
    }
}

/// Rotation applied to make the raster upright.
///
/// Angles are counter-clockwise; EXIF tags outside {3, 6, 8} pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Upright,
    Rotate180,
    Rotate270,
    Rotate90,
}

impl Orientation {
    pub fn from_exif_tag(tag: u32) -> Self {
        match tag {
            3 => Orientation::Rotate180,
            6 => Orientation::Rotate270,
            8 => Orientation::Rotate90,
            _ => Orientation::Upright,
        }
    }

    pub fn apply(self, image: DynamicImage) -> DynamicImage {
        // image's rotate* helpers turn clockwise
        match self {
            Orientation::Upright => image,
            Orientation::Rotate180 => image.rotate180(),
            Orientation::Rotate270 => image.rotate90(),
            Orientation::Rotate90 => image.rotate270(),
        }
    }
}

/// Read the EXIF orientation tag, if the container carries one.
pub fn read_orientation_tag(bytes: &[u8]) -> Option<u32> {
    let mut cursor = Cursor::new(bytes);
    let exif = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
}

/// Decoded, upright, bounded raster owned by a single request.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    raster: RgbImage,
    orientation: Orientation,
    source_dimensions: (u32, u32),
}

impl NormalizedImage {
    pub fn from_raster(raster: RgbImage) -> Self {
        let source_dimensions = raster.dimensions();
        Self {
            raster,
            orientation: Orientation::Upright,
            source_dimensions,
        }
    }

    pub fn raster(&self) -> &RgbImage {
        &self.raster
    }

    pub fn width(&self) -> u32 {
        self.raster.width()
    }

    pub fn height(&self) -> u32 {
        self.raster.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.raster.dimensions()
    }

    /// Rotation that was applied during normalization.
    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    /// Decoded dimensions before rotation and resizing.
    pub fn source_dimensions(&self) -> (u32, u32) {
        self.source_dimensions
    }
}

/// JPEG copy of a normalized image, ready for upload.
#[derive(Debug, Clone)]
pub struct ExportedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl ExportedImage {
    pub fn mime(&self) -> &'static str {
        EXPORT_MIME
    }
}

pub struct ImageNormalizer {
    max_width: u32,
    max_height: u32,
    jpeg_quality: u8,
    crop_export_to_face: bool,
}

impl ImageNormalizer {
    pub fn new(config: &NormalizeConfig) -> Self {
        Self {
            max_width: config.max_width,
            max_height: config.max_height,
            jpeg_quality: config.jpeg_quality,
            crop_export_to_face: config.crop_export_to_face,
        }
    }

    /// Decode, orient and bound a raw image.
    pub fn normalize(&self, raw: &RawImage) -> Result<NormalizedImage, NormalizeError> {
        let bytes = raw.decode_transport()?;

        let decoded = image::load_from_memory(&bytes).map_err(NormalizeError::Decode)?;
        let source_dimensions = image::GenericImageView::dimensions(&decoded);

        let orientation = match read_orientation_tag(&bytes) {
            Some(tag) => {
                if tag != EXIF_ORIENTATION_NORMAL {
                    log::debug!("EXIF orientation tag {}", tag);
                }
                Orientation::from_exif_tag(tag)
            }
            None => {
                log::debug!("No EXIF orientation, leaving image unrotated");
                Orientation::Upright
            }
        };

        let raster = orientation.apply(decoded).to_rgb8();
        let raster = self.bound(raster);

        Ok(NormalizedImage {
            raster,
            orientation,
            source_dimensions,
        })
    }

    fn bound(&self, raster: RgbImage) -> RgbImage {
        let (width, height) = raster.dimensions();
        let (new_width, new_height) =
            bounded_dimensions(width, height, self.max_width, self.max_height);

        if (new_width, new_height) == (width, height) {
            return raster;
        }

        log::debug!(
            "Resizing {}x{} → {}x{}",
            width,
            height,
            new_width,
            new_height
        );
        imageops::resize(&raster, new_width, new_height, FilterType::Lanczos3)
    }

    /// Produce the lossy copy for storage, cropped to `region` when configured.
    ///
    /// Never feed the result back into detection: it is recompressed.
    pub fn export(
        &self,
        image: &NormalizedImage,
        region: Option<&FaceRegion>,
    ) -> Result<ExportedImage, NormalizeError> {
        let source = image.raster();
        let cropped = match region.filter(|_| self.crop_export_to_face) {
            Some(region) => crop_to_region(source, region),
            None => None,
        };
        let raster = cropped.as_ref().unwrap_or(source);

        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, self.jpeg_quality)
            .encode_image(raster)
            .map_err(NormalizeError::Encode)?;

        Ok(ExportedImage {
            bytes,
            width: raster.width(),
            height: raster.height(),
        })
    }
}

/// Crop a raster to a face region; `None` when the region misses the raster.
pub fn crop_to_region(raster: &RgbImage, region: &FaceRegion) -> Option<RgbImage> {
    let clamped = region.clamp_to(raster.width(), raster.height());
    let Some(region) = clamped else {
        log::warn!("Face region {:?} lies outside the image, exporting full frame", region);
        return None;
    };
    Some(
        imageops::crop_imm(
            raster,
            region.left,
            region.top,
            region.width(),
            region.height(),
        )
        .to_image(),
    )
}

/// Fit (width, height) inside (max_width, max_height) preserving aspect ratio.
///
/// The limiting side is clamped to its bound and the other side scaled down
/// proportionally. Images already within bounds are never upscaled.
pub fn bounded_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }

    let (w, h) = (u64::from(width), u64::from(height));
    let (max_w, max_h) = (u64::from(max_width), u64::from(max_height));

    if w * max_h >= h * max_w {
        let scaled = (h * max_w / w).max(1);
        (max_width, scaled as u32)
    } else {
        let scaled = (w * max_h / h).max(1);
        (scaled as u32, max_height)
    }
}
