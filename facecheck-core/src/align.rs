//! Similarity alignment of a detected face onto the encoder's canonical crop.

use crate::detect::FacialLandmarks;
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("Landmarks are degenerate, cannot estimate a transform")]
    Degenerate,
    #[error("Transform is not invertible")]
    Singular,
}

/// Output edge of the aligned crop.
pub const ALIGNED_SIZE: u32 = 112;

/// Reference landmark positions inside a 112x112 crop.
pub const CANONICAL_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Similarity transform `x' = a*x - b*y + tx`, `y' = b*x + a*y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst`.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let (mut sx, mut sy, mut su, mut sv) = (0.0, 0.0, 0.0, 0.0);
        let (mut sxx_yy, mut sux_vy, mut svx_uy) = (0.0, 0.0, 0.0);

        for (&(x, y), &(u, v)) in src.iter().zip(dst) {
            sx += x;
            sy += y;
            su += u;
            sv += v;
            sxx_yy += x * x + y * y;
            sux_vy += u * x + v * y;
            svx_uy += v * x - u * y;
        }

        let denom = n * sxx_yy - sx * sx - sy * sy;
        if denom.abs() < 1e-6 {
            return None;
        }

        let a = (n * sux_vy - su * sx - sv * sy) / denom;
        let b = (n * svx_uy + su * sy - sv * sx) / denom;
        Some(Self {
            a,
            b,
            tx: (su - a * sx + b * sy) / n,
            ty: (sv - b * sx - a * sy) / n,
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn projection(&self) -> Option<Projection> {
        #[rustfmt::skip]
        let matrix = [
            self.a, -self.b, self.tx,
            self.b,  self.a, self.ty,
            0.0,     0.0,    1.0,
        ];
        Projection::from_matrix(matrix)
    }
}

/// Warp the face described by `landmarks` into an `ALIGNED_SIZE` square crop.
pub fn align_face(image: &RgbImage, landmarks: &FacialLandmarks) -> Result<RgbImage, AlignmentError> {
    let transform = Similarity::estimate(&landmarks.points(), &CANONICAL_LANDMARKS)
        .ok_or(AlignmentError::Degenerate)?;
    let projection = transform.projection().ok_or(AlignmentError::Singular)?;

    let mut aligned = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    warp_into(
        image,
        &projection,
        Interpolation::Bilinear,
        Rgb([0, 0, 0]),
        &mut aligned,
    );
    Ok(aligned)
}
