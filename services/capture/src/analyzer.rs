//! Pixel statistics for scan photos.
//!
//! This module decodes a photo once into a luminance plane and derives the raw
//! measurements the quality gate scores: global brightness and contrast, a
//! row-scan silhouette of the subject, and a Laplacian sharpness proxy.

use image::RgbImage;
use thiserror::Error;

/// Pixels at or above this luminance are treated as background.
pub const FOREGROUND_LUMA_THRESHOLD: f32 = 235.0;

/// Relative body heights at which shoulder, waist and hip widths are sampled.
const SHOULDER_BAND: f64 = 0.22;
const WAIST_BAND: f64 = 0.48;
const HIP_BAND: f64 = 0.62;

/// Errors that can occur while analyzing a photo.
#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("Image decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Image has no pixels")]
    Empty,
}

/// A decoded photo with its luminance plane.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// RGB pixel data
    pub pixels: RgbImage,
    luma: Vec<f32>,
}

impl DecodedImage {
    /// Wrap already-decoded pixels.
    pub fn from_rgb(pixels: RgbImage) -> Result<Self, AnalyzeError> {
        let (width, height) = pixels.dimensions();
        if width == 0 || height == 0 {
            return Err(AnalyzeError::Empty);
        }

        let luma = pixels
            .pixels()
            .map(|p| luminance(p.0[0], p.0[1], p.0[2]))
            .collect();

        Ok(Self {
            width,
            height,
            pixels,
            luma,
        })
    }

    /// Luminance of the pixel at `(x, y)`.
    pub fn luma_at(&self, x: u32, y: u32) -> f32 {
        self.luma[(y as usize) * (self.width as usize) + x as usize]
    }

    fn row(&self, y: usize) -> &[f32] {
        let w = self.width as usize;
        &self.luma[y * w..(y + 1) * w]
    }
}

/// Silhouette and tone statistics of a photo.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SilhouetteMetrics {
    /// Mean luminance (0-255)
    pub brightness: f64,
    /// Standard deviation of luminance
    pub contrast: f64,
    /// Silhouette area divided by frame area
    pub subject_coverage: f64,
    /// Horizontal distance of the silhouette center from the frame center, as a fraction of width
    pub center_offset_ratio: f64,
    /// Rows between the first and last foreground row
    pub subject_height_px: u32,
    pub shoulder_width: f64,
    pub waist_width: f64,
    pub hip_width: f64,
}

/// Rec.601 luma.
pub fn luminance(r: u8, g: u8, b: u8) -> f32 {
    0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b)
}

/// Decode an encoded photo (JPEG or PNG).
pub fn load_image_data(bytes: &[u8]) -> Result<DecodedImage, AnalyzeError> {
    let image = image::load_from_memory(bytes)?;
    DecodedImage::from_rgb(image.to_rgb8())
}

/// Approximate the subject's silhouette by scanning each row for its
/// leftmost and rightmost foreground pixel.
pub fn analyse_silhouette(image: &DecodedImage) -> SilhouetteMetrics {
    let width = image.width as usize;
    let height = image.height as usize;
    let total = image.luma.len() as f64;

    let mean = image.luma.iter().map(|&l| f64::from(l)).sum::<f64>() / total;
    let variance = image
        .luma
        .iter()
        .map(|&l| {
            let diff = f64::from(l) - mean;
            diff * diff
        })
        .sum::<f64>()
        / total;

    let spans: Vec<Option<(usize, usize)>> = (0..height)
        .map(|y| {
            let row = image.row(y);
            let left = row.iter().position(|&l| l < FOREGROUND_LUMA_THRESHOLD)?;
            let right = row.iter().rposition(|&l| l < FOREGROUND_LUMA_THRESHOLD)?;
            Some((left, right))
        })
        .collect();

    let mut metrics = SilhouetteMetrics {
        brightness: mean,
        contrast: variance.sqrt(),
        ..Default::default()
    };

    let (Some(top), Some(bottom)) = (
        spans.iter().position(Option::is_some),
        spans.iter().rposition(Option::is_some),
    ) else {
        return metrics;
    };

    let mut area = 0.0;
    let mut center_sum = 0.0;
    let mut rows = 0.0;
    for &(left, right) in spans.iter().flatten() {
        area += (right - left + 1) as f64;
        center_sum += (left + right + 1) as f64 / 2.0;
        rows += 1.0;
    }

    let frame_center = width as f64 / 2.0;
    let body_height = bottom - top + 1;

    metrics.subject_coverage = area / total;
    metrics.center_offset_ratio = ((center_sum / rows) - frame_center).abs() / width as f64;
    metrics.subject_height_px = body_height as u32;
    metrics.shoulder_width = band_width(&spans, top, bottom, SHOULDER_BAND);
    metrics.waist_width = band_width(&spans, top, bottom, WAIST_BAND);
    metrics.hip_width = band_width(&spans, top, bottom, HIP_BAND);

    metrics
}

/// Mean silhouette width over a thin band of rows centered at `fraction` of
/// the body height. Rows without foreground inside the band count as absent.
fn band_width(spans: &[Option<(usize, usize)>], top: usize, bottom: usize, fraction: f64) -> f64 {
    let body_height = bottom - top;
    let center = top + (fraction * body_height as f64).round() as usize;
    let half_band = (body_height / 100).max(1);

    let start = center.saturating_sub(half_band).max(top);
    let end = (center + half_band).min(bottom);

    let widths: Vec<f64> = spans[start..=end]
        .iter()
        .flatten()
        .map(|&(left, right)| (right - left + 1) as f64)
        .collect();

    if widths.is_empty() {
        0.0
    } else {
        widths.iter().sum::<f64>() / widths.len() as f64
    }
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
///
/// Low variance means few sharp edges, i.e. a blurry photo.
pub fn laplacian_variance(image: &DecodedImage) -> f64 {
    let (width, height) = (image.width as usize, image.height as usize);
    if width < 3 || height < 3 {
        return 0.0;
    }

    let luma = &image.luma;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0.0f64;

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let idx = y * width + x;
            let laplacian = f64::from(
                luma[idx - width] + luma[idx + width] + luma[idx - 1] + luma[idx + 1]
                    - 4.0 * luma[idx],
            );
            sum += laplacian;
            sum_sq += laplacian * laplacian;
            count += 1.0;
        }
    }

    let mean = sum / count;
    (sum_sq / count - mean * mean).max(0.0)
}
