//! Perceptual image-quality analysis.
//!
//! Produces a `QualityMetrics` value per receipt image: four 0–100 scores,
//! a weighted overall score and the complexity tier that drives routing.
//!
//! Grounded:
//! - OpenCV Laplacian variance as the standard blur metric (8-neighbour kernel)
//! - RMS contrast (luminance standard deviation)
//! - ITU-R BT.601 luminance
//!
//! Analysis runs on a copy downscaled to at most `ANALYSIS_MAX_DIMENSION`
//! on the long edge, so cost is bounded regardless of camera resolution.

use std::borrow::Cow;
use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{ComplexityTier, ExtractionWarning};
use super::ReceiptError;

// ═══════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════

/// Maximum input size: 50 MB (typical phone photo is 3-12 MB).
const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;

/// Minimum valid image: smallest well-formed PNG is 67 bytes.
const MIN_IMAGE_BYTES: usize = 67;

/// Long-edge bound for the analysis copy.
pub const ANALYSIS_MAX_DIMENSION: u32 = 1000;

/// Laplacian variance that maps to a sharpness score of 1.
/// Crisp printed text lands around 2000 and above (score 100).
pub const SHARPNESS_VARIANCE_SCALE: f64 = 20.0;

/// Per-axis luminance step that counts as an ink edge.
pub const GRADIENT_THRESHOLD: i16 = 30;

/// Edge fraction multiplier for the density score.
const TEXT_DENSITY_SCALE: f64 = 10_000.0;

/// Score weights for the overall quality figure.
const WEIGHT_SHARPNESS: f64 = 0.3;
const WEIGHT_CONTRAST: f64 = 0.3;
const WEIGHT_BRIGHTNESS: f64 = 0.2;
const WEIGHT_LEGIBILITY: f64 = 0.2;

/// Thresholds for user-facing quality warnings.
pub mod thresholds {
    pub const BLURRY_BELOW: f64 = 30.0;
    pub const LOW_CONTRAST_BELOW: f64 = 25.0;
    pub const UNDEREXPOSED_BELOW: f64 = 20.0;
    pub const OVEREXPOSED_ABOVE: f64 = 85.0;
    pub const DENSE_TEXT_ABOVE: f64 = 80.0;
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Perceptual quality of one receipt image. All scores are 0–100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub sharpness: f64,
    pub contrast: f64,
    pub brightness: f64,
    pub text_density: f64,
    pub overall_score: f64,
    pub processing_route: ComplexityTier,
    pub estimated_line_items: u32,
}

impl QualityMetrics {
    /// Derive the overall score, tier and item estimate from the four raw scores.
    pub fn from_scores(sharpness: f64, contrast: f64, brightness: f64, text_density: f64) -> Self {
        let sharpness = sharpness.clamp(0.0, 100.0);
        let contrast = contrast.clamp(0.0, 100.0);
        let brightness = brightness.clamp(0.0, 100.0);
        let text_density = text_density.clamp(0.0, 100.0);

        let overall_score = overall_score(sharpness, contrast, brightness, text_density);

        Self {
            sharpness,
            contrast,
            brightness,
            text_density,
            overall_score,
            processing_route: classify_complexity(overall_score, text_density),
            estimated_line_items: estimate_line_items(text_density),
        }
    }
}

/// Swappable analysis service.
pub trait QualityAnalyzer: Send + Sync {
    fn analyze(&self, image: &DynamicImage) -> QualityMetrics;
}

// ═══════════════════════════════════════════════════════════
// Production implementation
// ═══════════════════════════════════════════════════════════

/// Pixel-statistics analyzer.
pub struct PerceptualAnalyzer {
    max_dimension: u32,
}

impl Default for PerceptualAnalyzer {
    fn default() -> Self {
        Self {
            max_dimension: ANALYSIS_MAX_DIMENSION,
        }
    }
}

impl QualityAnalyzer for PerceptualAnalyzer {
    fn analyze(&self, image: &DynamicImage) -> QualityMetrics {
        let rgb = image.to_rgb8();
        let working = pre_downscale(&rgb, self.max_dimension);
        let gray = rgb_to_gray(&working);

        let (mean, std_dev) = luminance_stats(&gray);
        let sharpness = (laplacian_variance(&gray) / SHARPNESS_VARIANCE_SCALE).min(100.0);
        let contrast = (std_dev / 127.5 * 100.0).min(100.0);
        let brightness = mean / 255.0 * 100.0;
        let text_density = (edge_fraction(&gray) * TEXT_DENSITY_SCALE).min(100.0);

        let metrics = QualityMetrics::from_scores(sharpness, contrast, brightness, text_density);
        debug!(
            width = gray.width(),
            height = gray.height(),
            sharpness = format!("{:.1}", metrics.sharpness),
            contrast = format!("{:.1}", metrics.contrast),
            brightness = format!("{:.1}", metrics.brightness),
            text_density = format!("{:.1}", metrics.text_density),
            overall = format!("{:.1}", metrics.overall_score),
            route = ?metrics.processing_route,
            "Image quality analyzed"
        );
        metrics
    }
}

/// Returns the same metrics for every image. For tests and replay.
pub struct FixedQualityAnalyzer(pub QualityMetrics);

impl QualityAnalyzer for FixedQualityAnalyzer {
    fn analyze(&self, _image: &DynamicImage) -> QualityMetrics {
        self.0.clone()
    }
}

// ═══════════════════════════════════════════════════════════
// Decoding
// ═══════════════════════════════════════════════════════════

/// Validate, decode and orient raw image bytes.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ReceiptError> {
    validate_image_bytes(bytes)?;
    let image = image::load_from_memory(bytes).map_err(|e| ReceiptError::ImageDecode(e.to_string()))?;
    Ok(apply_orientation(image, read_exif_orientation(bytes)))
}

/// Reject clearly invalid input before spending time on a decode.
pub fn validate_image_bytes(bytes: &[u8]) -> Result<(), ReceiptError> {
    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(ReceiptError::ImageDecode("Image data too small to be valid".into()));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ReceiptError::ImageDecode(format!(
            "Image data exceeds {}MB limit",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    Ok(())
}

/// Read EXIF orientation tag from raw image bytes.
/// Returns 1 (normal) if no EXIF data or tag not present.
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(r) => r,
        Err(_) => return 1,
    };

    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

/// Apply an EXIF orientation transform.
///
/// 1 = Normal, 2 = Mirrored, 3 = 180deg, 4 = Flipped V,
/// 5 = Mirrored + 90deg CW, 6 = 90deg CW, 7 = Mirrored + 270deg CW, 8 = 270deg CW
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// User-facing warnings implied by the metrics.
pub fn quality_warnings(metrics: &QualityMetrics) -> Vec<ExtractionWarning> {
    let mut warnings = Vec::new();
    if metrics.sharpness < thresholds::BLURRY_BELOW {
        warnings.push(ExtractionWarning::BlurryImage);
    }
    if metrics.contrast < thresholds::LOW_CONTRAST_BELOW {
        warnings.push(ExtractionWarning::PoorContrast);
    }
    if metrics.brightness < thresholds::UNDEREXPOSED_BELOW {
        warnings.push(ExtractionWarning::Underexposed);
    } else if metrics.brightness > thresholds::OVEREXPOSED_ABOVE {
        warnings.push(ExtractionWarning::Overexposed);
    }
    if metrics.text_density > thresholds::DENSE_TEXT_ABOVE {
        warnings.push(ExtractionWarning::DenseText {
            estimated_line_items: metrics.estimated_line_items,
        });
    }
    warnings
}

// ═══════════════════════════════════════════════════════════
// Scoring
// ═══════════════════════════════════════════════════════════

/// Raw brightness discounted by its distance from mid-grey; the discount
/// never exceeds half.
pub fn effective_brightness(brightness: f64) -> f64 {
    let penalty = ((brightness - 50.0).abs() / 50.0).min(0.5);
    brightness * (1.0 - penalty)
}

/// Weighted overall score. Density enters as legibility (`100 - density`):
/// a crowded page is harder, not easier, to read.
pub fn overall_score(sharpness: f64, contrast: f64, brightness: f64, text_density: f64) -> f64 {
    (WEIGHT_SHARPNESS * sharpness
        + WEIGHT_CONTRAST * contrast
        + WEIGHT_BRIGHTNESS * effective_brightness(brightness)
        + WEIGHT_LEGIBILITY * (100.0 - text_density))
        .clamp(0.0, 100.0)
}

pub fn classify_complexity(overall_score: f64, text_density: f64) -> ComplexityTier {
    if overall_score >= 70.0 && text_density <= 30.0 {
        ComplexityTier::Simple
    } else if overall_score >= 50.0 || text_density <= 50.0 {
        ComplexityTier::Standard
    } else {
        ComplexityTier::Complex
    }
}

pub fn estimate_line_items(text_density: f64) -> u32 {
    ((text_density / 10.0).floor() as u32).max(1)
}

// ═══════════════════════════════════════════════════════════
// Pixel statistics
// ═══════════════════════════════════════════════════════════

/// Convert RGB image to grayscale using ITU-R BT.601 luminance.
pub fn rgb_to_gray(rgb: &RgbImage) -> GrayImage {
    let (w, h) = (rgb.width(), rgb.height());
    let mut gray = GrayImage::new(w, h);
    for (x, y, p) in rgb.enumerate_pixels() {
        let luma = (0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32).round() as u8;
        gray.put_pixel(x, y, Luma([luma]));
    }
    gray
}

/// Variance of the 8-neighbour Laplacian over the image interior.
pub fn laplacian_variance(img: &GrayImage) -> f64 {
    let (w, h) = (img.width(), img.height());
    if w < 3 || h < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| img.get_pixel(x, y).0[0] as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut neighbours = 0.0;
            for (dx, dy) in [(-1i32, -1i32), (0, -1), (1, -1), (-1, 0), (1, 0), (-1, 1), (0, 1), (1, 1)] {
                neighbours += px((x as i32 + dx) as u32, (y as i32 + dy) as u32);
            }
            let laplacian = 8.0 * px(x, y) - neighbours;
            sum += laplacian;
            sum_sq += laplacian * laplacian;
            count += 1;
        }
    }

    let mean = sum / count as f64;
    ((sum_sq / count as f64) - mean * mean).max(0.0)
}

/// Mean and standard deviation of luminance.
pub fn luminance_stats(img: &GrayImage) -> (f64, f64) {
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;

    for pixel in img.pixels() {
        let val = pixel.0[0] as f64;
        sum += val;
        sum_sq += val * val;
        count += 1;
    }

    if count == 0 {
        return (0.0, 0.0);
    }

    let mean = sum / count as f64;
    let variance = (sum_sq / count as f64) - mean * mean;
    (mean, variance.max(0.0).sqrt())
}

/// Fraction of pixels whose forward horizontal or vertical step exceeds
/// `GRADIENT_THRESHOLD`.
pub fn edge_fraction(img: &GrayImage) -> f64 {
    let (w, h) = (img.width(), img.height());
    if w == 0 || h == 0 {
        return 0.0;
    }

    let mut edges = 0u64;
    for y in 0..h {
        for x in 0..w {
            let here = img.get_pixel(x, y).0[0] as i16;
            let dx = if x + 1 < w {
                (img.get_pixel(x + 1, y).0[0] as i16 - here).abs()
            } else {
                0
            };
            let dy = if y + 1 < h {
                (img.get_pixel(x, y + 1).0[0] as i16 - here).abs()
            } else {
                0
            };
            if dx > GRADIENT_THRESHOLD || dy > GRADIENT_THRESHOLD {
                edges += 1;
            }
        }
    }
    edges as f64 / (w as u64 * h as u64) as f64
}

/// Downscale so the long edge is at most `max_dim`. Borrows when no resize is needed.
fn pre_downscale(img: &RgbImage, max_dim: u32) -> Cow<'_, RgbImage> {
    let (w, h) = (img.width(), img.height());
    let largest = w.max(h);

    if largest <= max_dim {
        return Cow::Borrowed(img);
    }

    let scale = max_dim as f32 / largest as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);

    debug!(
        from = format!("{w}x{h}"),
        to = format!("{new_w}x{new_h}"),
        "Downscaling image for analysis"
    );

    Cow::Owned(image::imageops::resize(img, new_w, new_h, FilterType::Triangle))
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
