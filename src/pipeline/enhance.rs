//! Conditional image enhancement ahead of extraction.
//!
//! Each stage is gated by one metric, so a clean receipt passes through with
//! at most a resize (never enhance what is already legible). Filters run on
//! luminance in a fixed order:
//!
//! 1. rescale toward receipt width (bounded)
//! 2. 3x3 median denoise      (sharpness < 30)
//! 3. brightness gain to 50   (brightness < 30 or > 70)
//! 4. sharpen                 (sharpness < 50)
//! 5. adaptive binarization   (contrast < 40)
//!
//! Denoise precedes sharpening so the kernel does not amplify speckle;
//! binarization is last because it discards the grey levels the others need.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, ImageFormat, Luma};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::analysis::{rgb_to_gray, QualityMetrics};
use super::ReceiptError;

/// ~300 DPI across an 80 mm till roll.
pub const TARGET_WIDTH: u32 = 1000;
pub const MAX_OUTPUT_WIDTH: u32 = 2000;
pub const MAX_OUTPUT_HEIGHT: u32 = 2500;
const BINARIZATION_BLOCK: u32 = 16;
/// Pixels darker than this fraction of their block mean become ink.
const BINARIZATION_RATIO: f64 = 0.9;
const TARGET_BRIGHTNESS: f64 = 50.0;

pub mod gates {
    pub const DENOISE_SHARPNESS_BELOW: f64 = 30.0;
    pub const SHARPEN_SHARPNESS_BELOW: f64 = 50.0;
    pub const DARK_BRIGHTNESS_BELOW: f64 = 30.0;
    pub const BRIGHT_BRIGHTNESS_ABOVE: f64 = 70.0;
    pub const BINARIZE_CONTRAST_BELOW: f64 = 40.0;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum EnhancementStep {
    Rescaled { from: (u32, u32), to: (u32, u32) },
    NoiseReduction,
    BrightnessNormalization { gain: f64 },
    Sharpening,
    AdaptiveBinarization,
}

/// PNG ready for a provider, plus what was done to it.
#[derive(Debug, Clone)]
pub struct EnhancedImage {
    pub png_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub steps: Vec<EnhancementStep>,
}

pub trait ImageEnhancer: Send + Sync {
    fn enhance(&self, image: &DynamicImage, metrics: &QualityMetrics) -> Result<EnhancedImage, ReceiptError>;
}

/// Metric-gated enhancer.
pub struct ConditionalEnhancer {
    target_width: u32,
    max_width: u32,
    max_height: u32,
}

impl Default for ConditionalEnhancer {
    fn default() -> Self {
        Self {
            target_width: TARGET_WIDTH,
            max_width: MAX_OUTPUT_WIDTH,
            max_height: MAX_OUTPUT_HEIGHT,
        }
    }
}

impl ImageEnhancer for ConditionalEnhancer {
    fn enhance(&self, image: &DynamicImage, metrics: &QualityMetrics) -> Result<EnhancedImage, ReceiptError> {
        let mut steps = Vec::new();

        let (w, h) = image.dimensions();
        let (new_w, new_h) = compute_output_dimensions(w, h, self.target_width, self.max_width, self.max_height);
        let resized = if (new_w, new_h) != (w, h) {
            steps.push(EnhancementStep::Rescaled {
                from: (w, h),
                to: (new_w, new_h),
            });
            image.resize_exact(new_w, new_h, FilterType::CatmullRom)
        } else {
            image.clone()
        };

        let denoise = metrics.sharpness < gates::DENOISE_SHARPNESS_BELOW;
        let relight = metrics.brightness < gates::DARK_BRIGHTNESS_BELOW
            || metrics.brightness > gates::BRIGHT_BRIGHTNESS_ABOVE;
        let sharpen = metrics.sharpness < gates::SHARPEN_SHARPNESS_BELOW;
        let binarize = metrics.contrast < gates::BINARIZE_CONTRAST_BELOW;

        let output = if denoise || relight || sharpen || binarize {
            let mut gray = rgb_to_gray(&resized.to_rgb8());
            if denoise {
                gray = median_filter(&gray);
                steps.push(EnhancementStep::NoiseReduction);
            }
            if relight {
                let gain = brightness_gain(metrics.brightness);
                gray = apply_gain(&gray, gain);
                steps.push(EnhancementStep::BrightnessNormalization { gain });
            }
            if sharpen {
                gray = sharpen_filter(&gray);
                steps.push(EnhancementStep::Sharpening);
            }
            if binarize {
                gray = adaptive_binarize(&gray, BINARIZATION_BLOCK);
                steps.push(EnhancementStep::AdaptiveBinarization);
            }
            DynamicImage::ImageLuma8(gray)
        } else {
            resized
        };

        let png_bytes = encode_png(&output)?;
        debug!(steps = steps.len(), width = new_w, height = new_h, bytes = png_bytes.len(), "Image enhanced");

        Ok(EnhancedImage {
            png_bytes,
            width: new_w,
            height: new_h,
            steps,
        })
    }
}

/// Scale width toward `target_width` (up or down), then shrink further if
/// either edge would exceed its bound. Aspect ratio is preserved.
pub fn compute_output_dimensions(width: u32, height: u32, target_width: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (1, 1);
    }

    let scale = (target_width as f64 / width as f64)
        .min(max_width as f64 / width as f64)
        .min(max_height as f64 / height as f64);

    let new_w = ((width as f64 * scale).round() as u32).clamp(1, max_width);
    let new_h = ((height as f64 * scale).round() as u32).clamp(1, max_height);
    (new_w, new_h)
}

/// Linear gain that brings mean brightness to mid-grey, limited to 0.25..4.
pub fn brightness_gain(brightness: f64) -> f64 {
    (TARGET_BRIGHTNESS / brightness.max(1.0)).clamp(0.25, 4.0)
}

fn clamped(img: &GrayImage, x: i64, y: i64) -> u8 {
    let cx = x.clamp(0, img.width() as i64 - 1) as u32;
    let cy = y.clamp(0, img.height() as i64 - 1) as u32;
    img.get_pixel(cx, cy).0[0]
}

/// 3x3 median with edge replication.
pub fn median_filter(img: &GrayImage) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let mut window = [0u8; 9];
        let mut i = 0;
        for dy in -1..=1 {
            for dx in -1..=1 {
                window[i] = clamped(img, x as i64 + dx, y as i64 + dy);
                i += 1;
            }
        }
        window.sort_unstable();
        Luma([window[4]])
    })
}

fn apply_gain(img: &GrayImage, gain: f64) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let v = img.get_pixel(x, y).0[0] as f64 * gain;
        Luma([v.round().clamp(0.0, 255.0) as u8])
    })
}

/// Convolve with `[0,-1,0; -1,5,-1; 0,-1,0]`.
pub fn sharpen_filter(img: &GrayImage) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let (x, y) = (x as i64, y as i64);
        let v = 5 * clamped(img, x, y) as i32
            - clamped(img, x - 1, y) as i32
            - clamped(img, x + 1, y) as i32
            - clamped(img, x, y - 1) as i32
            - clamped(img, x, y + 1) as i32;
        Luma([v.clamp(0, 255) as u8])
    })
}

/// Local-mean thresholding on `block`-sized tiles. Output is pure black/white.
pub fn adaptive_binarize(img: &GrayImage, block: u32) -> GrayImage {
    let (w, h) = (img.width(), img.height());
    let mut out = GrayImage::new(w, h);
    let block = block.max(1);

    for by in (0..h).step_by(block as usize) {
        for bx in (0..w).step_by(block as usize) {
            let x_end = (bx + block).min(w);
            let y_end = (by + block).min(h);

            let mut sum = 0u64;
            for y in by..y_end {
                for x in bx..x_end {
                    sum += img.get_pixel(x, y).0[0] as u64;
                }
            }
            let count = ((x_end - bx) * (y_end - by)) as f64;
            let threshold = sum as f64 / count * BINARIZATION_RATIO;

            for y in by..y_end {
                for x in bx..x_end {
                    let ink = (img.get_pixel(x, y).0[0] as f64) < threshold;
                    out.put_pixel(x, y, Luma([if ink { 0 } else { 255 }]));
                }
            }
        }
    }
    out
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, ReceiptError> {
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, ImageFormat::Png)
        .map_err(|e| ReceiptError::Enhancement(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}
