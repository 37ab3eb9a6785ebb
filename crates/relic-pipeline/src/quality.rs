//! Image quality metrics.
//!
//! All metrics are deterministic functions of the pixel buffer and lie
//! in `0.0..=100.0` (except [`snr_db`], which is in decibels).
//!
//! | Metric | Definition |
//! |---|---|
//! | sharpness | `√var(Laplacian) / 10` over interior pixels |
//! | noise | `100 − 4σ`, σ = mean std-dev of the calmest quarter of 8×8 blocks |
//! | contrast | `√var(luminance) / 1.28` |
//! | color accuracy | mean `(max − min) / max` of RGB × 200 |
//! | overall | `0.30·sharpness + 0.25·noise + 0.25·contrast + 0.20·color` |

use serde::{Deserialize, Serialize};

use crate::edge::laplacian;
use crate::grayscale::to_plane;
use crate::types::{PlaneF32, RgbaImage};

/// Side length of the blocks used for noise estimation.
pub const NOISE_BLOCK: u32 = 8;

/// SNR reported when the noise estimate is zero.
pub const MAX_SNR_DB: f64 = 100.0;

/// Quality metrics for one raster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    /// Edge crispness.
    pub sharpness: f64,
    /// Absence of noise (higher is cleaner).
    pub noise: f64,
    /// Tonal spread.
    pub contrast: f64,
    /// Saturation proxy.
    pub color_accuracy: f64,
    /// Weighted combination of the four metrics.
    pub overall: f64,
}

impl QualityScore {
    /// Score an image.
    #[must_use]
    pub fn measure(image: &RgbaImage) -> Self {
        let plane = to_plane(image);
        let sharpness = sharpness(&plane);
        let noise = noise_score(noise_sigma(&plane));
        let contrast = contrast(&plane);
        let color_accuracy = color_accuracy(image);
        let overall = 0.20f64.mul_add(
            color_accuracy,
            0.25f64.mul_add(contrast, 0.30f64.mul_add(sharpness, 0.25 * noise)),
        );
        Self {
            sharpness,
            noise,
            contrast,
            color_accuracy,
            overall,
        }
    }
}

/// Percentage change of the overall score, rounded to an integer.
///
/// Returns `0` when `before` is zero.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn improvement(before: &QualityScore, after: &QualityScore) -> i32 {
    if before.overall == 0.0 {
        return 0;
    }
    ((after.overall - before.overall) / before.overall * 100.0).round() as i32
}

/// Population mean and variance of a sequence (two-pass).
fn mean_variance(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        return (0.0, 0.0);
    }
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var)
}

/// Laplacian-variance sharpness.
#[must_use]
pub fn sharpness(plane: &PlaneF32) -> f64 {
    let (w, h) = plane.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let lap = laplacian(plane);
    let interior = (1..h - 1)
        .flat_map(|y| (1..w - 1).map(move |x| (x, y)))
        .map(|(x, y)| f64::from(lap.get_pixel(x, y).0[0]));
    let (_, var) = mean_variance(interior);
    (var.sqrt() / 10.0).clamp(0.0, 100.0)
}

/// Noise standard deviation estimate.
///
/// The plane is split into full 8×8 blocks (or one block covering the
/// whole plane when it is smaller than that). The mean standard
/// deviation of the lowest-variance quarter of blocks is returned.
#[must_use]
pub fn noise_sigma(plane: &PlaneF32) -> f64 {
    let (w, h) = plane.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }
    let block_stddev = |x0: u32, y0: u32, bw: u32, bh: u32| {
        let px = (y0..y0 + bh)
            .flat_map(|y| (x0..x0 + bw).map(move |x| (x, y)))
            .map(|(x, y)| f64::from(plane.get_pixel(x, y).0[0]));
        mean_variance(px).1.sqrt()
    };

    let mut sigmas: Vec<f64> = if w < NOISE_BLOCK || h < NOISE_BLOCK {
        vec![block_stddev(0, 0, w, h)]
    } else {
        (0..h / NOISE_BLOCK)
            .flat_map(|by| (0..w / NOISE_BLOCK).map(move |bx| (bx, by)))
            .map(|(bx, by)| {
                block_stddev(bx * NOISE_BLOCK, by * NOISE_BLOCK, NOISE_BLOCK, NOISE_BLOCK)
            })
            .collect()
    };
    sigmas.sort_by(f64::total_cmp);
    let quarter = (sigmas.len() / 4).max(1);
    #[allow(clippy::cast_precision_loss)]
    let calm = quarter as f64;
    sigmas[..quarter].iter().sum::<f64>() / calm
}

/// Map a noise sigma to a `0..=100` score.
#[must_use]
pub fn noise_score(sigma: f64) -> f64 {
    4.0f64.mul_add(-sigma, 100.0).clamp(0.0, 100.0)
}

/// Luminance-spread contrast.
#[must_use]
pub fn contrast(plane: &PlaneF32) -> f64 {
    let (_, var) = mean_variance(plane.pixels().map(|p| f64::from(p.0[0].round())));
    (var.sqrt() / 1.28).clamp(0.0, 100.0)
}

/// Mean per-pixel chroma ratio `(max − min) / max` scaled by 200.
#[must_use]
pub fn color_accuracy(image: &RgbaImage) -> f64 {
    let count = image.pixels().len();
    if count == 0 {
        return 0.0;
    }
    let total: f64 = image
        .pixels()
        .map(|p| {
            let [r, g, b, _] = p.0;
            let max = r.max(g).max(b);
            let min = r.min(g).min(b);
            if max == 0 {
                0.0
            } else {
                f64::from(max - min) / f64::from(max)
            }
        })
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let mean = total / count as f64;
    (mean * 200.0).clamp(0.0, 100.0)
}

/// Signal-to-noise ratio in decibels: `20·log10(mean luminance / σ)`.
///
/// Capped at [`MAX_SNR_DB`] when the noise estimate is zero. Returns
/// `0.0` for an all-black raster.
#[must_use]
pub fn snr_db(image: &RgbaImage) -> f64 {
    let plane = to_plane(image);
    let (mean, _) = mean_variance(plane.pixels().map(|p| f64::from(p.0[0])));
    let sigma = noise_sigma(&plane);
    if mean <= 0.0 {
        0.0
    } else if sigma <= f64::EPSILON {
        MAX_SNR_DB
    } else {
        (20.0 * (mean / sigma).log10()).min(MAX_SNR_DB)
    }
}
