//! Per-shard enhancement filters.
//!
//! Each filter takes an RGBA image and returns a new one; alpha is
//! carried over untouched. [`enhance`] runs the enabled filters in a
//! fixed order (edge-preserving denoise, denoise, sharpen, local
//! contrast, contrast, color correction) and reports which ones were
//! applied.

use std::fmt;

use image::{Rgb, Rgb32FImage, Rgba};
use imageproc::filter::bilateral::{GaussianEuclideanColorDistance, bilateral_filter};
use serde::{Deserialize, Serialize};

use crate::blur::gaussian_blur_rgb;
use crate::config::RestorationConfig;
use crate::grayscale::{clamp_u8, luminance};
use crate::types::RgbaImage;

/// Gaussian sigma for denoise strength up to 2.
const DENOISE_SIGMA_LIGHT: f32 = 0.8;
/// Gaussian sigma for denoise strength above 2.
const DENOISE_SIGMA_HEAVY: f32 = 1.2;
/// Gaussian sigma of the unsharp-mask blur.
const SHARPEN_SIGMA: f32 = 1.0;

const BILATERAL_RADIUS: u8 = 3;
const BILATERAL_SPATIAL_SIGMA: f32 = 3.0;
const BILATERAL_RANGE_SIGMA: f32 = 50.0;

/// CLAHE tiles per axis, before the minimum tile size applies.
const CLAHE_TILES: u32 = 8;
/// Smallest CLAHE tile edge, in pixels.
const CLAHE_MIN_TILE: u32 = 16;

/// A named enhancement step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Enhancement {
    /// Bilateral edge-preserving denoise.
    EdgePreservingDenoise,
    /// Gaussian denoise.
    Denoise,
    /// Unsharp mask.
    Sharpen,
    /// Contrast-limited adaptive histogram equalization.
    LocalContrast,
    /// Histogram-equalization contrast boost.
    Contrast,
    /// Gray-world color-cast correction.
    ColorCorrection,
}

impl Enhancement {
    /// Stable name used in reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::EdgePreservingDenoise => "edge-preserving-denoise",
            Self::Denoise => "denoise",
            Self::Sharpen => "sharpen",
            Self::LocalContrast => "local-contrast",
            Self::Contrast => "contrast",
            Self::ColorCorrection => "color-correction",
        }
    }
}

impl fmt::Display for Enhancement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Run every enabled filter in order.
///
/// A step runs only when its setting is active: the two boolean
/// switches for bilateral denoise and CLAHE, denoise strength > 0,
/// sharpen amount > 0, contrast boost > 1, color correction flag set.
#[must_use]
pub fn enhance(image: &RgbaImage, config: &RestorationConfig) -> (RgbaImage, Vec<Enhancement>) {
    let mut out = image.clone();
    let mut applied = Vec::new();
    if config.edge_preserving_denoise {
        out = bilateral_denoise(&out);
        applied.push(Enhancement::EdgePreservingDenoise);
    }
    if config.denoise_strength > 0.0 {
        out = denoise(&out, config.denoise_strength);
        applied.push(Enhancement::Denoise);
    }
    if config.sharpen_amount > 0.0 {
        out = sharpen(&out, config.sharpen_amount);
        applied.push(Enhancement::Sharpen);
    }
    if config.local_contrast {
        out = local_contrast(&out, config.clahe_clip_limit);
        applied.push(Enhancement::LocalContrast);
    }
    if config.contrast_boost > 1.0 {
        out = boost_contrast(&out, config.contrast_boost);
        applied.push(Enhancement::Contrast);
    }
    if config.color_correction {
        out = correct_color_cast(&out);
        applied.push(Enhancement::ColorCorrection);
    }
    (out, applied)
}

/// Blend each RGB channel of `a` toward `b` by `t` (`0` keeps `a`).
fn blend(a: &RgbaImage, b: &RgbaImage, t: f32) -> RgbaImage {
    RgbaImage::from_fn(a.width(), a.height(), |x, y| {
        let pa = a.get_pixel(x, y).0;
        let pb = b.get_pixel(x, y).0;
        let mix = |c: usize| clamp_u8((f32::from(pb[c]) - f32::from(pa[c])).mul_add(t, f32::from(pa[c])));
        Rgba([mix(0), mix(1), mix(2), pa[3]])
    })
}

/// Gaussian denoise.
///
/// Strength up to 2 blurs with sigma 0.8, above that with sigma 1.2.
/// The blurred result is blended in by `min(1, strength / 3)`.
#[must_use = "returns the denoised image"]
pub fn denoise(image: &RgbaImage, strength: f32) -> RgbaImage {
    if strength <= 0.0 {
        return image.clone();
    }
    let sigma = if strength <= 2.0 {
        DENOISE_SIGMA_LIGHT
    } else {
        DENOISE_SIGMA_HEAVY
    };
    let blurred = gaussian_blur_rgb(image, sigma);
    blend(image, &blurred, (strength / 3.0).min(1.0))
}

/// Unsharp mask: `out = in + amount * (in - gaussian(in))`.
#[must_use = "returns the sharpened image"]
pub fn sharpen(image: &RgbaImage, amount: f32) -> RgbaImage {
    if amount <= 0.0 {
        return image.clone();
    }
    let blurred = gaussian_blur_rgb(image, SHARPEN_SIGMA);
    blend(image, &blurred, -amount)
}

/// Bilateral denoise over the RGB channels.
///
/// Wraps [`imageproc::filter::bilateral::bilateral_filter`] with a
/// 7×7 window, spatial sigma 3 and color sigma 50, so flat regions are
/// smoothed while strong edges survive.
#[must_use = "returns the denoised image"]
pub fn bilateral_denoise(image: &RgbaImage) -> RgbaImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }
    let rgb = Rgb32FImage::from_fn(w, h, |x, y| {
        let [r, g, b, _] = image.get_pixel(x, y).0;
        Rgb([f32::from(r), f32::from(g), f32::from(b)])
    });
    let filtered = bilateral_filter(
        &rgb,
        BILATERAL_RADIUS,
        BILATERAL_SPATIAL_SIGMA,
        GaussianEuclideanColorDistance::new(BILATERAL_RANGE_SIGMA),
    );
    RgbaImage::from_fn(w, h, |x, y| {
        let [r, g, b] = filtered.get_pixel(x, y).0;
        Rgba([clamp_u8(r), clamp_u8(g), clamp_u8(b), image.get_pixel(x, y).0[3]])
    })
}

fn identity_lut() -> [u8; 256] {
    let mut lut = [0u8; 256];
    #[allow(clippy::cast_possible_truncation)]
    for (i, slot) in lut.iter_mut().enumerate() {
        *slot = i as u8;
    }
    lut
}

/// Equalization table from a (possibly clipped) histogram.
///
/// Returns the identity table when the histogram holds a single tone.
fn lut_from_histogram(hist: &[f64; 256]) -> [u8; 256] {
    if hist.iter().filter(|&&c| c > 0.0).count() <= 1 {
        return identity_lut();
    }
    let mut cdf = [0.0f64; 256];
    let mut acc = 0.0;
    for (c, h) in cdf.iter_mut().zip(hist) {
        acc += h;
        *c = acc;
    }
    let cdf_min = cdf.iter().copied().find(|&c| c > 0.0).unwrap_or(0.0);
    let span = acc - cdf_min;
    if span <= 0.0 {
        return identity_lut();
    }
    let mut lut = [0u8; 256];
    for (slot, c) in lut.iter_mut().zip(cdf) {
        #[allow(clippy::cast_possible_truncation)]
        let v = ((c - cdf_min) / span * 255.0) as f32;
        *slot = clamp_u8(v);
    }
    lut
}

/// Luminance histogram of a set of pixels.
fn histogram<'a>(pixels: impl Iterator<Item = &'a Rgba<u8>>) -> [f64; 256] {
    let mut hist = [0.0f64; 256];
    for p in pixels {
        hist[usize::from(clamp_u8(luminance(p)))] += 1.0;
    }
    hist
}

/// Histogram-equalization lookup table over luminance.
///
/// Returns the identity table when the image has a single tone.
#[must_use]
pub fn equalization_lut(image: &RgbaImage) -> [u8; 256] {
    lut_from_histogram(&histogram(image.pixels()))
}

/// Clip every bin at `clip_limit` times the mean bin height and spread
/// the excess evenly over all bins.
fn clip_histogram(hist: &mut [f64; 256], clip_limit: f32) {
    let total: f64 = hist.iter().sum();
    let limit = (f64::from(clip_limit) * total / 256.0).max(1.0);
    let mut excess = 0.0;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let share = excess / 256.0;
    for bin in hist.iter_mut() {
        *bin += share;
    }
}

/// Contrast-limited adaptive histogram equalization on luminance.
///
/// The image is split into an 8×8 grid of tiles (at least 16 px on a
/// side). Each tile gets its own clipped equalization table; a pixel
/// takes the bilinear blend of the four nearest tile tables, and its
/// RGB channels are shifted by the resulting change in luminance.
/// Single-tone tiles map to themselves.
#[must_use = "returns the equalized image"]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn local_contrast(image: &RgbaImage, clip_limit: f32) -> RgbaImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }
    let tile_w = (w / CLAHE_TILES).max(CLAHE_MIN_TILE).min(w);
    let tile_h = (h / CLAHE_TILES).max(CLAHE_MIN_TILE).min(h);
    let cols = w.div_ceil(tile_w);
    let rows = h.div_ceil(tile_h);

    let mut luts = Vec::with_capacity((cols * rows) as usize);
    for ty in 0..rows {
        for tx in 0..cols {
            let (x0, y0) = (tx * tile_w, ty * tile_h);
            let (x1, y1) = ((x0 + tile_w).min(w), (y0 + tile_h).min(h));
            let tile = (y0..y1).flat_map(|y| (x0..x1).map(move |x| (x, y)));
            let mut hist = histogram(tile.map(|(x, y)| image.get_pixel(x, y)));
            if hist.iter().filter(|&&c| c > 0.0).count() <= 1 {
                luts.push(identity_lut());
                continue;
            }
            clip_histogram(&mut hist, clip_limit);
            luts.push(lut_from_histogram(&hist));
        }
    }

    // Tile-center coordinate of a pixel, clamped to the outer centers.
    let axis = |p: u32, tile: u32, count: u32| {
        let f = ((p as f32 + 0.5) / tile as f32 - 0.5).clamp(0.0, (count - 1) as f32);
        let lo = f.floor() as u32;
        (lo, (lo + 1).min(count - 1), f - lo as f32)
    };

    RgbaImage::from_fn(w, h, |x, y| {
        let p = image.get_pixel(x, y);
        let l = luminance(p);
        let bin = usize::from(clamp_u8(l));
        let (x0, x1, ax) = axis(x, tile_w, cols);
        let (y0, y1, ay) = axis(y, tile_h, rows);
        let at = |tx: u32, ty: u32| f32::from(luts[(ty * cols + tx) as usize][bin]);
        let top = (at(x1, y0) - at(x0, y0)).mul_add(ax, at(x0, y0));
        let bottom = (at(x1, y1) - at(x0, y1)).mul_add(ax, at(x0, y1));
        let target = (bottom - top).mul_add(ay, top);
        shift_luminance(p, target - l)
    })
}

/// Add `shift` to each RGB channel.
fn shift_luminance(p: &Rgba<u8>, shift: f32) -> Rgba<u8> {
    let [r, g, b, a] = p.0;
    Rgba([
        clamp_u8(f32::from(r) + shift),
        clamp_u8(f32::from(g) + shift),
        clamp_u8(f32::from(b) + shift),
        a,
    ])
}

/// Contrast boost by partial histogram equalization.
///
/// Each pixel's RGB channels are shifted by the change in luminance the
/// equalization table would make, scaled by `boost - 1` clamped to
/// `0..=1`.
#[must_use = "returns the contrast-boosted image"]
pub fn boost_contrast(image: &RgbaImage, boost: f32) -> RgbaImage {
    let t = (boost - 1.0).clamp(0.0, 1.0);
    if t == 0.0 {
        return image.clone();
    }
    let lut = equalization_lut(image);
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y);
        let l = luminance(p);
        let target = f32::from(lut[usize::from(clamp_u8(l))]);
        shift_luminance(p, (target - l) * t)
    })
}

/// Gray-world color-cast correction.
///
/// Scales each channel so its mean matches the mean of all three
/// channel means. Channels with a zero mean are left alone.
#[must_use = "returns the color-corrected image"]
pub fn correct_color_cast(image: &RgbaImage) -> RgbaImage {
    let count = image.pixels().len();
    if count == 0 {
        return image.clone();
    }
    let mut sums = [0u64; 3];
    for p in image.pixels() {
        for (s, c) in sums.iter_mut().zip(p.0) {
            *s += u64::from(c);
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let means = sums.map(|s| s as f64 / count as f64);
    let gray = means.iter().sum::<f64>() / 3.0;
    let gains = means.map(|m| if m > 0.0 { gray / m } else { 1.0 });
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b, a] = image.get_pixel(x, y).0;
        #[allow(clippy::cast_possible_truncation)]
        let scale = |c: u8, gain: f64| clamp_u8((f64::from(c) * gain) as f32);
        Rgba([scale(r, gains[0]), scale(g, gains[1]), scale(b, gains[2]), a])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(v: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(16, 16, Rgba(v))
    }

    fn noisy() -> RgbaImage {
        RgbaImage::from_fn(16, 16, |x, y| {
            let v = if (x * 7 + y * 13) % 5 == 0 { 220 } else { 100 };
            Rgba([v, v, v, 255])
        })
    }

    #[test]
    fn neutral_settings_apply_nothing() {
        let img = noisy();
        let (out, applied) = enhance(&img, &RestorationConfig::neutral());
        assert!(applied.is_empty());
        assert_eq!(out, img);
    }

    #[test]
    fn default_settings_apply_all_in_order() {
        let (_, applied) = enhance(&noisy(), &RestorationConfig::default());
        assert_eq!(
            applied,
            vec![
                Enhancement::Denoise,
                Enhancement::Sharpen,
                Enhancement::Contrast,
                Enhancement::ColorCorrection,
            ]
        );
    }

    #[test]
    fn filters_leave_uniform_gray_unchanged() {
        let img = uniform([128, 128, 128, 255]);
        assert_eq!(denoise(&img, 1.0), img);
        assert_eq!(denoise(&img, 4.0), img);
        assert_eq!(sharpen(&img, 0.5), img);
        assert_eq!(boost_contrast(&img, 1.5), img);
        assert_eq!(correct_color_cast(&img), img);
        assert_eq!(bilateral_denoise(&img), img);
        assert_eq!(local_contrast(&img, 2.0), img);
    }

    #[test]
    fn optional_steps_run_first_and_in_place() {
        let config = RestorationConfig {
            edge_preserving_denoise: true,
            local_contrast: true,
            ..RestorationConfig::default()
        };
        let (_, applied) = enhance(&noisy(), &config);
        assert_eq!(
            applied,
            vec![
                Enhancement::EdgePreservingDenoise,
                Enhancement::Denoise,
                Enhancement::Sharpen,
                Enhancement::LocalContrast,
                Enhancement::Contrast,
                Enhancement::ColorCorrection,
            ]
        );
        assert_eq!(Enhancement::LocalContrast.to_string(), "local-contrast");
    }

    #[test]
    fn bilateral_keeps_hard_edges_and_smooths_grain() {
        let edge = RgbaImage::from_fn(12, 6, |x, _| {
            let v = if x < 6 { 50 } else { 200 };
            Rgba([v, v, v, 255])
        });
        let out = bilateral_denoise(&edge);
        assert!(out.get_pixel(5, 3).0[0].abs_diff(50) <= 3, "{:?}", out.get_pixel(5, 3));
        assert!(out.get_pixel(6, 3).0[0].abs_diff(200) <= 3, "{:?}", out.get_pixel(6, 3));
        // the Gaussian path blurs the same edge far more
        assert!(denoise(&edge, 3.0).get_pixel(5, 3).0[0] > 60);

        let grain = RgbaImage::from_fn(16, 16, |x, y| {
            let v = if (x + y) % 2 == 0 { 120 } else { 136 };
            Rgba([v, v, v, 255])
        });
        let smoothed = bilateral_denoise(&grain);
        let spread = |im: &RgbaImage| {
            let vals: Vec<u8> = im.pixels().map(|p| p.0[0]).collect();
            vals.iter().max().copied().unwrap_or(0) - vals.iter().min().copied().unwrap_or(0)
        };
        assert!(spread(&smoothed) < spread(&grain) / 2);
    }

    #[test]
    fn local_contrast_stretches_each_region_separately() {
        // dark low-contrast half next to a bright low-contrast half
        let img = RgbaImage::from_fn(64, 64, |x, y| {
            let base = if x < 32 { 40 } else { 200 };
            let v = base + if (x + y) % 2 == 0 { 0 } else { 10 };
            Rgba([v, v, v, 255])
        });
        let out = local_contrast(&img, 4.0);
        let range = |x0: u32| {
            let vals: Vec<u8> = (0..16)
                .flat_map(|y| (x0..x0 + 16).map(move |x| (x, y)))
                .map(|(x, y)| out.get_pixel(x, y).0[0])
                .collect();
            vals.iter().max().copied().unwrap_or(0) - vals.iter().min().copied().unwrap_or(0)
        };
        assert!(range(0) > 10, "dark side range {}", range(0));
        assert!(range(48) > 10, "bright side range {}", range(48));
        assert_eq!(out.dimensions(), (64, 64));
        assert!(out.pixels().all(|p| p.0[3] == 255));
    }

    #[test]
    fn local_contrast_handles_images_smaller_than_a_tile() {
        let img = RgbaImage::from_fn(5, 3, |x, _| {
            let v = if x < 2 { 90 } else { 110 };
            Rgba([v, v, v, 7])
        });
        let out = local_contrast(&img, 2.0);
        assert_eq!(out.dimensions(), (5, 3));
        assert!(out.pixels().all(|p| p.0[3] == 7));
        assert!(out.get_pixel(0, 0).0[0] < out.get_pixel(4, 0).0[0]);
    }

    #[test]
    fn denoise_reduces_spread() {
        let img = noisy();
        let out = denoise(&img, 3.0);
        let range = |im: &RgbaImage| {
            let vals: Vec<u8> = im.pixels().map(|p| p.0[0]).collect();
            vals.iter().max().copied().unwrap_or(0) - vals.iter().min().copied().unwrap_or(0)
        };
        assert!(range(&out) < range(&img));
    }

    #[test]
    fn sharpen_increases_edge_step() {
        let img = RgbaImage::from_fn(10, 4, |x, _| {
            let v = if x < 5 { 80 } else { 160 };
            Rgba([v, v, v, 255])
        });
        let out = sharpen(&img, 1.0);
        assert!(out.get_pixel(4, 1).0[0] < 80);
        assert!(out.get_pixel(5, 1).0[0] > 160);
    }

    #[test]
    fn equalization_spreads_two_tones() {
        let img = RgbaImage::from_fn(4, 4, |x, _| {
            let v = if x < 2 { 100 } else { 120 };
            Rgba([v, v, v, 255])
        });
        let lut = equalization_lut(&img);
        assert_eq!(lut[100], 0);
        assert_eq!(lut[120], 255);
    }

    #[test]
    fn gray_world_removes_cast() {
        let img = uniform([200, 100, 100, 255]);
        let out = correct_color_cast(&img);
        let [r, g, b, a] = out.get_pixel(0, 0).0;
        assert_eq!(a, 255);
        assert!(r.abs_diff(g) <= 1 && g.abs_diff(b) <= 1, "got {r} {g} {b}");
    }

    #[test]
    fn alpha_is_preserved() {
        let img = RgbaImage::from_fn(8, 8, |x, _| Rgba([90, 140, 60, if x % 2 == 0 { 10 } else { 200 }]));
        let (out, _) = enhance(&img, &RestorationConfig::default());
        for (a, b) in img.pixels().zip(out.pixels()) {
            assert_eq!(a.0[3], b.0[3]);
        }
    }
}
