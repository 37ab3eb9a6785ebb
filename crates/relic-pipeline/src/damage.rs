//! Heuristic damage detection.
//!
//! Four independent detectors each produce candidate regions:
//!
//! - **stain**: brownish or yellowish pixels far from the average color
//! - **scratch**: strong, direction-coherent gradients in thin clusters
//! - **fade**: bright, flat 32×32 blocks
//! - **noise**: 8×8 blocks with mid-range variance
//!
//! Candidates below the configured confidence are dropped. Ids are
//! assigned in detector order after filtering.

use std::fmt;

use image::Luma;
use serde::{Deserialize, Serialize};

use crate::config::DetectionConfig;
use crate::edge::{Gradient, NEIGHBORS_8, directions_agree};
use crate::region::{
    Component, Connectivity, FOREGROUND, Labels, component_mask, components,
    foreground_count, scale_block_bounds,
};
use crate::types::{DamageId, GrayImage, Rect, RgbaImage, Size};

/// Kind of physical or digital damage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DamageType {
    /// Discoloration from liquid or age.
    Stain,
    /// Torn paper.
    Tear,
    /// Crease line.
    Fold,
    /// Washed-out region.
    Fade,
    /// Grain or sensor noise.
    Noise,
    /// Compression or scanning artifact.
    Artifact,
    /// Thin linear mark.
    Scratch,
}

impl DamageType {
    /// Lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stain => "stain",
            Self::Tear => "tear",
            Self::Fold => "fold",
            Self::Fade => "fade",
            Self::Noise => "noise",
            Self::Artifact => "artifact",
            Self::Scratch => "scratch",
        }
    }
}

impl fmt::Display for DamageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How bad a damage region is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Cosmetic.
    Low,
    /// Noticeable.
    Medium,
    /// Obscures content.
    High,
}

impl Severity {
    /// Grade an area against `(medium_from, high_from)` thresholds.
    #[must_use]
    pub const fn from_area(area: u64, thresholds: (u64, u64)) -> Self {
        if area >= thresholds.1 {
            Self::High
        } else if area >= thresholds.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Cut-map priority: high = 3, medium = 2, low = 1.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }
}

/// A detected damage region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageRegion {
    /// Detection-order identifier.
    pub id: DamageId,
    /// What kind of damage.
    pub damage_type: DamageType,
    /// Bounding box in raster coordinates.
    pub bounds: Rect,
    /// Severity graded from the area.
    pub severity: Severity,
    /// Binary mask sized to `bounds`; non-zero marks damaged pixels.
    #[serde(with = "mask_serde")]
    pub mask: GrayImage,
    /// Number of damaged pixels.
    pub area: u64,
    /// Detector confidence in `0.0..=1.0`.
    pub confidence: f32,
}

/// Serde support for masks as `(width, height, raw_bytes)`.
mod mask_serde {
    use image::GrayImage;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(mask: &GrayImage, serializer: S) -> Result<S::Ok, S::Error> {
        (mask.width(), mask.height(), mask.as_raw()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<GrayImage, D::Error> {
        let (w, h, raw) = <(u32, u32, Vec<u8>)>::deserialize(deserializer)?;
        GrayImage::from_raw(w, h, raw)
            .ok_or_else(|| serde::de::Error::custom("invalid mask dimensions"))
    }
}

/// Stain: color distance from the average above which a pixel deviates.
pub const STAIN_DEVIATION: f32 = 40.0;
/// Stain: minimum cluster area.
pub const STAIN_MIN_AREA: u64 = 50;
/// Scratch: minimum cluster area.
pub const SCRATCH_MIN_AREA: u64 = 20;
/// Scratch: minimum bounding-box elongation.
pub const SCRATCH_MIN_ELONGATION: f64 = 3.0;
/// Scratch: direction tolerance in radians.
pub const SCRATCH_ANGLE_TOLERANCE: f32 = 0.3;
/// Fade: block size.
pub const FADE_BLOCK: u32 = 32;
/// Fade: blocks with less contrast than this are flat.
pub const FADE_MAX_CONTRAST: u8 = 30;
/// Fade: flat blocks must be brighter than this.
pub const FADE_MIN_BRIGHTNESS: u8 = 200;
/// Noise: block size.
pub const NOISE_BLOCK: u32 = 8;
/// Noise: exclusive variance band.
pub const NOISE_VARIANCE: (f64, f64) = (500.0, 2000.0);

const STAIN_SEVERITY: (u64, u64) = (1000, 5000);
const SCRATCH_SEVERITY: (u64, u64) = (100, 400);
const BLOCK_SEVERITY: (u64, u64) = (10_000, 50_000);

/// A region before id assignment and confidence filtering.
struct Candidate {
    damage_type: DamageType,
    bounds: Rect,
    mask: GrayImage,
    area: u64,
    confidence: f32,
    thresholds: (u64, u64),
}

/// Run every detector and keep regions at or above
/// `config.damage_confidence_threshold`.
#[must_use]
#[tracing::instrument(skip_all, fields(width = image.width(), height = image.height()))]
pub fn detect_damage(
    image: &RgbaImage,
    gray: &GrayImage,
    gradient: &Gradient,
    config: &DetectionConfig,
) -> Vec<DamageRegion> {
    let mut candidates = detect_stains(image);
    candidates.extend(detect_scratches(gradient, config.edge_threshold));
    candidates.extend(detect_fade(gray));
    candidates.extend(detect_noise(gray));
    tracing::debug!(candidates = candidates.len(), "damage candidates");

    let mut next = 0;
    candidates
        .into_iter()
        .filter(|c| c.confidence >= config.damage_confidence_threshold)
        .map(|c| {
            let id = DamageId(next);
            next += 1;
            DamageRegion {
                id,
                damage_type: c.damage_type,
                bounds: c.bounds,
                severity: Severity::from_area(c.area, c.thresholds),
                mask: c.mask,
                area: c.area,
                confidence: c.confidence,
            }
        })
        .collect()
}

/// Pixel-level mask clusters as candidates.
fn clusters(
    mask: &GrayImage,
    min_area: u64,
    damage_type: DamageType,
    thresholds: (u64, u64),
    mut confidence: impl FnMut(&Component) -> f32,
) -> Vec<Candidate> {
    let (labels, comps) = components(mask, Connectivity::Eight, min_area);
    comps
        .iter()
        .map(|c| Candidate {
            damage_type,
            bounds: c.bounds,
            mask: component_mask(&labels, c),
            area: c.area,
            confidence: confidence(c),
            thresholds,
        })
        .collect()
}

fn is_brownish(r: u8, g: u8, b: u8) -> bool {
    r > b.saturating_add(20) && g > b.saturating_add(5)
}

fn detect_stains(image: &RgbaImage) -> Vec<Candidate> {
    let count = image.pixels().len();
    if count == 0 {
        return Vec::new();
    }
    let mut sums = [0u64; 3];
    for p in image.pixels() {
        for (s, c) in sums.iter_mut().zip(p.0) {
            *s += u64::from(c);
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let avg = sums.map(|s| s as f32 / count as f32);
    let deviation = |p: &image::Rgba<u8>| {
        let [r, g, b, _] = p.0;
        let dr = f32::from(r) - avg[0];
        let dg = f32::from(g) - avg[1];
        let db = f32::from(b) - avg[2];
        dr.mul_add(dr, dg.mul_add(dg, db * db)).sqrt()
    };

    let mask = GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y);
        let [r, g, b, _] = p.0;
        Luma([if deviation(p) > STAIN_DEVIATION && is_brownish(r, g, b) {
            FOREGROUND
        } else {
            0
        }])
    });
    let mut out = clusters(&mask, STAIN_MIN_AREA, DamageType::Stain, STAIN_SEVERITY, |_| 0.0);
    for c in &mut out {
        let (mut total, mut n) = (0.0f32, 0u32);
        for (mx, my, m) in c.mask.enumerate_pixels() {
            if m.0[0] != 0 {
                total += deviation(image.get_pixel(c.bounds.x + mx, c.bounds.y + my));
                n += 1;
            }
        }
        #[allow(clippy::cast_precision_loss)]
        let mean = total / n.max(1) as f32;
        c.confidence = (0.4 + mean / 255.0).min(0.95);
    }
    out
}

/// Whether a strong pixel's neighbors share its gradient direction.
///
/// Neighbors below half the threshold carry no usable direction and
/// are skipped. At least two directional neighbors are needed and at
/// least 75% of them must agree.
fn coherent(gradient: &Gradient, x: u32, y: u32, threshold: f32) -> bool {
    let (w, h) = gradient.magnitude.dimensions();
    let dir = gradient.direction_at(x, y);
    let (mut directional, mut agree) = (0u32, 0u32);
    for (dx, dy) in NEIGHBORS_8 {
        let (Some(nx), Some(ny)) = (x.checked_add_signed(dx), y.checked_add_signed(dy)) else {
            continue;
        };
        if nx >= w || ny >= h || gradient.magnitude_at(nx, ny) < threshold / 2.0 {
            continue;
        }
        directional += 1;
        agree += u32::from(directions_agree(
            dir,
            gradient.direction_at(nx, ny),
            SCRATCH_ANGLE_TOLERANCE,
        ));
    }
    directional >= 2 && agree * 4 >= directional * 3
}

fn detect_scratches(gradient: &Gradient, threshold: f32) -> Vec<Candidate> {
    let (w, h) = gradient.magnitude.dimensions();
    let strong = 1.5 * threshold;
    let mask = GrayImage::from_fn(w, h, |x, y| {
        Luma([
            if gradient.magnitude_at(x, y) > strong && coherent(gradient, x, y, threshold) {
                FOREGROUND
            } else {
                0
            },
        ])
    });
    clusters(&mask, SCRATCH_MIN_AREA, DamageType::Scratch, SCRATCH_SEVERITY, |c| {
        #[allow(clippy::cast_possible_truncation)]
        let e = c.bounds.elongation() as f32;
        (0.4 + e / 20.0).min(0.9)
    })
    .into_iter()
    .filter(|c| c.bounds.elongation() > SCRATCH_MIN_ELONGATION)
    .collect()
}

/// Per-block statistics over a grid of `block`-sized cells. Edge cells
/// may be partial.
fn block_grid<T>(gray: &GrayImage, block: u32, mut f: impl FnMut(&[u8]) -> T) -> (u32, u32, Vec<T>) {
    let (w, h) = gray.dimensions();
    let cols = w.div_ceil(block);
    let rows = h.div_ceil(block);
    let mut out = Vec::with_capacity((cols * rows) as usize);
    let mut buf = Vec::with_capacity((block * block) as usize);
    for by in 0..rows {
        for bx in 0..cols {
            buf.clear();
            for y in by * block..((by + 1) * block).min(h) {
                for x in bx * block..((bx + 1) * block).min(w) {
                    buf.push(gray.get_pixel(x, y).0[0]);
                }
            }
            out.push(f(&buf));
        }
    }
    (cols, rows, out)
}

/// Turn flagged grid cells into block-granularity candidates.
fn block_clusters(
    size: Size,
    block: u32,
    cols: u32,
    rows: u32,
    flagged: &[bool],
    damage_type: DamageType,
    confidence: impl Fn(&Component, &Labels) -> f32,
) -> Vec<Candidate> {
    let grid = GrayImage::from_fn(cols, rows, |x, y| {
        Luma([if flagged[(y * cols + x) as usize] {
            FOREGROUND
        } else {
            0
        }])
    });
    let (labels, comps) = components(&grid, Connectivity::Eight, 1);
    comps
        .iter()
        .map(|c| {
            let bounds = scale_block_bounds(c.bounds, block, size);
            let mask = GrayImage::from_fn(bounds.width, bounds.height, |x, y| {
                let gx = (bounds.x + x) / block;
                let gy = (bounds.y + y) / block;
                Luma([if labels.get_pixel(gx, gy).0[0] == c.label {
                    FOREGROUND
                } else {
                    0
                }])
            });
            let area = foreground_count(&mask);
            Candidate {
                damage_type,
                bounds,
                mask,
                area,
                confidence: confidence(c, &labels),
                thresholds: BLOCK_SEVERITY,
            }
        })
        .collect()
}

fn detect_fade(gray: &GrayImage) -> Vec<Candidate> {
    let (min, max) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    if gray.pixels().len() == 0 || max.saturating_sub(min) < FADE_MAX_CONTRAST {
        return Vec::new();
    }
    let (cols, rows, stats) = block_grid(gray, FADE_BLOCK, |px| {
        let lo = px.iter().copied().min().unwrap_or(0);
        let hi = px.iter().copied().max().unwrap_or(0);
        (hi - lo, hi)
    });
    let flagged: Vec<bool> = stats
        .iter()
        .map(|&(contrast, hi)| contrast < FADE_MAX_CONTRAST && hi > FADE_MIN_BRIGHTNESS)
        .collect();
    let size = Size::new(gray.width(), gray.height());
    block_clusters(size, FADE_BLOCK, cols, rows, &flagged, DamageType::Fade, |c, labels| {
        let (mut total, mut n) = (0u32, 0u32);
        for (gx, gy, l) in labels.enumerate_pixels() {
            if l.0[0] == c.label {
                total += u32::from(stats[(gy * cols + gx) as usize].0);
                n += 1;
            }
        }
        #[allow(clippy::cast_precision_loss)]
        let mean = total as f32 / n.max(1) as f32;
        0.5 + (f32::from(FADE_MAX_CONTRAST) - mean) / 60.0
    })
}

fn detect_noise(gray: &GrayImage) -> Vec<Candidate> {
    let (cols, rows, variances) = block_grid(gray, NOISE_BLOCK, |px| {
        #[allow(clippy::cast_precision_loss)]
        let n = px.len().max(1) as f64;
        let mean = px.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
        px.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / n
    });
    let flagged: Vec<bool> = variances
        .iter()
        .map(|&v| v > NOISE_VARIANCE.0 && v < NOISE_VARIANCE.1)
        .collect();
    let size = Size::new(gray.width(), gray.height());
    block_clusters(size, NOISE_BLOCK, cols, rows, &flagged, DamageType::Noise, |c, _| {
        #[allow(clippy::cast_precision_loss)]
        let blocks = c.area as f32;
        (0.5 + blocks / 100.0).min(0.8)
    })
}

/// Damaged area as a percentage of the raster, capped at 100.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn damage_percentage(regions: &[DamageRegion], size: Size) -> f64 {
    if size.is_empty() {
        return 0.0;
    }
    let damaged: u64 = regions.iter().map(|r| r.area).sum();
    (damaged as f64 / size.area() as f64 * 100.0).min(100.0)
}

/// Most frequent damage type; ties go to the type seen first.
#[must_use]
pub fn dominant_damage_type(regions: &[DamageRegion]) -> Option<DamageType> {
    let mut counts: Vec<(DamageType, usize)> = Vec::new();
    for r in regions {
        match counts.iter_mut().find(|(t, _)| *t == r.damage_type) {
            Some((_, n)) => *n += 1,
            None => counts.push((r.damage_type, 1)),
        }
    }
    counts
        .iter()
        .fold(None, |best: Option<(DamageType, usize)>, &(t, n)| match best {
            Some((_, bn)) if bn >= n => best,
            _ => Some((t, n)),
        })
        .map(|(t, _)| t)
}
