//! Region generation ("smart crop").
//!
//! This module defines the [`RegionStrategy`] trait for pluggable
//! segmentation strategies and the [`SegmentStrategyKind`] enum for
//! runtime selection. [`plan_regions`] applies the chosen strategy and
//! the shared post-processing: size filtering and the whole-raster
//! fallback. [`segment`] runs the whole stage.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::SegmentationConfig;
use crate::damage::{DamageRegion, Severity};
use crate::detect::Detection;
use crate::objects::{DetectedObject, ObjectType};
use crate::shard::{CroppedShard, extract_shards};
use crate::types::{Rect, RgbaImage, Size, merge_overlapping};

/// Objects at or above this priority are salient.
pub const SALIENT_PRIORITY: u8 = 5;

/// Damage share, in percent, above which adaptive segmentation seeds
/// from damage.
pub const ADAPTIVE_DAMAGE_SEED_PCT: f64 = 20.0;

/// Selects which region generation strategy to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SegmentStrategyKind {
    /// Padded, merged boxes around salient objects.
    ContentAware,
    /// Padded boxes around medium and high severity damage.
    DamageAware,
    /// Uniform tiling.
    Grid,
    /// Damage seed, salient objects, then grid top-up.
    #[default]
    Adaptive,
    /// Faces with extra padding, then other salient objects.
    FacePriority,
}

impl SegmentStrategyKind {
    /// All strategies.
    pub const ALL: [Self; 5] = [
        Self::ContentAware,
        Self::DamageAware,
        Self::Grid,
        Self::Adaptive,
        Self::FacePriority,
    ];

    /// Kebab-case name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ContentAware => "content-aware",
            Self::DamageAware => "damage-aware",
            Self::Grid => "grid",
            Self::Adaptive => "adaptive",
            Self::FacePriority => "face-priority",
        }
    }
}

impl fmt::Display for SegmentStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for SegmentStrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("unknown segmentation strategy: {s}"))
    }
}

/// What a strategy sees.
#[derive(Debug, Clone, Copy)]
pub struct SegmentInput<'a> {
    /// Raster extent.
    pub size: Size,
    /// Detected objects.
    pub objects: &'a [DetectedObject],
    /// Detected damage.
    pub damages: &'a [DamageRegion],
    /// Damaged share of the raster in percent.
    pub damage_percentage: f64,
    /// Segmentation options.
    pub config: &'a SegmentationConfig,
}

/// Trait for region generation strategies.
///
/// Output rectangles lie within `input.size`. They may be empty of
/// content or smaller than the minimum shard size; [`plan_regions`]
/// filters them.
pub trait RegionStrategy {
    /// Propose regions for the raster.
    fn regions(&self, input: &SegmentInput<'_>) -> Vec<Rect>;
}

impl RegionStrategy for SegmentStrategyKind {
    fn regions(&self, input: &SegmentInput<'_>) -> Vec<Rect> {
        match *self {
            Self::ContentAware => content_aware(input),
            Self::DamageAware => damage_aware(input),
            Self::Grid => grid(
                input.size,
                input.config.max_shards,
                input.config.min_shard_size,
                input.config.preserve_aspect_ratio,
            ),
            Self::Adaptive => adaptive(input),
            Self::FacePriority => face_priority(input),
        }
    }
}

/// Run `strategy` and post-process its output.
///
/// Regions narrower or shorter than `min_shard_size` are dropped, except
/// under the grid strategy, whose tiles fall below the minimum only when
/// the raster itself does. If nothing remains, a single region covering
/// the raster is returned.
#[must_use]
#[tracing::instrument(skip(input), fields(width = input.size.width, height = input.size.height))]
pub fn plan_regions(strategy: SegmentStrategyKind, input: &SegmentInput<'_>) -> Vec<Rect> {
    let min = input.config.min_shard_size;
    let mut regions = strategy.regions(input);
    let proposed = regions.len();
    if strategy != SegmentStrategyKind::Grid {
        regions.retain(|r| r.width >= min && r.height >= min);
    }
    if regions.is_empty() {
        tracing::debug!(proposed, "no usable regions, covering the whole raster");
        return vec![Rect::full(input.size)];
    }
    tracing::debug!(proposed, kept = regions.len(), "regions planned");
    regions
}

/// Padded, merged boxes of objects with priority ≥ [`SALIENT_PRIORITY`].
#[must_use]
pub fn content_aware(input: &SegmentInput<'_>) -> Vec<Rect> {
    let padded: Vec<Rect> = input
        .objects
        .iter()
        .filter(|o| o.priority >= SALIENT_PRIORITY)
        .map(|o| o.bounds.expand(input.config.padding, input.size))
        .collect();
    merge_overlapping(&padded)
}

/// High severity damage padded by twice the padding and kept separate,
/// followed by medium severity damage padded once and merged. Low
/// severity damage is ignored.
#[must_use]
pub fn damage_aware(input: &SegmentInput<'_>) -> Vec<Rect> {
    let p = input.config.padding;
    let mut out: Vec<Rect> = input
        .damages
        .iter()
        .filter(|d| d.severity == Severity::High)
        .map(|d| d.bounds.expand(p.saturating_mul(2), input.size))
        .collect();
    let medium: Vec<Rect> = input
        .damages
        .iter()
        .filter(|d| d.severity == Severity::Medium)
        .map(|d| d.bounds.expand(p, input.size))
        .collect();
    out.extend(merge_overlapping(&medium));
    out
}

/// Grid dimensions `(cols, rows)` for a raster.
///
/// The column count follows the aspect ratio when `preserve_aspect` is
/// set (`round(√(max · w/h))`), otherwise it is `⌊√max⌋`. Rows fill the
/// remaining budget. Both are then reduced so tiles are at least
/// `min_size` wide and tall.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn grid_dimensions(size: Size, max_shards: usize, min_size: u32, preserve_aspect: bool) -> (u32, u32) {
    let max = max_shards.max(1) as f64;
    let cols = if preserve_aspect && !size.is_empty() {
        (max * size.aspect_ratio()).sqrt().round()
    } else {
        max.sqrt().floor()
    }
    .clamp(1.0, max) as u32;
    let rows = ((max as u32) / cols).max(1);
    let min = min_size.max(1);
    let cols = cols.min((size.width / min).max(1));
    let rows = rows.min((size.height / min).max(1));
    (cols, rows)
}

/// Uniform tiling covering the raster exactly.
///
/// Tiles are `⌊w / cols⌋ × ⌊h / rows⌋`; the final row and column absorb
/// the remainder, so no tile is smaller than `min_size` unless the
/// raster is.
#[must_use]
pub fn grid(size: Size, max_shards: usize, min_size: u32, preserve_aspect: bool) -> Vec<Rect> {
    if size.is_empty() {
        return Vec::new();
    }
    let (cols, rows) = grid_dimensions(size, max_shards, min_size, preserve_aspect);
    let tile_w = size.width / cols;
    let tile_h = size.height / rows;
    let span = |i: u32, count: u32, tile: u32, total: u32| {
        let start = i * tile;
        let len = if i + 1 == count { total - start } else { tile };
        (start, len)
    };
    let mut out = Vec::with_capacity((cols * rows) as usize);
    for row in 0..rows {
        let (y, height) = span(row, rows, tile_h, size.height);
        for col in 0..cols {
            let (x, width) = span(col, cols, tile_w, size.width);
            out.push(Rect::new(x, y, width, height));
        }
    }
    out
}

/// Damage seed (when damage exceeds [`ADAPTIVE_DAMAGE_SEED_PCT`]), then
/// salient objects, then grid tiles overlapping no existing region by
/// more than half while fewer than half the shard budget is used. The
/// result is merged and capped at `max_shards`.
#[must_use]
pub fn adaptive(input: &SegmentInput<'_>) -> Vec<Rect> {
    let max = input.config.max_shards;
    let mut regions = if input.damage_percentage > ADAPTIVE_DAMAGE_SEED_PCT {
        damage_aware(input)
    } else {
        Vec::new()
    };
    regions.extend(content_aware(input));

    if regions.len() * 2 < max {
        let tiles = grid(
            input.size,
            max,
            input.config.min_shard_size,
            input.config.preserve_aspect_ratio,
        );
        for tile in tiles {
            let covered = regions
                .iter()
                .any(|r| tile.overlap_area(r) * 2 > tile.area());
            if !covered {
                regions.push(tile);
            }
        }
    }

    let mut merged = merge_overlapping(&regions);
    merged.truncate(max);
    merged
}

/// Faces padded by three times the padding, other salient objects by
/// the padding, then merged.
#[must_use]
pub fn face_priority(input: &SegmentInput<'_>) -> Vec<Rect> {
    let p = input.config.padding;
    let faces = input
        .objects
        .iter()
        .filter(|o| o.object_type == ObjectType::Face)
        .map(|o| o.bounds.expand(p.saturating_mul(3), input.size));
    let others = input
        .objects
        .iter()
        .filter(|o| o.object_type != ObjectType::Face && o.priority >= SALIENT_PRIORITY)
        .map(|o| o.bounds.expand(p, input.size));
    let padded: Vec<Rect> = faces.chain(others).collect();
    merge_overlapping(&padded)
}

/// Output of stage 3.
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Planned regions, in region (id) order.
    pub regions: Vec<Rect>,
    /// Shards sorted by priority, highest first.
    pub shards: Vec<CroppedShard>,
    /// Number of adjacent shard pairs.
    pub neighbor_pairs: usize,
}

/// Run stage 3: plan regions with the configured strategy and cut them
/// into shards.
#[tracing::instrument(skip_all, fields(strategy = %config.strategy))]
pub fn segment(
    source: &RgbaImage,
    detection: &Detection,
    config: &SegmentationConfig,
    progress: &mut dyn FnMut(f64, &str),
) -> Segmentation {
    progress(0.0, "planning regions");
    let input = SegmentInput {
        size: Size::new(source.width(), source.height()),
        objects: &detection.objects,
        damages: &detection.damages,
        damage_percentage: detection.stats.damage_percentage,
        config,
    };
    let regions = plan_regions(config.strategy, &input);

    progress(50.0, "extracting shards");
    let shards = extract_shards(source, &regions, &detection.objects, &detection.damages);
    let neighbor_pairs = shards
        .iter()
        .map(|s| s.context().neighbor_ids.len())
        .sum::<usize>()
        / 2;
    tracing::info!(shards = shards.len(), neighbor_pairs, "segmentation complete");
    progress(100.0, "segmentation complete");
    Segmentation {
        regions,
        shards,
        neighbor_pairs,
    }
}
