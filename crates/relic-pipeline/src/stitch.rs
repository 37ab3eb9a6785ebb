//! Shard reassembly.
//!
//! Both modes start from a copy of the source raster, so pixels no shard
//! covers keep their original value.

use std::fmt;

use image::{Rgba, imageops};
use serde::{Deserialize, Serialize};

use crate::grayscale::clamp_u8;
use crate::shard::{CroppedShard, NEIGHBOR_TOLERANCE};
use crate::types::{Rect, RgbaImage};

/// How shards are written back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StitchMode {
    /// Draw shards at their bounds; later shards overwrite.
    Direct,
    /// Feather seams where shards overlap.
    #[default]
    Blended,
}

impl StitchMode {
    /// Lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Blended => "blended",
        }
    }
}

impl fmt::Display for StitchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reassemble with the chosen mode.
#[must_use = "returns the stitched raster"]
pub fn stitch(source: &RgbaImage, shards: &[CroppedShard], mode: StitchMode, blend_width: u32) -> RgbaImage {
    match mode {
        StitchMode::Direct => stitch_direct(source, shards),
        StitchMode::Blended => stitch_blended(source, shards, blend_width),
    }
}

/// Draw every shard at its bounds in slice order.
#[must_use = "returns the stitched raster"]
pub fn stitch_direct(source: &RgbaImage, shards: &[CroppedShard]) -> RgbaImage {
    let mut canvas = source.clone();
    for shard in shards {
        let b = shard.bounds();
        imageops::replace(&mut canvas, &shard.image, i64::from(b.x), i64::from(b.y));
    }
    canvas
}

/// Which sides of a shard are seams and get feathered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Seams {
    left: bool,
    right: bool,
    top: bool,
    bottom: bool,
}

impl Seams {
    /// A side is a seam when it is not on the raster border and another
    /// shard touches (within [`NEIGHBOR_TOLERANCE`]) or crosses it.
    fn of(b: Rect, others: impl Iterator<Item = Rect>, width: u32, height: u32) -> Self {
        let spans = |a0: u32, a1: u32, b0: u32, b1: u32| a0 < b1 && b0 < a1;
        let mut s = Self::default();
        for o in others {
            let rows = spans(b.y, b.bottom(), o.y, o.bottom());
            let cols = spans(b.x, b.right(), o.x, o.right());
            s.left |= rows && b.x > 0 && o.x < b.x && o.right() + NEIGHBOR_TOLERANCE >= b.x;
            s.right |= rows
                && b.right() < width
                && o.right() > b.right()
                && o.x <= b.right() + NEIGHBOR_TOLERANCE;
            s.top |= cols && b.y > 0 && o.y < b.y && o.bottom() + NEIGHBOR_TOLERANCE >= b.y;
            s.bottom |= cols
                && b.bottom() < height
                && o.bottom() > b.bottom()
                && o.y <= b.bottom() + NEIGHBOR_TOLERANCE;
        }
        s
    }

    /// Weight of the shard's own pixel at local `(x, y)`: ramps linearly
    /// from `1 / (blend + 1)` at a seam edge to `1` at `blend` pixels in.
    fn weight(self, x: u32, y: u32, w: u32, h: u32, blend: u32) -> f32 {
        let mut d = blend;
        if self.left {
            d = d.min(x);
        }
        if self.right {
            d = d.min(w - 1 - x);
        }
        if self.top {
            d = d.min(y);
        }
        if self.bottom {
            d = d.min(h - 1 - y);
        }
        #[allow(clippy::cast_precision_loss)]
        let t = (d + 1) as f32 / (blend + 1) as f32;
        t.min(1.0)
    }
}

/// Stitch shards top-left to bottom-right, feathering seams.
///
/// A pixel not yet written by an earlier shard takes the shard value.
/// A pixel already written is blended between the canvas and the shard
/// by the shard's seam weight.
#[must_use = "returns the stitched raster"]
pub fn stitch_blended(source: &RgbaImage, shards: &[CroppedShard], blend_width: u32) -> RgbaImage {
    let (width, height) = source.dimensions();
    let mut canvas = source.clone();
    let mut written = vec![false; (width as usize) * (height as usize)];

    let mut order: Vec<&CroppedShard> = shards.iter().collect();
    order.sort_by_key(|s| (s.bounds().y, s.bounds().x));

    for (i, shard) in order.iter().enumerate() {
        let b = shard.bounds();
        let others = order
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i)
            .map(|(_, o)| o.bounds());
        let seams = Seams::of(b, others, width, height);
        for (lx, ly, p) in shard.image.enumerate_pixels() {
            let (gx, gy) = (b.x + lx, b.y + ly);
            if gx >= width || gy >= height {
                continue;
            }
            let idx = (gy as usize) * (width as usize) + gx as usize;
            if written[idx] {
                let t = seams.weight(lx, ly, b.width, b.height, blend_width);
                let under = canvas.get_pixel(gx, gy).0;
                let mix = |c: usize| clamp_u8((f32::from(p.0[c]) - f32::from(under[c])).mul_add(t, f32::from(under[c])));
                canvas.put_pixel(gx, gy, Rgba([mix(0), mix(1), mix(2), mix(3)]));
            } else {
                canvas.put_pixel(gx, gy, *p);
                written[idx] = true;
            }
        }
    }
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::types::ShardId;

    fn gradient(w: u32, h: u32) -> RgbaImage {
        #[allow(clippy::cast_possible_truncation)]
        RgbaImage::from_fn(w, h, |x, y| Rgba([(x * 3) as u8, (y * 5) as u8, 77, 255]))
    }

    fn tiles(source: &RgbaImage, rects: &[Rect]) -> Vec<CroppedShard> {
        rects
            .iter()
            .enumerate()
            .map(|(i, &r)| CroppedShard::from_source(ShardId(i as u32), source, r))
            .collect()
    }

    fn exact_tiles() -> Vec<Rect> {
        vec![
            Rect::new(0, 0, 30, 20),
            Rect::new(30, 0, 20, 20),
            Rect::new(0, 20, 30, 20),
            Rect::new(30, 20, 20, 20),
        ]
    }

    #[test]
    fn direct_stitch_of_exact_tiles_reproduces_source() {
        let source = gradient(50, 40);
        let shards = tiles(&source, &exact_tiles());
        assert_eq!(stitch_direct(&source, &shards), source);
    }

    #[test]
    fn blended_stitch_of_exact_tiles_reproduces_source() {
        let source = gradient(50, 40);
        let shards = tiles(&source, &exact_tiles());
        assert_eq!(stitch_blended(&source, &shards, 8), source);
    }

    #[test]
    fn uncovered_pixels_keep_source_values() {
        let source = gradient(50, 40);
        let mut shards = tiles(&source, &[Rect::new(10, 10, 10, 10)]);
        for p in shards[0].image.pixels_mut() {
            *p = Rgba([255, 0, 0, 255]);
        }
        for mode in [StitchMode::Direct, StitchMode::Blended] {
            let out = stitch(&source, &shards, mode, 4);
            assert_eq!(out.get_pixel(0, 0), source.get_pixel(0, 0));
            assert_eq!(out.get_pixel(49, 39), source.get_pixel(49, 39));
            assert_eq!(out.get_pixel(15, 15), &Rgba([255, 0, 0, 255]));
        }
    }

    #[test]
    fn later_shards_overwrite_in_direct_mode() {
        let source = RgbaImage::from_pixel(20, 10, Rgba([0, 0, 0, 255]));
        let mut shards = tiles(&source, &[Rect::new(0, 0, 12, 10), Rect::new(8, 0, 12, 10)]);
        for p in shards[0].image.pixels_mut() {
            *p = Rgba([100, 100, 100, 255]);
        }
        for p in shards[1].image.pixels_mut() {
            *p = Rgba([200, 200, 200, 255]);
        }
        let out = stitch_direct(&source, &shards);
        assert_eq!(out.get_pixel(9, 5).0[0], 200);
        assert_eq!(out.get_pixel(2, 5).0[0], 100);
    }

    #[test]
    fn overlap_is_feathered_in_blended_mode() {
        let source = RgbaImage::from_pixel(20, 10, Rgba([0, 0, 0, 255]));
        let mut shards = tiles(&source, &[Rect::new(0, 0, 12, 10), Rect::new(8, 0, 12, 10)]);
        for p in shards[0].image.pixels_mut() {
            *p = Rgba([100, 100, 100, 255]);
        }
        for p in shards[1].image.pixels_mut() {
            *p = Rgba([200, 200, 200, 255]);
        }
        let out = stitch_blended(&source, &shards, 4);
        // Second shard's left seam at x = 8: weight 1/5.
        assert_eq!(out.get_pixel(8, 5).0[0], 120);
        // x = 11 is 3 px in: weight 4/5.
        assert_eq!(out.get_pixel(11, 5).0[0], 180);
        // Outside the overlap each shard is kept as is.
        assert_eq!(out.get_pixel(7, 5).0[0], 100);
        assert_eq!(out.get_pixel(12, 5).0[0], 200);
    }

    #[test]
    fn border_sides_are_not_seams() {
        let s = Seams::of(Rect::new(0, 0, 10, 10), std::iter::empty(), 10, 10);
        assert_eq!(s, Seams::default());
        assert!((s.weight(0, 0, 10, 10, 4) - 1.0).abs() < f32::EPSILON);
    }
}
