//! Coarse priority grid ("cut map") over detected objects and damage.
//!
//! The raster is divided into fixed [`CELL_SIZE`] cells. Each cell holds
//! the highest priority of any object or damage region overlapping it,
//! where damage contributes its severity priority. Salient objects
//! (priority ≥ [`CUT_PRIORITY`]) additionally become [`CutRegion`]s that
//! reference the damage they overlap.

use image::Rgba;
use imageproc::drawing::draw_hollow_rect_mut;
use serde::{Deserialize, Serialize};

use crate::damage::DamageRegion;
use crate::objects::DetectedObject;
use crate::types::{DamageId, ObjectId, Rect, RgbaImage, Size};

/// Side length of a cut-map cell in pixels.
pub const CELL_SIZE: u32 = 32;

/// Objects at or above this priority become cut regions.
pub const CUT_PRIORITY: u8 = 6;

/// A salient area the segmenter should keep intact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutRegion {
    /// Bounds in raster coordinates.
    pub bounds: Rect,
    /// Highest priority of the objects in the region.
    pub priority: u8,
    /// Objects the region was built from.
    pub object_ids: Vec<ObjectId>,
    /// Damage regions overlapping the region.
    pub damage_ids: Vec<DamageId>,
}

/// Priority grid plus cut regions.
#[derive(Debug, Clone, PartialEq)]
pub struct CutMap {
    cols: u32,
    rows: u32,
    cells: Vec<u8>,
    regions: Vec<CutRegion>,
    overlay: Option<RgbaImage>,
}

impl CutMap {
    /// Build the grid and cut regions for a raster of `size`.
    ///
    /// With `merge`, overlapping cut regions are combined until none
    /// overlap.
    #[must_use]
    pub fn build(
        size: Size,
        objects: &[DetectedObject],
        damages: &[DamageRegion],
        merge: bool,
    ) -> Self {
        let cols = size.width.div_ceil(CELL_SIZE);
        let rows = size.height.div_ceil(CELL_SIZE);
        let mut cells = vec![0u8; (cols as usize) * (rows as usize)];
        let mut mark = |bounds: Rect, priority: u8| {
            if bounds.is_empty() {
                return;
            }
            let (c0, r0) = (bounds.x / CELL_SIZE, bounds.y / CELL_SIZE);
            let c1 = (bounds.right() - 1) / CELL_SIZE;
            let r1 = (bounds.bottom() - 1) / CELL_SIZE;
            for r in r0..=r1.min(rows.saturating_sub(1)) {
                for c in c0..=c1.min(cols.saturating_sub(1)) {
                    let cell = &mut cells[(r * cols + c) as usize];
                    *cell = (*cell).max(priority);
                }
            }
        };
        for o in objects {
            mark(o.bounds, o.priority);
        }
        for d in damages {
            mark(d.bounds, d.severity.priority());
        }

        let mut regions: Vec<CutRegion> = objects
            .iter()
            .filter(|o| o.priority >= CUT_PRIORITY)
            .map(|o| CutRegion {
                bounds: o.bounds,
                priority: o.priority,
                object_ids: vec![o.id],
                damage_ids: damages
                    .iter()
                    .filter(|d| d.bounds.intersects(&o.bounds))
                    .map(|d| d.id)
                    .collect(),
            })
            .collect();
        if merge {
            regions = merge_regions(regions);
        }
        tracing::debug!(cols, rows, regions = regions.len(), "cut map built");
        Self {
            cols,
            rows,
            cells,
            regions,
            overlay: None,
        }
    }

    /// Attach a debug overlay rendered on top of `source`.
    #[must_use]
    pub fn with_overlay(
        mut self,
        source: &RgbaImage,
        objects: &[DetectedObject],
        damages: &[DamageRegion],
    ) -> Self {
        self.overlay = Some(self.render_overlay(source, objects, damages));
        self
    }

    /// Grid width in cells.
    #[must_use]
    pub const fn cols(&self) -> u32 {
        self.cols
    }

    /// Grid height in cells.
    #[must_use]
    pub const fn rows(&self) -> u32 {
        self.rows
    }

    /// Priority of cell `(col, row)`, or `None` outside the grid.
    #[must_use]
    pub fn priority(&self, col: u32, row: u32) -> Option<u8> {
        (col < self.cols && row < self.rows).then(|| self.cells[(row * self.cols + col) as usize])
    }

    /// Priority of the cell containing pixel `(x, y)`.
    #[must_use]
    pub fn priority_at_pixel(&self, x: u32, y: u32) -> Option<u8> {
        self.priority(x / CELL_SIZE, y / CELL_SIZE)
    }

    /// Highest priority in the grid.
    #[must_use]
    pub fn max_priority(&self) -> u8 {
        self.cells.iter().copied().max().unwrap_or(0)
    }

    /// Cut regions.
    #[must_use]
    pub fn regions(&self) -> &[CutRegion] {
        &self.regions
    }

    /// Debug overlay, when visualization was enabled.
    #[must_use]
    pub const fn overlay(&self) -> Option<&RgbaImage> {
        self.overlay.as_ref()
    }

    fn render_overlay(
        &self,
        source: &RgbaImage,
        objects: &[DetectedObject],
        damages: &[DamageRegion],
    ) -> RgbaImage {
        let mut out = RgbaImage::from_fn(source.width(), source.height(), |x, y| {
            let p = source.get_pixel(x, y).0;
            let t = f32::from(self.priority_at_pixel(x, y).unwrap_or(0)) / 9.0 * 0.5;
            let tint = |c: u8, target: f32| crate::grayscale::clamp_u8((target - f32::from(c)).mul_add(t, f32::from(c)));
            Rgba([tint(p[0], 255.0), tint(p[1], 160.0), tint(p[2], 0.0), p[3]])
        });
        let outline = |out: &mut RgbaImage, r: Rect, color: Rgba<u8>| {
            if r.is_empty() {
                return;
            }
            #[allow(clippy::cast_possible_wrap)]
            let rect = imageproc::rect::Rect::at(r.x as i32, r.y as i32).of_size(r.width, r.height);
            draw_hollow_rect_mut(out, rect, color);
        };
        for o in objects {
            outline(&mut out, o.bounds, Rgba([0, 200, 0, 255]));
        }
        for d in damages {
            outline(&mut out, d.bounds, Rgba([220, 0, 0, 255]));
        }
        out
    }
}

/// Combine overlapping cut regions until no two overlap.
fn merge_regions(mut regions: Vec<CutRegion>) -> Vec<CutRegion> {
    loop {
        let mut merged: Vec<CutRegion> = Vec::with_capacity(regions.len());
        let mut changed = false;
        for r in regions {
            if let Some(into) = merged.iter_mut().find(|m| m.bounds.intersects(&r.bounds)) {
                into.bounds = into.bounds.union(&r.bounds);
                into.priority = into.priority.max(r.priority);
                into.object_ids.extend(r.object_ids);
                for id in r.damage_ids {
                    if !into.damage_ids.contains(&id) {
                        into.damage_ids.push(id);
                    }
                }
                changed = true;
            } else {
                merged.push(r);
            }
        }
        if !changed {
            return merged;
        }
        regions = merged;
    }
}
