//! Inpainting primitives.
//!
//! Both primitives fill the pixels selected by a binary mask. The mask
//! is sized to `bounds`, which locates it inside the image. Filling
//! proceeds from the outside in ("onion peel"): each pass fills the
//! masked pixels that touch at least one known pixel, so interior
//! pixels are filled from already-filled ones.

use std::fmt;

use image::Rgba;
use serde::{Deserialize, Serialize};

use crate::edge::NEIGHBORS_8;
use crate::error::StageError;
use crate::types::{GrayImage, Rect, RgbaImage};

/// Which inpainting primitive to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InpaintingMethod {
    /// Average of known 8-neighbors.
    NeighborAverage,
    /// Best undamaged patch by summed absolute difference.
    #[default]
    PatchBased,
}

impl InpaintingMethod {
    /// Stable name used in repair records.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NeighborAverage => "neighbor-average",
            Self::PatchBased => "patch-based",
        }
    }

    /// Run the selected primitive with default patch options.
    ///
    /// # Errors
    ///
    /// See [`inpaint_neighbor_average`] and [`inpaint_patch`].
    pub fn apply(
        self,
        image: &mut RgbaImage,
        mask: &GrayImage,
        bounds: Rect,
    ) -> Result<usize, StageError> {
        match self {
            Self::NeighborAverage => inpaint_neighbor_average(image, mask, bounds),
            Self::PatchBased => inpaint_patch(image, mask, bounds, &PatchOptions::default()),
        }
    }
}

impl fmt::Display for InpaintingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameters for [`inpaint_patch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOptions {
    /// Half-size of the compared patch (`2` gives 5×5).
    pub patch_radius: u32,
    /// Half-size of the window searched for source patches.
    pub search_radius: u32,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            patch_radius: 2,
            search_radius: 12,
        }
    }
}

/// Row-major `known` flags over the whole image.
struct KnownMap {
    width: u32,
    height: u32,
    known: Vec<bool>,
}

impl KnownMap {
    fn new(image: &RgbaImage, mask: &GrayImage, bounds: Rect) -> Result<Self, StageError> {
        if mask.dimensions() != (bounds.width, bounds.height) {
            return Err(StageError::Inpaint(format!(
                "mask is {}x{} but bounds are {bounds}",
                mask.width(),
                mask.height(),
            )));
        }
        if bounds.right() > image.width() || bounds.bottom() > image.height() {
            return Err(StageError::Inpaint(format!(
                "bounds {bounds} exceed image {}x{}",
                image.width(),
                image.height(),
            )));
        }
        let (width, height) = image.dimensions();
        let mut known = vec![true; width as usize * height as usize];
        for (mx, my, p) in mask.enumerate_pixels() {
            if p.0[0] != 0 {
                known[((bounds.y + my) * width + bounds.x + mx) as usize] = false;
            }
        }
        Ok(Self {
            width,
            height,
            known,
        })
    }

    fn is_known(&self, x: u32, y: u32) -> bool {
        self.known[(y * self.width + x) as usize]
    }

    fn set_known(&mut self, x: u32, y: u32) {
        self.known[(y * self.width + x) as usize] = true;
    }

    fn neighbor(&self, x: u32, y: u32, d: (i32, i32)) -> Option<(u32, u32)> {
        let nx = x.checked_add_signed(d.0)?;
        let ny = y.checked_add_signed(d.1)?;
        (nx < self.width && ny < self.height).then_some((nx, ny))
    }

    /// Unknown pixels inside `bounds` that touch a known pixel.
    fn frontier(&self, bounds: Rect) -> Vec<(u32, u32)> {
        (bounds.y..bounds.bottom())
            .flat_map(|y| (bounds.x..bounds.right()).map(move |x| (x, y)))
            .filter(|&(x, y)| !self.is_known(x, y))
            .filter(|&(x, y)| {
                NEIGHBORS_8
                    .iter()
                    .filter_map(|&d| self.neighbor(x, y, d))
                    .any(|(nx, ny)| self.is_known(nx, ny))
            })
            .collect()
    }
}

/// Average of the known 8-neighbors of `(x, y)`.
fn neighbor_average(image: &RgbaImage, known: &KnownMap, x: u32, y: u32) -> Option<Rgba<u8>> {
    let mut sum = [0u32; 4];
    let mut n = 0u32;
    for (nx, ny) in NEIGHBORS_8.iter().filter_map(|&d| known.neighbor(x, y, d)) {
        if known.is_known(nx, ny) {
            for (s, c) in sum.iter_mut().zip(image.get_pixel(nx, ny).0) {
                *s += u32::from(c);
            }
            n += 1;
        }
    }
    #[allow(clippy::cast_possible_truncation)]
    (n > 0).then(|| Rgba(sum.map(|s| ((s + n / 2) / n) as u8)))
}

/// Fill masked pixels with the rounded average of their known
/// 8-neighbors, peeling inward one ring per pass.
///
/// Returns the number of pixels filled. Pixels with no path to a known
/// pixel (a mask covering the whole image) are left unchanged.
///
/// # Errors
///
/// Returns [`StageError::Inpaint`] when the mask size differs from
/// `bounds` or `bounds` exceeds the image.
pub fn inpaint_neighbor_average(
    image: &mut RgbaImage,
    mask: &GrayImage,
    bounds: Rect,
) -> Result<usize, StageError> {
    let mut known = KnownMap::new(image, mask, bounds)?;
    let mut filled = 0;
    loop {
        let frontier = known.frontier(bounds);
        if frontier.is_empty() {
            return Ok(filled);
        }
        let updates: Vec<_> = frontier
            .into_iter()
            .filter_map(|(x, y)| neighbor_average(image, &known, x, y).map(|p| (x, y, p)))
            .collect();
        for (x, y, p) in updates {
            image.put_pixel(x, y, p);
            known.set_known(x, y);
            filled += 1;
        }
    }
}

/// Fill masked pixels by texture synthesis.
///
/// For each frontier pixel, every candidate centre within
/// `search_radius` whose whole patch lies inside the image and outside
/// the original mask is compared against the target patch. The
/// comparison sums absolute RGB differences over target positions that
/// are currently known. The best candidate's centre pixel is copied.
/// Pixels with no usable candidate fall back to the neighbor average.
///
/// Returns the number of pixels filled.
///
/// # Errors
///
/// Returns [`StageError::Inpaint`] when the mask size differs from
/// `bounds` or `bounds` exceeds the image.
#[allow(clippy::cast_possible_wrap)]
pub fn inpaint_patch(
    image: &mut RgbaImage,
    mask: &GrayImage,
    bounds: Rect,
    options: &PatchOptions,
) -> Result<usize, StageError> {
    let mut known = KnownMap::new(image, mask, bounds)?;
    let damaged: Vec<bool> = known.known.iter().map(|k| !k).collect();
    let (w, h) = image.dimensions();
    let pr = options.patch_radius as i32;
    let sr = options.search_radius as i32;

    let patch_is_clean = |cx: u32, cy: u32| {
        if cx < options.patch_radius
            || cy < options.patch_radius
            || cx + options.patch_radius >= w
            || cy + options.patch_radius >= h
        {
            return false;
        }
        (cy - options.patch_radius..=cy + options.patch_radius).all(|y| {
            (cx - options.patch_radius..=cx + options.patch_radius)
                .all(|x| !damaged[(y * w + x) as usize])
        })
    };

    let mut filled = 0;
    loop {
        let frontier = known.frontier(bounds);
        if frontier.is_empty() {
            return Ok(filled);
        }
        for (tx, ty) in frontier {
            let mut best: Option<(u64, (u32, u32))> = None;
            for dy in -sr..=sr {
                for dx in -sr..=sr {
                    let (Some(cx), Some(cy)) = (tx.checked_add_signed(dx), ty.checked_add_signed(dy))
                    else {
                        continue;
                    };
                    if !patch_is_clean(cx, cy) {
                        continue;
                    }
                    let mut cost = 0u64;
                    let mut overlap = 0u32;
                    for py in -pr..=pr {
                        for px in -pr..=pr {
                            let Some((qx, qy)) = known.neighbor(tx, ty, (px, py)) else {
                                continue;
                            };
                            if !known.is_known(qx, qy) {
                                continue;
                            }
                            let (sx, sy) = (cx.wrapping_add_signed(px), cy.wrapping_add_signed(py));
                            let a = image.get_pixel(qx, qy).0;
                            let b = image.get_pixel(sx, sy).0;
                            cost += a
                                .iter()
                                .zip(b.iter())
                                .take(3)
                                .map(|(&a, &b)| u64::from(a.abs_diff(b)))
                                .sum::<u64>();
                            overlap += 1;
                        }
                    }
                    if overlap > 0 && best.is_none_or(|(c, _)| cost < c) {
                        best = Some((cost, (cx, cy)));
                    }
                }
            }
            let fill = match best {
                Some((_, (cx, cy))) => Some(*image.get_pixel(cx, cy)),
                None => neighbor_average(image, &known, tx, ty),
            };
            if let Some(p) = fill {
                image.put_pixel(tx, ty, p);
                known.set_known(tx, ty);
                filled += 1;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use image::Luma;

    fn solid(w: u32, h: u32, v: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba(v))
    }

    fn full_mask(w: u32, h: u32) -> GrayImage {
        GrayImage::from_pixel(w, h, Luma([255]))
    }

    #[test]
    fn neighbor_average_restores_solid_color() {
        let mut img = solid(20, 20, [90, 120, 150, 255]);
        let bounds = Rect::new(5, 5, 6, 4);
        for y in 5..9 {
            for x in 5..11 {
                img.put_pixel(x, y, Rgba([255, 0, 0, 255]));
            }
        }
        let filled = inpaint_neighbor_average(&mut img, &full_mask(6, 4), bounds).unwrap();
        assert_eq!(filled, 24);
        assert!(img.pixels().all(|p| p.0 == [90, 120, 150, 255]));
    }

    #[test]
    fn patch_restores_solid_color() {
        let mut img = solid(40, 40, [30, 60, 90, 255]);
        let bounds = Rect::new(18, 18, 4, 4);
        for y in 18..22 {
            for x in 18..22 {
                img.put_pixel(x, y, Rgba([250, 250, 250, 255]));
            }
        }
        let filled =
            inpaint_patch(&mut img, &full_mask(4, 4), bounds, &PatchOptions::default()).unwrap();
        assert_eq!(filled, 16);
        assert!(img.pixels().all(|p| p.0 == [30, 60, 90, 255]));
    }

    #[test]
    fn patch_continues_stripes() {
        // Vertical stripes of period 2; a hole should be filled in phase.
        let mut img = RgbaImage::from_fn(40, 40, |x, _| {
            if x % 2 == 0 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        });
        let reference = img.clone();
        let bounds = Rect::new(20, 20, 3, 3);
        for y in 20..23 {
            for x in 20..23 {
                img.put_pixel(x, y, Rgba([128, 0, 128, 255]));
            }
        }
        inpaint_patch(&mut img, &full_mask(3, 3), bounds, &PatchOptions::default()).unwrap();
        assert_eq!(img, reference);
    }

    #[test]
    fn unmasked_pixels_inside_bounds_are_untouched() {
        let mut img = solid(10, 10, [10, 10, 10, 255]);
        img.put_pixel(4, 4, Rgba([200, 200, 200, 255]));
        let mut mask = GrayImage::new(3, 3);
        mask.put_pixel(0, 0, Luma([255]));
        let filled = inpaint_neighbor_average(&mut img, &mask, Rect::new(3, 3, 3, 3)).unwrap();
        assert_eq!(filled, 1);
        assert_eq!(img.get_pixel(4, 4).0, [200, 200, 200, 255]);
    }

    #[test]
    fn mismatched_mask_is_rejected() {
        let mut img = solid(10, 10, [0, 0, 0, 255]);
        let err = inpaint_neighbor_average(&mut img, &full_mask(2, 2), Rect::new(0, 0, 3, 3));
        assert!(matches!(err, Err(StageError::Inpaint(_))));
        let err = inpaint_patch(
            &mut img,
            &full_mask(3, 3),
            Rect::new(8, 8, 3, 3),
            &PatchOptions::default(),
        );
        assert!(matches!(err, Err(StageError::Inpaint(_))));
    }

    #[test]
    fn fully_masked_image_fills_nothing() {
        let mut img = solid(4, 4, [1, 2, 3, 255]);
        let filled = inpaint_neighbor_average(&mut img, &full_mask(4, 4), Rect::new(0, 0, 4, 4)).unwrap();
        assert_eq!(filled, 0);
    }

    #[test]
    fn method_names() {
        assert_eq!(InpaintingMethod::default().name(), "patch-based");
        assert_eq!(InpaintingMethod::NeighborAverage.to_string(), "neighbor-average");
    }
}
