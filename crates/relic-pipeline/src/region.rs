//! Connected-component analysis and binary morphology on masks.
//!
//! Labelling and morphology are delegated to `imageproc`; this module
//! turns the label image into [`Component`] records (bounds and pixel
//! area) and extracts per-component masks sized to their bounds.

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::connected_components;
use serde::{Deserialize, Serialize};

use crate::types::{Rect, Size};

/// Foreground value in binary masks.
pub const FOREGROUND: u8 = 255;

/// Pixel connectivity for component labelling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    /// Edge-sharing neighbors only.
    Four,
    /// Edge- and corner-sharing neighbors.
    #[default]
    Eight,
}

impl From<Connectivity> for imageproc::region_labelling::Connectivity {
    fn from(c: Connectivity) -> Self {
        match c {
            Connectivity::Four => Self::Four,
            Connectivity::Eight => Self::Eight,
        }
    }
}

/// Label image produced by [`label`]. `0` is background.
pub type Labels = ImageBuffer<Luma<u32>, Vec<u32>>;

/// One connected foreground region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    /// Label in the [`Labels`] image this component came from.
    pub label: u32,
    /// Tight bounding box.
    pub bounds: Rect,
    /// Number of foreground pixels.
    pub area: u64,
}

/// Label the non-zero pixels of `mask`.
#[must_use = "returns the label image"]
pub fn label(mask: &GrayImage, connectivity: Connectivity) -> Labels {
    connected_components(mask, connectivity.into(), Luma([0u8]))
}

/// Summarize every labelled component, in label order.
#[must_use]
pub fn summarize(labels: &Labels) -> Vec<Component> {
    struct Acc {
        x0: u32,
        y0: u32,
        x1: u32,
        y1: u32,
        area: u64,
    }

    let mut accs: Vec<Option<Acc>> = Vec::new();
    for (x, y, p) in labels.enumerate_pixels() {
        let l = p.0[0];
        if l == 0 {
            continue;
        }
        let idx = l as usize;
        if accs.len() <= idx {
            accs.resize_with(idx + 1, || None);
        }
        let acc = accs[idx].get_or_insert(Acc {
            x0: x,
            y0: y,
            x1: x,
            y1: y,
            area: 0,
        });
        acc.x0 = acc.x0.min(x);
        acc.y0 = acc.y0.min(y);
        acc.x1 = acc.x1.max(x);
        acc.y1 = acc.y1.max(y);
        acc.area += 1;
    }

    accs.into_iter()
        .enumerate()
        .filter_map(|(l, acc)| {
            let acc = acc?;
            #[allow(clippy::cast_possible_truncation)]
            Some(Component {
                label: l as u32,
                bounds: Rect::new(acc.x0, acc.y0, acc.x1 - acc.x0 + 1, acc.y1 - acc.y0 + 1),
                area: acc.area,
            })
        })
        .collect()
}

/// Label `mask` and return components with at least `min_area` pixels,
/// together with the label image for mask extraction.
#[must_use]
pub fn components(
    mask: &GrayImage,
    connectivity: Connectivity,
    min_area: u64,
) -> (Labels, Vec<Component>) {
    let labels = label(mask, connectivity);
    let comps = summarize(&labels)
        .into_iter()
        .filter(|c| c.area >= min_area)
        .collect();
    (labels, comps)
}

/// Binary mask of one component, sized to its bounds.
#[must_use]
pub fn component_mask(labels: &Labels, component: &Component) -> GrayImage {
    let b = component.bounds;
    GrayImage::from_fn(b.width, b.height, |x, y| {
        if labels.get_pixel(b.x + x, b.y + y).0[0] == component.label {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

/// Grow foreground by `radius` pixels (square structuring element).
#[must_use = "returns the dilated mask"]
pub fn dilate(mask: &GrayImage, radius: u8) -> GrayImage {
    imageproc::morphology::dilate(mask, Norm::LInf, radius)
}

/// Shrink foreground by `radius` pixels (square structuring element).
#[must_use = "returns the eroded mask"]
pub fn erode(mask: &GrayImage, radius: u8) -> GrayImage {
    imageproc::morphology::erode(mask, Norm::LInf, radius)
}

/// Count foreground pixels.
#[must_use]
pub fn foreground_count(mask: &GrayImage) -> u64 {
    mask.pixels().filter(|p| p.0[0] != 0).count() as u64
}

/// Scale block-grid components back to pixel coordinates.
///
/// A component found on a grid where each cell covers `block` pixels
/// maps to the union of its cells, clamped to `bounds`.
#[must_use]
pub fn scale_block_bounds(rect: Rect, block: u32, bounds: Size) -> Rect {
    Rect::clamped(
        i64::from(rect.x) * i64::from(block),
        i64::from(rect.y) * i64::from(block),
        i64::from(rect.width) * i64::from(block),
        i64::from(rect.height) * i64::from(block),
        bounds,
    )
}
