//! Sobel gradients and binary edge masks.
//!
//! [`sobel`] wraps [`imageproc::gradients::horizontal_sobel`] and
//! [`imageproc::gradients::vertical_sobel`] and derives per-pixel
//! magnitude and direction. [`edge_mask`] turns the magnitude into a
//! binary mask either by a plain threshold or by Canny-style thinning
//! ([`non_maximum_suppression`] followed by [`hysteresis`]).
//!
//! `imageproc::edges::canny` is not used directly: it always blurs with
//! a fixed sigma, and its hysteresis pass indexes past the image border
//! once an edge reaches row or column 0.

use std::f32::consts::PI;

use image::{GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::filter::filter_clamped;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use imageproc::kernel::Kernel;

use crate::config::EdgeMethod;
use crate::types::PlaneF32;

/// Mask value for an edge pixel.
pub const EDGE: u8 = 255;

/// 4-neighbor Laplacian with `f32` taps.
const LAPLACIAN_3X3: Kernel<'static, f32> =
    Kernel::new(&[0.0, 1.0, 0.0, 1.0, -4.0, 1.0, 0.0, 1.0, 0.0], 3, 3);

/// Per-pixel Sobel gradient.
#[derive(Debug, Clone)]
pub struct Gradient {
    /// Horizontal derivative.
    pub gx: Image<Luma<i16>>,
    /// Vertical derivative.
    pub gy: Image<Luma<i16>>,
    /// `sqrt(gx² + gy²)`.
    pub magnitude: PlaneF32,
}

impl Gradient {
    /// Magnitude at `(x, y)`.
    #[must_use]
    pub fn magnitude_at(&self, x: u32, y: u32) -> f32 {
        self.magnitude.get_pixel(x, y).0[0]
    }

    /// `atan2(gy, gx)` at `(x, y)`, in `(-π, π]`.
    #[must_use]
    pub fn direction_at(&self, x: u32, y: u32) -> f32 {
        let gx = f32::from(self.gx.get_pixel(x, y).0[0]);
        let gy = f32::from(self.gy.get_pixel(x, y).0[0]);
        gy.atan2(gx)
    }
}

/// Compute the Sobel gradient of a grayscale image.
#[must_use = "returns the gradient"]
pub fn sobel(gray: &GrayImage) -> Gradient {
    let gx = horizontal_sobel(gray);
    let gy = vertical_sobel(gray);
    let magnitude = PlaneF32::from_fn(gray.width(), gray.height(), |x, y| {
        let h = f32::from(gx.get_pixel(x, y).0[0]);
        let v = f32::from(gy.get_pixel(x, y).0[0]);
        Luma([h.hypot(v)])
    });
    Gradient { gx, gy, magnitude }
}

/// 4-neighbor Laplacian of a plane, edge-clamped.
#[must_use = "returns the Laplacian plane"]
pub fn laplacian(plane: &PlaneF32) -> PlaneF32 {
    filter_clamped(plane, LAPLACIAN_3X3)
}

/// Binary mask of pixels whose magnitude exceeds `threshold`.
#[must_use = "returns the edge mask"]
pub fn threshold_mask(magnitude: &PlaneF32, threshold: f32) -> GrayImage {
    GrayImage::from_fn(magnitude.width(), magnitude.height(), |x, y| {
        Luma([if magnitude.get_pixel(x, y).0[0] > threshold {
            EDGE
        } else {
            0
        }])
    })
}

/// Build the detection edge mask from a gradient.
///
/// [`EdgeMethod::Canny`] uses `threshold / 2` as the hysteresis low
/// threshold and `threshold` as the high threshold.
#[must_use = "returns the edge mask"]
pub fn edge_mask(gradient: &Gradient, threshold: f32, method: EdgeMethod) -> GrayImage {
    match method {
        EdgeMethod::Threshold => threshold_mask(&gradient.magnitude, threshold),
        EdgeMethod::Canny => {
            let thinned = non_maximum_suppression(gradient);
            hysteresis(&thinned, threshold / 2.0, threshold)
        }
    }
}

/// Keep only pixels that are local maxima along the gradient direction.
///
/// The direction is quantized to 0°, 45°, 90° or 135°. Border pixels
/// are suppressed.
#[must_use = "returns the thinned magnitude"]
pub fn non_maximum_suppression(gradient: &Gradient) -> PlaneF32 {
    let g = &gradient.magnitude;
    let (w, h) = g.dimensions();
    let mut out = PlaneF32::new(w, h);
    if w < 3 || h < 3 {
        return out;
    }
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut angle = gradient.direction_at(x, y).to_degrees();
            if angle < 0.0 {
                angle += 180.0;
            }
            let (a, b) = if !(22.5..157.5).contains(&angle) {
                ((x - 1, y), (x + 1, y))
            } else if angle < 67.5 {
                ((x + 1, y + 1), (x - 1, y - 1))
            } else if angle < 112.5 {
                ((x, y - 1), (x, y + 1))
            } else {
                ((x - 1, y + 1), (x + 1, y - 1))
            };
            let m = g.get_pixel(x, y).0[0];
            if m >= g.get_pixel(a.0, a.1).0[0] && m >= g.get_pixel(b.0, b.1).0[0] {
                out.put_pixel(x, y, Luma([m]));
            }
        }
    }
    out
}

/// Hysteresis thresholding by non-recursive flood fill.
///
/// Pixels at or above `high` seed edges; 8-connected pixels at or above
/// `low` are added while reachable from a seed. Neighbor coordinates
/// are bounds-checked so the fill may reach the image border.
#[must_use = "returns the edge mask"]
pub fn hysteresis(input: &PlaneF32, low: f32, high: f32) -> GrayImage {
    let (w, h) = input.dimensions();
    let mut out = GrayImage::new(w, h);
    let mut stack = Vec::new();
    for y in 0..h {
        for x in 0..w {
            if input.get_pixel(x, y).0[0] < high || out.get_pixel(x, y).0[0] != 0 {
                continue;
            }
            out.put_pixel(x, y, Luma([EDGE]));
            stack.push((x, y));
            while let Some((nx, ny)) = stack.pop() {
                for (dx, dy) in NEIGHBORS_8 {
                    let (Some(px), Some(py)) =
                        (nx.checked_add_signed(dx), ny.checked_add_signed(dy))
                    else {
                        continue;
                    };
                    if px >= w || py >= h {
                        continue;
                    }
                    if input.get_pixel(px, py).0[0] >= low && out.get_pixel(px, py).0[0] == 0 {
                        out.put_pixel(px, py, Luma([EDGE]));
                        stack.push((px, py));
                    }
                }
            }
        }
    }
    out
}

/// Offsets of the 8-neighborhood.
pub const NEIGHBORS_8: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Whether two gradient directions agree within `tolerance` radians,
/// treating opposite directions (±π apart) as agreeing.
#[must_use]
pub fn directions_agree(a: f32, b: f32, tolerance: f32) -> bool {
    let diff = (a - b).abs().rem_euclid(2.0 * PI);
    diff < tolerance || (diff - PI).abs() < tolerance || (2.0 * PI - diff) < tolerance
}

/// Count edge pixels in a mask.
#[must_use]
pub fn count_edge_pixels(mask: &GrayImage) -> u64 {
    mask.pixels().map(|p| u64::from(u8::from(p.0[0] != 0))).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(w: u32, h: u32, at: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, _| Luma([if x < at { 0 } else { 255 }]))
    }

    #[test]
    fn uniform_image_has_no_edges() {
        let g = sobel(&GrayImage::from_pixel(16, 16, Luma([128])));
        let mask = edge_mask(&g, 100.0, EdgeMethod::Threshold);
        assert_eq!(count_edge_pixels(&mask), 0);
        let mask = edge_mask(&g, 100.0, EdgeMethod::Canny);
        assert_eq!(count_edge_pixels(&mask), 0);
    }

    #[test]
    fn vertical_step_is_detected() {
        let g = sobel(&step(20, 20, 10));
        let mask = edge_mask(&g, 100.0, EdgeMethod::Threshold);
        assert_eq!(mask.get_pixel(9, 5).0[0], EDGE);
        assert_eq!(mask.get_pixel(10, 5).0[0], EDGE);
        assert_eq!(mask.get_pixel(3, 5).0[0], 0);
    }

    #[test]
    fn horizontal_ramp_has_known_response() {
        #[allow(clippy::cast_possible_truncation)]
        let ramp = GrayImage::from_fn(8, 8, |x, _| Luma([(x * 10) as u8]));
        let g = sobel(&ramp);
        // Interior: (1 + 2 + 1) * 2 * 10 = 80
        assert_eq!(g.gx.get_pixel(4, 4).0[0], 80);
        assert_eq!(g.gy.get_pixel(4, 4).0[0], 0);
        assert!((g.magnitude_at(4, 4) - 80.0).abs() < 1e-3);
    }

    #[test]
    fn step_direction_is_horizontal() {
        let g = sobel(&step(20, 20, 10));
        assert!(g.direction_at(10, 10).abs() < 1e-3);
    }

    #[test]
    fn canny_is_thinner_than_threshold() {
        let g = sobel(&step(20, 20, 10));
        let plain = count_edge_pixels(&edge_mask(&g, 100.0, EdgeMethod::Threshold));
        let thin = count_edge_pixels(&edge_mask(&g, 100.0, EdgeMethod::Canny));
        assert!(thin > 0, "expected edges at sharp boundary");
        assert!(thin < plain, "canny={thin} plain={plain}");
    }

    #[test]
    fn hysteresis_reaches_border_without_panic() {
        let mut plane = PlaneF32::new(10, 10);
        for y in 0..10 {
            plane.put_pixel(0, y, Luma([60.0]));
            plane.put_pixel(1, y, Luma([200.0]));
        }
        let out = hysteresis(&plane, 50.0, 150.0);
        assert_eq!(out.get_pixel(0, 0).0[0], EDGE);
        assert_eq!(out.get_pixel(1, 9).0[0], EDGE);
        assert_eq!(out.get_pixel(5, 5).0[0], 0);
    }

    #[test]
    fn opposite_directions_agree() {
        assert!(directions_agree(0.1, 0.1 + PI, 0.3));
        assert!(directions_agree(PI - 0.05, -PI + 0.05, 0.3));
        assert!(!directions_agree(0.0, PI / 2.0, 0.3));
    }

    #[test]
    fn laplacian_of_uniform_is_zero() {
        let plane = PlaneF32::from_pixel(6, 6, Luma([77.0]));
        assert!(laplacian(&plane).pixels().all(|p| p.0[0].abs() < 1e-4));
    }

    #[test]
    fn laplacian_of_linear_ramp_is_zero_inside() {
        #[allow(clippy::cast_precision_loss)]
        let plane = PlaneF32::from_fn(8, 8, |x, _| Luma([x as f32 * 10.0]));
        assert!(laplacian(&plane).get_pixel(3, 3).0[0].abs() < 1e-3);
    }
}
