//! Gaussian blur on `f32` planes and on the color channels of RGBA
//! images.
//!
//! Wraps [`imageproc::filter::gaussian_blur_f32`]. Borders pad by
//! continuity, so a uniform input blurs to itself.

use image::{Luma, Rgba};

use crate::grayscale::clamp_u8;
use crate::types::{PlaneF32, RgbaImage};

/// Blur a single plane.
///
/// Non-positive sigma values return the plane unchanged, since
/// `imageproc` panics on `sigma <= 0.0`.
#[must_use = "returns the blurred plane"]
pub fn gaussian_blur(plane: &PlaneF32, sigma: f32) -> PlaneF32 {
    if sigma <= 0.0 || plane.width() == 0 || plane.height() == 0 {
        return plane.clone();
    }
    imageproc::filter::gaussian_blur_f32(plane, sigma)
}

/// Split the RGB channels of an image into three `f32` planes.
#[must_use]
pub fn split_rgb(image: &RgbaImage) -> [PlaneF32; 3] {
    std::array::from_fn(|c| {
        PlaneF32::from_fn(image.width(), image.height(), |x, y| {
            Luma([f32::from(image.get_pixel(x, y).0[c])])
        })
    })
}

/// Reassemble three RGB planes into an image, rounding each channel and
/// taking alpha from `alpha_source`.
#[must_use]
pub fn merge_rgb(planes: &[PlaneF32; 3], alpha_source: &RgbaImage) -> RgbaImage {
    RgbaImage::from_fn(alpha_source.width(), alpha_source.height(), |x, y| {
        Rgba([
            clamp_u8(planes[0].get_pixel(x, y).0[0]),
            clamp_u8(planes[1].get_pixel(x, y).0[0]),
            clamp_u8(planes[2].get_pixel(x, y).0[0]),
            alpha_source.get_pixel(x, y).0[3],
        ])
    })
}

/// Blur the RGB channels of an image independently. Alpha is carried
/// over unchanged.
///
/// Channels are blurred at `f32` and rounded once at the end, so a
/// uniform image comes back bit-identical.
#[must_use = "returns the blurred image"]
pub fn gaussian_blur_rgb(image: &RgbaImage, sigma: f32) -> RgbaImage {
    if sigma <= 0.0 {
        return image.clone();
    }
    let planes = split_rgb(image).map(|p| gaussian_blur(&p, sigma));
    merge_rgb(&planes, image)
}
