//! Luminance conversion.
//!
//! Every grayscale view in the pipeline uses the same weighting,
//! `0.299*R + 0.587*G + 0.114*B`, so detection, quality scoring and
//! enhancement agree on what "brightness" means.

use image::{GrayImage, Luma, Rgba};

use crate::types::{PlaneF32, RgbaImage};

/// Luminance of one RGBA pixel in `0.0..=255.0`. Alpha is ignored.
#[must_use]
pub fn luminance(p: &Rgba<u8>) -> f32 {
    let [r, g, b, _] = p.0;
    0.114f32.mul_add(
        f32::from(b),
        0.299f32.mul_add(f32::from(r), 0.587 * f32::from(g)),
    )
}

/// Mean of the R, G and B channels.
#[must_use]
pub fn channel_mean(p: &Rgba<u8>) -> f32 {
    let [r, g, b, _] = p.0;
    (f32::from(r) + f32::from(g) + f32::from(b)) / 3.0
}

/// Convert to an 8-bit grayscale image.
#[must_use = "returns the grayscale image"]
pub fn to_gray(image: &RgbaImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([clamp_u8(luminance(image.get_pixel(x, y)))])
    })
}

/// Convert to an `f32` luminance plane.
#[must_use = "returns the luminance plane"]
pub fn to_plane(image: &RgbaImage) -> PlaneF32 {
    PlaneF32::from_fn(image.width(), image.height(), |x, y| {
        Luma([luminance(image.get_pixel(x, y))])
    })
}

/// Round and clamp a float into `0..=255`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}
