//! Shared types for the relic restoration pipeline.
//!
//! Geometry value types ([`Point`], [`Size`], [`Rect`]), the decoded
//! [`Raster`] with its [`RasterMetadata`], and the typed identifiers
//! handed out by detection and segmentation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::format::ImageFormat;

/// Re-export `GrayImage` so downstream crates can reference
/// single-channel masks and luminance planes without depending on
/// `image` directly.
pub use image::GrayImage;

/// Re-export `RgbaImage`: every raster in the pipeline is 8-bit RGBA.
pub use image::RgbaImage;

/// Single-channel `f32` plane used for luminance, gradients and
/// convolution results.
pub type PlaneF32 = image::ImageBuffer<image::Luma<f32>, Vec<f32>>;

// ───────────────────────── Geometry ──────────────────────────────────

/// A pixel position in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    /// Column (pixels from the left edge).
    pub x: u32,
    /// Row (pixels from the top edge).
    pub y: u32,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        let dx = f64::from(self.x) - f64::from(other.x);
        let dy = f64::from(self.y) - f64::from(other.y);
        dx.hypot(dy)
    }
}

/// Extent of an image or region in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Size {
    /// Create a new size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels covered.
    #[must_use]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// `true` when either dimension is zero.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width divided by height (`0.0` for an empty size).
    #[must_use]
    pub fn aspect_ratio(self) -> f64 {
        if self.height == 0 {
            0.0
        } else {
            f64::from(self.width) / f64::from(self.height)
        }
    }
}

/// An axis-aligned rectangle in pixel coordinates.
///
/// `x`/`y` is the top-left corner; the rectangle covers columns
/// `x..x + width` and rows `y..y + height`. Rectangles produced by the
/// pipeline are clamped to the raster they describe, see
/// [`Rect::clamped`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Create a rectangle without clamping.
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering an entire image of the given size.
    #[must_use]
    pub const fn full(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    /// Build a rectangle from signed coordinates, clamping both corners
    /// into `0..=bounds`.
    ///
    /// The result may be empty if the input lies entirely outside the
    /// bounds.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn clamped(x: i64, y: i64, width: i64, height: i64, bounds: Size) -> Self {
        let max_x = i64::from(bounds.width);
        let max_y = i64::from(bounds.height);
        let x0 = x.clamp(0, max_x);
        let y0 = y.clamp(0, max_y);
        let x1 = x.saturating_add(width.max(0)).clamp(0, max_x);
        let y1 = y.saturating_add(height.max(0)).clamp(0, max_y);
        Self::new(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32)
    }

    /// Exclusive right edge.
    #[must_use]
    pub const fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Exclusive bottom edge.
    #[must_use]
    pub const fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Extent of the rectangle.
    #[must_use]
    pub const fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Number of pixels covered.
    #[must_use]
    pub const fn area(&self) -> u64 {
        self.size().area()
    }

    /// `true` when the rectangle covers no pixels.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size().is_empty()
    }

    /// Whether the pixel lies inside the rectangle.
    #[must_use]
    pub const fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.x < self.right() && p.y >= self.y && p.y < self.bottom()
    }

    /// Whether `other` lies entirely inside `self`.
    #[must_use]
    pub const fn contains_rect(&self, other: &Self) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Overlapping region, or `None` if the rectangles share no pixel.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        (x1 > x0 && y1 > y0).then(|| Self::new(x0, y0, x1 - x0, y1 - y0))
    }

    /// Whether the rectangles share at least one pixel.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.intersection(other).is_some()
    }

    /// Number of shared pixels.
    #[must_use]
    pub fn overlap_area(&self, other: &Self) -> u64 {
        self.intersection(other).map_or(0, |r| r.area())
    }

    /// Smallest rectangle covering both.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        Self::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// Grow by `padding` pixels on every side, clamped to `bounds`.
    #[must_use]
    pub fn expand(&self, padding: u32, bounds: Size) -> Self {
        let pad = i64::from(padding);
        Self::clamped(
            i64::from(self.x) - pad,
            i64::from(self.y) - pad,
            i64::from(self.width) + 2 * pad,
            i64::from(self.height) + 2 * pad,
            bounds,
        )
    }

    /// Ratio of the longer side to the shorter side (`0.0` when empty).
    #[must_use]
    pub fn elongation(&self) -> f64 {
        let long = self.width.max(self.height);
        let short = self.width.min(self.height);
        if short == 0 {
            0.0
        } else {
            f64::from(long) / f64::from(short)
        }
    }

    /// Express `self` in the coordinate frame of `outer`'s top-left
    /// corner. `self` must lie inside `outer`.
    #[must_use]
    pub const fn relative_to(&self, outer: &Self) -> Self {
        Self::new(
            self.x.saturating_sub(outer.x),
            self.y.saturating_sub(outer.y),
            self.width,
            self.height,
        )
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Repeatedly union overlapping rectangles until none overlap.
///
/// Touching rectangles (shared edge, no shared pixel) are left apart.
/// The relative order of the surviving rectangles follows the input.
#[must_use]
pub fn merge_overlapping(rects: &[Rect]) -> Vec<Rect> {
    let mut merged: Vec<Rect> = rects.iter().copied().filter(|r| !r.is_empty()).collect();
    loop {
        let mut changed = false;
        let mut i = 0;
        while i < merged.len() {
            let mut j = i + 1;
            while j < merged.len() {
                if merged[i].intersects(&merged[j]) {
                    let other = merged.remove(j);
                    merged[i] = merged[i].union(&other);
                    changed = true;
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
        if !changed {
            return merged;
        }
    }
}

// ───────────────────────── Identifiers ───────────────────────────────

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a [`DetectedObject`](crate::objects::DetectedObject).
    ObjectId,
    "object"
);
id_type!(
    /// Identifier of a [`DamageRegion`](crate::damage::DamageRegion).
    DamageId,
    "damage"
);
id_type!(
    /// Identifier of a [`CroppedShard`](crate::shard::CroppedShard).
    ShardId,
    "shard"
);

// ───────────────────────── Raster ────────────────────────────────────

/// Color space recorded for a raster.
///
/// Decoded pixels are always 8-bit sRGB, so ingested rasters record
/// [`ColorSpace::Srgb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorSpace {
    /// IEC 61966-2-1 sRGB.
    #[default]
    Srgb,
    /// Display P3.
    DisplayP3,
    /// Adobe RGB (1998).
    AdobeRgb,
}

impl ColorSpace {
    /// Kebab-case name, as serialized.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Srgb => "srgb",
            Self::DisplayP3 => "display-p3",
            Self::AdobeRgb => "adobe-rgb",
        }
    }
}

/// EXIF fields captured at ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExifData {
    /// Orientation tag (1–8), if present.
    pub orientation: Option<u32>,
    /// Camera or scanner manufacturer.
    pub make: Option<String>,
    /// Camera or scanner model.
    pub model: Option<String>,
    /// Original capture date/time as written in the file.
    pub date_time: Option<String>,
    /// Every primary-IFD field as `tag name → display value`.
    pub fields: BTreeMap<String, String>,
}

/// Metadata describing where a raster came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterMetadata {
    /// Container format of the source bytes.
    pub format: ImageFormat,
    /// Size of the source bytes.
    pub file_size: usize,
    /// Color space the channels are interpreted in.
    pub color_space: ColorSpace,
    /// Bits per channel of the decoded buffer.
    pub bit_depth: u8,
    /// Whether the source format can carry an alpha channel.
    pub has_alpha: bool,
    /// EXIF data, when present and preserved.
    pub exif: Option<ExifData>,
}

impl Default for RasterMetadata {
    fn default() -> Self {
        Self {
            format: ImageFormat::Png,
            file_size: 0,
            color_space: ColorSpace::Srgb,
            bit_depth: 8,
            has_alpha: true,
            exif: None,
        }
    }
}

/// An 8-bit RGBA pixel buffer plus its [`RasterMetadata`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pixels: RgbaImage,
    metadata: RasterMetadata,
}

impl Raster {
    /// Wrap a decoded pixel buffer.
    #[must_use]
    pub const fn new(pixels: RgbaImage, metadata: RasterMetadata) -> Self {
        Self { pixels, metadata }
    }

    /// Wrap a pixel buffer with default metadata (PNG, sRGB, 8-bit).
    #[must_use]
    pub fn from_pixels(pixels: RgbaImage) -> Self {
        Self::new(pixels, RasterMetadata::default())
    }

    /// The RGBA pixel buffer.
    #[must_use]
    pub const fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Consume the raster and return the pixel buffer.
    #[must_use]
    pub fn into_pixels(self) -> RgbaImage {
        self.pixels
    }

    /// Source metadata.
    #[must_use]
    pub const fn metadata(&self) -> &RasterMetadata {
        &self.metadata
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Extent of the raster.
    #[must_use]
    pub fn size(&self) -> Size {
        Size::new(self.width(), self.height())
    }

    /// Rectangle covering the whole raster.
    #[must_use]
    pub fn bounds(&self) -> Rect {
        Rect::full(self.size())
    }

    /// Copy out the pixels inside `rect` (clamped to the raster).
    #[must_use]
    pub fn crop(&self, rect: Rect) -> RgbaImage {
        crop_rgba(&self.pixels, rect)
    }
}

/// Copy the pixels inside `rect` out of `image`, clamping `rect` to the
/// image first.
#[must_use]
pub fn crop_rgba(image: &RgbaImage, rect: Rect) -> RgbaImage {
    let r = Rect::clamped(
        i64::from(rect.x),
        i64::from(rect.y),
        i64::from(rect.width),
        i64::from(rect.height),
        Size::new(image.width(), image.height()),
    );
    image::imageops::crop_imm(image, r.x, r.y, r.width, r.height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: Size = Size::new(100, 80);

    // --- Rect tests ---

    #[test]
    fn clamped_trims_negative_origin() {
        let r = Rect::clamped(-10, -5, 30, 20, BOUNDS);
        assert_eq!(r, Rect::new(0, 0, 20, 15));
    }

    #[test]
    fn clamped_trims_far_edge() {
        let r = Rect::clamped(90, 70, 30, 30, BOUNDS);
        assert_eq!(r, Rect::new(90, 70, 10, 10));
    }

    #[test]
    fn clamped_outside_is_empty() {
        let r = Rect::clamped(200, 200, 10, 10, BOUNDS);
        assert!(r.is_empty());
    }

    #[test]
    fn intersection_of_overlapping_rects() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 5, 10, 10);
        assert_eq!(a.intersection(&b), Some(Rect::new(5, 5, 5, 5)));
        assert_eq!(a.overlap_area(&b), 25);
    }

    #[test]
    fn touching_rects_do_not_intersect() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(10, 0, 10, 10);
        assert!(!a.intersects(&b));
        assert_eq!(a.overlap_area(&b), 0);
    }

    #[test]
    fn union_covers_both() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(20, 30, 5, 5);
        assert_eq!(a.union(&b), Rect::new(0, 0, 25, 35));
    }

    #[test]
    fn union_with_empty_is_identity() {
        let a = Rect::new(3, 4, 5, 6);
        assert_eq!(a.union(&Rect::default()), a);
    }

    #[test]
    fn expand_is_clamped() {
        let r = Rect::new(5, 5, 10, 10).expand(10, BOUNDS);
        assert_eq!(r, Rect::new(0, 0, 25, 25));
        let r = Rect::new(85, 65, 10, 10).expand(10, BOUNDS);
        assert_eq!(r, Rect::new(75, 55, 25, 25));
    }

    #[test]
    fn elongation_is_symmetric() {
        assert!((Rect::new(0, 0, 40, 10).elongation() - 4.0).abs() < f64::EPSILON);
        assert!((Rect::new(0, 0, 10, 40).elongation() - 4.0).abs() < f64::EPSILON);
        assert!(Rect::new(0, 0, 0, 40).elongation().abs() < f64::EPSILON);
    }

    #[test]
    fn contains_checks_half_open_extent() {
        let r = Rect::new(2, 2, 3, 3);
        assert!(r.contains(Point::new(2, 2)));
        assert!(r.contains(Point::new(4, 4)));
        assert!(!r.contains(Point::new(5, 4)));
    }

    #[test]
    fn relative_to_shifts_origin() {
        let outer = Rect::new(10, 20, 50, 50);
        let inner = Rect::new(15, 25, 5, 5);
        assert_eq!(inner.relative_to(&outer), Rect::new(5, 5, 5, 5));
    }

    #[test]
    fn merge_overlapping_chains_transitively() {
        // a overlaps b, b overlaps c, but a does not overlap c.
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(8, 0, 10, 10);
        let c = Rect::new(16, 0, 10, 10);
        let d = Rect::new(50, 50, 5, 5);
        let merged = merge_overlapping(&[a, b, c, d]);
        assert_eq!(merged, vec![Rect::new(0, 0, 26, 10), d]);
    }

    #[test]
    fn merge_overlapping_keeps_touching_apart() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(10, 0, 10, 10);
        assert_eq!(merge_overlapping(&[a, b]), vec![a, b]);
    }

    // --- Size / Point tests ---

    #[test]
    fn size_area_and_aspect() {
        let s = Size::new(200, 100);
        assert_eq!(s.area(), 20_000);
        assert!((s.aspect_ratio() - 2.0).abs() < f64::EPSILON);
        assert!(Size::new(0, 5).is_empty());
    }

    #[test]
    fn point_distance() {
        assert!((Point::new(0, 0).distance(Point::new(3, 4)) - 5.0).abs() < f64::EPSILON);
    }

    // --- Identifier tests ---

    #[test]
    fn ids_display_with_prefix() {
        assert_eq!(ObjectId(3).to_string(), "object-3");
        assert_eq!(DamageId(0).to_string(), "damage-0");
        assert_eq!(ShardId(12).to_string(), "shard-12");
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&DamageId(7)).unwrap_or_default();
        assert_eq!(json, "7");
    }

    // --- Raster tests ---

    #[test]
    fn raster_crop_clamps() {
        let img = RgbaImage::from_fn(10, 10, |x, y| {
            #[allow(clippy::cast_possible_truncation)]
            image::Rgba([x as u8, y as u8, 0, 255])
        });
        let raster = Raster::from_pixels(img);
        let cropped = raster.crop(Rect::new(8, 8, 5, 5));
        assert_eq!(cropped.dimensions(), (2, 2));
        assert_eq!(cropped.get_pixel(0, 0).0, [8, 8, 0, 255]);
    }

    #[test]
    fn raster_bounds_cover_image() {
        let raster = Raster::from_pixels(RgbaImage::new(7, 9));
        assert_eq!(raster.bounds(), Rect::new(0, 0, 7, 9));
        assert_eq!(raster.size(), Size::new(7, 9));
    }
}
