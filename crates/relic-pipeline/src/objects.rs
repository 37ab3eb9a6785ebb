//! Heuristic object detection.
//!
//! The edge mask is dilated so neighboring strokes (glyphs, signature
//! loops) join into blobs, then each 8-connected blob is classified
//! from simple statistics of the pixels inside its bounding box.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::region::{Connectivity, components, dilate};
use crate::types::{GrayImage, ObjectId, Rect};

/// Luminance below which a pixel counts as dark.
pub const DARK_LEVEL: u8 = 100;

/// Objects below this confidence are discarded.
pub const MIN_CONFIDENCE: f32 = 0.3;

/// Bounding-box area below which a blob may be a signature.
const SIGNATURE_MAX_AREA: u64 = 20_000;

/// What a detected object looks like.
///
/// [`classify`] only produces `Text`, `Image`, `Signature` and
/// `Unknown`. The other variants keep their priorities so the
/// face-priority strategy and shard scheduling can rank objects that
/// carry them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    /// Printed or handwritten text lines.
    Text,
    /// Photographic content.
    Image,
    /// Handwritten signature.
    Signature,
    /// Ink stamp.
    Stamp,
    /// 1D or 2D barcode.
    Barcode,
    /// Human face.
    Face,
    /// Structure that matched no heuristic.
    Unknown,
}

impl ObjectType {
    /// Scheduling priority of the type (higher is more important).
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Face => 9,
            Self::Text => 8,
            Self::Signature => 7,
            Self::Stamp | Self::Image => 6,
            Self::Barcode => 5,
            Self::Unknown => 4,
        }
    }

    /// Lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Signature => "signature",
            Self::Stamp => "stamp",
            Self::Barcode => "barcode",
            Self::Face => "face",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A classified region of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    /// Detection-order identifier.
    pub id: ObjectId,
    /// Classified type.
    pub object_type: ObjectType,
    /// Bounding box in raster coordinates.
    pub bounds: Rect,
    /// Classification confidence in `0.0..=1.0`.
    pub confidence: f32,
    /// Priority derived from the type.
    pub priority: u8,
}

/// Pixel statistics of one blob's bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobStats {
    /// Share of pixels darker than [`DARK_LEVEL`].
    pub dark_ratio: f32,
    /// Mean luminance.
    pub mean_luminance: f32,
    /// Share of pixels on the (undilated) edge mask.
    pub edge_density: f32,
    /// Width divided by height.
    pub aspect: f32,
    /// Bounding-box area.
    pub area: u64,
}

impl BlobStats {
    /// Measure the pixels of `gray` and `edges` inside `bounds`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn measure(gray: &GrayImage, edges: &GrayImage, bounds: Rect) -> Self {
        let (mut dark, mut sum, mut edge) = (0u64, 0u64, 0u64);
        for y in bounds.y..bounds.bottom() {
            for x in bounds.x..bounds.right() {
                let v = gray.get_pixel(x, y).0[0];
                dark += u64::from(v < DARK_LEVEL);
                sum += u64::from(v);
                edge += u64::from(edges.get_pixel(x, y).0[0] != 0);
            }
        }
        let area = bounds.area().max(1);
        Self {
            dark_ratio: dark as f32 / area as f32,
            mean_luminance: sum as f32 / area as f32,
            edge_density: edge as f32 / area as f32,
            aspect: bounds.width as f32 / bounds.height.max(1) as f32,
            area: bounds.area(),
        }
    }
}

/// Classify a blob. Returns the type and its confidence.
///
/// Never returns `Face`, `Stamp` or `Barcode`.
#[must_use]
pub fn classify(stats: &BlobStats) -> (ObjectType, f32) {
    let near_square = (0.67..=1.5).contains(&stats.aspect);
    if stats.dark_ratio > 0.2 && (2.0..=20.0).contains(&stats.aspect) {
        (ObjectType::Text, (0.5 + stats.dark_ratio).min(0.95))
    } else if near_square && (100.0..=220.0).contains(&stats.mean_luminance) {
        (ObjectType::Image, 0.3f32.mul_add(stats.edge_density.min(1.0), 0.5))
    } else if stats.area < SIGNATURE_MAX_AREA && (0.05..=0.3).contains(&stats.dark_ratio) {
        (ObjectType::Signature, 0.5)
    } else {
        (ObjectType::Unknown, (0.2 + stats.edge_density).min(0.4))
    }
}

/// Detect objects from the edge mask.
///
/// `gray` provides the luminance used for classification. Blobs with
/// fewer than `min_area` (dilated) pixels and objects below
/// [`MIN_CONFIDENCE`] are dropped. Ids follow blob label order.
#[must_use]
pub fn detect_objects(gray: &GrayImage, edges: &GrayImage, min_area: u32) -> Vec<DetectedObject> {
    let grown = dilate(&dilate(edges, 1), 1);
    let (_, blobs) = components(&grown, Connectivity::Eight, u64::from(min_area));
    let mut next = 0;
    blobs
        .iter()
        .filter_map(|blob| {
            let stats = BlobStats::measure(gray, edges, blob.bounds);
            let (object_type, confidence) = classify(&stats);
            if confidence < MIN_CONFIDENCE {
                return None;
            }
            let id = ObjectId(next);
            next += 1;
            Some(DetectedObject {
                id,
                object_type,
                bounds: blob.bounds,
                confidence,
                priority: object_type.priority(),
            })
        })
        .collect()
}
