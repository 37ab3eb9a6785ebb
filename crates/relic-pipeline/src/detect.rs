//! Stage 2: edge extraction, object and damage detection, cut map.

use serde::{Deserialize, Serialize};

use crate::config::DetectionConfig;
use crate::cutmap::CutMap;
use crate::damage::{DamageRegion, DamageType, damage_percentage, detect_damage, dominant_damage_type};
use crate::edge::{count_edge_pixels, edge_mask, sobel};
use crate::grayscale::to_gray;
use crate::objects::{DetectedObject, detect_objects};
use crate::types::{GrayImage, Raster};

/// Summary statistics of a detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionStats {
    /// Number of objects kept.
    pub object_count: usize,
    /// Number of damage regions kept.
    pub damage_count: usize,
    /// Damaged share of the raster in percent, capped at 100.
    pub damage_percentage: f64,
    /// Most frequent damage type.
    pub dominant_damage: Option<DamageType>,
    /// Pixels on the edge mask.
    pub edge_pixels: u64,
}

/// Everything stage 2 produces.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Binary edge mask.
    pub edges: GrayImage,
    /// Classified objects.
    pub objects: Vec<DetectedObject>,
    /// Damage regions above the confidence threshold.
    pub damages: Vec<DamageRegion>,
    /// Priority grid and cut regions.
    pub cut_map: CutMap,
    /// Summary counts.
    pub stats: DetectionStats,
}

/// Run detection on an ingested raster.
///
/// Progress is reported at fixed checkpoints (0, 25, 50, 75, 100).
#[tracing::instrument(skip_all, fields(width = raster.width(), height = raster.height()))]
pub fn detect(
    raster: &Raster,
    config: &DetectionConfig,
    progress: &mut dyn FnMut(f64, &str),
) -> Detection {
    progress(0.0, "computing gradients");
    let image = raster.pixels();
    let gray = to_gray(image);
    let gradient = sobel(&gray);
    let edges = edge_mask(&gradient, config.edge_threshold, config.edge_method);

    progress(25.0, "detecting objects");
    let objects = detect_objects(&gray, &edges, config.min_object_area);

    progress(50.0, "detecting damage");
    let damages = detect_damage(image, &gray, &gradient, config);

    progress(75.0, "building cut map");
    let mut cut_map = CutMap::build(raster.size(), &objects, &damages, config.merge_cut_regions);
    if config.enable_visualization {
        cut_map = cut_map.with_overlay(image, &objects, &damages);
    }

    let stats = DetectionStats {
        object_count: objects.len(),
        damage_count: damages.len(),
        damage_percentage: damage_percentage(&damages, raster.size()),
        dominant_damage: dominant_damage_type(&damages),
        edge_pixels: count_edge_pixels(&edges),
    };
    tracing::info!(
        objects = stats.object_count,
        damages = stats.damage_count,
        damage_pct = stats.damage_percentage,
        "detection complete"
    );
    progress(100.0, "detection complete");
    Detection {
        edges,
        objects,
        damages,
        cut_map,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use image::Rgba;

    use crate::types::RgbaImage;

    #[test]
    fn uniform_raster_detects_nothing() {
        let raster = Raster::from_pixels(RgbaImage::from_pixel(96, 64, Rgba([128, 128, 128, 255])));
        let mut seen = Vec::new();
        let d = detect(&raster, &DetectionConfig::default(), &mut |p, _| seen.push(p));
        assert!(d.objects.is_empty());
        assert!(d.damages.is_empty());
        assert_eq!(d.stats.edge_pixels, 0);
        assert_eq!(d.stats.dominant_damage, None);
        assert!(d.stats.damage_percentage.abs() < f64::EPSILON);
        assert_eq!(seen, vec![0.0, 25.0, 50.0, 75.0, 100.0]);
        assert!(d.cut_map.overlay().is_none());
    }

    #[test]
    fn visualization_attaches_overlay() {
        let raster = Raster::from_pixels(RgbaImage::from_pixel(40, 40, Rgba([10, 10, 10, 255])));
        let config = DetectionConfig {
            enable_visualization: true,
            ..DetectionConfig::default()
        };
        let d = detect(&raster, &config, &mut |_, _| {});
        assert_eq!(d.cut_map.overlay().map(RgbaImage::dimensions), Some((40, 40)));
    }

    #[test]
    fn text_bar_is_found() {
        let raster = Raster::from_pixels(RgbaImage::from_fn(120, 60, |x, y| {
            if (30..90).contains(&x) && (25..35).contains(&y) {
                Rgba([10, 10, 10, 255])
            } else {
                Rgba([240, 240, 240, 255])
            }
        }));
        let d = detect(&raster, &DetectionConfig::default(), &mut |_, _| {});
        assert_eq!(d.stats.object_count, 1);
        assert_eq!(d.cut_map.regions().len(), 1);
        assert!(d.stats.edge_pixels > 0);
    }
}
