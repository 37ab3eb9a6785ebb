//! relic-pipeline: forensic photo restoration pipeline (sans-IO).
//!
//! Restores a scanned or photographed picture through four stages:
//! ingestion -> detection -> segmentation -> restoration.
//!
//! 1. **Ingestion** validates and decodes the bytes, applies EXIF
//!    orientation and records source metadata.
//! 2. **Detection** finds edges, classifies objects, detects damage
//!    (stains, scratches, fading, noise) and builds a priority cut map.
//! 3. **Segmentation** plans regions with a pluggable strategy and cuts
//!    them into prioritized shards with neighbor context.
//! 4. **Restoration** repairs and enhances each shard, stitches the
//!    shards back together, scores quality and encodes the output.
//!
//! This crate has **no I/O dependencies**: it operates on in-memory byte
//! buffers and returns structured data. The `relic` binary handles the
//! filesystem.
//!
//! Use [`process`] for a one-shot run, [`Pipeline`] to step through the
//! stages and inspect each result, or [`Controller`] for progress
//! events, pause, resume and cancel.

pub mod blur;
pub mod clock;
pub mod config;
pub mod controller;
pub mod cutmap;
pub mod damage;
pub mod detect;
pub mod diagnostics;
pub mod edge;
pub mod encode;
pub mod enhance;
pub mod error;
pub mod events;
pub mod format;
pub mod grayscale;
pub mod ingest;
pub mod inpaint;
pub mod objects;
pub mod output;
pub mod pipeline;
pub mod quality;
pub mod region;
pub mod restore;
pub mod segment;
pub mod shard;
pub mod stitch;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DetectionConfig, EdgeMethod, GlobalConfig, IngestionConfig, LogLevel, PipelineConfig,
    PipelineSettings, RestorationConfig, SegmentationConfig, StageWeights,
};
pub use controller::{ControlEvent, Controller, PipelineProgress, Status};
pub use damage::{DamageRegion, DamageType, Severity};
pub use diagnostics::{PipelineDiagnostics, StageDiagnostics, StageMetrics, StageTimings};
pub use error::{PipelineError, StageError, ValidationError};
pub use events::{EventBus, EventKind, PipelineEvent, SubscriptionId};
pub use format::ImageFormat;
pub use ingest::IngestInput;
pub use inpaint::InpaintingMethod;
pub use objects::{DetectedObject, ObjectType};
pub use output::{OutputMetadata, RestorationReport, RestoredImage};
pub use pipeline::{Pipeline, PipelineStage, StageId};
pub use quality::QualityScore;
pub use segment::{RegionStrategy, SegmentStrategyKind};
pub use shard::CroppedShard;
pub use stitch::StitchMode;
pub use types::{Rect, Size};

/// Run the full restoration pipeline over encoded image bytes.
///
/// Equivalent to creating a [`Controller`] with `config` and calling
/// [`Controller::process`] once.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] for an inconsistent
/// configuration, [`PipelineError::Validation`] if the file fails
/// validation, and [`PipelineError::Stage`] if a stage fails.
pub fn process(input: IngestInput, config: &PipelineConfig) -> Result<RestoredImage, PipelineError> {
    Controller::new(config.clone())?.process(input)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::{ImageEncoder, Rgba, RgbaImage};

    use super::*;

    /// A gray PNG with a brown blot, enough to exercise every stage.
    fn stained_png() -> Vec<u8> {
        let img = RgbaImage::from_fn(96, 96, |x, y| {
            if (30..50).contains(&x) && (30..50).contains(&y) {
                Rgba([150, 100, 40, 255])
            } else {
                Rgba([180, 180, 180, 255])
            }
        });
        let mut buf = Vec::new();
        image::codecs::png::PngEncoder::new(&mut buf)
            .write_image(img.as_raw(), 96, 96, image::ExtendedColorType::Rgba8)
            .unwrap();
        buf
    }

    #[test]
    fn process_keeps_dimensions() {
        let out = process(IngestInput::new(stained_png()), &PipelineConfig::default()).unwrap();
        assert_eq!((out.width, out.height), (96, 96));
        assert_eq!(out.raster.dimensions(), (96, 96));
        assert_eq!(out.metadata.output_format, ImageFormat::Png);
        assert_eq!(out.diagnostics.stages.len(), 4);
    }

    #[test]
    fn process_rejects_invalid_config() {
        let mut config = PipelineConfig::default();
        config.segmentation.max_shards = 0;
        let err = process(IngestInput::new(stained_png()), &config).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn process_reports_damage() {
        let out = process(IngestInput::new(stained_png()), &PipelineConfig::default()).unwrap();
        let detection = out
            .diagnostics
            .stages
            .iter()
            .find_map(|s| match &s.metrics {
                StageMetrics::Detection { damage_count, .. } => Some(*damage_count),
                _ => None,
            })
            .unwrap();
        assert!(detection >= 1);
    }
}
