//! Incremental pipeline: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! ```rust
//! # use relic_pipeline::{IngestInput, Pipeline, PipelineConfig, StageError};
//! # fn run(png: Vec<u8>) -> Result<(), StageError> {
//! let restored = Pipeline::new(IngestInput::new(png), PipelineConfig::default())
//!     .ingest()?
//!     .detect()
//!     .segment()
//!     .restore()?
//!     .into_result();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next pipeline state
//! (or `Result` for fallible stages). The `*_with` variants take a
//! progress callback receiving the stage-local percentage and a short
//! message. The controller drives the same chain and checks for pause
//! and cancel between the calls.
//!
//! Rasters are handed forward and dropped as soon as the next stage no
//! longer needs them. Each state keeps the [`StageDiagnostics`] recorded
//! so far.

use std::fmt;

use serde::{Deserialize, Serialize};
use web_time::Instant;

use crate::config::PipelineConfig;
use crate::damage::DamageRegion;
use crate::detect::{Detection, detect};
use crate::diagnostics::{PipelineDiagnostics, StageDiagnostics, StageMetrics};
use crate::encode::data_url;
use crate::error::{StageError, ValidationError};
use crate::ingest::{FileCheck, IngestInput, Ingestion, ingest, validate_file};
use crate::output::{OutputMetadata, PIPELINE_VERSION, RestorationReport, RestoredImage};
use crate::restore::{Restoration, restore};
use crate::segment::{Segmentation, segment};
use crate::shard::CroppedShard;
use crate::types::Raster;

/// The four processing stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    /// Decode, validate, orient.
    Ingestion = 1,
    /// Edges, objects, damage, cut map.
    Detection = 2,
    /// Region planning and shard extraction.
    Segmentation = 3,
    /// Enhancement, repair, stitching, encoding.
    Restoration = 4,
}

impl StageId {
    /// All stages in order.
    pub const ALL: [Self; 4] = [
        Self::Ingestion,
        Self::Detection,
        Self::Segmentation,
        Self::Restoration,
    ];

    /// One-based position.
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Detection => "detection",
            Self::Segmentation => "segmentation",
            Self::Restoration => "restoration",
        }
    }

    /// Capitalized name for reports.
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::Ingestion => "Ingestion",
            Self::Detection => "Detection",
            Self::Segmentation => "Segmentation",
            Self::Restoration => "Restoration",
        }
    }

    /// Stages that run before this one.
    #[must_use]
    pub fn predecessors(self) -> &'static [Self] {
        &Self::ALL[..usize::from(self.number() - 1)]
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress callback: stage-local percentage (0–100) and a message.
pub type Progress<'a> = &'a mut dyn FnMut(f64, &str);

fn no_progress(_: f64, _: &str) {}

/// Record one stage's diagnostics.
fn record(diagnostics: &mut Vec<StageDiagnostics>, start: Instant, metrics: StageMetrics) {
    diagnostics.push(StageDiagnostics {
        duration: start.elapsed(),
        metrics,
    });
}

/// Entry point of the stage chain.
pub struct Pipeline;

impl Pipeline {
    /// Start a pipeline over encoded `input`.
    pub const fn new(input: IngestInput, config: PipelineConfig) -> Pending {
        Pending { input, config }
    }
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
#[must_use = "pipeline stages are consumed by advancing — call .ingest() to continue"]
pub struct Pending {
    input: IngestInput,
    config: PipelineConfig,
}

impl Pending {
    /// The encoded input.
    #[must_use]
    pub const fn input(&self) -> &IngestInput {
        &self.input
    }

    /// File-level validation: size, extension, magic bytes, supported
    /// formats.
    ///
    /// # Errors
    ///
    /// Returns the collected [`ValidationError`] when any check fails.
    pub fn validate(self) -> Result<Validated, ValidationError> {
        let check = validate_file(&self.input, &self.config.global)?;
        Ok(Validated {
            input: self.input,
            config: self.config,
            check,
        })
    }

    /// Validate and ingest in one call.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Validation`] if file validation fails,
    /// otherwise see [`Validated::ingest_with`].
    pub fn ingest(self) -> Result<Ingested, StageError> {
        self.validate()?.ingest()
    }
}

// ──────────────────────── Stage 0b: Validated ────────────────────────

/// Input that passed file-level validation.
#[must_use = "pipeline stages are consumed by advancing — call .ingest() to continue"]
pub struct Validated {
    input: IngestInput,
    config: PipelineConfig,
    check: FileCheck,
}

impl Validated {
    /// The validated format and any warnings.
    #[must_use]
    pub const fn check(&self) -> &FileCheck {
        &self.check
    }

    /// Run stage 1.
    ///
    /// # Errors
    ///
    /// See [`Validated::ingest_with`].
    pub fn ingest(self) -> Result<Ingested, StageError> {
        self.ingest_with(&mut no_progress)
    }

    /// Run stage 1, reporting progress.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Decode`] for malformed bytes and
    /// [`StageError::Validation`] when the decoded dimensions are out of
    /// bounds.
    pub fn ingest_with(self, progress: Progress<'_>) -> Result<Ingested, StageError> {
        let start = Instant::now();
        let ingestion = ingest(&self.input, &self.check, &self.config, progress)?;
        let raster = &ingestion.raster;
        let mut diagnostics = Vec::with_capacity(4);
        record(
            &mut diagnostics,
            start,
            StageMetrics::Ingestion {
                input_bytes: self.input.bytes.len(),
                format: self.check.format,
                width: raster.width(),
                height: raster.height(),
                pixel_count: raster.size().area(),
                orientation: ingestion.orientation_applied,
                warning_count: ingestion.warnings.len(),
            },
        );
        Ok(Ingested {
            filename: self.input.filename,
            config: self.config,
            ingestion,
            diagnostics,
        })
    }
}

// ───────────────────────── Stage 1: Ingested ─────────────────────────

/// Pipeline state after decoding and normalization.
#[must_use = "pipeline stages are consumed by advancing — call .detect() to continue"]
pub struct Ingested {
    filename: Option<String>,
    config: PipelineConfig,
    ingestion: Ingestion,
    diagnostics: Vec<StageDiagnostics>,
}

impl Ingested {
    /// The decoded raster.
    #[must_use]
    pub const fn raster(&self) -> &Raster {
        &self.ingestion.raster
    }

    /// Stage 1 output.
    #[must_use]
    pub const fn ingestion(&self) -> &Ingestion {
        &self.ingestion
    }

    /// Run stage 2.
    pub fn detect(self) -> Detected {
        self.detect_with(&mut no_progress)
    }

    /// Run stage 2, reporting progress.
    pub fn detect_with(mut self, progress: Progress<'_>) -> Detected {
        let start = Instant::now();
        let raster = self.ingestion.raster;
        let detection = detect(&raster, &self.config.detection, progress);
        record(
            &mut self.diagnostics,
            start,
            StageMetrics::Detection {
                edge_threshold: self.config.detection.edge_threshold,
                edge_pixel_count: detection.stats.edge_pixels,
                total_pixel_count: raster.size().area(),
                object_count: detection.stats.object_count,
                damage_count: detection.stats.damage_count,
                damage_percentage: detection.stats.damage_percentage,
                dominant_damage: detection.stats.dominant_damage,
                cut_region_count: detection.cut_map.regions().len(),
            },
        );
        Detected {
            filename: self.filename,
            config: self.config,
            raster,
            detection,
            diagnostics: self.diagnostics,
        }
    }
}

// ───────────────────────── Stage 2: Detected ─────────────────────────

/// Pipeline state after detection.
#[must_use = "pipeline stages are consumed by advancing — call .segment() to continue"]
pub struct Detected {
    filename: Option<String>,
    config: PipelineConfig,
    raster: Raster,
    detection: Detection,
    diagnostics: Vec<StageDiagnostics>,
}

impl Detected {
    /// The ingested raster.
    #[must_use]
    pub const fn raster(&self) -> &Raster {
        &self.raster
    }

    /// Stage 2 output.
    #[must_use]
    pub const fn detection(&self) -> &Detection {
        &self.detection
    }

    /// Run stage 3.
    pub fn segment(self) -> Segmented {
        self.segment_with(&mut no_progress)
    }

    /// Run stage 3, reporting progress.
    pub fn segment_with(mut self, progress: Progress<'_>) -> Segmented {
        let start = Instant::now();
        let segmentation = segment(
            self.raster.pixels(),
            &self.detection,
            &self.config.segmentation,
            progress,
        );
        record(
            &mut self.diagnostics,
            start,
            StageMetrics::Segmentation {
                strategy: self.config.segmentation.strategy.to_string(),
                shard_count: segmentation.shards.len(),
                neighbor_pairs: segmentation.neighbor_pairs,
                max_priority: segmentation
                    .shards
                    .iter()
                    .map(CroppedShard::priority)
                    .max()
                    .unwrap_or(0),
            },
        );
        Segmented {
            filename: self.filename,
            config: self.config,
            raster: self.raster,
            damages: self.detection.damages,
            segmentation,
            diagnostics: self.diagnostics,
        }
    }
}

// ──────────────────────── Stage 3: Segmented ─────────────────────────

/// Pipeline state after segmentation.
#[must_use = "pipeline stages are consumed by advancing — call .restore() to continue"]
pub struct Segmented {
    filename: Option<String>,
    config: PipelineConfig,
    raster: Raster,
    damages: Vec<DamageRegion>,
    segmentation: Segmentation,
    diagnostics: Vec<StageDiagnostics>,
}

impl Segmented {
    /// The ingested raster.
    #[must_use]
    pub const fn raster(&self) -> &Raster {
        &self.raster
    }

    /// Shards, highest priority first.
    #[must_use]
    pub fn shards(&self) -> &[CroppedShard] {
        &self.segmentation.shards
    }

    /// Stage 3 output.
    #[must_use]
    pub const fn segmentation(&self) -> &Segmentation {
        &self.segmentation
    }

    /// Run stage 4.
    ///
    /// # Errors
    ///
    /// See [`Segmented::restore_with`].
    pub fn restore(self) -> Result<Restored, StageError> {
        self.restore_with(&mut no_progress)
    }

    /// Run stage 4, reporting progress.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Inpaint`] if damage repair fails and
    /// [`StageError::Encode`] if the output cannot be encoded.
    pub fn restore_with(mut self, progress: Progress<'_>) -> Result<Restored, StageError> {
        let start = Instant::now();
        let restoration = restore(
            self.raster.pixels(),
            self.segmentation.shards,
            &self.damages,
            &self.config.restoration,
            progress,
        )?;
        let s = &restoration.summary;
        record(
            &mut self.diagnostics,
            start,
            StageMetrics::Restoration {
                shard_count: s.shard_count,
                enhancements: s.enhancements.iter().map(ToString::to_string).collect(),
                repair_count: s.repairs.len(),
                quality_before: s.quality_before,
                quality_after: s.quality_after,
                improvement: s.improvement,
                output_bytes: restoration.encoded.len(),
            },
        );
        Ok(Restored {
            filename: self.filename,
            config: self.config,
            raster: self.raster,
            restoration,
            diagnostics: self.diagnostics,
        })
    }
}

// ───────────────────────── Stage 4: Restored ─────────────────────────

/// Terminal pipeline state.
#[must_use = "call .into_result() to obtain the restored image"]
pub struct Restored {
    filename: Option<String>,
    config: PipelineConfig,
    raster: Raster,
    restoration: Restoration,
    diagnostics: Vec<StageDiagnostics>,
}

impl Restored {
    /// Stage 4 output.
    #[must_use]
    pub const fn restoration(&self) -> &Restoration {
        &self.restoration
    }

    /// Diagnostics of all four stages.
    #[must_use]
    pub fn diagnostics(&self) -> PipelineDiagnostics {
        PipelineDiagnostics {
            total_duration: self.diagnostics.iter().map(|d| d.duration).sum(),
            stages: self.diagnostics.clone(),
        }
    }

    /// Build the final [`RestoredImage`].
    pub fn into_result(self) -> RestoredImage {
        let diagnostics = self.diagnostics();
        let format = self.config.restoration.output_format;
        let Restoration {
            image,
            encoded,
            summary,
            ..
        } = self.restoration;
        let (width, height) = image.dimensions();
        RestoredImage {
            data_url: data_url(&encoded, format),
            width,
            height,
            metadata: OutputMetadata {
                processed_at: chrono::Utc::now(),
                pipeline_version: PIPELINE_VERSION.to_string(),
                original_filename: self.filename,
                source: self.raster.metadata().clone(),
                output_format: format,
            },
            report: RestorationReport::new(summary, diagnostics.timings()),
            diagnostics,
            raster: image,
            encoded,
        }
    }
}

// ─────────────────────────── PipelineStage ───────────────────────────

/// Trait implemented by every pipeline state, giving uniform access to
/// the stage that produced it and that stage's metrics.
pub trait PipelineStage {
    /// Human-readable name of this state.
    const NAME: &str;

    /// The stage whose completion produced this state (`None` before
    /// stage 1 has run).
    const STAGE: Option<StageId>;

    /// Metrics of the stage that produced this state.
    fn metrics(&self) -> Option<StageMetrics>;
}

fn last_metrics(diagnostics: &[StageDiagnostics]) -> Option<StageMetrics> {
    diagnostics.last().map(|d| d.metrics.clone())
}

impl PipelineStage for Pending {
    const NAME: &str = "pending";
    const STAGE: Option<StageId> = None;

    fn metrics(&self) -> Option<StageMetrics> {
        None
    }
}

impl PipelineStage for Validated {
    const NAME: &str = "validated";
    const STAGE: Option<StageId> = None;

    fn metrics(&self) -> Option<StageMetrics> {
        None
    }
}

impl PipelineStage for Ingested {
    const NAME: &str = "ingested";
    const STAGE: Option<StageId> = Some(StageId::Ingestion);

    fn metrics(&self) -> Option<StageMetrics> {
        last_metrics(&self.diagnostics)
    }
}

impl PipelineStage for Detected {
    const NAME: &str = "detected";
    const STAGE: Option<StageId> = Some(StageId::Detection);

    fn metrics(&self) -> Option<StageMetrics> {
        last_metrics(&self.diagnostics)
    }
}

impl PipelineStage for Segmented {
    const NAME: &str = "segmented";
    const STAGE: Option<StageId> = Some(StageId::Segmentation);

    fn metrics(&self) -> Option<StageMetrics> {
        last_metrics(&self.diagnostics)
    }
}

impl PipelineStage for Restored {
    const NAME: &str = "restored";
    const STAGE: Option<StageId> = Some(StageId::Restoration);

    fn metrics(&self) -> Option<StageMetrics> {
        last_metrics(&self.diagnostics)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use image::{ImageEncoder, Rgba, RgbaImage};

    use crate::config::RestorationConfig;
    use crate::format::ImageFormat;
    use crate::segment::SegmentStrategyKind;

    fn png(img: &RgbaImage) -> Vec<u8> {
        let mut buf = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buf);
        encoder
            .write_image(
                img.as_raw(),
                img.width(),
                img.height(),
                image::ExtendedColorType::Rgba8,
            )
            .unwrap();
        buf
    }

    fn grid_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.segmentation.strategy = SegmentStrategyKind::Grid;
        config.segmentation.max_shards = 4;
        config.restoration = RestorationConfig::neutral();
        config
    }

    #[test]
    fn stage_ids_are_ordered() {
        assert_eq!(StageId::Ingestion.number(), 1);
        assert_eq!(StageId::Restoration.number(), 4);
        assert_eq!(StageId::Segmentation.to_string(), "segmentation");
        assert_eq!(StageId::Detection.predecessors(), &[StageId::Ingestion]);
        assert!(StageId::Ingestion.predecessors().is_empty());
    }

    #[test]
    fn chain_runs_every_stage() {
        let source = RgbaImage::from_pixel(64, 48, Rgba([90, 120, 150, 255]));
        let input = IngestInput::new(png(&source)).with_filename("scan.png");
        let ingested = Pipeline::new(input, grid_config()).ingest().unwrap();
        assert!(matches!(ingested.metrics(), Some(StageMetrics::Ingestion { width: 64, .. })));

        let detected = ingested.detect();
        assert_eq!(<Detected as PipelineStage>::STAGE, Some(StageId::Detection));
        assert!(detected.detection().damages.is_empty());

        let segmented = detected.segment();
        // 48 px tall with a 32 px minimum leaves room for one row
        assert_eq!(segmented.shards().len(), 2);

        let restored = segmented.restore().unwrap().into_result();
        assert_eq!((restored.width, restored.height), (64, 48));
        assert_eq!(restored.raster, source);
        assert_eq!(restored.metadata.original_filename.as_deref(), Some("scan.png"));
        assert_eq!(restored.metadata.pipeline_version, PIPELINE_VERSION);
        assert_eq!(restored.diagnostics.stages.len(), 4);
        assert!(restored.data_url.starts_with("data:image/png;base64,"));
        assert_eq!(ImageFormat::sniff(&restored.encoded), Some(ImageFormat::Png));
    }

    #[test]
    fn invalid_bytes_fail_validation() {
        let input = IngestInput::new(b"not an image".to_vec());
        let err = Pipeline::new(input, PipelineConfig::default()).validate();
        assert!(err.is_err());
        let input = IngestInput::new(Vec::new());
        let err = Pipeline::new(input, PipelineConfig::default()).ingest();
        assert!(matches!(err, Err(StageError::Validation(_))));
    }

    #[test]
    fn progress_reaches_one_hundred_in_every_stage() {
        let source = RgbaImage::from_pixel(40, 40, Rgba([128, 128, 128, 255]));
        let mut last = Vec::new();
        let mut track = |p: f64, _: &str| last.push(p);
        let restored = Pipeline::new(IngestInput::new(png(&source)), grid_config())
            .validate()
            .unwrap()
            .ingest_with(&mut track)
            .unwrap()
            .detect_with(&mut track)
            .segment_with(&mut track)
            .restore_with(&mut track)
            .unwrap();
        assert_eq!(last.iter().filter(|&&p| (p - 100.0).abs() < f64::EPSILON).count(), 4);
        assert!(restored.metrics().is_some());
    }
}
