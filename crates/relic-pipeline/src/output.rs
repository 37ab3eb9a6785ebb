//! The terminal artifact of a pipeline run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diagnostics::{PipelineDiagnostics, StageTimings};
use crate::enhance::Enhancement;
use crate::format::ImageFormat;
use crate::quality::QualityScore;
use crate::restore::{RepairRecord, RestorationSummary};
use crate::types::{RasterMetadata, RgbaImage};

/// Pipeline version stamped into every output.
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// What restoration did and how much it helped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorationReport {
    /// Enhancement steps applied, each once.
    pub enhancements: Vec<Enhancement>,
    /// Damage repair records.
    pub repairs: Vec<RepairRecord>,
    /// Score of the ingested raster.
    pub quality_before: QualityScore,
    /// Score of the restored raster.
    pub quality_after: QualityScore,
    /// `round((after - before) / before * 100)`, `0` when before is zero.
    pub improvement: i32,
    /// Signal-to-noise ratio before, in dB.
    pub snr_before: f64,
    /// Signal-to-noise ratio after, in dB.
    pub snr_after: f64,
    /// Per-stage wall-clock timings.
    pub timings: StageTimings,
}

impl RestorationReport {
    /// Combine the restoration summary with the run's timings.
    #[must_use]
    pub fn new(summary: RestorationSummary, timings: StageTimings) -> Self {
        Self {
            enhancements: summary.enhancements,
            repairs: summary.repairs,
            quality_before: summary.quality_before,
            quality_after: summary.quality_after,
            improvement: summary.improvement,
            snr_before: summary.snr_before,
            snr_after: summary.snr_after,
            timings,
        }
    }
}

/// Provenance of a restored image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMetadata {
    /// When the run finished.
    pub processed_at: DateTime<Utc>,
    /// Crate version that produced the output.
    pub pipeline_version: String,
    /// Filename hint given with the input.
    pub original_filename: Option<String>,
    /// Metadata recorded at ingestion.
    pub source: RasterMetadata,
    /// Container of [`RestoredImage::encoded`].
    pub output_format: ImageFormat,
}

/// Final result of a pipeline run. Never mutated after completion.
#[derive(Debug, Clone)]
pub struct RestoredImage {
    /// Restored pixels.
    pub raster: RgbaImage,
    /// Encoded output blob.
    pub encoded: Vec<u8>,
    /// `data:` URL of the encoded blob.
    pub data_url: String,
    /// Output width.
    pub width: u32,
    /// Output height.
    pub height: u32,
    /// Provenance.
    pub metadata: OutputMetadata,
    /// What restoration did.
    pub report: RestorationReport,
    /// Per-stage diagnostics.
    pub diagnostics: PipelineDiagnostics,
}
