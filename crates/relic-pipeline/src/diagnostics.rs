//! Pipeline diagnostics: timing, counts, and other metrics for each stage.
//!
//! Every run collects one [`StageDiagnostics`] per stage. The
//! controller keeps them for [`get_stage_result`], and the final
//! [`RestorationReport`](crate::output::RestorationReport) carries the
//! timings.
//!
//! Duration measurements use [`std::time::Duration`]. Timestamps are
//! captured via the `web-time` crate, which uses `performance.now()` on
//! WASM and `std::time::Instant` on native.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.
//!
//! [`get_stage_result`]: crate::controller::Controller::get_stage_result

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::damage::DamageType;
use crate::format::ImageFormat;
use crate::pipeline::StageId;
use crate::quality::QualityScore;

/// Serde support for `std::time::Duration` as fractional seconds.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Wall-clock duration of each stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    /// Stage 1.
    #[serde(with = "duration_serde")]
    pub ingestion: Duration,
    /// Stage 2.
    #[serde(with = "duration_serde")]
    pub detection: Duration,
    /// Stage 3.
    #[serde(with = "duration_serde")]
    pub segmentation: Duration,
    /// Stage 4.
    #[serde(with = "duration_serde")]
    pub restoration: Duration,
}

impl StageTimings {
    /// Duration of one stage.
    #[must_use]
    pub const fn get(&self, stage: StageId) -> Duration {
        match stage {
            StageId::Ingestion => self.ingestion,
            StageId::Detection => self.detection,
            StageId::Segmentation => self.segmentation,
            StageId::Restoration => self.restoration,
        }
    }

    /// Record the duration of one stage.
    pub const fn set(&mut self, stage: StageId, duration: Duration) {
        match stage {
            StageId::Ingestion => self.ingestion = duration,
            StageId::Detection => self.detection = duration,
            StageId::Segmentation => self.segmentation = duration,
            StageId::Restoration => self.restoration = duration,
        }
    }

    /// Sum of all four stages.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.ingestion + self.detection + self.segmentation + self.restoration
    }
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics (counts, sizes, etc.).
    pub metrics: StageMetrics,
}

/// Stage-specific metrics that vary by pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Decoding and normalization.
    Ingestion {
        /// Size of the input bytes.
        input_bytes: usize,
        /// Container format after validation.
        format: ImageFormat,
        /// Raster width after orientation and trimming.
        width: u32,
        /// Raster height after orientation and trimming.
        height: u32,
        /// Total pixel count (`width * height`).
        pixel_count: u64,
        /// EXIF orientation applied, if any.
        orientation: Option<u32>,
        /// Number of non-fatal warnings.
        warning_count: usize,
    },
    /// Edge, object and damage detection.
    Detection {
        /// Edge threshold used.
        edge_threshold: f32,
        /// Pixels on the edge mask.
        edge_pixel_count: u64,
        /// Total pixel count for computing edge density.
        total_pixel_count: u64,
        /// Objects kept.
        object_count: usize,
        /// Damage regions kept.
        damage_count: usize,
        /// Damaged share of the raster in percent.
        damage_percentage: f64,
        /// Most frequent damage type.
        dominant_damage: Option<DamageType>,
        /// Cut regions after merging.
        cut_region_count: usize,
    },
    /// Region planning and shard extraction.
    Segmentation {
        /// Strategy name.
        strategy: String,
        /// Number of shards.
        shard_count: usize,
        /// Edges in the neighbor graph.
        neighbor_pairs: usize,
        /// Highest shard priority.
        max_priority: u8,
    },
    /// Enhancement, repair, stitching and encoding.
    Restoration {
        /// Shards processed.
        shard_count: usize,
        /// Enhancement step names, each once.
        enhancements: Vec<String>,
        /// Repair records.
        repair_count: usize,
        /// Score before.
        quality_before: QualityScore,
        /// Score after.
        quality_after: QualityScore,
        /// Rounded percentage change.
        improvement: i32,
        /// Encoded output size.
        output_bytes: usize,
    },
}

impl StageMetrics {
    /// The stage these metrics describe.
    #[must_use]
    pub const fn stage(&self) -> StageId {
        match self {
            Self::Ingestion { .. } => StageId::Ingestion,
            Self::Detection { .. } => StageId::Detection,
            Self::Segmentation { .. } => StageId::Segmentation,
            Self::Restoration { .. } => StageId::Restoration,
        }
    }
}

/// Diagnostics collected from a single pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Per-stage diagnostics in stage order.
    pub stages: Vec<StageDiagnostics>,
    /// Total wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

impl PipelineDiagnostics {
    /// Timings of the recorded stages.
    #[must_use]
    pub fn timings(&self) -> StageTimings {
        let mut t = StageTimings::default();
        for s in &self.stages {
            t.set(s.metrics.stage(), s.duration);
        }
        t
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Restoration Diagnostics\n{}", "=".repeat(60)));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for diag in &self.stages {
            let name = diag.metrics.stage().title();
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
pub(crate) fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Ingestion {
            input_bytes,
            format,
            width,
            height,
            orientation,
            warning_count,
            ..
        } => {
            let orient = orientation.map_or_else(String::new, |o| format!(" orient={o}"));
            format!("{input_bytes} bytes {format} -> {width}x{height}{orient} warnings={warning_count}")
        }
        StageMetrics::Detection {
            edge_threshold,
            edge_pixel_count,
            total_pixel_count,
            object_count,
            damage_count,
            damage_percentage,
            dominant_damage,
            cut_region_count,
        } => {
            #[allow(clippy::cast_precision_loss)]
            let density = if *total_pixel_count > 0 {
                *edge_pixel_count as f64 / *total_pixel_count as f64 * 100.0
            } else {
                0.0
            };
            let dominant = dominant_damage.map_or_else(|| "none".to_string(), |d| d.to_string());
            format!(
                "t={edge_threshold:.1} edges={edge_pixel_count} ({density:.1}%) objects={object_count} damage={damage_count} ({damage_percentage:.1}%, {dominant}) cuts={cut_region_count}",
            )
        }
        StageMetrics::Segmentation {
            strategy,
            shard_count,
            neighbor_pairs,
            max_priority,
        } => {
            format!("{strategy} {shard_count} shards, {neighbor_pairs} seams, max priority {max_priority}")
        }
        StageMetrics::Restoration {
            shard_count,
            enhancements,
            repair_count,
            quality_before,
            quality_after,
            improvement,
            output_bytes,
        } => {
            format!(
                "{shard_count} shards [{}] repairs={repair_count} quality {:.1}->{:.1} ({improvement:+}%) {output_bytes} bytes",
                enhancements.join(","),
                quality_before.overall,
                quality_after.overall,
            )
        }
    }
}
