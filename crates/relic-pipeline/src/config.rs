//! Pipeline configuration.
//!
//! [`PipelineConfig`] groups one section per concern. Every section
//! carries `#[serde(default)]`, so a partial JSON document such as
//! `{"segmentation": {"strategy": "grid"}}` deserializes with all other
//! fields at their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::format::ImageFormat;
use crate::inpaint::InpaintingMethod;
use crate::pipeline::StageId;
use crate::segment::SegmentStrategyKind;
use crate::stitch::StitchMode;
use crate::types::ColorSpace;

/// Complete configuration for a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// File and dimension limits.
    pub global: GlobalConfig,
    /// Stage 1 options.
    pub ingestion: IngestionConfig,
    /// Stage 2 options.
    pub detection: DetectionConfig,
    /// Stage 3 options.
    pub segmentation: SegmentationConfig,
    /// Stage 4 options.
    pub restoration: RestorationConfig,
    /// Controller options.
    pub pipeline: PipelineSettings,
}

/// File and dimension limits applied during ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Largest accepted input, in bytes.
    pub max_file_size: usize,
    /// Largest accepted decoded width.
    pub max_width: u32,
    /// Largest accepted decoded height.
    pub max_height: u32,
    /// Smallest accepted decoded width.
    pub min_width: u32,
    /// Smallest accepted decoded height.
    pub min_height: u32,
    /// Input formats accepted by validation.
    pub supported_formats: Vec<ImageFormat>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            max_width: 16_384,
            max_height: 16_384,
            min_width: 1,
            min_height: 1,
            supported_formats: ImageFormat::ALL.to_vec(),
        }
    }
}

/// Stage 1 (ingestion) options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct IngestionConfig {
    /// Warn when `target_color_space` is not sRGB. Decoded pixels are
    /// always 8-bit sRGB.
    pub normalize_color_space: bool,
    /// Read EXIF fields into the raster metadata.
    pub preserve_exif: bool,
    /// Requested working color space.
    pub target_color_space: ColorSpace,
    /// Apply the EXIF orientation tag before handing the raster on.
    pub auto_orient: bool,
    /// Trim dark scanner borders.
    pub trim_dark_borders: bool,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            normalize_color_space: true,
            preserve_exif: true,
            target_color_space: ColorSpace::Srgb,
            auto_orient: true,
            trim_dark_borders: false,
        }
    }
}

/// How the Sobel magnitude is turned into a binary edge mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeMethod {
    /// Plain magnitude threshold.
    #[default]
    Threshold,
    /// Non-max suppression and hysteresis (low = threshold / 2).
    Canny,
}

/// Stage 2 (detection) options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Sobel magnitude threshold for the edge mask.
    pub edge_threshold: f32,
    /// Smallest component area, in pixels, considered as an object.
    pub min_object_area: u32,
    /// Damage regions below this confidence are discarded.
    pub damage_confidence_threshold: f32,
    /// Render a debug overlay onto the cut map.
    pub enable_visualization: bool,
    /// Edge mask construction.
    pub edge_method: EdgeMethod,
    /// Merge overlapping cut regions.
    pub merge_cut_regions: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            edge_threshold: 100.0,
            min_object_area: 100,
            damage_confidence_threshold: 0.5,
            enable_visualization: false,
            edge_method: EdgeMethod::default(),
            merge_cut_regions: true,
        }
    }
}

/// Stage 3 (segmentation) options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Region generation strategy.
    pub strategy: SegmentStrategyKind,
    /// Base padding, in pixels, around salient boxes.
    pub padding: u32,
    /// Regions narrower or shorter than this are dropped.
    pub min_shard_size: u32,
    /// Upper bound on the number of shards.
    pub max_shards: usize,
    /// Let the grid column count follow the raster's aspect ratio.
    pub preserve_aspect_ratio: bool,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            strategy: SegmentStrategyKind::default(),
            padding: 16,
            min_shard_size: 32,
            max_shards: 16,
            preserve_aspect_ratio: true,
        }
    }
}

/// Stage 4 (restoration) options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestorationConfig {
    /// Gaussian denoise strength; `0` disables.
    pub denoise_strength: f32,
    /// Unsharp-mask amount; `0` disables.
    pub sharpen_amount: f32,
    /// Histogram-equalization blend is `boost - 1`; `<= 1` disables.
    pub contrast_boost: f32,
    /// Gray-world color-cast correction.
    pub color_correction: bool,
    /// Tile-local contrast equalization (CLAHE).
    pub local_contrast: bool,
    /// CLAHE histogram clip, as a multiple of the mean bin height.
    pub clahe_clip_limit: f32,
    /// Edge-preserving bilateral denoise, run before the Gaussian one.
    pub edge_preserving_denoise: bool,
    /// Primitive named in repair records and used by `repair_damage`.
    pub inpainting_method: InpaintingMethod,
    /// Encoded output container.
    pub output_format: ImageFormat,
    /// JPEG quality (1–100).
    pub quality: u8,
    /// Shard reassembly mode.
    pub stitch_mode: StitchMode,
    /// Feather width, in pixels, for blended stitching.
    pub blend_width: u32,
    /// Actually inpaint damage masks instead of only recording intent.
    pub repair_damage: bool,
}

impl Default for RestorationConfig {
    fn default() -> Self {
        Self {
            denoise_strength: 1.0,
            sharpen_amount: 0.5,
            contrast_boost: 1.2,
            color_correction: true,
            local_contrast: false,
            clahe_clip_limit: 2.0,
            edge_preserving_denoise: false,
            inpainting_method: InpaintingMethod::default(),
            output_format: ImageFormat::Png,
            quality: 92,
            stitch_mode: StitchMode::default(),
            blend_width: 16,
            repair_damage: false,
        }
    }
}

impl RestorationConfig {
    /// Settings under which no enhancement step is active.
    #[must_use]
    pub fn neutral() -> Self {
        Self {
            denoise_strength: 0.0,
            sharpen_amount: 0.0,
            contrast_boost: 1.0,
            color_correction: false,
            local_contrast: false,
            edge_preserving_denoise: false,
            ..Self::default()
        }
    }
}

/// Log verbosity requested for the hosting process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Stage lifecycle messages.
    #[default]
    Info,
    /// Per-stage details.
    Debug,
    /// Everything.
    Trace,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Relative share of overall progress attributed to each stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageWeights {
    /// Stage 1.
    pub ingestion: f64,
    /// Stage 2.
    pub detection: f64,
    /// Stage 3.
    pub segmentation: f64,
    /// Stage 4.
    pub restoration: f64,
}

impl Default for StageWeights {
    fn default() -> Self {
        Self {
            ingestion: 0.1,
            detection: 0.3,
            segmentation: 0.2,
            restoration: 0.4,
        }
    }
}

impl StageWeights {
    /// Weight for one stage.
    #[must_use]
    pub const fn weight(&self, stage: StageId) -> f64 {
        match stage {
            StageId::Ingestion => self.ingestion,
            StageId::Detection => self.detection,
            StageId::Segmentation => self.segmentation,
            StageId::Restoration => self.restoration,
        }
    }

    /// Sum of all four weights.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.ingestion + self.detection + self.segmentation + self.restoration
    }
}

/// Controller options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Install a log subscriber in the hosting binary.
    pub enable_logging: bool,
    /// Verbosity for that subscriber.
    pub log_level: LogLevel,
    /// Minimum spacing between stage-progress events, in milliseconds.
    pub progress_interval_ms: u64,
    /// Reserved. Stages always run sequentially.
    pub parallel_processing: bool,
    /// Overall-progress weights.
    pub stage_weights: StageWeights,
    /// Sleep between pause polls, in milliseconds.
    pub pause_poll_interval_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            enable_logging: true,
            log_level: LogLevel::default(),
            progress_interval_ms: 100,
            parallel_processing: false,
            stage_weights: StageWeights::default(),
            pause_poll_interval_ms: 50,
        }
    }
}

impl PipelineSettings {
    /// Progress throttle as a [`Duration`].
    #[must_use]
    pub const fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Pause poll sleep as a [`Duration`].
    #[must_use]
    pub const fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }
}

impl PipelineConfig {
    /// Check the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] describing the first
    /// inconsistency found.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let g = &self.global;
        if g.min_width > g.max_width || g.min_height > g.max_height {
            return Err(invalid(format!(
                "minimum dimensions {}x{} exceed maximum {}x{}",
                g.min_width, g.min_height, g.max_width, g.max_height,
            )));
        }
        if g.max_file_size == 0 {
            return Err(invalid("max_file_size must be positive"));
        }

        let d = &self.detection;
        if !d.edge_threshold.is_finite() || d.edge_threshold <= 0.0 {
            return Err(invalid(format!(
                "edge_threshold must be positive, got {}",
                d.edge_threshold,
            )));
        }
        if !(0.0..=1.0).contains(&d.damage_confidence_threshold) {
            return Err(invalid(format!(
                "damage_confidence_threshold must lie in [0, 1], got {}",
                d.damage_confidence_threshold,
            )));
        }

        let s = &self.segmentation;
        if s.max_shards == 0 {
            return Err(invalid("max_shards must be at least 1"));
        }
        if s.min_shard_size == 0 {
            return Err(invalid("min_shard_size must be at least 1"));
        }

        let r = &self.restoration;
        for (name, value) in [
            ("denoise_strength", r.denoise_strength),
            ("sharpen_amount", r.sharpen_amount),
            ("contrast_boost", r.contrast_boost),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if !r.clahe_clip_limit.is_finite() || r.clahe_clip_limit < 1.0 {
            return Err(invalid(format!(
                "clahe_clip_limit must be at least 1, got {}",
                r.clahe_clip_limit
            )));
        }
        if !(1..=100).contains(&r.quality) {
            return Err(invalid(format!(
                "quality must lie in 1..=100, got {}",
                r.quality
            )));
        }
        if r.output_format == ImageFormat::Tiff {
            return Err(invalid("tiff is not supported as an output format"));
        }

        let w = &self.pipeline.stage_weights;
        let weights = [w.ingestion, w.detection, w.segmentation, w.restoration];
        if weights.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(invalid("stage weights must be non-negative"));
        }
        if (w.total() - 1.0).abs() > 1e-3 {
            return Err(invalid(format!(
                "stage weights must sum to 1, got {:.4}",
                w.total()
            )));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::InvalidConfig(message.into())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.global.max_file_size, 52_428_800);
        assert_eq!(c.global.max_width, 16_384);
        assert_eq!(c.global.supported_formats.len(), 5);
        assert!((c.detection.edge_threshold - 100.0).abs() < f32::EPSILON);
        assert_eq!(c.detection.min_object_area, 100);
        assert_eq!(c.segmentation.strategy, SegmentStrategyKind::Adaptive);
        assert_eq!(c.segmentation.padding, 16);
        assert_eq!(c.segmentation.min_shard_size, 32);
        assert_eq!(c.segmentation.max_shards, 16);
        assert_eq!(c.restoration.inpainting_method, InpaintingMethod::PatchBased);
        assert_eq!(c.restoration.quality, 92);
        assert_eq!(c.pipeline.progress_interval(), Duration::from_millis(100));
        assert_eq!(c.pipeline.pause_poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"segmentation": {"strategy": "grid", "max_shards": 4}}"#;
        let c: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.segmentation.strategy, SegmentStrategyKind::Grid);
        assert_eq!(c.segmentation.max_shards, 4);
        assert_eq!(c.segmentation.padding, 16);
        assert_eq!(c.restoration, RestorationConfig::default());
    }

    #[test]
    fn weights_must_sum_to_one() {
        let mut c = PipelineConfig::default();
        c.pipeline.stage_weights.restoration = 0.5;
        let err = c.validate().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
        assert!(err.to_string().contains("sum to 1"));
    }

    #[test]
    fn min_above_max_rejected() {
        let mut c = PipelineConfig::default();
        c.global.min_width = 20_000;
        assert!(c.validate().is_err());
    }

    #[test]
    fn zero_shard_limits_rejected() {
        let mut c = PipelineConfig::default();
        c.segmentation.max_shards = 0;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.segmentation.min_shard_size = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn quality_out_of_range_rejected() {
        let mut c = PipelineConfig::default();
        c.restoration.quality = 0;
        assert!(c.validate().is_err());
        c.restoration.quality = 101;
        assert!(c.validate().is_err());
    }

    #[test]
    fn negative_strength_rejected() {
        let mut c = PipelineConfig::default();
        c.restoration.sharpen_amount = -0.1;
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("sharpen_amount"));
    }

    #[test]
    fn neutral_restoration_disables_every_step() {
        let r = RestorationConfig::neutral();
        assert!(r.denoise_strength <= 0.0);
        assert!(r.sharpen_amount <= 0.0);
        assert!(r.contrast_boost <= 1.0);
        assert!(!r.color_correction);
        assert!(!r.local_contrast);
        assert!(!r.edge_preserving_denoise);
    }

    #[test]
    fn clahe_clip_below_one_rejected() {
        let mut c = PipelineConfig::default();
        c.restoration.clahe_clip_limit = 0.5;
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("clahe_clip_limit"));
    }

    #[test]
    fn log_level_directives() {
        assert_eq!(LogLevel::default().as_str(), "info");
        let parsed: LogLevel = serde_json::from_str("\"debug\"").unwrap();
        assert_eq!(parsed, LogLevel::Debug);
    }
}
