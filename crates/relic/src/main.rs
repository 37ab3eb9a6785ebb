//! relic: restore a damaged photo from the command line.
//!
//! Reads an image file, runs the four-stage restoration pipeline, writes
//! the restored image and prints a restoration report with per-stage
//! diagnostics.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin relic -- [OPTIONS] <IMAGE_PATH>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use relic_pipeline::{
    Controller, EventKind, ImageFormat, IngestInput, InpaintingMethod, PipelineConfig,
    PipelineEvent, RestorationConfig, RestoredImage, SegmentStrategyKind, StitchMode,
};

/// Forensic photo restoration.
///
/// Detects stains, scratches, fading and noise, cuts the photo into
/// prioritized shards, restores each shard and stitches them back
/// together.
#[derive(Parser)]
#[command(name = "relic", version)]
struct Cli {
    /// Path to the input image (PNG, JPEG, WebP, BMP, TIFF).
    image_path: PathBuf,

    /// Where to write the restored image. Defaults to
    /// `<stem>.restored.<ext>` next to the input.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Segmentation strategy.
    #[arg(long, value_enum, default_value_t = Strategy::Adaptive)]
    strategy: Strategy,

    /// Maximum number of shards.
    #[arg(long, default_value_t = 16, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    max_shards: usize,

    /// Minimum shard edge length in pixels.
    #[arg(long, default_value_t = 32, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    min_shard_size: u32,

    /// Padding added around content-driven regions, in pixels.
    #[arg(long, default_value_t = 16)]
    padding: u32,

    /// Gradient-magnitude threshold for edge pixels.
    #[arg(long, default_value_t = 100.0)]
    edge_threshold: f32,

    /// Minimum confidence for a damage region to be kept.
    #[arg(long, default_value_t = 0.5)]
    damage_confidence: f32,

    /// Output container.
    #[arg(long, value_enum, default_value_t = Format::Png)]
    format: Format,

    /// JPEG quality (1-100).
    #[arg(long, default_value_t = 92, value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: u8,

    /// Inpaint detected damage before enhancement.
    #[arg(long)]
    repair: bool,

    /// Inpainting primitive used by `--repair`.
    #[arg(long, value_enum, default_value_t = Inpaint::PatchBased)]
    inpaint: Inpaint,

    /// Reassemble shards without seam feathering.
    #[arg(long)]
    direct_stitch: bool,

    /// Disable every enhancement step (denoise, contrast, sharpen, color).
    #[arg(long)]
    neutral: bool,

    /// Apply tile-based local contrast (CLAHE).
    #[arg(long)]
    local_contrast: bool,

    /// CLAHE clip limit, as a multiple of the mean histogram bin.
    #[arg(long, default_value_t = 2.0)]
    clahe_clip: f32,

    /// Run a bilateral filter before the Gaussian denoise.
    #[arg(long)]
    edge_preserving_denoise: bool,

    /// Print stage progress to stderr.
    #[arg(long)]
    progress: bool,

    /// Output the report as JSON instead of human-readable text.
    #[arg(long)]
    json: bool,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// Missing sections and fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,
}

/// Segmentation strategy selection.
#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    /// Padded object bounds.
    ContentAware,
    /// Padded damage bounds.
    DamageAware,
    /// Regular tiles.
    Grid,
    /// Damage, then content, then grid top-up.
    Adaptive,
    /// Faces and other high-priority objects first.
    FacePriority,
}

/// Output container selection.
#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Png,
    Jpeg,
    Webp,
    Bmp,
}

/// Inpainting primitive selection.
#[derive(Clone, Copy, ValueEnum)]
enum Inpaint {
    /// Average of known neighbors.
    NeighborAverage,
    /// Best matching undamaged patch.
    PatchBased,
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    let mut config = PipelineConfig::default();
    config.detection.edge_threshold = cli.edge_threshold;
    config.detection.damage_confidence_threshold = cli.damage_confidence;
    config.segmentation.strategy = match cli.strategy {
        Strategy::ContentAware => SegmentStrategyKind::ContentAware,
        Strategy::DamageAware => SegmentStrategyKind::DamageAware,
        Strategy::Grid => SegmentStrategyKind::Grid,
        Strategy::Adaptive => SegmentStrategyKind::Adaptive,
        Strategy::FacePriority => SegmentStrategyKind::FacePriority,
    };
    config.segmentation.max_shards = cli.max_shards;
    config.segmentation.min_shard_size = cli.min_shard_size;
    config.segmentation.padding = cli.padding;

    let base = if cli.neutral {
        RestorationConfig::neutral()
    } else {
        RestorationConfig::default()
    };
    config.restoration = RestorationConfig {
        output_format: match cli.format {
            Format::Png => ImageFormat::Png,
            Format::Jpeg => ImageFormat::Jpeg,
            Format::Webp => ImageFormat::WebP,
            Format::Bmp => ImageFormat::Bmp,
        },
        quality: cli.quality,
        repair_damage: cli.repair,
        local_contrast: cli.local_contrast,
        clahe_clip_limit: cli.clahe_clip,
        edge_preserving_denoise: cli.edge_preserving_denoise,
        inpainting_method: match cli.inpaint {
            Inpaint::NeighborAverage => InpaintingMethod::NeighborAverage,
            Inpaint::PatchBased => InpaintingMethod::PatchBased,
        },
        stitch_mode: if cli.direct_stitch {
            StitchMode::Direct
        } else {
            StitchMode::Blended
        },
        ..base
    };
    Ok(config)
}

/// Install a stderr log subscriber seeded from the configured level.
/// `RUST_LOG` overrides the level when set.
fn init_logging(config: &PipelineConfig) {
    if !config.pipeline.enable_logging {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.pipeline.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn default_output_path(input: &Path, format: ImageFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    input.with_file_name(format!("{stem}.restored.{}", format.name()))
}

fn print_report(result: &RestoredImage) {
    let report = &result.report;
    println!("Restoration report\n{}", "=".repeat(60));
    println!(
        "{:<24} {}x{} -> {}",
        "Output",
        result.width,
        result.height,
        result.metadata.output_format,
    );
    println!(
        "{:<24} {:.3} -> {:.3} ({:+}%)",
        "Quality (overall)", report.quality_before.overall, report.quality_after.overall, report.improvement,
    );
    println!(
        "{:<24} {:.1} dB -> {:.1} dB",
        "SNR", report.snr_before, report.snr_after,
    );
    let enhancements: Vec<String> = report.enhancements.iter().map(ToString::to_string).collect();
    println!(
        "{:<24} {}",
        "Enhancements",
        if enhancements.is_empty() {
            "none".to_string()
        } else {
            enhancements.join(", ")
        },
    );
    println!("{:<24} {}", "Repairs", report.repairs.len());
    for repair in &report.repairs {
        println!(
            "  #{:<4} {:<10} {:<18} {:>8} px",
            repair.damage_id.0,
            repair.damage_type.name(),
            repair.method.name(),
            repair.pixels_filled,
        );
    }
    println!();
    println!("{}", result.diagnostics.report());
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);

    let image_bytes = match std::fs::read(&cli.image_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error reading {}: {e}", cli.image_path.display());
            return ExitCode::FAILURE;
        }
    };
    let filename = cli
        .image_path
        .file_name()
        .and_then(|s| s.to_str())
        .map(str::to_string);
    let output_format = config.restoration.output_format;

    let controller = match Controller::new(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if cli.progress {
        controller.subscribe(EventKind::StageProgress, |e| {
            if let PipelineEvent::StageProgress {
                stage,
                percent,
                message,
            } = e
            {
                eprintln!("[{:<12}] {percent:>5.1}%  {message}", stage.name());
            }
            Ok(())
        });
    }

    let mut input = IngestInput::new(image_bytes);
    if let Some(name) = filename {
        input = input.with_filename(name);
    }
    let result = match controller.process(input) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Pipeline error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let output_path = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&cli.image_path, output_format));
    if let Err(e) = std::fs::write(&output_path, &result.encoded) {
        eprintln!("Error writing {}: {e}", output_path.display());
        return ExitCode::FAILURE;
    }
    eprintln!(
        "Restored image written to {} ({} bytes)",
        output_path.display(),
        result.encoded.len(),
    );

    if cli.json {
        let doc = serde_json::json!({
            "metadata": result.metadata,
            "report": result.report,
            "diagnostics": result.diagnostics,
        });
        match serde_json::to_string_pretty(&doc) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing report: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_report(&result);
    }

    ExitCode::SUCCESS
}
