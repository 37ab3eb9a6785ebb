//! Stage 1: file validation, decoding and metadata extraction.
//!
//! [`validate_file`] runs before any stage starts and decides the
//! container format. [`ingest`] then decodes the bytes into a
//! [`Raster`], optionally applies EXIF orientation and dark-border
//! trimming, and checks the decoded dimensions.

use std::io::Cursor;

use image::imageops;
use serde::{Deserialize, Serialize};

use crate::config::{GlobalConfig, PipelineConfig};
use crate::error::{StageError, ValidationError};
use crate::format::ImageFormat;
use crate::grayscale::channel_mean;
use crate::types::{ColorSpace, ExifData, Raster, RasterMetadata, Rect, RgbaImage, Size};

/// Pixel count above which a warning is recorded.
pub const LARGE_IMAGE_PIXELS: u64 = 100_000_000;

/// Progress checkpoints reported by [`ingest`], in percent.
pub const CHECKPOINTS: [f64; 9] = [0.0, 10.0, 20.0, 30.0, 50.0, 60.0, 70.0, 90.0, 100.0];

/// Raw input to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestInput {
    /// Encoded image bytes.
    pub bytes: Vec<u8>,
    /// Original filename, used for the extension check and reported in
    /// the output metadata.
    pub filename: Option<String>,
}

impl IngestInput {
    /// Input without a filename hint.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            filename: None,
        }
    }

    /// Attach a filename hint.
    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// Outcome of a successful [`validate_file`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCheck {
    /// Resolved container format.
    pub format: ImageFormat,
    /// Non-fatal observations.
    pub warnings: Vec<String>,
}

/// File-level validation: emptiness, size ceiling and format.
///
/// The format is taken from the filename extension and corroborated by
/// magic-byte sniffing. When only one of the two is conclusive it wins.
/// When both are conclusive and disagree, the sniffed format wins and a
/// warning is recorded.
///
/// # Errors
///
/// Returns the collected [`ValidationError`] when any fatal check
/// fails.
pub fn validate_file(
    input: &IngestInput,
    global: &GlobalConfig,
) -> Result<FileCheck, ValidationError> {
    let mut report = ValidationError::default();

    if input.bytes.is_empty() {
        report.error("file is empty");
    }
    if input.bytes.len() > global.max_file_size {
        report.error(format!(
            "file size {} bytes exceeds the maximum of {} bytes",
            input.bytes.len(),
            global.max_file_size,
        ));
    }

    let from_extension = match input.filename.as_deref() {
        Some(name) if std::path::Path::new(name).extension().is_some() => {
            let ext = ImageFormat::from_filename(name);
            if ext.is_none() {
                report.error(format!("unsupported file extension: {name}"));
            }
            ext
        }
        _ => None,
    };
    let sniffed = ImageFormat::sniff(&input.bytes);

    let format = match (from_extension, sniffed) {
        (Some(ext), Some(sniff)) if ext != sniff => {
            report.warn(format!(
                "file extension says {ext} but content looks like {sniff}; using {sniff}"
            ));
            Some(sniff)
        }
        (Some(ext), _) => Some(ext),
        (None, Some(sniff)) => Some(sniff),
        (None, None) => {
            if report.errors.is_empty() {
                report.error("unrecognized image format");
            }
            None
        }
    };

    if let Some(format) = format {
        if !global.supported_formats.contains(&format) {
            report.error(format!("format {format} is not in the supported list"));
        }
    }

    match (format, report.into_result()) {
        (Some(format), Ok(warnings)) => Ok(FileCheck { format, warnings }),
        (_, Err(report)) => Err(report),
        (None, Ok(warnings)) => Err(ValidationError {
            errors: vec!["unrecognized image format".to_string()],
            warnings,
        }),
    }
}

/// Decoded-dimension checks against the configured bounds.
#[must_use]
pub fn validate_dimensions(size: Size, global: &GlobalConfig) -> ValidationError {
    let mut report = ValidationError::default();
    if size.width > global.max_width || size.height > global.max_height {
        report.error(format!(
            "image is {}x{}, larger than the maximum {}x{}",
            size.width, size.height, global.max_width, global.max_height,
        ));
    }
    if size.width < global.min_width || size.height < global.min_height {
        report.error(format!(
            "image is {}x{}, smaller than the minimum {}x{}",
            size.width, size.height, global.min_width, global.min_height,
        ));
    }
    if size.area() > LARGE_IMAGE_PIXELS {
        report.warn(format!(
            "image has {} pixels; processing may be slow",
            size.area()
        ));
    }
    report
}

/// Output of stage 1.
#[derive(Debug, Clone)]
pub struct Ingestion {
    /// The decoded raster.
    pub raster: Raster,
    /// Warnings from file and dimension validation.
    pub warnings: Vec<String>,
    /// EXIF orientation that was applied, if any.
    pub orientation_applied: Option<u32>,
    /// Region kept after dark-border trimming, in pre-trim coordinates.
    pub trimmed: Option<Rect>,
}

/// Run stage 1 on bytes that already passed [`validate_file`].
///
/// # Errors
///
/// Returns [`StageError::Decode`] for malformed bytes and
/// [`StageError::Validation`] when decoded dimensions are out of
/// bounds.
#[tracing::instrument(skip_all, fields(bytes = input.bytes.len(), format = %check.format))]
pub fn ingest(
    input: &IngestInput,
    check: &FileCheck,
    config: &PipelineConfig,
    progress: &mut dyn FnMut(f64, &str),
) -> Result<Ingestion, StageError> {
    let [p0, p10, p20, p30, p50, p60, p70, p90, p100] = CHECKPOINTS;
    let mut warnings = check.warnings.clone();

    progress(p0, "validating file");
    progress(p10, "file validated");

    progress(p20, "decoding image");
    let decoded =
        image::load_from_memory_with_format(&input.bytes, check.format.to_image_format())?;
    let mut pixels = decoded.to_rgba8();
    progress(p30, "image decoded");

    let ing = &config.ingestion;
    let exif = if ing.preserve_exif || ing.auto_orient {
        read_exif(&input.bytes)
    } else {
        None
    };

    progress(p50, "applying orientation");
    let orientation_applied = match exif.as_ref().and_then(|e| e.orientation) {
        Some(o) if ing.auto_orient && (2..=8).contains(&o) => {
            pixels = apply_orientation(&pixels, o);
            tracing::debug!(orientation = o, "applied EXIF orientation");
            Some(o)
        }
        _ => None,
    };

    progress(p60, "validating dimensions");
    let mut dims = validate_dimensions(Size::new(pixels.width(), pixels.height()), &config.global);
    if !dims.is_valid() {
        return Err(StageError::Validation(dims));
    }
    warnings.append(&mut dims.warnings);

    progress(p70, "extracting metadata");
    let trimmed = if ing.trim_dark_borders {
        let (cropped, kept) = trim_dark_borders(&pixels);
        let changed = kept != Rect::full(Size::new(pixels.width(), pixels.height()));
        pixels = cropped;
        changed.then_some(kept)
    } else {
        None
    };
    if ing.normalize_color_space && ing.target_color_space != ColorSpace::Srgb {
        warnings.push(format!(
            "color space {} requested but pixels are decoded as srgb",
            ing.target_color_space.name()
        ));
    }
    let metadata = RasterMetadata {
        format: check.format,
        file_size: input.bytes.len(),
        color_space: ColorSpace::Srgb,
        bit_depth: 8,
        has_alpha: check.format.supports_alpha(),
        exif: exif.filter(|_| ing.preserve_exif),
    };

    progress(p90, "finalizing raster");
    for w in &warnings {
        tracing::warn!("{w}");
    }
    let raster = Raster::new(pixels, metadata);
    tracing::info!(
        width = raster.width(),
        height = raster.height(),
        "ingestion complete"
    );
    progress(p100, "ingestion complete");

    Ok(Ingestion {
        raster,
        warnings,
        orientation_applied,
        trimmed,
    })
}

/// Read EXIF fields from an encoded image. Returns `None` when the
/// container carries no readable EXIF block.
#[must_use]
pub fn read_exif(bytes: &[u8]) -> Option<ExifData> {
    let mut cursor = Cursor::new(bytes);
    let parsed = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(error = %e, "no EXIF data");
            return None;
        }
    };

    let ascii = |tag: exif::Tag| {
        let field = parsed.get_field(tag, exif::In::PRIMARY)?;
        match &field.value {
            exif::Value::Ascii(parts) => parts
                .first()
                .map(|s| String::from_utf8_lossy(s).trim().to_string()),
            _ => None,
        }
    };

    let fields = parsed
        .fields()
        .filter(|f| f.ifd_num == exif::In::PRIMARY)
        .map(|f| {
            (
                f.tag.to_string(),
                f.display_value().with_unit(&parsed).to_string(),
            )
        })
        .collect();

    Some(ExifData {
        orientation: parsed
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|f| f.value.get_uint(0)),
        make: ascii(exif::Tag::Make),
        model: ascii(exif::Tag::Model),
        date_time: ascii(exif::Tag::DateTimeOriginal).or_else(|| ascii(exif::Tag::DateTime)),
        fields,
    })
}

/// Apply an EXIF orientation value (1–8). Unknown values return the
/// image unchanged.
#[must_use = "returns the oriented image"]
pub fn apply_orientation(image: &RgbaImage, orientation: u32) -> RgbaImage {
    match orientation {
        2 => imageops::flip_horizontal(image),
        3 => imageops::rotate180(image),
        4 => imageops::flip_vertical(image),
        5 => imageops::flip_horizontal(&imageops::rotate90(image)),
        6 => imageops::rotate90(image),
        7 => imageops::flip_horizontal(&imageops::rotate270(image)),
        8 => imageops::rotate270(image),
        _ => image.clone(),
    }
}

/// Largest share of a dimension trimmed from one side.
const TRIM_MAX_FRACTION: f64 = 0.08;
/// Share of dark pixels that makes a row or column a border.
const TRIM_DARK_SHARE: f64 = 0.55;
/// Channel mean below which a pixel counts as dark.
const TRIM_DARK_LEVEL: f32 = 60.0;
/// Images smaller than this in either dimension are not trimmed.
const TRIM_MIN_DIMENSION: u32 = 20;

/// Trim dark scanner borders.
///
/// Returns the cropped image and the kept region in input coordinates.
#[must_use]
pub fn trim_dark_borders(image: &RgbaImage) -> (RgbaImage, Rect) {
    let (w, h) = image.dimensions();
    let full = Rect::new(0, 0, w, h);
    if w < TRIM_MIN_DIMENSION || h < TRIM_MIN_DIMENSION {
        return (image.clone(), full);
    }

    let dark_share = |pixels: &mut dyn Iterator<Item = &image::Rgba<u8>>| {
        let (mut dark, mut total) = (0u32, 0u32);
        for p in pixels {
            total += 1;
            dark += u32::from(channel_mean(p) < TRIM_DARK_LEVEL);
        }
        f64::from(dark) / f64::from(total.max(1))
    };
    let row_dark = |y: u32| dark_share(&mut (0..w).map(|x| image.get_pixel(x, y)));
    let col_dark = |x: u32| dark_share(&mut (0..h).map(|y| image.get_pixel(x, y)));

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let max_x = (f64::from(w) * TRIM_MAX_FRACTION) as u32;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let max_y = (f64::from(h) * TRIM_MAX_FRACTION) as u32;

    let count = |max: u32, dark: &dyn Fn(u32) -> f64| {
        (0..max)
            .find(|&i| dark(i) < TRIM_DARK_SHARE)
            .unwrap_or(max)
    };
    let top = count(max_y, &row_dark);
    let bottom = count(max_y, &|i| row_dark(h - 1 - i));
    let left = count(max_x, &col_dark);
    let right = count(max_x, &|i| col_dark(w - 1 - i));

    let kept = Rect::new(left, top, w - left - right, h - top - bottom);
    (crate::types::crop_rgba(image, kept), kept)
}
