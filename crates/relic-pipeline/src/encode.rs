//! Output encoding.

use base64::Engine as _;
use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};

use crate::error::StageError;
use crate::format::ImageFormat;
use crate::types::RgbaImage;

/// Encode a raster into `format`.
///
/// PNG, WebP (lossless) and BMP keep the alpha channel. JPEG drops it
/// and uses `quality` (1–100).
///
/// # Errors
///
/// Returns [`StageError::Encode`] if the encoder fails or the format
/// cannot be written.
pub fn encode(image: &RgbaImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>, StageError> {
    let mut buf = Vec::new();
    let (w, h) = image.dimensions();
    let result = match format {
        ImageFormat::Png => {
            PngEncoder::new(&mut buf).write_image(image.as_raw(), w, h, ExtendedColorType::Rgba8)
        }
        ImageFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).write_image(
                rgb.as_raw(),
                w,
                h,
                ExtendedColorType::Rgb8,
            )
        }
        ImageFormat::WebP => {
            WebPEncoder::new_lossless(&mut buf).write_image(image.as_raw(), w, h, ExtendedColorType::Rgba8)
        }
        ImageFormat::Bmp => {
            BmpEncoder::new(&mut buf).write_image(image.as_raw(), w, h, ExtendedColorType::Rgba8)
        }
        ImageFormat::Tiff => {
            return Err(StageError::Encode(format!("{format} output is not supported")));
        }
    };
    result.map_err(|e| StageError::Encode(format!("{format}: {e}")))?;
    tracing::debug!(%format, bytes = buf.len(), "encoded output");
    Ok(buf)
}

/// `data:` URL for encoded bytes.
#[must_use]
pub fn data_url(bytes: &[u8], format: ImageFormat) -> String {
    format!(
        "data:{};base64,{}",
        format.mime(),
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use image::Rgba;

    fn sample() -> RgbaImage {
        #[allow(clippy::cast_possible_truncation)]
        RgbaImage::from_fn(16, 12, |x, y| Rgba([(x * 15) as u8, (y * 20) as u8, 90, 200]))
    }

    #[test]
    fn lossless_formats_decode_back_exactly() {
        let img = sample();
        for format in [ImageFormat::Png, ImageFormat::WebP, ImageFormat::Bmp] {
            let bytes = encode(&img, format, 92).unwrap();
            assert_eq!(ImageFormat::sniff(&bytes), Some(format));
            let back = image::load_from_memory_with_format(&bytes, format.to_image_format())
                .unwrap()
                .to_rgba8();
            assert_eq!(back, img, "{format}");
        }
    }

    #[test]
    fn jpeg_drops_alpha_and_keeps_size() {
        let bytes = encode(&sample(), ImageFormat::Jpeg, 80).unwrap();
        assert_eq!(ImageFormat::sniff(&bytes), Some(ImageFormat::Jpeg));
        let back = image::load_from_memory(&bytes).unwrap();
        assert_eq!((back.width(), back.height()), (16, 12));
        assert!(back.to_rgba8().pixels().all(|p| p.0[3] == 255));
    }

    #[test]
    fn tiff_output_is_rejected() {
        let err = encode(&sample(), ImageFormat::Tiff, 92).unwrap_err();
        assert!(matches!(err, StageError::Encode(_)));
    }

    #[test]
    fn data_url_has_mime_prefix() {
        assert_eq!(data_url(b"abc", ImageFormat::Png), "data:image/png;base64,YWJj");
        assert!(data_url(&[], ImageFormat::Jpeg).starts_with("data:image/jpeg;base64,"));
    }
}
