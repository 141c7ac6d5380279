use common::error::AppError;
use image::{
    codecs::{
        jpeg::JpegEncoder,
        png::{CompressionType, FilterType, PngEncoder},
        webp::WebPEncoder,
    },
    DynamicImage, ImageError, ImageFormat,
};

fn image_format(mime_type: &str) -> Option<ImageFormat> {
    match mime_type {
        "image/jpeg" => Some(ImageFormat::Jpeg),
        "image/png" => Some(ImageFormat::Png),
        "image/webp" => Some(ImageFormat::WebP),
        "image/avif" => Some(ImageFormat::Avif),
        _ => None,
    }
}

/// zlib effort for a quality value: 100 maps to 0, 1 maps to 9.
pub fn png_level(quality: u8) -> u8 {
    let quality = f64::from(quality.clamp(1, 100));
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let level = ((1.0 - quality / 100.0) * 9.0).round() as u8;
    level.min(9)
}

fn png_compression(level: u8) -> CompressionType {
    match level {
        0..=2 => CompressionType::Fast,
        3..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

fn codec_error(err: ImageError) -> AppError {
    match err {
        ImageError::Unsupported(inner) => AppError::Validation(inner.to_string()),
        other => AppError::Codec(other.to_string()),
    }
}

/// Re-encodes an image in its own format at the requested quality.
///
/// WebP output is lossless, the encoder takes no quality setting. AVIF needs the
/// `avif-native` feature.
pub fn compress_image(input: &[u8], mime_type: &str, quality: u8) -> Result<Vec<u8>, AppError> {
    let format =
        image_format(mime_type).ok_or_else(|| AppError::InvalidFileType(mime_type.to_string()))?;
    let quality = quality.clamp(1, 100);

    if format == ImageFormat::Avif && cfg!(not(feature = "avif-native")) {
        return Err(AppError::Validation(
            "AVIF support is not enabled in this build".to_string(),
        ));
    }

    let decoded = image::load_from_memory_with_format(input, format).map_err(codec_error)?;
    let mut output = Vec::with_capacity(input.len() / 2);

    match format {
        ImageFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut output, quality);
            DynamicImage::ImageRgb8(decoded.to_rgb8())
                .write_with_encoder(encoder)
                .map_err(codec_error)?;
        }
        ImageFormat::Png => {
            let encoder = PngEncoder::new_with_quality(
                &mut output,
                png_compression(png_level(quality)),
                FilterType::Adaptive,
            );
            decoded.write_with_encoder(encoder).map_err(codec_error)?;
        }
        ImageFormat::WebP => {
            let encoder = WebPEncoder::new_lossless(&mut output);
            DynamicImage::ImageRgba8(decoded.to_rgba8())
                .write_with_encoder(encoder)
                .map_err(codec_error)?;
        }
        #[cfg(feature = "avif-native")]
        ImageFormat::Avif => {
            let encoder =
                image::codecs::avif::AvifEncoder::new_with_speed_quality(&mut output, 6, quality);
            DynamicImage::ImageRgba8(decoded.to_rgba8())
                .write_with_encoder(encoder)
                .map_err(codec_error)?;
        }
        _ => return Err(AppError::InvalidFileType(mime_type.to_string())),
    }

    Ok(output)
}
