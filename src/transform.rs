pub mod params;

pub use params::{is_transform_query, ResizeMode, TransformParams};

use crate::config::ImageFormat;
use crate::ImageCacheError;
use bytes::Bytes;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, Rgba, RgbaImage};

/// Decodes raw image bytes, returning the detected format when it is one we
/// can also write.
pub fn decode_image(bytes: &[u8]) -> Result<(DynamicImage, Option<ImageFormat>), ImageCacheError> {
    let guessed = image::guess_format(bytes).map_err(|e| ImageCacheError::TransformError(e.to_string()))?;

    let img = image::load_from_memory_with_format(bytes, guessed)
        .map_err(|e| ImageCacheError::TransformError(e.to_string()))?;

    let fmt = match guessed {
        image::ImageFormat::WebP => Some(ImageFormat::Webp),
        image::ImageFormat::Jpeg => Some(ImageFormat::Jpeg),
        image::ImageFormat::Png => Some(ImageFormat::Png),
        image::ImageFormat::Avif => Some(ImageFormat::Avif),
        _ => None,
    };

    Ok((img, fmt))
}

/// Resize according to `mode`.
///
/// With a single dimension the other one follows the aspect ratio and the
/// mode does not matter. With neither the image is returned unchanged.
/// Lanczos3 throughout.
pub fn resize_image(img: DynamicImage, w: Option<u32>, h: Option<u32>, mode: ResizeMode) -> DynamicImage {
    let (orig_w, orig_h) = img.dimensions();
    let (target_w, target_h) = match (w, h) {
        (None, None) => return img,
        (Some(w), None) => (w, (orig_h as f32 * w as f32 / orig_w as f32).round() as u32),
        (None, Some(h)) => ((orig_w as f32 * h as f32 / orig_h as f32).round() as u32, h),
        (Some(w), Some(h)) => (w, h),
    };
    let (target_w, target_h) = (target_w.max(1), target_h.max(1));

    if w.is_none() || h.is_none() {
        return img.resize_exact(target_w, target_h, FilterType::Lanczos3);
    }

    match mode {
        ResizeMode::Max => img.resize(target_w, target_h, FilterType::Lanczos3),
        ResizeMode::Crop => img.resize_to_fill(target_w, target_h, FilterType::Lanczos3),
        ResizeMode::Pad => {
            let fitted = img.resize(target_w, target_h, FilterType::Lanczos3).to_rgba8();
            let mut canvas = RgbaImage::from_pixel(target_w, target_h, Rgba([255, 255, 255, 0]));
            let x = (target_w - fitted.width()) / 2;
            let y = (target_h - fitted.height()) / 2;
            image::imageops::overlay(&mut canvas, &fitted, x as i64, y as i64);
            DynamicImage::ImageRgba8(canvas)
        }
    }
}

/// Encodes an image; quality is clamped to 1-100 and ignored for PNG.
pub fn encode_image(img: &DynamicImage, fmt: ImageFormat, quality: u8) -> Result<Vec<u8>, ImageCacheError> {
    let mut out = Vec::new();
    let q = quality.clamp(1, 100);

    match fmt {
        ImageFormat::Jpeg => {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            JpegEncoder::new_with_quality(&mut out, q)
                .write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
                .map_err(|e| ImageCacheError::TransformError(e.to_string()))?;
        }
        ImageFormat::Png => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            PngEncoder::new(&mut out)
                .write_image(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| ImageCacheError::TransformError(e.to_string()))?;
        }
        ImageFormat::Webp => {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            let encoded = webp::Encoder::from_rgb(rgb.as_raw(), w, h).encode(q as f32);
            out.extend_from_slice(&encoded);
        }
        ImageFormat::Avif => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            // Speed 4 balances encoding time and compression ratio
            AvifEncoder::new_with_speed_quality(&mut out, 4, q)
                .write_image(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| ImageCacheError::TransformError(e.to_string()))?;
        }
    }

    Ok(out)
}

/// Run the whole pipeline: decode, resize, encode.
///
/// `hint` is the format implied by the request path, used when the query
/// does not name one.
pub fn process(
    bytes: &[u8],
    params: &TransformParams,
    hint: Option<ImageFormat>,
) -> Result<(Bytes, ImageFormat), ImageCacheError> {
    let (img, detected) = decode_image(bytes)?;
    let resized = resize_image(img, params.width, params.height, params.mode());
    let format = params.output_format(hint.or(detected));
    let encoded = encode_image(&resized, format, params.quality())?;
    Ok((Bytes::from(encoded), format))
}
