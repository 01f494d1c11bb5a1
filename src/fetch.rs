use crate::ImageCacheError;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use image::GenericImageView;
use mime::Mime;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Download a remote source image.
///
/// Checks run in order: status, `Content-Type`, declared `Content-Length`,
/// streamed size (the header may lie), then a decode with a dimension check.
/// A 404 upstream becomes [`ImageCacheError::NotFound`].
pub async fn fetch_source(
    client: &Client,
    url: &str,
    max_size: usize,
    timeout: Duration,
) -> Result<(Bytes, String), ImageCacheError> {
    let resp = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ImageCacheError::NetworkError(e.to_string()))?;

    if resp.status() == StatusCode::NOT_FOUND {
        return Err(ImageCacheError::NotFound(url.to_string()));
    }
    if !resp.status().is_success() {
        return Err(ImageCacheError::NetworkError(format!("Upstream status: {}", resp.status())));
    }

    let ct = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if let Ok(m) = ct.parse::<Mime>() {
        if m.type_() != mime::IMAGE {
            return Err(ImageCacheError::InvalidArgument("Source is not an image".into()));
        }
    }

    if let Some(len) = resp.content_length() {
        if len as usize > max_size {
            return Err(ImageCacheError::InvalidArgument("Input exceeds size limit".into()));
        }
    }

    let mut buf = BytesMut::with_capacity(8192);
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream
        .next()
        .await
        .transpose()
        .map_err(|e| ImageCacheError::NetworkError(e.to_string()))?
    {
        if buf.len() + chunk.len() > max_size {
            return Err(ImageCacheError::InvalidArgument("Input exceeds size limit".into()));
        }
        buf.extend_from_slice(&chunk);
    }

    let bytes = buf.freeze();
    validate_image(&bytes)?;
    Ok((bytes, ct))
}

/// Reject data that does not decode or has a zero dimension.
pub fn validate_image(bytes: &[u8]) -> Result<(), ImageCacheError> {
    let img = image::guess_format(bytes)
        .ok()
        .and_then(|fmt| image::load_from_memory_with_format(bytes, fmt).ok())
        .ok_or_else(|| ImageCacheError::InvalidArgument("Unable to decode image for validation".into()))?;
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(ImageCacheError::InvalidArgument("Invalid image dimensions".into()));
    }
    Ok(())
}
