use crate::config::{ImageFormat, DEFAULT_QUALITY};
use crate::ImageCacheError;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Largest width or height a request may ask for.
pub const MAX_DIMENSION: u32 = 4096;

/// Query keys that turn a request into a transform request.
pub const TRANSFORM_KEYS: &[&str] = &["width", "height", "format", "quality", "mode"];

/// How the image is fitted into the requested box.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    /// Fit inside the box, keeping the aspect ratio.
    #[default]
    Max,
    /// Fill the box and crop the overflow around the center.
    Crop,
    /// Fit inside the box and pad the rest.
    Pad,
}

impl fmt::Display for ResizeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResizeMode::Max => write!(f, "max"),
            ResizeMode::Crop => write!(f, "crop"),
            ResizeMode::Pad => write!(f, "pad"),
        }
    }
}

/// Parameters for image transformation parsed from URL query parameters
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct TransformParams {
    #[serde(default)]
    pub width: Option<u32>,

    #[serde(default)]
    pub height: Option<u32>,

    #[serde(default)]
    pub format: Option<ImageFormat>,

    /// 1-100
    #[serde(default)]
    pub quality: Option<u8>,

    #[serde(default)]
    pub mode: Option<ResizeMode>,
}

impl FromStr for TransformParams {
    type Err = serde_urlencoded::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_urlencoded::from_str(s)
    }
}

impl TransformParams {
    /// Parse and validate a query string.
    pub fn parse(query: &str) -> Result<Self, ImageCacheError> {
        let params = Self::from_str(query).map_err(|e| ImageCacheError::InvalidArgument(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ImageCacheError> {
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if let Some(v) = value {
                if v == 0 || v > MAX_DIMENSION {
                    return Err(ImageCacheError::InvalidArgument(format!(
                        "{} must be between 1 and {}",
                        name, MAX_DIMENSION
                    )));
                }
            }
        }
        if let Some(q) = self.quality {
            if q == 0 || q > 100 {
                return Err(ImageCacheError::InvalidArgument("Invalid quality".into()));
            }
        }
        Ok(())
    }

    pub fn quality(&self) -> u8 {
        self.quality.unwrap_or(DEFAULT_QUALITY)
    }

    pub fn mode(&self) -> ResizeMode {
        self.mode.unwrap_or_default()
    }

    /// Requested format, else the source's, else JPEG.
    pub fn output_format(&self, source: Option<ImageFormat>) -> ImageFormat {
        self.format.or(source).unwrap_or(ImageFormat::Jpeg)
    }
}

/// True when the query string carries at least one transform key.
pub fn is_transform_query(query: &str) -> bool {
    serde_urlencoded::from_str::<Vec<(String, String)>>(query)
        .map(|pairs| pairs.iter().any(|(k, _)| TRANSFORM_KEYS.contains(&k.as_str())))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_keys() {
        let p = TransformParams::parse("width=800&height=600&format=webp&quality=80&mode=crop&utm=x").unwrap();
        assert_eq!(p.width, Some(800));
        assert_eq!(p.height, Some(600));
        assert_eq!(p.format, Some(ImageFormat::Webp));
        assert_eq!(p.quality(), 80);
        assert_eq!(p.mode(), ResizeMode::Crop);
    }

    #[test]
    fn defaults() {
        let p = TransformParams::parse("width=10").unwrap();
        assert_eq!(p.quality(), DEFAULT_QUALITY);
        assert_eq!(p.mode(), ResizeMode::Max);
        assert_eq!(p.output_format(Some(ImageFormat::Png)), ImageFormat::Png);
        assert_eq!(p.output_format(None), ImageFormat::Jpeg);
        assert_eq!(TransformParams::parse("format=jpg").unwrap().format, Some(ImageFormat::Jpeg));
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(TransformParams::parse("quality=150").is_err());
        assert!(TransformParams::parse("width=0").is_err());
        assert!(TransformParams::parse("height=100000").is_err());
        assert!(TransformParams::parse("width=abc").is_err());
        assert!(TransformParams::parse("mode=stretch").is_err());
    }

    #[test]
    fn detects_transform_queries() {
        assert!(is_transform_query("width=200"));
        assert!(is_transform_query("v=3&mode=pad"));
        assert!(!is_transform_query("v=3"));
        assert!(!is_transform_query(""));
    }
}
