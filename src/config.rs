use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Prefix of environment variables picked up by [`CacheSettings::from_env`].
pub const ENV_PREFIX: &str = "IMAGECACHE_";

pub const DEFAULT_MAX_DAYS: u64 = 365;
pub const DEFAULT_BROWSER_MAX_DAYS: u64 = 7;
pub const DEFAULT_INDEX_TTL_MINUTES: u64 = 60;
pub const DEFAULT_CDN_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_TRIM_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_TRIM_PAGE_SIZE: usize = 5000;
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_QUALITY: u8 = 85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[serde(alias = "jpg")]
    Jpeg,
    Png,
    Webp,
    Avif,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
            ImageFormat::Avif => "avif",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Avif => "image/avif",
        }
    }

    /// Detect format from a file extension, case-insensitively.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "webp" => Some(ImageFormat::Webp),
            "avif" => Some(ImageFormat::Avif),
            _ => None,
        }
    }

    /// Detect format from the extension of the last segment of a path or locator.
    pub fn from_path(path: &str) -> Option<Self> {
        let name = path.rsplit('/').next().unwrap_or(path);
        let (_, ext) = name.rsplit_once('.')?;
        Self::from_extension(ext)
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageFormat::Jpeg => write!(f, "jpeg"),
            ImageFormat::Png => write!(f, "png"),
            ImageFormat::Webp => write!(f, "webp"),
            ImageFormat::Avif => write!(f, "avif"),
        }
    }
}

/// Connection details for the cloud blob container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudSettings {
    pub endpoint: String,
    pub bucket: String,
    pub token: Option<String>,
}

impl CloudSettings {
    /// Parse a `endpoint=...;bucket=...;token=...` connection string.
    ///
    /// Keys are case-insensitive and `token` is optional.
    pub fn parse_connection_string(value: &str) -> Result<Self, ConfigError> {
        let mut endpoint = None;
        let mut bucket = None;
        let mut token = None;

        for part in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedConnectionString(part.to_string()))?;
            match k.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(v.trim().trim_end_matches('/').to_string()),
                "bucket" | "container" => bucket = Some(v.trim().to_string()),
                "token" => token = Some(v.trim().to_string()),
                other => return Err(ConfigError::MalformedConnectionString(other.to_string())),
            }
        }

        Ok(Self {
            endpoint: endpoint.ok_or(ConfigError::Missing("endpoint"))?,
            bucket: bucket.ok_or(ConfigError::Missing("bucket"))?,
            token,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSettings {
    Fs { root: PathBuf },
    Cloud(CloudSettings),
    Embedded { path: PathBuf },
}

impl BackendSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendSettings::Fs { .. } => "fs",
            BackendSettings::Cloud(_) => "cloud",
            BackendSettings::Embedded { .. } => "embedded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: BackendSettings,
    pub max_age: Duration,
    pub browser_max_days: u64,
    pub index_ttl: Duration,
    pub stream_cached_image: bool,
    pub use_cached_container_in_url: bool,
    pub cdn_root: Option<String>,
    pub public_root: String,
    pub signing_key: Option<String>,
    pub cdn_timeout: Duration,
    pub trim_cache: bool,
    pub trim_interval: Duration,
    pub trim_prefix: Option<String>,
    pub trim_page_size: usize,
    pub static_root: PathBuf,
    pub media_prefix: String,
    pub remote_prefix: String,
    pub remote_origin: Option<String>,
    pub max_source_bytes: usize,
    pub source_timeout: Duration,
    pub cors_origin: Option<String>,
    pub rate_limit_per_second: Option<u64>,
    pub rate_limit_burst: Option<u32>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: BackendSettings::Fs { root: PathBuf::from("./cache") },
            max_age: days(DEFAULT_MAX_DAYS),
            browser_max_days: DEFAULT_BROWSER_MAX_DAYS,
            index_ttl: Duration::from_secs(DEFAULT_INDEX_TTL_MINUTES * 60),
            stream_cached_image: false,
            use_cached_container_in_url: false,
            cdn_root: None,
            public_root: "/blobs".into(),
            signing_key: None,
            cdn_timeout: Duration::from_millis(DEFAULT_CDN_TIMEOUT_MS),
            trim_cache: true,
            trim_interval: Duration::from_secs(DEFAULT_TRIM_INTERVAL_SECS),
            trim_prefix: None,
            trim_page_size: DEFAULT_TRIM_PAGE_SIZE,
            static_root: PathBuf::from("./public"),
            media_prefix: "media".into(),
            remote_prefix: "remote".into(),
            remote_origin: None,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            source_timeout: Duration::from_millis(DEFAULT_SOURCE_TIMEOUT_MS),
            cors_origin: None,
            rate_limit_per_second: None,
            rate_limit_burst: None,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("setting `{key}` has invalid value `{value}`")]
    Invalid { key: String, value: String },
    #[error("unknown backend `{0}`, expected fs, cloud or embedded")]
    UnknownBackend(String),
    #[error("malformed connection string near `{0}`")]
    MalformedConnectionString(String),
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n * 86_400)
}

fn invalid(key: &str, value: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid { key: key.to_string(), value: value.to_string() }
}

/// Longest duration any setting may hold; keeps deadline arithmetic on
/// `Instant` and `OffsetDateTime` from overflowing.
const MAX_SETTING_DURATION: Duration = Duration::from_secs(100 * 365 * 86_400);

struct Reader<'a> {
    map: &'a HashMap<String, String>,
}

impl<'a> Reader<'a> {
    fn raw(&self, key: &str) -> Option<&'a str> {
        self.map
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str) -> Option<String> {
        self.raw(key).map(str::to_string)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.raw(key) {
            None => Ok(None),
            Some(v) => v.parse::<T>().map(Some).map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: v.to_string(),
            }),
        }
    }

    /// `n` units of `unit_secs` seconds; a product that overflows is invalid.
    fn seconds(&self, key: &str, unit_secs: u64) -> Result<Option<Duration>, ConfigError> {
        match self.parse::<u64>(key)? {
            None => Ok(None),
            Some(n) => n
                .checked_mul(unit_secs)
                .map(|secs| Some(Duration::from_secs(secs)))
                .ok_or_else(|| invalid(key, n)),
        }
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.raw(key).map(str::to_ascii_lowercase).as_deref() {
            None => Ok(None),
            Some("true" | "1" | "yes" | "on") => Ok(Some(true)),
            Some("false" | "0" | "no" | "off") => Ok(Some(false)),
            Some(other) => Err(ConfigError::Invalid {
                key: key.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl CacheSettings {
    /// Build settings from a key/value map. Unknown keys are ignored.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let r = Reader { map };
        let defaults = Self::default();

        let cache_path = r.string("cache_path").map(PathBuf::from);
        let backend = match r.raw("backend").map(str::to_ascii_lowercase).as_deref() {
            None | Some("fs") | Some("file") => BackendSettings::Fs {
                root: cache_path.unwrap_or_else(|| PathBuf::from("./cache")),
            },
            Some("embedded") | Some("sled") => BackendSettings::Embedded {
                path: cache_path.unwrap_or_else(|| PathBuf::from("./cache.sled")),
            },
            Some("cloud") => {
                let cloud = match r.raw("connection_string") {
                    Some(cs) => CloudSettings::parse_connection_string(cs)?,
                    None => CloudSettings {
                        endpoint: r
                            .string("cloud_endpoint")
                            .ok_or(ConfigError::Missing("cloud_endpoint"))?
                            .trim_end_matches('/')
                            .to_string(),
                        bucket: r.string("cloud_bucket").ok_or(ConfigError::Missing("cloud_bucket"))?,
                        token: r.string("cloud_token"),
                    },
                };
                BackendSettings::Cloud(cloud)
            }
            Some(other) => return Err(ConfigError::UnknownBackend(other.to_string())),
        };

        let public_root = match (&backend, r.string("public_root")) {
            (_, Some(root)) => root.trim_end_matches('/').to_string(),
            (BackendSettings::Cloud(c), None) => format!("{}/{}", c.endpoint, c.bucket),
            (_, None) => defaults.public_root.clone(),
        };

        let settings = Self {
            backend,
            max_age: r.seconds("max_days", 86_400)?.unwrap_or(defaults.max_age),
            browser_max_days: r.parse("browser_max_days")?.unwrap_or(defaults.browser_max_days),
            index_ttl: r.seconds("index_ttl_minutes", 60)?.unwrap_or(defaults.index_ttl),
            stream_cached_image: r.flag("stream_cached_image")?.unwrap_or(false),
            use_cached_container_in_url: r.flag("use_cached_container_in_url")?.unwrap_or(false),
            cdn_root: r.string("cdn_root").map(|s| s.trim_end_matches('/').to_string()),
            public_root,
            signing_key: r.string("signing_key"),
            cdn_timeout: r
                .parse::<u64>("cdn_timeout_ms")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.cdn_timeout),
            trim_cache: r.flag("trim_cache")?.unwrap_or(defaults.trim_cache),
            trim_interval: r.seconds("trim_interval_secs", 1)?.unwrap_or(defaults.trim_interval),
            trim_prefix: r.string("trim_prefix"),
            trim_page_size: r.parse("trim_page_size")?.unwrap_or(defaults.trim_page_size),
            static_root: r.string("static_root").map(PathBuf::from).unwrap_or(defaults.static_root),
            media_prefix: r
                .string("media_prefix")
                .map(|s| s.trim_matches('/').to_string())
                .unwrap_or(defaults.media_prefix),
            remote_prefix: r
                .string("remote_prefix")
                .map(|s| s.trim_matches('/').to_string())
                .unwrap_or(defaults.remote_prefix),
            remote_origin: r.string("remote_origin").map(|s| s.trim_end_matches('/').to_string()),
            max_source_bytes: r.parse("max_source_bytes")?.unwrap_or(defaults.max_source_bytes),
            source_timeout: r
                .parse::<u64>("source_timeout_ms")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.source_timeout),
            cors_origin: r.string("cors_origin"),
            rate_limit_per_second: r.parse("rate_limit_per_second")?,
            rate_limit_burst: r.parse("rate_limit_burst")?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Collect `IMAGECACHE_*` environment variables, lower-cased without the prefix.
    pub fn from_env() -> Result<Self, ConfigError> {
        let map = std::env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix(ENV_PREFIX).map(|rest| (rest.to_ascii_lowercase(), v))
            })
            .collect::<HashMap<_, _>>();
        Self::from_map(&map)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("max_days", self.max_age),
            ("index_ttl_minutes", self.index_ttl),
            ("trim_interval_secs", self.trim_interval),
            ("cdn_timeout_ms", self.cdn_timeout),
            ("source_timeout_ms", self.source_timeout),
        ];
        for (key, value) in durations {
            if value > MAX_SETTING_DURATION {
                return Err(invalid(key, format!("{}s", value.as_secs())));
            }
        }
        let browser_max_age = self.browser_max_days.checked_mul(86_400).map(Duration::from_secs);
        if browser_max_age.map_or(true, |age| age > MAX_SETTING_DURATION) {
            return Err(invalid("browser_max_days", self.browser_max_days));
        }
        if self.trim_cache && self.trim_interval.is_zero() {
            return Err(invalid("trim_interval_secs", 0));
        }
        if self.trim_page_size == 0 {
            return Err(ConfigError::Invalid { key: "trim_page_size".into(), value: "0".into() });
        }
        if self.max_source_bytes == 0 {
            return Err(ConfigError::Invalid { key: "max_source_bytes".into(), value: "0".into() });
        }
        if let Some(key) = &self.signing_key {
            if key.trim().is_empty() {
                return Err(ConfigError::Missing("signing_key"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_from_empty_map() {
        let s = CacheSettings::from_map(&HashMap::new()).unwrap();
        assert_eq!(s.backend.kind(), "fs");
        assert_eq!(s.max_age, Duration::from_secs(365 * 86_400));
        assert_eq!(s.cdn_timeout, Duration::from_millis(1000));
        assert_eq!(s.public_root, "/blobs");
        assert!(!s.stream_cached_image);
    }

    #[test]
    fn cloud_from_connection_string() {
        let s = CacheSettings::from_map(&map(&[
            ("backend", "cloud"),
            ("connection_string", "Endpoint=https://blobs.example.com/;Bucket=media;Token=abc"),
            ("stream_cached_image", "TRUE"),
        ]))
        .unwrap();
        assert_eq!(
            s.backend,
            BackendSettings::Cloud(CloudSettings {
                endpoint: "https://blobs.example.com".into(),
                bucket: "media".into(),
                token: Some("abc".into()),
            })
        );
        assert_eq!(s.public_root, "https://blobs.example.com/media");
        assert!(s.stream_cached_image);
    }

    #[test]
    fn cloud_without_bucket_is_fatal() {
        let err = CacheSettings::from_map(&map(&[
            ("backend", "cloud"),
            ("cloud_endpoint", "https://blobs.example.com"),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing("cloud_bucket"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            CacheSettings::from_map(&map(&[("max_days", "soon")])),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            CacheSettings::from_map(&map(&[("trim_cache", "maybe")])),
            Err(ConfigError::Invalid { .. })
        ));
        assert_eq!(
            CacheSettings::from_map(&map(&[("backend", "ftp")])).unwrap_err(),
            ConfigError::UnknownBackend("ftp".into())
        );
        assert!(matches!(
            CloudSettings::parse_connection_string("endpoint"),
            Err(ConfigError::MalformedConnectionString(_))
        ));
    }

    #[test]
    fn oversized_durations_are_rejected() {
        for (key, value) in [
            ("max_days", "300000000000000"),
            ("max_days", "40000"),
            ("index_ttl_minutes", "300000000000000000"),
            ("trim_interval_secs", "18446744073709551615"),
            ("browser_max_days", "300000000000000"),
            ("cdn_timeout_ms", "18446744073709551615"),
        ] {
            match CacheSettings::from_map(&map(&[(key, value)])) {
                Err(ConfigError::Invalid { key: rejected, .. }) => assert_eq!(rejected, key),
                other => panic!("{key}={value} gave {other:?}"),
            }
        }
    }

    #[test]
    fn zero_trim_interval_is_rejected_when_trimming() {
        assert!(CacheSettings::from_map(&map(&[("trim_interval_secs", "0")])).is_err());
        assert!(CacheSettings::from_map(&map(&[("trim_interval_secs", "0"), ("trim_cache", "false")])).is_ok());
    }

    #[test]
    fn format_from_path() {
        assert_eq!(ImageFormat::from_path("/images/photo.JPG"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_path("a.b/photo"), None);
        assert_eq!(ImageFormat::from_path("x/y.webp"), Some(ImageFormat::Webp));
    }
}
