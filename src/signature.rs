use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

/// Signed URLs become valid this long before they are issued.
pub const CLOCK_SKEW_SECS: i64 = 5 * 60;
/// How long a signed URL stays valid after it is issued.
pub const SIGNED_URL_TTL_SECS: i64 = 15 * 60;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature")] Missing,
    #[error("invalid signature")] Invalid,
    #[error("expired")] Expired,
}

// Canonical string: path, newline, start, newline, expiry
fn canonical_string(path: &str, start: i64, expires: i64) -> String {
    format!("{}\n{}\n{}", path, start, expires)
}

fn mac_hex(secret: &str, canonical: &str) -> Result<String, SignatureError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Invalid)?;
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Issues time-limited signed links to cached artifacts.
#[derive(Clone)]
pub struct UrlSigner {
    secret: String,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// Sign `url` for the standard window starting now.
    pub fn sign(&self, url: &str) -> Result<String, SignatureError> {
        self.sign_at(url, OffsetDateTime::now_utc())
    }

    /// Sign `url` as if issued at `now`.
    ///
    /// Only the path part takes part in the signature, so a URL on another
    /// host verifies against the path the blob route sees.
    pub fn sign_at(&self, url: &str, now: OffsetDateTime) -> Result<String, SignatureError> {
        let start = now.unix_timestamp() - CLOCK_SKEW_SECS;
        let expires = now.unix_timestamp() + SIGNED_URL_TTL_SECS;
        let sig = mac_hex(&self.secret, &canonical_string(signed_path(url), start, expires))?;
        let sep = if url.contains('?') { '&' } else { '?' };
        Ok(format!("{url}{sep}st={start}&se={expires}&sig={sig}"))
    }

    pub fn verify(&self, path: &str, st: Option<i64>, se: Option<i64>, sig: Option<&str>) -> Result<(), SignatureError> {
        verify_signature(path, st, se, sig, &self.secret, OffsetDateTime::now_utc())
    }
}

/// Strip scheme, authority and query from a URL.
fn signed_path(url: &str) -> &str {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest);
    let path = match without_scheme {
        Some(rest) => rest.find('/').map(|i| &rest[i..]).unwrap_or("/"),
        None => url,
    };
    path.split('?').next().unwrap_or(path)
}

/// Check a signature issued by [`UrlSigner`] for `path` at time `now`.
pub fn verify_signature(
    path: &str,
    st: Option<i64>,
    se: Option<i64>,
    sig: Option<&str>,
    secret: &str,
    now: OffsetDateTime,
) -> Result<(), SignatureError> {
    let sig = sig.filter(|s| !s.is_empty()).ok_or(SignatureError::Missing)?;
    let (Some(start), Some(expires)) = (st, se) else {
        return Err(SignatureError::Missing);
    };

    let expected = mac_hex(secret, &canonical_string(path, start, expires))?;
    if expected != sig {
        return Err(SignatureError::Invalid);
    }

    let now = now.unix_timestamp();
    if now < start || now > expires {
        return Err(SignatureError::Expired);
    }
    Ok(())
}
