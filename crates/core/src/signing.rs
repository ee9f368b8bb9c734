use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{StorageError, StorageResult};

pub const DEFAULT_URL_EXPIRY: Duration = Duration::from_secs(3600);

/// Issues and checks time-limited access URLs for backends without a native
/// presigning mechanism.
#[derive(Clone)]
pub struct UrlSigner {
    scheme: &'static str,
    key: [u8; 32],
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(scheme: &'static str, key: [u8; 32]) -> Self {
        Self { scheme, key }
    }

    /// Signer with a fresh random key; URLs are only valid for this instance.
    pub fn random(scheme: &'static str) -> Self {
        Self::new(scheme, rand::random())
    }

    pub fn sign(&self, name: &str, expires_in: Duration, now: DateTime<Utc>) -> String {
        let lifetime = i64::try_from(expires_in.as_secs()).unwrap_or(i64::MAX);
        let expires_at = now.timestamp().saturating_add(lifetime);
        let signature = self.signature(name, expires_at);
        format!(
            "{}://{}?expires={expires_at}&signature={signature}",
            self.scheme,
            encode_name(name)
        )
    }

    /// Returns the object name embedded in a valid, unexpired URL.
    pub fn verify(&self, url: &str, now: DateTime<Utc>) -> StorageResult<String> {
        let rejected = |reason: &str| StorageError::Backend(format!("signed URL rejected: {reason}"));

        let rest = url
            .strip_prefix(self.scheme)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| rejected("wrong scheme"))?;
        let (encoded, query) = rest.split_once('?').ok_or_else(|| rejected("missing query"))?;
        let name = decode_name(encoded).ok_or_else(|| rejected("malformed name"))?;

        let mut expires_at = None;
        let mut signature = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", value)) => expires_at = value.parse::<i64>().ok(),
                Some(("signature", value)) => signature = Some(value),
                _ => {}
            }
        }
        let expires_at = expires_at.ok_or_else(|| rejected("missing expiry"))?;
        let signature = signature.ok_or_else(|| rejected("missing signature"))?;

        if self.signature(&name, expires_at) != signature {
            return Err(rejected("bad signature"));
        }
        if expires_at <= now.timestamp() {
            return Err(rejected("expired"));
        }
        Ok(name)
    }

    fn signature(&self, name: &str, expires_at: i64) -> String {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        hasher.update(&expires_at.to_le_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Percent-encode everything outside the unreserved set, keeping `/`.
fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~/".contains(&byte) {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push_str(&hex::encode_upper([byte]));
        }
    }
    out
}

fn decode_name(encoded: &str) -> Option<String> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut bytes = encoded.bytes();
    while let Some(byte) = bytes.next() {
        if byte == b'%' {
            let pair = [bytes.next()?, bytes.next()?];
            out.extend(hex::decode(pair).ok()?);
        } else {
            out.push(byte);
        }
    }
    String::from_utf8(out).ok()
}
