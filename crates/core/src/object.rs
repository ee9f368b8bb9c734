use std::collections::BTreeMap;
use std::ops::Range;
use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Ordered byte chunks flowing into an upload or out of a download.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Directory-listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageObject {
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub size: u64,
    pub content_type: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ObjectMetadata {
    pub fn to_listing(&self, name: &str) -> StorageObject {
        StorageObject {
            name: name.to_string(),
            size: self.size,
            last_modified: self.last_modified,
            etag: self.etag.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl UploadOptions {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Inclusive byte range. A missing `end` means "through the last byte".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn starting_at(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Resolve against an object of `size` bytes into a half-open index range.
    ///
    /// `end` past the last byte is clamped to `size - 1`.
    pub fn resolve(&self, size: u64) -> StorageResult<Range<u64>> {
        if let Some(end) = self.end
            && self.start > end
        {
            return Err(StorageError::InvalidRange {
                start: self.start,
                end,
                size,
            });
        }
        if self.start >= size {
            return Err(StorageError::InvalidRange {
                start: self.start,
                end: self.end.unwrap_or(size.saturating_sub(1)),
                size,
            });
        }
        let last = self.end.map_or(size - 1, |end| end.min(size - 1));
        Ok(self.start..last + 1)
    }
}

impl std::str::FromStr for ByteRange {
    type Err = StorageError;

    /// Parses `start-end` or `start-`.
    fn from_str(s: &str) -> StorageResult<Self> {
        let invalid = || StorageError::InvalidConfig(format!("malformed byte range: {s}"));
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end = match end.trim() {
            "" => None,
            end => Some(end.parse::<u64>().map_err(|_| invalid())?),
        };
        Ok(Self { start, end })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    pub range: Option<ByteRange>,
}

impl DownloadOptions {
    pub fn range(range: ByteRange) -> Self {
        Self { range: Some(range) }
    }

    /// Half-open slice of an object of `size` bytes that this download covers.
    pub fn resolve(&self, size: u64) -> StorageResult<Range<u64>> {
        match self.range {
            Some(range) => range.resolve(size),
            None => Ok(0..size),
        }
    }
}

/// Rejects names no backend can hold: empty, or containing NUL.
pub fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::InvalidName("name must not be empty".into()));
    }
    if name.contains('\0') {
        return Err(StorageError::InvalidName(format!(
            "name contains a NUL byte: {name:?}"
        )));
    }
    Ok(())
}

/// Content fingerprint: changes whenever the stored bytes change.
pub fn compute_etag(data: &[u8]) -> String {
    let mut hasher = EtagHasher::new();
    hasher.update(data);
    hasher.finish()
}

/// Incremental form of [`compute_etag`] for payloads that arrive in pieces.
#[derive(Debug, Default)]
pub struct EtagHasher {
    hasher: blake3::Hasher,
    len: u64,
}

impl EtagHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    pub fn finish(mut self) -> String {
        self.hasher.update(&self.len.to_le_bytes());
        hex::encode(&self.hasher.finalize().as_bytes()[..16])
    }
}
