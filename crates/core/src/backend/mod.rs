pub mod local;
pub mod memory;
pub mod retrying;
pub mod s3;

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::error::StorageResult;
use crate::object::{ByteStream, DownloadOptions, ObjectMetadata, StorageObject, UploadOptions};

/// Reference transfer unit for streamed downloads.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Uniform contract every storage backend implements.
///
/// Expected failures (unknown object, transient I/O, bad input) come back as
/// `Err(StorageError)`; nothing here panics for them.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `name`, fully replacing any previous object.
    async fn upload_from_bytes(
        &self,
        name: &str,
        data: Bytes,
        opts: UploadOptions,
    ) -> StorageResult<()>;

    /// Consume `stream` to the end and store the result under `name`.
    ///
    /// A stream error aborts the upload; no partial object becomes visible.
    async fn upload_from_stream(
        &self,
        name: &str,
        stream: ByteStream,
        opts: UploadOptions,
    ) -> StorageResult<()>;

    async fn exists(&self, name: &str) -> StorageResult<bool>;

    /// Idempotent: deleting an unknown name succeeds.
    async fn delete(&self, name: &str) -> StorageResult<()>;

    /// Objects whose name starts with `prefix`, sorted by name.
    async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<StorageObject>>;

    async fn download_as_stream(
        &self,
        name: &str,
        opts: DownloadOptions,
    ) -> StorageResult<ByteStream>;

    /// Whole (or ranged) payload in memory; byte-identical to the stream.
    async fn download_as_buffer(&self, name: &str, opts: DownloadOptions) -> StorageResult<Bytes> {
        let stream = self.download_as_stream(name, opts).await?;
        collect_stream(stream).await
    }

    async fn get_metadata(&self, name: &str) -> StorageResult<ObjectMetadata>;

    async fn get_signed_url(&self, name: &str, expires_in: Option<Duration>)
    -> StorageResult<String>;
}

/// Drain a stream into one contiguous buffer, surfacing the first error.
pub async fn collect_stream(mut stream: ByteStream) -> StorageResult<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Lazily split `data` into `chunk_size` pieces, pausing `pause` between them.
///
/// Nothing runs until the consumer polls, so dropping the stream early
/// leaves no work behind.
pub fn chunked_stream(data: Bytes, chunk_size: usize, pause: Option<Duration>) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    let stream = futures::stream::unfold((data, 0usize), move |(data, offset)| async move {
        if offset >= data.len() {
            return None;
        }
        if offset > 0
            && let Some(pause) = pause
        {
            tokio::time::sleep(pause).await;
        }
        let end = (offset + chunk_size).min(data.len());
        let chunk = data.slice(offset..end);
        Some((Ok(chunk), (data, end)))
    });
    Box::pin(stream)
}
