//! In-process object store that behaves like a network backend.
//!
//! Every call waits out a configurable latency and may fail at random, and
//! downloads arrive as a sequence of fixed-size chunks. Use it anywhere a real
//! store would be too slow or too reliable for the code under test.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{DEFAULT_CHUNK_SIZE, ObjectStore, chunked_stream};
use crate::error::{StorageError, StorageResult};
use crate::object::{
    ByteStream, DownloadOptions, ObjectMetadata, StorageObject, UploadOptions, compute_etag,
    validate_name,
};
use crate::signing::{DEFAULT_URL_EXPIRY, UrlSigner};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Delay awaited at the start of every operation.
    pub simulated_latency_ms: u64,
    /// Probability in `[0, 1]` that any single call fails.
    pub failure_rate: f64,
    pub chunk_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            simulated_latency_ms: 0,
            failure_rate: 0.0,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> StorageResult<()> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(StorageError::InvalidConfig(format!(
                "failure_rate must be within [0, 1], got {}",
                self.failure_rate
            )));
        }
        if self.chunk_size == 0 {
            return Err(StorageError::InvalidConfig(
                "chunk_size must be positive".into(),
            ));
        }
        Ok(())
    }

    fn latency(&self) -> Option<Duration> {
        (self.simulated_latency_ms > 0).then(|| Duration::from_millis(self.simulated_latency_ms))
    }

    /// Pause between streamed chunks: a tenth of the latency, at least 1ms.
    fn chunk_pause(&self) -> Option<Duration> {
        self.latency()
            .map(|latency| (latency / 10).max(Duration::from_millis(1)))
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    meta: ObjectMetadata,
}

/// The object map behind one or more [`MemoryStore`]s.
///
/// Stores built on the same state see each other's writes; stores built on
/// separate states are fully isolated.
#[derive(Debug, Default)]
pub struct MemoryState {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.objects.write().await.clear();
    }
}

pub struct MemoryStore {
    state: Arc<MemoryState>,
    config: MemoryConfig,
    signer: UrlSigner,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            state: MemoryState::new(),
            config: MemoryConfig::default(),
            signer: UrlSigner::random("memory"),
        }
    }
}

impl MemoryStore {
    pub fn new(config: MemoryConfig) -> StorageResult<Self> {
        Self::with_state(MemoryState::new(), config)
    }

    pub fn with_state(state: Arc<MemoryState>, config: MemoryConfig) -> StorageResult<Self> {
        config.validate()?;
        Ok(Self {
            state,
            config,
            signer: UrlSigner::random("memory"),
        })
    }

    pub fn state(&self) -> Arc<MemoryState> {
        Arc::clone(&self.state)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Name embedded in a URL previously issued by this store, if still valid.
    pub fn verify_signed_url(&self, url: &str) -> StorageResult<String> {
        self.signer.verify(url, Utc::now())
    }

    /// Network emulation shared by every operation: latency, then fault draw.
    async fn simulate(&self, operation: &'static str) -> StorageResult<()> {
        if let Some(latency) = self.config.latency() {
            tokio::time::sleep(latency).await;
        }
        if self.config.failure_rate > 0.0 && rand::random::<f64>() < self.config.failure_rate {
            warn!(operation, "injecting simulated failure");
            return Err(StorageError::Simulated { operation });
        }
        Ok(())
    }

    async fn lookup(&self, name: &str) -> StorageResult<StoredObject> {
        self.state
            .objects
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn peek_size(&self, name: &str) -> Option<u64> {
        self.state
            .objects
            .read()
            .await
            .get(name)
            .map(|obj| obj.data.len() as u64)
    }

    async fn commit(&self, name: &str, data: Bytes, opts: UploadOptions) {
        let meta = ObjectMetadata {
            size: data.len() as u64,
            content_type: opts.content_type,
            last_modified: Utc::now(),
            etag: compute_etag(&data),
            metadata: opts.metadata,
        };
        debug!(name, size = meta.size, etag = %meta.etag, "object committed");
        self.state
            .objects
            .write()
            .await
            .insert(name.to_string(), StoredObject { data, meta });
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn upload_from_bytes(
        &self,
        name: &str,
        data: Bytes,
        opts: UploadOptions,
    ) -> StorageResult<()> {
        validate_name(name)?;
        self.simulate("upload").await?;
        self.commit(name, data, opts).await;
        Ok(())
    }

    async fn upload_from_stream(
        &self,
        name: &str,
        mut stream: ByteStream,
        opts: UploadOptions,
    ) -> StorageResult<()> {
        validate_name(name)?;
        self.simulate("upload").await?;

        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(err) => {
                    warn!(name, received = buf.len(), error = %err, "upload stream failed, discarding");
                    return Err(err);
                }
            }
        }
        self.commit(name, buf.freeze(), opts).await;
        Ok(())
    }

    async fn exists(&self, name: &str) -> StorageResult<bool> {
        self.simulate("exists").await?;
        Ok(self.state.objects.read().await.contains_key(name))
    }

    async fn delete(&self, name: &str) -> StorageResult<()> {
        self.simulate("delete").await?;
        let removed = self.state.objects.write().await.remove(name).is_some();
        debug!(name, removed, "delete");
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<StorageObject>> {
        self.simulate("list").await?;
        let objects = self.state.objects.read().await;
        let prefix = prefix.unwrap_or("");
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, obj)| obj.meta.to_listing(name))
            .collect())
    }

    async fn download_as_stream(
        &self,
        name: &str,
        opts: DownloadOptions,
    ) -> StorageResult<ByteStream> {
        // Malformed ranges fail before latency and fault injection. Without a
        // stored object only the shape of the range can be checked.
        let size = self.peek_size(name).await.unwrap_or(u64::MAX);
        opts.resolve(size)?;

        self.simulate("download").await?;
        let obj = self.lookup(name).await?;
        let range = opts.resolve(obj.data.len() as u64)?;
        let slice = obj.data.slice(range.start as usize..range.end as usize);
        debug!(name, start = range.start, end = range.end, "streaming download");
        Ok(chunked_stream(
            slice,
            self.config.chunk_size,
            self.config.chunk_pause(),
        ))
    }

    async fn get_metadata(&self, name: &str) -> StorageResult<ObjectMetadata> {
        self.simulate("metadata").await?;
        Ok(self.lookup(name).await?.meta)
    }

    async fn get_signed_url(
        &self,
        name: &str,
        expires_in: Option<Duration>,
    ) -> StorageResult<String> {
        self.simulate("signed URL").await?;
        if !self.state.objects.read().await.contains_key(name) {
            return Err(StorageError::NotFound(name.to_string()));
        }
        Ok(self
            .signer
            .sign(name, expires_in.unwrap_or(DEFAULT_URL_EXPIRY), Utc::now()))
    }
}
