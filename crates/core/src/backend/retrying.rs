use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::ObjectStore;
use crate::error::StorageResult;
use crate::object::{ByteStream, DownloadOptions, ObjectMetadata, StorageObject, UploadOptions};
use crate::retry::{RetryConfig, with_retry};

/// Runs every call on the inner store through [`with_retry`].
///
/// Stream uploads cannot be replayed and get a single attempt. Stream
/// downloads retry opening the stream only; a failure mid-stream reaches the
/// consumer as a stream error.
pub struct RetryingStore<S> {
    inner: S,
    config: RetryConfig,
}

impl<S: ObjectStore> RetryingStore<S> {
    pub fn new(inner: S, config: RetryConfig) -> StorageResult<Self> {
        config.validate()?;
        Ok(Self { inner, config })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for RetryingStore<S> {
    async fn upload_from_bytes(
        &self,
        name: &str,
        data: Bytes,
        opts: UploadOptions,
    ) -> StorageResult<()> {
        with_retry(
            || self.inner.upload_from_bytes(name, data.clone(), opts.clone()),
            &self.config,
            Some("upload"),
        )
        .await
    }

    async fn upload_from_stream(
        &self,
        name: &str,
        stream: ByteStream,
        opts: UploadOptions,
    ) -> StorageResult<()> {
        self.inner.upload_from_stream(name, stream, opts).await
    }

    async fn exists(&self, name: &str) -> StorageResult<bool> {
        with_retry(|| self.inner.exists(name), &self.config, Some("exists")).await
    }

    async fn delete(&self, name: &str) -> StorageResult<()> {
        with_retry(|| self.inner.delete(name), &self.config, Some("delete")).await
    }

    async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<StorageObject>> {
        with_retry(|| self.inner.list(prefix), &self.config, Some("list")).await
    }

    async fn download_as_stream(
        &self,
        name: &str,
        opts: DownloadOptions,
    ) -> StorageResult<ByteStream> {
        with_retry(
            || self.inner.download_as_stream(name, opts),
            &self.config,
            Some("download"),
        )
        .await
    }

    async fn download_as_buffer(&self, name: &str, opts: DownloadOptions) -> StorageResult<Bytes> {
        with_retry(
            || self.inner.download_as_buffer(name, opts),
            &self.config,
            Some("download"),
        )
        .await
    }

    async fn get_metadata(&self, name: &str) -> StorageResult<ObjectMetadata> {
        with_retry(|| self.inner.get_metadata(name), &self.config, Some("metadata")).await
    }

    async fn get_signed_url(
        &self,
        name: &str,
        expires_in: Option<Duration>,
    ) -> StorageResult<String> {
        with_retry(
            || self.inner.get_signed_url(name, expires_in),
            &self.config,
            Some("signed URL"),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::backend::memory::{MemoryConfig, MemoryStore};
    use crate::error::{SIMULATED_CODE, StorageError};

    /// Fails the first `failures` calls to `exists` with a connection reset.
    struct Flaky {
        inner: MemoryStore,
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStore::default(),
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for Flaky {
        async fn upload_from_bytes(
            &self,
            name: &str,
            data: Bytes,
            opts: UploadOptions,
        ) -> StorageResult<()> {
            self.inner.upload_from_bytes(name, data, opts).await
        }

        async fn upload_from_stream(
            &self,
            name: &str,
            stream: ByteStream,
            opts: UploadOptions,
        ) -> StorageResult<()> {
            self.inner.upload_from_stream(name, stream, opts).await
        }

        async fn exists(&self, name: &str) -> StorageResult<bool> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset).into());
            }
            self.inner.exists(name).await
        }

        async fn delete(&self, name: &str) -> StorageResult<()> {
            self.inner.delete(name).await
        }

        async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<StorageObject>> {
            self.inner.list(prefix).await
        }

        async fn download_as_stream(
            &self,
            name: &str,
            opts: DownloadOptions,
        ) -> StorageResult<ByteStream> {
            self.inner.download_as_stream(name, opts).await
        }

        async fn get_metadata(&self, name: &str) -> StorageResult<ObjectMetadata> {
            self.inner.get_metadata(name).await
        }

        async fn get_signed_url(
            &self,
            name: &str,
            expires_in: Option<Duration>,
        ) -> StorageResult<String> {
            self.inner.get_signed_url(name, expires_in).await
        }
    }

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 10,
            max_delay_ms: 40,
            ..RetryConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_absorbed() {
        let store = RetryingStore::new(Flaky::new(2), config(3)).unwrap();
        assert!(!store.exists("doc").await.unwrap());
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_the_last_error() {
        let store = RetryingStore::new(Flaky::new(10), config(3)).unwrap();
        let err = store.exists("doc").await.unwrap_err();
        assert_eq!(err.code(), Some("ConnectionReset"));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_not_retried() {
        let store = RetryingStore::new(MemoryStore::default(), config(5)).unwrap();
        let err = store.get_metadata("missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_faults_can_be_retried_through() {
        let memory = MemoryStore::new(MemoryConfig {
            failure_rate: 1.0,
            ..MemoryConfig::default()
        })
        .unwrap();
        let store =
            RetryingStore::new(memory, config(4).with_retryable_code(SIMULATED_CODE)).unwrap();

        let started = tokio::time::Instant::now();
        let err = store
            .upload_from_bytes("doc", Bytes::from_static(b"x"), UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Simulated { .. }));
        // 10 + 20 + 40 between four attempts.
        assert_eq!(started.elapsed(), Duration::from_millis(70));
    }

    #[tokio::test]
    async fn invalid_retry_config_is_rejected() {
        let bad = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert!(RetryingStore::new(MemoryStore::default(), bad).is_err());
    }

    #[tokio::test]
    async fn passes_data_through() {
        let store = RetryingStore::new(MemoryStore::default(), config(3)).unwrap();
        store
            .upload_from_bytes("doc", Bytes::from_static(b"payload"), UploadOptions::default())
            .await
            .unwrap();
        let back = store
            .download_as_buffer("doc", DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(back, Bytes::from_static(b"payload"));
        assert_eq!(store.list(None).await.unwrap().len(), 1);
    }
}
