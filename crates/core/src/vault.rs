use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::backend::ObjectStore;
use crate::error::{StorageError, StorageResult};
use crate::object::{ByteRange, ByteStream, DownloadOptions, StorageObject, UploadOptions};

const PROBE_PREFIX: &str = ".docvault-probe";
const PROBE_SIZE: usize = 256 * 1024;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const CACHE_CONTROL: &str = "private, no-cache";

pub const META_FILENAME: &str = "original-filename";
pub const META_ENTITY: &str = "entity-id";
pub const META_UPLOADED_AT: &str = "uploaded-at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub name: String,
    pub size: u64,
    pub etag: String,
}

/// Response headers for a download, known before the first body byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadHeaders {
    pub content_type: String,
    pub content_length: u64,
    pub filename: String,
    pub etag: String,
    pub cache_control: &'static str,
}

impl DownloadHeaders {
    pub fn content_disposition(&self) -> String {
        let escaped = self.filename.replace('\\', "\\\\").replace('"', "\\\"");
        format!("attachment; filename=\"{escaped}\"")
    }
}

pub struct DocumentDownload {
    pub headers: DownloadHeaders,
    pub body: ByteStream,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub probe: String,
    pub bytes: u64,
    pub errors: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Document-level storage used by the upload and download handlers.
///
/// Every write is confirmed with an existence check before it is reported as
/// stored, and downloads resolve their headers before the body is handed out.
pub struct DocumentVault {
    store: Arc<dyn ObjectStore>,
}

impl DocumentVault {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Collision-free object name for a document belonging to `entity_id`.
    pub fn object_name(entity_id: &str, filename: &str) -> StorageResult<String> {
        if entity_id.is_empty() || entity_id.contains('/') || entity_id.contains('\0') {
            return Err(StorageError::InvalidName(format!(
                "entity id {entity_id:?} must be non-empty and free of '/'"
            )));
        }
        Ok(format!(
            "{entity_id}/{}-{}",
            uuid::Uuid::new_v4(),
            sanitize_filename(filename)
        ))
    }

    pub async fn store_document(
        &self,
        entity_id: &str,
        filename: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> StorageResult<StoredDocument> {
        let name = Self::object_name(entity_id, filename)?;
        let opts = upload_options(entity_id, filename, content_type);
        self.store.upload_from_bytes(&name, data, opts).await?;
        self.confirm(name).await
    }

    pub async fn store_document_stream(
        &self,
        entity_id: &str,
        filename: &str,
        body: ByteStream,
        content_type: Option<&str>,
    ) -> StorageResult<StoredDocument> {
        let name = Self::object_name(entity_id, filename)?;
        let opts = upload_options(entity_id, filename, content_type);
        self.store.upload_from_stream(&name, body, opts).await?;
        self.confirm(name).await
    }

    async fn confirm(&self, name: String) -> StorageResult<StoredDocument> {
        if !self.store.exists(&name).await? {
            warn!(name = %name, "upload acknowledged but object missing");
            return Err(StorageError::UploadNotVisible(name));
        }
        let meta = self.store.get_metadata(&name).await?;
        info!(name = %name, size = meta.size, "document stored");
        Ok(StoredDocument {
            name,
            size: meta.size,
            etag: meta.etag,
        })
    }

    pub async fn open_document(
        &self,
        name: &str,
        range: Option<ByteRange>,
    ) -> StorageResult<DocumentDownload> {
        let meta = self.store.get_metadata(name).await?;
        let opts = DownloadOptions { range };
        let span = opts.resolve(meta.size)?;
        let body = self.store.download_as_stream(name, opts).await?;

        let filename = meta
            .metadata
            .get(META_FILENAME)
            .cloned()
            .unwrap_or_else(|| sanitize_filename(name));
        let headers = DownloadHeaders {
            content_type: meta
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            content_length: span.end - span.start,
            filename,
            etag: meta.etag,
            cache_control: CACHE_CONTROL,
        };
        Ok(DocumentDownload { headers, body })
    }

    pub async fn remove_document(&self, name: &str) -> StorageResult<()> {
        self.store.delete(name).await?;
        info!(name, "document removed");
        Ok(())
    }

    pub async fn list_documents(&self, entity_id: &str) -> StorageResult<Vec<StorageObject>> {
        self.store.list(Some(&format!("{entity_id}/"))).await
    }

    /// Write, read back and delete a probe object, recording every mismatch.
    ///
    /// Failures after the upload are recorded rather than returned, and the
    /// probe is always deleted.
    pub async fn verify_roundtrip(&self) -> StorageResult<VerifyReport> {
        let probe = format!("{PROBE_PREFIX}/{}", uuid::Uuid::new_v4());
        let payload: Bytes = (0..PROBE_SIZE)
            .map(|_| rand::random::<u8>())
            .collect::<Vec<_>>()
            .into();
        let mut report = VerifyReport {
            probe: probe.clone(),
            bytes: payload.len() as u64,
            errors: Vec::new(),
        };

        match self
            .store
            .upload_from_bytes(&probe, payload.clone(), UploadOptions::default())
            .await
        {
            Ok(()) => self.check_probe(&probe, &payload, &mut report).await,
            Err(e) => report.errors.push(format!("upload failed: {e}")),
        }

        match self.store.delete(&probe).await {
            Ok(()) => match self.store.exists(&probe).await {
                Ok(false) => {}
                Ok(true) => report.errors.push("probe still visible after delete".into()),
                Err(e) => report.errors.push(format!("existence check after delete failed: {e}")),
            },
            Err(e) => {
                warn!(probe = %probe, error = %e, "probe cleanup failed");
                report.errors.push(format!("delete failed: {e}"));
            }
        }

        info!(probe = %probe, ok = report.is_ok(), "round-trip verification finished");
        Ok(report)
    }

    async fn check_probe(&self, probe: &str, payload: &Bytes, report: &mut VerifyReport) {
        match self.store.exists(probe).await {
            Ok(true) => {}
            Ok(false) => report.errors.push("probe not visible after upload".into()),
            Err(e) => report.errors.push(format!("existence check failed: {e}")),
        }

        match self
            .store
            .download_as_buffer(probe, DownloadOptions::default())
            .await
        {
            Ok(buffered) if buffered == *payload => {}
            Ok(buffered) => report
                .errors
                .push(format!("buffered download differs ({} bytes back)", buffered.len())),
            Err(e) => report.errors.push(format!("buffered download failed: {e}")),
        }

        match self
            .store
            .download_as_stream(probe, DownloadOptions::default())
            .await
        {
            Ok(mut stream) => {
                let mut streamed = BytesMut::with_capacity(payload.len());
                let mut chunks = 0usize;
                let mut failed = false;
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(chunk) => {
                            streamed.extend_from_slice(&chunk);
                            chunks += 1;
                        }
                        Err(e) => {
                            report
                                .errors
                                .push(format!("stream failed after {chunks} chunks: {e}"));
                            failed = true;
                            break;
                        }
                    }
                }
                if !failed && streamed[..] != payload[..] {
                    report
                        .errors
                        .push(format!("streamed download differs ({} bytes back)", streamed.len()));
                }
                debug!(probe, chunks, "probe streamed");
            }
            Err(e) => report.errors.push(format!("stream download failed: {e}")),
        }

        let tail = ByteRange::new(payload.len() as u64 - 100, payload.len() as u64 - 1);
        match self
            .store
            .download_as_buffer(probe, DownloadOptions::range(tail))
            .await
        {
            Ok(ranged) if ranged == payload.slice(payload.len() - 100..) => {}
            Ok(_) => report.errors.push("ranged download differs".into()),
            Err(e) => report.errors.push(format!("ranged download failed: {e}")),
        }
    }
}

fn upload_options(entity_id: &str, filename: &str, content_type: Option<&str>) -> UploadOptions {
    let mut opts = UploadOptions::default()
        .with_metadata(META_FILENAME, sanitize_filename(filename))
        .with_metadata(META_ENTITY, entity_id)
        .with_metadata(META_UPLOADED_AT, Utc::now().to_rfc3339());
    opts.content_type = content_type.map(str::to_string);
    opts
}

/// Final path component with control characters removed.
fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();
    let base = base.trim();
    if base.is_empty() || base == "." || base == ".." {
        "document".to_string()
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::collect_stream;
    use crate::backend::memory::{MemoryConfig, MemoryStore};
    use crate::object::ObjectMetadata;
    use async_trait::async_trait;
    use std::time::Duration;

    fn vault() -> DocumentVault {
        DocumentVault::new(Arc::new(MemoryStore::default()))
    }

    #[test]
    fn object_names_are_unique_and_scoped() {
        let a = DocumentVault::object_name("case-17", "../../etc/report.pdf").unwrap();
        let b = DocumentVault::object_name("case-17", "report.pdf").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("case-17/"));
        assert!(a.ends_with("-report.pdf"));
        assert!(!a.contains(".."));
        assert!(DocumentVault::object_name("", "x").is_err());
        assert!(DocumentVault::object_name("a/b", "x").is_err());
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("C:\\Users\\qa\\scan.tiff"), "scan.tiff");
        assert_eq!(sanitize_filename("dir/"), "document");
        assert_eq!(sanitize_filename("bad\nname.pdf"), "badname.pdf");
        assert_eq!(sanitize_filename(".."), "document");
    }

    #[tokio::test]
    async fn store_then_open_document() {
        let vault = vault();
        let body = Bytes::from_static(b"%PDF-1.7 signed");
        let stored = vault
            .store_document("case-1", "signed.pdf", body.clone(), Some("application/pdf"))
            .await
            .unwrap();
        assert_eq!(stored.size, body.len() as u64);

        let download = vault.open_document(&stored.name, None).await.unwrap();
        assert_eq!(download.headers.content_type, "application/pdf");
        assert_eq!(download.headers.content_length, body.len() as u64);
        assert_eq!(download.headers.filename, "signed.pdf");
        assert_eq!(download.headers.etag, stored.etag);
        assert_eq!(
            download.headers.content_disposition(),
            "attachment; filename=\"signed.pdf\""
        );
        assert_eq!(collect_stream(download.body).await.unwrap(), body);
    }

    #[tokio::test]
    async fn ranged_open_reports_range_length() {
        let vault = vault();
        let stored = vault
            .store_document("case-1", "data.bin", Bytes::from(vec![9u8; 1000]), None)
            .await
            .unwrap();
        let download = vault
            .open_document(&stored.name, Some(ByteRange::new(100, 199)))
            .await
            .unwrap();
        assert_eq!(download.headers.content_length, 100);
        assert_eq!(download.headers.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(collect_stream(download.body).await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn stream_upload_is_confirmed() {
        let vault = vault();
        let parts: Vec<StorageResult<Bytes>> =
            vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))];
        let stored = vault
            .store_document_stream("case-2", "ab.txt", Box::pin(futures::stream::iter(parts)), None)
            .await
            .unwrap();
        assert_eq!(stored.size, 2);
        assert_eq!(vault.list_documents("case-2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let vault = vault();
        let err = vault.open_document("case-9/nothing", None).await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_and_remove_documents() {
        let vault = vault();
        let first = vault
            .store_document("case-3", "a.pdf", Bytes::from_static(b"a"), None)
            .await
            .unwrap();
        vault
            .store_document("case-3", "b.pdf", Bytes::from_static(b"b"), None)
            .await
            .unwrap();
        vault
            .store_document("case-30", "c.pdf", Bytes::from_static(b"c"), None)
            .await
            .unwrap();

        assert_eq!(vault.list_documents("case-3").await.unwrap().len(), 2);
        vault.remove_document(&first.name).await.unwrap();
        vault.remove_document(&first.name).await.unwrap();
        assert_eq!(vault.list_documents("case-3").await.unwrap().len(), 1);
    }

    /// Acknowledges writes without keeping them.
    struct Blackhole;

    #[async_trait]
    impl ObjectStore for Blackhole {
        async fn upload_from_bytes(&self, _: &str, _: Bytes, _: UploadOptions) -> StorageResult<()> {
            Ok(())
        }

        async fn upload_from_stream(
            &self,
            _: &str,
            _: ByteStream,
            _: UploadOptions,
        ) -> StorageResult<()> {
            Ok(())
        }

        async fn exists(&self, _: &str) -> StorageResult<bool> {
            Ok(false)
        }

        async fn delete(&self, _: &str) -> StorageResult<()> {
            Ok(())
        }

        async fn list(&self, _: Option<&str>) -> StorageResult<Vec<StorageObject>> {
            Ok(Vec::new())
        }

        async fn download_as_stream(
            &self,
            name: &str,
            _: DownloadOptions,
        ) -> StorageResult<ByteStream> {
            Err(StorageError::NotFound(name.to_string()))
        }

        async fn get_metadata(&self, name: &str) -> StorageResult<ObjectMetadata> {
            Err(StorageError::NotFound(name.to_string()))
        }

        async fn get_signed_url(&self, name: &str, _: Option<Duration>) -> StorageResult<String> {
            Err(StorageError::NotFound(name.to_string()))
        }
    }

    #[tokio::test]
    async fn invisible_upload_is_reported() {
        let vault = DocumentVault::new(Arc::new(Blackhole));
        let err = vault
            .store_document("case-4", "lost.pdf", Bytes::from_static(b"x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UploadNotVisible(_)));
    }

    /// Memory store whose downloads always fail.
    struct UnreadableStore(MemoryStore);

    #[async_trait]
    impl ObjectStore for UnreadableStore {
        async fn upload_from_bytes(
            &self,
            name: &str,
            data: Bytes,
            opts: UploadOptions,
        ) -> StorageResult<()> {
            self.0.upload_from_bytes(name, data, opts).await
        }

        async fn upload_from_stream(
            &self,
            name: &str,
            stream: ByteStream,
            opts: UploadOptions,
        ) -> StorageResult<()> {
            self.0.upload_from_stream(name, stream, opts).await
        }

        async fn exists(&self, name: &str) -> StorageResult<bool> {
            self.0.exists(name).await
        }

        async fn delete(&self, name: &str) -> StorageResult<()> {
            self.0.delete(name).await
        }

        async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<StorageObject>> {
            self.0.list(prefix).await
        }

        async fn download_as_stream(
            &self,
            _: &str,
            _: DownloadOptions,
        ) -> StorageResult<ByteStream> {
            Err(StorageError::Transient {
                code: "ECONNRESET".into(),
                message: "connection reset by peer".into(),
            })
        }

        async fn get_metadata(&self, name: &str) -> StorageResult<ObjectMetadata> {
            self.0.get_metadata(name).await
        }

        async fn get_signed_url(&self, name: &str, ttl: Option<Duration>) -> StorageResult<String> {
            self.0.get_signed_url(name, ttl).await
        }
    }

    #[tokio::test]
    async fn failed_verification_still_removes_its_object() {
        let inner = MemoryStore::default();
        let state = inner.state();
        let vault = DocumentVault::new(Arc::new(UnreadableStore(inner)));

        let report = vault.verify_roundtrip().await.unwrap();
        assert!(!report.is_ok());
        assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
        assert!(report.errors.iter().all(|e| e.contains("connection reset")));
        assert!(state.is_empty().await);
    }

    #[tokio::test]
    async fn verify_roundtrip_passes_on_memory_store() {
        let store = MemoryStore::new(MemoryConfig {
            chunk_size: 16 * 1024,
            ..MemoryConfig::default()
        })
        .unwrap();
        let state = store.state();
        let vault = DocumentVault::new(Arc::new(store));
        let report = vault.verify_roundtrip().await.unwrap();
        assert!(report.is_ok(), "{:?}", report.errors);
        assert_eq!(report.bytes, PROBE_SIZE as u64);
        assert!(state.is_empty().await);
    }
}
