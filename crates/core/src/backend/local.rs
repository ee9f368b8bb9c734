use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{DEFAULT_CHUNK_SIZE, ObjectStore};
use crate::error::{StorageError, StorageResult};
use crate::object::{
    ByteStream, DownloadOptions, EtagHasher, ObjectMetadata, StorageObject, UploadOptions,
    validate_name,
};
use crate::signing::{DEFAULT_URL_EXPIRY, UrlSigner};

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";

/// Width of the little-endian trailer length that ends every object file.
const TRAILER_LEN_BYTES: u64 = 8;

/// Metadata written after the object bytes, in the same file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Trailer {
    name: String,
    size: u64,
    content_type: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    etag: String,
}

/// An object file opened for reading, trailer already decoded.
struct ObjectFile {
    file: File,
    trailer: Trailer,
    last_modified: DateTime<Utc>,
}

impl ObjectFile {
    fn metadata(&self) -> ObjectMetadata {
        ObjectMetadata {
            size: self.trailer.size,
            content_type: self.trailer.content_type.clone(),
            last_modified: self.last_modified,
            etag: self.trailer.etag.clone(),
            metadata: self.trailer.metadata.clone(),
        }
    }
}

/// Filesystem backend.
///
/// Each object is one flat file under `<root>/objects`, named by the blake3
/// hash of the object name, so names carry no directory meaning. The file
/// holds the payload followed by a JSON trailer (name, size, content type,
/// custom metadata, etag) and its length. Writes go to `<root>/tmp` and are
/// published with a single rename, so bytes and metadata always change
/// together.
pub struct LocalStore {
    root: PathBuf,
    chunk_size: usize,
    signer: UrlSigner,
}

impl LocalStore {
    pub fn new(path: impl AsRef<Path>) -> StorageResult<Self> {
        let root = path.as_ref().to_path_buf();
        Ok(Self {
            root,
            chunk_size: DEFAULT_CHUNK_SIZE,
            signer: UrlSigner::random("file"),
        })
    }

    pub fn init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let store = Self::new(path)?;
        for dir in [OBJECTS_DIR, TMP_DIR] {
            std::fs::create_dir_all(store.root.join(dir))?;
        }
        Ok(store)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn verify_signed_url(&self, url: &str) -> StorageResult<String> {
        self.signer.verify(url, Utc::now())
    }

    fn object_path(&self, name: &str) -> StorageResult<PathBuf> {
        validate_name(name)?;
        let file_name = blake3::hash(name.as_bytes()).to_hex();
        Ok(self.root.join(OBJECTS_DIR).join(file_name.as_str()))
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(TMP_DIR)
            .join(uuid::Uuid::new_v4().to_string())
    }

    async fn open_object(&self, name: &str) -> StorageResult<ObjectFile> {
        let not_found = || StorageError::NotFound(name.to_string());
        let path = self.object_path(name).map_err(|_| not_found())?;
        let object = open_object_file(&path).await?.ok_or_else(not_found)?;
        if object.trailer.name != name {
            return Err(StorageError::Backend(format!(
                "object file {} belongs to {:?}, not {name:?}",
                path.display(),
                object.trailer.name
            )));
        }
        Ok(object)
    }

    /// Stream the payload into `temp`, then append the trailer.
    async fn write_temp(
        &self,
        temp: &Path,
        name: &str,
        mut stream: ByteStream,
        opts: UploadOptions,
    ) -> StorageResult<u64> {
        let mut file = File::create(temp).await?;
        let mut hasher = EtagHasher::new();
        let mut size = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.inspect_err(|err| {
                warn!(name, received = size, error = %err, "upload stream failed, discarding");
            })?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }

        let trailer = Trailer {
            name: name.to_string(),
            size,
            content_type: opts.content_type,
            metadata: opts.metadata,
            etag: hasher.finish(),
        };
        let json = serde_json::to_vec(&trailer)
            .map_err(|e| StorageError::Backend(format!("failed to encode metadata: {e}")))?;
        file.write_all(&json).await?;
        file.write_u64_le(json.len() as u64).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(size)
    }
}

/// Open an object file and decode its trailer. `None` if the file is gone.
async fn open_object_file(path: &Path) -> StorageResult<Option<ObjectFile>> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let corrupt = |what: String| {
        StorageError::Backend(format!("corrupt object file {}: {what}", path.display()))
    };

    let stat = file.metadata().await?;
    let len = stat.len();
    if len < TRAILER_LEN_BYTES {
        return Err(corrupt(format!("{len} bytes is too short")));
    }
    file.seek(SeekFrom::Start(len - TRAILER_LEN_BYTES)).await?;
    let trailer_len = file.read_u64_le().await?;
    let data_end = trailer_len
        .checked_add(TRAILER_LEN_BYTES)
        .and_then(|n| len.checked_sub(n))
        .ok_or_else(|| corrupt(format!("trailer length {trailer_len} exceeds file")))?;

    let mut json = vec![0u8; trailer_len as usize];
    file.seek(SeekFrom::Start(data_end)).await?;
    file.read_exact(&mut json).await?;
    let trailer: Trailer = serde_json::from_slice(&json).map_err(|e| corrupt(e.to_string()))?;
    if trailer.size != data_end {
        return Err(corrupt(format!(
            "trailer says {} bytes, file holds {data_end}",
            trailer.size
        )));
    }

    Ok(Some(ObjectFile {
        file,
        trailer,
        last_modified: stat.modified()?.into(),
    }))
}

async fn discard(temp: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %temp.display(), error = %e, "failed to remove temp file");
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn upload_from_bytes(
        &self,
        name: &str,
        data: Bytes,
        opts: UploadOptions,
    ) -> StorageResult<()> {
        let body: ByteStream = Box::pin(futures::stream::iter([Ok(data)]));
        self.upload_from_stream(name, body, opts).await
    }

    async fn upload_from_stream(
        &self,
        name: &str,
        stream: ByteStream,
        opts: UploadOptions,
    ) -> StorageResult<()> {
        let target = self.object_path(name)?;
        let temp = self.temp_path();
        for dir in [temp.parent(), target.parent()].into_iter().flatten() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let size = match self.write_temp(&temp, name, stream, opts).await {
            Ok(size) => size,
            Err(e) => {
                discard(&temp).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            discard(&temp).await;
            return Err(e.into());
        }
        debug!(name, size, "object written");
        Ok(())
    }

    async fn exists(&self, name: &str) -> StorageResult<bool> {
        let Ok(path) = self.object_path(name) else {
            return Ok(false);
        };
        match tokio::fs::metadata(&path).await {
            Ok(stat) => Ok(stat.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> StorageResult<()> {
        let Ok(path) = self.object_path(name) else {
            return Ok(());
        };
        let removed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        debug!(name, removed, "delete");
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<StorageObject>> {
        let prefix = prefix.unwrap_or("");
        let base = self.root.join(OBJECTS_DIR);
        if !tokio::fs::try_exists(&base).await? {
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&base).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            match open_object_file(&path).await {
                Ok(Some(object)) if object.trailer.name.starts_with(prefix) => {
                    objects.push(object.metadata().to_listing(&object.trailer.name));
                }
                // Filtered out, or deleted between the walk and the open.
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable object"),
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn download_as_stream(
        &self,
        name: &str,
        opts: DownloadOptions,
    ) -> StorageResult<ByteStream> {
        let ObjectFile {
            mut file, trailer, ..
        } = self.open_object(name).await?;
        let range = opts.resolve(trailer.size)?;
        file.seek(SeekFrom::Start(range.start)).await?;

        let chunk_size = self.chunk_size as u64;
        let remaining = range.end - range.start;
        let stream = futures::stream::unfold(
            Some((file, remaining)),
            move |state| async move {
                let (mut file, remaining) = state?;
                if remaining == 0 {
                    return None;
                }
                let want = remaining.min(chunk_size) as usize;
                let mut buf = BytesMut::zeroed(want);
                let mut filled = 0;
                while filled < want {
                    match file.read(&mut buf[filled..]).await {
                        Ok(0) => {
                            let err = StorageError::Stream(format!(
                                "file ended with {} bytes still expected",
                                remaining - filled as u64
                            ));
                            return Some((Err(err), None));
                        }
                        Ok(n) => filled += n,
                        Err(e) => return Some((Err(e.into()), None)),
                    }
                }
                Some((Ok(buf.freeze()), Some((file, remaining - want as u64))))
            },
        );
        Ok(Box::pin(stream))
    }

    async fn get_metadata(&self, name: &str) -> StorageResult<ObjectMetadata> {
        Ok(self.open_object(name).await?.metadata())
    }

    async fn get_signed_url(
        &self,
        name: &str,
        expires_in: Option<Duration>,
    ) -> StorageResult<String> {
        if !self.exists(name).await? {
            return Err(StorageError::NotFound(name.to_string()));
        }
        Ok(self
            .signer
            .sign(name, expires_in.unwrap_or(DEFAULT_URL_EXPIRY), Utc::now()))
    }
}
