use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use tracing::debug;

use super::{DEFAULT_CHUNK_SIZE, ObjectStore, chunked_stream, collect_stream};
use crate::error::{StorageError, StorageResult};
use crate::object::{
    ByteStream, DownloadOptions, ObjectMetadata, StorageObject, UploadOptions, validate_name,
};
use crate::signing::DEFAULT_URL_EXPIRY;

const META_HEADER_PREFIX: &str = "x-amz-meta-";

pub struct S3Store {
    bucket: Box<Bucket>,
    prefix: String,
}

impl S3Store {
    pub async fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        prefix: Option<&str>,
    ) -> StorageResult<Self> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };
        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::InvalidConfig(format!("S3 credentials: {e}")))?;
        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::InvalidConfig(format!("S3 bucket: {e}")))?
            .with_path_style();
        let prefix = prefix.unwrap_or("").trim_end_matches('/').to_string();
        Ok(Self { bucket, prefix })
    }

    fn full_path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.prefix)
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return key;
        }
        key.strip_prefix(&self.prefix)
            .and_then(|k| k.strip_prefix('/'))
            .unwrap_or(key)
    }

    async fn head(&self, name: &str) -> StorageResult<Option<ObjectMetadata>> {
        let full = self.full_path(name);
        let (head, status) = self
            .bucket
            .head_object(&full)
            .await
            .map_err(|e| s3_error("HEAD", &full, e))?;
        if status == 404 {
            return Ok(None);
        }
        check_status(status, name, "HEAD")?;

        let metadata = head
            .metadata
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| {
                let key = k.strip_prefix(META_HEADER_PREFIX).unwrap_or(&k).to_string();
                (key, v)
            })
            .collect::<BTreeMap<_, _>>();
        let last_modified = head
            .last_modified
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default();

        Ok(Some(ObjectMetadata {
            size: head.content_length.unwrap_or(0).max(0) as u64,
            content_type: head.content_type,
            last_modified,
            etag: clean_etag(head.e_tag.as_deref()),
            metadata,
        }))
    }
}

fn check_status(status: u16, name: &str, op: &str) -> StorageResult<()> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(name.to_string())),
        _ => Err(StorageError::Http {
            status,
            message: format!("S3 {op} {name}"),
        }),
    }
}

fn s3_error(op: &str, key: &str, err: S3Error) -> StorageError {
    match err {
        S3Error::HttpFailWithBody(status, body) => StorageError::Http {
            status,
            message: format!("S3 {op} {key}: {body}"),
        },
        other => StorageError::Backend(format!("S3 {op} failed: {key}: {other}")),
    }
}

fn clean_etag(etag: Option<&str>) -> String {
    etag.unwrap_or_default().trim_matches('"').to_string()
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn upload_from_bytes(
        &self,
        name: &str,
        data: Bytes,
        opts: UploadOptions,
    ) -> StorageResult<()> {
        validate_name(name)?;
        let full = self.full_path(name);
        let content_type = opts
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");

        let response = if opts.metadata.is_empty() {
            self.bucket
                .put_object_with_content_type(&full, &data, content_type)
                .await
        } else {
            let mut bucket = self.bucket.clone();
            for (key, value) in &opts.metadata {
                bucket.add_header(&format!("{META_HEADER_PREFIX}{key}"), value);
            }
            bucket
                .put_object_with_content_type(&full, &data, content_type)
                .await
        }
        .map_err(|e| s3_error("PUT", &full, e))?;

        check_status(response.status_code(), name, "PUT")?;
        debug!(name, size = data.len(), "S3 PUT");
        Ok(())
    }

    async fn upload_from_stream(
        &self,
        name: &str,
        stream: ByteStream,
        opts: UploadOptions,
    ) -> StorageResult<()> {
        // Single PUT: the object only appears once the whole body is in hand.
        let data = collect_stream(stream).await?;
        self.upload_from_bytes(name, data, opts).await
    }

    async fn exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.head(name).await?.is_some())
    }

    async fn delete(&self, name: &str) -> StorageResult<()> {
        let full = self.full_path(name);
        let response = self
            .bucket
            .delete_object(&full)
            .await
            .map_err(|e| s3_error("DELETE", &full, e))?;
        match response.status_code() {
            404 => Ok(()),
            status => check_status(status, name, "DELETE"),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<StorageObject>> {
        let full = self.full_path(prefix.unwrap_or(""));
        let results = self
            .bucket
            .list(full.clone(), None)
            .await
            .map_err(|e| s3_error("LIST", &full, e))?;

        let mut objects: Vec<StorageObject> = results
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|obj| StorageObject {
                name: self.strip_prefix(&obj.key).to_string(),
                size: obj.size,
                last_modified: DateTime::parse_from_rfc3339(&obj.last_modified)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_default(),
                etag: clean_etag(obj.e_tag.as_deref()),
            })
            .collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn download_as_stream(
        &self,
        name: &str,
        opts: DownloadOptions,
    ) -> StorageResult<ByteStream> {
        let full = self.full_path(name);

        if opts.range.is_some() {
            let meta = self
                .head(name)
                .await?
                .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
            let range = opts.resolve(meta.size)?;
            let response = self
                .bucket
                .get_object_range(&full, range.start, Some(range.end - 1))
                .await
                .map_err(|e| s3_error("GET", &full, e))?;
            check_status(response.status_code(), name, "GET")?;
            let body = response.bytes().clone();
            if body.len() as u64 != range.end - range.start {
                return Err(StorageError::Stream(format!(
                    "S3 returned {} bytes for a {} byte range of {name}",
                    body.len(),
                    range.end - range.start
                )));
            }
            return Ok(chunked_stream(body, DEFAULT_CHUNK_SIZE, None));
        }

        let response = self
            .bucket
            .get_object_stream(&full)
            .await
            .map_err(|e| s3_error("GET", &full, e))?;
        check_status(response.status_code, name, "GET")?;
        let key = full.clone();
        let body = response
            .bytes
            .map(move |chunk| chunk.map_err(|e| s3_error("GET", &key, e)));
        Ok(Box::pin(body))
    }

    async fn get_metadata(&self, name: &str) -> StorageResult<ObjectMetadata> {
        self.head(name)
            .await?
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn get_signed_url(
        &self,
        name: &str,
        expires_in: Option<Duration>,
    ) -> StorageResult<String> {
        if !self.exists(name).await? {
            return Err(StorageError::NotFound(name.to_string()));
        }
        let full = self.full_path(name);
        let expiry = expires_in.unwrap_or(DEFAULT_URL_EXPIRY).as_secs().min(u32::MAX as u64) as u32;
        self.bucket
            .presign_get(&full, expiry, None)
            .await
            .map_err(|e| s3_error("PRESIGN", &full, e))
    }
}
