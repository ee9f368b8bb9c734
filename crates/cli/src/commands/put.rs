use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::BytesMut;
use clap::Args;
use indicatif::ProgressBar;
use tokio::io::AsyncReadExt;
use tracing::info;

use docvault_core::backend::DEFAULT_CHUNK_SIZE;
use docvault_core::{ByteStream, StorageError, UploadOptions};

use crate::config::AppConfig;
use crate::progress;

#[derive(Args)]
pub struct PutArgs {
    /// Object name
    name: String,

    /// File to upload
    file: PathBuf,

    /// Content type stored with the object
    #[arg(long)]
    content_type: Option<String>,

    /// Custom metadata as key=value (repeatable)
    #[arg(long = "meta", value_parser = parse_key_val)]
    meta: Vec<(String, String)>,
}

pub async fn run(args: PutArgs) -> Result<()> {
    let config = AppConfig::load()?;
    let store = config.open_store().await?;

    let file = tokio::fs::File::open(&args.file)
        .await
        .with_context(|| format!("failed to open {}", args.file.display()))?;
    let size = file.metadata().await?.len();

    let mut opts = UploadOptions::default();
    opts.content_type = args.content_type;
    opts.metadata.extend(args.meta);

    let pb = progress::create_transfer(size, &args.name, false);
    store
        .upload_from_stream(&args.name, file_stream(file, pb.clone()), opts)
        .await
        .with_context(|| format!("upload of {} failed", args.name))?;
    pb.finish_with_message("uploaded");

    if !store.exists(&args.name).await? {
        anyhow::bail!("upload of {} was acknowledged but the object is missing", args.name);
    }
    let meta = store.get_metadata(&args.name).await?;
    if meta.size != size {
        anyhow::bail!(
            "stored size {} differs from local file size {size}",
            meta.size
        );
    }

    info!(name = %args.name, size, etag = %meta.etag, "Upload complete");
    println!(
        "{} ({}, etag {})",
        args.name,
        progress::format_bytes(meta.size),
        meta.etag
    );
    Ok(())
}

/// Read `file` in transfer-sized chunks, ticking `pb` as bytes go out.
fn file_stream(file: tokio::fs::File, pb: ProgressBar) -> ByteStream {
    let stream = futures::stream::unfold(Some(file), move |file| {
        let pb = pb.clone();
        async move {
            let mut file = file?;
            let mut buf = BytesMut::zeroed(DEFAULT_CHUNK_SIZE);
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    pb.inc(n as u64);
                    Some((Ok(buf.freeze()), Some(file)))
                }
                Err(e) => Some((Err(StorageError::from(e)), None)),
            }
        }
    });
    Box::pin(stream)
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    if key.is_empty() {
        return Err(format!("empty metadata key in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn metadata_pairs() {
        assert_eq!(
            parse_key_val("case=17").unwrap(),
            ("case".to_string(), "17".to_string())
        );
        assert_eq!(
            parse_key_val("note=a=b").unwrap(),
            ("note".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[tokio::test]
    async fn file_stream_reads_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.bin");
        let payload: Vec<u8> = (0..(DEFAULT_CHUNK_SIZE * 2 + 17))
            .map(|i| (i % 256) as u8)
            .collect();
        std::fs::write(&path, &payload).unwrap();

        let file = tokio::fs::File::open(&path).await.unwrap();
        let chunks: Vec<_> = file_stream(file, ProgressBar::hidden())
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert!(chunks.len() >= 3);
        assert_eq!(chunks.concat(), payload);
    }
}
