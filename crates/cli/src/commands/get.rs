use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use docvault_core::{ByteRange, DownloadOptions};

use crate::config::AppConfig;
use crate::progress;

#[derive(Args)]
pub struct GetArgs {
    /// Object name
    name: String,

    /// Destination file (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Inclusive byte range, e.g. 0-1023 or 4096-
    #[arg(long)]
    range: Option<ByteRange>,
}

pub async fn run(args: GetArgs) -> Result<()> {
    let config = AppConfig::load()?;
    let store = config.open_store().await?;

    let meta = store.get_metadata(&args.name).await?;
    let opts = DownloadOptions { range: args.range };
    let span = opts.resolve(meta.size)?;
    let expected = span.end - span.start;

    let mut body = store
        .download_as_stream(&args.name, opts)
        .await
        .with_context(|| format!("download of {} failed", args.name))?;

    let pb = progress::create_transfer(expected, &args.name, args.output.is_none());
    let mut out: Box<dyn AsyncWrite + Unpin + Send> = match &args.output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                drop(out);
                if let Some(path) = &args.output {
                    warn!(path = %path.display(), "removing partial download");
                    let _ = tokio::fs::remove_file(path).await;
                }
                return Err(err).with_context(|| {
                    format!("download of {} interrupted after {written} bytes", args.name)
                });
            }
        };
        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
        pb.inc(chunk.len() as u64);
    }
    out.flush().await?;
    pb.finish_with_message("downloaded");

    if written != expected {
        anyhow::bail!("expected {expected} bytes from {}, received {written}", args.name);
    }
    info!(name = %args.name, bytes = written, "Download complete");
    Ok(())
}
