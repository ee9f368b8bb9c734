use anyhow::Result;
use clap::Args;

use crate::config::AppConfig;
use crate::progress::format_bytes;

#[derive(Args)]
pub struct StatArgs {
    /// Object name
    name: String,
}

pub async fn run(args: StatArgs) -> Result<()> {
    let config = AppConfig::load()?;
    let store = config.open_store().await?;
    let meta = store.get_metadata(&args.name).await?;

    println!("Name:          {}", args.name);
    println!("Size:          {} ({} bytes)", format_bytes(meta.size), meta.size);
    println!(
        "Content type:  {}",
        meta.content_type.as_deref().unwrap_or("-")
    );
    println!(
        "Last modified: {}",
        meta.last_modified.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("ETag:          {}", meta.etag);
    if !meta.metadata.is_empty() {
        println!("Metadata:");
        for (key, value) in &meta.metadata {
            println!("  {key}: {value}");
        }
    }
    Ok(())
}
