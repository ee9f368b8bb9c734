use anyhow::Result;
use clap::Args;

use crate::config::AppConfig;
use crate::progress::format_bytes;

#[derive(Args)]
pub struct LsArgs {
    /// Only list names starting with this prefix
    prefix: Option<String>,

    /// Emit one JSON object per line
    #[arg(long)]
    json: bool,
}

pub async fn run(args: LsArgs) -> Result<()> {
    let config = AppConfig::load()?;
    let store = config.open_store().await?;
    let objects = store.list(args.prefix.as_deref()).await?;

    if args.json {
        for obj in &objects {
            println!("{}", serde_json::to_string(obj)?);
        }
        return Ok(());
    }

    if objects.is_empty() {
        println!("No objects found.");
        return Ok(());
    }

    println!("{:<20} {:>10}  {:<32}  NAME", "MODIFIED", "SIZE", "ETAG");
    println!("{}", "-".repeat(90));
    for obj in &objects {
        println!(
            "{:<20} {:>10}  {:<32}  {}",
            obj.last_modified.format("%Y-%m-%d %H:%M:%S"),
            format_bytes(obj.size),
            obj.etag,
            obj.name,
        );
    }
    let total: u64 = objects.iter().map(|o| o.size).sum();
    println!("\n{} objects, {}", objects.len(), format_bytes(total));
    Ok(())
}
