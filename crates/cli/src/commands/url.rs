use std::time::Duration;

use anyhow::Result;
use clap::Args;

use crate::config::AppConfig;

#[derive(Args)]
pub struct UrlArgs {
    /// Object name
    name: String,

    /// Lifetime of the URL in seconds
    #[arg(long, default_value_t = 3600)]
    expires: u64,
}

pub async fn run(args: UrlArgs) -> Result<()> {
    let config = AppConfig::load()?;
    let store = config.open_store().await?;
    let url = store
        .get_signed_url(&args.name, Some(Duration::from_secs(args.expires)))
        .await?;
    println!("{url}");
    Ok(())
}
