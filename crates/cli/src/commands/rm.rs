use anyhow::Result;
use clap::Args;

use crate::config::AppConfig;

#[derive(Args)]
pub struct RmArgs {
    /// Object names to delete
    #[arg(required = true)]
    names: Vec<String>,
}

pub async fn run(args: RmArgs) -> Result<()> {
    let config = AppConfig::load()?;
    let store = config.open_store().await?;
    for name in &args.names {
        store.delete(name).await?;
        println!("Deleted {name}");
    }
    Ok(())
}
