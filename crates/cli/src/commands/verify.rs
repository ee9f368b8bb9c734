use anyhow::Result;
use clap::Args;

use docvault_core::DocumentVault;

use crate::config::AppConfig;
use crate::progress;

#[derive(Args)]
pub struct VerifyArgs;

pub async fn run(_args: VerifyArgs) -> Result<()> {
    let config = AppConfig::load()?;
    let store = config.open_store().await?;
    let vault = DocumentVault::new(store);

    let spinner = progress::create_spinner("Round-tripping probe object...");
    let report = vault.verify_roundtrip().await?;
    spinner.finish_with_message("done");

    println!("Backend:       {}", config.storage.backend.kind());
    println!("Probe:         {}", report.probe);
    println!("Bytes checked: {}", progress::format_bytes(report.bytes));

    if report.is_ok() {
        println!("\nStorage round-trip OK.");
    } else {
        println!("\nErrors found ({}):", report.errors.len());
        for err in &report.errors {
            println!("  - {err}");
        }
        anyhow::bail!("storage verification failed");
    }

    Ok(())
}
