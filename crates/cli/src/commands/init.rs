use anyhow::Result;
use clap::Args;
use tracing::info;

use docvault_core::backend::local::LocalStore;
use docvault_core::retry::RetryConfig;

use crate::config::{AppConfig, BackendConfig, StorageConfig};

#[derive(Args)]
pub struct InitArgs {
    /// Backend type: local or s3
    #[arg(long)]
    backend: String,

    /// Root directory for the local backend
    #[arg(long)]
    path: Option<String>,

    /// S3 endpoint URL
    #[arg(long)]
    endpoint: Option<String>,

    /// S3 bucket name
    #[arg(long)]
    bucket: Option<String>,

    /// S3 region
    #[arg(long, default_value = "auto")]
    region: String,

    /// S3 access key
    #[arg(long)]
    access_key: Option<String>,

    /// S3 secret key
    #[arg(long)]
    secret_key: Option<String>,

    /// S3 key prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Attempts per operation before giving up
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,
}

pub async fn run(args: InitArgs) -> Result<()> {
    let backend = match args.backend.as_str() {
        "local" => {
            let path = args
                .path
                .ok_or_else(|| anyhow::anyhow!("--path required for local backend"))?;
            LocalStore::init(&path)?;
            BackendConfig::Local { path }
        }
        "s3" => {
            let endpoint = args
                .endpoint
                .ok_or_else(|| anyhow::anyhow!("--endpoint required for S3 backend"))?;
            let bucket = args
                .bucket
                .ok_or_else(|| anyhow::anyhow!("--bucket required for S3 backend"))?;
            let access_key = args
                .access_key
                .ok_or_else(|| anyhow::anyhow!("--access-key required for S3 backend"))?;
            let secret_key = args
                .secret_key
                .ok_or_else(|| anyhow::anyhow!("--secret-key required for S3 backend"))?;
            BackendConfig::S3 {
                endpoint,
                region: args.region,
                bucket,
                access_key,
                secret_key,
                prefix: args.prefix,
            }
        }
        other => anyhow::bail!("unknown backend: {other} (supported: local, s3)"),
    };

    let config = AppConfig {
        storage: StorageConfig { backend },
        retry: RetryConfig {
            max_attempts: args.max_attempts,
            ..RetryConfig::default()
        },
    };
    config.retry.validate()?;

    // Fail now rather than on first use if the backend can't be built.
    config.open_store().await?;
    config.save()?;

    info!(
        backend = config.storage.backend.kind(),
        config_path = %AppConfig::config_path().display(),
        "Storage configured"
    );
    println!("Config: {}", AppConfig::config_path().display());
    Ok(())
}
