mod commands;
mod config;
mod progress;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "docvault",
    version,
    about = "Store and retrieve compliance documents"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        commands::Command::Init(args) => commands::init::run(args).await,
        commands::Command::Put(args) => commands::put::run(args).await,
        commands::Command::Get(args) => commands::get::run(args).await,
        commands::Command::Ls(args) => commands::ls::run(args).await,
        commands::Command::Stat(args) => commands::stat::run(args).await,
        commands::Command::Rm(args) => commands::rm::run(args).await,
        commands::Command::Url(args) => commands::url::run(args).await,
        commands::Command::Verify(args) => commands::verify::run(args).await,
    }
}
