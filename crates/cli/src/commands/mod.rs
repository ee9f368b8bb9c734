pub mod get;
pub mod init;
pub mod ls;
pub mod put;
pub mod rm;
pub mod stat;
pub mod url;
pub mod verify;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Command {
    /// Configure a storage backend
    Init(init::InitArgs),
    /// Upload a file as an object
    Put(put::PutArgs),
    /// Download an object, optionally a byte range
    Get(get::GetArgs),
    /// List objects
    Ls(ls::LsArgs),
    /// Show object metadata
    Stat(stat::StatArgs),
    /// Delete an object
    Rm(rm::RmArgs),
    /// Issue a time-limited access URL
    Url(url::UrlArgs),
    /// Round-trip a probe object through the backend
    Verify(verify::VerifyArgs),
}
