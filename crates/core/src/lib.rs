pub mod backend;
pub mod error;
pub mod object;
pub mod retry;
pub mod signing;
pub mod vault;

pub use backend::ObjectStore;
pub use error::{StorageError, StorageResult};
pub use object::{ByteRange, ByteStream, DownloadOptions, ObjectMetadata, StorageObject, UploadOptions};
pub use retry::{RetryConfig, with_retry};
pub use vault::DocumentVault;
