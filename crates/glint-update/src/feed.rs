use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::UpdateError;
use crate::manifest::{UpdateFile, UpdateInfo};
use crate::version::Channel;

/// Byte counter callback: `(transferred, total)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Where releases come from. [`crate::ManifestClient`] is the HTTP
/// implementation; tests substitute in-memory feeds.
#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    async fn fetch_manifest(&self, channel: Channel) -> Result<UpdateInfo, UpdateError>;

    /// Stream `file` into `dest`, returning the number of bytes written.
    ///
    /// Implementations must stop promptly once `cancel` fires and must not
    /// leave a partial file behind on any error.
    async fn download_artifact(
        &self,
        file: &UpdateFile,
        dest: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64, UpdateError>;
}
