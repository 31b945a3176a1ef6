//! Seam to the external download mechanics.
//!
//! The engine never touches the network or the localization directory
//! layout itself; it hands a key to the downloader and receives a local
//! path back. Retry semantics, checksumming, and directory hashing all
//! live behind this trait.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use crate::error::DownloadError;
use crate::records::LocalResourceKey;

/// A successfully materialized resource.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    /// Where the resource landed on local disk.
    pub path: PathBuf,
    /// Size on disk in bytes.
    pub size: i64,
}

/// Asynchronous resource fetcher.
///
/// The tracker guarantees at most one outstanding `fetch` per resource
/// key; implementations do not need their own deduplication. The future
/// must be `'static`: it is driven on a spawned task, so implementations
/// clone whatever they need up front.
pub trait ResourceDownloader: Send + Sync + 'static {
    /// Fetches one resource into one of the node's local directories.
    ///
    /// Resolves with the final outcome; the core performs no retries.
    fn fetch(
        &self,
        key: LocalResourceKey,
        local_dirs: Vec<PathBuf>,
    ) -> Pin<Box<dyn Future<Output = Result<FetchedResource, DownloadError>> + Send + 'static>>;

    /// Returns the downloader name for logging.
    fn name(&self) -> &str {
        "downloader"
    }
}
