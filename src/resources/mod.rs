//! Resource localization: the per-resource state machine, the tracker
//! that owns the cache and brokers fetches, and the downloader seam to
//! the external fetch mechanics.

mod downloader;
mod eviction;
mod resource;
mod tracker;

pub use downloader::{FetchedResource, ResourceDownloader};
pub use resource::{LocalizedResource, ResourceAction, ResourceEvent, ResourceState};
pub use tracker::{CacheScope, ResourceTracker};
