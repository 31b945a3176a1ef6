//! Cache eviction for the public resource partition.
//!
//! Eviction is advisory: the tracker is asked to bring the public
//! partition under a byte target and frees the least-recently-released
//! entries that nothing references. Referenced entries and in-flight
//! downloads are never touched. Removing the cache entry forgets the
//! materialization; deleting the bytes on disk is the deletion
//! collaborator's job, keyed off the paths logged here.

use std::time::Instant;

use tracing::{debug, info};

use super::resource::ResourceState;
use super::tracker::{CacheScope, ResourceTracker};

impl ResourceTracker {
    /// Evicts idle public entries, oldest `last_touch` first, until the
    /// partition's localized bytes fit under `target_bytes`.
    ///
    /// Returns the number of bytes reclaimed.
    pub fn evict(&self, target_bytes: u64) -> u64 {
        let entries = self.entries_in_scope(&CacheScope::Public);

        let mut total: u64 = 0;
        let mut candidates: Vec<(Instant, u64, _)> = Vec::new();
        for resource in entries {
            if resource.state() != ResourceState::Localized {
                continue;
            }
            let size = resource.size().max(0) as u64;
            total += size;
            if resource.refs_is_empty() {
                candidates.push((resource.last_touch(), size, resource));
            }
        }

        if total <= target_bytes {
            debug!(total, target_bytes, "public cache under target, nothing to evict");
            return 0;
        }

        candidates.sort_by_key(|(touched, _, _)| *touched);

        let mut reclaimed = 0;
        for (_, size, resource) in candidates {
            if total <= target_bytes {
                break;
            }
            info!(
                key = %resource.key(),
                size,
                path = ?resource.local_path(),
                "evicting idle public resource"
            );
            self.remove_entry(&CacheScope::Public, resource.key());
            total -= size;
            reclaimed += size;
        }

        reclaimed
    }
}
