//! Typed settings and their defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::containers::KillTimings;

/// Default address the external transport binds to.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:4344";

/// Default localization root when none is configured.
pub const DEFAULT_LOCAL_DIR: &str = "/tmp/nodewarden";

/// Default grace period before a kill is forced, in milliseconds.
pub const DEFAULT_KILL_GRACE_MILLIS: u64 = 250;

/// Default wait after a forced kill before giving up, in milliseconds.
pub const DEFAULT_KILL_FORCE_MILLIS: u64 = 5_000;

/// Default eviction threshold for the public cache: 10 GiB.
pub const DEFAULT_CACHE_TARGET_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Aggregate configuration for one node agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    /// "host:port" the external transport binds to.
    pub bind_address: String,
    /// Local storage roots offered to the downloader.
    pub local_dirs: Vec<PathBuf>,
    /// Whether token-based request authentication is on. Verification
    /// itself happens in the transport layer.
    pub security_enabled: bool,
    /// Grace period before a kill is forced, in milliseconds.
    pub kill_grace_millis: u64,
    /// Wait after a forced kill before giving up, in milliseconds.
    pub kill_force_millis: u64,
    /// Eviction threshold for the public resource cache, in bytes.
    pub cache_target_bytes: u64,
}

impl NodeConfig {
    /// Returns the kill escalation timings for the launcher driver.
    pub fn kill_timings(&self) -> KillTimings {
        KillTimings {
            grace: Duration::from_millis(self.kill_grace_millis),
            force: Duration::from_millis(self.kill_force_millis),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            local_dirs: vec![PathBuf::from(DEFAULT_LOCAL_DIR)],
            security_enabled: false,
            kill_grace_millis: DEFAULT_KILL_GRACE_MILLIS,
            kill_force_millis: DEFAULT_KILL_FORCE_MILLIS,
            cache_target_bytes: DEFAULT_CACHE_TARGET_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.local_dirs, vec![PathBuf::from(DEFAULT_LOCAL_DIR)]);
        assert!(!config.security_enabled);
        assert_eq!(config.cache_target_bytes, DEFAULT_CACHE_TARGET_BYTES);
    }

    #[test]
    fn kill_timings_come_from_the_millis_fields() {
        let config = NodeConfig {
            kill_grace_millis: 100,
            kill_force_millis: 200,
            ..Default::default()
        };
        let timings = config.kill_timings();
        assert_eq!(timings.grace, Duration::from_millis(100));
        assert_eq!(timings.force, Duration::from_millis(200));
    }
}
