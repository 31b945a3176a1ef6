//! Error types surfaced by the node agent.
//!
//! Errors are categorized by where they propagate: validation errors go
//! back to the remote caller, collaborator failures are folded into the
//! affected container's lifecycle, and illegal state-machine events are
//! logged and dropped without ever unwinding the engine.

use thiserror::Error;

use crate::records::ContainerId;

/// Errors returned by the [`ContainerManager`](crate::manager::ContainerManager)
/// request surface.
#[derive(Debug, Error)]
pub enum NodeError {
    /// A request referenced a container this node does not manage.
    #[error("container {0} is not handled by this node")]
    UnknownContainer(ContainerId),

    /// A start request collided with an existing container record.
    #[error("container {0} is already running on this node")]
    DuplicateContainer(ContainerId),

    /// A request was structurally invalid before any state was touched.
    #[error("invalid request: {0}")]
    Validation(String),
}

/// Errors produced by the external resource downloader.
///
/// The core performs no retries; a downloader that wants retry semantics
/// implements them internally and reports only the final outcome.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DownloadError {
    /// Human-readable failure cause, recorded as container diagnostics.
    pub message: String,
}

impl DownloadError {
    /// Creates a download error with the given cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors produced by the external container launcher.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LaunchError {
    /// Human-readable failure cause, recorded as container diagnostics.
    pub message: String,
}

impl LaunchError {
    /// Creates a launch error with the given cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ApplicationId;

    #[test]
    fn node_error_display_names_the_container() {
        let id = ContainerId::new(ApplicationId::new(100, 1), 0);
        let err = NodeError::UnknownContainer(id.clone());
        assert!(format!("{}", err).contains(&id.to_string()));

        let err = NodeError::DuplicateContainer(id.clone());
        assert!(format!("{}", err).contains("already running"));
    }

    #[test]
    fn download_error_display() {
        let err = DownloadError::new("connection reset");
        assert_eq!(format!("{}", err), "connection reset");
    }
}
