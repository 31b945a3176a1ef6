//! NodeWarden - per-node agent for a cluster compute fabric.
//!
//! The agent accepts remote requests to start, stop, and query isolated
//! execution units ("containers"), localizes the resources each container
//! needs, launches and monitors them through an external executor, and
//! reports outcomes back to the central controller.
//!
//! At its core sits an event-driven lifecycle engine: three state
//! machines (application, container, localized resource) coordinated by
//! a single asynchronous dispatcher that serializes events per entity.
//!
//! # High-Level API
//!
//! The [`manager`] module provides the facade most callers want:
//!
//! ```ignore
//! use nodewarden::config::ConfigFile;
//! use nodewarden::manager::{ContainerManager, NullStatusReporter};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ConfigFile::load()?;
//! let (manager, engine) = ContainerManager::new(config, downloader, launcher, reporter);
//!
//! let shutdown = CancellationToken::new();
//! tokio::spawn(engine.run(shutdown.clone()));
//!
//! manager.start_container(launch_context)?;
//! let status = manager.get_container_status(container_id)?;
//! ```

pub mod applications;
pub mod config;
pub mod containers;
pub mod context;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod records;
pub mod resources;

/// Version of the NodeWarden library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
