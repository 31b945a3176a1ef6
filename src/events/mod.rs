//! Event types for the lifecycle engine.
//!
//! Every state transition in the engine is driven by a [`NodeEvent`]
//! posted to the [`Dispatcher`](dispatcher::Dispatcher). Events are a
//! tagged union: the outer variant selects the handler class, the inner
//! payload enum names the operation and carries the target entity id.
//! Handlers match payloads exhaustively; an event that is illegal in the
//! target's current state is logged and dropped, never a panic.

pub mod dispatcher;

pub use dispatcher::{Dispatcher, EventHandler, EventSender};

use std::path::PathBuf;

use crate::records::{ApplicationId, ContainerId, LocalResourceKey};
use crate::resources::CacheScope;

/// Routing class of an event, used for handler registration.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum EventClass {
    /// Application lifecycle events, handled by the application FSM.
    Application,
    /// Container lifecycle events, handled by the container FSM.
    Container,
    /// Localization events, handled by the resource tracker.
    Localization,
    /// Launch and kill requests, handled by the launcher driver.
    Launcher,
}

/// The engine-wide event union.
#[derive(Debug)]
pub enum NodeEvent {
    /// Application lifecycle event.
    Application(ApplicationEvent),
    /// Container lifecycle event.
    Container(ContainerEvent),
    /// Localization event.
    Localization(LocalizationEvent),
    /// Launcher event.
    Launcher(LauncherEvent),
}

impl NodeEvent {
    /// Returns the routing class for handler lookup.
    pub fn class(&self) -> EventClass {
        match self {
            Self::Application(_) => EventClass::Application,
            Self::Container(_) => EventClass::Container,
            Self::Localization(_) => EventClass::Localization,
            Self::Launcher(_) => EventClass::Launcher,
        }
    }
}

/// Events targeting one application.
#[derive(Debug)]
pub enum ApplicationEvent {
    /// A new container was accepted for this application. The first such
    /// event creates the application record's lifecycle.
    Init {
        /// Container whose start request triggered the event.
        container: ContainerId,
    },
    /// Application bootstrap completed; pending containers may init.
    Inited {
        /// Target application.
        application: ApplicationId,
    },
    /// One of the application's containers reached its terminal state
    /// and its resource releases were acknowledged.
    ContainerFinished {
        /// Owning application.
        application: ApplicationId,
        /// The finished container.
        container: ContainerId,
    },
    /// The controller asked for this application to be torn down.
    Finish {
        /// Target application.
        application: ApplicationId,
    },
    /// The resource tracker released all application-scoped resources.
    ResourcesCleaned {
        /// Target application.
        application: ApplicationId,
    },
}

impl ApplicationEvent {
    /// Returns the id of the application the event targets.
    pub fn application(&self) -> ApplicationId {
        match self {
            Self::Init { container } => container.application,
            Self::Inited { application }
            | Self::ContainerFinished { application, .. }
            | Self::Finish { application }
            | Self::ResourcesCleaned { application } => *application,
        }
    }
}

/// Events targeting one container.
#[derive(Debug)]
pub enum ContainerEvent {
    /// Begin localization (or launch directly when nothing to localize).
    Init {
        /// Target container.
        container: ContainerId,
    },
    /// One required resource is available on local disk.
    ResourceLocalized {
        /// Target container.
        container: ContainerId,
        /// The resource that completed.
        key: LocalResourceKey,
        /// Local materialization path.
        path: PathBuf,
    },
    /// One required resource could not be fetched.
    ResourceFailed {
        /// Target container.
        container: ContainerId,
        /// The resource that failed.
        key: LocalResourceKey,
        /// Failure cause, appended to container diagnostics.
        diagnostics: String,
    },
    /// The external launcher started the container process.
    Launched {
        /// Target container.
        container: ContainerId,
    },
    /// The container process exited, or the launch itself failed.
    Exited {
        /// Target container.
        container: ContainerId,
        /// Process exit code; non-zero counts as failure.
        code: i32,
    },
    /// Cancellation request; idempotent once killing or terminal.
    Kill {
        /// Target container.
        container: ContainerId,
    },
    /// The resource tracker acknowledged this container's releases.
    CleanupDone {
        /// Target container.
        container: ContainerId,
    },
    /// Append a line to the container's diagnostics.
    DiagnosticsUpdate {
        /// Target container.
        container: ContainerId,
        /// Text to append.
        message: String,
    },
}

impl ContainerEvent {
    /// Returns the id of the container the event targets.
    pub fn container(&self) -> ContainerId {
        match self {
            Self::Init { container }
            | Self::ResourceLocalized { container, .. }
            | Self::ResourceFailed { container, .. }
            | Self::Launched { container }
            | Self::Exited { container, .. }
            | Self::Kill { container }
            | Self::CleanupDone { container }
            | Self::DiagnosticsUpdate { container, .. } => *container,
        }
    }
}

/// Events handled by the resource tracker.
#[derive(Debug)]
pub enum LocalizationEvent {
    /// A container claims a resource; fetch it if not already local.
    Request {
        /// Requesting container.
        container: ContainerId,
        /// Resource wanted.
        key: LocalResourceKey,
    },
    /// A downloader task finished successfully.
    FetchComplete {
        /// Cache partition the resource lives in.
        scope: CacheScope,
        /// Resource fetched.
        key: LocalResourceKey,
        /// Local materialization path.
        path: PathBuf,
        /// Size on disk in bytes.
        size: i64,
    },
    /// A downloader task failed; all waiters must abort.
    FetchFailed {
        /// Cache partition the resource lives in.
        scope: CacheScope,
        /// Resource that failed.
        key: LocalResourceKey,
        /// Failure cause.
        diagnostics: String,
    },
    /// A container is done with its resources; decrement every claim and
    /// acknowledge with `CleanupDone` once processed.
    ReleaseResources {
        /// Releasing container.
        container: ContainerId,
        /// Every key the container had requested.
        keys: Vec<LocalResourceKey>,
    },
    /// Drop all application-scoped cache entries for a finished
    /// application, then acknowledge with `ResourcesCleaned`.
    CleanupApplication {
        /// Application being torn down.
        application: ApplicationId,
    },
}

/// Events handled by the launcher driver.
#[derive(Debug)]
pub enum LauncherEvent {
    /// All resources are local; hand the container to the executor.
    Launch {
        /// Container to launch.
        container: ContainerId,
    },
    /// Stop the container process, escalating from graceful to forced.
    Cleanup {
        /// Container to stop.
        container: ContainerId,
    },
}
