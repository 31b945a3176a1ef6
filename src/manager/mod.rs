//! High-level facade for the node agent.
//!
//! [`ContainerManager`] encapsulates component creation and wiring: it
//! builds the registries, the resource tracker, and the launcher driver,
//! registers them on the dispatcher, and exposes the synchronous request
//! surface the external transport calls into. Requests validate, post
//! events, and return; nothing on this surface waits for a container to
//! finish.
//!
//! # Example
//!
//! ```ignore
//! use nodewarden::config::NodeConfig;
//! use nodewarden::manager::{ContainerManager, NullStatusReporter};
//! use tokio_util::sync::CancellationToken;
//!
//! let (manager, engine) = ContainerManager::new(
//!     NodeConfig::default(),
//!     downloader,
//!     launcher,
//!     std::sync::Arc::new(NullStatusReporter),
//! );
//!
//! let shutdown = CancellationToken::new();
//! tokio::spawn(engine.run(shutdown.clone()));
//!
//! manager.start_container(launch_context)?;
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::applications::{Application, ApplicationEventHandler};
use crate::config::NodeConfig;
use crate::containers::{
    Container, ContainerEventHandler, ContainerLauncher, ContainerStatus, LauncherDriver,
};
use crate::context::Context;
use crate::error::NodeError;
use crate::events::{
    ApplicationEvent, ContainerEvent, Dispatcher, EventClass, EventSender, NodeEvent,
};
use crate::records::{ApplicationId, ContainerId, ContainerLaunchContext};
use crate::resources::{ResourceDownloader, ResourceTracker};

/// Channel back to the controller-facing status machinery.
///
/// The heartbeat itself is external; the engine only nudges it so the
/// controller learns about kills without waiting for the next cycle.
pub trait StatusReporter: Send + Sync + 'static {
    /// Requests an out-of-band status report.
    fn nudge(&self);
}

/// Reporter that does nothing, for tests and standalone operation.
pub struct NullStatusReporter;

impl StatusReporter for NullStatusReporter {
    fn nudge(&self) {}
}

/// The dispatcher loop, ready to run for the life of the agent.
pub struct LifecycleEngine {
    dispatcher: Dispatcher,
}

impl LifecycleEngine {
    /// Drains events until shutdown is signalled.
    pub async fn run(self, shutdown: CancellationToken) {
        self.dispatcher.run(shutdown).await
    }
}

/// The node agent's request surface and component wiring.
pub struct ContainerManager {
    context: Arc<Context>,
    tracker: Arc<ResourceTracker>,
    sender: EventSender,
    reporter: Arc<dyn StatusReporter>,
    config: NodeConfig,
}

impl ContainerManager {
    /// Wires the engine together.
    ///
    /// Returns the manager plus the [`LifecycleEngine`] to spawn; the
    /// manager is inert until the engine runs.
    pub fn new(
        config: NodeConfig,
        downloader: Arc<dyn ResourceDownloader>,
        launcher: Arc<dyn ContainerLauncher>,
        reporter: Arc<dyn StatusReporter>,
    ) -> (Self, LifecycleEngine) {
        let mut dispatcher = Dispatcher::new();
        let sender = dispatcher.sender();
        let context = Arc::new(Context::new());

        let tracker = Arc::new(ResourceTracker::new(
            Arc::clone(&context),
            sender.clone(),
            downloader,
            config.local_dirs.clone(),
        ));
        let driver = Arc::new(LauncherDriver::new(
            Arc::clone(&context),
            sender.clone(),
            launcher,
            config.kill_timings(),
        ));

        dispatcher.register(
            EventClass::Application,
            Arc::new(ApplicationEventHandler::new(
                Arc::clone(&context),
                sender.clone(),
            )),
        );
        dispatcher.register(
            EventClass::Container,
            Arc::new(ContainerEventHandler::new(
                Arc::clone(&context),
                sender.clone(),
            )),
        );
        dispatcher.register(EventClass::Localization, Arc::clone(&tracker) as _);
        dispatcher.register(EventClass::Launcher, driver);

        if config.security_enabled {
            info!("security is enabled; token verification is delegated to the transport layer");
        }
        info!(bind_address = %config.bind_address, "container manager wired");

        (
            Self {
                context,
                tracker,
                sender,
                reporter,
                config,
            },
            LifecycleEngine { dispatcher },
        )
    }

    /// Accepts a container for execution.
    ///
    /// Creates the container record and, when this is the first container
    /// of its application, the application record. Returns once the init
    /// event is posted; localization and launch proceed asynchronously.
    pub fn start_container(&self, launch: ContainerLaunchContext) -> Result<(), NodeError> {
        if launch.user.trim().is_empty() {
            return Err(NodeError::Validation(
                "launch context has no submitting user".to_string(),
            ));
        }

        let container_id = launch.container_id;
        let application_id = container_id.application;
        let user = launch.user.clone();

        let container = Arc::new(Container::new(launch));
        if self.context.insert_container_if_absent(container).is_err() {
            return Err(NodeError::DuplicateContainer(container_id));
        }

        let application = Arc::new(Application::new(application_id, user));
        if self.context.insert_application_if_absent(application) {
            info!(application = %application_id, "creating new application reference");
        }

        self.sender
            .post(NodeEvent::Application(ApplicationEvent::Init {
                container: container_id,
            }));
        Ok(())
    }

    /// Requests a container kill. Returns immediately.
    ///
    /// Stopping a container this node does not know is a benign no-op:
    /// after an agent restart the controller may still be killing
    /// containers that died with the previous incarnation.
    pub fn stop_container(&self, id: ContainerId) -> Result<(), NodeError> {
        if self.context.container(&id).is_none() {
            warn!(container = %id, "asked to stop unknown container");
            return Ok(());
        }

        self.sender
            .post(NodeEvent::Container(ContainerEvent::DiagnosticsUpdate {
                container: id,
                message: "Container killed by the application.".to_string(),
            }));
        self.sender
            .post(NodeEvent::Container(ContainerEvent::Kill { container: id }));

        // Let the controller hear about the kill without waiting for the
        // next heartbeat cycle.
        self.reporter.nudge();
        Ok(())
    }

    /// Returns a point-in-time status snapshot of one container.
    pub fn get_container_status(&self, id: ContainerId) -> Result<ContainerStatus, NodeError> {
        match self.context.container(&id) {
            Some(container) => Ok(container.status()),
            None => Err(NodeError::UnknownContainer(id)),
        }
    }

    /// Reserved operation; currently a no-op.
    pub fn cleanup_container(&self, _id: ContainerId) -> Result<(), NodeError> {
        Ok(())
    }

    /// Controller command: tear down the named applications.
    pub fn finish_applications(&self, applications: &[ApplicationId]) {
        for application in applications {
            self.sender
                .post(NodeEvent::Application(ApplicationEvent::Finish {
                    application: *application,
                }));
        }
    }

    /// Controller command: kill the named containers.
    pub fn finish_containers(&self, containers: &[ContainerId]) {
        for container in containers {
            self.sender
                .post(NodeEvent::Container(ContainerEvent::DiagnosticsUpdate {
                    container: *container,
                    message: "Container killed by the controller.".to_string(),
                }));
            self.sender
                .post(NodeEvent::Container(ContainerEvent::Kill {
                    container: *container,
                }));
        }
    }

    /// Runs an eviction pass over the public cache using the configured
    /// byte target. Returns the bytes reclaimed.
    pub fn evict_cache(&self) -> u64 {
        self.tracker.evict(self.config.cache_target_bytes)
    }

    /// Returns the address the external transport should bind to.
    pub fn bind_address(&self) -> &str {
        &self.config.bind_address
    }

    /// Returns the shared registries, for observers.
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Returns the resource tracker, for observers.
    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DownloadError, LaunchError};
    use crate::records::{ApplicationId, LocalResourceKey, ResourceVisibility};
    use crate::resources::FetchedResource;
    use std::future::Future;
    use std::path::PathBuf;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct IdleDownloader;

    impl ResourceDownloader for IdleDownloader {
        fn fetch(
            &self,
            _key: LocalResourceKey,
            _local_dirs: Vec<PathBuf>,
        ) -> Pin<Box<dyn Future<Output = Result<FetchedResource, DownloadError>> + Send + 'static>>
        {
            Box::pin(std::future::pending())
        }
    }

    struct RejectingLauncher;

    impl ContainerLauncher for RejectingLauncher {
        fn launch(
            &self,
            _spec: crate::containers::LaunchSpec,
        ) -> Pin<
            Box<
                dyn Future<
                        Output = Result<
                            Arc<dyn crate::containers::RunningContainer>,
                            LaunchError,
                        >,
                    > + Send
                    + 'static,
            >,
        > {
            Box::pin(std::future::ready(Err(LaunchError::new("no executor"))))
        }
    }

    struct CountingReporter {
        nudges: AtomicUsize,
    }

    impl StatusReporter for CountingReporter {
        fn nudge(&self) {
            self.nudges.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager_with_reporter() -> (ContainerManager, LifecycleEngine, Arc<CountingReporter>) {
        let reporter = Arc::new(CountingReporter {
            nudges: AtomicUsize::new(0),
        });
        let (manager, engine) = ContainerManager::new(
            NodeConfig::default(),
            Arc::new(IdleDownloader),
            Arc::new(RejectingLauncher),
            Arc::clone(&reporter) as _,
        );
        (manager, engine, reporter)
    }

    fn cid(seq: u32) -> ContainerId {
        ContainerId::new(ApplicationId::new(100, 1), seq)
    }

    fn launch(seq: u32) -> ContainerLaunchContext {
        ContainerLaunchContext::new(cid(seq), "alice")
            .with_command("/bin/worker")
            .with_resource(LocalResourceKey::new(
                "s3://x/a",
                10,
                1,
                ResourceVisibility::Public,
            ))
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected_with_one_record() {
        let (manager, _engine, _reporter) = manager_with_reporter();

        manager.start_container(launch(0)).unwrap();
        let err = manager.start_container(launch(0)).unwrap_err();
        assert!(matches!(err, NodeError::DuplicateContainer(id) if id == cid(0)));
        assert_eq!(manager.context().container_count(), 1);
        assert_eq!(manager.context().application_count(), 1);
    }

    #[tokio::test]
    async fn start_without_user_is_a_validation_error() {
        let (manager, _engine, _reporter) = manager_with_reporter();
        let bad = ContainerLaunchContext::new(cid(0), "  ");
        assert!(matches!(
            manager.start_container(bad),
            Err(NodeError::Validation(_))
        ));
        assert_eq!(manager.context().container_count(), 0);
    }

    #[tokio::test]
    async fn stop_unknown_container_is_a_benign_noop() {
        let (manager, _engine, reporter) = manager_with_reporter();
        assert!(manager.stop_container(cid(9)).is_ok());
        assert_eq!(reporter.nudges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_known_container_nudges_the_reporter() {
        let (manager, _engine, reporter) = manager_with_reporter();
        manager.start_container(launch(0)).unwrap();
        manager.stop_container(cid(0)).unwrap();
        assert_eq!(reporter.nudges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn status_of_unknown_container_is_an_error() {
        let (manager, _engine, _reporter) = manager_with_reporter();
        assert!(matches!(
            manager.get_container_status(cid(0)),
            Err(NodeError::UnknownContainer(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_container_is_reserved() {
        let (manager, _engine, _reporter) = manager_with_reporter();
        assert!(manager.cleanup_container(cid(0)).is_ok());
    }
}
