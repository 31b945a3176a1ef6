//! Bridge between the lifecycle engine and the external executor.
//!
//! The driver owns one spawned task per launched container. The task
//! calls the [`ContainerLauncher`] collaborator, reports `Launched`, and
//! then waits for the process to exit. A kill request cancels the task's
//! token, which starts a timed escalation: graceful stop, a grace
//! period, then a forced kill. Whatever happens, the task posts exactly
//! one `Exited` event so the container FSM can finish its cleanup.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::LaunchError;
use crate::events::{ContainerEvent, EventHandler, EventSender, LauncherEvent, NodeEvent};
use crate::records::{ContainerId, ContainerLaunchContext, LocalResourceKey};

/// Exit code reported when the launch itself failed before a process
/// existed.
pub const EXIT_LAUNCH_FAILED: i32 = -1;

/// Exit code reported when a process ignored both stop and force kill.
pub const EXIT_UNRESPONSIVE: i32 = 137;

/// Kill escalation timings, from configuration.
#[derive(Clone, Copy, Debug)]
pub struct KillTimings {
    /// How long to wait after a graceful stop before forcing.
    pub grace: Duration,
    /// How long to wait after a forced kill before giving up waiting.
    pub force: Duration,
}

/// A launched container process, as seen by the driver.
///
/// `wait` may be called more than once; every call resolves with the
/// exit code once the process terminates.
pub trait RunningContainer: Send + Sync + 'static {
    /// Resolves with the process exit code.
    fn wait(&self) -> Pin<Box<dyn Future<Output = i32> + Send + '_>>;

    /// Requests a graceful stop.
    fn signal_stop(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Terminates the process unconditionally.
    fn force_kill(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Everything the executor needs to start one container.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// The container's submitted launch context.
    pub context: ContainerLaunchContext,
    /// Localized resources, key to on-disk path.
    pub resources: Vec<(LocalResourceKey, PathBuf)>,
}

/// The external executor seam.
///
/// Implementations prepare the working directory, apply the resource
/// links, and start the process under whatever isolation the platform
/// provides. The future must be `'static`: it runs on a spawned task.
pub trait ContainerLauncher: Send + Sync + 'static {
    /// Starts one container and returns a handle to the live process.
    fn launch(
        &self,
        spec: LaunchSpec,
    ) -> Pin<
        Box<dyn Future<Output = Result<Arc<dyn RunningContainer>, LaunchError>> + Send + 'static>,
    >;
}

/// Drives launches and kill escalation for every container on the node.
pub struct LauncherDriver {
    context: Arc<Context>,
    sender: EventSender,
    launcher: Arc<dyn ContainerLauncher>,
    timings: KillTimings,
    /// Kill tokens for containers with a live launch task.
    kills: Arc<DashMap<ContainerId, CancellationToken>>,
}

impl LauncherDriver {
    /// Creates the driver over the shared registries.
    pub fn new(
        context: Arc<Context>,
        sender: EventSender,
        launcher: Arc<dyn ContainerLauncher>,
        timings: KillTimings,
    ) -> Self {
        Self {
            context,
            sender,
            launcher,
            timings,
            kills: Arc::new(DashMap::new()),
        }
    }

    fn handle_launch(&self, id: ContainerId) {
        let Some(container) = self.context.container(&id) else {
            warn!(container = %id, "launch requested for absent container");
            return;
        };

        let spec = LaunchSpec {
            context: container.launch_context().clone(),
            resources: container.localized_resources(),
        };

        // The token must be registered before the task exists so a
        // Cleanup arriving right behind the Launch always finds it.
        let token = CancellationToken::new();
        self.kills.insert(id, token.clone());

        let launcher = Arc::clone(&self.launcher);
        let sender = self.sender.clone();
        let timings = self.timings;
        let kills = Arc::clone(&self.kills);

        tokio::spawn(async move {
            run_container(launcher, spec, id, token, timings, sender).await;
            kills.remove(&id);
        });
    }

    fn handle_cleanup(&self, id: ContainerId) {
        match self.kills.get(&id) {
            Some(token) => {
                info!(container = %id, "stopping container process");
                token.cancel();
            }
            // The launch task already finished and posted Exited; there
            // is nothing left to stop.
            None => debug!(container = %id, "cleanup for container with no live process"),
        }
    }
}

impl EventHandler for LauncherDriver {
    fn handle(&self, event: NodeEvent) {
        let NodeEvent::Launcher(event) = event else {
            error!(?event, "launcher driver received foreign event class");
            return;
        };
        match event {
            LauncherEvent::Launch { container } => self.handle_launch(container),
            LauncherEvent::Cleanup { container } => self.handle_cleanup(container),
        }
    }
}

/// One container's launch-to-exit supervision.
async fn run_container(
    launcher: Arc<dyn ContainerLauncher>,
    spec: LaunchSpec,
    id: ContainerId,
    token: CancellationToken,
    timings: KillTimings,
    sender: EventSender,
) {
    let running = match launcher.launch(spec).await {
        Ok(running) => running,
        Err(cause) => {
            warn!(container = %id, %cause, "launch failed");
            sender.post(NodeEvent::Container(ContainerEvent::DiagnosticsUpdate {
                container: id,
                message: format!("Failed to launch container: {}", cause),
            }));
            sender.post(NodeEvent::Container(ContainerEvent::Exited {
                container: id,
                code: EXIT_LAUNCH_FAILED,
            }));
            return;
        }
    };

    sender.post(NodeEvent::Container(ContainerEvent::Launched {
        container: id,
    }));

    // The launch itself is not interruptible; a kill that arrived while
    // it was in flight escalates now.
    let code = if token.is_cancelled() {
        escalate(&*running, id, timings).await
    } else {
        tokio::select! {
            code = running.wait() => code,
            _ = token.cancelled() => escalate(&*running, id, timings).await,
        }
    };

    sender.post(NodeEvent::Container(ContainerEvent::Exited {
        container: id,
        code,
    }));
}

/// Graceful stop, grace period, forced kill.
async fn escalate(running: &dyn RunningContainer, id: ContainerId, timings: KillTimings) -> i32 {
    running.signal_stop().await;
    if let Ok(code) = timeout(timings.grace, running.wait()).await {
        return code;
    }

    warn!(container = %id, grace = ?timings.grace, "container ignored stop, forcing");
    running.force_kill().await;
    match timeout(timings.force, running.wait()).await {
        Ok(code) => code,
        Err(_) => {
            error!(container = %id, "container unresponsive after forced kill");
            EXIT_UNRESPONSIVE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::watch;

    /// Process mock driven by a watch channel carrying the exit code.
    struct FakeProcess {
        exit: watch::Receiver<Option<i32>>,
        stop_requested: AtomicBool,
        kill_requested: AtomicBool,
        /// Exit code to publish when stop/kill is requested, if any.
        exit_on_signal: Option<(watch::Sender<Option<i32>>, i32)>,
    }

    impl RunningContainer for FakeProcess {
        fn wait(&self) -> Pin<Box<dyn Future<Output = i32> + Send + '_>> {
            let mut rx = self.exit.clone();
            Box::pin(async move {
                loop {
                    if let Some(code) = *rx.borrow() {
                        return code;
                    }
                    if rx.changed().await.is_err() {
                        return EXIT_UNRESPONSIVE;
                    }
                }
            })
        }

        fn signal_stop(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.stop_requested.store(true, Ordering::SeqCst);
            if let Some((tx, code)) = &self.exit_on_signal {
                let _ = tx.send(Some(*code));
            }
            Box::pin(std::future::ready(()))
        }

        fn force_kill(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.kill_requested.store(true, Ordering::SeqCst);
            Box::pin(std::future::ready(()))
        }
    }

    fn timings() -> KillTimings {
        KillTimings {
            grace: Duration::from_millis(20),
            force: Duration::from_millis(20),
        }
    }

    fn cid() -> ContainerId {
        ContainerId::new(crate::records::ApplicationId::new(100, 1), 0)
    }

    #[tokio::test]
    async fn escalation_returns_code_from_graceful_stop() {
        let (tx, rx) = watch::channel(None);
        let process = FakeProcess {
            exit: rx,
            stop_requested: AtomicBool::new(false),
            kill_requested: AtomicBool::new(false),
            exit_on_signal: Some((tx, 143)),
        };

        let code = escalate(&process, cid(), timings()).await;
        assert_eq!(code, 143);
        assert!(process.stop_requested.load(Ordering::SeqCst));
        assert!(!process.kill_requested.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn escalation_forces_an_unresponsive_process() {
        let (_tx, rx) = watch::channel(None);
        let process = FakeProcess {
            exit: rx,
            stop_requested: AtomicBool::new(false),
            kill_requested: AtomicBool::new(false),
            exit_on_signal: None,
        };

        let code = escalate(&process, cid(), timings()).await;
        assert_eq!(code, EXIT_UNRESPONSIVE);
        assert!(process.stop_requested.load(Ordering::SeqCst));
        assert!(process.kill_requested.load(Ordering::SeqCst));
    }
}
