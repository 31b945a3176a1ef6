//! The container state machine.
//!
//! A container moves New → Localizing → Localized → Running and then out
//! through one of the exit states to Done. Every transition is driven by
//! a [`ContainerEvent`] delivered on the dispatcher loop; the FSM only
//! mutates its own state and posts follow-up events, so the whole
//! lifecycle is auditable from the event log.
//!
//! Cleanup is a handshake: on any exit path the container posts its
//! resource releases to the tracker and waits for `CleanupDone` before
//! reporting `ContainerFinished` to its application.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, error, info, warn};

use crate::events::{
    ApplicationEvent, ContainerEvent, EventSender, LauncherEvent, LocalizationEvent, NodeEvent,
};
use crate::records::{ContainerId, ContainerLaunchContext, LocalResourceKey};

/// Lifecycle states of a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerState {
    /// Accepted, not yet initialized by its application.
    New,
    /// Waiting for resources to materialize on local disk.
    Localizing,
    /// All resources local; launch requested.
    Localized,
    /// Process running under the external executor.
    Running,
    /// Process exited with code zero.
    ExitedWithSuccess,
    /// Process exited non-zero, failed to launch, or failed localization.
    ExitedWithFailure,
    /// Kill requested; waiting for the process and cleanup to settle.
    Killing,
    /// Terminal: finish observed and releases acknowledged.
    Done,
}

impl ContainerState {
    /// Returns true once no further lifecycle transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Returns true for the post-exit states awaiting cleanup.
    pub fn is_exited(&self) -> bool {
        matches!(self, Self::ExitedWithSuccess | Self::ExitedWithFailure)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::Localizing => write!(f, "LOCALIZING"),
            Self::Localized => write!(f, "LOCALIZED"),
            Self::Running => write!(f, "RUNNING"),
            Self::ExitedWithSuccess => write!(f, "EXITED_WITH_SUCCESS"),
            Self::ExitedWithFailure => write!(f, "EXITED_WITH_FAILURE"),
            Self::Killing => write!(f, "KILLING"),
            Self::Done => write!(f, "DONE"),
        }
    }
}

/// Point-in-time snapshot returned to status queries.
///
/// Always a clone, never a live reference. A `Done` container reports the
/// recorded completion kind (`ExitedWithSuccess` / `ExitedWithFailure`)
/// so callers observe the outcome rather than the internal rest state.
#[derive(Clone, Debug)]
pub struct ContainerStatus {
    /// Container the snapshot describes.
    pub container_id: ContainerId,
    /// Reported lifecycle state.
    pub state: ContainerState,
    /// Process exit code, when one was observed.
    pub exit_status: Option<i32>,
    /// Accumulated diagnostics.
    pub diagnostics: String,
}

/// Mutable core of the FSM, guarded by the container's mutex.
struct ContainerCore {
    state: ContainerState,
    /// Not-yet-localized resources, as a multiset (a container may claim
    /// the same key more than once).
    pending: HashMap<LocalResourceKey, u32>,
    /// Count of outstanding claims; guards the single Localized fire.
    outstanding: usize,
    /// Materialized resources.
    localized: HashMap<LocalResourceKey, PathBuf>,
    /// Every key a REQUEST was posted for; released on any exit path.
    requested: Vec<LocalResourceKey>,
    diagnostics: String,
    exit_status: Option<i32>,
    /// Localization or launch failed before a clean exit was possible.
    failed: bool,
    /// Launch has been posted to the launcher driver.
    launch_requested: bool,
    /// The process actually started.
    launched: bool,
    /// Releases were already posted; never release twice.
    releases_posted: bool,
}

/// One container's record and state machine.
pub struct Container {
    id: ContainerId,
    launch: ContainerLaunchContext,
    core: Mutex<ContainerCore>,
}

impl Container {
    /// Creates a container in the New state from its launch context.
    pub fn new(launch: ContainerLaunchContext) -> Self {
        Self {
            id: launch.container_id,
            launch,
            core: Mutex::new(ContainerCore {
                state: ContainerState::New,
                pending: HashMap::new(),
                outstanding: 0,
                localized: HashMap::new(),
                requested: Vec::new(),
                diagnostics: String::new(),
                exit_status: None,
                failed: false,
                launch_requested: false,
                launched: false,
                releases_posted: false,
            }),
        }
    }

    /// Returns the container id.
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Returns the launch context this container was submitted with.
    pub fn launch_context(&self) -> &ContainerLaunchContext {
        &self.launch
    }

    /// Returns the current internal state.
    pub fn state(&self) -> ContainerState {
        self.core.lock().unwrap().state
    }

    /// Returns the localized resource paths, for the launcher driver.
    pub fn localized_resources(&self) -> Vec<(LocalResourceKey, PathBuf)> {
        let core = self.core.lock().unwrap();
        core.localized
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect()
    }

    /// Clones a consistent status snapshot.
    pub fn status(&self) -> ContainerStatus {
        let core = self.core.lock().unwrap();
        let reported = match core.state {
            ContainerState::Done => {
                if core.exit_status == Some(0) && !core.failed {
                    ContainerState::ExitedWithSuccess
                } else {
                    ContainerState::ExitedWithFailure
                }
            }
            other => other,
        };
        ContainerStatus {
            container_id: self.id,
            state: reported,
            exit_status: core.exit_status,
            diagnostics: core.diagnostics.clone(),
        }
    }

    /// Applies one event, posting any follow-up events through `sender`.
    pub fn handle(&self, event: ContainerEvent, sender: &EventSender) {
        let mut core = self.core.lock().unwrap();

        if core.state == ContainerState::Done {
            warn!(container = %self.id, ?event, "event sent to finished container, dropped");
            return;
        }

        match event {
            ContainerEvent::Init { .. } => self.on_init(&mut core, sender),
            ContainerEvent::ResourceLocalized { key, path, .. } => {
                self.on_resource_localized(&mut core, sender, key, path)
            }
            ContainerEvent::ResourceFailed {
                key, diagnostics, ..
            } => self.on_resource_failed(&mut core, sender, key, diagnostics),
            ContainerEvent::Launched { .. } => self.on_launched(&mut core),
            ContainerEvent::Exited { code, .. } => self.on_exited(&mut core, sender, code),
            ContainerEvent::Kill { .. } => self.on_kill(&mut core, sender),
            ContainerEvent::CleanupDone { .. } => self.on_cleanup_done(&mut core, sender),
            ContainerEvent::DiagnosticsUpdate { message, .. } => {
                append_diagnostics(&mut core, &message);
            }
        }
    }

    fn on_init(&self, core: &mut ContainerCore, sender: &EventSender) {
        if core.state != ContainerState::New {
            self.illegal(core, "INIT");
            return;
        }

        if self.launch.resources.is_empty() {
            // Nothing to localize: straight to launch.
            core.state = ContainerState::Localized;
            self.request_launch(core, sender);
            return;
        }

        core.state = ContainerState::Localizing;
        for key in &self.launch.resources {
            *core.pending.entry(key.clone()).or_insert(0) += 1;
            core.outstanding += 1;
            core.requested.push(key.clone());
            sender.post(NodeEvent::Localization(LocalizationEvent::Request {
                container: self.id,
                key: key.clone(),
            }));
        }
        debug!(
            container = %self.id,
            resources = core.outstanding,
            "container localizing"
        );
    }

    fn on_resource_localized(
        &self,
        core: &mut ContainerCore,
        sender: &EventSender,
        key: LocalResourceKey,
        path: PathBuf,
    ) {
        match core.state {
            ContainerState::Localizing => {}
            // A fetch that raced a kill; the claim is already released.
            ContainerState::Killing => return,
            _ => {
                self.illegal(core, "RESOURCE_LOCALIZED");
                return;
            }
        }

        let Some(remaining) = core.pending.get_mut(&key) else {
            warn!(container = %self.id, %key, "localized notification for unclaimed resource");
            return;
        };
        *remaining -= 1;
        if *remaining == 0 {
            core.pending.remove(&key);
        }
        core.outstanding -= 1;
        core.localized.insert(key, path);

        if core.outstanding == 0 {
            core.state = ContainerState::Localized;
            self.request_launch(core, sender);
        }
    }

    fn on_resource_failed(
        &self,
        core: &mut ContainerCore,
        sender: &EventSender,
        key: LocalResourceKey,
        diagnostics: String,
    ) {
        append_diagnostics(core, &format!("Failed to localize {}: {}", key, diagnostics));

        match core.state {
            ContainerState::Localizing => {
                core.failed = true;
                core.state = ContainerState::Killing;
                info!(container = %self.id, %key, "localization failed, aborting container");
                self.post_releases(core, sender);
            }
            // Further failures while already aborting only add diagnostics.
            ContainerState::Killing => {}
            _ => self.illegal(core, "RESOURCE_FAILED"),
        }
    }

    fn on_launched(&self, core: &mut ContainerCore) {
        match core.state {
            ContainerState::Localized => {
                core.launched = true;
                core.state = ContainerState::Running;
                info!(container = %self.id, "container running");
            }
            // The kill raced the launch; the driver escalates, we just
            // record that a process now exists.
            ContainerState::Killing => core.launched = true,
            _ => self.illegal(core, "LAUNCHED"),
        }
    }

    fn on_exited(&self, core: &mut ContainerCore, sender: &EventSender, code: i32) {
        match core.state {
            ContainerState::Running | ContainerState::Localized => {
                core.exit_status = Some(code);
                if core.state == ContainerState::Localized {
                    // Exited before Launched: the launch itself failed.
                    core.failed = true;
                }
                core.state = if code == 0 && !core.failed {
                    ContainerState::ExitedWithSuccess
                } else {
                    ContainerState::ExitedWithFailure
                };
                info!(container = %self.id, code, state = %core.state, "container exited");
                self.post_releases(core, sender);
            }
            ContainerState::Killing => {
                core.exit_status = Some(code);
                self.post_releases(core, sender);
            }
            _ => self.illegal(core, "EXITED"),
        }
    }

    fn on_kill(&self, core: &mut ContainerCore, sender: &EventSender) {
        match core.state {
            // Idempotent once already on the way out.
            ContainerState::Killing => {}
            s if s.is_exited() => {}
            _ => {
                info!(container = %self.id, from = %core.state, "killing container");
                core.state = ContainerState::Killing;
                if core.launch_requested {
                    // A process exists (or is about to); stop it and wait
                    // for Exited before releasing resources.
                    sender.post(NodeEvent::Launcher(LauncherEvent::Cleanup {
                        container: self.id,
                    }));
                } else {
                    self.post_releases(core, sender);
                }
            }
        }
    }

    fn on_cleanup_done(&self, core: &mut ContainerCore, sender: &EventSender) {
        match core.state {
            ContainerState::Killing
            | ContainerState::ExitedWithSuccess
            | ContainerState::ExitedWithFailure => {
                core.state = ContainerState::Done;
                debug!(container = %self.id, "container done");
                sender.post(NodeEvent::Application(ApplicationEvent::ContainerFinished {
                    application: self.id.application,
                    container: self.id,
                }));
            }
            _ => self.illegal(core, "CLEANUP_DONE"),
        }
    }

    /// Posts the resource-release handshake exactly once. Containers that
    /// never claimed anything skip the tracker round-trip and acknowledge
    /// themselves.
    fn post_releases(&self, core: &mut ContainerCore, sender: &EventSender) {
        if core.releases_posted {
            return;
        }
        core.releases_posted = true;

        if core.requested.is_empty() {
            sender.post(NodeEvent::Container(ContainerEvent::CleanupDone {
                container: self.id,
            }));
        } else {
            sender.post(NodeEvent::Localization(LocalizationEvent::ReleaseResources {
                container: self.id,
                keys: core.requested.clone(),
            }));
        }
    }

    fn request_launch(&self, core: &mut ContainerCore, sender: &EventSender) {
        core.launch_requested = true;
        sender.post(NodeEvent::Launcher(LauncherEvent::Launch {
            container: self.id,
        }));
    }

    fn illegal(&self, core: &ContainerCore, event: &str) {
        error!(
            container = %self.id,
            state = %core.state,
            event,
            "illegal event for current state, dropped"
        );
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn append_diagnostics(core: &mut ContainerCore, message: &str) {
    if !core.diagnostics.is_empty() {
        core.diagnostics.push('\n');
    }
    core.diagnostics.push_str(message);
}
