//! The application state machine.
//!
//! An application groups the containers of one submitted job. It gates
//! container initialization behind its own bootstrap and owns the final
//! cleanup scope: when the controller has asked for the application to
//! finish and the last container is done, application-scoped resources
//! are released before the application leaves the node.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::events::{
    ApplicationEvent, ContainerEvent, EventSender, LocalizationEvent, NodeEvent,
};
use crate::records::{ApplicationId, ContainerId};

/// Lifecycle states of an application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplicationState {
    /// Record exists, bootstrap not started.
    New,
    /// Bootstrap in progress; container inits are queued.
    Initing,
    /// Containers run; new containers init directly.
    Running,
    /// Finish requested; waiting for live containers to terminate.
    FinishingContainers,
    /// Last container done; waiting for resource cleanup.
    FinishingApp,
    /// Terminal.
    Done,
}

impl std::fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::Initing => write!(f, "INITING"),
            Self::Running => write!(f, "RUNNING"),
            Self::FinishingContainers => write!(f, "FINISHING_CONTAINERS"),
            Self::FinishingApp => write!(f, "FINISHING_APP"),
            Self::Done => write!(f, "DONE"),
        }
    }
}

struct ApplicationCore {
    state: ApplicationState,
    /// Every container ever accepted for this application.
    containers: HashSet<ContainerId>,
    /// Containers that have not yet reported finished.
    live: HashSet<ContainerId>,
    /// Containers waiting for bootstrap before their Init is forwarded.
    pending_init: Vec<ContainerId>,
    /// The controller asked for teardown.
    finish_requested: bool,
}

/// One application's record and state machine.
pub struct Application {
    id: ApplicationId,
    user: String,
    core: Mutex<ApplicationCore>,
}

impl Application {
    /// Creates an application record in the New state.
    pub fn new(id: ApplicationId, user: impl Into<String>) -> Self {
        Self {
            id,
            user: user.into(),
            core: Mutex::new(ApplicationCore {
                state: ApplicationState::New,
                containers: HashSet::new(),
                live: HashSet::new(),
                pending_init: Vec::new(),
                finish_requested: false,
            }),
        }
    }

    /// Returns the application id.
    pub fn id(&self) -> ApplicationId {
        self.id
    }

    /// Returns the submitting user, the Private cache scope.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the current state.
    pub fn state(&self) -> ApplicationState {
        self.core.lock().unwrap().state
    }

    /// Returns the number of containers not yet finished.
    pub fn live_containers(&self) -> usize {
        self.core.lock().unwrap().live.len()
    }

    /// Applies one event, posting follow-ups through `sender`.
    pub fn handle(&self, event: ApplicationEvent, sender: &EventSender) {
        let mut core = self.core.lock().unwrap();
        match event {
            ApplicationEvent::Init { container } => self.on_init(&mut core, sender, container),
            ApplicationEvent::Inited { .. } => self.on_inited(&mut core, sender),
            ApplicationEvent::ContainerFinished { container, .. } => {
                self.on_container_finished(&mut core, sender, container)
            }
            ApplicationEvent::Finish { .. } => self.on_finish(&mut core, sender),
            ApplicationEvent::ResourcesCleaned { .. } => self.on_resources_cleaned(&mut core),
        }
    }

    fn on_init(&self, core: &mut ApplicationCore, sender: &EventSender, container: ContainerId) {
        core.containers.insert(container);
        core.live.insert(container);

        match core.state {
            ApplicationState::New => {
                core.state = ApplicationState::Initing;
                core.pending_init.push(container);
                info!(application = %self.id, user = %self.user, "application initing");
                // Bootstrap has no external work in the core; completion
                // arrives as an ordinary event to keep the log auditable.
                sender.post(NodeEvent::Application(ApplicationEvent::Inited {
                    application: self.id,
                }));
            }
            ApplicationState::Initing => {
                core.pending_init.push(container);
            }
            ApplicationState::Running => {
                sender.post(NodeEvent::Container(ContainerEvent::Init { container }));
            }
            ApplicationState::FinishingContainers
            | ApplicationState::FinishingApp
            | ApplicationState::Done => {
                // Too late to run anything new; kill it so its record
                // still flows through the normal terminal path.
                warn!(
                    application = %self.id,
                    %container,
                    "container arrived for finishing application, killing"
                );
                sender.post(NodeEvent::Container(ContainerEvent::DiagnosticsUpdate {
                    container,
                    message: "Application is finishing on this node.".to_string(),
                }));
                sender.post(NodeEvent::Container(ContainerEvent::Kill { container }));
            }
        }
    }

    fn on_inited(&self, core: &mut ApplicationCore, sender: &EventSender) {
        if core.state != ApplicationState::Initing {
            warn!(application = %self.id, state = %core.state, "unexpected INITED, dropped");
            return;
        }
        core.state = ApplicationState::Running;
        debug!(application = %self.id, "application running");
        for container in core.pending_init.drain(..) {
            sender.post(NodeEvent::Container(ContainerEvent::Init { container }));
        }
    }

    fn on_container_finished(
        &self,
        core: &mut ApplicationCore,
        sender: &EventSender,
        container: ContainerId,
    ) {
        if !core.live.remove(&container) {
            warn!(application = %self.id, %container, "finish for unknown container, dropped");
            return;
        }
        debug!(
            application = %self.id,
            %container,
            remaining = core.live.len(),
            "container finished"
        );

        let draining = matches!(
            core.state,
            ApplicationState::Running | ApplicationState::FinishingContainers
        );
        if draining && core.finish_requested && core.live.is_empty() {
            self.start_resource_cleanup(core, sender);
        }
    }

    fn on_finish(&self, core: &mut ApplicationCore, sender: &EventSender) {
        if core.finish_requested {
            debug!(application = %self.id, "duplicate FINISH_APPLICATION, dropped");
            return;
        }
        core.finish_requested = true;

        match core.state {
            ApplicationState::New
            | ApplicationState::Initing
            | ApplicationState::Running => {
                if core.live.is_empty() {
                    self.start_resource_cleanup(core, sender);
                } else {
                    core.state = ApplicationState::FinishingContainers;
                    info!(
                        application = %self.id,
                        live = core.live.len(),
                        "finishing application, killing remaining containers"
                    );
                    for container in core.live.iter().copied() {
                        sender.post(NodeEvent::Container(ContainerEvent::Kill { container }));
                    }
                }
            }
            ApplicationState::FinishingContainers
            | ApplicationState::FinishingApp
            | ApplicationState::Done => {}
        }
    }

    fn on_resources_cleaned(&self, core: &mut ApplicationCore) {
        if core.state != ApplicationState::FinishingApp {
            warn!(
                application = %self.id,
                state = %core.state,
                "unexpected RESOURCES_CLEANED, dropped"
            );
            return;
        }
        core.state = ApplicationState::Done;
        core.containers.clear();
        info!(application = %self.id, "application done");
    }

    fn start_resource_cleanup(&self, core: &mut ApplicationCore, sender: &EventSender) {
        core.state = ApplicationState::FinishingApp;
        sender.post(NodeEvent::Localization(LocalizationEvent::CleanupApplication {
            application: self.id,
        }));
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Dispatcher;
    use crate::records::ApplicationId;

    fn aid() -> ApplicationId {
        ApplicationId::new(100, 1)
    }

    fn cid(seq: u32) -> ContainerId {
        ContainerId::new(aid(), seq)
    }

    fn sender() -> EventSender {
        Dispatcher::new().sender()
    }

    fn init(app: &Application, seq: u32, s: &EventSender) {
        app.handle(ApplicationEvent::Init { container: cid(seq) }, s);
    }

    fn inited(app: &Application, s: &EventSender) {
        app.handle(
            ApplicationEvent::Inited {
                application: app.id(),
            },
            s,
        );
    }

    fn finished(app: &Application, seq: u32, s: &EventSender) {
        app.handle(
            ApplicationEvent::ContainerFinished {
                application: app.id(),
                container: cid(seq),
            },
            s,
        );
    }

    #[test]
    fn first_init_bootstraps_the_application() {
        let app = Application::new(aid(), "alice");
        let s = sender();
        init(&app, 0, &s);
        assert_eq!(app.state(), ApplicationState::Initing);

        inited(&app, &s);
        assert_eq!(app.state(), ApplicationState::Running);
    }

    #[test]
    fn containers_accumulate_while_initing() {
        let app = Application::new(aid(), "alice");
        let s = sender();
        init(&app, 0, &s);
        init(&app, 1, &s);
        assert_eq!(app.live_containers(), 2);
        assert_eq!(app.state(), ApplicationState::Initing);
    }

    #[test]
    fn finish_with_no_live_containers_goes_straight_to_cleanup() {
        let app = Application::new(aid(), "alice");
        let s = sender();
        init(&app, 0, &s);
        inited(&app, &s);
        finished(&app, 0, &s);

        app.handle(
            ApplicationEvent::Finish {
                application: app.id(),
            },
            &s,
        );
        assert_eq!(app.state(), ApplicationState::FinishingApp);

        app.handle(
            ApplicationEvent::ResourcesCleaned {
                application: app.id(),
            },
            &s,
        );
        assert_eq!(app.state(), ApplicationState::Done);
    }

    #[test]
    fn finish_waits_for_live_containers() {
        let app = Application::new(aid(), "alice");
        let s = sender();
        init(&app, 0, &s);
        init(&app, 1, &s);
        inited(&app, &s);
        finished(&app, 0, &s);

        app.handle(
            ApplicationEvent::Finish {
                application: app.id(),
            },
            &s,
        );
        assert_eq!(app.state(), ApplicationState::FinishingContainers);

        finished(&app, 1, &s);
        assert_eq!(app.state(), ApplicationState::FinishingApp);
    }

    #[test]
    fn container_finish_without_latch_leaves_app_running() {
        let app = Application::new(aid(), "alice");
        let s = sender();
        init(&app, 0, &s);
        inited(&app, &s);
        finished(&app, 0, &s);
        assert_eq!(app.state(), ApplicationState::Running);
    }

    #[test]
    fn unknown_container_finish_is_dropped() {
        let app = Application::new(aid(), "alice");
        let s = sender();
        init(&app, 0, &s);
        inited(&app, &s);
        finished(&app, 9, &s);
        assert_eq!(app.live_containers(), 1);
    }

    #[test]
    fn duplicate_finish_is_dropped() {
        let app = Application::new(aid(), "alice");
        let s = sender();
        init(&app, 0, &s);
        inited(&app, &s);
        app.handle(
            ApplicationEvent::Finish {
                application: app.id(),
            },
            &s,
        );
        app.handle(
            ApplicationEvent::Finish {
                application: app.id(),
            },
            &s,
        );
        assert_eq!(app.state(), ApplicationState::FinishingContainers);
    }

    #[test]
    fn done_application_has_no_containers() {
        let app = Application::new(aid(), "alice");
        let s = sender();
        init(&app, 0, &s);
        inited(&app, &s);
        finished(&app, 0, &s);
        app.handle(
            ApplicationEvent::Finish {
                application: app.id(),
            },
            &s,
        );
        app.handle(
            ApplicationEvent::ResourcesCleaned {
                application: app.id(),
            },
            &s,
        );
        assert_eq!(app.state(), ApplicationState::Done);
        assert_eq!(app.live_containers(), 0);
    }
}
