//! Container lifecycle: the per-container state machine, the event
//! handler that routes bus traffic to it, and the launcher driver that
//! bridges to the external executor.

mod container;
pub mod launcher;

pub use container::{Container, ContainerState, ContainerStatus};
pub use launcher::{
    ContainerLauncher, KillTimings, LaunchSpec, LauncherDriver, RunningContainer,
    EXIT_LAUNCH_FAILED, EXIT_UNRESPONSIVE,
};

use std::sync::Arc;

use tracing::{error, warn};

use crate::context::Context;
use crate::events::{EventHandler, EventSender, NodeEvent};

/// Routes container events to the targeted container's FSM.
///
/// Events for containers no longer (or not yet) registered are dropped
/// with a warning; a late event for a departed container is routine
/// during teardown, not an error.
pub struct ContainerEventHandler {
    context: Arc<Context>,
    sender: EventSender,
}

impl ContainerEventHandler {
    /// Creates the handler over the shared registries.
    pub fn new(context: Arc<Context>, sender: EventSender) -> Self {
        Self { context, sender }
    }
}

impl EventHandler for ContainerEventHandler {
    fn handle(&self, event: NodeEvent) {
        let NodeEvent::Container(event) = event else {
            error!(?event, "container handler received foreign event class");
            return;
        };
        let id = event.container();
        match self.context.container(&id) {
            Some(container) => container.handle(event, &self.sender),
            None => warn!(container = %id, ?event, "event sent to absent container"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ContainerEvent, Dispatcher};
    use crate::records::{ApplicationId, ContainerId, ContainerLaunchContext};

    fn cid() -> ContainerId {
        ContainerId::new(ApplicationId::new(100, 1), 0)
    }

    #[test]
    fn routes_to_registered_container() {
        let ctx = Arc::new(Context::new());
        let container = Arc::new(Container::new(ContainerLaunchContext::new(cid(), "alice")));
        ctx.insert_container_if_absent(Arc::clone(&container))
            .unwrap();

        let handler = ContainerEventHandler::new(Arc::clone(&ctx), Dispatcher::new().sender());
        handler.handle(NodeEvent::Container(ContainerEvent::Init {
            container: cid(),
        }));

        assert_eq!(container.state(), ContainerState::Localized);
    }

    #[test]
    fn absent_container_event_is_dropped() {
        let ctx = Arc::new(Context::new());
        let handler = ContainerEventHandler::new(ctx, Dispatcher::new().sender());
        // Must not panic.
        handler.handle(NodeEvent::Container(ContainerEvent::Kill {
            container: cid(),
        }));
    }
}
