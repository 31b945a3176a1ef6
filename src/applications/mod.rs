//! Application lifecycle: the per-application state machine and the
//! event handler that routes bus traffic to it.

mod application;

pub use application::{Application, ApplicationState};

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::context::Context;
use crate::events::{ApplicationEvent, EventHandler, EventSender, NodeEvent};

/// Routes application events to the targeted application's FSM and
/// retires Done applications from the registries.
pub struct ApplicationEventHandler {
    context: Arc<Context>,
    sender: EventSender,
}

impl ApplicationEventHandler {
    /// Creates the handler over the shared registries.
    pub fn new(context: Arc<Context>, sender: EventSender) -> Self {
        Self { context, sender }
    }
}

impl EventHandler for ApplicationEventHandler {
    fn handle(&self, event: NodeEvent) {
        let NodeEvent::Application(event) = event else {
            error!(?event, "application handler received foreign event class");
            return;
        };
        let id = event.application();
        let Some(application) = self.context.application(&id) else {
            warn!(application = %id, ?event, "event sent to absent application");
            return;
        };

        let was_cleaned = matches!(event, ApplicationEvent::ResourcesCleaned { .. });
        application.handle(event, &self.sender);

        // Terminal-state removal belongs to the owning FSM's handler:
        // once Done, the application and its containers leave the node.
        if was_cleaned && application.state() == ApplicationState::Done {
            self.context.remove_application(&id);
            info!(application = %id, "application removed from node");
        }
    }
}
