//! The asynchronous event bus driving every state machine.
//!
//! One unbounded channel, one consumer loop. Handlers are registered per
//! [`EventClass`] and invoked synchronously on the consumer, which gives
//! the two ordering guarantees the engine depends on: strict FIFO across
//! the bus, and therefore strict FIFO for any single entity. Posting
//! never suspends the caller.
//!
//! Handlers must not block: they mutate registry state and post follow-up
//! events. Anything that touches the network or disk runs on spawned
//! tasks whose completions come back through the bus.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{EventClass, NodeEvent};

/// A registered consumer of one event class.
pub trait EventHandler: Send + Sync {
    /// Handles one event. Called on the dispatcher loop; must not block.
    fn handle(&self, event: NodeEvent);
}

/// Cloneable posting side of the bus.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl EventSender {
    /// Posts an event. Never blocks; events posted after the bus has shut
    /// down are dropped with a debug log.
    pub fn post(&self, event: NodeEvent) {
        if let Err(rejected) = self.tx.send(event) {
            debug!(event = ?rejected.0, "event dropped, dispatcher stopped");
        }
    }
}

/// The event bus.
///
/// Built once at engine construction, loaded with handlers, then consumed
/// by [`run`](Dispatcher::run) for the lifetime of the node agent.
pub struct Dispatcher {
    handlers: HashMap<EventClass, Arc<dyn EventHandler>>,
    tx: mpsc::UnboundedSender<NodeEvent>,
    rx: mpsc::UnboundedReceiver<NodeEvent>,
}

impl Dispatcher {
    /// Creates an empty bus.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handlers: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Returns a posting handle. Senders stay valid for the life of the
    /// bus and may be cloned freely across threads.
    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Registers the handler for one event class, replacing any previous
    /// registration for that class.
    pub fn register(&mut self, class: EventClass, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(class, handler);
    }

    /// Drains the bus until shutdown is signalled.
    ///
    /// Queued events still in the channel at shutdown are dropped; the
    /// delivery guarantee is at-most-once.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("dispatcher stopped");
                    break;
                }

                maybe = self.rx.recv() => {
                    match maybe {
                        Some(event) => self.dispatch(event),
                        // All senders gone, including our own clone: unreachable
                        // in practice, but treat as shutdown.
                        None => break,
                    }
                }
            }
        }
    }

    fn dispatch(&self, event: NodeEvent) {
        let class = event.class();
        let Some(handler) = self.handlers.get(&class) else {
            warn!(?class, ?event, "no handler registered, event dropped");
            return;
        };

        // A handler that unwinds must not take the bus down with it; the
        // targeted entity's own FSM decides whether the failure is fatal.
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(event)));
        if outcome.is_err() {
            error!(?class, "event handler panicked, event lost");
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ContainerEvent;
    use crate::records::{ApplicationId, ContainerId};
    use std::sync::Mutex;
    use std::time::Duration;

    fn cid(seq: u32) -> ContainerId {
        ContainerId::new(ApplicationId::new(100, 1), seq)
    }

    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    impl EventHandler for Recorder {
        fn handle(&self, event: NodeEvent) {
            if let NodeEvent::Container(e) = event {
                self.seen.lock().unwrap().push(e.container().sequence);
            }
        }
    }

    struct Panicker;

    impl EventHandler for Panicker {
        fn handle(&self, _event: NodeEvent) {
            panic!("handler blew up");
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn events_delivered_in_post_order() {
        let mut dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        dispatcher.register(EventClass::Container, recorder.clone());

        let sender = dispatcher.sender();
        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(dispatcher.run(shutdown.clone()));

        for seq in 0..50 {
            sender.post(NodeEvent::Container(ContainerEvent::Init {
                container: cid(seq),
            }));
        }

        wait_until(|| recorder.seen.lock().unwrap().len() == 50).await;
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());

        shutdown.cancel();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn unregistered_class_is_dropped_not_fatal() {
        let mut dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        dispatcher.register(EventClass::Container, recorder.clone());

        let sender = dispatcher.sender();
        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(dispatcher.run(shutdown.clone()));

        // No Application handler registered.
        sender.post(NodeEvent::Application(
            crate::events::ApplicationEvent::Init { container: cid(0) },
        ));
        sender.post(NodeEvent::Container(ContainerEvent::Init {
            container: cid(1),
        }));

        wait_until(|| recorder.seen.lock().unwrap().len() == 1).await;
        assert_eq!(recorder.seen.lock().unwrap()[0], 1);

        shutdown.cancel();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn handler_panic_does_not_stop_the_bus() {
        let mut dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        dispatcher.register(EventClass::Application, Arc::new(Panicker));
        dispatcher.register(EventClass::Container, recorder.clone());

        let sender = dispatcher.sender();
        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(dispatcher.run(shutdown.clone()));

        sender.post(NodeEvent::Application(
            crate::events::ApplicationEvent::Init { container: cid(0) },
        ));
        sender.post(NodeEvent::Container(ContainerEvent::Init {
            container: cid(7),
        }));

        wait_until(|| recorder.seen.lock().unwrap().len() == 1).await;
        assert_eq!(recorder.seen.lock().unwrap()[0], 7);

        shutdown.cancel();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn post_after_shutdown_is_silent() {
        let dispatcher = Dispatcher::new();
        let sender = dispatcher.sender();
        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(dispatcher.run(shutdown.clone()));

        shutdown.cancel();
        loop_handle.await.unwrap();

        // Receiver is gone; post must not panic or block.
        sender.post(NodeEvent::Container(ContainerEvent::Init {
            container: cid(0),
        }));
    }
}
