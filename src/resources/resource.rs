//! The per-resource state machine.
//!
//! A localized resource is one cached materialization of a remote
//! object, reference-counted by the containers that claimed it. The FSM
//! is deliberately small and pure: [`LocalizedResource::handle`] applies
//! one event under the resource's lock and returns the follow-up
//! [`ResourceAction`]s for the tracker to carry out, so every row of the
//! transition table can be exercised without a dispatcher or a cache.
//!
//! ```text
//!            REQUEST                LOCALIZED
//!   INIT ─────────────► DOWNLOADING ─────────► LOCALIZED
//!    ▲                      │                      │
//!    └──────────────────────┘                      │
//!      RELEASE (refs empty)       REQUEST/RELEASE ─┘ (self loops)
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, warn};

use crate::records::{ContainerId, LocalResourceKey};

/// Localization states of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceState {
    /// No fetch in flight; not on disk.
    Init,
    /// At least one container waits; a fetch may be in flight.
    Downloading,
    /// On disk at a known path.
    Localized,
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::Downloading => write!(f, "DOWNLOADING"),
            Self::Localized => write!(f, "LOCALIZED"),
        }
    }
}

/// Events accepted by the resource FSM.
#[derive(Debug)]
pub enum ResourceEvent {
    /// A container claims the resource.
    Request {
        /// Claiming container.
        container: ContainerId,
    },
    /// The resource materialized on disk.
    Localized {
        /// Local path.
        path: PathBuf,
        /// Size on disk in bytes.
        size: i64,
    },
    /// A container gives up its claim.
    Release {
        /// Releasing container.
        container: ContainerId,
    },
}

/// Follow-up work a transition asks of the tracker.
#[derive(Debug, PartialEq, Eq)]
pub enum ResourceAction {
    /// Start (or re-attempt) a fetch; gated by the fetch permit.
    StartFetch,
    /// Tell one container its resource is ready at `path`.
    Notify(ContainerId, PathBuf),
    /// Tell every listed claim holder the resource is ready at `path`.
    NotifyAll(Vec<ContainerId>, PathBuf),
}

struct ResourceCore {
    state: ResourceState,
    /// Ordered claim holders; one entry per outstanding claim, so the
    /// same container may appear more than once.
    refs: Vec<ContainerId>,
    local_path: Option<PathBuf>,
    size: i64,
    last_touch: Instant,
}

/// One cached, reference-counted resource.
pub struct LocalizedResource {
    key: LocalResourceKey,
    /// Single-holder fetch guard: at most one downloader works on this
    /// resource at any instant.
    fetch_permit: AtomicBool,
    core: Mutex<ResourceCore>,
}

impl LocalizedResource {
    /// Creates a resource in the Init state.
    pub fn new(key: LocalResourceKey) -> Self {
        Self {
            key,
            fetch_permit: AtomicBool::new(false),
            core: Mutex::new(ResourceCore {
                state: ResourceState::Init,
                refs: Vec::new(),
                local_path: None,
                size: -1,
                last_touch: Instant::now(),
            }),
        }
    }

    /// Returns the cache key.
    pub fn key(&self) -> &LocalResourceKey {
        &self.key
    }

    /// Returns the current state.
    pub fn state(&self) -> ResourceState {
        self.core.lock().unwrap().state
    }

    /// Returns the local path once Localized.
    pub fn local_path(&self) -> Option<PathBuf> {
        self.core.lock().unwrap().local_path.clone()
    }

    /// Returns the size on disk, or -1 before localization.
    pub fn size(&self) -> i64 {
        self.core.lock().unwrap().size
    }

    /// Returns a snapshot of the claim holders.
    pub fn refs(&self) -> Vec<ContainerId> {
        self.core.lock().unwrap().refs.clone()
    }

    /// Returns true when nothing claims the resource.
    pub fn refs_is_empty(&self) -> bool {
        self.core.lock().unwrap().refs.is_empty()
    }

    /// Returns the last release time, the eviction ordering key.
    pub fn last_touch(&self) -> Instant {
        self.core.lock().unwrap().last_touch
    }

    /// Attempts to take the fetch permit. Returns true when this caller
    /// is now the single fetcher.
    pub fn try_acquire_fetch(&self) -> bool {
        self.fetch_permit
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns the fetch permit after a fetch settles.
    pub fn release_fetch(&self) {
        self.fetch_permit.store(false, Ordering::Release);
    }

    /// Applies one event and returns the follow-up actions.
    ///
    /// Handling is synchronized per resource: the core lock is held for
    /// the whole transition.
    pub fn handle(&self, event: ResourceEvent) -> Vec<ResourceAction> {
        let mut core = self.core.lock().unwrap();
        match (core.state, event) {
            // INIT
            (ResourceState::Init, ResourceEvent::Request { container }) => {
                core.refs.push(container);
                core.state = ResourceState::Downloading;
                vec![ResourceAction::StartFetch]
            }
            (ResourceState::Init, ResourceEvent::Localized { path, size }) => {
                warn!(key = %self.key, "resource localized without listening container");
                self.store_localized(&mut core, path, size)
            }
            (ResourceState::Init, ResourceEvent::Release { container }) => {
                self.release_ref(&mut core, container);
                vec![]
            }

            // DOWNLOADING
            (ResourceState::Downloading, ResourceEvent::Request { container }) => {
                core.refs.push(container);
                vec![ResourceAction::StartFetch]
            }
            (ResourceState::Downloading, ResourceEvent::Localized { path, size }) => {
                self.store_localized(&mut core, path, size)
            }
            (ResourceState::Downloading, ResourceEvent::Release { container }) => {
                self.release_ref(&mut core, container);
                if core.refs.is_empty() {
                    core.state = ResourceState::Init;
                }
                vec![]
            }

            // LOCALIZED
            (ResourceState::Localized, ResourceEvent::Request { container }) => {
                core.refs.push(container);
                match core.local_path.clone() {
                    Some(path) => vec![ResourceAction::Notify(container, path)],
                    // Unreachable by construction (Localized implies a
                    // stored path); degrade to a dropped event.
                    None => {
                        warn!(key = %self.key, "localized resource without a path");
                        vec![]
                    }
                }
            }
            (ResourceState::Localized, ResourceEvent::Localized { .. }) => {
                debug!(key = %self.key, "duplicate localization completion, dropped");
                vec![]
            }
            (ResourceState::Localized, ResourceEvent::Release { container }) => {
                self.release_ref(&mut core, container);
                vec![]
            }
        }
    }

    fn store_localized(
        &self,
        core: &mut ResourceCore,
        path: PathBuf,
        size: i64,
    ) -> Vec<ResourceAction> {
        core.local_path = Some(path.clone());
        core.size = size;
        core.state = ResourceState::Localized;
        vec![ResourceAction::NotifyAll(core.refs.clone(), path)]
    }

    /// Removes one claim. A release from a container that holds no claim
    /// is logged and otherwise ignored; the debug assertion is a
    /// development aid, not a contract.
    fn release_ref(&self, core: &mut ResourceCore, container: ContainerId) {
        match core.refs.iter().position(|c| *c == container) {
            Some(index) => {
                core.refs.remove(index);
            }
            None => {
                warn!(
                    key = %self.key,
                    %container,
                    "release claim from unregistered container"
                );
                debug_assert!(false, "release from unregistered container {}", container);
            }
        }
        core.last_touch = Instant::now();
    }
}

impl std::fmt::Display for LocalizedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock().unwrap();
        let location = match &core.local_path {
            Some(path) => path.display().to_string(),
            None => "pending".to_string(),
        };
        write!(f, "{{ {} {} {} refs={} }}", self.key, core.state, location, core.refs.len())
    }
}
