//! The localization coordinator.
//!
//! Owns every [`LocalizedResource`] on the node, partitioned by sharing
//! scope, and brokers fetch slots: however many containers claim a
//! resource concurrently, at most one downloader task is ever in flight
//! for it. The tracker is registered on the bus for the Localization
//! event class; downloader completions come back through the same bus,
//! so all cache mutation happens on the dispatcher loop.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::events::{
    ApplicationEvent, ContainerEvent, EventHandler, EventSender, LocalizationEvent, NodeEvent,
};
use crate::records::{ApplicationId, ContainerId, LocalResourceKey, ResourceVisibility};

use super::downloader::ResourceDownloader;
use super::resource::{LocalizedResource, ResourceAction, ResourceEvent};

/// Cache partition a resource lives in.
///
/// Public resources share one partition across the node; Private and
/// Application resources are additionally keyed by user or application,
/// so identical keys localize independently per scope.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum CacheScope {
    /// Node-wide shared cache.
    Public,
    /// Per-user cache for Private resources.
    User(String),
    /// Per-application cache, released with the application.
    Application(ApplicationId),
}

impl std::fmt::Display for CacheScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::User(user) => write!(f, "user:{}", user),
            Self::Application(app) => write!(f, "app:{}", app),
        }
    }
}

/// Composite cache key: partition plus resource identity.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct CacheRef {
    scope: CacheScope,
    key: LocalResourceKey,
}

/// The node's resource cache and fetch broker.
pub struct ResourceTracker {
    context: Arc<Context>,
    sender: EventSender,
    downloader: Arc<dyn ResourceDownloader>,
    local_dirs: Vec<PathBuf>,
    cache: DashMap<CacheRef, Arc<LocalizedResource>>,
}

impl ResourceTracker {
    /// Creates a tracker over the shared registries.
    pub fn new(
        context: Arc<Context>,
        sender: EventSender,
        downloader: Arc<dyn ResourceDownloader>,
        local_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            context,
            sender,
            downloader,
            local_dirs,
            cache: DashMap::new(),
        }
    }

    /// Returns the number of cached resources across all partitions.
    pub fn cached_resources(&self) -> usize {
        self.cache.len()
    }

    /// Looks up a resource for inspection.
    pub fn resource(
        &self,
        scope: &CacheScope,
        key: &LocalResourceKey,
    ) -> Option<Arc<LocalizedResource>> {
        let cache_ref = CacheRef {
            scope: scope.clone(),
            key: key.clone(),
        };
        self.cache.get(&cache_ref).map(|entry| Arc::clone(&entry))
    }

    /// A container claims a resource: create the cache entry if absent,
    /// feed the claim to its FSM, and start a fetch if one is needed and
    /// nobody else is fetching.
    fn handle_request(&self, container: ContainerId, key: LocalResourceKey) {
        let Some(scope) = self.resolve_scope(&key, container) else {
            warn!(%container, %key, "resource request from unknown container, dropped");
            return;
        };

        let cache_ref = CacheRef {
            scope: scope.clone(),
            key: key.clone(),
        };
        let resource = Arc::clone(
            &self
                .cache
                .entry(cache_ref)
                .or_insert_with(|| Arc::new(LocalizedResource::new(key.clone()))),
        );

        let actions = resource.handle(ResourceEvent::Request { container });
        self.apply(&scope, &resource, actions);
    }

    /// A downloader task finished; feed the completion to the FSM and
    /// give the fetch permit back.
    fn handle_fetch_complete(
        &self,
        scope: CacheScope,
        key: LocalResourceKey,
        path: PathBuf,
        size: i64,
    ) {
        let Some(resource) = self.resource(&scope, &key) else {
            // The last waiter released mid-flight and the entry was
            // dropped; the materialized bytes are simply forgotten.
            debug!(%scope, %key, "fetch completed for evicted resource, discarded");
            return;
        };

        info!(%key, path = %path.display(), size, "resource localized");
        let actions = resource.handle(ResourceEvent::Localized { path, size });
        resource.release_fetch();
        self.apply(&scope, &resource, actions);
    }

    /// A downloader task failed: every waiter must abort, their claims
    /// are dropped, and the entry leaves the cache if nothing holds it.
    fn handle_fetch_failed(&self, scope: CacheScope, key: LocalResourceKey, diagnostics: String) {
        let Some(resource) = self.resource(&scope, &key) else {
            debug!(%scope, %key, "fetch failure for evicted resource, discarded");
            return;
        };

        warn!(%key, %diagnostics, "resource localization failed");
        resource.release_fetch();

        let waiters = resource.refs();
        for container in &waiters {
            resource.handle(ResourceEvent::Release {
                container: *container,
            });
        }

        let mut notified: Vec<ContainerId> = Vec::new();
        for container in waiters {
            if notified.contains(&container) {
                continue;
            }
            notified.push(container);
            self.sender
                .post(NodeEvent::Container(ContainerEvent::ResourceFailed {
                    container,
                    key: key.clone(),
                    diagnostics: diagnostics.clone(),
                }));
        }

        if resource.refs_is_empty() {
            self.cache.remove(&CacheRef { scope, key });
        }
    }

    /// A container releases every claim it made, in claim order; the
    /// container is then told its cleanup is complete.
    fn handle_release(&self, container: ContainerId, keys: Vec<LocalResourceKey>) {
        for key in keys {
            let Some(scope) = self.resolve_scope(&key, container) else {
                warn!(%container, %key, "release from unknown container, dropped");
                continue;
            };
            match self.resource(&scope, &key) {
                Some(resource) => {
                    resource.handle(ResourceEvent::Release { container });
                }
                None => {
                    warn!(%container, %key, "release for untracked resource, dropped");
                }
            }
        }

        self.sender
            .post(NodeEvent::Container(ContainerEvent::CleanupDone {
                container,
            }));
    }

    /// Drops the whole application-scoped partition of a finished
    /// application, then acknowledges to the application FSM.
    fn handle_cleanup_application(&self, application: ApplicationId) {
        let scope = CacheScope::Application(application);
        let doomed: Vec<CacheRef> = self
            .cache
            .iter()
            .filter(|entry| entry.key().scope == scope)
            .map(|entry| entry.key().clone())
            .collect();

        for cache_ref in doomed {
            if let Some((_, resource)) = self.cache.remove(&cache_ref) {
                if !resource.refs_is_empty() {
                    warn!(
                        resource = %resource,
                        "application cleanup dropped a still-referenced resource"
                    );
                }
            }
        }

        debug!(%application, "application-scoped resources released");
        self.sender
            .post(NodeEvent::Application(ApplicationEvent::ResourcesCleaned {
                application,
            }));
    }

    /// Carries out the follow-up actions of one resource transition.
    fn apply(&self, scope: &CacheScope, resource: &Arc<LocalizedResource>, actions: Vec<ResourceAction>) {
        for action in actions {
            match action {
                ResourceAction::StartFetch => self.start_fetch(scope, resource),
                ResourceAction::Notify(container, path) => {
                    self.notify_localized(container, resource.key().clone(), path)
                }
                ResourceAction::NotifyAll(containers, path) => {
                    for container in containers {
                        self.notify_localized(container, resource.key().clone(), path.clone());
                    }
                }
            }
        }
    }

    /// Spawns one downloader task if this caller wins the fetch permit.
    /// Losing means a fetch is already in flight and its completion will
    /// serve every waiter.
    fn start_fetch(&self, scope: &CacheScope, resource: &Arc<LocalizedResource>) {
        if !resource.try_acquire_fetch() {
            debug!(key = %resource.key(), "fetch already in flight");
            return;
        }

        let key = resource.key().clone();
        let scope = scope.clone();
        let sender = self.sender.clone();
        let downloader = Arc::clone(&self.downloader);
        let local_dirs = self.local_dirs.clone();

        debug!(%key, downloader = downloader.name(), "starting fetch");
        tokio::spawn(async move {
            let outcome = downloader.fetch(key.clone(), local_dirs).await;
            let event = match outcome {
                Ok(fetched) => LocalizationEvent::FetchComplete {
                    scope,
                    key,
                    path: fetched.path,
                    size: fetched.size,
                },
                Err(cause) => LocalizationEvent::FetchFailed {
                    scope,
                    key,
                    diagnostics: cause.message,
                },
            };
            sender.post(NodeEvent::Localization(event));
        });
    }

    fn notify_localized(&self, container: ContainerId, key: LocalResourceKey, path: PathBuf) {
        self.sender
            .post(NodeEvent::Container(ContainerEvent::ResourceLocalized {
                container,
                key,
                path,
            }));
    }

    /// Maps a request to its cache partition. Private and Application
    /// scopes are resolved through the container record; a request from
    /// a departed container has no scope and is dropped.
    fn resolve_scope(&self, key: &LocalResourceKey, container: ContainerId) -> Option<CacheScope> {
        match key.visibility {
            ResourceVisibility::Public => Some(CacheScope::Public),
            ResourceVisibility::Application => {
                Some(CacheScope::Application(container.application))
            }
            ResourceVisibility::Private => self
                .context
                .container(&container)
                .map(|c| CacheScope::User(c.launch_context().user.clone())),
        }
    }

    /// Iterates the cache for the eviction pass.
    pub(super) fn entries_in_scope(
        &self,
        scope: &CacheScope,
    ) -> Vec<Arc<LocalizedResource>> {
        self.cache
            .iter()
            .filter(|entry| entry.key().scope == *scope)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Removes one entry during eviction.
    pub(super) fn remove_entry(&self, scope: &CacheScope, key: &LocalResourceKey) {
        self.cache.remove(&CacheRef {
            scope: scope.clone(),
            key: key.clone(),
        });
    }
}

impl EventHandler for ResourceTracker {
    fn handle(&self, event: NodeEvent) {
        let NodeEvent::Localization(event) = event else {
            error!(?event, "resource tracker received foreign event class");
            return;
        };
        match event {
            LocalizationEvent::Request { container, key } => self.handle_request(container, key),
            LocalizationEvent::FetchComplete {
                scope,
                key,
                path,
                size,
            } => self.handle_fetch_complete(scope, key, path, size),
            LocalizationEvent::FetchFailed {
                scope,
                key,
                diagnostics,
            } => self.handle_fetch_failed(scope, key, diagnostics),
            LocalizationEvent::ReleaseResources { container, keys } => {
                self.handle_release(container, keys)
            }
            LocalizationEvent::CleanupApplication { application } => {
                self.handle_cleanup_application(application)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::Container;
    use crate::error::DownloadError;
    use crate::events::Dispatcher;
    use crate::records::ContainerLaunchContext;
    use crate::resources::{FetchedResource, ResourceState};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn aid() -> ApplicationId {
        ApplicationId::new(100, 1)
    }

    fn cid(seq: u32) -> ContainerId {
        ContainerId::new(aid(), seq)
    }

    fn key(uri: &str, visibility: ResourceVisibility) -> LocalResourceKey {
        LocalResourceKey::new(uri, 10, 1, visibility)
    }

    /// Downloader that counts invocations and never completes on its
    /// own; completions are injected as events by the tests.
    struct CountingDownloader {
        fetches: AtomicUsize,
    }

    impl CountingDownloader {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
            })
        }
    }

    impl ResourceDownloader for CountingDownloader {
        fn fetch(
            &self,
            _key: LocalResourceKey,
            _local_dirs: Vec<PathBuf>,
        ) -> Pin<Box<dyn Future<Output = Result<FetchedResource, DownloadError>> + Send + 'static>>
        {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Box::pin(std::future::pending())
        }
    }

    fn tracker_with(
        downloader: Arc<CountingDownloader>,
    ) -> (ResourceTracker, Arc<Context>) {
        let context = Arc::new(Context::new());
        let sender = Dispatcher::new().sender();
        let tracker = ResourceTracker::new(
            Arc::clone(&context),
            sender,
            downloader,
            vec![PathBuf::from("/tmp/warden")],
        );
        (tracker, context)
    }

    fn register_container(context: &Context, seq: u32, user: &str) {
        context
            .insert_container_if_absent(Arc::new(Container::new(ContainerLaunchContext::new(
                cid(seq),
                user,
            ))))
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_requests_start_a_single_fetch() {
        let downloader = CountingDownloader::new();
        let (tracker, context) = tracker_with(Arc::clone(&downloader));
        register_container(&context, 0, "alice");
        register_container(&context, 1, "alice");
        let k = key("s3://x/a", ResourceVisibility::Public);

        tracker.handle_request(cid(0), k.clone());
        tracker.handle_request(cid(1), k.clone());

        // Yield so the spawned fetch tasks run.
        tokio::task::yield_now().await;
        assert_eq!(downloader.fetches.load(Ordering::SeqCst), 1);

        let resource = tracker.resource(&CacheScope::Public, &k).unwrap();
        assert_eq!(resource.state(), ResourceState::Downloading);
        assert_eq!(resource.refs(), vec![cid(0), cid(1)]);
    }

    #[tokio::test]
    async fn completion_transitions_the_resource() {
        let downloader = CountingDownloader::new();
        let (tracker, context) = tracker_with(downloader);
        register_container(&context, 0, "alice");
        let k = key("s3://x/a", ResourceVisibility::Public);

        tracker.handle_request(cid(0), k.clone());
        tracker.handle_fetch_complete(
            CacheScope::Public,
            k.clone(),
            PathBuf::from("/tmp/warden/a"),
            10,
        );

        let resource = tracker.resource(&CacheScope::Public, &k).unwrap();
        assert_eq!(resource.state(), ResourceState::Localized);
        assert_eq!(resource.local_path(), Some(PathBuf::from("/tmp/warden/a")));
    }

    #[tokio::test]
    async fn failure_clears_waiters_and_drops_the_entry() {
        let downloader = CountingDownloader::new();
        let (tracker, context) = tracker_with(downloader);
        register_container(&context, 0, "alice");
        register_container(&context, 1, "alice");
        let k = key("s3://x/a", ResourceVisibility::Public);

        tracker.handle_request(cid(0), k.clone());
        tracker.handle_request(cid(1), k.clone());
        tracker.handle_fetch_failed(CacheScope::Public, k.clone(), "404".to_string());

        assert!(tracker.resource(&CacheScope::Public, &k).is_none());
        assert_eq!(tracker.cached_resources(), 0);
    }

    #[tokio::test]
    async fn release_during_download_returns_entry_to_init() {
        let downloader = CountingDownloader::new();
        let (tracker, context) = tracker_with(downloader);
        register_container(&context, 0, "alice");
        let k = key("s3://x/a", ResourceVisibility::Public);

        tracker.handle_request(cid(0), k.clone());
        tracker.handle_release(cid(0), vec![k.clone()]);

        let resource = tracker.resource(&CacheScope::Public, &k).unwrap();
        assert_eq!(resource.state(), ResourceState::Init);
        assert!(resource.refs_is_empty());
    }

    #[tokio::test]
    async fn visibility_partitions_the_cache() {
        let downloader = CountingDownloader::new();
        let (tracker, context) = tracker_with(Arc::clone(&downloader));
        register_container(&context, 0, "alice");
        register_container(&context, 1, "bob");

        // Same uri, private visibility: one entry per user.
        let k = key("s3://x/a", ResourceVisibility::Private);
        tracker.handle_request(cid(0), k.clone());
        tracker.handle_request(cid(1), k.clone());

        tokio::task::yield_now().await;
        assert_eq!(tracker.cached_resources(), 2);
        assert_eq!(downloader.fetches.load(Ordering::SeqCst), 2);
        assert!(tracker
            .resource(&CacheScope::User("alice".to_string()), &k)
            .is_some());
        assert!(tracker
            .resource(&CacheScope::User("bob".to_string()), &k)
            .is_some());
    }

    #[tokio::test]
    async fn application_cleanup_drops_only_that_scope() {
        let downloader = CountingDownloader::new();
        let (tracker, context) = tracker_with(downloader);
        register_container(&context, 0, "alice");

        let app_key = key("s3://x/app", ResourceVisibility::Application);
        let pub_key = key("s3://x/pub", ResourceVisibility::Public);
        tracker.handle_request(cid(0), app_key.clone());
        tracker.handle_request(cid(0), pub_key.clone());
        tracker.handle_release(cid(0), vec![app_key, pub_key.clone()]);

        tracker.handle_cleanup_application(aid());

        assert_eq!(tracker.cached_resources(), 1);
        assert!(tracker.resource(&CacheScope::Public, &pub_key).is_some());
    }

    #[tokio::test]
    async fn request_from_departed_container_is_dropped() {
        let downloader = CountingDownloader::new();
        let (tracker, _context) = tracker_with(downloader);

        // Private visibility needs the container record; none exists.
        let k = key("s3://x/a", ResourceVisibility::Private);
        tracker.handle_request(cid(0), k.clone());
        assert_eq!(tracker.cached_resources(), 0);
    }
}
