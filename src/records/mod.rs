//! Identifier and value types shared across the lifecycle engine.
//!
//! These are plain value types: identifiers are cheap to clone and hash,
//! and [`LocalResourceKey`] equality defines the localization cache key.
//! State machines never hold references to each other: they hold these
//! ids and dereference through the [`Context`](crate::context::Context)
//! registries.

use std::collections::HashMap;
use std::fmt;

/// Identifier of a submitted application, unique per cluster epoch.
///
/// The cluster timestamp is assigned by the controller when it starts and
/// disambiguates application ids across controller restarts.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApplicationId {
    /// Controller start time, in epoch milliseconds.
    pub cluster_timestamp: u64,
    /// Sequence number within the cluster epoch.
    pub id: u32,
}

impl ApplicationId {
    /// Creates an application id.
    pub fn new(cluster_timestamp: u64, id: u32) -> Self {
        Self {
            cluster_timestamp,
            id,
        }
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app_{}_{:04}", self.cluster_timestamp, self.id)
    }
}

/// Identifier of a single container within an application.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContainerId {
    /// Owning application.
    pub application: ApplicationId,
    /// Sequence number within the application.
    pub sequence: u32,
}

impl ContainerId {
    /// Creates a container id.
    pub fn new(application: ApplicationId, sequence: u32) -> Self {
        Self {
            application,
            sequence,
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "container_{}_{:04}_{:06}",
            self.application.cluster_timestamp, self.application.id, self.sequence
        )
    }
}

/// Sharing scope of a localized resource.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ResourceVisibility {
    /// Shared by every application on the node.
    Public,
    /// Visible only to containers of the requesting user.
    Private,
    /// Visible only to containers of the requesting application.
    Application,
}

impl fmt::Display for ResourceVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "PUBLIC"),
            Self::Private => write!(f, "PRIVATE"),
            Self::Application => write!(f, "APPLICATION"),
        }
    }
}

/// Cache key for one remote resource a container wants localized.
///
/// Equality over all four fields defines the cache identity: two requests
/// naming the same uri but different timestamps (the remote object was
/// replaced) localize independently.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct LocalResourceKey {
    /// Remote location of the resource.
    pub uri: String,
    /// Declared size in bytes, or -1 when unknown.
    pub size: i64,
    /// Remote modification timestamp used for staleness detection.
    pub timestamp: i64,
    /// Sharing scope.
    pub visibility: ResourceVisibility,
}

impl LocalResourceKey {
    /// Creates a resource key.
    pub fn new(
        uri: impl Into<String>,
        size: i64,
        timestamp: i64,
        visibility: ResourceVisibility,
    ) -> Self {
        Self {
            uri: uri.into(),
            size,
            timestamp,
            visibility,
        }
    }
}

impl fmt::Display for LocalResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ {} {} {} {} }}",
            self.uri, self.size, self.timestamp, self.visibility
        )
    }
}

/// Everything needed to start one container.
///
/// Produced by the controller, carried opaquely through the engine, and
/// handed to the external launcher once localization completes.
#[derive(Clone, Debug)]
pub struct ContainerLaunchContext {
    /// Container being launched.
    pub container_id: ContainerId,
    /// Submitting user; also the Private-visibility cache scope.
    pub user: String,
    /// Command line to execute.
    pub commands: Vec<String>,
    /// Environment variables for the command.
    pub environment: HashMap<String, String>,
    /// Resources that must be localized before launch.
    pub resources: Vec<LocalResourceKey>,
}

impl ContainerLaunchContext {
    /// Creates a launch context with no environment and no resources.
    pub fn new(container_id: ContainerId, user: impl Into<String>) -> Self {
        Self {
            container_id,
            user: user.into(),
            commands: Vec::new(),
            environment: HashMap::new(),
            resources: Vec::new(),
        }
    }

    /// Adds a command to the launch command line.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    /// Adds a resource requirement.
    pub fn with_resource(mut self, key: LocalResourceKey) -> Self {
        self.resources.push(key);
        self
    }
}
