//! Shared node state: the application and container registries.
//!
//! Both registries are concurrent maps with atomic insert-if-absent
//! semantics: the first creator wins and later attempts observe the
//! existing entry without overwriting it. Entries are removed only by
//! the owning state machine when it reaches its terminal state; status
//! queries read immutable snapshots through the records they find here.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::applications::Application;
use crate::containers::Container;
use crate::records::{ApplicationId, ContainerId};

/// The node's registries of live applications and containers.
pub struct Context {
    applications: DashMap<ApplicationId, Arc<Application>>,
    containers: DashMap<ContainerId, Arc<Container>>,
}

impl Context {
    /// Creates empty registries.
    pub fn new() -> Self {
        Self {
            applications: DashMap::new(),
            containers: DashMap::new(),
        }
    }

    /// Inserts a container record unless one already exists.
    ///
    /// Returns `Ok(())` when this call created the record, or the
    /// existing record when another creator won.
    pub fn insert_container_if_absent(
        &self,
        container: Arc<Container>,
    ) -> Result<(), Arc<Container>> {
        match self.containers.entry(container.id()) {
            Entry::Occupied(existing) => Err(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(container);
                Ok(())
            }
        }
    }

    /// Inserts an application record unless one already exists.
    ///
    /// Returns `true` when this call created the record.
    pub fn insert_application_if_absent(&self, application: Arc<Application>) -> bool {
        match self.applications.entry(application.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(application);
                true
            }
        }
    }

    /// Looks up a container.
    pub fn container(&self, id: &ContainerId) -> Option<Arc<Container>> {
        self.containers.get(id).map(|entry| Arc::clone(&entry))
    }

    /// Looks up an application.
    pub fn application(&self, id: &ApplicationId) -> Option<Arc<Application>> {
        self.applications.get(id).map(|entry| Arc::clone(&entry))
    }

    /// Removes an application and every container it owned.
    ///
    /// Called by the application handler once the FSM reaches Done, which
    /// keeps the registries consistent: a container record never outlives
    /// its application.
    pub fn remove_application(&self, id: &ApplicationId) {
        self.containers.retain(|cid, _| cid.application != *id);
        self.applications.remove(id);
    }

    /// Returns the number of registered applications.
    pub fn application_count(&self) -> usize {
        self.applications.len()
    }

    /// Returns the number of registered containers.
    pub fn container_count(&self) -> usize {
        self.containers.len()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
