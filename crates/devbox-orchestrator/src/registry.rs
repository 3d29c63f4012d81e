use devbox_common::{ContainerId, ContainerRecord, ContainerView, LifecycleState, ResourceSnapshot};
use std::collections::BTreeMap;
use tokio::sync::{RwLock, RwLockWriteGuard};

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub record: ContainerRecord,
    pub resources: Option<ResourceSnapshot>,
}

impl Entry {
    pub fn new(record: ContainerRecord) -> Self {
        Self {
            record,
            resources: None,
        }
    }

    /// Resource snapshots only exist while running.
    pub fn set_state(&mut self, state: LifecycleState) {
        self.record.lifecycle_state = state;
        if state != LifecycleState::Running {
            self.resources = None;
        }
    }

    pub fn view(&self) -> ContainerView {
        ContainerView {
            record: self.record.clone(),
            resources: self.resources.clone(),
        }
    }
}

/// In-process container records. Readers always receive copies.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: RwLock<BTreeMap<ContainerId, Entry>>,
}

impl Registry {
    pub async fn record(&self, id: ContainerId) -> Option<ContainerRecord> {
        self.entries.read().await.get(&id).map(|e| e.record.clone())
    }

    pub async fn view(&self, id: ContainerId) -> Option<ContainerView> {
        self.entries.read().await.get(&id).map(Entry::view)
    }

    pub async fn views(&self) -> Vec<ContainerView> {
        self.entries.read().await.values().map(Entry::view).collect()
    }

    pub async fn insert(&self, record: ContainerRecord) {
        self.entries
            .write()
            .await
            .insert(record.id, Entry::new(record));
    }

    pub async fn remove(&self, id: ContainerId) -> Option<ContainerRecord> {
        self.entries.write().await.remove(&id).map(|e| e.record)
    }

    /// Apply `f` to the entry and return the updated record.
    pub async fn update(
        &self,
        id: ContainerId,
        f: impl FnOnce(&mut Entry),
    ) -> Option<ContainerRecord> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id)?;
        f(entry);
        Some(entry.record.clone())
    }

    pub async fn set_state(&self, id: ContainerId, state: LifecycleState) -> Option<ContainerRecord> {
        self.update(id, |entry| entry.set_state(state)).await
    }

    /// Whole-registry write access for the poll-result merge.
    pub async fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ContainerId, Entry>> {
        self.entries.write().await
    }
}
