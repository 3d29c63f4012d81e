use devbox_common::{ContainerId, ControlPlane, DevboxError, Result};
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

#[derive(Debug, Default)]
struct AllocatorState {
    /// Handed out, creation not yet settled.
    reserved: BTreeSet<ContainerId>,
    /// Destroyed during the current epoch.
    retired: BTreeSet<ContainerId>,
    epoch: u64,
}

/// Hands out container identities that collide neither with the control
/// plane's containers nor with in-flight reservations.
///
/// Allocations are serialised by `scan`, which is held across the external
/// list. `state` is only ever held briefly and never across an await, so
/// readers of the reservation set do not wait on the control plane.
pub struct IdentityAllocator {
    plane: Arc<dyn ControlPlane>,
    range: RangeInclusive<ContainerId>,
    scan: Mutex<()>,
    state: Mutex<AllocatorState>,
}

impl IdentityAllocator {
    pub fn new(plane: Arc<dyn ControlPlane>, range: RangeInclusive<ContainerId>) -> Self {
        Self {
            plane,
            range,
            scan: Mutex::new(()),
            state: Mutex::new(AllocatorState::default()),
        }
    }

    pub fn range(&self) -> &RangeInclusive<ContainerId> {
        &self.range
    }

    #[instrument(skip(self))]
    pub async fn allocate(&self, preferred: Option<ContainerId>) -> Result<ContainerId> {
        if preferred == Some(0) {
            return Err(DevboxError::InvalidArgument(
                "container id must be positive".to_string(),
            ));
        }

        let _scan = self.scan.lock().await;
        let existing: BTreeSet<ContainerId> = self
            .plane
            .list_containers()
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        let mut state = self.state.lock().await;
        let occupied = |id: &ContainerId| {
            existing.contains(id) || state.reserved.contains(id) || state.retired.contains(id)
        };

        let id = match preferred {
            Some(id) if occupied(&id) => return Err(DevboxError::IdentityConflict(id)),
            Some(id) => id,
            None => self
                .range
                .clone()
                .find(|id| !occupied(id))
                .ok_or(DevboxError::IdentitySpaceExhausted {
                    start: *self.range.start(),
                    end: *self.range.end(),
                })?,
        };

        state.reserved.insert(id);
        debug!(container_id = id, "Reserved identity");
        Ok(id)
    }

    /// Give back a reservation whose creation failed.
    pub async fn release(&self, id: ContainerId) {
        if self.state.lock().await.reserved.remove(&id) {
            debug!(container_id = id, "Released identity");
        }
    }

    /// The container now exists externally; the reservation is no longer needed.
    pub async fn commit(&self, id: ContainerId) {
        self.state.lock().await.reserved.remove(&id);
    }

    /// Keep a destroyed id out of circulation until the next epoch.
    pub async fn retire(&self, id: ContainerId) {
        let mut state = self.state.lock().await;
        state.reserved.remove(&id);
        state.retired.insert(id);
    }

    /// Start a new epoch, making retired ids allocatable again.
    pub async fn advance_epoch(&self) -> u64 {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        let released = std::mem::take(&mut state.retired);
        info!(epoch = state.epoch, released = released.len(), "Advanced identity epoch");
        state.epoch
    }

    pub async fn epoch(&self) -> u64 {
        self.state.lock().await.epoch
    }

    pub async fn is_reserved(&self, id: ContainerId) -> bool {
        self.state.lock().await.reserved.contains(&id)
    }

    /// Snapshot of the ids currently handed out but not yet settled.
    pub async fn reserved(&self) -> BTreeSet<ContainerId> {
        self.state.lock().await.reserved.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbox_common::{AdapterError, ErrorKind};
    use devbox_executor::{MockControlPlane, MockOp};

    fn allocator(mock: MockControlPlane, range: RangeInclusive<ContainerId>) -> Arc<IdentityAllocator> {
        Arc::new(IdentityAllocator::new(Arc::new(mock), range))
    }

    #[tokio::test]
    async fn test_scans_ascending_past_existing_and_reserved() {
        let mock = MockControlPlane::new()
            .with_container(1001, "a", true)
            .with_container(1003, "b", false);
        let alloc = allocator(mock, 1001..=1010);

        assert_eq!(alloc.allocate(None).await.unwrap(), 1002);
        assert_eq!(alloc.allocate(None).await.unwrap(), 1004);
        alloc.release(1002).await;
        assert_eq!(alloc.allocate(None).await.unwrap(), 1002);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_are_distinct() {
        let alloc = allocator(MockControlPlane::new(), 1001..=1100);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let alloc = alloc.clone();
                tokio::spawn(async move { alloc.allocate(None).await })
            })
            .collect();

        let mut ids = BTreeSet::new();
        for handle in handles {
            assert!(ids.insert(handle.await.unwrap().unwrap()));
        }
        assert_eq!(ids.len(), 50);
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let mock = MockControlPlane::new()
            .with_container(1001, "a", true)
            .with_container(1002, "b", true);
        let alloc = allocator(mock, 1001..=1003);

        assert_eq!(alloc.allocate(None).await.unwrap(), 1003);
        let err = alloc.allocate(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IdentitySpaceExhausted);
    }

    #[tokio::test]
    async fn test_preferred_conflicts_with_existing_container() {
        let alloc = allocator(MockControlPlane::new().with_container(2000, "x", false), 1001..=9999);
        let err = alloc.allocate(Some(2000)).await.unwrap_err();
        assert!(matches!(err, DevboxError::IdentityConflict(2000)));
        // The template is a container like any other.
        let err = alloc.allocate(Some(9000)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IdentityConflict);
    }

    #[tokio::test]
    async fn test_concurrent_preferred_exactly_one_wins() {
        let alloc = allocator(MockControlPlane::new(), 1001..=9999);

        let (a, b) = tokio::join!(alloc.allocate(Some(2000)), alloc.allocate(Some(2000)));
        let results = [a, b];
        let won = results.iter().filter(|r| matches!(r, Ok(2000))).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(DevboxError::IdentityConflict(2000))))
            .count();
        assert_eq!((won, conflicts), (1, 1));
    }

    #[tokio::test]
    async fn test_retired_ids_return_after_epoch() {
        let alloc = allocator(MockControlPlane::new(), 1001..=1002);
        let id = alloc.allocate(None).await.unwrap();
        alloc.commit(id).await;
        alloc.retire(id).await;

        assert_eq!(alloc.allocate(None).await.unwrap(), 1002);
        assert!(alloc.allocate(Some(1001)).await.is_err());

        assert_eq!(alloc.advance_epoch().await, 1);
        assert_eq!(alloc.allocate(Some(1001)).await.unwrap(), 1001);
    }

    #[tokio::test]
    async fn test_list_failure_propagates_without_reserving() {
        let mock = MockControlPlane::new();
        mock.fail_next(MockOp::List, AdapterError::timeout("pct list timed out"));
        let alloc = allocator(mock, 1001..=1010);

        let err = alloc.allocate(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterError);
        assert!(!alloc.is_reserved(1001).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservations_readable_while_list_in_flight() {
        let mock = MockControlPlane::new();
        let gate = mock.gate(MockOp::List);
        let alloc = allocator(mock.clone(), 1001..=1010);

        let pending = tokio::spawn({
            let alloc = alloc.clone();
            async move { alloc.allocate(None).await }
        });
        while mock.call_count(MockOp::List) < 1 {
            tokio::task::yield_now().await;
        }

        let reserved = tokio::time::timeout(std::time::Duration::from_secs(1), alloc.reserved())
            .await
            .expect("reservation set readable while a scan waits on the list");
        assert!(reserved.is_empty());

        gate.add_permits(1);
        assert_eq!(pending.await.unwrap().unwrap(), 1001);
        assert_eq!(alloc.reserved().await, BTreeSet::from([1001]));
    }
}
