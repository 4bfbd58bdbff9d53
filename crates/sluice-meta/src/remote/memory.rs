//! In-process coordinator backend
//!
//! Holds the authoritative records in memory and publishes a [`SyncEvent`]
//! for every successful insert, update and delete. Events for one id are
//! published while its record is locked, so they arrive in version order.
//! Clones share state, so
//! several [`MetadataContext`](crate::MetadataContext)s built over clones of
//! one `MemoryCoordinator` form a complete in-process cluster.
//!
//! Fault injection (`set_reachable`, `set_response_delay`) lets tests drive
//! the unreachable and slow-coordinator paths.

use super::{first_free_index, RawRecord};
use crate::entity::{EntityKind, MetadataVersion};
use crate::error::{MetaError, Result};
use crate::sync::SyncEvent;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

const EVENT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct MemoryCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    records: DashMap<(EntityKind, u64), RawRecord>,
    positions: DashMap<u64, Vec<u8>>,
    states: DashMap<u64, Vec<u8>>,
    /// node url -> machine index
    machines: Mutex<HashMap<String, u16>>,
    events: broadcast::Sender<SyncEvent>,
    reachable: AtomicBool,
    delay_ms: AtomicU64,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCoordinator")
            .field("records", &self.inner.records.len())
            .field("reachable", &self.inner.reachable.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                records: DashMap::new(),
                positions: DashMap::new(),
                states: DashMap::new(),
                machines: Mutex::new(HashMap::new()),
                events,
                reachable: AtomicBool::new(true),
                delay_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Simulate a network partition: every call fails while unreachable
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every call by `delay`
    pub fn set_response_delay(&self, delay: Duration) {
        self.inner
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn round_trip(&self) -> Result<()> {
        let delay = self.inner.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.inner.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MetaError::CoordinatorUnavailable(
                "memory coordinator unreachable".into(),
            ))
        }
    }

    fn publish(&self, kind: EntityKind, id: u64, version: i32) {
        // No subscribers is fine
        let delivered = self
            .inner
            .events
            .send(SyncEvent::new(kind, id, version))
            .unwrap_or(0);
        debug!(%kind, id, version, delivered, "Published sync event");
    }

    // ==================== Entities ====================

    pub(crate) async fn insert(&self, kind: EntityKind, id: u64, record: RawRecord) -> Result<()> {
        self.round_trip().await?;
        let version = record.version;
        match self.inner.records.entry((kind, id)) {
            Entry::Occupied(_) => Err(MetaError::AlreadyExists { kind, id }),
            Entry::Vacant(slot) => {
                let _held = slot.insert(record);
                self.publish(kind, id, version);
                Ok(())
            }
        }
    }

    pub(super) async fn delete(&self, kind: EntityKind, id: u64) -> Result<()> {
        self.round_trip().await?;
        if let Entry::Occupied(slot) = self.inner.records.entry((kind, id)) {
            self.publish(kind, id, slot.get().version);
            slot.remove();
        }
        Ok(())
    }

    pub(super) async fn update(
        &self,
        kind: EntityKind,
        id: u64,
        expected_version: i32,
        record: RawRecord,
    ) -> Result<()> {
        self.round_trip().await?;
        let version = record.version;
        {
            let mut current = self
                .inner
                .records
                .get_mut(&(kind, id))
                .ok_or(MetaError::NotFound { kind, id })?;
            if current.version != expected_version {
                return Err(MetaError::VersionConflict {
                    kind,
                    id,
                    expected: expected_version,
                    actual: Some(current.version),
                });
            }
            *current = record;
            self.publish(kind, id, version);
        }
        Ok(())
    }

    pub(super) async fn get(&self, kind: EntityKind, id: u64) -> Result<Option<RawRecord>> {
        self.round_trip().await?;
        Ok(self.inner.records.get(&(kind, id)).map(|r| r.clone()))
    }

    pub(super) async fn versions(&self, kind: EntityKind) -> Result<Vec<MetadataVersion>> {
        self.round_trip().await?;
        let mut manifest: Vec<MetadataVersion> = self
            .inner
            .records
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| MetadataVersion::new(entry.key().1, entry.value().version))
            .collect();
        manifest.sort_by_key(|m| m.id);
        Ok(manifest)
    }

    // ==================== Position / State ====================

    pub(super) async fn save_position(&self, pipeline_id: u64, data: Vec<u8>) -> Result<()> {
        self.round_trip().await?;
        self.inner.positions.insert(pipeline_id, data);
        Ok(())
    }

    pub(super) async fn get_position(&self, pipeline_id: u64) -> Result<Option<Vec<u8>>> {
        self.round_trip().await?;
        Ok(self.inner.positions.get(&pipeline_id).map(|p| p.clone()))
    }

    pub(super) async fn delete_position(&self, pipeline_id: u64) -> Result<()> {
        self.round_trip().await?;
        self.inner.positions.remove(&pipeline_id);
        Ok(())
    }

    pub(super) async fn save_state(&self, pipeline_id: u64, data: Vec<u8>) -> Result<()> {
        self.round_trip().await?;
        self.inner.states.insert(pipeline_id, data);
        Ok(())
    }

    pub(super) async fn get_state(&self, pipeline_id: u64) -> Result<Option<Vec<u8>>> {
        self.round_trip().await?;
        Ok(self.inner.states.get(&pipeline_id).map(|s| s.clone()))
    }

    pub(super) async fn delete_state(&self, pipeline_id: u64) -> Result<()> {
        self.round_trip().await?;
        self.inner.states.remove(&pipeline_id);
        Ok(())
    }

    // ==================== Machine registry ====================

    pub(super) async fn get_machine_index(&self, node_url: &str) -> Result<u16> {
        self.round_trip().await?;
        let mut machines = self.inner.machines.lock().await;
        if let Some(index) = machines.get(node_url) {
            return Ok(*index);
        }
        let index = first_free_index(machines.values().copied())
            .ok_or_else(|| MetaError::MachineIndexExhausted(node_url.to_string()))?;
        machines.insert(node_url.to_string(), index);
        Ok(index)
    }

    pub(super) async fn release_machine_index(&self, node_url: &str) -> Result<()> {
        self.round_trip().await?;
        self.inner.machines.lock().await.remove(node_url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: i32) -> RawRecord {
        RawRecord {
            version,
            data: vec![version as u8],
        }
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let coordinator = MemoryCoordinator::new();
        coordinator
            .insert(EntityKind::Endpoint, 1, record(0))
            .await
            .unwrap();

        coordinator
            .update(EntityKind::Endpoint, 1, 0, record(1))
            .await
            .unwrap();
        let err = coordinator
            .update(EntityKind::Endpoint, 1, 0, record(1))
            .await
            .unwrap_err();
        match err {
            MetaError::VersionConflict { expected, actual, .. } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }

        let missing = coordinator
            .update(EntityKind::Endpoint, 2, 0, record(1))
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_events_follow_successful_writes() {
        let coordinator = MemoryCoordinator::new();
        let mut events = coordinator.subscribe();

        coordinator
            .insert(EntityKind::Source, 7, record(0))
            .await
            .unwrap();
        coordinator
            .update(EntityKind::Source, 7, 0, record(1))
            .await
            .unwrap();
        // Failed CAS publishes nothing
        assert!(coordinator
            .update(EntityKind::Source, 7, 0, record(1))
            .await
            .is_err());
        coordinator.delete(EntityKind::Source, 7).await.unwrap();
        // Deleting an absent id publishes nothing either
        coordinator.delete(EntityKind::Source, 7).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), SyncEvent::new(EntityKind::Source, 7, 0));
        assert_eq!(events.recv().await.unwrap(), SyncEvent::new(EntityKind::Source, 7, 1));
        assert_eq!(events.recv().await.unwrap(), SyncEvent::new(EntityKind::Source, 7, 1));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_publish_in_version_order() {
        let coordinator = MemoryCoordinator::new();
        let mut events = coordinator.subscribe();
        coordinator
            .insert(EntityKind::Pipeline, 1, record(0))
            .await
            .unwrap();

        let mut writers = Vec::new();
        for _ in 0..4 {
            let coordinator = coordinator.clone();
            writers.push(tokio::spawn(async move {
                let mut wins = 0;
                while wins < 25 {
                    let current = coordinator
                        .get(EntityKind::Pipeline, 1)
                        .await
                        .unwrap()
                        .unwrap()
                        .version;
                    if coordinator
                        .update(EntityKind::Pipeline, 1, current, record(current + 1))
                        .await
                        .is_ok()
                    {
                        wins += 1;
                    }
                }
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let mut last = -1;
        for _ in 0..=100 {
            let event = events.recv().await.unwrap();
            assert!(event.version > last, "{} after {}", event.version, last);
            last = event.version;
        }
        assert_eq!(last, 100);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let coordinator = MemoryCoordinator::new();
        coordinator.set_reachable(false);
        let err = coordinator.get(EntityKind::Pipeline, 1).await.unwrap_err();
        assert!(matches!(err, MetaError::CoordinatorUnavailable(_)));

        coordinator.set_reachable(true);
        assert!(coordinator.get(EntityKind::Pipeline, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_machine_index_reuse() {
        let coordinator = MemoryCoordinator::new();
        let a = coordinator.get_machine_index("http://a:8060").await.unwrap();
        let b = coordinator.get_machine_index("http://b:8060").await.unwrap();
        assert_eq!((a, b), (1, 2));

        // Stable while registered
        assert_eq!(coordinator.get_machine_index("http://a:8060").await.unwrap(), 1);

        coordinator.release_machine_index("http://a:8060").await.unwrap();
        let c = coordinator.get_machine_index("http://c:8060").await.unwrap();
        assert_eq!(c, 1);
    }

    #[tokio::test]
    async fn test_manifest_is_sorted_per_kind() {
        let coordinator = MemoryCoordinator::new();
        for id in [9u64, 3, 5] {
            coordinator
                .insert(EntityKind::Pipeline, id, record(id as i32))
                .await
                .unwrap();
        }
        coordinator
            .insert(EntityKind::Source, 4, record(0))
            .await
            .unwrap();

        let ids: Vec<u64> = coordinator
            .versions(EntityKind::Pipeline)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![3, 5, 9]);
    }
}
