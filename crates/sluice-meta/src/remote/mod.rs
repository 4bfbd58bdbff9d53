//! Remote coordinator
//!
//! The cluster-wide authority for configuration entities, replication
//! progress and node identity. Exactly one backend is active per deployment
//! and is chosen once at startup from [`CoordinatorConfig`]:
//!
//! | Backend  | Use                                                      |
//! |----------|----------------------------------------------------------|
//! | `memory` | tests and single-process clusters; pushes sync events    |
//! | `mysql`  | production clusters sharing one MySQL schema             |
//!
//! Backends only deal in raw `(kind, id) -> (version, bytes)` records. The
//! typed [`MetadataDao`] contract is implemented once on [`Coordinator`] for
//! every entity kind, so the composite service never sees which backend is
//! behind it.

mod memory;
mod mysql;

pub use memory::MemoryCoordinator;
pub use mysql::MySqlCoordinator;

use crate::config::{CoordinatorBackend, CoordinatorConfig};
use crate::entity::{Entity, EntityKind, MetadataVersion};
use crate::error::{MetaError, Result};
use crate::progress::{BinlogPosition, MachineDao, PipelineState, PositionDao, StateDao};
use crate::sync::SyncEvent;
use async_trait::async_trait;
use prost::Message;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Per-kind contract of the remote coordinator
///
/// `update` is a compare-and-swap: it succeeds only while the stored version
/// equals `expected_version`, and stores `entity` (whose `data_version` is
/// the new version) atomically.
#[async_trait]
pub trait MetadataDao<E: Entity>: Send + Sync {
    /// Fails with `AlreadyExists` if the id is taken
    async fn insert(&self, entity: &E) -> Result<()>;

    /// Removing an absent id is not an error
    async fn delete(&self, id: u64) -> Result<()>;

    async fn update(&self, entity: &E, expected_version: i32) -> Result<()>;

    /// Current version, `NotFound` if absent
    async fn get_data_version(&self, id: u64) -> Result<i32>;

    async fn get(&self, id: u64) -> Result<Option<E>>;

    /// Manifest of every entity of this kind
    async fn select_all_data_version(&self) -> Result<Vec<MetadataVersion>>;
}

/// Raw coordinator record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub version: i32,
    pub data: Vec<u8>,
}

/// The active coordinator backend
#[derive(Clone)]
pub enum Coordinator {
    Memory(MemoryCoordinator),
    MySql(Arc<MySqlCoordinator>),
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Coordinator").field(&self.backend_name()).finish()
    }
}

impl Coordinator {
    /// Select and connect the configured backend
    pub async fn connect(config: &CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let coordinator = match config.backend {
            CoordinatorBackend::Memory => Coordinator::Memory(MemoryCoordinator::new()),
            CoordinatorBackend::Mysql => {
                let backend = tokio::time::timeout(
                    config.request_timeout(),
                    MySqlCoordinator::connect(&config.mysql),
                )
                .await??;
                Coordinator::MySql(Arc::new(backend))
            }
        };
        info!(backend = coordinator.backend_name(), "Connected remote coordinator");
        Ok(coordinator)
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Coordinator::Memory(_) => "memory",
            Coordinator::MySql(_) => "mysql",
        }
    }

    /// Push channel of change notifications, if the backend has one
    ///
    /// Backends without push delivery rely on periodic reconciliation.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<SyncEvent>> {
        match self {
            Coordinator::Memory(memory) => Some(memory.subscribe()),
            Coordinator::MySql(_) => None,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            Coordinator::Memory(_) => Ok(()),
            Coordinator::MySql(mysql) => mysql.close().await,
        }
    }

    async fn insert_raw(&self, kind: EntityKind, id: u64, record: RawRecord) -> Result<()> {
        match self {
            Coordinator::Memory(m) => m.insert(kind, id, record).await,
            Coordinator::MySql(m) => m.insert(kind, id, record).await,
        }
    }

    async fn delete_raw(&self, kind: EntityKind, id: u64) -> Result<()> {
        match self {
            Coordinator::Memory(m) => m.delete(kind, id).await,
            Coordinator::MySql(m) => m.delete(kind, id).await,
        }
    }

    async fn update_raw(
        &self,
        kind: EntityKind,
        id: u64,
        expected_version: i32,
        record: RawRecord,
    ) -> Result<()> {
        match self {
            Coordinator::Memory(m) => m.update(kind, id, expected_version, record).await,
            Coordinator::MySql(m) => m.update(kind, id, expected_version, record).await,
        }
    }

    async fn get_raw(&self, kind: EntityKind, id: u64) -> Result<Option<RawRecord>> {
        match self {
            Coordinator::Memory(m) => m.get(kind, id).await,
            Coordinator::MySql(m) => m.get(kind, id).await,
        }
    }

    async fn versions_raw(&self, kind: EntityKind) -> Result<Vec<MetadataVersion>> {
        match self {
            Coordinator::Memory(m) => m.versions(kind).await,
            Coordinator::MySql(m) => m.versions(kind).await,
        }
    }
}

#[async_trait]
impl<E: Entity> MetadataDao<E> for Coordinator {
    async fn insert(&self, entity: &E) -> Result<()> {
        let record = RawRecord {
            version: entity.data_version(),
            data: entity.to_bytes(),
        };
        self.insert_raw(E::KIND, entity.id(), record).await
    }

    async fn delete(&self, id: u64) -> Result<()> {
        self.delete_raw(E::KIND, id).await
    }

    async fn update(&self, entity: &E, expected_version: i32) -> Result<()> {
        let record = RawRecord {
            version: entity.data_version(),
            data: entity.to_bytes(),
        };
        self.update_raw(E::KIND, entity.id(), expected_version, record)
            .await
    }

    async fn get_data_version(&self, id: u64) -> Result<i32> {
        match self.get_raw(E::KIND, id).await? {
            Some(record) => Ok(record.version),
            None => Err(MetaError::NotFound { kind: E::KIND, id }),
        }
    }

    async fn get(&self, id: u64) -> Result<Option<E>> {
        match self.get_raw(E::KIND, id).await? {
            Some(record) => {
                let mut entity = E::from_bytes(&record.data)?;
                // The coordinator's version column is authoritative
                entity.set_data_version(record.version);
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    async fn select_all_data_version(&self) -> Result<Vec<MetadataVersion>> {
        self.versions_raw(E::KIND).await
    }
}

#[async_trait]
impl PositionDao for Coordinator {
    async fn save(&self, pipeline_id: u64, position: &BinlogPosition) -> Result<()> {
        let data = position.encode_to_vec();
        match self {
            Coordinator::Memory(m) => m.save_position(pipeline_id, data).await,
            Coordinator::MySql(m) => m.save_position(pipeline_id, data).await,
        }
    }

    async fn get(&self, pipeline_id: u64) -> Result<BinlogPosition> {
        let data = match self {
            Coordinator::Memory(m) => m.get_position(pipeline_id).await?,
            Coordinator::MySql(m) => m.get_position(pipeline_id).await?,
        };
        match data {
            Some(bytes) => Ok(BinlogPosition::decode(bytes.as_slice())?),
            None => Ok(BinlogPosition::default()),
        }
    }

    async fn delete(&self, pipeline_id: u64) -> Result<()> {
        match self {
            Coordinator::Memory(m) => m.delete_position(pipeline_id).await,
            Coordinator::MySql(m) => m.delete_position(pipeline_id).await,
        }
    }
}

#[async_trait]
impl StateDao for Coordinator {
    async fn save(&self, pipeline_id: u64, state: &PipelineState) -> Result<()> {
        let data = state.encode_to_vec();
        match self {
            Coordinator::Memory(m) => m.save_state(pipeline_id, data).await,
            Coordinator::MySql(m) => m.save_state(pipeline_id, data).await,
        }
    }

    async fn get(&self, pipeline_id: u64) -> Result<Option<PipelineState>> {
        let data = match self {
            Coordinator::Memory(m) => m.get_state(pipeline_id).await?,
            Coordinator::MySql(m) => m.get_state(pipeline_id).await?,
        };
        data.map(|bytes| PipelineState::decode(bytes.as_slice()).map_err(MetaError::from))
            .transpose()
    }

    async fn delete(&self, pipeline_id: u64) -> Result<()> {
        match self {
            Coordinator::Memory(m) => m.delete_state(pipeline_id).await,
            Coordinator::MySql(m) => m.delete_state(pipeline_id).await,
        }
    }
}

#[async_trait]
impl MachineDao for Coordinator {
    async fn get_machine_index(&self, node_url: &str) -> Result<u16> {
        match self {
            Coordinator::Memory(m) => m.get_machine_index(node_url).await,
            Coordinator::MySql(m) => m.get_machine_index(node_url).await,
        }
    }

    async fn release_machine_index(&self, node_url: &str) -> Result<()> {
        match self {
            Coordinator::Memory(m) => m.release_machine_index(node_url).await,
            Coordinator::MySql(m) => m.release_machine_index(node_url).await,
        }
    }
}

/// Smallest index in `1..=u16::MAX` not present in `used`
pub(crate) fn first_free_index(used: impl IntoIterator<Item = u16>) -> Option<u16> {
    let mut used: Vec<u16> = used.into_iter().filter(|i| *i > 0).collect();
    used.sort_unstable();
    used.dedup();

    let mut candidate: u16 = 1;
    for index in used {
        if index != candidate {
            break;
        }
        candidate = candidate.checked_add(1)?;
    }
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{PipelineInfo, SourceInfo};

    fn pipeline(id: u64, version: i32) -> PipelineInfo {
        PipelineInfo {
            id,
            name: format!("p{id}"),
            source_id: 10,
            endpoint_id: 20,
            data_version: version,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_typed_contract_over_memory() {
        let coordinator = Coordinator::connect(&CoordinatorConfig::memory())
            .await
            .unwrap();
        assert_eq!(coordinator.backend_name(), "memory");

        MetadataDao::insert(&coordinator, &pipeline(1, 0)).await.unwrap();
        let err = MetadataDao::insert(&coordinator, &pipeline(1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::AlreadyExists { .. }));

        let mut renamed = pipeline(1, 1);
        renamed.name = "p1-renamed".into();
        MetadataDao::update(&coordinator, &renamed, 0).await.unwrap();

        let version = MetadataDao::<PipelineInfo>::get_data_version(&coordinator, 1)
            .await
            .unwrap();
        assert_eq!(version, 1);

        let stale = MetadataDao::update(&coordinator, &pipeline(1, 1), 0)
            .await
            .unwrap_err();
        assert!(stale.is_conflict());

        let fetched: PipelineInfo = MetadataDao::get(&coordinator, 1).await.unwrap().unwrap();
        assert_eq!(fetched, renamed);
    }

    #[tokio::test]
    async fn test_kinds_are_isolated() {
        let coordinator = Coordinator::Memory(MemoryCoordinator::new());
        MetadataDao::insert(&coordinator, &pipeline(5, 2)).await.unwrap();

        let missing = MetadataDao::<SourceInfo>::get_data_version(&coordinator, 5)
            .await
            .unwrap_err();
        assert!(missing.is_not_found());

        let manifest = MetadataDao::<PipelineInfo>::select_all_data_version(&coordinator)
            .await
            .unwrap();
        assert_eq!(manifest, vec![MetadataVersion::new(5, 2)]);
    }

    #[tokio::test]
    async fn test_shared_position_and_state() {
        let coordinator = Coordinator::Memory(MemoryCoordinator::new());
        assert!(PositionDao::get(&coordinator, 1).await.unwrap().is_zero());

        PositionDao::save(&coordinator, 1, &BinlogPosition::new("mysql-bin.000004", 154))
            .await
            .unwrap();
        let position = PositionDao::get(&coordinator, 1).await.unwrap();
        assert_eq!(position.offset, 154);

        assert!(!StateDao::is_exists(&coordinator, 1).await.unwrap());
        StateDao::save(&coordinator, 1, &PipelineState::running("node-a", 1))
            .await
            .unwrap();
        assert!(StateDao::is_exists(&coordinator, 1).await.unwrap());
    }

    #[test]
    fn test_first_free_index() {
        assert_eq!(first_free_index([]), Some(1));
        assert_eq!(first_free_index([1, 2, 3]), Some(4));
        assert_eq!(first_free_index([3, 1, 4]), Some(2));
        assert_eq!(first_free_index([0, 2]), Some(1));
        assert_eq!(first_free_index(1..=u16::MAX), None);
    }
}
