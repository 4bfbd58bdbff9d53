//! Replication position and pipeline run state
//!
//! The replay loop of every pipeline records the last durably processed
//! binlog position after each batch and reads it back once at startup. Run
//! state tracks whether a pipeline is active and which node owns it.
//!
//! | Deployment | Position / state live in | Why |
//! |------------|--------------------------|-----|
//! | Standalone | local store              | no coordinator round-trip on the hot path |
//! | Cluster    | coordinator              | any node can resume a pipeline it takes over |
//!
//! A missing record is never an error: it means "start from the pipeline's
//! configured initial position". Records are only removed by an explicit
//! [`PositionStateService::reset`] or by deleting the pipeline.

use crate::error::{MetaError, Result};
use crate::observability::MetadataMetrics;
use crate::storage::{Bucket, LocalStore};
use async_trait::async_trait;
use prost::Message;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Position inside a source's binlog stream
#[derive(Clone, PartialEq, Eq, Message)]
pub struct BinlogPosition {
    /// Binlog file name, e.g. `mysql-bin.000003`
    #[prost(string, tag = "1")]
    pub file: String,
    /// Byte offset inside `file`
    #[prost(uint32, tag = "2")]
    pub offset: u32,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, offset: u32) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }

    /// The zero position: the pipeline has never acknowledged an event
    pub fn is_zero(&self) -> bool {
        self.file.is_empty() && self.offset == 0
    }
}

impl std::fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

/// Pipeline run status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RunStatus {
    Stopped = 0,
    Running = 1,
    Faulted = 2,
}

/// Run state of one pipeline
#[derive(Clone, PartialEq, Eq, Message)]
pub struct PipelineState {
    #[prost(enumeration = "RunStatus", tag = "1")]
    pub status: i32,
    /// URL of the node that owns execution; empty when unowned
    #[prost(string, tag = "2")]
    pub owner_node: String,
    /// Unix millis of the last start
    #[prost(int64, tag = "3")]
    pub started_at: i64,
    /// Unix millis of the last state change
    #[prost(int64, tag = "4")]
    pub updated_at: i64,
    /// Last failure message while `Faulted`
    #[prost(string, tag = "5")]
    pub message: String,
}

impl PipelineState {
    pub fn running(owner_node: impl Into<String>, started_at: i64) -> Self {
        let mut state = Self {
            owner_node: owner_node.into(),
            started_at,
            updated_at: started_at,
            ..Default::default()
        };
        state.set_status(RunStatus::Running);
        state
    }

    pub fn is_running(&self) -> bool {
        self.status() == RunStatus::Running
    }
}

// ============================================================================
// Storage contracts
// ============================================================================

/// Persistence for binlog positions
#[async_trait]
pub trait PositionDao: Send + Sync {
    /// Upsert the position of a pipeline
    async fn save(&self, pipeline_id: u64, position: &BinlogPosition) -> Result<()>;

    /// Position of a pipeline, or the zero position if none was saved
    async fn get(&self, pipeline_id: u64) -> Result<BinlogPosition>;

    async fn delete(&self, pipeline_id: u64) -> Result<()>;
}

/// Persistence for pipeline run state
#[async_trait]
pub trait StateDao: Send + Sync {
    async fn save(&self, pipeline_id: u64, state: &PipelineState) -> Result<()>;

    /// Saved state, if the pipeline was ever started
    async fn get(&self, pipeline_id: u64) -> Result<Option<PipelineState>>;

    async fn is_exists(&self, pipeline_id: u64) -> Result<bool> {
        Ok(self.get(pipeline_id).await?.is_some())
    }

    async fn delete(&self, pipeline_id: u64) -> Result<()>;
}

/// Cluster-unique small integer identity for nodes
#[async_trait]
pub trait MachineDao: Send + Sync {
    /// Register `node_url` (if needed) and return its index
    async fn get_machine_index(&self, node_url: &str) -> Result<u16>;

    /// Deregister `node_url`, freeing its index for reuse
    async fn release_machine_index(&self, node_url: &str) -> Result<()>;
}

// ============================================================================
// Local implementations
// ============================================================================

/// Positions kept in the local store's `position` bucket
#[derive(Debug, Clone)]
pub struct LocalPositionDao {
    store: LocalStore,
}

impl LocalPositionDao {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PositionDao for LocalPositionDao {
    async fn save(&self, pipeline_id: u64, position: &BinlogPosition) -> Result<()> {
        self.store
            .put(Bucket::Position, pipeline_id, &position.encode_to_vec())
    }

    async fn get(&self, pipeline_id: u64) -> Result<BinlogPosition> {
        match self.store.get(Bucket::Position, pipeline_id)? {
            Some(bytes) => Ok(BinlogPosition::decode(bytes.as_slice())?),
            None => Ok(BinlogPosition::default()),
        }
    }

    async fn delete(&self, pipeline_id: u64) -> Result<()> {
        self.store.delete(Bucket::Position, pipeline_id)?;
        Ok(())
    }
}

/// Run state kept in the local store's `state` bucket
#[derive(Debug, Clone)]
pub struct LocalStateDao {
    store: LocalStore,
}

impl LocalStateDao {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StateDao for LocalStateDao {
    async fn save(&self, pipeline_id: u64, state: &PipelineState) -> Result<()> {
        self.store
            .put(Bucket::State, pipeline_id, &state.encode_to_vec())
    }

    async fn get(&self, pipeline_id: u64) -> Result<Option<PipelineState>> {
        self.store
            .get(Bucket::State, pipeline_id)?
            .map(|bytes| PipelineState::decode(bytes.as_slice()).map_err(MetaError::from))
            .transpose()
    }

    async fn delete(&self, pipeline_id: u64) -> Result<()> {
        self.store.delete(Bucket::State, pipeline_id)?;
        Ok(())
    }
}

// ============================================================================
// Service
// ============================================================================

/// Position/state service routing to the local store or the coordinator
#[derive(Clone)]
pub struct PositionStateService {
    positions: Arc<dyn PositionDao>,
    states: Arc<dyn StateDao>,
    machines: Option<Arc<dyn MachineDao>>,
    request_timeout: Duration,
}

impl PositionStateService {
    pub fn new(
        positions: Arc<dyn PositionDao>,
        states: Arc<dyn StateDao>,
        machines: Option<Arc<dyn MachineDao>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            positions,
            states,
            machines,
            request_timeout,
        }
    }

    /// Standalone routing: everything in the local store, no machine registry
    pub fn local(store: LocalStore, request_timeout: Duration) -> Self {
        Self::new(
            Arc::new(LocalPositionDao::new(store.clone())),
            Arc::new(LocalStateDao::new(store)),
            None,
            request_timeout,
        )
    }

    pub async fn save_position(&self, pipeline_id: u64, position: &BinlogPosition) -> Result<()> {
        self.bounded(self.positions.save(pipeline_id, position))
            .await?;
        MetadataMetrics::increment_position_saves();
        debug!(pipeline_id, %position, "Saved binlog position");
        Ok(())
    }

    pub async fn get_position(&self, pipeline_id: u64) -> Result<BinlogPosition> {
        self.bounded(self.positions.get(pipeline_id)).await
    }

    pub async fn save_state(&self, pipeline_id: u64, state: &PipelineState) -> Result<()> {
        self.bounded(self.states.save(pipeline_id, state)).await?;
        debug!(pipeline_id, status = ?state.status(), owner = %state.owner_node, "Saved pipeline state");
        Ok(())
    }

    /// Saved state, or the default stopped state if never started
    pub async fn get_state(&self, pipeline_id: u64) -> Result<PipelineState> {
        Ok(self
            .bounded(self.states.get(pipeline_id))
            .await?
            .unwrap_or_default())
    }

    /// Distinguishes "never started" from "stopped"
    pub async fn is_exists(&self, pipeline_id: u64) -> Result<bool> {
        self.bounded(self.states.is_exists(pipeline_id)).await
    }

    /// Machine index of `node_url`; always `0` without a coordinator
    pub async fn get_machine_index(&self, node_url: &str) -> Result<u16> {
        match &self.machines {
            Some(machines) => {
                let index = self.bounded(machines.get_machine_index(node_url)).await?;
                info!(node_url, index, "Resolved machine index");
                Ok(index)
            }
            None => Ok(0),
        }
    }

    pub async fn release_machine_index(&self, node_url: &str) -> Result<()> {
        if let Some(machines) = &self.machines {
            self.bounded(machines.release_machine_index(node_url))
                .await?;
            info!(node_url, "Released machine index");
        }
        Ok(())
    }

    /// Remove the position and state of a pipeline
    pub async fn reset(&self, pipeline_id: u64) -> Result<()> {
        self.bounded(self.positions.delete(pipeline_id)).await?;
        self.bounded(self.states.delete(pipeline_id)).await?;
        info!(pipeline_id, "Reset pipeline position and state");
        Ok(())
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.request_timeout, fut).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service() -> (TempDir, PositionStateService) {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        (dir, PositionStateService::local(store, Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_missing_position_is_zero() {
        let (_dir, svc) = service();
        let position = svc.get_position(42).await.unwrap();
        assert!(position.is_zero());
    }

    #[tokio::test]
    async fn test_position_upsert() {
        let (_dir, svc) = service();
        svc.save_position(1, &BinlogPosition::new("mysql-bin.000001", 4))
            .await
            .unwrap();
        svc.save_position(1, &BinlogPosition::new("mysql-bin.000002", 120))
            .await
            .unwrap();

        let position = svc.get_position(1).await.unwrap();
        assert_eq!(position, BinlogPosition::new("mysql-bin.000002", 120));
        assert_eq!(position.to_string(), "mysql-bin.000002:120");
    }

    #[tokio::test]
    async fn test_state_existence() {
        let (_dir, svc) = service();
        assert!(!svc.is_exists(7).await.unwrap());
        assert_eq!(svc.get_state(7).await.unwrap().status(), RunStatus::Stopped);

        let mut state = PipelineState::running("http://node-a:8060", 1_000);
        svc.save_state(7, &state).await.unwrap();
        assert!(svc.is_exists(7).await.unwrap());
        assert!(svc.get_state(7).await.unwrap().is_running());

        // Stopped is still distinguishable from never started
        state.set_status(RunStatus::Stopped);
        svc.save_state(7, &state).await.unwrap();
        assert!(svc.is_exists(7).await.unwrap());
        assert!(!svc.get_state(7).await.unwrap().is_running());
    }

    #[tokio::test]
    async fn test_reset_removes_both_records() {
        let (_dir, svc) = service();
        svc.save_position(3, &BinlogPosition::new("mysql-bin.000009", 77))
            .await
            .unwrap();
        svc.save_state(3, &PipelineState::running("node", 1))
            .await
            .unwrap();

        svc.reset(3).await.unwrap();
        assert!(svc.get_position(3).await.unwrap().is_zero());
        assert!(!svc.is_exists(3).await.unwrap());
    }

    #[tokio::test]
    async fn test_standalone_machine_index() {
        let (_dir, svc) = service();
        assert_eq!(svc.get_machine_index("http://localhost:8060").await.unwrap(), 0);
        svc.release_machine_index("http://localhost:8060").await.unwrap();
    }
}
