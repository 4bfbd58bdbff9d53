//! # Sluice Meta
//!
//! Metadata consistency and replication-state coordination for the sluice
//! CDC pipeline runner:
//! - **Local Cache Store**: crash-safe redb copy of every configuration entity
//! - **Remote Coordinator**: cluster-wide authority behind one contract
//! - **Composite Metadata Service**: cascade writes and reconciliation
//! - **Position/State Service**: binlog position and pipeline run state
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       MetadataContext                        │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │  SourceDao / EndpointDao /   │     PositionStateService      │
//! │  PipelineDao (CompositeDao)  │                               │
//! ├──────────────┬───────────────┼───────────────┬───────────────┤
//! │  LocalStore  │  Coordinator  │  LocalStore   │  Coordinator  │
//! │   (reads)    │ (cascade CAS) │ (standalone)  │   (cluster)   │
//! └──────────────┴───────────────┴───────────────┴───────────────┘
//!        ▲                ▲
//!        │   SyncEvent    │  Reconciler (periodic refresh_all)
//!        └── refresh_one ─┘
//! ```
//!
//! ## Deployment Modes
//!
//! - **Standalone**: single node, everything in the local store
//! - **Cluster**: nodes share one coordinator; local stores are caches
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use sluice_meta::{CoordinatorConfig, MetadataConfig, MetadataContext, PipelineInfo};
//!
//! let config = MetadataConfig::cluster()
//!     .node_url("http://node-1:8060")
//!     .coordinator(CoordinatorConfig::mysql("mysql://sluice@db/sluice"))
//!     .build();
//! let ctx = MetadataContext::open(config).await?;
//! ctx.refresh_metadata().await?;
//!
//! let mut pipeline = ctx.pipelines().get(1)?;
//! pipeline.name = "orders-v2".into();
//! let version = ctx.pipelines().cascade_update_with_retry(&mut pipeline).await?;
//! ```

pub mod composite;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod observability;
pub mod progress;
pub mod remote;
pub mod storage;
pub mod sync;

// Re-export main types
pub use composite::{
    CompositeDao, EndpointDao, PipelineDao, RefreshOutcome, RefreshReport, SourceDao,
};
pub use config::{CoordinatorBackend, CoordinatorConfig, DeploymentMode, MetadataConfig, MySqlConfig};
pub use context::MetadataContext;
pub use entity::{
    EndpointInfo, EndpointParams, EndpointType, Entity, EntityKind, MetadataVersion,
    PipelineInfo, PipelineParams, PipelineStatus, SourceInfo, SourceParams,
};
pub use error::{MetaError, Result};
pub use observability::{init_metrics, MetadataMetrics};
pub use progress::{
    BinlogPosition, MachineDao, PipelineState, PositionDao, PositionStateService, RunStatus,
    StateDao,
};
pub use remote::{Coordinator, MemoryCoordinator, MetadataDao, MySqlCoordinator};
pub use storage::{Bucket, LocalStore};
pub use sync::{Reconciler, SyncEvent, SyncEventListener};

/// Re-export common types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::context::MetadataContext;
    pub use crate::entity::*;
    pub use crate::error::*;
    pub use crate::progress::{BinlogPosition, PipelineState, RunStatus};
}
