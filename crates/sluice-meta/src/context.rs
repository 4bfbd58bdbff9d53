//! Metadata context
//!
//! Owns every process-wide handle of the metadata layer: the local store,
//! the coordinator connection, the three composite services and the
//! position/state service. Construct it once at startup with
//! [`MetadataContext::open`] and pass it (usually as `Arc`) to whatever
//! needs metadata; call [`MetadataContext::close`] on shutdown.
//!
//! Tests build isolated contexts per case, and several contexts over clones
//! of one [`MemoryCoordinator`](crate::remote::MemoryCoordinator) behave as
//! a cluster.

use crate::composite::{CompositeDao, EndpointDao, PipelineDao, RefreshReport, SourceDao};
use crate::config::MetadataConfig;
use crate::entity::{Entity, EntityKind};
use crate::error::{MetaError, Result};
use crate::observability::MetadataMetrics;
use crate::progress::PositionStateService;
use crate::remote::{Coordinator, MetadataDao};
use crate::storage::LocalStore;
use crate::sync::{Reconciler, SyncEvent, SyncEventListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct MetadataContext {
    config: MetadataConfig,
    local: LocalStore,
    coordinator: Option<Coordinator>,
    sources: SourceDao,
    endpoints: EndpointDao,
    pipelines: PipelineDao,
    progress: PositionStateService,
    machine_registered: AtomicBool,
}

impl std::fmt::Debug for MetadataContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataContext")
            .field("mode", &self.config.mode)
            .field("local", &self.local)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

fn remote_for<E: Entity>(coordinator: &Option<Coordinator>) -> Option<Arc<dyn MetadataDao<E>>> {
    coordinator
        .clone()
        .map(|c| Arc::new(c) as Arc<dyn MetadataDao<E>>)
}

impl MetadataContext {
    /// Open the local store and, in cluster mode, connect the coordinator
    pub async fn open(config: MetadataConfig) -> Result<Self> {
        config.validate()?;
        let coordinator = if config.is_cluster() {
            Some(Coordinator::connect(&config.coordinator).await?)
        } else {
            None
        };
        Self::open_with(config, coordinator)
    }

    /// Open with an already connected coordinator
    pub fn open_with(config: MetadataConfig, coordinator: Option<Coordinator>) -> Result<Self> {
        config.validate()?;
        match (config.is_cluster(), coordinator.is_some()) {
            (true, false) => {
                return Err(MetaError::InvalidConfig(
                    "cluster mode requires a coordinator".into(),
                ))
            }
            (false, true) => {
                return Err(MetaError::InvalidConfig(
                    "standalone mode does not use a coordinator".into(),
                ))
            }
            _ => {}
        }

        let local = LocalStore::open(&config.data_dir)?;
        let timeout = config.coordinator.request_timeout();
        let attempts = config.coordinator.update_attempts;

        let progress = match &coordinator {
            Some(c) => {
                let shared = Arc::new(c.clone());
                PositionStateService::new(shared.clone(), shared.clone(), Some(shared), timeout)
            }
            None => PositionStateService::local(local.clone(), timeout),
        };

        let ctx = Self {
            sources: CompositeDao::new(local.clone(), remote_for(&coordinator), timeout, attempts),
            endpoints: CompositeDao::new(local.clone(), remote_for(&coordinator), timeout, attempts),
            pipelines: CompositeDao::new(local.clone(), remote_for(&coordinator), timeout, attempts),
            progress,
            local,
            coordinator,
            config,
            machine_registered: AtomicBool::new(false),
        };
        info!(
            mode = ?ctx.config.mode,
            data_dir = %ctx.config.data_dir.display(),
            coordinator = ctx.coordinator.as_ref().map(|c| c.backend_name()).unwrap_or("none"),
            "Metadata context opened"
        );
        Ok(ctx)
    }

    pub fn config(&self) -> &MetadataConfig {
        &self.config
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local
    }

    pub fn coordinator(&self) -> Option<&Coordinator> {
        self.coordinator.as_ref()
    }

    pub fn sources(&self) -> &SourceDao {
        &self.sources
    }

    pub fn endpoints(&self) -> &EndpointDao {
        &self.endpoints
    }

    pub fn pipelines(&self) -> &PipelineDao {
        &self.pipelines
    }

    pub fn progress(&self) -> &PositionStateService {
        &self.progress
    }

    /// Full reconciliation of every kind: sources, endpoints, then pipelines
    ///
    /// A failing kind does not stop the others. Every failure is logged and
    /// the call returns [`MetaError::ReconciliationFailed`] naming them all.
    pub async fn refresh_metadata(&self) -> Result<RefreshReport> {
        if self.coordinator.is_none() {
            return Ok(RefreshReport::default());
        }
        let results = [
            (EntityKind::Source, self.sources.refresh_from_remote().await),
            (EntityKind::Endpoint, self.endpoints.refresh_from_remote().await),
            (EntityKind::Pipeline, self.pipelines.refresh_from_remote().await),
        ];

        let mut report = RefreshReport::default();
        let mut failed = Vec::new();
        let mut first = None;
        for (kind, result) in results {
            match result {
                Ok(partial) => report.merge(partial),
                Err(e) => {
                    MetadataMetrics::increment_refresh_failures(kind);
                    error!(%kind, error = %e, "Reconciliation failed for kind");
                    failed.push(kind.to_string());
                    first.get_or_insert(e);
                }
            }
        }
        if let Some(first) = first {
            return Err(MetaError::ReconciliationFailed {
                failed: failed.join(", "),
                first: Box::new(first),
            });
        }

        debug!(
            deleted = report.deleted,
            updated = report.updated,
            skipped = report.skipped,
            "Metadata refreshed"
        );
        Ok(report)
    }

    /// Apply one change notification; failures are logged, never returned
    pub async fn on_sync_event(&self, event: SyncEvent) {
        let result = match event.kind {
            EntityKind::Source => self.sources.refresh_one(event.id, event.version).await,
            EntityKind::Endpoint => self.endpoints.refresh_one(event.id, event.version).await,
            EntityKind::Pipeline => self.pipelines.refresh_one(event.id, event.version).await,
        };
        match result {
            Ok(outcome) => debug!(kind = %event.kind, id = event.id, version = event.version, ?outcome, "Applied sync event"),
            Err(e) => {
                MetadataMetrics::increment_refresh_failures(event.kind);
                error!(
                    kind = %event.kind,
                    id = event.id,
                    version = event.version,
                    error = %e,
                    "Sync event refresh failed, waiting for next reconciliation"
                );
            }
        }
    }

    /// Delete a pipeline together with its position and run state
    pub async fn delete_pipeline(&self, id: u64) -> Result<()> {
        self.pipelines.cascade_delete(id).await?;
        self.progress.reset(id).await
    }

    /// Register this node and return its machine index
    ///
    /// Standalone nodes always get `0`.
    pub async fn register_machine(&self) -> Result<u16> {
        let Some(node_url) = self.config.node_url.as_deref() else {
            return Ok(0);
        };
        let index = self.progress.get_machine_index(node_url).await?;
        if self.coordinator.is_some() {
            self.machine_registered.store(true, Ordering::SeqCst);
        }
        Ok(index)
    }

    /// Start the sync event listener (if the coordinator pushes events) and
    /// the periodic reconciler
    ///
    /// Nothing is spawned in standalone mode.
    pub fn spawn_background(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let Some(coordinator) = &self.coordinator else {
            return Vec::new();
        };

        let mut tasks = Vec::with_capacity(2);
        if let Some(events) = coordinator.subscribe() {
            tasks.push(SyncEventListener::spawn(self.clone(), events, shutdown.subscribe()));
        }
        tasks.push(Reconciler::spawn(
            self.clone(),
            self.config.reconcile_interval(),
            shutdown.subscribe(),
        ));
        tasks
    }

    /// Release the machine index and the coordinator connection
    pub async fn close(&self) -> Result<()> {
        if self.machine_registered.swap(false, Ordering::SeqCst) {
            if let Some(node_url) = self.config.node_url.as_deref() {
                if let Err(e) = self.progress.release_machine_index(node_url).await {
                    warn!(node_url, error = %e, "Failed to release machine index");
                }
            }
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.close().await?;
        }
        self.local.clone().close();
        info!("Metadata context closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{PipelineInfo, SourceInfo};
    use crate::remote::{MemoryCoordinator, RawRecord};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_standalone_open() {
        let dir = TempDir::new().unwrap();
        let mut config = MetadataConfig::standalone();
        config.data_dir = dir.path().to_path_buf();

        let ctx = MetadataContext::open(config).await.unwrap();
        assert!(ctx.coordinator().is_none());
        assert!(ctx.local_store().path().starts_with(dir.path()));
        assert_eq!(ctx.refresh_metadata().await.unwrap(), RefreshReport::default());
        assert_eq!(ctx.register_machine().await.unwrap(), 0);

        let source = SourceInfo {
            id: 10,
            name: "primary".into(),
            host: "db-1".into(),
            port: 3306,
            ..Default::default()
        };
        ctx.sources().cascade_insert(&source).await.unwrap();
        assert_eq!(ctx.sources().get(10).unwrap(), source);
        ctx.close().await.unwrap();
    }

    #[test]
    fn test_mode_and_coordinator_must_agree() {
        let dir = TempDir::new().unwrap();
        let config = MetadataConfig::cluster()
            .data_dir(dir.path())
            .node_url("http://node-1:8060")
            .build();
        let err = MetadataContext::open_with(config, None).unwrap_err();
        assert!(matches!(err, MetaError::InvalidConfig(_)));

        let mut config = MetadataConfig::standalone();
        config.data_dir = dir.path().to_path_buf();
        let coordinator = Coordinator::Memory(MemoryCoordinator::new());
        assert!(MetadataContext::open_with(config, Some(coordinator)).is_err());
    }

    #[tokio::test]
    async fn test_refresh_metadata_continues_past_failures() {
        let dir = TempDir::new().unwrap();
        let memory = MemoryCoordinator::new();
        let config = MetadataConfig::cluster()
            .data_dir(dir.path())
            .node_url("http://node-1:8060")
            .build();
        let ctx = MetadataContext::open_with(config, Some(Coordinator::Memory(memory.clone()))).unwrap();

        // An unreadable source must not hold back the pipelines
        memory
            .insert(
                EntityKind::Source,
                10,
                RawRecord {
                    version: 0,
                    data: vec![0xff],
                },
            )
            .await
            .unwrap();
        let pipeline = PipelineInfo {
            id: 1,
            name: "p1".into(),
            ..Default::default()
        };
        MetadataDao::insert(&Coordinator::Memory(memory.clone()), &pipeline)
            .await
            .unwrap();

        let report = ctx.refresh_metadata().await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(ctx.pipelines().get(1).unwrap(), pipeline);
        assert!(ctx.sources().get(10).unwrap_err().is_not_found());

        memory.set_reachable(false);
        match ctx.refresh_metadata().await.unwrap_err() {
            MetaError::ReconciliationFailed { failed, first } => {
                assert_eq!(failed, "source, endpoint, pipeline");
                assert!(matches!(*first, MetaError::CoordinatorUnavailable(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Nothing was lost locally
        assert_eq!(ctx.pipelines().get(1).unwrap(), pipeline);
    }
}
