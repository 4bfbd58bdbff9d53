//! Node daemon
//!
//! Startup sequence:
//! 1. open the metadata context (local store, coordinator)
//! 2. register the node's machine index
//! 3. in cluster mode, reconcile the local cache from the coordinator;
//!    failure here aborts startup
//! 4. start the sync event listener and the periodic reconciler
//!
//! Shutdown stops the background tasks, releases the machine index and
//! closes the context.

use crate::settings::Settings;
use sluice_meta::{init_metrics, MetadataContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Handle for triggering daemon shutdown
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        // No receivers means the daemon already stopped
        let _ = self.tx.send(());
    }
}

pub struct Daemon {
    ctx: Arc<MetadataContext>,
    machine_index: u16,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
    shutdown_timeout: Duration,
}

impl Daemon {
    /// Bring the node up to the point where it can serve metadata
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        init_metrics();
        let cluster = settings.metadata.is_cluster();

        let ctx = MetadataContext::open(settings.metadata)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open metadata context: {}", e))?;

        let machine_index = match Self::boot(&ctx, cluster).await {
            Ok(index) => index,
            Err(e) => return Err(Self::abort_startup(ctx, e).await),
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        Ok(Self {
            ctx: Arc::new(ctx),
            machine_index,
            shutdown_tx,
            shutdown_rx,
            shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_secs),
        })
    }

    async fn boot(ctx: &MetadataContext, cluster: bool) -> anyhow::Result<u16> {
        let machine_index = ctx
            .register_machine()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to register machine index: {}", e))?;

        if cluster {
            let report = ctx
                .refresh_metadata()
                .await
                .map_err(|e| anyhow::anyhow!("Boot-time reconciliation failed: {}", e))?;
            info!(
                deleted = report.deleted,
                updated = report.updated,
                skipped = report.skipped,
                "Boot-time reconciliation complete"
            );
        }
        Ok(machine_index)
    }

    /// Release what a partial startup acquired and hand back its error
    async fn abort_startup(ctx: MetadataContext, cause: anyhow::Error) -> anyhow::Error {
        if let Err(e) = ctx.close().await {
            warn!(error = %e, "Failed to close metadata context after startup failure");
        }
        cause
    }

    pub fn context(&self) -> &Arc<MetadataContext> {
        &self.ctx
    }

    pub fn machine_index(&self) -> u16 {
        self.machine_index
    }

    pub fn get_shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run the background tasks until shutdown is requested
    pub async fn run(mut self) -> anyhow::Result<()> {
        let tasks = self.ctx.spawn_background(&self.shutdown_tx);
        info!(
            machine_index = self.machine_index,
            background_tasks = tasks.len(),
            "Node running"
        );

        // Err means every sender is gone, which is a shutdown as well
        let _ = self.shutdown_rx.recv().await;
        info!("Stopping background tasks");
        // Tasks spawned after an early shutdown request never saw it
        let _ = self.shutdown_tx.send(());

        let join_all = async {
            for task in tasks {
                if let Err(e) = task.await {
                    error!("Background task panicked: {}", e);
                }
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, join_all)
            .await
            .is_err()
        {
            warn!(
                "Background tasks did not stop within {:?}",
                self.shutdown_timeout
            );
        }

        self.ctx.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_meta::{Coordinator, CoordinatorConfig, MemoryCoordinator, MetadataConfig, PipelineInfo};
    use tempfile::TempDir;

    fn settings(metadata: MetadataConfig) -> Settings {
        Settings {
            metadata,
            shutdown_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_standalone_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut metadata = MetadataConfig::standalone();
        metadata.data_dir = dir.path().to_path_buf();

        let daemon = Daemon::new(settings(metadata)).await.unwrap();
        assert_eq!(daemon.machine_index(), 0);

        let ctx = daemon.context().clone();
        let pipeline = PipelineInfo {
            id: 1,
            name: "p1".into(),
            ..Default::default()
        };
        ctx.pipelines().cascade_insert(&pipeline).await.unwrap();

        let handle = daemon.get_shutdown_handle();
        let running = tokio::spawn(daemon.run());
        handle.shutdown();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cluster_boot_with_memory_coordinator() {
        let dir = TempDir::new().unwrap();
        let metadata = MetadataConfig::cluster()
            .data_dir(dir.path())
            .node_url("http://node-1:8060")
            .coordinator(CoordinatorConfig::memory())
            .build();

        let daemon = Daemon::new(settings(metadata)).await.unwrap();
        assert_eq!(daemon.machine_index(), 1);

        let handle = daemon.get_shutdown_handle();
        let running = tokio::spawn(daemon.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_mysql_aborts_startup() {
        let dir = TempDir::new().unwrap();
        let mut coordinator = CoordinatorConfig::mysql("mysql://sluice@127.0.0.1:1/sluice");
        coordinator.request_timeout_ms = 500;
        let metadata = MetadataConfig::cluster()
            .data_dir(dir.path())
            .node_url("http://node-1:8060")
            .coordinator(coordinator)
            .build();

        assert!(Daemon::new(settings(metadata)).await.is_err());
    }

    #[tokio::test]
    async fn test_aborted_startup_releases_machine_index() {
        let memory = MemoryCoordinator::new();
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let open = |dir: &TempDir, url: &str| {
            let config = MetadataConfig::cluster()
                .data_dir(dir.path())
                .node_url(url)
                .build();
            MetadataContext::open_with(config, Some(Coordinator::Memory(memory.clone()))).unwrap()
        };

        let failed = open(&dir_a, "http://node-1:8060");
        assert_eq!(failed.register_machine().await.unwrap(), 1);
        let err = Daemon::abort_startup(failed, anyhow::anyhow!("boot refresh failed")).await;
        assert_eq!(err.to_string(), "boot refresh failed");

        // The index is free again for the next node
        let next = open(&dir_b, "http://node-2:8060");
        assert_eq!(next.register_machine().await.unwrap(), 1);
        next.close().await.unwrap();
    }
}
