//! Convergence tasks
//!
//! Two independent mechanisms bring a node's local cache in line with the
//! coordinator:
//!
//! - [`SyncEventListener`] applies push notifications as they arrive
//!   (`refresh_one`). Delivery is best-effort; a lagging receiver falls back
//!   to a full reconciliation.
//! - [`Reconciler`] runs a full reconciliation every interval, which is
//!   correct regardless of how many events were lost.

use crate::context::MetadataContext;
use crate::entity::EntityKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Advisory change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub kind: EntityKind,
    pub id: u64,
    pub version: i32,
}

impl SyncEvent {
    pub fn new(kind: EntityKind, id: u64, version: i32) -> Self {
        Self { kind, id, version }
    }
}

/// Background task feeding sync events into the metadata context
pub struct SyncEventListener;

impl SyncEventListener {
    pub fn spawn(
        ctx: Arc<MetadataContext>,
        mut events: broadcast::Receiver<SyncEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Sync event listener started");
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => ctx.on_sync_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Sync events dropped, running full reconciliation");
                            if let Err(e) = ctx.refresh_metadata().await {
                                error!(error = %e, "Full reconciliation after lag failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Sync event channel closed");
                            break;
                        }
                    },
                    _ = shutdown.recv() => {
                        info!("Sync event listener shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Periodic full reconciliation
pub struct Reconciler;

impl Reconciler {
    pub fn spawn(
        ctx: Arc<MetadataContext>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; boot already reconciled
            ticker.tick().await;
            info!(interval_ms = interval.as_millis() as u64, "Reconciler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match ctx.refresh_metadata().await {
                            Ok(report) => debug!(
                                deleted = report.deleted,
                                updated = report.updated,
                                "Periodic reconciliation finished"
                            ),
                            Err(e) => error!(error = %e, "Periodic reconciliation failed, retrying next interval"),
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = SyncEvent::new(EntityKind::Pipeline, 42, 7);
        let yaml = serde_yaml::to_string(&event).unwrap();
        assert!(yaml.contains("kind: pipeline"));
        let back: SyncEvent = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, event);
    }
}
