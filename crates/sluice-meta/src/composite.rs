//! Composite metadata service
//!
//! One [`CompositeDao`] per entity kind mediates between the node's
//! [`LocalStore`] and the remote coordinator:
//!
//! - reads (`get`, `get_by_param`, `select_list`) are served from the local
//!   store only
//! - cascade writes go to the coordinator first and are committed locally
//!   only once the coordinator accepted them
//! - reconciliation (`refresh_all`, `refresh_one`) pulls newer bodies from
//!   the coordinator and never lets a local copy move backwards
//!
//! # Ordering
//!
//! Cascade writes and `refresh_one` hold a shared reconciliation guard and
//! an exclusive per-id lock; `refresh_all` holds the reconciliation guard
//! exclusively. A reconciliation can therefore never apply a stale body on
//! top of an in-flight cascade write for the same id.
//!
//! Without a coordinator (standalone mode) cascade writes only touch the
//! local store and reconciliation is a no-op.

use crate::entity::{Entity, EndpointInfo, MetadataVersion, PipelineInfo, SourceInfo};
use crate::error::{MetaError, Result};
use crate::observability::MetadataMetrics;
use crate::remote::MetadataDao;
use crate::storage::{LocalStore, ScanOrder, WriteTx};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

pub type SourceDao = CompositeDao<SourceInfo>;
pub type EndpointDao = CompositeDao<EndpointInfo>;
pub type PipelineDao = CompositeDao<PipelineInfo>;

/// Result of a full reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Local records removed because the coordinator no longer has them
    pub deleted: usize,
    /// Local records inserted or overwritten with a newer body
    pub updated: usize,
    /// Manifest entries already at least as fresh locally
    pub skipped: usize,
}

impl RefreshReport {
    pub fn changes(&self) -> usize {
        self.deleted + self.updated
    }

    pub fn merge(&mut self, other: RefreshReport) {
        self.deleted += other.deleted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

/// Result of an incremental reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Deleted,
    Updated,
    Unchanged,
}

pub struct CompositeDao<E: Entity> {
    local: LocalStore,
    remote: Option<Arc<dyn MetadataDao<E>>>,
    request_timeout: Duration,
    update_attempts: u32,
    id_locks: DashMap<u64, Arc<Mutex<()>>>,
    reconcile: RwLock<()>,
}

impl<E: Entity> std::fmt::Debug for CompositeDao<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeDao")
            .field("kind", &E::KIND)
            .field("standalone", &self.remote.is_none())
            .finish()
    }
}

impl<E: Entity> CompositeDao<E> {
    pub fn new(
        local: LocalStore,
        remote: Option<Arc<dyn MetadataDao<E>>>,
        request_timeout: Duration,
        update_attempts: u32,
    ) -> Self {
        Self {
            local,
            remote,
            request_timeout,
            update_attempts: update_attempts.max(1),
            id_locks: DashMap::new(),
            reconcile: RwLock::new(()),
        }
    }

    /// Service without a coordinator
    pub fn standalone(local: LocalStore) -> Self {
        Self::new(local, None, Duration::from_secs(5), 1)
    }

    pub fn is_standalone(&self) -> bool {
        self.remote.is_none()
    }

    // ==================== Local-only writes ====================

    /// Overwrite the local copy; the coordinator is not touched
    pub fn save(&self, entity: &E) -> Result<()> {
        self.local.put(E::BUCKET, entity.id(), &entity.to_bytes())
    }

    /// Remove the local copy, returning whether one existed
    pub fn delete(&self, id: u64) -> Result<bool> {
        self.local.delete(E::BUCKET, id)
    }

    // ==================== Cascade writes ====================

    /// Create the entity on the coordinator, then locally
    pub async fn cascade_insert(&self, entity: &E) -> Result<()> {
        let started = Instant::now();
        let id = entity.id();
        let _guard = self.reconcile.read().await;
        let _lock = self.lock_id(id).await;

        let result = match &self.remote {
            Some(remote) => match self.bounded(remote.insert(entity)).await {
                Ok(()) => self.commit_local("insert", id, |tx| {
                    tx.put(E::BUCKET, id, &entity.to_bytes())
                }),
                Err(e) => Err(e),
            },
            None => self.local.update(|tx| {
                if tx.get(E::BUCKET, id)?.is_some() {
                    return Err(MetaError::AlreadyExists { kind: E::KIND, id });
                }
                tx.put(E::BUCKET, id, &entity.to_bytes())
            }),
        };

        self.finish("insert", id, entity.data_version(), started, &result);
        result
    }

    /// Bump the version by one and store the new body everywhere
    ///
    /// Reads the coordinator's current version `v`, sets
    /// `entity.data_version = v + 1` and issues a compare-and-swap against
    /// `v`. On any failure nothing is written and `entity` keeps its previous
    /// version. Returns the new version.
    pub async fn cascade_update(&self, entity: &mut E) -> Result<i32> {
        let started = Instant::now();
        let id = entity.id();
        let previous = entity.data_version();
        let _guard = self.reconcile.read().await;
        let _lock = self.lock_id(id).await;

        let result = match &self.remote {
            Some(remote) => self.remote_update(remote.as_ref(), entity).await,
            None => self.local.update(|tx| {
                let current = match tx.get(E::BUCKET, id)? {
                    Some(bytes) => E::from_bytes(&bytes)?.data_version(),
                    None => return Err(MetaError::NotFound { kind: E::KIND, id }),
                };
                entity.set_data_version(current + 1);
                tx.put(E::BUCKET, id, &entity.to_bytes())?;
                Ok(current + 1)
            }),
        };

        if result.is_err() {
            entity.set_data_version(previous);
        }
        self.finish("update", id, entity.data_version(), started, &result);
        result
    }

    async fn remote_update(&self, remote: &dyn MetadataDao<E>, entity: &mut E) -> Result<i32> {
        let id = entity.id();
        let current = self.bounded(remote.get_data_version(id)).await?;
        let next = current + 1;
        entity.set_data_version(next);

        if let Err(e) = self.bounded(remote.update(entity, current)).await {
            if e.is_conflict() {
                MetadataMetrics::increment_version_conflicts(E::KIND);
            }
            return Err(e);
        }

        self.commit_local("update", id, |tx| {
            tx.put(E::BUCKET, id, &entity.to_bytes())
        })?;
        Ok(next)
    }

    /// [`cascade_update`](Self::cascade_update), retried on version conflicts
    ///
    /// Each attempt re-reads the coordinator's version. Gives up after the
    /// configured number of attempts and returns the last conflict.
    pub async fn cascade_update_with_retry(&self, entity: &mut E) -> Result<i32> {
        let mut attempt = 1;
        loop {
            match self.cascade_update(entity).await {
                Err(e) if e.is_conflict() && attempt < self.update_attempts => {
                    warn!(kind = %E::KIND, id = entity.id(), attempt, error = %e, "Update lost version race, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Remove the entity from the coordinator, then locally
    pub async fn cascade_delete(&self, id: u64) -> Result<()> {
        let started = Instant::now();
        let _guard = self.reconcile.read().await;
        let _lock = self.lock_id(id).await;

        let result = match &self.remote {
            Some(remote) => match self.bounded(remote.delete(id)).await {
                Ok(()) => self.commit_local("delete", id, |tx| {
                    tx.delete(E::BUCKET, id).map(|_| ())
                }),
                Err(e) => Err(e),
            },
            None => self.local.delete(E::BUCKET, id).map(|_| ()),
        };

        self.finish("delete", id, 0, started, &result);
        result
    }

    // ==================== Reads ====================

    pub fn get(&self, id: u64) -> Result<E> {
        match self.local.get(E::BUCKET, id)? {
            Some(bytes) => E::from_bytes(&bytes),
            None => Err(MetaError::NotFound { kind: E::KIND, id }),
        }
    }

    /// First entity in id order matching `params`, with an exact name match
    pub fn get_by_param(&self, params: &E::Params) -> Result<E> {
        self.scan(ScanOrder::Ascending)?
            .into_iter()
            .find(|entity| entity.matches(params, true))
            .ok_or_else(|| MetaError::NoMatch {
                kind: E::KIND,
                filter: format!("{params:?}"),
            })
    }

    /// Every entity matching `params`, with a substring name match
    pub fn select_list(&self, params: &E::Params) -> Result<Vec<E>> {
        Ok(self
            .scan(E::LIST_ORDER)?
            .into_iter()
            .filter(|entity| entity.matches(params, false))
            .collect())
    }

    fn scan(&self, order: ScanOrder) -> Result<Vec<E>> {
        let records = self.local.scan_all(E::BUCKET, order)?;
        let mut entities = Vec::with_capacity(records.len());
        for (id, bytes) in records {
            match E::from_bytes(&bytes) {
                Ok(entity) => entities.push(entity),
                Err(e) => {
                    MetadataMetrics::increment_corrupt_records(E::KIND);
                    warn!(kind = %E::KIND, id, error = %e, "Skipping unreadable local record");
                }
            }
        }
        Ok(entities)
    }

    // ==================== Reconciliation ====================

    /// Fetch the coordinator's manifest and run [`refresh_all`](Self::refresh_all)
    pub async fn refresh_from_remote(&self) -> Result<RefreshReport> {
        let Some(remote) = &self.remote else {
            return Ok(RefreshReport::default());
        };
        let manifest = self.bounded(remote.select_all_data_version()).await?;
        self.refresh_all(&manifest).await
    }

    /// Full reconciliation against a coordinator manifest
    ///
    /// Local ids missing from the manifest are deleted; manifest entries that
    /// are absent locally or carry a newer version are fetched and stored.
    /// Entries whose local version is already at least the manifest version
    /// are never fetched. A fetched body that does not decode is skipped and
    /// the local copy stays as it is. All changes land in one local transaction, so a
    /// failure or a dropped future leaves the cache untouched.
    pub async fn refresh_all(&self, manifest: &[MetadataVersion]) -> Result<RefreshReport> {
        let Some(remote) = &self.remote else {
            return Ok(RefreshReport::default());
        };
        let started = Instant::now();
        let _guard = self.reconcile.write().await;

        let local = self.local_versions()?;
        let wanted: HashSet<u64> = manifest.iter().map(|m| m.id).collect();

        let mut to_delete: Vec<u64> = local
            .keys()
            .copied()
            .filter(|id| !wanted.contains(id))
            .collect();

        let mut skipped = 0;
        let mut fetched = Vec::new();
        for entry in manifest {
            match local.get(&entry.id) {
                Some(Some(version)) if *version >= entry.version => skipped += 1,
                _ => match self.bounded(remote.get(entry.id)).await {
                    Ok(Some(entity)) => fetched.push(entity),
                    Ok(None) => {
                        debug!(kind = %E::KIND, id = entry.id, "Entity vanished after manifest was taken");
                        if local.contains_key(&entry.id) {
                            to_delete.push(entry.id);
                        }
                    }
                    Err(MetaError::Serialization(reason)) => {
                        MetadataMetrics::increment_corrupt_records(E::KIND);
                        warn!(
                            kind = %E::KIND,
                            id = entry.id,
                            version = entry.version,
                            error = %reason,
                            "Coordinator body is unreadable, keeping local copy"
                        );
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        let report = self.local.update(|tx| {
            let mut report = RefreshReport {
                skipped,
                ..Default::default()
            };
            for id in &to_delete {
                if tx.delete(E::BUCKET, *id)? {
                    report.deleted += 1;
                }
            }
            for entity in &fetched {
                match stored_version::<E>(tx, entity.id())? {
                    Some(current) if current >= entity.data_version() => report.skipped += 1,
                    _ => {
                        tx.put(E::BUCKET, entity.id(), &entity.to_bytes())?;
                        report.updated += 1;
                    }
                }
            }
            Ok(report)
        })?;

        MetadataMetrics::record_refresh_all(E::KIND, report.deleted, report.updated, started.elapsed());
        if report.changes() > 0 {
            info!(
                kind = %E::KIND,
                deleted = report.deleted,
                updated = report.updated,
                skipped = report.skipped,
                "Reconciled local cache"
            );
        } else {
            debug!(kind = %E::KIND, skipped = report.skipped, "Local cache already fresh");
        }
        Ok(report)
    }

    /// Incremental reconciliation for one id
    ///
    /// Deletes the local copy if the coordinator no longer has the entity,
    /// stores the fetched body if the local copy is older than
    /// `remote_version`, and does nothing otherwise.
    pub async fn refresh_one(&self, id: u64, remote_version: i32) -> Result<RefreshOutcome> {
        let Some(remote) = &self.remote else {
            return Ok(RefreshOutcome::Unchanged);
        };
        let _guard = self.reconcile.read().await;
        let _lock = self.lock_id(id).await;
        MetadataMetrics::increment_refresh_one(E::KIND);

        let fetched = self.bounded(remote.get(id)).await?;
        let outcome = self.local.update(|tx| {
            let local_version = match tx.get(E::BUCKET, id)? {
                None => None,
                // An unreadable local copy is always replaced
                Some(bytes) => Some(E::from_bytes(&bytes).map(|e| e.data_version()).unwrap_or(i32::MIN)),
            };
            match (fetched.as_ref(), local_version) {
                (None, Some(_)) => {
                    tx.delete(E::BUCKET, id)?;
                    Ok(RefreshOutcome::Deleted)
                }
                (None, None) => Ok(RefreshOutcome::Unchanged),
                (Some(entity), local) => {
                    let local = local.unwrap_or(i32::MIN);
                    if local < remote_version && local < entity.data_version() {
                        tx.put(E::BUCKET, id, &entity.to_bytes())?;
                        Ok(RefreshOutcome::Updated)
                    } else {
                        Ok(RefreshOutcome::Unchanged)
                    }
                }
            }
        })?;

        if outcome != RefreshOutcome::Unchanged {
            info!(kind = %E::KIND, id, remote_version, ?outcome, "Refreshed local copy");
        }
        Ok(outcome)
    }

    /// Every local `{id, version}`, `None` for unreadable records
    fn local_versions(&self) -> Result<HashMap<u64, Option<i32>>> {
        let records = self.local.scan_all(E::BUCKET, ScanOrder::Ascending)?;
        Ok(records
            .into_iter()
            .map(|(id, bytes)| {
                let version = match E::from_bytes(&bytes) {
                    Ok(entity) => Some(entity.data_version()),
                    Err(e) => {
                        MetadataMetrics::increment_corrupt_records(E::KIND);
                        warn!(kind = %E::KIND, id, error = %e, "Unreadable local record will be refetched");
                        None
                    }
                };
                (id, version)
            })
            .collect())
    }

    // ==================== Helpers ====================

    /// Entries are never removed: a queued task may still hold a clone
    async fn lock_id(&self, id: u64) -> OwnedMutexGuard<()> {
        let lock = self.id_locks.entry(id).or_default().clone();
        lock.lock_owned().await
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.request_timeout, fut).await?
    }

    /// Local half of a cascade write whose remote half already succeeded
    fn commit_local<F>(&self, op: &'static str, id: u64, f: F) -> Result<()>
    where
        F: FnOnce(&WriteTx<'_>) -> Result<()>,
    {
        self.local.update(f).inspect_err(|e| {
            error!(
                kind = %E::KIND,
                id,
                op,
                error = %e,
                "Coordinator accepted the write but the local commit failed; reconciliation will repair the cache"
            );
        })
    }

    fn finish<T>(&self, op: &'static str, id: u64, version: i32, started: Instant, result: &Result<T>) {
        MetadataMetrics::record_cascade(op, E::KIND, started.elapsed(), result.is_ok());
        match result {
            Ok(_) => info!(kind = %E::KIND, id, version, op, "Cascade write committed"),
            Err(e) => warn!(kind = %E::KIND, id, op, error = %e, "Cascade write failed"),
        }
    }
}

fn stored_version<E: Entity>(tx: &WriteTx<'_>, id: u64) -> Result<Option<i32>> {
    Ok(tx
        .get(E::BUCKET, id)?
        .and_then(|bytes| E::from_bytes(&bytes).ok())
        .map(|entity| entity.data_version()))
}
