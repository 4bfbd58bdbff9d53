//! MySQL coordinator backend
//!
//! All nodes of a cluster point at one schema. The tables are created on
//! connect if missing:
//!
//! ```text
//! sluice_metadata  (kind, id) -> version, data   entity bodies, CAS on version
//! sluice_position  pipeline_id -> data           BinlogPosition
//! sluice_state     pipeline_id -> data           PipelineState
//! sluice_machine   machine_index <-> url         node identity
//! ```
//!
//! There is no push channel; peers converge through periodic reconciliation.

use super::{first_free_index, RawRecord};
use crate::config::MySqlConfig;
use crate::entity::{EntityKind, MetadataVersion};
use crate::error::{MetaError, Result};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts};
use tracing::{debug, info, warn};

/// Server error code for a duplicate primary/unique key
const ER_DUP_ENTRY: u16 = 1062;

/// Attempts to claim a machine index before giving up on contention
const MACHINE_CLAIM_ATTEMPTS: usize = 8;

const SCHEMA: [&str; 4] = [
    r"CREATE TABLE IF NOT EXISTS sluice_metadata (
        kind TINYINT UNSIGNED NOT NULL,
        id BIGINT UNSIGNED NOT NULL,
        version INT NOT NULL,
        data BLOB NOT NULL,
        PRIMARY KEY (kind, id)
    )",
    r"CREATE TABLE IF NOT EXISTS sluice_position (
        pipeline_id BIGINT UNSIGNED NOT NULL PRIMARY KEY,
        data BLOB NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS sluice_state (
        pipeline_id BIGINT UNSIGNED NOT NULL PRIMARY KEY,
        data BLOB NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS sluice_machine (
        machine_index SMALLINT UNSIGNED NOT NULL PRIMARY KEY,
        url VARCHAR(255) NOT NULL,
        UNIQUE KEY uk_machine_url (url)
    )",
];

pub struct MySqlCoordinator {
    pool: Pool,
}

impl std::fmt::Debug for MySqlCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlCoordinator").finish_non_exhaustive()
    }
}

fn is_duplicate_key(e: &mysql_async::Error) -> bool {
    matches!(e, mysql_async::Error::Server(server) if server.code == ER_DUP_ENTRY)
}

impl MySqlCoordinator {
    /// Connect the pool and create missing tables
    pub async fn connect(config: &MySqlConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| MetaError::InvalidConfig("mysql.url is required".into()))?;
        let opts = Opts::from_url(url)
            .map_err(|e| MetaError::InvalidConfig(format!("invalid mysql url: {e}")))?;

        let constraints = PoolConstraints::new(1, config.pool_max.max(1)).ok_or_else(|| {
            MetaError::InvalidConfig(format!("invalid mysql pool_max {}", config.pool_max))
        })?;
        let opts = OptsBuilder::from_opts(opts)
            .pool_opts(PoolOpts::default().with_constraints(constraints));

        let coordinator = Self {
            pool: Pool::new(opts),
        };
        coordinator.bootstrap().await?;
        info!(pool_max = config.pool_max, "Connected MySQL coordinator");
        Ok(coordinator)
    }

    async fn bootstrap(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        for ddl in SCHEMA {
            conn.query_drop(ddl).await?;
        }
        debug!("MySQL coordinator schema ready");
        Ok(())
    }

    async fn conn(&self) -> Result<Conn> {
        Ok(self.pool.get_conn().await?)
    }

    pub async fn close(&self) -> Result<()> {
        self.pool.clone().disconnect().await?;
        info!("Disconnected MySQL coordinator");
        Ok(())
    }

    // ==================== Entities ====================

    pub(super) async fn insert(&self, kind: EntityKind, id: u64, record: RawRecord) -> Result<()> {
        let mut conn = self.conn().await?;
        let result = conn
            .exec_drop(
                "INSERT INTO sluice_metadata (kind, id, version, data) VALUES (?, ?, ?, ?)",
                (kind.code(), id, record.version, record.data),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(MetaError::AlreadyExists { kind, id }),
            Err(e) => Err(e.into()),
        }
    }

    pub(super) async fn delete(&self, kind: EntityKind, id: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "DELETE FROM sluice_metadata WHERE kind = ? AND id = ?",
            (kind.code(), id),
        )
        .await?;
        Ok(())
    }

    pub(super) async fn update(
        &self,
        kind: EntityKind,
        id: u64,
        expected_version: i32,
        record: RawRecord,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "UPDATE sluice_metadata SET version = ?, data = ? WHERE kind = ? AND id = ? AND version = ?",
            (record.version, record.data, kind.code(), id, expected_version),
        )
        .await?;
        if conn.affected_rows() == 1 {
            return Ok(());
        }

        // Nothing matched: absent or someone else won the race
        let actual: Option<i32> = conn
            .exec_first(
                "SELECT version FROM sluice_metadata WHERE kind = ? AND id = ?",
                (kind.code(), id),
            )
            .await?;
        match actual {
            None => Err(MetaError::NotFound { kind, id }),
            Some(actual) => Err(MetaError::VersionConflict {
                kind,
                id,
                expected: expected_version,
                actual: Some(actual),
            }),
        }
    }

    pub(super) async fn get(&self, kind: EntityKind, id: u64) -> Result<Option<RawRecord>> {
        let mut conn = self.conn().await?;
        let row: Option<(i32, Vec<u8>)> = conn
            .exec_first(
                "SELECT version, data FROM sluice_metadata WHERE kind = ? AND id = ?",
                (kind.code(), id),
            )
            .await?;
        Ok(row.map(|(version, data)| RawRecord { version, data }))
    }

    pub(super) async fn versions(&self, kind: EntityKind) -> Result<Vec<MetadataVersion>> {
        let mut conn = self.conn().await?;
        let rows: Vec<(u64, i32)> = conn
            .exec(
                "SELECT id, version FROM sluice_metadata WHERE kind = ? ORDER BY id",
                (kind.code(),),
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, version)| MetadataVersion::new(id, version))
            .collect())
    }

    // ==================== Position / State ====================

    pub(super) async fn save_position(&self, pipeline_id: u64, data: Vec<u8>) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "INSERT INTO sluice_position (pipeline_id, data) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE data = VALUES(data)",
            (pipeline_id, data),
        )
        .await?;
        Ok(())
    }

    pub(super) async fn get_position(&self, pipeline_id: u64) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(conn
            .exec_first(
                "SELECT data FROM sluice_position WHERE pipeline_id = ?",
                (pipeline_id,),
            )
            .await?)
    }

    pub(super) async fn delete_position(&self, pipeline_id: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "DELETE FROM sluice_position WHERE pipeline_id = ?",
            (pipeline_id,),
        )
        .await?;
        Ok(())
    }

    pub(super) async fn save_state(&self, pipeline_id: u64, data: Vec<u8>) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "INSERT INTO sluice_state (pipeline_id, data) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE data = VALUES(data)",
            (pipeline_id, data),
        )
        .await?;
        Ok(())
    }

    pub(super) async fn get_state(&self, pipeline_id: u64) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(conn
            .exec_first(
                "SELECT data FROM sluice_state WHERE pipeline_id = ?",
                (pipeline_id,),
            )
            .await?)
    }

    pub(super) async fn delete_state(&self, pipeline_id: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "DELETE FROM sluice_state WHERE pipeline_id = ?",
            (pipeline_id,),
        )
        .await?;
        Ok(())
    }

    // ==================== Machine registry ====================

    pub(super) async fn get_machine_index(&self, node_url: &str) -> Result<u16> {
        let mut conn = self.conn().await?;
        for attempt in 1..=MACHINE_CLAIM_ATTEMPTS {
            let existing: Option<u16> = conn
                .exec_first(
                    "SELECT machine_index FROM sluice_machine WHERE url = ?",
                    (node_url,),
                )
                .await?;
            if let Some(index) = existing {
                return Ok(index);
            }

            let used: Vec<u16> = conn
                .query("SELECT machine_index FROM sluice_machine")
                .await?;
            let index = first_free_index(used)
                .ok_or_else(|| MetaError::MachineIndexExhausted(node_url.to_string()))?;

            let claimed = conn
                .exec_drop(
                    "INSERT INTO sluice_machine (machine_index, url) VALUES (?, ?)",
                    (index, node_url),
                )
                .await;
            match claimed {
                Ok(()) => return Ok(index),
                Err(e) if is_duplicate_key(&e) => {
                    warn!(node_url, index, attempt, "Machine index claimed concurrently, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(MetaError::CoordinatorUnavailable(format!(
            "could not claim a machine index for {node_url} after {MACHINE_CLAIM_ATTEMPTS} attempts"
        )))
    }

    pub(super) async fn release_machine_index(&self, node_url: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop("DELETE FROM sluice_machine WHERE url = ?", (node_url,))
            .await?;
        Ok(())
    }
}
