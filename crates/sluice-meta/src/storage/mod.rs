//! Local cache store
//!
//! Every node keeps a private, crash-safe copy of all configuration entities
//! and of the per-pipeline replication progress in a single redb file:
//!
//! ```text
//! <data_dir>/db/metadata.redb
//!   position   pipeline id -> BinlogPosition
//!   state      pipeline id -> PipelineState
//!   source     source id   -> SourceInfo
//!   endpoint   endpoint id -> EndpointInfo
//!   pipeline   pipeline id -> PipelineInfo
//! ```
//!
//! Keys are the 8-byte big-endian encoding of the numeric id, so byte order
//! and numeric order coincide and cursors iterate in id order in both
//! directions.
//!
//! # Example
//!
//! ```ignore
//! use sluice_meta::storage::{Bucket, LocalStore};
//!
//! let store = LocalStore::open("/var/lib/sluice")?;
//! store.update(|tx| {
//!     tx.put(Bucket::Pipeline, 1, &bytes)?;
//!     tx.delete(Bucket::Pipeline, 2)?;
//!     Ok(())
//! })?;
//! ```

mod redb_store;

pub use redb_store::{LocalStore, ReadTx, WriteTx};

use crate::error::{MetaError, Result};
use redb::TableDefinition;
use std::fmt;

/// Width of an encoded id key
pub const ID_KEY_LEN: usize = 8;

/// Independent partitions of the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Position,
    State,
    Source,
    Endpoint,
    Pipeline,
}

impl Bucket {
    /// All buckets created at bootstrap
    pub const ALL: [Bucket; 5] = [
        Bucket::Position,
        Bucket::State,
        Bucket::Source,
        Bucket::Endpoint,
        Bucket::Pipeline,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Bucket::Position => "position",
            Bucket::State => "state",
            Bucket::Source => "source",
            Bucket::Endpoint => "endpoint",
            Bucket::Pipeline => "pipeline",
        }
    }

    pub(crate) fn table(self) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
        TableDefinition::new(self.name())
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cursor direction for full-bucket scans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanOrder {
    /// Lowest id first
    #[default]
    Ascending,
    /// Highest id first
    Descending,
}

/// Encode an id as a fixed-width big-endian key
pub fn encode_id(id: u64) -> [u8; ID_KEY_LEN] {
    id.to_be_bytes()
}

/// Decode a key written by [`encode_id`]
pub fn decode_id(key: &[u8]) -> Result<u64> {
    let bytes: [u8; ID_KEY_LEN] = key.try_into().map_err(|_| {
        MetaError::Serialization(format!(
            "id key must be {} bytes, got {}",
            ID_KEY_LEN,
            key.len()
        ))
    })?;
    Ok(u64::from_be_bytes(bytes))
}
