//! Configuration entities
//!
//! Sources, endpoints (sinks) and pipelines are the configuration objects
//! every node must agree on. Each carries an immutable 64-bit `id`, a
//! mutable `name` and a `data_version` that the coordinator increments on
//! every update.
//!
//! Bodies are encoded as protobuf messages, so nodes running different
//! versions can read each other's records during a rolling upgrade:
//! unknown tags are skipped and missing tags decode to defaults. Tag
//! numbers must never be reused.

use crate::error::Result;
use crate::storage::{Bucket, ScanOrder};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The three kinds of configuration entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Source,
    Endpoint,
    Pipeline,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Source, EntityKind::Endpoint, EntityKind::Pipeline];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Source => "source",
            EntityKind::Endpoint => "endpoint",
            EntityKind::Pipeline => "pipeline",
        }
    }

    /// Stable numeric code used by relational coordinator tables
    pub fn code(self) -> u8 {
        match self {
            EntityKind::Source => 1,
            EntityKind::Endpoint => 2,
            EntityKind::Pipeline => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(EntityKind::Source),
            2 => Some(EntityKind::Endpoint),
            3 => Some(EntityKind::Pipeline),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lightweight `{id, version}` manifest record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataVersion {
    pub id: u64,
    pub version: i32,
}

impl MetadataVersion {
    pub fn new(id: u64, version: i32) -> Self {
        Self { id, version }
    }
}

/// Behaviour shared by every configuration entity
///
/// The composite metadata service and the coordinator backends are generic
/// over this trait, so the cascade and reconciliation logic is written once
/// for all three kinds.
pub trait Entity: Message + Default + Clone + PartialEq + 'static {
    const KIND: EntityKind;
    const BUCKET: Bucket;
    /// Order in which `select_list` returns matches
    const LIST_ORDER: ScanOrder;

    /// Lookup filter accepted by `get_by_param` and `select_list`
    type Params: fmt::Debug + Default + Send + Sync;

    fn id(&self) -> u64;
    fn name(&self) -> &str;
    fn data_version(&self) -> i32;
    fn set_data_version(&mut self, version: i32);

    /// Apply a lookup filter
    ///
    /// `exact_name` selects equality on the name filter instead of a
    /// substring match.
    fn matches(&self, params: &Self::Params, exact_name: bool) -> bool;

    fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self::decode(data)?)
    }

    fn manifest_entry(&self) -> MetadataVersion {
        MetadataVersion::new(self.id(), self.data_version())
    }
}

fn name_matches(name: &str, filter: &Option<String>, exact: bool) -> bool {
    match filter.as_deref() {
        None | Some("") => true,
        Some(wanted) if exact => name == wanted,
        Some(wanted) => name.contains(wanted),
    }
}

fn contains_filter(value: &str, filter: &Option<String>) -> bool {
    match filter.as_deref() {
        None | Some("") => true,
        Some(wanted) => value.contains(wanted),
    }
}

// ============================================================================
// Source
// ============================================================================

/// A MySQL (or MariaDB) server whose binlog is tailed
#[derive(Clone, PartialEq, Message)]
pub struct SourceInfo {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub host: String,
    #[prost(uint32, tag = "4")]
    pub port: u32,
    #[prost(string, tag = "5")]
    pub username: String,
    #[prost(string, tag = "6")]
    pub password: String,
    #[prost(string, tag = "7")]
    pub charset: String,
    /// `mysql` or `mariadb`
    #[prost(string, tag = "8")]
    pub flavor: String,
    /// Replica server id used when registering with the source
    #[prost(uint32, tag = "9")]
    pub slave_id: u32,
    #[prost(int32, tag = "10")]
    pub data_version: i32,
}

/// Source lookup filter
#[derive(Debug, Clone, Default)]
pub struct SourceParams {
    pub name: Option<String>,
    /// Substring of the source host
    pub host: Option<String>,
}

impl Entity for SourceInfo {
    const KIND: EntityKind = EntityKind::Source;
    const BUCKET: Bucket = Bucket::Source;
    const LIST_ORDER: ScanOrder = ScanOrder::Descending;

    type Params = SourceParams;

    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn data_version(&self) -> i32 {
        self.data_version
    }

    fn set_data_version(&mut self, version: i32) {
        self.data_version = version;
    }

    fn matches(&self, params: &SourceParams, exact_name: bool) -> bool {
        name_matches(&self.name, &params.name, exact_name) && contains_filter(&self.host, &params.host)
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// Sink technologies an endpoint can point at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum EndpointType {
    Unspecified = 0,
    Redis = 1,
    Mongo = 2,
    Elasticsearch = 3,
    RocketMq = 4,
    Kafka = 5,
    RabbitMq = 6,
    Http = 7,
}

/// A sink: message queue, cache or search index
#[derive(Clone, PartialEq, Message)]
pub struct EndpointInfo {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(enumeration = "EndpointType", tag = "3")]
    pub endpoint_type: i32,
    /// Comma-separated `host:port` list
    #[prost(string, tag = "4")]
    pub addresses: String,
    #[prost(string, tag = "5")]
    pub username: String,
    #[prost(string, tag = "6")]
    pub password: String,
    #[prost(int32, tag = "7")]
    pub data_version: i32,
    /// Adapter-specific settings
    #[prost(map = "string, string", tag = "8")]
    pub options: HashMap<String, String>,
}

/// Endpoint lookup filter
#[derive(Debug, Clone, Default)]
pub struct EndpointParams {
    pub name: Option<String>,
    /// Substring of the address list
    pub host: Option<String>,
    pub endpoint_type: Option<EndpointType>,
}

impl Entity for EndpointInfo {
    const KIND: EntityKind = EntityKind::Endpoint;
    const BUCKET: Bucket = Bucket::Endpoint;
    const LIST_ORDER: ScanOrder = ScanOrder::Descending;

    type Params = EndpointParams;

    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn data_version(&self) -> i32 {
        self.data_version
    }

    fn set_data_version(&mut self, version: i32) {
        self.data_version = version;
    }

    fn matches(&self, params: &EndpointParams, exact_name: bool) -> bool {
        name_matches(&self.name, &params.name, exact_name)
            && contains_filter(&self.addresses, &params.host)
            && params
                .endpoint_type
                .is_none_or(|t| self.endpoint_type() == t)
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Whether a pipeline may be started
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PipelineStatus {
    Enabled = 0,
    Disabled = 1,
}

/// Links one source to one endpoint through a rule set
#[derive(Clone, PartialEq, Message)]
pub struct PipelineInfo {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(uint64, tag = "3")]
    pub source_id: u64,
    #[prost(uint64, tag = "4")]
    pub endpoint_id: u64,
    #[prost(enumeration = "EndpointType", tag = "5")]
    pub endpoint_type: i32,
    #[prost(enumeration = "PipelineStatus", tag = "6")]
    pub status: i32,
    #[prost(int32, tag = "7")]
    pub data_version: i32,
    /// Rows per sink batch; zero means the runner default
    #[prost(uint32, tag = "8")]
    pub batch_size: u32,
    /// Opaque rule definition consumed by the transform engine
    #[prost(string, tag = "9")]
    pub rules: String,
}

/// Pipeline lookup filter
#[derive(Debug, Clone, Default)]
pub struct PipelineParams {
    pub name: Option<String>,
    pub source_id: Option<u64>,
    pub endpoint_id: Option<u64>,
    pub endpoint_type: Option<EndpointType>,
    /// Exclude disabled pipelines
    pub enable: bool,
}

impl PipelineInfo {
    pub fn is_enabled(&self) -> bool {
        self.status() == PipelineStatus::Enabled
    }
}

impl Entity for PipelineInfo {
    const KIND: EntityKind = EntityKind::Pipeline;
    const BUCKET: Bucket = Bucket::Pipeline;
    const LIST_ORDER: ScanOrder = ScanOrder::Ascending;

    type Params = PipelineParams;

    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn data_version(&self) -> i32 {
        self.data_version
    }

    fn set_data_version(&mut self, version: i32) {
        self.data_version = version;
    }

    fn matches(&self, params: &PipelineParams, exact_name: bool) -> bool {
        name_matches(&self.name, &params.name, exact_name)
            && params.source_id.is_none_or(|id| self.source_id == id)
            && params.endpoint_id.is_none_or(|id| self.endpoint_id == id)
            && params
                .endpoint_type
                .is_none_or(|t| self.endpoint_type() == t)
            && (!params.enable || self.is_enabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(id: u64, name: &str) -> PipelineInfo {
        PipelineInfo {
            id,
            name: name.to_string(),
            source_id: 10,
            endpoint_id: 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_pipeline_filters() {
        let mut p = pipeline(1, "orders-to-kafka");
        p.set_endpoint_type(EndpointType::Kafka);

        let by_name = PipelineParams {
            name: Some("orders".into()),
            ..Default::default()
        };
        assert!(p.matches(&by_name, false));
        assert!(!p.matches(&by_name, true));

        let by_source = PipelineParams {
            source_id: Some(11),
            ..Default::default()
        };
        assert!(!p.matches(&by_source, false));

        let by_type = PipelineParams {
            endpoint_type: Some(EndpointType::Kafka),
            ..Default::default()
        };
        assert!(p.matches(&by_type, false));

        p.set_status(PipelineStatus::Disabled);
        let enabled_only = PipelineParams {
            enable: true,
            ..Default::default()
        };
        assert!(!p.matches(&enabled_only, false));
        assert!(p.matches(&PipelineParams::default(), false));
    }

    #[test]
    fn test_endpoint_host_filter() {
        let endpoint = EndpointInfo {
            id: 20,
            name: "cache".into(),
            addresses: "10.0.0.1:6379,10.0.0.2:6379".into(),
            ..Default::default()
        };
        let params = EndpointParams {
            host: Some("10.0.0.2".into()),
            ..Default::default()
        };
        assert!(endpoint.matches(&params, false));

        let params = EndpointParams {
            host: Some("10.0.0.3".into()),
            ..Default::default()
        };
        assert!(!endpoint.matches(&params, false));
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        // A newer writer adds tag 15; older readers must still decode the body
        let mut bytes = pipeline(2, "p2").to_bytes();
        prost::encoding::string::encode(15, &"future".to_string(), &mut bytes);

        let decoded = PipelineInfo::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.id, 2);
        assert_eq!(decoded.name, "p2");
    }

    #[test]
    fn test_kind_codes() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(EntityKind::from_code(0), None);
    }
}
