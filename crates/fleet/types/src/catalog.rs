//! Connector and processor catalog records

use crate::ids::CatalogTypeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which catalog a type or shard metadata row belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogKind {
    Connector,
    Processor,
}

impl CatalogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogKind::Connector => "connector",
            CatalogKind::Processor => "processor",
        }
    }
}

impl fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connector or processor type persisted from the static catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogType {
    pub id: CatalogTypeId,
    pub kind: CatalogKind,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub channels: Vec<String>,
    /// Checksum of the catalog entry this row was converged from
    #[serde(default)]
    pub checksum: Option<String>,
    /// Removed from the catalog but still used by live workloads
    #[serde(default)]
    pub deprecated: bool,
    pub updated_at: DateTime<Utc>,
}

/// Serialized shard metadata, kept opaque so equality is byte equality
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardMetadataPayload(Vec<u8>);

impl ShardMetadataPayload {
    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(Self)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }
}

/// Shard metadata for one (type, channel) revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub id: i64,
    pub kind: CatalogKind,
    pub type_id: CatalogTypeId,
    pub channel: String,
    pub revision: i64,
    /// Id of the newest row for the same (type, channel); `None` on the newest row
    #[serde(default)]
    pub latest_id: Option<i64>,
    pub payload: ShardMetadataPayload,
}
