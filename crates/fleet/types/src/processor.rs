//! Processors and their deployments
//!
//! Processors always belong to a pre-existing namespace, unlike connectors
//! whose cluster is resolved lazily during assignment.

use crate::connector::{Condition, DeploymentStatus};
use crate::ids::{CatalogTypeId, ClusterId, DeploymentId, NamespaceId, ProcessorId};
use crate::phase::{ProcessorDesiredState, ProcessorPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorStatus {
    pub phase: ProcessorPhase,
    #[serde(default)]
    pub namespace_id: Option<NamespaceId>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Processor {
    pub id: ProcessorId,
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub organisation_id: String,
    pub processor_type_id: CatalogTypeId,
    pub channel: String,
    pub namespace_id: NamespaceId,
    pub desired_state: ProcessorDesiredState,
    pub version: i64,
    #[serde(default)]
    pub definition: serde_json::Value,
    #[serde(default)]
    pub secret_refs: Vec<String>,
    pub status: ProcessorStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Processor {
    pub fn new(
        id: ProcessorId,
        name: impl Into<String>,
        owner: impl Into<String>,
        processor_type_id: CatalogTypeId,
        channel: impl Into<String>,
        namespace_id: NamespaceId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            owner: owner.into(),
            organisation_id: String::new(),
            processor_type_id,
            channel: channel.into(),
            namespace_id,
            desired_state: ProcessorDesiredState::Ready,
            version: 1,
            definition: serde_json::Value::Null,
            secret_refs: Vec::new(),
            status: ProcessorStatus {
                phase: ProcessorPhase::Preparing,
                namespace_id: None,
                conditions: Vec::new(),
            },
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorDeployment {
    pub id: DeploymentId,
    pub processor_id: ProcessorId,
    pub cluster_id: ClusterId,
    pub namespace_id: NamespaceId,
    pub processor_version: i64,
    pub shard_metadata_id: i64,
    pub version: i64,
    pub status: DeploymentStatus<ProcessorPhase>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
