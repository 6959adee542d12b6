//! Connectors and their deployments

use crate::ids::{CatalogTypeId, ClusterId, ConnectorId, DeploymentId, NamespaceId};
use crate::phase::{ConnectorDesiredState, ConnectorPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A status condition reported by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Observed status of a connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorStatus {
    pub phase: ConnectorPhase,
    #[serde(default)]
    pub cluster_id: Option<ClusterId>,
    #[serde(default)]
    pub namespace_id: Option<NamespaceId>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConnectorStatus {
    pub fn assigning() -> Self {
        Self {
            phase: ConnectorPhase::Assigning,
            cluster_id: None,
            namespace_id: None,
            conditions: Vec::new(),
        }
    }
}

/// A connector workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    pub id: ConnectorId,
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub organisation_id: String,
    pub connector_type_id: CatalogTypeId,
    pub channel: String,
    /// Namespace requested by the user; `None` until placed
    #[serde(default)]
    pub namespace_id: Option<NamespaceId>,
    /// Cluster requested by the user
    #[serde(default)]
    pub addon_cluster_id: Option<ClusterId>,
    pub desired_state: ConnectorDesiredState,
    /// Bumped on every mutation
    pub version: i64,
    #[serde(default)]
    pub connector_spec: serde_json::Value,
    /// Vault keys referenced by `connector_spec`
    #[serde(default)]
    pub secret_refs: Vec<String>,
    pub status: ConnectorStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connector {
    pub fn new(
        id: ConnectorId,
        name: impl Into<String>,
        owner: impl Into<String>,
        connector_type_id: CatalogTypeId,
        channel: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            owner: owner.into(),
            organisation_id: String::new(),
            connector_type_id,
            channel: channel.into(),
            namespace_id: None,
            addon_cluster_id: None,
            desired_state: ConnectorDesiredState::Ready,
            version: 1,
            connector_spec: serde_json::Value::Null,
            secret_refs: Vec::new(),
            status: ConnectorStatus::assigning(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Deployment status reported by the agent. Versioned separately from the
/// deployment itself so stale agent reports can be rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus<P> {
    pub phase: P,
    pub version: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub operator_id: Option<String>,
}

impl<P> DeploymentStatus<P> {
    pub fn new(phase: P) -> Self {
        Self {
            phase,
            version: 0,
            conditions: Vec::new(),
            operator_id: None,
        }
    }
}

/// The instruction an agent reads to run a connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorDeployment {
    pub id: DeploymentId,
    pub connector_id: ConnectorId,
    pub cluster_id: ClusterId,
    #[serde(default)]
    pub namespace_id: Option<NamespaceId>,
    /// Connector version the agent should be running
    pub connector_version: i64,
    pub shard_metadata_id: i64,
    /// Bumped on every change to the deployment row
    pub version: i64,
    pub status: DeploymentStatus<ConnectorPhase>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
