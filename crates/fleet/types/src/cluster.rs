//! Clusters and namespaces
//!
//! A cluster is a remote execution environment running a fleet agent. It is
//! partitioned into namespaces, and every workload lives in exactly one
//! namespace once placed.

use crate::ids::{ClusterId, NamespaceId};
use crate::phase::{ClusterPhase, NamespacePhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A remote cluster that runs connector and processor deployments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorCluster {
    pub id: ClusterId,
    pub name: String,
    /// User that registered the cluster
    pub owner: String,
    /// Organisation of the owner, empty for personal clusters
    #[serde(default)]
    pub organisation_id: String,
    /// Service account the agent authenticates with
    #[serde(default)]
    pub client_id: Option<String>,
    /// Vault key holding the agent's client secret
    #[serde(default)]
    pub client_secret_ref: Option<String>,
    pub phase: ClusterPhase,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectorCluster {
    pub fn new(
        id: ClusterId,
        name: impl Into<String>,
        owner: impl Into<String>,
        organisation_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            owner: owner.into(),
            organisation_id: organisation_id.into(),
            client_id: None,
            client_secret_ref: None,
            phase: ClusterPhase::Disconnected,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a requester identified by `owner`/`organisation_id` may place
    /// workloads on this cluster. Organisation scope wins over ownership.
    pub fn is_visible_to(&self, owner: &str, organisation_id: &str) -> bool {
        if organisation_id.is_empty() {
            self.owner == owner
        } else {
            self.organisation_id == organisation_id
        }
    }
}

/// Tenant a namespace is dedicated to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum NamespaceTenant {
    User(String),
    Organisation(String),
}

impl NamespaceTenant {
    pub fn matches(&self, owner: &str, organisation_id: &str) -> bool {
        match self {
            NamespaceTenant::Organisation(org) => !organisation_id.is_empty() && org == organisation_id,
            NamespaceTenant::User(user) => organisation_id.is_empty() && user == owner,
        }
    }
}

/// A partition of a cluster that hosts workloads for one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorNamespace {
    pub id: NamespaceId,
    pub name: String,
    pub cluster_id: ClusterId,
    pub owner: String,
    pub tenant: NamespaceTenant,
    /// Evaluation namespaces are reaped once this passes
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
    pub phase: NamespacePhase,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectorNamespace {
    pub fn new(
        id: NamespaceId,
        name: impl Into<String>,
        cluster_id: ClusterId,
        owner: impl Into<String>,
        tenant: NamespaceTenant,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            cluster_id,
            owner: owner.into(),
            tenant,
            expiration: None,
            phase: NamespacePhase::Disconnected,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|expiration| expiration < now)
    }
}
