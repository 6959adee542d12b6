//! Storage trait definitions
//!
//! Every read and write happens inside a transaction obtained from
//! [`FleetStore::begin`]. Entity versions come from one store-wide,
//! strictly increasing sequence, so "rows changed since version N" is a
//! meaningful query across all rows of a table.

use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_types::{
    CatalogKind, CatalogType, CatalogTypeId, ClusterId, ClusterPhase, Connector,
    ConnectorCluster, ConnectorDeployment, ConnectorDesiredState, ConnectorId,
    ConnectorNamespace, ConnectorPhase, ConnectorStatus, DeploymentId, DeploymentStatus,
    NamespaceId, NamespacePhase, Processor, ProcessorDeployment, ProcessorDesiredState,
    ProcessorId, ProcessorPhase, ProcessorStatus, ShardMetadata, ShardMetadataPayload,
};

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Connector rows selected by a reconcile phase
#[derive(Debug, Clone, Default)]
pub struct ConnectorFilter {
    pub desired_state: Option<ConnectorDesiredState>,
    /// Any of these phases; empty matches every phase
    pub phases: Vec<ConnectorPhase>,
    pub excluded_phases: Vec<ConnectorPhase>,
    /// Only rows with `version > version_above`
    pub version_above: Option<i64>,
    /// Any of these namespaces; empty matches every namespace
    pub namespace_ids: Vec<NamespaceId>,
    pub connector_type_id: Option<CatalogTypeId>,
}

impl ConnectorFilter {
    pub fn matches(&self, connector: &Connector) -> bool {
        self.desired_state.map_or(true, |d| connector.desired_state == d)
            && (self.phases.is_empty() || self.phases.contains(&connector.status.phase))
            && !self.excluded_phases.contains(&connector.status.phase)
            && self.version_above.map_or(true, |v| connector.version > v)
            && (self.namespace_ids.is_empty()
                || connector
                    .namespace_id
                    .as_ref()
                    .is_some_and(|ns| self.namespace_ids.contains(ns)))
            && self
                .connector_type_id
                .as_ref()
                .map_or(true, |t| &connector.connector_type_id == t)
    }
}

/// Processor rows selected by a reconcile phase
#[derive(Debug, Clone, Default)]
pub struct ProcessorFilter {
    pub desired_state: Option<ProcessorDesiredState>,
    pub phases: Vec<ProcessorPhase>,
    pub excluded_phases: Vec<ProcessorPhase>,
    pub version_above: Option<i64>,
    pub namespace_ids: Vec<NamespaceId>,
    pub processor_type_id: Option<CatalogTypeId>,
}

impl ProcessorFilter {
    pub fn matches(&self, processor: &Processor) -> bool {
        self.desired_state.map_or(true, |d| processor.desired_state == d)
            && (self.phases.is_empty() || self.phases.contains(&processor.status.phase))
            && !self.excluded_phases.contains(&processor.status.phase)
            && self.version_above.map_or(true, |v| processor.version > v)
            && (self.namespace_ids.is_empty() || self.namespace_ids.contains(&processor.namespace_id))
            && self
                .processor_type_id
                .as_ref()
                .map_or(true, |t| &processor.processor_type_id == t)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterFilter {
    pub phases: Vec<ClusterPhase>,
    pub organisation_ids: Vec<String>,
}

impl ClusterFilter {
    pub fn matches(&self, cluster: &ConnectorCluster) -> bool {
        (self.phases.is_empty() || self.phases.contains(&cluster.phase))
            && (self.organisation_ids.is_empty()
                || self.organisation_ids.contains(&cluster.organisation_id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    pub ids: Vec<NamespaceId>,
    pub cluster_ids: Vec<ClusterId>,
    pub phases: Vec<NamespacePhase>,
    pub excluded_phases: Vec<NamespacePhase>,
    /// Only namespaces whose expiration is before this instant
    pub expired_before: Option<DateTime<Utc>>,
}

impl NamespaceFilter {
    pub fn matches(&self, namespace: &ConnectorNamespace) -> bool {
        (self.ids.is_empty() || self.ids.contains(&namespace.id))
            && (self.cluster_ids.is_empty() || self.cluster_ids.contains(&namespace.cluster_id))
            && (self.phases.is_empty() || self.phases.contains(&namespace.phase))
            && !self.excluded_phases.contains(&namespace.phase)
            && self
                .expired_before
                .map_or(true, |now| namespace.is_expired(now))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    pub cluster_id: Option<ClusterId>,
    pub namespace_ids: Vec<NamespaceId>,
}

impl DeploymentFilter {
    pub fn matches_connector(&self, deployment: &ConnectorDeployment) -> bool {
        self.cluster_id.as_ref().map_or(true, |c| &deployment.cluster_id == c)
            && (self.namespace_ids.is_empty()
                || deployment
                    .namespace_id
                    .as_ref()
                    .is_some_and(|ns| self.namespace_ids.contains(ns)))
    }

    pub fn matches_processor(&self, deployment: &ProcessorDeployment) -> bool {
        self.cluster_id.as_ref().map_or(true, |c| &deployment.cluster_id == c)
            && (self.namespace_ids.is_empty() || self.namespace_ids.contains(&deployment.namespace_id))
    }
}

/// A store that hands out transactions
#[async_trait]
pub trait FleetStore: Send + Sync + 'static {
    type Tx: FleetTx;

    /// Begin a transaction
    async fn begin(&self) -> StorageResult<Self::Tx>;
}

/// A transaction over all repositories
#[async_trait]
pub trait FleetTx:
    ConnectorRepository
    + ProcessorRepository
    + ClusterRepository
    + NamespaceRepository
    + DeploymentRepository
    + CatalogRepository
    + Send
    + 'static
{
    async fn commit(self) -> StorageResult<()>;

    async fn rollback(self) -> StorageResult<()>;
}

/// Storage for connectors and their status sub-record
#[async_trait]
pub trait ConnectorRepository: Send {
    async fn get_connector(&mut self, id: &ConnectorId) -> StorageResult<Option<Connector>>;

    /// Matching connectors ordered by ascending version
    async fn list_connectors(&mut self, filter: &ConnectorFilter) -> StorageResult<Vec<Connector>>;

    /// Insert a new connector, assigning its version
    async fn insert_connector(&mut self, connector: Connector) -> StorageResult<Connector>;

    /// Version-checked update. Fails with `Conflict` when the stored version
    /// is newer than `connector.version`. Returns the row with its new version.
    async fn update_connector(&mut self, connector: Connector) -> StorageResult<Connector>;

    /// Replace the status sub-record without bumping the version
    async fn save_connector_status(
        &mut self,
        id: &ConnectorId,
        status: &ConnectorStatus,
    ) -> StorageResult<()>;

    async fn delete_connector(&mut self, id: &ConnectorId) -> StorageResult<bool>;
}

/// Storage for processors and their status sub-record
#[async_trait]
pub trait ProcessorRepository: Send {
    async fn get_processor(&mut self, id: &ProcessorId) -> StorageResult<Option<Processor>>;

    /// Matching processors ordered by ascending version
    async fn list_processors(&mut self, filter: &ProcessorFilter) -> StorageResult<Vec<Processor>>;

    async fn insert_processor(&mut self, processor: Processor) -> StorageResult<Processor>;

    async fn update_processor(&mut self, processor: Processor) -> StorageResult<Processor>;

    async fn save_processor_status(
        &mut self,
        id: &ProcessorId,
        status: &ProcessorStatus,
    ) -> StorageResult<()>;

    async fn delete_processor(&mut self, id: &ProcessorId) -> StorageResult<bool>;
}

#[async_trait]
pub trait ClusterRepository: Send {
    async fn get_cluster(&mut self, id: &ClusterId) -> StorageResult<Option<ConnectorCluster>>;

    /// Matching clusters, most recently updated first
    async fn list_clusters(&mut self, filter: &ClusterFilter) -> StorageResult<Vec<ConnectorCluster>>;

    async fn insert_cluster(&mut self, cluster: ConnectorCluster) -> StorageResult<ConnectorCluster>;

    async fn update_cluster(&mut self, cluster: ConnectorCluster) -> StorageResult<ConnectorCluster>;

    async fn delete_cluster(&mut self, id: &ClusterId) -> StorageResult<bool>;
}

#[async_trait]
pub trait NamespaceRepository: Send {
    async fn get_namespace(&mut self, id: &NamespaceId) -> StorageResult<Option<ConnectorNamespace>>;

    /// Matching namespaces ordered by ascending version
    async fn list_namespaces(
        &mut self,
        filter: &NamespaceFilter,
    ) -> StorageResult<Vec<ConnectorNamespace>>;

    async fn insert_namespace(
        &mut self,
        namespace: ConnectorNamespace,
    ) -> StorageResult<ConnectorNamespace>;

    async fn update_namespace(
        &mut self,
        namespace: ConnectorNamespace,
    ) -> StorageResult<ConnectorNamespace>;

    async fn delete_namespace(&mut self, id: &NamespaceId) -> StorageResult<bool>;
}

/// Storage for connector and processor deployments
#[async_trait]
pub trait DeploymentRepository: Send {
    async fn get_connector_deployment(
        &mut self,
        id: &DeploymentId,
    ) -> StorageResult<Option<ConnectorDeployment>>;

    async fn get_connector_deployment_by_connector(
        &mut self,
        connector_id: &ConnectorId,
    ) -> StorageResult<Option<ConnectorDeployment>>;

    async fn list_connector_deployments(
        &mut self,
        filter: &DeploymentFilter,
    ) -> StorageResult<Vec<ConnectorDeployment>>;

    /// Insert a deployment. Fails with `Conflict` if the connector already has one.
    async fn insert_connector_deployment(
        &mut self,
        deployment: ConnectorDeployment,
    ) -> StorageResult<ConnectorDeployment>;

    async fn update_connector_deployment(
        &mut self,
        deployment: ConnectorDeployment,
    ) -> StorageResult<ConnectorDeployment>;

    /// Save an agent-reported status. Fails with `Conflict` when the stored
    /// status version is newer than `status.version`.
    async fn save_connector_deployment_status(
        &mut self,
        id: &DeploymentId,
        status: &DeploymentStatus<ConnectorPhase>,
    ) -> StorageResult<()>;

    async fn delete_connector_deployment(&mut self, id: &DeploymentId) -> StorageResult<bool>;

    async fn get_processor_deployment(
        &mut self,
        id: &DeploymentId,
    ) -> StorageResult<Option<ProcessorDeployment>>;

    async fn get_processor_deployment_by_processor(
        &mut self,
        processor_id: &ProcessorId,
    ) -> StorageResult<Option<ProcessorDeployment>>;

    async fn list_processor_deployments(
        &mut self,
        filter: &DeploymentFilter,
    ) -> StorageResult<Vec<ProcessorDeployment>>;

    async fn insert_processor_deployment(
        &mut self,
        deployment: ProcessorDeployment,
    ) -> StorageResult<ProcessorDeployment>;

    async fn update_processor_deployment(
        &mut self,
        deployment: ProcessorDeployment,
    ) -> StorageResult<ProcessorDeployment>;

    async fn save_processor_deployment_status(
        &mut self,
        id: &DeploymentId,
        status: &DeploymentStatus<ProcessorPhase>,
    ) -> StorageResult<()>;

    async fn delete_processor_deployment(&mut self, id: &DeploymentId) -> StorageResult<bool>;
}

/// Storage for catalog types and shard metadata
#[async_trait]
pub trait CatalogRepository: Send {
    async fn get_catalog_type(
        &mut self,
        kind: CatalogKind,
        id: &CatalogTypeId,
    ) -> StorageResult<Option<CatalogType>>;

    async fn list_catalog_types(&mut self, kind: CatalogKind) -> StorageResult<Vec<CatalogType>>;

    async fn upsert_catalog_type(&mut self, catalog_type: CatalogType) -> StorageResult<()>;

    /// Delete a type together with its shard metadata
    async fn delete_catalog_type(
        &mut self,
        kind: CatalogKind,
        id: &CatalogTypeId,
    ) -> StorageResult<bool>;

    /// Find the row with this exact payload or insert it, then point
    /// `latest_id` of every sibling row at the highest revision.
    async fn put_shard_metadata(
        &mut self,
        kind: CatalogKind,
        type_id: &CatalogTypeId,
        channel: &str,
        revision: i64,
        payload: ShardMetadataPayload,
    ) -> StorageResult<ShardMetadata>;

    /// The highest-revision row for (type, channel)
    async fn latest_shard_metadata(
        &mut self,
        kind: CatalogKind,
        type_id: &CatalogTypeId,
        channel: &str,
    ) -> StorageResult<Option<ShardMetadata>>;

    async fn get_shard_metadata(&mut self, id: i64) -> StorageResult<Option<ShardMetadata>>;
}
