//! In-memory storage implementation
//!
//! Transactions are serialized on one async mutex. Each transaction works
//! on a copy of the state that replaces the shared state on commit and is
//! discarded on rollback or drop.

use super::traits::*;
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::Utc;
use fleet_types::{
    CatalogKind, CatalogType, CatalogTypeId, ClusterId, Connector, ConnectorCluster,
    ConnectorDeployment, ConnectorId, ConnectorNamespace, ConnectorPhase, ConnectorStatus,
    DeploymentId, DeploymentStatus, NamespaceId, Processor, ProcessorDeployment, ProcessorId,
    ProcessorPhase, ProcessorStatus, ShardMetadata, ShardMetadataPayload,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct State {
    last_version: i64,
    last_shard_metadata_id: i64,
    connectors: HashMap<ConnectorId, Connector>,
    processors: HashMap<ProcessorId, Processor>,
    clusters: HashMap<ClusterId, ConnectorCluster>,
    namespaces: HashMap<NamespaceId, ConnectorNamespace>,
    connector_deployments: HashMap<DeploymentId, ConnectorDeployment>,
    processor_deployments: HashMap<DeploymentId, ProcessorDeployment>,
    catalog_types: HashMap<(CatalogKind, CatalogTypeId), CatalogType>,
    shard_metadata: BTreeMap<i64, ShardMetadata>,
}

impl State {
    fn next_version(&mut self) -> i64 {
        self.last_version += 1;
        self.last_version
    }
}

fn check_version(entity: &str, id: &impl std::fmt::Display, stored: i64, given: i64) -> StorageResult<()> {
    if stored > given {
        return Err(StorageError::Conflict(format!(
            "{entity} {id} has version {stored}, update was based on version {given}"
        )));
    }
    Ok(())
}

fn sorted_by_version<T>(mut rows: Vec<T>, version: impl Fn(&T) -> i64) -> Vec<T> {
    rows.sort_by_key(|row| version(row));
    rows
}

/// In-memory storage for development and testing
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FleetStore for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> StorageResult<InMemoryTx> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTx { guard, working })
    }
}

/// Transaction over [`InMemoryStore`]
pub struct InMemoryTx {
    guard: OwnedMutexGuard<State>,
    working: State,
}

#[async_trait]
impl FleetTx for InMemoryTx {
    async fn commit(mut self) -> StorageResult<()> {
        *self.guard = std::mem::take(&mut self.working);
        Ok(())
    }

    async fn rollback(self) -> StorageResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ConnectorRepository for InMemoryTx {
    async fn get_connector(&mut self, id: &ConnectorId) -> StorageResult<Option<Connector>> {
        Ok(self.working.connectors.get(id).cloned())
    }

    async fn list_connectors(&mut self, filter: &ConnectorFilter) -> StorageResult<Vec<Connector>> {
        let rows = self
            .working
            .connectors
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        Ok(sorted_by_version(rows, |c: &Connector| c.version))
    }

    async fn insert_connector(&mut self, mut connector: Connector) -> StorageResult<Connector> {
        if self.working.connectors.contains_key(&connector.id) {
            return Err(StorageError::Conflict(format!(
                "connector {} already exists",
                connector.id
            )));
        }
        connector.version = self.working.next_version();
        self.working
            .connectors
            .insert(connector.id.clone(), connector.clone());
        Ok(connector)
    }

    async fn update_connector(&mut self, mut connector: Connector) -> StorageResult<Connector> {
        let stored = self
            .working
            .connectors
            .get(&connector.id)
            .ok_or_else(|| StorageError::NotFound(format!("connector {}", connector.id)))?;
        check_version("connector", &connector.id, stored.version, connector.version)?;

        connector.version = self.working.next_version();
        connector.updated_at = Utc::now();
        self.working
            .connectors
            .insert(connector.id.clone(), connector.clone());
        Ok(connector)
    }

    async fn save_connector_status(
        &mut self,
        id: &ConnectorId,
        status: &ConnectorStatus,
    ) -> StorageResult<()> {
        let connector = self
            .working
            .connectors
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("connector {id}")))?;
        connector.status = status.clone();
        Ok(())
    }

    async fn delete_connector(&mut self, id: &ConnectorId) -> StorageResult<bool> {
        Ok(self.working.connectors.remove(id).is_some())
    }
}

#[async_trait]
impl ProcessorRepository for InMemoryTx {
    async fn get_processor(&mut self, id: &ProcessorId) -> StorageResult<Option<Processor>> {
        Ok(self.working.processors.get(id).cloned())
    }

    async fn list_processors(&mut self, filter: &ProcessorFilter) -> StorageResult<Vec<Processor>> {
        let rows = self
            .working
            .processors
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        Ok(sorted_by_version(rows, |p: &Processor| p.version))
    }

    async fn insert_processor(&mut self, mut processor: Processor) -> StorageResult<Processor> {
        if self.working.processors.contains_key(&processor.id) {
            return Err(StorageError::Conflict(format!(
                "processor {} already exists",
                processor.id
            )));
        }
        processor.version = self.working.next_version();
        self.working
            .processors
            .insert(processor.id.clone(), processor.clone());
        Ok(processor)
    }

    async fn update_processor(&mut self, mut processor: Processor) -> StorageResult<Processor> {
        let stored = self
            .working
            .processors
            .get(&processor.id)
            .ok_or_else(|| StorageError::NotFound(format!("processor {}", processor.id)))?;
        check_version("processor", &processor.id, stored.version, processor.version)?;

        processor.version = self.working.next_version();
        processor.updated_at = Utc::now();
        self.working
            .processors
            .insert(processor.id.clone(), processor.clone());
        Ok(processor)
    }

    async fn save_processor_status(
        &mut self,
        id: &ProcessorId,
        status: &ProcessorStatus,
    ) -> StorageResult<()> {
        let processor = self
            .working
            .processors
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("processor {id}")))?;
        processor.status = status.clone();
        Ok(())
    }

    async fn delete_processor(&mut self, id: &ProcessorId) -> StorageResult<bool> {
        Ok(self.working.processors.remove(id).is_some())
    }
}

#[async_trait]
impl ClusterRepository for InMemoryTx {
    async fn get_cluster(&mut self, id: &ClusterId) -> StorageResult<Option<ConnectorCluster>> {
        Ok(self.working.clusters.get(id).cloned())
    }

    async fn list_clusters(&mut self, filter: &ClusterFilter) -> StorageResult<Vec<ConnectorCluster>> {
        let mut rows: Vec<_> = self
            .working
            .clusters
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.version.cmp(&a.version)));
        Ok(rows)
    }

    async fn insert_cluster(&mut self, mut cluster: ConnectorCluster) -> StorageResult<ConnectorCluster> {
        if self.working.clusters.contains_key(&cluster.id) {
            return Err(StorageError::Conflict(format!(
                "cluster {} already exists",
                cluster.id
            )));
        }
        cluster.version = self.working.next_version();
        self.working.clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(cluster)
    }

    async fn update_cluster(&mut self, mut cluster: ConnectorCluster) -> StorageResult<ConnectorCluster> {
        let stored = self
            .working
            .clusters
            .get(&cluster.id)
            .ok_or_else(|| StorageError::NotFound(format!("cluster {}", cluster.id)))?;
        check_version("cluster", &cluster.id, stored.version, cluster.version)?;

        cluster.version = self.working.next_version();
        cluster.updated_at = Utc::now();
        self.working.clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(cluster)
    }

    async fn delete_cluster(&mut self, id: &ClusterId) -> StorageResult<bool> {
        Ok(self.working.clusters.remove(id).is_some())
    }
}

#[async_trait]
impl NamespaceRepository for InMemoryTx {
    async fn get_namespace(&mut self, id: &NamespaceId) -> StorageResult<Option<ConnectorNamespace>> {
        Ok(self.working.namespaces.get(id).cloned())
    }

    async fn list_namespaces(
        &mut self,
        filter: &NamespaceFilter,
    ) -> StorageResult<Vec<ConnectorNamespace>> {
        let rows = self
            .working
            .namespaces
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        Ok(sorted_by_version(rows, |n: &ConnectorNamespace| n.version))
    }

    async fn insert_namespace(
        &mut self,
        mut namespace: ConnectorNamespace,
    ) -> StorageResult<ConnectorNamespace> {
        if self.working.namespaces.contains_key(&namespace.id) {
            return Err(StorageError::Conflict(format!(
                "namespace {} already exists",
                namespace.id
            )));
        }
        namespace.version = self.working.next_version();
        self.working
            .namespaces
            .insert(namespace.id.clone(), namespace.clone());
        Ok(namespace)
    }

    async fn update_namespace(
        &mut self,
        mut namespace: ConnectorNamespace,
    ) -> StorageResult<ConnectorNamespace> {
        let stored = self
            .working
            .namespaces
            .get(&namespace.id)
            .ok_or_else(|| StorageError::NotFound(format!("namespace {}", namespace.id)))?;
        check_version("namespace", &namespace.id, stored.version, namespace.version)?;

        namespace.version = self.working.next_version();
        namespace.updated_at = Utc::now();
        self.working
            .namespaces
            .insert(namespace.id.clone(), namespace.clone());
        Ok(namespace)
    }

    async fn delete_namespace(&mut self, id: &NamespaceId) -> StorageResult<bool> {
        Ok(self.working.namespaces.remove(id).is_some())
    }
}

#[async_trait]
impl DeploymentRepository for InMemoryTx {
    async fn get_connector_deployment(
        &mut self,
        id: &DeploymentId,
    ) -> StorageResult<Option<ConnectorDeployment>> {
        Ok(self.working.connector_deployments.get(id).cloned())
    }

    async fn get_connector_deployment_by_connector(
        &mut self,
        connector_id: &ConnectorId,
    ) -> StorageResult<Option<ConnectorDeployment>> {
        Ok(self
            .working
            .connector_deployments
            .values()
            .find(|d| &d.connector_id == connector_id)
            .cloned())
    }

    async fn list_connector_deployments(
        &mut self,
        filter: &DeploymentFilter,
    ) -> StorageResult<Vec<ConnectorDeployment>> {
        let rows = self
            .working
            .connector_deployments
            .values()
            .filter(|d| filter.matches_connector(d))
            .cloned()
            .collect();
        Ok(sorted_by_version(rows, |d: &ConnectorDeployment| d.version))
    }

    async fn insert_connector_deployment(
        &mut self,
        mut deployment: ConnectorDeployment,
    ) -> StorageResult<ConnectorDeployment> {
        let duplicate = self
            .working
            .connector_deployments
            .values()
            .any(|d| d.id == deployment.id || d.connector_id == deployment.connector_id);
        if duplicate {
            return Err(StorageError::Conflict(format!(
                "connector {} already has a deployment",
                deployment.connector_id
            )));
        }
        deployment.version = self.working.next_version();
        self.working
            .connector_deployments
            .insert(deployment.id.clone(), deployment.clone());
        Ok(deployment)
    }

    async fn update_connector_deployment(
        &mut self,
        mut deployment: ConnectorDeployment,
    ) -> StorageResult<ConnectorDeployment> {
        let stored = self
            .working
            .connector_deployments
            .get(&deployment.id)
            .ok_or_else(|| StorageError::NotFound(format!("connector deployment {}", deployment.id)))?;
        check_version("connector deployment", &deployment.id, stored.version, deployment.version)?;

        deployment.version = self.working.next_version();
        deployment.updated_at = Utc::now();
        self.working
            .connector_deployments
            .insert(deployment.id.clone(), deployment.clone());
        Ok(deployment)
    }

    async fn save_connector_deployment_status(
        &mut self,
        id: &DeploymentId,
        status: &DeploymentStatus<ConnectorPhase>,
    ) -> StorageResult<()> {
        let deployment = self
            .working
            .connector_deployments
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("connector deployment {id}")))?;
        check_version(
            "connector deployment status",
            id,
            deployment.status.version,
            status.version,
        )?;
        deployment.status = status.clone();
        Ok(())
    }

    async fn delete_connector_deployment(&mut self, id: &DeploymentId) -> StorageResult<bool> {
        Ok(self.working.connector_deployments.remove(id).is_some())
    }

    async fn get_processor_deployment(
        &mut self,
        id: &DeploymentId,
    ) -> StorageResult<Option<ProcessorDeployment>> {
        Ok(self.working.processor_deployments.get(id).cloned())
    }

    async fn get_processor_deployment_by_processor(
        &mut self,
        processor_id: &ProcessorId,
    ) -> StorageResult<Option<ProcessorDeployment>> {
        Ok(self
            .working
            .processor_deployments
            .values()
            .find(|d| &d.processor_id == processor_id)
            .cloned())
    }

    async fn list_processor_deployments(
        &mut self,
        filter: &DeploymentFilter,
    ) -> StorageResult<Vec<ProcessorDeployment>> {
        let rows = self
            .working
            .processor_deployments
            .values()
            .filter(|d| filter.matches_processor(d))
            .cloned()
            .collect();
        Ok(sorted_by_version(rows, |d: &ProcessorDeployment| d.version))
    }

    async fn insert_processor_deployment(
        &mut self,
        mut deployment: ProcessorDeployment,
    ) -> StorageResult<ProcessorDeployment> {
        let duplicate = self
            .working
            .processor_deployments
            .values()
            .any(|d| d.id == deployment.id || d.processor_id == deployment.processor_id);
        if duplicate {
            return Err(StorageError::Conflict(format!(
                "processor {} already has a deployment",
                deployment.processor_id
            )));
        }
        deployment.version = self.working.next_version();
        self.working
            .processor_deployments
            .insert(deployment.id.clone(), deployment.clone());
        Ok(deployment)
    }

    async fn update_processor_deployment(
        &mut self,
        mut deployment: ProcessorDeployment,
    ) -> StorageResult<ProcessorDeployment> {
        let stored = self
            .working
            .processor_deployments
            .get(&deployment.id)
            .ok_or_else(|| StorageError::NotFound(format!("processor deployment {}", deployment.id)))?;
        check_version("processor deployment", &deployment.id, stored.version, deployment.version)?;

        deployment.version = self.working.next_version();
        deployment.updated_at = Utc::now();
        self.working
            .processor_deployments
            .insert(deployment.id.clone(), deployment.clone());
        Ok(deployment)
    }

    async fn save_processor_deployment_status(
        &mut self,
        id: &DeploymentId,
        status: &DeploymentStatus<ProcessorPhase>,
    ) -> StorageResult<()> {
        let deployment = self
            .working
            .processor_deployments
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("processor deployment {id}")))?;
        check_version(
            "processor deployment status",
            id,
            deployment.status.version,
            status.version,
        )?;
        deployment.status = status.clone();
        Ok(())
    }

    async fn delete_processor_deployment(&mut self, id: &DeploymentId) -> StorageResult<bool> {
        Ok(self.working.processor_deployments.remove(id).is_some())
    }
}

#[async_trait]
impl CatalogRepository for InMemoryTx {
    async fn get_catalog_type(
        &mut self,
        kind: CatalogKind,
        id: &CatalogTypeId,
    ) -> StorageResult<Option<CatalogType>> {
        Ok(self.working.catalog_types.get(&(kind, id.clone())).cloned())
    }

    async fn list_catalog_types(&mut self, kind: CatalogKind) -> StorageResult<Vec<CatalogType>> {
        let mut rows: Vec<_> = self
            .working
            .catalog_types
            .values()
            .filter(|t| t.kind == kind)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    async fn upsert_catalog_type(&mut self, catalog_type: CatalogType) -> StorageResult<()> {
        self.working
            .catalog_types
            .insert((catalog_type.kind, catalog_type.id.clone()), catalog_type);
        Ok(())
    }

    async fn delete_catalog_type(
        &mut self,
        kind: CatalogKind,
        id: &CatalogTypeId,
    ) -> StorageResult<bool> {
        self.working
            .shard_metadata
            .retain(|_, m| !(m.kind == kind && &m.type_id == id));
        Ok(self.working.catalog_types.remove(&(kind, id.clone())).is_some())
    }

    async fn put_shard_metadata(
        &mut self,
        kind: CatalogKind,
        type_id: &CatalogTypeId,
        channel: &str,
        revision: i64,
        payload: ShardMetadataPayload,
    ) -> StorageResult<ShardMetadata> {
        let is_sibling =
            |m: &ShardMetadata| m.kind == kind && &m.type_id == type_id && m.channel == channel;

        let existing = self
            .working
            .shard_metadata
            .values()
            .find(|m| is_sibling(m) && m.payload == payload)
            .map(|m| m.id);

        let id = match existing {
            Some(id) => id,
            None => {
                self.working.last_shard_metadata_id += 1;
                let id = self.working.last_shard_metadata_id;
                self.working.shard_metadata.insert(
                    id,
                    ShardMetadata {
                        id,
                        kind,
                        type_id: type_id.clone(),
                        channel: channel.to_string(),
                        revision,
                        latest_id: None,
                        payload,
                    },
                );
                id
            }
        };

        let latest = self
            .working
            .shard_metadata
            .values()
            .filter(|m| is_sibling(m))
            .max_by_key(|m| (m.revision, m.id))
            .map(|m| m.id);

        for m in self.working.shard_metadata.values_mut().filter(|m| is_sibling(m)) {
            m.latest_id = latest.filter(|latest| *latest != m.id);
        }

        self.working
            .shard_metadata
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("shard metadata {id}")))
    }

    async fn latest_shard_metadata(
        &mut self,
        kind: CatalogKind,
        type_id: &CatalogTypeId,
        channel: &str,
    ) -> StorageResult<Option<ShardMetadata>> {
        Ok(self
            .working
            .shard_metadata
            .values()
            .filter(|m| m.kind == kind && &m.type_id == type_id && m.channel == channel)
            .max_by_key(|m| (m.revision, m.id))
            .cloned())
    }

    async fn get_shard_metadata(&mut self, id: i64) -> StorageResult<Option<ShardMetadata>> {
        Ok(self.working.shard_metadata.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::ConnectorDesiredState;

    fn create_test_connector(id: &str) -> Connector {
        Connector::new(
            ConnectorId::new(id),
            id,
            "alice",
            CatalogTypeId::new("log_sink_0.1"),
            "stable",
        )
    }

    #[tokio::test]
    async fn test_commit_publishes_changes() {
        let store = InMemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_connector(create_test_connector("c1")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_connector(&ConnectorId::new("c1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let store = InMemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_connector(create_test_connector("c1")).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_connector(&ConnectorId::new("c1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_versions_increase_across_rows() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let a = tx.insert_connector(create_test_connector("a")).await.unwrap();
        let b = tx.insert_connector(create_test_connector("b")).await.unwrap();
        let a2 = tx.update_connector(a.clone()).await.unwrap();

        assert!(b.version > a.version);
        assert!(a2.version > b.version);
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let stale = tx.insert_connector(create_test_connector("c1")).await.unwrap();
        let mut fresh = stale.clone();
        fresh.desired_state = ConnectorDesiredState::Stopped;
        tx.update_connector(fresh).await.unwrap();

        let mut write = stale.clone();
        write.desired_state = ConnectorDesiredState::Deleted;
        let err = tx.update_connector(write).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        let stored = tx.get_connector(&stale.id).await.unwrap().unwrap();
        assert_eq!(stored.desired_state, ConnectorDesiredState::Stopped);
    }

    #[tokio::test]
    async fn test_status_save_keeps_version() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let connector = tx.insert_connector(create_test_connector("c1")).await.unwrap();
        let mut status = connector.status.clone();
        status.phase = ConnectorPhase::Assigned;
        tx.save_connector_status(&connector.id, &status).await.unwrap();

        let stored = tx.get_connector(&connector.id).await.unwrap().unwrap();
        assert_eq!(stored.version, connector.version);
        assert_eq!(stored.status.phase, ConnectorPhase::Assigned);
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_version() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let a = tx.insert_connector(create_test_connector("a")).await.unwrap();
        tx.insert_connector(create_test_connector("b")).await.unwrap();
        tx.update_connector(a).await.unwrap();

        let ids: Vec<_> = tx
            .list_connectors(&ConnectorFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_latest_id_points_at_highest_revision() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let type_id = CatalogTypeId::new("log_sink_0.1");

        let payload = |rev: i64| {
            ShardMetadataPayload::from_json(&serde_json::json!({ "connector_revision": rev })).unwrap()
        };

        let first = tx
            .put_shard_metadata(CatalogKind::Connector, &type_id, "stable", 1, payload(1))
            .await
            .unwrap();
        let second = tx
            .put_shard_metadata(CatalogKind::Connector, &type_id, "stable", 2, payload(2))
            .await
            .unwrap();
        let again = tx
            .put_shard_metadata(CatalogKind::Connector, &type_id, "stable", 2, payload(2))
            .await
            .unwrap();

        assert_eq!(second.id, again.id);
        assert_eq!(second.latest_id, None);
        let first = tx.get_shard_metadata(first.id).await.unwrap().unwrap();
        assert_eq!(first.latest_id, Some(second.id));

        let latest = tx
            .latest_shard_metadata(CatalogKind::Connector, &type_id, "stable")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[tokio::test]
    async fn test_one_deployment_per_connector() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let now = Utc::now();

        let deployment = |id: &str| ConnectorDeployment {
            id: DeploymentId::new(id),
            connector_id: ConnectorId::new("c1"),
            cluster_id: ClusterId::new("k1"),
            namespace_id: None,
            connector_version: 1,
            shard_metadata_id: 1,
            version: 0,
            status: DeploymentStatus::new(ConnectorPhase::Assigned),
            created_at: now,
            updated_at: now,
        };

        tx.insert_connector_deployment(deployment("d1")).await.unwrap();
        let err = tx.insert_connector_deployment(deployment("d2")).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }
}
