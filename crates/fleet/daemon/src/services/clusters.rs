//! Cluster service
//!
//! Besides cluster rows, this service owns connector deployments: they are
//! addressed to a cluster's agent, and every change to one wakes that agent.

use super::connectors::ConnectorsService;
use super::namespaces::ConnectorNamespaceService;
use super::notify_after_commit;
use crate::error::{FleetError, FleetResult};
use crate::placement::select_ready_cluster;
use crate::signalbus::{cluster_deployments_signal, reconcile_signal, worker_type, SignalBus};
use crate::storage::{ClusterFilter, DeploymentFilter, FleetStore, FleetTx, NamespaceFilter};
use crate::transaction::UnitOfWork;
use crate::vault::VaultService;
use fleet_types::{
    ClusterId, ClusterPhase, ConnectorCluster, ConnectorDeployment, ConnectorDesiredState,
    ConnectorId, ConnectorPhase, ConnectorStatus, DeploymentId, DeploymentStatus, NamespacePhase,
};
use std::sync::Arc;

pub struct ConnectorClusterService {
    signals: Arc<dyn SignalBus>,
    vault: Arc<dyn VaultService>,
    connectors: Arc<ConnectorsService>,
    namespaces: Arc<ConnectorNamespaceService>,
}

impl ConnectorClusterService {
    pub fn new(
        signals: Arc<dyn SignalBus>,
        vault: Arc<dyn VaultService>,
        connectors: Arc<ConnectorsService>,
        namespaces: Arc<ConnectorNamespaceService>,
    ) -> Self {
        Self {
            signals,
            vault,
            connectors,
            namespaces,
        }
    }

    pub async fn create<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        cluster: ConnectorCluster,
    ) -> FleetResult<ConnectorCluster> {
        let created = uow.insert_cluster(cluster).await?;
        tracing::debug!(cluster_id = %created.id, "Cluster created");
        Ok(created)
    }

    pub async fn get<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &ClusterId,
    ) -> FleetResult<ConnectorCluster> {
        uow.get_cluster(id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("cluster {id}")))
    }

    /// Matching clusters, most recently updated first
    pub async fn list<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        filter: &ClusterFilter,
    ) -> FleetResult<Vec<ConnectorCluster>> {
        Ok(uow.list_clusters(filter).await?)
    }

    /// Move a cluster to `phase`. Once Deleting, a cluster never leaves it.
    pub async fn update_phase<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &ClusterId,
        phase: ClusterPhase,
    ) -> FleetResult<ConnectorCluster> {
        let mut cluster = self.get(uow, id).await?;
        if cluster.phase == phase {
            return Ok(cluster);
        }
        if !cluster.phase.can_transition_to(phase) {
            return Err(FleetError::Validation(format!(
                "cluster {id} is {} and cannot become {phase}",
                cluster.phase
            )));
        }

        cluster.phase = phase;
        let updated = uow.update_cluster(cluster).await?;
        tracing::info!(cluster_id = %id, phase = %phase, "Cluster phase changed");

        notify_after_commit(
            uow,
            &self.signals,
            reconcile_signal(worker_type::CONNECTOR_CLUSTER),
        );
        if phase == ClusterPhase::Ready {
            // Connectors waiting for capacity may be placeable now
            notify_after_commit(uow, &self.signals, reconcile_signal(worker_type::CONNECTOR));
        }
        Ok(updated)
    }

    /// Request deletion: the cluster goes to Deleting and the cluster
    /// manager takes it from there
    pub async fn delete<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &ClusterId,
    ) -> FleetResult<ConnectorCluster> {
        self.update_phase(uow, id, ClusterPhase::Deleting).await
    }

    /// The most recently updated Ready cluster visible to the requester,
    /// or `None` when there is no capacity yet
    pub async fn find_ready_cluster<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        owner: &str,
        organisation_id: &str,
        cluster_id: Option<&ClusterId>,
    ) -> FleetResult<Option<ConnectorCluster>> {
        let filter = ClusterFilter {
            phases: vec![ClusterPhase::Ready],
            ..Default::default()
        };
        let clusters = uow.list_clusters(&filter).await?;
        Ok(select_ready_cluster(&clusters, owner, organisation_id, cluster_id).cloned())
    }

    /// Insert a deployment and wake its agent after commit
    pub async fn save_deployment<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        deployment: ConnectorDeployment,
    ) -> FleetResult<ConnectorDeployment> {
        let created = uow.insert_connector_deployment(deployment).await?;
        notify_after_commit(
            uow,
            &self.signals,
            cluster_deployments_signal(&created.cluster_id),
        );
        Ok(created)
    }

    pub async fn update_deployment<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        deployment: ConnectorDeployment,
    ) -> FleetResult<ConnectorDeployment> {
        let updated = uow.update_connector_deployment(deployment).await?;
        notify_after_commit(
            uow,
            &self.signals,
            cluster_deployments_signal(&updated.cluster_id),
        );
        Ok(updated)
    }

    pub async fn get_deployment_by_connector_id<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        connector_id: &ConnectorId,
    ) -> FleetResult<ConnectorDeployment> {
        uow.get_connector_deployment_by_connector(connector_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("deployment of connector {connector_id}")))
    }

    /// Ingest a connector deployment status reported by an agent.
    ///
    /// The save is rejected with `Conflict` when the stored status version is
    /// newer. The phase is mirrored onto the connector, except that a
    /// connector being torn down only accepts Deleted. A deleted deployment
    /// is removed; the connector then stops, or is deleted when that was
    /// its desired state.
    pub async fn update_connector_deployment_status<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        deployment_id: &DeploymentId,
        status: DeploymentStatus<ConnectorPhase>,
    ) -> FleetResult<()> {
        let deployment = uow
            .get_connector_deployment(deployment_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("connector deployment {deployment_id}")))?;
        uow.save_connector_deployment_status(deployment_id, &status)
            .await?;

        let mut connector = self.connectors.get(uow, &deployment.connector_id).await?;
        let leaving = matches!(
            connector.status.phase,
            ConnectorPhase::Deleting | ConnectorPhase::Deleted
        );
        // Deletion only moves forward
        if !leaving || status.phase == ConnectorPhase::Deleted {
            connector.status.phase = status.phase;
        }
        connector.status.conditions = status.conditions;

        if status.phase == ConnectorPhase::Deleted {
            uow.delete_connector_deployment(deployment_id).await?;
            match connector.desired_state {
                ConnectorDesiredState::Stopped => connector.status.phase = ConnectorPhase::Stopped,
                ConnectorDesiredState::Deleted => {
                    self.connectors.delete(uow, &connector.id).await?;
                    return Ok(());
                }
                _ => {}
            }
        }

        uow.save_connector_status(&connector.id, &connector.status)
            .await?;
        notify_after_commit(uow, &self.signals, reconcile_signal(worker_type::CONNECTOR));
        Ok(())
    }

    /// Deleting clusters that no longer hold any namespace
    pub async fn empty_deleting_clusters<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
    ) -> FleetResult<Vec<ConnectorCluster>> {
        let deleting = uow
            .list_clusters(&ClusterFilter {
                phases: vec![ClusterPhase::Deleting],
                ..Default::default()
            })
            .await?;

        let mut empty = Vec::new();
        for cluster in deleting {
            if !has_namespaces(uow, &cluster.id, &[]).await? {
                empty.push(cluster);
            }
        }
        Ok(empty)
    }

    /// Remove the agent's service-account secret. A secret that is already
    /// gone counts as removed.
    pub async fn delete_cluster_credentials(&self, cluster: &ConnectorCluster) -> FleetResult<()> {
        let Some(secret_ref) = cluster.client_secret_ref.as_deref() else {
            return Ok(());
        };
        match self.vault.delete_secret_string(secret_ref).await {
            Ok(()) => {
                tracing::info!(cluster_id = %cluster.id, "Cluster credentials deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(FleetError::Vault(format!(
                "failed to delete credentials of cluster {}: {e}",
                cluster.id
            ))),
        }
    }

    /// Delete a cluster still Deleting and empty, with any deployment left
    /// on it. Connectors placed there go back to placement.
    pub async fn delete_empty_cluster<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &ClusterId,
    ) -> FleetResult<bool> {
        let Some(cluster) = uow.get_cluster(id).await? else {
            return Ok(false);
        };
        if cluster.phase != ClusterPhase::Deleting || has_namespaces(uow, id, &[]).await? {
            return Ok(false);
        }

        let deployments = uow
            .list_connector_deployments(&DeploymentFilter {
                cluster_id: Some(id.clone()),
                ..Default::default()
            })
            .await?;
        for deployment in deployments {
            uow.delete_connector_deployment(&deployment.id).await?;
            if let Some(mut connector) = uow.get_connector(&deployment.connector_id).await? {
                connector.status = match connector.desired_state {
                    ConnectorDesiredState::Deleted => ConnectorStatus {
                        phase: ConnectorPhase::Deleted,
                        ..ConnectorStatus::assigning()
                    },
                    _ => ConnectorStatus::assigning(),
                };
                if connector.addon_cluster_id.as_ref() == Some(id) {
                    connector.addon_cluster_id = None;
                }
                uow.update_connector(connector).await?;
            }
        }

        uow.delete_cluster(id).await?;
        tracing::info!(cluster_id = %id, "Cluster deleted");
        notify_after_commit(uow, &self.signals, reconcile_signal(worker_type::CONNECTOR));
        Ok(true)
    }

    /// Delete every empty Deleting cluster. Credentials go first, outside
    /// any transaction, so the agent is cut off before its row disappears.
    /// A failure only skips that cluster until the next tick.
    pub async fn reconcile_empty_deleting_clusters<S: FleetStore>(
        &self,
        store: &S,
    ) -> (usize, Vec<FleetError>) {
        let clusters = match async {
            let mut uow = UnitOfWork::begin(store).await?;
            let result = self.empty_deleting_clusters(&mut uow).await;
            uow.resolve(result).await
        }
        .await
        {
            Ok(clusters) => clusters,
            Err(e) => return (0, vec![e]),
        };

        let mut count = 0;
        let mut errors = Vec::new();
        for cluster in clusters {
            let result = async {
                self.delete_cluster_credentials(&cluster).await?;
                let mut uow = UnitOfWork::begin(store).await?;
                let result = self.delete_empty_cluster(&mut uow, &cluster.id).await;
                uow.resolve(result).await
            }
            .await;

            match result {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(cluster_id = %cluster.id, error = %e, "Failed to delete cluster");
                    errors.push(e);
                }
            }
        }
        (count, errors)
    }

    /// Start deleting the namespaces of Deleting clusters, skipping those
    /// already on their way out
    pub async fn reconcile_unused_deleting_clusters<S: FleetStore>(
        &self,
        store: &S,
    ) -> (usize, Vec<FleetError>) {
        let filter = ClusterFilter {
            phases: vec![ClusterPhase::Deleting],
            ..Default::default()
        };
        let clusters = match async {
            let mut uow = UnitOfWork::begin(store).await?;
            let result = self.list(&mut uow, &filter).await;
            uow.resolve(result).await
        }
        .await
        {
            Ok(clusters) => clusters,
            Err(e) => return (0, vec![e]),
        };

        let mut count = 0;
        let mut errors = Vec::new();
        for cluster in clusters {
            let filter = NamespaceFilter {
                cluster_ids: vec![cluster.id.clone()],
                excluded_phases: vec![NamespacePhase::Deleting, NamespacePhase::Deleted],
                ..Default::default()
            };
            let result = async {
                let mut uow = UnitOfWork::begin(store).await?;
                let result = self
                    .namespaces
                    .delete_namespace_and_connector_deployments(&mut uow, &filter)
                    .await;
                uow.resolve(result).await
            }
            .await;

            match result {
                Ok((true, _)) => count += 1,
                Ok((false, _)) => {}
                Err(e) => {
                    tracing::error!(
                        cluster_id = %cluster.id,
                        error = %e,
                        "Failed to delete namespaces of deleting cluster"
                    );
                    errors.push(e);
                }
            }
        }
        (count, errors)
    }
}

async fn has_namespaces<T: FleetTx>(
    uow: &mut UnitOfWork<T>,
    cluster_id: &ClusterId,
    excluded_phases: &[NamespacePhase],
) -> FleetResult<bool> {
    let namespaces = uow
        .list_namespaces(&NamespaceFilter {
            cluster_ids: vec![cluster_id.clone()],
            excluded_phases: excluded_phases.to_vec(),
            ..Default::default()
        })
        .await?;
    Ok(!namespaces.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamespaceConfig;
    use crate::signalbus::InMemorySignalBus;
    use crate::storage::{
        ClusterRepository, ConnectorRepository, DeploymentRepository, InMemoryStore,
        NamespaceRepository,
    };
    use crate::vault::InMemoryVault;
    use chrono::Utc;
    use fleet_types::{CatalogTypeId, Connector, ConnectorNamespace, NamespaceId, NamespaceTenant};

    struct Fixture {
        store: InMemoryStore,
        bus: InMemorySignalBus,
        vault: Arc<InMemoryVault>,
        service: ConnectorClusterService,
    }

    fn create_fixture() -> Fixture {
        let bus = InMemorySignalBus::new();
        let signals: Arc<dyn SignalBus> = Arc::new(bus.clone());
        let vault = Arc::new(InMemoryVault::new());
        let connectors = Arc::new(ConnectorsService::new(signals.clone(), vault.clone()));
        let namespaces = Arc::new(ConnectorNamespaceService::new(
            signals.clone(),
            &NamespaceConfig::default(),
        ));
        let service = ConnectorClusterService::new(signals, vault.clone(), connectors, namespaces);
        Fixture {
            store: InMemoryStore::new(),
            bus,
            vault,
            service,
        }
    }

    async fn insert_cluster(store: &InMemoryStore, id: &str, phase: ClusterPhase) -> ConnectorCluster {
        let mut cluster = ConnectorCluster::new(ClusterId::new(id), id, "alice", "org1");
        cluster.phase = phase;
        let mut uow = UnitOfWork::begin(store).await.unwrap();
        let cluster = uow.insert_cluster(cluster).await.unwrap();
        uow.commit().await.unwrap();
        cluster
    }

    /// A connector deployed on `k1` whose deployment status is at `status_version`
    async fn insert_deployed_connector(
        store: &InMemoryStore,
        desired_state: ConnectorDesiredState,
        status_version: i64,
    ) -> (Connector, ConnectorDeployment) {
        let mut connector = Connector::new(
            ConnectorId::new("c1"),
            "c1",
            "alice",
            CatalogTypeId::new("log_sink_0.1"),
            "stable",
        );
        connector.desired_state = desired_state;
        connector.status.phase = ConnectorPhase::Ready;
        connector.status.cluster_id = Some(ClusterId::new("k1"));

        let now = Utc::now();
        let mut uow = UnitOfWork::begin(store).await.unwrap();
        let connector = uow.insert_connector(connector).await.unwrap();
        let mut status = DeploymentStatus::new(ConnectorPhase::Ready);
        status.version = status_version;
        let deployment = uow
            .insert_connector_deployment(ConnectorDeployment {
                id: DeploymentId::new("d1"),
                connector_id: connector.id.clone(),
                cluster_id: ClusterId::new("k1"),
                namespace_id: None,
                connector_version: connector.version,
                shard_metadata_id: 1,
                version: 0,
                status,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        uow.commit().await.unwrap();
        (connector, deployment)
    }

    #[tokio::test]
    async fn test_deleting_cluster_cannot_become_ready() {
        let f = create_fixture();
        insert_cluster(&f.store, "k1", ClusterPhase::Deleting).await;

        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        let result = f
            .service
            .update_phase(&mut uow, &ClusterId::new("k1"), ClusterPhase::Ready)
            .await;
        assert!(matches!(result, Err(FleetError::Validation(_))));
        let cluster = f.service.get(&mut uow, &ClusterId::new("k1")).await.unwrap();
        assert_eq!(cluster.phase, ClusterPhase::Deleting);
    }

    #[tokio::test]
    async fn test_ready_cluster_wakes_connector_manager() {
        let f = create_fixture();
        insert_cluster(&f.store, "k1", ClusterPhase::Disconnected).await;
        let sub = f.bus.subscribe("reconcile:connector");

        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        let result = f
            .service
            .update_phase(&mut uow, &ClusterId::new("k1"), ClusterPhase::Ready)
            .await;
        assert!(!sub.is_signaled());
        uow.resolve(result).await.unwrap();
        assert!(sub.is_signaled());
    }

    #[tokio::test]
    async fn test_stale_deployment_status_is_rejected() {
        let f = create_fixture();
        let (_, deployment) =
            insert_deployed_connector(&f.store, ConnectorDesiredState::Ready, 5).await;

        let mut stale = DeploymentStatus::new(ConnectorPhase::Failed);
        stale.version = 3;
        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        let result = f
            .service
            .update_connector_deployment_status(&mut uow, &deployment.id, stale)
            .await;
        assert!(result.as_ref().unwrap_err().is_conflict());
        uow.resolve(result).await.unwrap_err();

        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        let stored = f
            .service
            .get_deployment_by_connector_id(&mut uow, &ConnectorId::new("c1"))
            .await
            .unwrap();
        assert_eq!(stored.status.version, 5);
        assert_eq!(stored.status.phase, ConnectorPhase::Ready);
    }

    #[tokio::test]
    async fn test_status_phase_is_mirrored_onto_connector() {
        let f = create_fixture();
        let (connector, deployment) =
            insert_deployed_connector(&f.store, ConnectorDesiredState::Ready, 1).await;

        let mut status = DeploymentStatus::new(ConnectorPhase::Failed);
        status.version = 2;
        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        let result = f
            .service
            .update_connector_deployment_status(&mut uow, &deployment.id, status)
            .await;
        uow.resolve(result).await.unwrap();

        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        let stored = uow.get_connector(&connector.id).await.unwrap().unwrap();
        assert_eq!(stored.status.phase, ConnectorPhase::Failed);
        assert_eq!(stored.version, connector.version);
    }

    #[tokio::test]
    async fn test_agent_report_does_not_revive_deleting_connector() {
        let f = create_fixture();
        let (mut connector, deployment) =
            insert_deployed_connector(&f.store, ConnectorDesiredState::Unassigned, 1).await;

        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        connector.status.phase = ConnectorPhase::Deleting;
        uow.save_connector_status(&connector.id, &connector.status).await.unwrap();
        uow.commit().await.unwrap();

        // An agent that has not seen the teardown yet
        let mut status = DeploymentStatus::new(ConnectorPhase::Ready);
        status.version = 2;
        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        let result = f
            .service
            .update_connector_deployment_status(&mut uow, &deployment.id, status)
            .await;
        uow.resolve(result).await.unwrap();

        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        let stored = uow.get_connector(&connector.id).await.unwrap().unwrap();
        assert_eq!(stored.status.phase, ConnectorPhase::Deleting);
        let stored = uow.get_connector_deployment(&deployment.id).await.unwrap().unwrap();
        assert_eq!(stored.status.version, 2);
    }

    #[tokio::test]
    async fn test_deleted_status_removes_deleted_connector() {
        let f = create_fixture();
        let (connector, deployment) =
            insert_deployed_connector(&f.store, ConnectorDesiredState::Deleted, 1).await;

        let mut status = DeploymentStatus::new(ConnectorPhase::Deleted);
        status.version = 2;
        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        let result = f
            .service
            .update_connector_deployment_status(&mut uow, &deployment.id, status)
            .await;
        uow.resolve(result).await.unwrap();

        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        assert!(uow.get_connector(&connector.id).await.unwrap().is_none());
        assert!(uow.get_connector_deployment(&deployment.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleted_status_stops_stopped_connector() {
        let f = create_fixture();
        let (connector, deployment) =
            insert_deployed_connector(&f.store, ConnectorDesiredState::Stopped, 1).await;

        let mut status = DeploymentStatus::new(ConnectorPhase::Deleted);
        status.version = 2;
        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        let result = f
            .service
            .update_connector_deployment_status(&mut uow, &deployment.id, status)
            .await;
        uow.resolve(result).await.unwrap();

        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        let stored = uow.get_connector(&connector.id).await.unwrap().unwrap();
        assert_eq!(stored.status.phase, ConnectorPhase::Stopped);
        assert!(uow.get_connector_deployment(&deployment.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_deleting_cluster_is_deleted_with_credentials() {
        let f = create_fixture();
        let mut cluster = insert_cluster(&f.store, "k1", ClusterPhase::Deleting).await;
        cluster.client_secret_ref = Some("k1-secret".into());
        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        uow.update_cluster(cluster).await.unwrap();
        uow.commit().await.unwrap();
        f.vault
            .set_secret_string("k1-secret", "s3cr3t", "k1")
            .await
            .unwrap();
        insert_cluster(&f.store, "k2", ClusterPhase::Ready).await;

        let (count, errors) = f.service.reconcile_empty_deleting_clusters(&f.store).await;
        assert_eq!(count, 1);
        assert!(errors.is_empty());
        assert!(f.vault.is_empty());

        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        assert!(uow.get_cluster(&ClusterId::new("k1")).await.unwrap().is_none());
        assert!(uow.get_cluster(&ClusterId::new("k2")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_deleting_cluster_with_namespace_is_kept() {
        let f = create_fixture();
        insert_cluster(&f.store, "k1", ClusterPhase::Deleting).await;
        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        uow.insert_namespace(ConnectorNamespace::new(
            NamespaceId::new("n1"),
            "n1",
            ClusterId::new("k1"),
            "alice",
            NamespaceTenant::User("alice".into()),
        ))
        .await
        .unwrap();
        uow.commit().await.unwrap();

        let (count, errors) = f.service.reconcile_empty_deleting_clusters(&f.store).await;
        assert_eq!(count, 0);
        assert!(errors.is_empty());

        // The namespace is handed over to deletion instead
        let (count, errors) = f.service.reconcile_unused_deleting_clusters(&f.store).await;
        assert_eq!(count, 1);
        assert!(errors.is_empty());
        let mut uow = UnitOfWork::begin(&f.store).await.unwrap();
        let namespace = uow.get_namespace(&NamespaceId::new("n1")).await.unwrap().unwrap();
        assert_eq!(namespace.phase, NamespacePhase::Deleting);
        drop(uow);

        // Already deleting, so a second pass has nothing to do
        let (count, _) = f.service.reconcile_unused_deleting_clusters(&f.store).await;
        assert_eq!(count, 0);
    }
}
