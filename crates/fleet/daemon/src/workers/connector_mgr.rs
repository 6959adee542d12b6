//! Connector manager
//!
//! Places Assigning connectors, re-places connectors whose namespace went
//! away, finishes deletions and pushes connector edits to their deployment.
//! Every row is reconciled in its own unit of work.

use super::Reconciler;
use crate::error::{FleetError, FleetResult};
use crate::services::{
    CatalogTypesService, ConnectorClusterService, ConnectorNamespaceService, ConnectorsService,
    FleetServices,
};
use crate::signalbus::worker_type;
use crate::storage::{ConnectorFilter, ConnectorRepository, FleetStore, FleetTx};
use crate::transaction::UnitOfWork;
use async_trait::async_trait;
use chrono::Utc;
use fleet_types::{
    ClusterId, Connector, ConnectorDeployment, ConnectorDesiredState, ConnectorId, ConnectorPhase,
    DeploymentId, DeploymentStatus, NamespaceId,
};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcilePhase {
    Assigning,
    Unassigned,
    Deleting,
    Deleted,
    Updated,
}

impl ReconcilePhase {
    const ALL: [ReconcilePhase; 5] = [
        ReconcilePhase::Assigning,
        ReconcilePhase::Unassigned,
        ReconcilePhase::Deleting,
        ReconcilePhase::Deleted,
        ReconcilePhase::Updated,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            ReconcilePhase::Assigning => "assigning",
            ReconcilePhase::Unassigned => "unassigned",
            ReconcilePhase::Deleting => "deleting",
            ReconcilePhase::Deleted => "deleted",
            ReconcilePhase::Updated => "updated",
        }
    }

    fn filter(&self, last_version: i64) -> ConnectorFilter {
        match self {
            ReconcilePhase::Assigning => ConnectorFilter {
                desired_state: Some(ConnectorDesiredState::Ready),
                phases: vec![ConnectorPhase::Assigning],
                ..Default::default()
            },
            ReconcilePhase::Unassigned => ConnectorFilter {
                desired_state: Some(ConnectorDesiredState::Unassigned),
                phases: vec![ConnectorPhase::Deleted],
                ..Default::default()
            },
            ReconcilePhase::Deleting => ConnectorFilter {
                desired_state: Some(ConnectorDesiredState::Deleted),
                phases: vec![ConnectorPhase::Deleting],
                ..Default::default()
            },
            ReconcilePhase::Deleted => ConnectorFilter {
                desired_state: Some(ConnectorDesiredState::Deleted),
                phases: vec![ConnectorPhase::Assigning, ConnectorPhase::Deleted],
                ..Default::default()
            },
            ReconcilePhase::Updated => ConnectorFilter {
                version_above: Some(last_version),
                excluded_phases: vec![
                    ConnectorPhase::Assigning,
                    ConnectorPhase::Deleting,
                    ConnectorPhase::Deleted,
                ],
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ConnectorManager<S> {
    store: Arc<S>,
    connectors: Arc<ConnectorsService>,
    clusters: Arc<ConnectorClusterService>,
    namespaces: Arc<ConnectorNamespaceService>,
    connector_types: Arc<CatalogTypesService>,
    /// Highest connector version whose update has been committed
    last_version: Arc<AtomicI64>,
}

impl<S: FleetStore> ConnectorManager<S> {
    pub fn new(store: Arc<S>, services: &FleetServices) -> Self {
        Self {
            store,
            connectors: services.connectors.clone(),
            clusters: services.clusters.clone(),
            namespaces: services.namespaces.clone(),
            connector_types: services.connector_types.clone(),
            last_version: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn last_version(&self) -> i64 {
        self.last_version.load(Ordering::SeqCst)
    }

    async fn do_reconcile(&self, phase: ReconcilePhase, errors: &mut Vec<FleetError>) {
        debug!(%phase, "Reconciling connectors");
        let filter = phase.filter(self.last_version());

        let connectors = match self.list(&filter).await {
            Ok(connectors) => connectors,
            Err(e) => {
                error!(%phase, error = %e, "Failed to list connectors");
                errors.push(e);
                return;
            }
        };

        let mut count = 0;
        let mut failed = 0;
        for connector in connectors {
            // A failed update must not let the high-water mark move past it
            let advance = failed == 0;
            match self.reconcile_row(phase, &filter, &connector.id, advance).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(
                        %phase,
                        connector_id = %connector.id,
                        connector_phase = %connector.status.phase,
                        error = %e,
                        "Failed to reconcile connector"
                    );
                    failed += 1;
                    errors.push(e);
                }
            }
        }

        if count == 0 && failed == 0 {
            debug!("No {phase} connectors");
        } else {
            debug!("Reconciled {count} {phase} connectors with {failed} errors");
        }
    }

    async fn list(&self, filter: &ConnectorFilter) -> FleetResult<Vec<Connector>> {
        let mut uow = UnitOfWork::begin(self.store.as_ref()).await?;
        let result = self.connectors.list(&mut uow, filter).await;
        uow.resolve(result).await
    }

    /// Reconcile one connector in its own unit of work. The row is read
    /// again inside the unit and skipped when it no longer matches `filter`.
    async fn reconcile_row(
        &self,
        phase: ReconcilePhase,
        filter: &ConnectorFilter,
        id: &ConnectorId,
        advance: bool,
    ) -> FleetResult<bool> {
        let mut uow = UnitOfWork::begin(self.store.as_ref()).await?;
        let result = async {
            let Some(connector) = uow.get_connector(id).await? else {
                return Ok(false);
            };
            if !filter.matches(&connector) {
                return Ok(false);
            }

            match phase {
                ReconcilePhase::Assigning => self.reconcile_assigning(&mut uow, connector).await?,
                ReconcilePhase::Unassigned => self.reconcile_unassigned(&mut uow, connector).await?,
                ReconcilePhase::Deleting => self.reconcile_deleting(&mut uow, connector).await?,
                ReconcilePhase::Deleted => {
                    self.connectors.delete(&mut uow, &connector.id).await?;
                }
                ReconcilePhase::Updated => self.reconcile_updated(&mut uow, connector, advance).await?,
            }
            Ok::<_, FleetError>(true)
        }
        .await;
        uow.resolve(result).await
    }

    /// Bind the connector to a namespace or a Ready cluster and create its
    /// deployment. Without capacity the row stays Assigning.
    async fn reconcile_assigning<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        mut connector: Connector,
    ) -> FleetResult<()> {
        let placement: Option<(ClusterId, Option<NamespaceId>)> = match &connector.namespace_id {
            Some(namespace_id) => self
                .namespaces
                .find_available_namespace(
                    uow,
                    &connector.owner,
                    &connector.organisation_id,
                    Some(namespace_id),
                )
                .await?
                .map(|ns| (ns.cluster_id, Some(ns.id))),
            None => self
                .clusters
                .find_ready_cluster(
                    uow,
                    &connector.owner,
                    &connector.organisation_id,
                    connector.addon_cluster_id.as_ref(),
                )
                .await?
                .map(|cluster| (cluster.id, None)),
        };
        let Some((cluster_id, namespace_id)) = placement else {
            debug!(connector_id = %connector.id, "No capacity for connector yet");
            return Ok(());
        };

        let shard_metadata = self
            .connector_types
            .latest_shard_metadata(uow, &connector.connector_type_id, &connector.channel)
            .await?;

        connector.status.phase = ConnectorPhase::Assigned;
        connector.status.cluster_id = Some(cluster_id.clone());
        connector.status.namespace_id = namespace_id.clone();
        self.connectors
            .save_status(uow, &connector.id, &connector.status)
            .await?;

        let now = Utc::now();
        let deployment = self
            .clusters
            .save_deployment(
                uow,
                ConnectorDeployment {
                    id: DeploymentId::generate(),
                    connector_id: connector.id.clone(),
                    cluster_id,
                    namespace_id,
                    connector_version: connector.version,
                    shard_metadata_id: shard_metadata.id,
                    version: 0,
                    status: DeploymentStatus::new(ConnectorPhase::Assigned),
                    created_at: now,
                    updated_at: now,
                },
            )
            .await?;
        debug!(
            connector_id = %connector.id,
            cluster_id = %deployment.cluster_id,
            deployment_id = %deployment.id,
            "Connector assigned"
        );
        Ok(())
    }

    /// Send a connector whose namespace was deleted back to placement
    async fn reconcile_unassigned<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        mut connector: Connector,
    ) -> FleetResult<()> {
        connector.namespace_id = None;
        connector.status.namespace_id = None;
        connector.status.cluster_id = None;
        connector.status.phase = ConnectorPhase::Assigning;
        uow.update_connector(connector).await?;
        Ok(())
    }

    /// Once the agent has removed the deployment, mark the connector Deleted
    async fn reconcile_deleting<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        mut connector: Connector,
    ) -> FleetResult<()> {
        if uow
            .get_connector_deployment_by_connector(&connector.id)
            .await?
            .is_some()
        {
            return Ok(());
        }
        connector.namespace_id = None;
        connector.status.namespace_id = None;
        connector.status.phase = ConnectorPhase::Deleted;
        uow.update_connector(connector).await?;
        Ok(())
    }

    /// Push the connector's version to its deployment
    async fn reconcile_updated<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        connector: Connector,
        advance: bool,
    ) -> FleetResult<()> {
        match uow.get_connector_deployment_by_connector(&connector.id).await? {
            Some(mut deployment) if deployment.connector_version != connector.version => {
                deployment.connector_version = connector.version;
                self.clusters
                    .update_deployment(uow, deployment)
                    .await
                    .map_err(|e| e.context(format_args!("connector {}", connector.id)))?;
            }
            _ => {}
        }

        if advance {
            let last_version = self.last_version.clone();
            let version = connector.version;
            uow.register_post_commit(move || {
                last_version.fetch_max(version, Ordering::SeqCst);
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<S: FleetStore> Reconciler for ConnectorManager<S> {
    fn worker_type(&self) -> &'static str {
        worker_type::CONNECTOR
    }

    #[instrument(skip(self))]
    async fn reconcile(&self) -> Vec<FleetError> {
        debug!("Reconciling connectors");
        let mut errors = Vec::new();
        for phase in ReconcilePhase::ALL {
            self.do_reconcile(phase, &mut errors).await;
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CatalogEntry, ChannelConfig, DaemonConfig};
    use crate::signalbus::{InMemorySignalBus, SignalBus};
    use crate::storage::{ClusterRepository, DeploymentRepository, InMemoryStore};
    use crate::vault::InMemoryVault;
    use fleet_types::{CatalogTypeId, ClusterPhase, ConnectorCluster};
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Fixture {
        store: Arc<InMemoryStore>,
        bus: InMemorySignalBus,
        manager: ConnectorManager<InMemoryStore>,
        services: FleetServices,
    }

    async fn create_fixture() -> Fixture {
        let mut channels = BTreeMap::new();
        channels.insert(
            "stable".to_string(),
            ChannelConfig {
                shard_metadata: json!({ "connector_revision": 1 }),
            },
        );
        let mut config = DaemonConfig::default();
        config.catalog.connectors.push(CatalogEntry {
            id: "log_sink_0.1".into(),
            name: "Log sink".into(),
            description: String::new(),
            channels,
        });

        let bus = InMemorySignalBus::new();
        let signals: Arc<dyn SignalBus> = Arc::new(bus.clone());
        let services =
            FleetServices::new(&config, signals, Arc::new(InMemoryVault::new())).unwrap();
        let store = Arc::new(InMemoryStore::new());

        let mut uow = UnitOfWork::begin(store.as_ref()).await.unwrap();
        services
            .connector_types
            .reconcile_catalog_entries(&mut uow)
            .await
            .unwrap();
        uow.commit().await.unwrap();

        Fixture {
            manager: ConnectorManager::new(store.clone(), &services),
            store,
            bus,
            services,
        }
    }

    async fn insert_ready_cluster(store: &InMemoryStore) {
        let mut cluster = ConnectorCluster::new(ClusterId::new("k1"), "k1", "alice", "");
        cluster.phase = ClusterPhase::Ready;
        let mut uow = UnitOfWork::begin(store).await.unwrap();
        uow.insert_cluster(cluster).await.unwrap();
        uow.commit().await.unwrap();
    }

    async fn insert_connector(store: &InMemoryStore) -> Connector {
        let mut uow = UnitOfWork::begin(store).await.unwrap();
        let connector = uow
            .insert_connector(Connector::new(
                ConnectorId::new("c1"),
                "c1",
                "alice",
                CatalogTypeId::new("log_sink_0.1"),
                "stable",
            ))
            .await
            .unwrap();
        uow.commit().await.unwrap();
        connector
    }

    async fn load(store: &InMemoryStore) -> (Connector, Option<ConnectorDeployment>) {
        let mut uow = UnitOfWork::begin(store).await.unwrap();
        let connector = uow.get_connector(&ConnectorId::new("c1")).await.unwrap().unwrap();
        let deployment = uow
            .get_connector_deployment_by_connector(&connector.id)
            .await
            .unwrap();
        (connector, deployment)
    }

    #[tokio::test]
    async fn test_without_capacity_connector_stays_assigning() {
        let f = create_fixture().await;
        insert_connector(&f.store).await;

        assert!(f.manager.reconcile().await.is_empty());
        let (connector, deployment) = load(&f.store).await;
        assert_eq!(connector.status.phase, ConnectorPhase::Assigning);
        assert!(deployment.is_none());
    }

    #[tokio::test]
    async fn test_assigning_connector_is_placed_and_agent_signaled() {
        let f = create_fixture().await;
        insert_ready_cluster(&f.store).await;
        let created = insert_connector(&f.store).await;
        let agent = f.bus.subscribe("/kafka-connector-clusters/k1/deployments");

        assert!(f.manager.reconcile().await.is_empty());

        let (connector, deployment) = load(&f.store).await;
        assert_eq!(connector.status.phase, ConnectorPhase::Assigned);
        assert_eq!(connector.status.cluster_id, Some(ClusterId::new("k1")));
        let deployment = deployment.unwrap();
        assert_eq!(deployment.connector_version, created.version);
        assert!(agent.is_signaled());
    }

    #[tokio::test]
    async fn test_edit_propagates_to_deployment_once() {
        let f = create_fixture().await;
        insert_ready_cluster(&f.store).await;
        insert_connector(&f.store).await;
        assert!(f.manager.reconcile().await.is_empty());

        let (mut connector, _) = load(&f.store).await;
        connector.connector_spec = json!({ "topic": "orders" });
        let mut uow = UnitOfWork::begin(f.store.as_ref()).await.unwrap();
        let result = f.services.connectors.update(&mut uow, connector).await;
        let edited = uow.resolve(result).await.unwrap();

        assert!(f.manager.reconcile().await.is_empty());
        let (_, deployment) = load(&f.store).await;
        let deployment = deployment.unwrap();
        assert_eq!(deployment.connector_version, edited.version);
        assert_eq!(f.manager.last_version(), edited.version);

        // Nothing left to push
        assert!(f.manager.reconcile().await.is_empty());
        let (_, again) = load(&f.store).await;
        assert_eq!(again.unwrap().version, deployment.version);
    }

    #[tokio::test]
    async fn test_unplaced_deleted_connector_is_removed() {
        let f = create_fixture().await;
        let mut connector = insert_connector(&f.store).await;
        connector.desired_state = ConnectorDesiredState::Deleted;
        let mut uow = UnitOfWork::begin(f.store.as_ref()).await.unwrap();
        uow.update_connector(connector).await.unwrap();
        uow.commit().await.unwrap();

        assert!(f.manager.reconcile().await.is_empty());
        let mut uow = UnitOfWork::begin(f.store.as_ref()).await.unwrap();
        assert!(uow.get_connector(&ConnectorId::new("c1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unassigned_connector_returns_to_placement() {
        let f = create_fixture().await;
        let mut connector = insert_connector(&f.store).await;
        connector.desired_state = ConnectorDesiredState::Unassigned;
        connector.namespace_id = Some(NamespaceId::new("gone"));
        connector.status.phase = ConnectorPhase::Deleted;
        let mut uow = UnitOfWork::begin(f.store.as_ref()).await.unwrap();
        uow.update_connector(connector).await.unwrap();
        uow.commit().await.unwrap();

        assert!(f.manager.reconcile().await.is_empty());
        let (connector, _) = load(&f.store).await;
        assert_eq!(connector.status.phase, ConnectorPhase::Assigning);
        assert!(connector.namespace_id.is_none());
        assert_eq!(connector.desired_state, ConnectorDesiredState::Unassigned);
    }
}
