//! Namespace service
//!
//! Namespaces are created inside a cluster, connect and disconnect with it,
//! and are deleted in two steps: first marked Deleting together with the
//! workloads they host, then removed once no workload references them.
//! Evaluation namespaces are placed on a random evaluation cluster and
//! expire after a fixed duration.

use super::notify_after_commit;
use crate::config::NamespaceConfig;
use crate::error::{FleetError, FleetResult};
use crate::placement::{pick_eval_cluster, select_available_namespace};
use crate::signalbus::{cluster_deployments_signal, reconcile_signal, worker_type, SignalBus};
use crate::storage::{
    ClusterFilter, ConnectorFilter, FleetStore, FleetTx, NamespaceFilter, NamespaceRepository,
    ProcessorFilter,
};
use crate::transaction::UnitOfWork;
use chrono::{Duration, Utc};
use fleet_types::{
    ClusterId, ClusterPhase, ConnectorDesiredState, ConnectorNamespace, ConnectorPhase, NamespaceId,
    NamespaceOperation, NamespacePhase, ProcessorDesiredState, ProcessorPhase,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

pub struct ConnectorNamespaceService {
    signals: Arc<dyn SignalBus>,
    eval_organisations: Vec<String>,
    eval_duration: Duration,
    rng: Mutex<StdRng>,
}

impl ConnectorNamespaceService {
    /// The evaluation RNG is seeded once here, from `eval_seed` when set
    pub fn new(signals: Arc<dyn SignalBus>, config: &NamespaceConfig) -> Self {
        let rng = match config.eval_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            signals,
            eval_organisations: config.eval_organisations.clone(),
            eval_duration: config.eval_duration(),
            rng: Mutex::new(rng),
        }
    }

    /// Insert a namespace in the phase its cluster allows
    pub async fn create<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        mut namespace: ConnectorNamespace,
    ) -> FleetResult<ConnectorNamespace> {
        let cluster_phase = uow
            .get_cluster(&namespace.cluster_id)
            .await?
            .map(|cluster| cluster.phase)
            .ok_or_else(|| FleetError::NotFound(format!("cluster {}", namespace.cluster_id)))?;
        namespace.phase = NamespaceOperation::initial_phase(cluster_phase)?;

        let created = uow.insert_namespace(namespace).await?;
        tracing::debug!(
            namespace_id = %created.id,
            cluster_id = %created.cluster_id,
            "Namespace created"
        );
        notify_after_commit(
            uow,
            &self.signals,
            reconcile_signal(worker_type::CONNECTOR_NAMESPACE),
        );
        Ok(created)
    }

    /// Create an evaluation namespace on a randomly chosen evaluation cluster
    pub async fn create_eval<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        mut namespace: ConnectorNamespace,
    ) -> FleetResult<ConnectorNamespace> {
        self.set_eval_cluster_id(uow, &mut namespace).await?;
        self.create(uow, namespace).await
    }

    /// Place `namespace` on one of the evaluation clusters and stamp its
    /// expiration. Fails with `Unauthorized` when there is no evaluation
    /// capacity.
    pub async fn set_eval_cluster_id<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        namespace: &mut ConnectorNamespace,
    ) -> FleetResult<()> {
        if self.eval_organisations.is_empty() {
            return Err(FleetError::Unauthorized(
                "no evaluation organisations configured".into(),
            ));
        }

        let filter = ClusterFilter {
            organisation_ids: self.eval_organisations.clone(),
            ..Default::default()
        };
        let candidates: Vec<ClusterId> = uow
            .list_clusters(&filter)
            .await?
            .into_iter()
            .filter(|cluster| cluster.phase != ClusterPhase::Deleting)
            .map(|cluster| cluster.id)
            .collect();

        let cluster_id = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| FleetError::Internal("evaluation rng poisoned".into()))?;
            pick_eval_cluster(&candidates, &mut *rng).cloned()
        }
        .ok_or_else(|| FleetError::Unauthorized("no eval clusters".into()))?;

        namespace.cluster_id = cluster_id;
        namespace.expiration = Some(Utc::now() + self.eval_duration);
        Ok(())
    }

    pub async fn get<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &NamespaceId,
    ) -> FleetResult<ConnectorNamespace> {
        uow.get_namespace(id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("namespace {id}")))
    }

    pub async fn list<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        filter: &NamespaceFilter,
    ) -> FleetResult<Vec<ConnectorNamespace>> {
        Ok(uow.list_namespaces(filter).await?)
    }

    pub async fn update<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        namespace: ConnectorNamespace,
    ) -> FleetResult<ConnectorNamespace> {
        Ok(uow.update_namespace(namespace).await?)
    }

    /// Apply a lifecycle operation gated by the cluster phase. Delete also
    /// marks the hosted connectors for removal.
    pub async fn apply_operation<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &NamespaceId,
        operation: NamespaceOperation,
    ) -> FleetResult<ConnectorNamespace> {
        let mut namespace = self.get(uow, id).await?;
        let cluster_phase = uow
            .get_cluster(&namespace.cluster_id)
            .await?
            .map(|cluster| cluster.phase)
            .ok_or_else(|| FleetError::NotFound(format!("cluster {}", namespace.cluster_id)))?;

        if !operation.perform(cluster_phase, &mut namespace.phase)? {
            return Ok(namespace);
        }

        if operation == NamespaceOperation::Delete {
            let filter = NamespaceFilter {
                ids: vec![id.clone()],
                ..Default::default()
            };
            self.delete_namespace_and_connector_deployments(uow, &filter)
                .await?;
            return self.get(uow, id).await;
        }

        let updated = uow.update_namespace(namespace).await?;
        notify_after_commit(
            uow,
            &self.signals,
            reconcile_signal(worker_type::CONNECTOR_NAMESPACE),
        );
        Ok(updated)
    }

    /// The agent reported the namespace: it is connected unless already
    /// on its way out
    pub async fn update_namespace_status<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &NamespaceId,
    ) -> FleetResult<ConnectorNamespace> {
        self.apply_operation(uow, id, NamespaceOperation::Connect)
            .await
    }

    /// A Ready namespace for the requester's tenant
    pub async fn find_available_namespace<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        owner: &str,
        organisation_id: &str,
        namespace_id: Option<&NamespaceId>,
    ) -> FleetResult<Option<ConnectorNamespace>> {
        let filter = NamespaceFilter {
            ids: namespace_id.cloned().into_iter().collect(),
            phases: vec![NamespacePhase::Ready],
            ..Default::default()
        };
        let namespaces = uow.list_namespaces(&filter).await?;
        Ok(select_available_namespace(&namespaces, owner, organisation_id, namespace_id).cloned())
    }

    /// Ids of expired namespaces, which are marked Deleting on the way
    pub async fn get_expired_namespace_ids<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
    ) -> FleetResult<Vec<NamespaceId>> {
        let filter = NamespaceFilter {
            expired_before: Some(Utc::now()),
            excluded_phases: vec![NamespacePhase::Deleted],
            ..Default::default()
        };
        let mut ids = Vec::new();
        for mut namespace in uow.list_namespaces(&filter).await? {
            if namespace.phase != NamespacePhase::Deleting {
                namespace.phase = NamespacePhase::Deleting;
                namespace = uow.update_namespace(namespace).await?;
            }
            ids.push(namespace.id);
        }
        Ok(ids)
    }

    /// Mark the matching namespaces Deleting, send their connectors back to
    /// unassigned with a deployment teardown, and delete their processors.
    /// Returns whether any namespace and any connector were affected.
    pub async fn delete_namespace_and_connector_deployments<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        filter: &NamespaceFilter,
    ) -> FleetResult<(bool, bool)> {
        let namespaces = uow.list_namespaces(filter).await?;
        if namespaces.is_empty() {
            return Ok((false, false));
        }

        let mut clusters = BTreeSet::new();
        let mut namespace_ids = Vec::with_capacity(namespaces.len());
        for mut namespace in namespaces {
            clusters.insert(namespace.cluster_id.clone());
            namespace_ids.push(namespace.id.clone());
            if namespace.phase != NamespacePhase::Deleting {
                namespace.phase = NamespacePhase::Deleting;
                uow.update_namespace(namespace).await?;
            }
        }

        let connectors = uow
            .list_connectors(&ConnectorFilter {
                namespace_ids: namespace_ids.clone(),
                ..Default::default()
            })
            .await?;
        let mut connectors_deleted = false;
        for mut connector in connectors {
            let already_leaving = connector.desired_state == ConnectorDesiredState::Unassigned
                && matches!(
                    connector.status.phase,
                    ConnectorPhase::Deleting | ConnectorPhase::Deleted
                );
            if connector.desired_state == ConnectorDesiredState::Deleted || already_leaving {
                continue;
            }
            connector.desired_state = ConnectorDesiredState::Unassigned;
            connector.status.phase = ConnectorPhase::Deleting;

            match uow.get_connector_deployment_by_connector(&connector.id).await? {
                Some(mut deployment) => {
                    deployment.status.phase = ConnectorPhase::Deleting;
                    uow.save_connector_deployment_status(&deployment.id, &deployment.status)
                        .await?;
                    clusters.insert(deployment.cluster_id);
                }
                // Nothing to tear down on the agent side
                None => connector.status.phase = ConnectorPhase::Deleted,
            }
            uow.update_connector(connector).await?;
            connectors_deleted = true;
        }

        let processors = uow
            .list_processors(&ProcessorFilter {
                namespace_ids: namespace_ids.clone(),
                ..Default::default()
            })
            .await?;
        let mut processors_deleted = false;
        for mut processor in processors {
            if processor.desired_state == ProcessorDesiredState::Deleted {
                continue;
            }
            processor.desired_state = ProcessorDesiredState::Deleted;

            match uow.get_processor_deployment_by_processor(&processor.id).await? {
                Some(mut deployment) => {
                    deployment.status.phase = ProcessorPhase::Deleting;
                    uow.save_processor_deployment_status(&deployment.id, &deployment.status)
                        .await?;
                    clusters.insert(deployment.cluster_id);
                    processor.status.phase = ProcessorPhase::Deprovisioning;
                }
                None => processor.status.phase = ProcessorPhase::Deleted,
            }
            uow.update_processor(processor).await?;
            processors_deleted = true;
        }

        tracing::info!(
            namespaces = ?namespace_ids,
            connectors_deleted,
            processors_deleted,
            "Namespaces marked for deletion"
        );
        for cluster_id in clusters {
            notify_after_commit(uow, &self.signals, cluster_deployments_signal(&cluster_id));
        }
        notify_after_commit(
            uow,
            &self.signals,
            reconcile_signal(worker_type::CONNECTOR_NAMESPACE),
        );
        if connectors_deleted {
            notify_after_commit(uow, &self.signals, reconcile_signal(worker_type::CONNECTOR));
        }
        if processors_deleted {
            notify_after_commit(uow, &self.signals, reconcile_signal(worker_type::PROCESSOR));
        }
        Ok((true, connectors_deleted))
    }

    /// Remove Deleting namespaces no workload references any more, one
    /// transaction per namespace. Returns the number removed and the
    /// per-namespace failures.
    pub async fn reconcile_deleting_namespaces<S: FleetStore>(
        &self,
        store: &S,
    ) -> (usize, Vec<FleetError>) {
        let filter = NamespaceFilter {
            phases: vec![NamespacePhase::Deleting],
            ..Default::default()
        };
        let namespaces = match list_in_unit(store, &filter).await {
            Ok(namespaces) => namespaces,
            Err(e) => return (0, vec![e]),
        };

        let mut count = 0;
        let mut errors = Vec::new();
        for namespace in namespaces {
            let result = async {
                let mut uow = UnitOfWork::begin(store).await?;
                let result = self.delete_if_unused(&mut uow, &namespace.id).await;
                uow.resolve(result).await
            }
            .await;

            match result {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        namespace_id = %namespace.id,
                        error = %e,
                        "Failed to delete namespace"
                    );
                    errors.push(e);
                }
            }
        }
        (count, errors)
    }

    async fn delete_if_unused<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &NamespaceId,
    ) -> FleetResult<bool> {
        let Some(namespace) = uow.get_namespace(id).await? else {
            return Ok(false);
        };
        if namespace.phase != NamespacePhase::Deleting {
            return Ok(false);
        }

        let namespace_ids = vec![id.clone()];
        let connectors = uow
            .list_connectors(&ConnectorFilter {
                namespace_ids: namespace_ids.clone(),
                ..Default::default()
            })
            .await?;
        let processors = uow
            .list_processors(&ProcessorFilter {
                namespace_ids,
                ..Default::default()
            })
            .await?;
        if !connectors.is_empty() || !processors.is_empty() {
            tracing::debug!(
                namespace_id = %id,
                connectors = connectors.len(),
                processors = processors.len(),
                "Namespace still in use"
            );
            return Ok(false);
        }

        uow.delete_namespace(id).await?;
        tracing::info!(namespace_id = %id, cluster_id = %namespace.cluster_id, "Namespace deleted");
        Ok(true)
    }
}

async fn list_in_unit<S: FleetStore>(
    store: &S,
    filter: &NamespaceFilter,
) -> FleetResult<Vec<ConnectorNamespace>> {
    let mut uow = UnitOfWork::begin(store).await?;
    let result = uow.list_namespaces(filter).await.map_err(FleetError::from);
    uow.resolve(result).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signalbus::InMemorySignalBus;
    use crate::storage::{
        ClusterRepository, ConnectorRepository, DeploymentRepository, InMemoryStore,
        ProcessorRepository,
    };
    use fleet_types::{
        CatalogTypeId, Connector, ConnectorCluster, ConnectorId, DeploymentId, DeploymentStatus,
        NamespaceTenant, Processor, ProcessorDeployment, ProcessorId,
    };
    use std::collections::HashMap;

    fn create_service(config: NamespaceConfig) -> ConnectorNamespaceService {
        ConnectorNamespaceService::new(Arc::new(InMemorySignalBus::new()), &config)
    }

    fn eval_config(seed: u64) -> NamespaceConfig {
        NamespaceConfig {
            eval_organisations: vec!["eval-org".into()],
            eval_seed: Some(seed),
            ..Default::default()
        }
    }

    fn create_test_namespace(id: &str, cluster: &str) -> ConnectorNamespace {
        ConnectorNamespace::new(
            NamespaceId::new(id),
            id,
            ClusterId::new(cluster),
            "alice",
            NamespaceTenant::User("alice".into()),
        )
    }

    async fn insert_cluster(store: &InMemoryStore, id: &str, org: &str, phase: ClusterPhase) {
        let mut cluster = ConnectorCluster::new(ClusterId::new(id), id, "admin", org);
        cluster.phase = phase;
        let mut uow = UnitOfWork::begin(store).await.unwrap();
        uow.insert_cluster(cluster).await.unwrap();
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_namespace_in_ready_cluster_starts_disconnected() {
        let store = InMemoryStore::new();
        let service = create_service(NamespaceConfig::default());
        insert_cluster(&store, "k1", "", ClusterPhase::Ready).await;

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        let namespace = service
            .create(&mut uow, create_test_namespace("n1", "k1"))
            .await
            .unwrap();
        assert_eq!(namespace.phase, NamespacePhase::Disconnected);

        let connected = service
            .update_namespace_status(&mut uow, &namespace.id)
            .await
            .unwrap();
        assert_eq!(connected.phase, NamespacePhase::Ready);
    }

    #[tokio::test]
    async fn test_eval_without_clusters_is_unauthorized() {
        let store = InMemoryStore::new();
        let service = create_service(eval_config(1));
        insert_cluster(&store, "k1", "other-org", ClusterPhase::Ready).await;

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        let err = service
            .create_eval(&mut uow, create_test_namespace("n1", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_single_eval_cluster_is_deterministic() {
        let store = InMemoryStore::new();
        insert_cluster(&store, "eval-1", "eval-org", ClusterPhase::Ready).await;

        for seed in 0..8 {
            let service = create_service(eval_config(seed));
            let mut uow = UnitOfWork::begin(&store).await.unwrap();
            let mut namespace = create_test_namespace("n1", "");
            service.set_eval_cluster_id(&mut uow, &mut namespace).await.unwrap();
            assert_eq!(namespace.cluster_id.as_str(), "eval-1");
            assert!(namespace.expiration.is_some_and(|e| e > Utc::now()));
        }
    }

    #[tokio::test]
    async fn test_eval_clusters_share_the_load() {
        let store = InMemoryStore::new();
        for i in 0..3 {
            insert_cluster(&store, &format!("eval-{i}"), "eval-org", ClusterPhase::Ready).await;
        }
        let service = create_service(eval_config(42));

        let mut picks: HashMap<String, usize> = HashMap::new();
        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        for _ in 0..300 {
            let mut namespace = create_test_namespace("n1", "");
            service.set_eval_cluster_id(&mut uow, &mut namespace).await.unwrap();
            *picks.entry(namespace.cluster_id.to_string()).or_default() += 1;
        }
        assert_eq!(picks.len(), 3);
        assert!(picks.values().all(|n| *n > 50));
    }

    #[tokio::test]
    async fn test_delete_cascades_to_connectors() {
        let store = InMemoryStore::new();
        let service = create_service(NamespaceConfig::default());
        insert_cluster(&store, "k1", "", ClusterPhase::Ready).await;

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        let namespace = service
            .create(&mut uow, create_test_namespace("n1", "k1"))
            .await
            .unwrap();
        let mut connector = Connector::new(
            ConnectorId::new("c1"),
            "c1",
            "alice",
            CatalogTypeId::new("log_sink_0.1"),
            "stable",
        );
        connector.namespace_id = Some(namespace.id.clone());
        uow.insert_connector(connector).await.unwrap();

        let deleted = service
            .apply_operation(&mut uow, &namespace.id, NamespaceOperation::Delete)
            .await
            .unwrap();
        assert_eq!(deleted.phase, NamespacePhase::Deleting);

        let connector = uow.get_connector(&ConnectorId::new("c1")).await.unwrap().unwrap();
        assert_eq!(connector.desired_state, ConnectorDesiredState::Unassigned);
        assert_eq!(connector.status.phase, ConnectorPhase::Deleted);
        uow.commit().await.unwrap();

        // Still referenced until the connector manager unassigns it
        let (count, errors) = service.reconcile_deleting_namespaces(&store).await;
        assert_eq!((count, errors.len()), (0, 0));

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        let mut connector = uow.get_connector(&ConnectorId::new("c1")).await.unwrap().unwrap();
        connector.namespace_id = None;
        uow.update_connector(connector).await.unwrap();
        uow.commit().await.unwrap();

        let (count, errors) = service.reconcile_deleting_namespaces(&store).await;
        assert_eq!((count, errors.len()), (1, 0));
    }

    #[tokio::test]
    async fn test_delete_cascades_to_processors() {
        let store = InMemoryStore::new();
        let signals = Arc::new(InMemorySignalBus::new());
        let service = ConnectorNamespaceService::new(signals.clone(), &NamespaceConfig::default());
        let processor_signal = signals.subscribe("reconcile:processor");
        insert_cluster(&store, "k1", "", ClusterPhase::Ready).await;

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        let namespace = service
            .create(&mut uow, create_test_namespace("n1", "k1"))
            .await
            .unwrap();
        for id in ["p1", "p2"] {
            uow.insert_processor(Processor::new(
                ProcessorId::new(id),
                id,
                "alice",
                CatalogTypeId::new("filter_0.1"),
                "stable",
                namespace.id.clone(),
            ))
            .await
            .unwrap();
        }
        let now = Utc::now();
        uow.insert_processor_deployment(ProcessorDeployment {
            id: DeploymentId::new("d1"),
            processor_id: ProcessorId::new("p1"),
            cluster_id: ClusterId::new("k1"),
            namespace_id: namespace.id.clone(),
            processor_version: 1,
            shard_metadata_id: 1,
            version: 0,
            status: DeploymentStatus::new(ProcessorPhase::Ready),
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
        uow.commit().await.unwrap();

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        let result = service
            .apply_operation(&mut uow, &namespace.id, NamespaceOperation::Delete)
            .await;
        uow.resolve(result).await.unwrap();
        assert!(processor_signal.is_signaled());

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        let deployed = uow.get_processor(&ProcessorId::new("p1")).await.unwrap().unwrap();
        assert_eq!(deployed.desired_state, ProcessorDesiredState::Deleted);
        assert_eq!(deployed.status.phase, ProcessorPhase::Deprovisioning);
        let deployment = uow
            .get_processor_deployment(&DeploymentId::new("d1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deployment.status.phase, ProcessorPhase::Deleting);

        let pending = uow.get_processor(&ProcessorId::new("p2")).await.unwrap().unwrap();
        assert_eq!(pending.desired_state, ProcessorDesiredState::Deleted);
        assert_eq!(pending.status.phase, ProcessorPhase::Deleted);
        uow.commit().await.unwrap();

        // A second pass leaves the processors alone
        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        let filter = NamespaceFilter {
            ids: vec![namespace.id.clone()],
            ..Default::default()
        };
        let result = service
            .delete_namespace_and_connector_deployments(&mut uow, &filter)
            .await;
        assert_eq!(result.unwrap(), (true, false));
        let again = uow.get_processor(&ProcessorId::new("p1")).await.unwrap().unwrap();
        assert_eq!(again.version, deployed.version);
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_namespaces_are_marked_deleting() {
        let store = InMemoryStore::new();
        let service = create_service(NamespaceConfig::default());
        let mut expired = create_test_namespace("old", "k1");
        expired.expiration = Some(Utc::now() - Duration::minutes(5));
        let mut fresh = create_test_namespace("new", "k1");
        fresh.expiration = Some(Utc::now() + Duration::hours(1));

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        uow.insert_namespace(expired).await.unwrap();
        uow.insert_namespace(fresh).await.unwrap();
        let ids = service.get_expired_namespace_ids(&mut uow).await.unwrap();
        assert_eq!(ids, vec![NamespaceId::new("old")]);

        let old = service.get(&mut uow, &NamespaceId::new("old")).await.unwrap();
        assert_eq!(old.phase, NamespacePhase::Deleting);
    }
}
