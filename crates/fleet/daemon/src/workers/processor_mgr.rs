//! Processor manager
//!
//! Processors live in a namespace chosen at creation, so preparing one only
//! resolves that namespace and creates the deployment. Deletion waits for
//! the agent to report the deployment Deleted.

use super::Reconciler;
use crate::error::{FleetError, FleetResult};
use crate::services::{CatalogTypesService, ConnectorNamespaceService, FleetServices, ProcessorsService};
use crate::signalbus::worker_type;
use crate::storage::{FleetStore, FleetTx, ProcessorFilter, ProcessorRepository};
use crate::transaction::UnitOfWork;
use async_trait::async_trait;
use chrono::Utc;
use fleet_types::{
    DeploymentId, DeploymentStatus, NamespacePhase, Processor, ProcessorDeployment,
    ProcessorDesiredState, ProcessorId, ProcessorPhase,
};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcilePhase {
    Preparing,
    Deprovisioning,
    Deleted,
    Updated,
}

impl ReconcilePhase {
    const ALL: [ReconcilePhase; 4] = [
        ReconcilePhase::Preparing,
        ReconcilePhase::Deprovisioning,
        ReconcilePhase::Deleted,
        ReconcilePhase::Updated,
    ];

    fn filter(&self, last_version: i64) -> ProcessorFilter {
        match self {
            ReconcilePhase::Preparing => ProcessorFilter {
                desired_state: Some(ProcessorDesiredState::Ready),
                phases: vec![ProcessorPhase::Preparing],
                ..Default::default()
            },
            ReconcilePhase::Deprovisioning => ProcessorFilter {
                desired_state: Some(ProcessorDesiredState::Deleted),
                phases: vec![ProcessorPhase::Deprovisioning],
                ..Default::default()
            },
            ReconcilePhase::Deleted => ProcessorFilter {
                desired_state: Some(ProcessorDesiredState::Deleted),
                phases: vec![ProcessorPhase::Preparing, ProcessorPhase::Deleted],
                ..Default::default()
            },
            ReconcilePhase::Updated => ProcessorFilter {
                version_above: Some(last_version),
                excluded_phases: vec![
                    ProcessorPhase::Preparing,
                    ProcessorPhase::Deprovisioning,
                    ProcessorPhase::Deleting,
                    ProcessorPhase::Deleted,
                ],
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReconcilePhase::Preparing => "preparing",
            ReconcilePhase::Deprovisioning => "deprovisioning",
            ReconcilePhase::Deleted => "deleted",
            ReconcilePhase::Updated => "updated",
        })
    }
}

pub struct ProcessorManager<S> {
    store: Arc<S>,
    processors: Arc<ProcessorsService>,
    namespaces: Arc<ConnectorNamespaceService>,
    processor_types: Arc<CatalogTypesService>,
    last_version: Arc<AtomicI64>,
}

impl<S: FleetStore> ProcessorManager<S> {
    pub fn new(store: Arc<S>, services: &FleetServices) -> Self {
        Self {
            store,
            processors: services.processors.clone(),
            namespaces: services.namespaces.clone(),
            processor_types: services.processor_types.clone(),
            last_version: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn last_version(&self) -> i64 {
        self.last_version.load(Ordering::SeqCst)
    }

    async fn do_reconcile(&self, phase: ReconcilePhase, errors: &mut Vec<FleetError>) {
        let filter = phase.filter(self.last_version());
        let processors = match self.list(&filter).await {
            Ok(processors) => processors,
            Err(e) => {
                error!(%phase, error = %e, "Failed to list processors");
                errors.push(e);
                return;
            }
        };

        let mut count = 0;
        let mut failed = 0;
        for processor in processors {
            let advance = failed == 0;
            match self.reconcile_row(phase, &filter, &processor.id, advance).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(
                        %phase,
                        processor_id = %processor.id,
                        processor_phase = %processor.status.phase,
                        error = %e,
                        "Failed to reconcile processor"
                    );
                    failed += 1;
                    errors.push(e);
                }
            }
        }

        if count == 0 && failed == 0 {
            debug!("No {phase} processors");
        } else {
            debug!("Reconciled {count} {phase} processors with {failed} errors");
        }
    }

    async fn list(&self, filter: &ProcessorFilter) -> FleetResult<Vec<Processor>> {
        let mut uow = UnitOfWork::begin(self.store.as_ref()).await?;
        let result = self.processors.list(&mut uow, filter).await;
        uow.resolve(result).await
    }

    async fn reconcile_row(
        &self,
        phase: ReconcilePhase,
        filter: &ProcessorFilter,
        id: &ProcessorId,
        advance: bool,
    ) -> FleetResult<bool> {
        let mut uow = UnitOfWork::begin(self.store.as_ref()).await?;
        let result = async {
            let Some(processor) = uow.get_processor(id).await? else {
                return Ok(false);
            };
            if !filter.matches(&processor) {
                return Ok(false);
            }

            match phase {
                ReconcilePhase::Preparing => self.reconcile_preparing(&mut uow, processor).await?,
                ReconcilePhase::Deprovisioning => {
                    self.reconcile_deprovisioning(&mut uow, processor).await?
                }
                ReconcilePhase::Deleted => {
                    self.processors.delete(&mut uow, &processor.id).await?;
                }
                ReconcilePhase::Updated => self.reconcile_updated(&mut uow, processor, advance).await?,
            }
            Ok::<_, FleetError>(true)
        }
        .await;
        uow.resolve(result).await
    }

    /// Resolve the namespace and create the deployment. A namespace that
    /// does not exist yet or is not Ready fails the row, which is retried
    /// next tick.
    async fn reconcile_preparing<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        mut processor: Processor,
    ) -> FleetResult<()> {
        let namespace = self
            .namespaces
            .get(uow, &processor.namespace_id)
            .await
            .map_err(|e| e.context(format_args!("namespace of processor {}", processor.id)))?;
        if namespace.phase != NamespacePhase::Ready {
            return Err(FleetError::Validation(format!(
                "namespace {} of processor {} is {}, not ready",
                namespace.id, processor.id, namespace.phase
            )));
        }
        let shard_metadata = self
            .processor_types
            .latest_shard_metadata(uow, &processor.processor_type_id, &processor.channel)
            .await?;

        processor.status.phase = ProcessorPhase::Prepared;
        processor.status.namespace_id = Some(namespace.id.clone());
        self.processors
            .save_status(uow, &processor.id, &processor.status)
            .await?;

        let now = Utc::now();
        self.processors
            .create_deployment(
                uow,
                ProcessorDeployment {
                    id: DeploymentId::generate(),
                    processor_id: processor.id.clone(),
                    cluster_id: namespace.cluster_id,
                    namespace_id: namespace.id,
                    processor_version: processor.version,
                    shard_metadata_id: shard_metadata.id,
                    version: 0,
                    status: DeploymentStatus::new(ProcessorPhase::Prepared),
                    created_at: now,
                    updated_at: now,
                },
            )
            .await?;
        Ok(())
    }

    /// Once the agent reports the deployment Deleted, drop it and mark the
    /// processor Deleted for the next phase to remove
    async fn reconcile_deprovisioning<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        mut processor: Processor,
    ) -> FleetResult<()> {
        if let Some(deployment) = uow.get_processor_deployment_by_processor(&processor.id).await? {
            if deployment.status.phase != ProcessorPhase::Deleted {
                return Ok(());
            }
            self.processors.delete_deployment(uow, &deployment.id).await?;
        }

        processor.status.phase = ProcessorPhase::Deleted;
        self.processors
            .save_status(uow, &processor.id, &processor.status)
            .await
    }

    async fn reconcile_updated<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        processor: Processor,
        advance: bool,
    ) -> FleetResult<()> {
        match uow.get_processor_deployment_by_processor(&processor.id).await? {
            Some(mut deployment) if deployment.processor_version != processor.version => {
                deployment.processor_version = processor.version;
                self.processors
                    .update_deployment(uow, deployment)
                    .await
                    .map_err(|e| e.context(format_args!("processor {}", processor.id)))?;
            }
            _ => {}
        }

        if advance {
            let last_version = self.last_version.clone();
            let version = processor.version;
            uow.register_post_commit(move || {
                last_version.fetch_max(version, Ordering::SeqCst);
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<S: FleetStore> Reconciler for ProcessorManager<S> {
    fn worker_type(&self) -> &'static str {
        worker_type::PROCESSOR
    }

    #[instrument(skip(self))]
    async fn reconcile(&self) -> Vec<FleetError> {
        debug!("Reconciling processors");
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
    use crate::storage::{DeploymentRepository, InMemoryStore, NamespaceRepository};
    use crate::vault::InMemoryVault;
    use fleet_types::{CatalogTypeId, ClusterId, ConnectorNamespace, NamespaceId, NamespaceTenant};
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Fixture {
        store: Arc<InMemoryStore>,
        manager: ProcessorManager<InMemoryStore>,
        services: FleetServices,
    }

    async fn create_fixture() -> Fixture {
        let mut channels = BTreeMap::new();
        channels.insert(
            "stable".to_string(),
            ChannelConfig {
                shard_metadata: json!({ "processor_revision": 1 }),
            },
        );
        let mut config = DaemonConfig::default();
        config.catalog.processors.push(CatalogEntry {
            id: "filter_0.1".into(),
            name: "Filter".into(),
            description: String::new(),
            channels,
        });

        let signals: Arc<dyn SignalBus> = Arc::new(InMemorySignalBus::new());
        let services =
            FleetServices::new(&config, signals, Arc::new(InMemoryVault::new())).unwrap();
        let store = Arc::new(InMemoryStore::new());

        let mut uow = UnitOfWork::begin(store.as_ref()).await.unwrap();
        services
            .processor_types
            .reconcile_catalog_entries(&mut uow)
            .await
            .unwrap();
        uow.commit().await.unwrap();

        Fixture {
            manager: ProcessorManager::new(store.clone(), &services),
            store,
            services,
        }
    }

    async fn insert_processor(store: &InMemoryStore, namespace_phase: Option<NamespacePhase>) -> Processor {
        let mut uow = UnitOfWork::begin(store).await.unwrap();
        if let Some(phase) = namespace_phase {
            let mut namespace = ConnectorNamespace::new(
                NamespaceId::new("n1"),
                "n1",
                ClusterId::new("k1"),
                "alice",
                NamespaceTenant::User("alice".into()),
            );
            namespace.phase = phase;
            uow.insert_namespace(namespace).await.unwrap();
        }
        let processor = uow
            .insert_processor(Processor::new(
                ProcessorId::new("p1"),
                "p1",
                "alice",
                CatalogTypeId::new("filter_0.1"),
                "stable",
                NamespaceId::new("n1"),
            ))
            .await
            .unwrap();
        uow.commit().await.unwrap();
        processor
    }

    async fn load(store: &InMemoryStore) -> (Option<Processor>, Option<ProcessorDeployment>) {
        let mut uow = UnitOfWork::begin(store).await.unwrap();
        let id = ProcessorId::new("p1");
        (
            uow.get_processor(&id).await.unwrap(),
            uow.get_processor_deployment_by_processor(&id).await.unwrap(),
        )
    }

    #[tokio::test]
    async fn test_preparing_processor_gets_deployment() {
        let f = create_fixture().await;
        let created = insert_processor(&f.store, Some(NamespacePhase::Ready)).await;

        assert!(f.manager.reconcile().await.is_empty());
        let (processor, deployment) = load(&f.store).await;
        let processor = processor.unwrap();
        assert_eq!(processor.status.phase, ProcessorPhase::Prepared);
        assert_eq!(processor.status.namespace_id, Some(NamespaceId::new("n1")));
        let deployment = deployment.unwrap();
        assert_eq!(deployment.cluster_id, ClusterId::new("k1"));
        assert_eq!(deployment.processor_version, created.version);

        // Idempotent second pass
        assert!(f.manager.reconcile().await.is_empty());
        let (_, again) = load(&f.store).await;
        assert_eq!(again.unwrap().version, deployment.version);
    }

    #[tokio::test]
    async fn test_missing_namespace_is_retried() {
        let f = create_fixture().await;
        insert_processor(&f.store, None).await;

        let errors = f.manager.reconcile().await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_not_found());

        let (processor, deployment) = load(&f.store).await;
        assert_eq!(processor.unwrap().status.phase, ProcessorPhase::Preparing);
        assert!(deployment.is_none());
    }

    #[tokio::test]
    async fn test_namespace_must_be_ready() {
        let f = create_fixture().await;
        insert_processor(&f.store, Some(NamespacePhase::Disconnected)).await;

        let errors = f.manager.reconcile().await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], FleetError::Validation(_)));
        let (processor, deployment) = load(&f.store).await;
        assert_eq!(processor.unwrap().status.phase, ProcessorPhase::Preparing);
        assert!(deployment.is_none());

        let mut uow = UnitOfWork::begin(f.store.as_ref()).await.unwrap();
        let mut namespace = uow.get_namespace(&NamespaceId::new("n1")).await.unwrap().unwrap();
        namespace.phase = NamespacePhase::Ready;
        uow.update_namespace(namespace).await.unwrap();
        uow.commit().await.unwrap();

        assert!(f.manager.reconcile().await.is_empty());
        let (processor, deployment) = load(&f.store).await;
        assert_eq!(processor.unwrap().status.phase, ProcessorPhase::Prepared);
        assert!(deployment.is_some());
    }

    #[tokio::test]
    async fn test_deprovisioned_processor_is_removed() {
        let f = create_fixture().await;
        insert_processor(&f.store, Some(NamespacePhase::Ready)).await;
        assert!(f.manager.reconcile().await.is_empty());

        let mut uow = UnitOfWork::begin(f.store.as_ref()).await.unwrap();
        let result = f
            .services
            .processors
            .apply_operation(&mut uow, &ProcessorId::new("p1"), fleet_types::ProcessorOperation::Delete)
            .await;
        uow.resolve(result).await.unwrap();

        // The agent has not confirmed yet
        assert!(f.manager.reconcile().await.is_empty());
        let (processor, deployment) = load(&f.store).await;
        assert_eq!(processor.unwrap().status.phase, ProcessorPhase::Deprovisioning);
        let deployment = deployment.unwrap();

        let mut status = DeploymentStatus::new(ProcessorPhase::Deleted);
        status.version = 1;
        let mut uow = UnitOfWork::begin(f.store.as_ref()).await.unwrap();
        uow.save_processor_deployment_status(&deployment.id, &status)
            .await
            .unwrap();
        uow.commit().await.unwrap();

        // Deprovisioning and deleted run in the same tick
        assert!(f.manager.reconcile().await.is_empty());
        let (processor, deployment) = load(&f.store).await;
        assert!(processor.is_none());
        assert!(deployment.is_none());
    }
}
