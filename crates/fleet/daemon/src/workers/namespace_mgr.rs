//! Namespace manager
//!
//! Reaps expired evaluation namespaces and removes Deleting namespaces no
//! workload uses any more.

use super::Reconciler;
use crate::error::{FleetError, FleetResult};
use crate::services::{ConnectorNamespaceService, FleetServices};
use crate::signalbus::worker_type;
use crate::storage::{FleetStore, NamespaceFilter};
use crate::transaction::UnitOfWork;
use async_trait::async_trait;
use fleet_types::NamespaceId;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

pub struct NamespaceManager<S> {
    store: Arc<S>,
    namespaces: Arc<ConnectorNamespaceService>,
}

impl<S: FleetStore> NamespaceManager<S> {
    pub fn new(store: Arc<S>, services: &FleetServices) -> Self {
        Self {
            store,
            namespaces: services.namespaces.clone(),
        }
    }

    async fn expired_namespace_ids(&self) -> FleetResult<Vec<NamespaceId>> {
        let mut uow = UnitOfWork::begin(self.store.as_ref()).await?;
        let result = self.namespaces.get_expired_namespace_ids(&mut uow).await;
        uow.resolve(result).await
    }

    async fn delete_expired(&self, id: &NamespaceId) -> FleetResult<()> {
        let filter = NamespaceFilter {
            ids: vec![id.clone()],
            ..Default::default()
        };
        let mut uow = UnitOfWork::begin(self.store.as_ref()).await?;
        let result = self
            .namespaces
            .delete_namespace_and_connector_deployments(&mut uow, &filter)
            .await
            .map(|_| ());
        uow.resolve(result).await
    }
}

#[async_trait]
impl<S: FleetStore> Reconciler for NamespaceManager<S> {
    fn worker_type(&self) -> &'static str {
        worker_type::CONNECTOR_NAMESPACE
    }

    #[instrument(skip(self))]
    async fn reconcile(&self) -> Vec<FleetError> {
        let mut errors = Vec::new();

        match self.expired_namespace_ids().await {
            Ok(ids) if ids.is_empty() => debug!("No expired namespaces"),
            Ok(ids) => {
                let mut expired = 0;
                let mut failed = 0;
                for id in ids {
                    match self.delete_expired(&id).await {
                        Ok(()) => expired += 1,
                        Err(e) => {
                            error!(namespace_id = %id, error = %e, "Failed to delete expired namespace");
                            failed += 1;
                            errors.push(e);
                        }
                    }
                }
                info!(expired, failed, "Deleted expired namespaces");
            }
            Err(e) => {
                error!(error = %e, "Failed to get expired namespaces");
                errors.push(e);
            }
        }

        let (removed, remove_errors) = self
            .namespaces
            .reconcile_deleting_namespaces(self.store.as_ref())
            .await;
        if removed > 0 || !remove_errors.is_empty() {
            info!(removed, failed = remove_errors.len(), "Removed deleting namespaces");
        }
        errors.extend(remove_errors);
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::signalbus::InMemorySignalBus;
    use crate::storage::{InMemoryStore, NamespaceRepository};
    use crate::vault::InMemoryVault;
    use chrono::{Duration, Utc};
    use fleet_types::{ClusterId, ConnectorNamespace, NamespacePhase, NamespaceTenant};

    #[tokio::test]
    async fn test_unexpired_namespace_is_kept() {
        let services = FleetServices::new(
            &DaemonConfig::default(),
            Arc::new(InMemorySignalBus::new()),
            Arc::new(InMemoryVault::new()),
        )
        .unwrap();
        let store = Arc::new(InMemoryStore::new());
        let mut namespace = ConnectorNamespace::new(
            NamespaceId::new("n1"),
            "n1",
            ClusterId::new("k1"),
            "alice",
            NamespaceTenant::User("alice".into()),
        );
        namespace.phase = NamespacePhase::Ready;
        namespace.expiration = Some(Utc::now() + Duration::hours(1));
        let mut uow = UnitOfWork::begin(store.as_ref()).await.unwrap();
        uow.insert_namespace(namespace).await.unwrap();
        uow.commit().await.unwrap();

        let manager = NamespaceManager::new(store.clone(), &services);
        assert!(manager.reconcile().await.is_empty());

        let mut uow = UnitOfWork::begin(store.as_ref()).await.unwrap();
        let namespace = uow.get_namespace(&NamespaceId::new("n1")).await.unwrap().unwrap();
        assert_eq!(namespace.phase, NamespacePhase::Ready);
    }
}
