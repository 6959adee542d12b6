//! Cluster manager
//!
//! Tears down Deleting clusters in two steps: their namespaces are handed
//! to deletion first, and a cluster left empty is deleted after its agent
//! credentials are revoked.

use super::Reconciler;
use crate::error::FleetError;
use crate::services::{ConnectorClusterService, FleetServices};
use crate::signalbus::worker_type;
use crate::storage::FleetStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub struct ClusterManager<S> {
    store: Arc<S>,
    clusters: Arc<ConnectorClusterService>,
}

impl<S: FleetStore> ClusterManager<S> {
    pub fn new(store: Arc<S>, services: &FleetServices) -> Self {
        Self {
            store,
            clusters: services.clusters.clone(),
        }
    }
}

#[async_trait]
impl<S: FleetStore> Reconciler for ClusterManager<S> {
    fn worker_type(&self) -> &'static str {
        worker_type::CONNECTOR_CLUSTER
    }

    #[instrument(skip(self))]
    async fn reconcile(&self) -> Vec<FleetError> {
        let (emptied, mut errors) = self
            .clusters
            .reconcile_unused_deleting_clusters(self.store.as_ref())
            .await;
        let (deleted, delete_errors) = self
            .clusters
            .reconcile_empty_deleting_clusters(self.store.as_ref())
            .await;
        errors.extend(delete_errors);

        if emptied > 0 || deleted > 0 {
            info!(emptied, deleted, errors = errors.len(), "Reconciled deleting clusters");
        } else {
            debug!(errors = errors.len(), "No deleting clusters");
        }
        errors
    }
}
