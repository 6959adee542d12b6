//! Catalog type manager
//!
//! Converges the persisted catalog with the configured one once per process
//! start, then terminates. A separate poller releases the readiness gate the
//! first time it sees every configured type persisted with its current
//! checksum, which also covers a peer replica having done the work.

use super::{ReadinessGate, Reconciler};
use crate::error::{FleetError, FleetResult};
use crate::services::CatalogTypesService;
use crate::signalbus::worker_type;
use crate::storage::FleetStore;
use crate::transaction::UnitOfWork;
use async_trait::async_trait;
use fleet_types::CatalogKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

pub struct CatalogTypeManager<S> {
    store: Arc<S>,
    types: Arc<CatalogTypesService>,
    done: Arc<AtomicBool>,
    gate: ReadinessGate,
    check_interval: Duration,
}

impl<S: FleetStore> CatalogTypeManager<S> {
    pub fn new(store: Arc<S>, types: Arc<CatalogTypesService>, check_interval: Duration) -> Self {
        Self {
            store,
            types,
            done: Arc::new(AtomicBool::new(false)),
            gate: ReadinessGate::new(),
            check_interval,
        }
    }

    /// The gate the API bootstrap waits on before serving requests
    pub fn readiness(&self) -> ReadinessGate {
        self.gate.clone()
    }

    pub fn kind(&self) -> CatalogKind {
        self.types.kind()
    }

    /// Poll catalog convergence until the gate opens
    pub fn spawn_readiness_check(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let types = self.types.clone();
        let done = self.done.clone();
        let gate = self.gate.clone();
        let check_interval = self.check_interval;

        tokio::spawn(async move {
            let kind = types.kind();
            while !gate.is_released() {
                if done.load(Ordering::SeqCst) {
                    gate.release();
                    break;
                }
                debug!(%kind, "Waiting for startup catalog updates");

                match check_reconciled(store.as_ref(), &types).await {
                    Ok(true) => {
                        done.store(true, Ordering::SeqCst);
                        gate.release();
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => error!(%kind, error = %e, "Error checking catalog entry checksums"),
                }

                tokio::select! {
                    _ = gate.wait() => break,
                    _ = tokio::time::sleep(check_interval) => {}
                }
            }
            info!(%kind, "Catalog ready");
        })
    }

    async fn reconcile_catalog(&self) -> FleetResult<()> {
        let mut uow = UnitOfWork::begin(self.store.as_ref()).await?;
        let result = async {
            let (deleted, deprecated) = self.types.delete_or_deprecate_removed_types(&mut uow).await?;
            self.types.reconcile_catalog_entries(&mut uow).await?;
            let cleaned = self.types.cleanup_dangling_deployments(&mut uow).await?;
            debug!(deleted, deprecated, cleaned, "Catalog changes applied");
            Ok::<_, FleetError>(())
        }
        .await;
        uow.resolve(result).await
    }
}

async fn check_reconciled<S: FleetStore>(store: &S, types: &CatalogTypesService) -> FleetResult<bool> {
    let mut uow = UnitOfWork::begin(store).await?;
    let result = types.catalog_entries_reconciled(&mut uow).await;
    uow.resolve(result).await
}

#[async_trait]
impl<S: FleetStore> Reconciler for CatalogTypeManager<S> {
    fn worker_type(&self) -> &'static str {
        match self.types.kind() {
            CatalogKind::Connector => worker_type::CONNECTOR_TYPE,
            CatalogKind::Processor => worker_type::PROCESSOR_TYPE,
        }
    }

    #[instrument(skip(self), fields(kind = %self.types.kind()))]
    async fn reconcile(&self) -> Vec<FleetError> {
        if self.done.load(Ordering::SeqCst) {
            return Vec::new();
        }

        debug!("Reconciling startup catalog updates");
        if let Err(e) = self.reconcile_catalog().await {
            return vec![e];
        }

        self.done.store(true, Ordering::SeqCst);
        self.gate.release();
        info!("Catalog updates processed");
        Vec::new()
    }

    fn has_terminated(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CatalogEntry, ChannelConfig};
    use crate::storage::InMemoryStore;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn create_test_types(revision: serde_json::Value) -> Arc<CatalogTypesService> {
        let mut channels = BTreeMap::new();
        channels.insert(
            "stable".to_string(),
            ChannelConfig {
                shard_metadata: json!({ "connector_revision": revision }),
            },
        );
        let entry = CatalogEntry {
            id: "log_sink_0.1".into(),
            name: "Log sink".into(),
            description: String::new(),
            channels,
        };
        Arc::new(CatalogTypesService::new(CatalogKind::Connector, vec![entry]).unwrap())
    }

    #[tokio::test]
    async fn test_reconcile_releases_gate_and_terminates() {
        let store = Arc::new(InMemoryStore::new());
        let manager = CatalogTypeManager::new(store, create_test_types(json!(1)), Duration::from_secs(5));
        assert_eq!(manager.worker_type(), "connector_type");
        assert!(!manager.has_terminated());

        assert!(manager.reconcile().await.is_empty());
        assert!(manager.has_terminated());
        assert!(manager.readiness().is_released());
    }

    #[tokio::test]
    async fn test_bad_catalog_keeps_gate_closed() {
        let store = Arc::new(InMemoryStore::new());
        let manager =
            CatalogTypeManager::new(store, create_test_types(json!("one")), Duration::from_secs(5));

        let errors = manager.reconcile().await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], FleetError::Catalog(_)));
        assert!(!manager.has_terminated());
        assert!(!manager.readiness().is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_sees_convergence_done_elsewhere() {
        let store = Arc::new(InMemoryStore::new());
        let types = create_test_types(json!(1));
        let peer = CatalogTypeManager::new(store.clone(), types.clone(), Duration::from_secs(5));
        let manager = CatalogTypeManager::new(store, types, Duration::from_secs(5));

        let poller = manager.spawn_readiness_check();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!manager.readiness().is_released());

        // A peer replica converges the shared database
        assert!(peer.reconcile().await.is_empty());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(manager.readiness().is_released());
        assert!(manager.has_terminated());
        poller.await.unwrap();
    }
}
