//! Daemon setup and lifecycle management

use crate::config::{DaemonConfig, StorageConfig, WorkerConfig};
use crate::error::DaemonResult;
use crate::services::FleetServices;
use crate::signalbus::{InMemorySignalBus, PgSignalBus, SignalBus};
use crate::storage::{FleetStore, InMemoryStore, PostgresStore};
use crate::vault::{InMemoryVault, VaultService};
use crate::workers::{
    CatalogTypeManager, ClusterManager, ConnectorManager, NamespaceManager, ProcessorManager,
    ReadinessGate, Worker,
};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Every reconcile worker of one daemon
pub struct FleetWorkers<S: FleetStore> {
    connector_types: Worker<CatalogTypeManager<S>>,
    processor_types: Worker<CatalogTypeManager<S>>,
    connectors: Worker<ConnectorManager<S>>,
    processors: Worker<ProcessorManager<S>>,
    clusters: Worker<ClusterManager<S>>,
    namespaces: Worker<NamespaceManager<S>>,
}

impl<S: FleetStore> FleetWorkers<S> {
    pub fn new(
        store: Arc<S>,
        services: &FleetServices,
        signals: Arc<dyn SignalBus>,
        config: &WorkerConfig,
    ) -> Self {
        let interval = config.reconcile_interval();
        let check_interval = config.catalog_check_interval();

        Self {
            connector_types: Worker::new(
                Arc::new(CatalogTypeManager::new(
                    store.clone(),
                    services.connector_types.clone(),
                    check_interval,
                )),
                signals.clone(),
                interval,
            ),
            processor_types: Worker::new(
                Arc::new(CatalogTypeManager::new(
                    store.clone(),
                    services.processor_types.clone(),
                    check_interval,
                )),
                signals.clone(),
                interval,
            ),
            connectors: Worker::new(
                Arc::new(ConnectorManager::new(store.clone(), services)),
                signals.clone(),
                interval,
            ),
            processors: Worker::new(
                Arc::new(ProcessorManager::new(store.clone(), services)),
                signals.clone(),
                interval,
            ),
            clusters: Worker::new(
                Arc::new(ClusterManager::new(store.clone(), services)),
                signals.clone(),
                interval,
            ),
            namespaces: Worker::new(
                Arc::new(NamespaceManager::new(store, services)),
                signals,
                interval,
            ),
        }
    }

    /// Gates that must open before API traffic is served
    pub fn readiness(&self) -> Vec<ReadinessGate> {
        vec![
            self.connector_types.reconciler().readiness(),
            self.processor_types.reconciler().readiness(),
        ]
    }

    /// Start every worker and the catalog readiness pollers
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.connector_types.start();
        self.processor_types.start();
        self.connectors.start();
        self.processors.start();
        self.clusters.start();
        self.namespaces.start();

        vec![
            self.connector_types.reconciler().spawn_readiness_check(),
            self.processor_types.reconciler().spawn_readiness_check(),
        ]
    }

    /// Stop every worker, waiting for each loop to exit
    pub async fn stop(&self) {
        self.connector_types.stop().await;
        self.processor_types.stop().await;
        self.connectors.stop().await;
        self.processors.stop().await;
        self.clusters.stop().await;
        self.namespaces.stop().await;
    }
}

/// Fleet daemon
pub struct Server {
    config: DaemonConfig,
}

impl Server {
    pub fn new(config: DaemonConfig) -> Self {
        Self { config }
    }

    /// Run until SIGINT/SIGTERM
    pub async fn run(self) -> DaemonResult<()> {
        match &self.config.storage {
            StorageConfig::Memory => {
                tracing::info!("Using in-memory storage");
                let store = Arc::new(InMemoryStore::new());
                let signals: Arc<dyn SignalBus> = Arc::new(InMemorySignalBus::new());
                self.run_with(store, signals).await
            }
            StorageConfig::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => {
                tracing::info!("Connecting to PostgreSQL");
                let store = PostgresStore::new(url, *max_connections, *connect_timeout_secs).await?;
                let bus = Arc::new(PgSignalBus::new(
                    store.pool().clone(),
                    self.config.signal_bus.clone(),
                ));
                bus.start();

                let result = self.run_with(Arc::new(store), bus.clone()).await;
                bus.stop().await;
                result
            }
        }
    }

    async fn run_with<S: FleetStore>(&self, store: Arc<S>, signals: Arc<dyn SignalBus>) -> DaemonResult<()> {
        let vault: Arc<dyn VaultService> = Arc::new(InMemoryVault::new());
        tracing::info!(vault = vault.kind(), "Vault configured");

        let services = FleetServices::new(&self.config, signals.clone(), vault)?;
        let workers = FleetWorkers::new(store, &services, signals, &self.config.workers);
        let pollers = workers.start();

        let gates = workers.readiness();
        let ready = futures::future::join_all(gates.iter().map(ReadinessGate::wait));
        let interrupted = tokio::select! {
            _ = ready => {
                tracing::info!("Fleet manager ready");
                false
            }
            _ = shutdown_signal() => true,
        };
        if !interrupted {
            shutdown_signal().await;
        }

        tracing::info!("Fleet manager shutting down");
        for poller in pollers {
            poller.abort();
        }
        workers.stop().await;
        Ok(())
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
