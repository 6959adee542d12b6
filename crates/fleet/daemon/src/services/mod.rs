//! Domain services
//!
//! Services apply the lifecycle rules on top of the repositories and
//! register the signals a change must raise once it commits. Methods that
//! touch a single row run inside a caller-provided [`UnitOfWork`], so a
//! reconcile step can combine several calls in one transaction. Batch
//! methods take the store and open one unit per row.

mod catalog;
mod clusters;
mod connectors;
mod namespaces;
mod processors;

pub use catalog::{shard_metadata_revision, CatalogTypesService};
pub use clusters::ConnectorClusterService;
pub use connectors::ConnectorsService;
pub use namespaces::ConnectorNamespaceService;
pub use processors::ProcessorsService;

use crate::config::DaemonConfig;
use crate::error::FleetResult;
use crate::signalbus::SignalBus;
use crate::storage::FleetTx;
use crate::transaction::UnitOfWork;
use crate::vault::VaultService;
use fleet_types::CatalogKind;
use std::sync::Arc;

/// Raise `name` once `uow` commits
pub(crate) fn notify_after_commit<T: FleetTx>(
    uow: &mut UnitOfWork<T>,
    signals: &Arc<dyn SignalBus>,
    name: String,
) {
    let signals = signals.clone();
    uow.register_post_commit(move || signals.notify(&name));
}

/// Every service, wired once at startup
#[derive(Clone)]
pub struct FleetServices {
    pub connectors: Arc<ConnectorsService>,
    pub processors: Arc<ProcessorsService>,
    pub clusters: Arc<ConnectorClusterService>,
    pub namespaces: Arc<ConnectorNamespaceService>,
    pub connector_types: Arc<CatalogTypesService>,
    pub processor_types: Arc<CatalogTypesService>,
}

impl FleetServices {
    /// Build the services. Fails when the configured catalog cannot be read.
    pub fn new(
        config: &DaemonConfig,
        signals: Arc<dyn SignalBus>,
        vault: Arc<dyn VaultService>,
    ) -> FleetResult<Self> {
        let connectors = Arc::new(ConnectorsService::new(signals.clone(), vault.clone()));
        let processors = Arc::new(ProcessorsService::new(signals.clone(), vault.clone()));
        let namespaces = Arc::new(ConnectorNamespaceService::new(
            signals.clone(),
            &config.namespaces,
        ));
        let clusters = Arc::new(ConnectorClusterService::new(
            signals,
            vault,
            connectors.clone(),
            namespaces.clone(),
        ));
        let connector_types = Arc::new(CatalogTypesService::new(
            CatalogKind::Connector,
            config.catalog.connector_entries()?,
        )?);
        let processor_types = Arc::new(CatalogTypesService::new(
            CatalogKind::Processor,
            config.catalog.processor_entries()?,
        )?);

        Ok(Self {
            connectors,
            processors,
            clusters,
            namespaces,
            connector_types,
            processor_types,
        })
    }
}
