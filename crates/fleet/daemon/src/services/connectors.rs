//! Connector service

use super::notify_after_commit;
use crate::error::{FleetError, FleetResult};
use crate::signalbus::{cluster_deployments_signal, reconcile_signal, worker_type, SignalBus};
use crate::storage::{ConnectorFilter, FleetTx};
use crate::transaction::UnitOfWork;
use crate::vault::VaultService;
use fleet_types::{
    Connector, ConnectorDesiredState, ConnectorId, ConnectorOperation, ConnectorPhase,
    ConnectorStatus, NamespaceId, NamespacePhase,
};
use std::sync::Arc;

/// Connector rows and their lifecycle operations
pub struct ConnectorsService {
    signals: Arc<dyn SignalBus>,
    vault: Arc<dyn VaultService>,
}

impl ConnectorsService {
    pub fn new(signals: Arc<dyn SignalBus>, vault: Arc<dyn VaultService>) -> Self {
        Self { signals, vault }
    }

    /// Insert a connector in phase Assigning
    pub async fn create<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        mut connector: Connector,
    ) -> FleetResult<Connector> {
        let namespace_phase = namespace_phase(uow, connector.namespace_id.as_ref()).await?;
        ConnectorOperation::Create.perform(namespace_phase, &mut connector.desired_state)?;
        connector.status = ConnectorStatus::assigning();

        let created = uow.insert_connector(connector).await?;
        tracing::debug!(connector_id = %created.id, version = created.version, "Connector created");
        notify_after_commit(uow, &self.signals, reconcile_signal(worker_type::CONNECTOR));
        Ok(created)
    }

    pub async fn get<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &ConnectorId,
    ) -> FleetResult<Connector> {
        uow.get_connector(id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("connector {id}")))
    }

    /// Matching connectors by ascending version
    pub async fn list<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        filter: &ConnectorFilter,
    ) -> FleetResult<Vec<Connector>> {
        Ok(uow.list_connectors(filter).await?)
    }

    /// Version-checked update of a user edit
    pub async fn update<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        mut connector: Connector,
    ) -> FleetResult<Connector> {
        let namespace_phase = namespace_phase(uow, connector.namespace_id.as_ref()).await?;
        ConnectorOperation::Update.perform(namespace_phase, &mut connector.desired_state)?;

        let updated = uow.update_connector(connector).await?;
        notify_after_commit(uow, &self.signals, reconcile_signal(worker_type::CONNECTOR));
        Ok(updated)
    }

    pub async fn save_status<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &ConnectorId,
        status: &ConnectorStatus,
    ) -> FleetResult<()> {
        uow.save_connector_status(id, status).await?;
        Ok(())
    }

    /// Change the desired state of a connector.
    ///
    /// Leaving the namespace (unassign or delete) tears a live deployment
    /// down first: the deployment status goes to Deleting and its agent is
    /// woken. Without a deployment the connector moves straight on.
    pub async fn apply_operation<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &ConnectorId,
        operation: ConnectorOperation,
    ) -> FleetResult<Connector> {
        let mut connector = self.get(uow, id).await?;
        let namespace_phase = namespace_phase(uow, connector.namespace_id.as_ref()).await?;
        if !operation.perform(namespace_phase, &mut connector.desired_state)? {
            return Ok(connector);
        }

        if matches!(
            connector.desired_state,
            ConnectorDesiredState::Unassigned | ConnectorDesiredState::Deleted
        ) {
            match uow.get_connector_deployment_by_connector(id).await? {
                Some(mut deployment) => {
                    connector.status.phase = ConnectorPhase::Deleting;
                    deployment.status.phase = ConnectorPhase::Deleting;
                    uow.save_connector_deployment_status(&deployment.id, &deployment.status)
                        .await?;
                    notify_after_commit(
                        uow,
                        &self.signals,
                        cluster_deployments_signal(&deployment.cluster_id),
                    );
                }
                None if connector.desired_state == ConnectorDesiredState::Unassigned => {
                    connector.namespace_id = None;
                    connector.status = ConnectorStatus::assigning();
                }
                None => {
                    if let Some(phase) = connector.desired_state.starting_phase() {
                        connector.status.phase = phase;
                    }
                }
            }
        }

        let updated = uow.update_connector(connector).await?;
        tracing::info!(
            connector_id = %id,
            operation = operation.as_str(),
            desired_state = %updated.desired_state,
            phase = %updated.status.phase,
            "Connector operation applied"
        );
        notify_after_commit(uow, &self.signals, reconcile_signal(worker_type::CONNECTOR));
        Ok(updated)
    }

    /// Delete the row. Secrets referenced by the connector are removed from
    /// the vault after commit; vault failures are logged only.
    pub async fn delete<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &ConnectorId,
    ) -> FleetResult<Connector> {
        let connector = self.get(uow, id).await?;
        uow.delete_connector(id).await?;

        let vault = self.vault.clone();
        let secret_refs = connector.secret_refs.clone();
        let connector_id = connector.id.clone();
        uow.register_post_commit_task(async move {
            for secret_ref in secret_refs {
                if let Err(e) = vault.delete_secret_string(&secret_ref).await {
                    tracing::error!(
                        connector_id = %connector_id,
                        secret_ref = %secret_ref,
                        vault = vault.kind(),
                        error = %e,
                        "Failed to delete vault secret"
                    );
                }
            }
        });

        tracing::info!(connector_id = %id, "Connector deleted");
        Ok(connector)
    }
}

/// Phase gating operations on a workload. An unplaced workload is gated as
/// if its namespace were Ready.
pub(crate) async fn namespace_phase<T: FleetTx>(
    uow: &mut UnitOfWork<T>,
    namespace_id: Option<&NamespaceId>,
) -> FleetResult<NamespacePhase> {
    match namespace_id {
        None => Ok(NamespacePhase::Ready),
        Some(id) => uow
            .get_namespace(id)
            .await?
            .map(|namespace| namespace.phase)
            .ok_or_else(|| FleetError::NotFound(format!("namespace {id}"))),
    }
}
