//! Processor service

use super::connectors::namespace_phase;
use super::notify_after_commit;
use crate::error::{FleetError, FleetResult};
use crate::signalbus::{cluster_deployments_signal, reconcile_signal, worker_type, SignalBus};
use crate::storage::{FleetTx, ProcessorFilter};
use crate::transaction::UnitOfWork;
use crate::vault::VaultService;
use fleet_types::{
    DeploymentId, DeploymentStatus, Processor, ProcessorDeployment, ProcessorDesiredState,
    ProcessorId, ProcessorOperation, ProcessorPhase, ProcessorStatus,
};
use std::sync::Arc;

/// Processor rows, their deployments and lifecycle operations
pub struct ProcessorsService {
    signals: Arc<dyn SignalBus>,
    vault: Arc<dyn VaultService>,
}

impl ProcessorsService {
    pub fn new(signals: Arc<dyn SignalBus>, vault: Arc<dyn VaultService>) -> Self {
        Self { signals, vault }
    }

    /// Insert a processor in phase Preparing. Its namespace must exist.
    pub async fn create<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        mut processor: Processor,
    ) -> FleetResult<Processor> {
        let namespace_phase = namespace_phase(uow, Some(&processor.namespace_id)).await?;
        ProcessorOperation::Create.perform(namespace_phase, &mut processor.desired_state)?;
        processor.status = ProcessorStatus {
            phase: ProcessorOperation::Create.starting_phase(),
            namespace_id: None,
            conditions: Vec::new(),
        };

        let created = uow.insert_processor(processor).await?;
        tracing::debug!(processor_id = %created.id, version = created.version, "Processor created");
        notify_after_commit(uow, &self.signals, reconcile_signal(worker_type::PROCESSOR));
        Ok(created)
    }

    pub async fn get<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &ProcessorId,
    ) -> FleetResult<Processor> {
        uow.get_processor(id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("processor {id}")))
    }

    pub async fn list<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        filter: &ProcessorFilter,
    ) -> FleetResult<Vec<Processor>> {
        Ok(uow.list_processors(filter).await?)
    }

    /// Version-checked update of a user edit. A processor not deployed yet
    /// stays Preparing and is deployed with the edited version.
    pub async fn update<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        mut processor: Processor,
    ) -> FleetResult<Processor> {
        let namespace_phase = namespace_phase(uow, Some(&processor.namespace_id)).await?;
        ProcessorOperation::Update.perform(namespace_phase, &mut processor.desired_state)?;
        let deployed = uow
            .get_processor_deployment_by_processor(&processor.id)
            .await?
            .is_some();
        if deployed {
            processor.status.phase = ProcessorOperation::Update.starting_phase();
        }

        let updated = uow.update_processor(processor).await?;
        notify_after_commit(uow, &self.signals, reconcile_signal(worker_type::PROCESSOR));
        Ok(updated)
    }

    pub async fn save_status<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &ProcessorId,
        status: &ProcessorStatus,
    ) -> FleetResult<()> {
        uow.save_processor_status(id, status).await?;
        Ok(())
    }

    /// Change the desired state of a processor and move it to the phase the
    /// operation starts in
    pub async fn apply_operation<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &ProcessorId,
        operation: ProcessorOperation,
    ) -> FleetResult<Processor> {
        let mut processor = self.get(uow, id).await?;
        let namespace_phase = namespace_phase(uow, Some(&processor.namespace_id)).await?;
        if !operation.perform(namespace_phase, &mut processor.desired_state)?
            && operation != ProcessorOperation::Restart
        {
            return Ok(processor);
        }

        let deployment = uow.get_processor_deployment_by_processor(id).await?;
        processor.status.phase = match (&deployment, operation) {
            // Nothing was deployed, so there is nothing to prepare again
            (None, ProcessorOperation::Delete) => ProcessorPhase::Deleted,
            (Some(_), ProcessorOperation::Delete) => ProcessorPhase::Deprovisioning,
            (None, _) if processor.status.phase == ProcessorPhase::Preparing => {
                ProcessorPhase::Preparing
            }
            _ => operation.starting_phase(),
        };
        if let Some(deployment) = deployment {
            notify_after_commit(
                uow,
                &self.signals,
                cluster_deployments_signal(&deployment.cluster_id),
            );
        }

        let updated = uow.update_processor(processor).await?;
        tracing::info!(
            processor_id = %id,
            operation = operation.as_str(),
            desired_state = %updated.desired_state,
            phase = %updated.status.phase,
            "Processor operation applied"
        );
        notify_after_commit(uow, &self.signals, reconcile_signal(worker_type::PROCESSOR));
        Ok(updated)
    }

    /// Delete the row, removing its secrets from the vault after commit
    pub async fn delete<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &ProcessorId,
    ) -> FleetResult<Processor> {
        let processor = self.get(uow, id).await?;
        uow.delete_processor(id).await?;

        let vault = self.vault.clone();
        let secret_refs = processor.secret_refs.clone();
        let processor_id = processor.id.clone();
        uow.register_post_commit_task(async move {
            for secret_ref in secret_refs {
                if let Err(e) = vault.delete_secret_string(&secret_ref).await {
                    tracing::error!(
                        processor_id = %processor_id,
                        secret_ref = %secret_ref,
                        error = %e,
                        "Failed to delete vault secret"
                    );
                }
            }
        });

        tracing::info!(processor_id = %id, "Processor deleted");
        Ok(processor)
    }

    pub async fn get_deployment_by_processor_id<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        processor_id: &ProcessorId,
    ) -> FleetResult<ProcessorDeployment> {
        uow.get_processor_deployment_by_processor(processor_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("deployment of processor {processor_id}")))
    }

    /// Insert a deployment and wake the agent of its cluster
    pub async fn create_deployment<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        deployment: ProcessorDeployment,
    ) -> FleetResult<ProcessorDeployment> {
        let created = uow.insert_processor_deployment(deployment).await?;
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
        deployment: ProcessorDeployment,
    ) -> FleetResult<ProcessorDeployment> {
        let updated = uow.update_processor_deployment(deployment).await?;
        notify_after_commit(
            uow,
            &self.signals,
            cluster_deployments_signal(&updated.cluster_id),
        );
        Ok(updated)
    }

    pub async fn delete_deployment<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &DeploymentId,
    ) -> FleetResult<()> {
        if !uow.delete_processor_deployment(id).await? {
            return Err(FleetError::NotFound(format!("processor deployment {id}")));
        }
        Ok(())
    }

    /// Ingest a deployment status reported by an agent.
    ///
    /// The save is version-checked against the stored status version. The
    /// reported phase is mirrored onto the processor, except that a deleted
    /// deployment of a processor being deleted hands over to the processor
    /// manager through Deprovisioning.
    pub async fn update_deployment_status<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        deployment_id: &DeploymentId,
        status: DeploymentStatus<ProcessorPhase>,
    ) -> FleetResult<()> {
        let deployment = uow
            .get_processor_deployment(deployment_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("processor deployment {deployment_id}")))?;

        uow.save_processor_deployment_status(deployment_id, &status)
            .await
            .map_err(|e| match FleetError::from(e) {
                FleetError::Conflict(_) => FleetError::Conflict(
                    "probably a stale processor deployment status version".into(),
                ),
                other => other,
            })?;

        let mut processor = self.get(uow, &deployment.processor_id).await?;
        let leaving = matches!(
            processor.status.phase,
            ProcessorPhase::Deprovisioning | ProcessorPhase::Deleting | ProcessorPhase::Deleted
        );
        processor.status.phase = match (status.phase, processor.desired_state) {
            (ProcessorPhase::Deleted, ProcessorDesiredState::Deleted) => {
                ProcessorPhase::Deprovisioning
            }
            (ProcessorPhase::Deleted, ProcessorDesiredState::Stopped) => ProcessorPhase::Stopped,
            // Deletion only moves forward
            (_, _) if leaving => processor.status.phase,
            (phase, _) => phase,
        };
        processor.status.conditions = status.conditions;
        uow.save_processor_status(&processor.id, &processor.status).await?;

        notify_after_commit(uow, &self.signals, reconcile_signal(worker_type::PROCESSOR));
        Ok(())
    }
}
