//! Lifecycle transition tables
//!
//! User-requested operations change a namespace phase or a workload desired
//! state. Which operations are permitted depends on the phase of the parent
//! (cluster for namespaces, namespace for workloads). A permitted operation
//! that leaves the state unchanged is a successful no-op.

use crate::phase::{
    ClusterPhase, ConnectorDesiredState, ConnectorPhase, NamespacePhase, ProcessorDesiredState,
    ProcessorPhase,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A requested operation is not permitted in the current state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot perform {entity} operation [{operation}] from [{from}] in {parent} phase [{parent_phase}]")]
pub struct TransitionError {
    pub entity: &'static str,
    pub operation: &'static str,
    pub from: String,
    pub parent: &'static str,
    pub parent_phase: String,
}

fn settle<S: Copy + PartialEq>(state: &mut S, destination: S) -> bool {
    if *state == destination {
        false
    } else {
        *state = destination;
        true
    }
}

/// Operations on a namespace, gated by the phase of its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceOperation {
    Create,
    Connect,
    Disconnect,
    Delete,
}

impl NamespaceOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceOperation::Create => "create",
            NamespaceOperation::Connect => "connect",
            NamespaceOperation::Disconnect => "disconnect",
            NamespaceOperation::Delete => "delete",
        }
    }

    /// Destination phase, or `None` when the operation is not permitted.
    /// `current` is `None` for a namespace that does not exist yet.
    pub fn destination(
        self,
        cluster: ClusterPhase,
        current: Option<NamespacePhase>,
    ) -> Option<NamespacePhase> {
        use NamespaceOperation as Op;
        use NamespacePhase::*;

        match (cluster, self, current) {
            (ClusterPhase::Disconnected | ClusterPhase::Ready, Op::Create, None) => {
                Some(Disconnected)
            }
            (ClusterPhase::Disconnected | ClusterPhase::Ready, Op::Disconnect, Some(Disconnected | Ready)) => {
                Some(Disconnected)
            }
            (ClusterPhase::Disconnected, Op::Delete, Some(Disconnected | Deleting)) => Some(Deleting),

            (ClusterPhase::Ready, Op::Connect, Some(Disconnected | Ready)) => Some(Ready),
            (ClusterPhase::Ready, Op::Connect, Some(Deleting)) => Some(Deleting),
            (ClusterPhase::Ready, Op::Delete, Some(Disconnected | Ready | Deleting)) => Some(Deleting),

            (ClusterPhase::Deleting, Op::Connect | Op::Delete, Some(Deleting)) => Some(Deleting),
            _ => None,
        }
    }

    /// Phase of a namespace created inside a cluster in `cluster` phase
    pub fn initial_phase(cluster: ClusterPhase) -> Result<NamespacePhase, TransitionError> {
        NamespaceOperation::Create
            .destination(cluster, None)
            .ok_or_else(|| TransitionError {
                entity: "namespace",
                operation: NamespaceOperation::Create.as_str(),
                from: String::new(),
                parent: "cluster",
                parent_phase: cluster.to_string(),
            })
    }

    /// Apply the operation. Returns whether the phase changed.
    pub fn perform(
        self,
        cluster: ClusterPhase,
        phase: &mut NamespacePhase,
    ) -> Result<bool, TransitionError> {
        match self.destination(cluster, Some(*phase)) {
            Some(destination) => Ok(settle(phase, destination)),
            None => Err(TransitionError {
                entity: "namespace",
                operation: self.as_str(),
                from: phase.to_string(),
                parent: "cluster",
                parent_phase: cluster.to_string(),
            }),
        }
    }
}

/// Operations on a connector's desired state, gated by its namespace phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorOperation {
    Create,
    Assign,
    Unassign,
    Update,
    Stop,
    Delete,
}

impl ConnectorOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorOperation::Create => "create",
            ConnectorOperation::Assign => "assign",
            ConnectorOperation::Unassign => "unassign",
            ConnectorOperation::Update => "update",
            ConnectorOperation::Stop => "stop",
            ConnectorOperation::Delete => "delete",
        }
    }

    pub fn destination(
        self,
        namespace: NamespacePhase,
        current: ConnectorDesiredState,
    ) -> Option<ConnectorDesiredState> {
        use ConnectorDesiredState::*;
        use ConnectorOperation as Op;

        let open = matches!(namespace, NamespacePhase::Disconnected | NamespacePhase::Ready);
        let closing = matches!(namespace, NamespacePhase::Deleting);

        match (self, current) {
            (Op::Unassign, Unassigned | Ready | Stopped) if open || closing => Some(Unassigned),
            (Op::Delete, Unassigned | Ready | Stopped | Deleted) if open || closing => Some(Deleted),
            (Op::Create, Unassigned | Ready) if open => Some(Ready),
            (Op::Assign, Unassigned) if open => Some(Ready),
            (Op::Update, state @ (Unassigned | Ready | Stopped)) if open => Some(state),
            (Op::Stop, Stopped | Ready) if open => Some(Stopped),
            _ => None,
        }
    }

    /// Apply the operation. Returns whether the desired state changed.
    pub fn perform(
        self,
        namespace: NamespacePhase,
        desired: &mut ConnectorDesiredState,
    ) -> Result<bool, TransitionError> {
        match self.destination(namespace, *desired) {
            Some(destination) => Ok(settle(desired, destination)),
            None => Err(TransitionError {
                entity: "connector",
                operation: self.as_str(),
                from: desired.to_string(),
                parent: "namespace",
                parent_phase: namespace.to_string(),
            }),
        }
    }
}

impl ConnectorDesiredState {
    /// Phase a connector enters when its desired state is changed to `self`
    pub fn starting_phase(&self) -> Option<ConnectorPhase> {
        match self {
            ConnectorDesiredState::Unassigned => Some(ConnectorPhase::Assigning),
            ConnectorDesiredState::Deleted => Some(ConnectorPhase::Deleting),
            _ => None,
        }
    }
}

/// Operations on a processor's desired state, gated by its namespace phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorOperation {
    Create,
    Update,
    Stop,
    Restart,
    Delete,
}

impl ProcessorOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorOperation::Create => "create",
            ProcessorOperation::Update => "update",
            ProcessorOperation::Stop => "stop",
            ProcessorOperation::Restart => "restart",
            ProcessorOperation::Delete => "delete",
        }
    }

    pub fn destination(
        self,
        namespace: NamespacePhase,
        current: ProcessorDesiredState,
    ) -> Option<ProcessorDesiredState> {
        use ProcessorDesiredState::*;
        use ProcessorOperation as Op;

        let open = matches!(namespace, NamespacePhase::Disconnected | NamespacePhase::Ready);

        match (self, current) {
            (Op::Delete, Ready | Stopped | Deleted)
                if open || namespace == NamespacePhase::Deleting =>
            {
                Some(Deleted)
            }
            (Op::Create, Ready) if open => Some(Ready),
            (Op::Update, state @ (Ready | Stopped)) if open => Some(state),
            (Op::Stop, Ready | Stopped) if open => Some(Stopped),
            (Op::Restart, Ready | Stopped) if namespace == NamespacePhase::Ready => Some(Ready),
            _ => None,
        }
    }

    /// Phase a processor enters after this operation succeeds
    pub fn starting_phase(&self) -> ProcessorPhase {
        match self {
            ProcessorOperation::Create => ProcessorPhase::Preparing,
            ProcessorOperation::Restart | ProcessorOperation::Stop => ProcessorPhase::Prepared,
            ProcessorOperation::Update => ProcessorPhase::Updating,
            ProcessorOperation::Delete => ProcessorPhase::Deleting,
        }
    }

    /// Apply the operation. Returns whether the desired state changed.
    pub fn perform(
        self,
        namespace: NamespacePhase,
        desired: &mut ProcessorDesiredState,
    ) -> Result<bool, TransitionError> {
        match self.destination(namespace, *desired) {
            Some(destination) => Ok(settle(desired, destination)),
            None => Err(TransitionError {
                entity: "processor",
                operation: self.as_str(),
                from: desired.to_string(),
                parent: "namespace",
                parent_phase: namespace.to_string(),
            }),
        }
    }
}

impl ClusterPhase {
    /// Cluster phases are monotone once deletion starts
    pub fn can_transition_to(&self, next: ClusterPhase) -> bool {
        match self {
            ClusterPhase::Deleting => next == ClusterPhase::Deleting,
            _ => true,
        }
    }
}
