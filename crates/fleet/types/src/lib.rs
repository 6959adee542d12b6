//! Fleet Types - Core types for connector fleet reconciliation
//!
//! The fleet manager places connector and processor workloads onto remote
//! execution clusters, each partitioned into namespaces, and keeps the
//! database records of those workloads converging towards what users asked for.
//!
//! ## Key Concepts
//!
//! - **Desired state**: the lifecycle intent set by the API client
//! - **Phase**: the control plane's current belief about a lifecycle position
//! - **Deployment**: the instruction a data-plane agent reads to run a workload
//! - **Version**: a counter bumped on every mutation, used for optimistic concurrency
//! - **Catalog**: the statically configured connector/processor types and their
//!   per-channel shard metadata

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod catalog;
pub mod cluster;
pub mod connector;
pub mod ids;
pub mod lifecycle;
pub mod phase;
pub mod processor;

pub use catalog::{CatalogKind, CatalogType, ShardMetadata, ShardMetadataPayload};
pub use cluster::{ConnectorCluster, ConnectorNamespace, NamespaceTenant};
pub use connector::{Condition, Connector, ConnectorDeployment, ConnectorStatus, DeploymentStatus};
pub use ids::{CatalogTypeId, ClusterId, ConnectorId, DeploymentId, NamespaceId, ProcessorId};
pub use lifecycle::{
    ConnectorOperation, NamespaceOperation, ProcessorOperation, TransitionError,
};
pub use phase::{
    ClusterPhase, ConnectorDesiredState, ConnectorPhase, NamespacePhase, ParsePhaseError,
    ProcessorDesiredState, ProcessorPhase,
};
pub use processor::{Processor, ProcessorDeployment, ProcessorStatus};
