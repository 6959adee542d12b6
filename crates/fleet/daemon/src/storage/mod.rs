//! Storage layer for fleet-daemon
//!
//! Provides transactional storage for workloads, topology, deployments
//! and the type catalog.

mod memory;
mod postgres;
mod traits;

pub use memory::{InMemoryStore, InMemoryTx};
pub use postgres::{PgTx, PostgresStore};
pub use traits::{
    CatalogRepository, ClusterFilter, ClusterRepository, ConnectorFilter, ConnectorRepository,
    DeploymentFilter, DeploymentRepository, FleetStore, FleetTx, NamespaceFilter,
    NamespaceRepository, ProcessorFilter, ProcessorRepository, StorageResult,
};
