//! Fleet daemon library
//!
//! Reconciliation engine for connector and processor fleets:
//! - Signal bus and unit-of-work plumbing
//! - Storage backends
//! - Domain services and reconcile workers
//! - Server lifecycle management

pub mod config;
pub mod error;
pub mod placement;
pub mod server;
pub mod services;
pub mod signalbus;
pub mod storage;
pub mod transaction;
pub mod vault;
pub mod workers;

pub use config::DaemonConfig;
pub use error::{DaemonError, DaemonResult, FleetError, FleetResult, StorageError};
pub use server::{FleetWorkers, Server};
pub use services::FleetServices;
pub use signalbus::{InMemorySignalBus, PgSignalBus, SignalBus};
pub use storage::{FleetStore, InMemoryStore, PostgresStore};
pub use transaction::UnitOfWork;
pub use workers::{Reconciler, Worker};
