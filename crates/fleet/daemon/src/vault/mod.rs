//! Secret storage
//!
//! Reconcilers never read secrets. They only delete the secrets owned by
//! workloads and clusters that are being removed.

mod memory;

pub use memory::InMemoryVault;

use crate::error::FleetResult;
use async_trait::async_trait;

/// Secret lifecycle operations
#[async_trait]
pub trait VaultService: Send + Sync {
    /// Backend name, for logging
    fn kind(&self) -> &'static str;

    async fn get_secret_string(&self, name: &str) -> FleetResult<String>;

    /// Store a new secret tagged with the resource that owns it
    async fn set_secret_string(&self, name: &str, value: &str, owning_resource: &str) -> FleetResult<()>;

    async fn delete_secret_string(&self, name: &str) -> FleetResult<()>;

    /// Visit `(name, owning_resource)` of every secret until `f` returns false
    async fn for_each_secret(
        &self,
        f: &mut (dyn for<'a> FnMut(&'a str, &'a str) -> bool + Send),
    ) -> FleetResult<()>;
}
