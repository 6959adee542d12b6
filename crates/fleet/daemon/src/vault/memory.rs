//! Process-local vault for development and tests

use super::VaultService;
use crate::error::{FleetError, FleetResult};
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct Secret {
    value: String,
    owning_resource: String,
}

/// Vault keeping secrets in process memory
#[derive(Debug, Default)]
pub struct InMemoryVault {
    secrets: DashMap<String, Secret>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[async_trait]
impl VaultService for InMemoryVault {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get_secret_string(&self, name: &str) -> FleetResult<String> {
        self.secrets
            .get(name)
            .map(|secret| secret.value.clone())
            .ok_or_else(|| FleetError::NotFound(format!("secret {name}")))
    }

    async fn set_secret_string(&self, name: &str, value: &str, owning_resource: &str) -> FleetResult<()> {
        if self.secrets.contains_key(name) {
            return Err(FleetError::Vault(format!("secret {name} already exists")));
        }
        self.secrets.insert(
            name.to_string(),
            Secret {
                value: value.to_string(),
                owning_resource: owning_resource.to_string(),
            },
        );
        Ok(())
    }

    async fn delete_secret_string(&self, name: &str) -> FleetResult<()> {
        self.secrets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| FleetError::NotFound(format!("secret {name}")))
    }

    async fn for_each_secret(
        &self,
        f: &mut (dyn for<'a> FnMut(&'a str, &'a str) -> bool + Send),
    ) -> FleetResult<()> {
        // Snapshot first so the callback never runs under a shard lock.
        let secrets: Vec<(String, String)> = self
            .secrets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().owning_resource.clone()))
            .collect();

        for (name, owner) in &secrets {
            if !f(name.as_str(), owner.as_str()) {
                break;
            }
        }
        Ok(())
    }
}
