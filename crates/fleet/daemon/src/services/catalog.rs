//! Catalog type service
//!
//! Converges the persisted connector or processor types with the statically
//! configured catalog. One instance serves one [`CatalogKind`].

use crate::config::CatalogEntry;
use crate::error::{FleetError, FleetResult};
use crate::storage::{ConnectorFilter, DeploymentFilter, FleetTx, ProcessorFilter};
use crate::transaction::UnitOfWork;
use chrono::Utc;
use fleet_types::{CatalogKind, CatalogType, CatalogTypeId, ShardMetadata, ShardMetadataPayload};
use std::collections::HashMap;

/// Read the shard metadata revision of a channel.
///
/// Connector channels carry `connector_revision`, processor channels
/// `processor_revision`. The value must be an integer.
pub fn shard_metadata_revision(kind: CatalogKind, shard_metadata: &serde_json::Value) -> FleetResult<i64> {
    let key = match kind {
        CatalogKind::Connector => "connector_revision",
        CatalogKind::Processor => "processor_revision",
    };
    let Some(revision) = shard_metadata.get(key) else {
        return Err(FleetError::Catalog(format!("{key} not found in shard metadata")));
    };
    revision
        .as_i64()
        .ok_or_else(|| FleetError::Catalog(format!("{key} in shard metadata was not an integer: {revision}")))
}

fn entry_checksum(entry: &CatalogEntry) -> FleetResult<String> {
    let encoded = serde_json::to_vec(entry)
        .map_err(|e| FleetError::Catalog(format!("failed to encode catalog entry {}: {e}", entry.id)))?;
    Ok(blake3::hash(&encoded).to_hex().to_string())
}

pub struct CatalogTypesService {
    kind: CatalogKind,
    entries: Vec<CatalogEntry>,
    checksums: HashMap<String, String>,
}

impl CatalogTypesService {
    /// Fails when an entry cannot be encoded for its checksum
    pub fn new(kind: CatalogKind, entries: Vec<CatalogEntry>) -> FleetResult<Self> {
        let checksums = entries
            .iter()
            .map(|entry| Ok((entry.id.clone(), entry_checksum(entry)?)))
            .collect::<FleetResult<HashMap<_, _>>>()?;
        Ok(Self {
            kind,
            entries,
            checksums,
        })
    }

    pub fn kind(&self) -> CatalogKind {
        self.kind
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn checksum(&self, id: &str) -> Option<&str> {
        self.checksums.get(id).map(String::as_str)
    }

    pub async fn get_type<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        id: &CatalogTypeId,
    ) -> FleetResult<CatalogType> {
        uow.get_catalog_type(self.kind, id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("{} type {id}", self.kind)))
    }

    pub async fn list_types<T: FleetTx>(&self, uow: &mut UnitOfWork<T>) -> FleetResult<Vec<CatalogType>> {
        Ok(uow.list_catalog_types(self.kind).await?)
    }

    /// Store shard metadata for a channel and repoint `latest_id` on its siblings
    pub async fn put_shard_metadata<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        type_id: &CatalogTypeId,
        channel: &str,
        shard_metadata: &serde_json::Value,
    ) -> FleetResult<ShardMetadata> {
        let revision = shard_metadata_revision(self.kind, shard_metadata)
            .map_err(|e| e.context(format_args!("{} type {type_id}, channel {channel}", self.kind)))?;
        let payload = ShardMetadataPayload::from_json(shard_metadata).map_err(|e| {
            FleetError::Catalog(format!(
                "failed to encode shard metadata of {} type {type_id}, channel {channel}: {e}",
                self.kind
            ))
        })?;
        Ok(uow
            .put_shard_metadata(self.kind, type_id, channel, revision, payload)
            .await?)
    }

    /// The newest shard metadata for (type, channel)
    pub async fn latest_shard_metadata<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        type_id: &CatalogTypeId,
        channel: &str,
    ) -> FleetResult<ShardMetadata> {
        uow.latest_shard_metadata(self.kind, type_id, channel)
            .await?
            .ok_or_else(|| {
                FleetError::NotFound(format!(
                    "shard metadata of {} type {type_id}, channel {channel}",
                    self.kind
                ))
            })
    }

    async fn is_type_used<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
        type_id: &CatalogTypeId,
    ) -> FleetResult<bool> {
        let used = match self.kind {
            CatalogKind::Connector => !uow
                .list_connectors(&ConnectorFilter {
                    connector_type_id: Some(type_id.clone()),
                    ..Default::default()
                })
                .await?
                .is_empty(),
            CatalogKind::Processor => !uow
                .list_processors(&ProcessorFilter {
                    processor_type_id: Some(type_id.clone()),
                    ..Default::default()
                })
                .await?
                .is_empty(),
        };
        Ok(used)
    }

    /// Drop persisted types that left the catalog. Types still used by a
    /// workload are kept and marked deprecated. Returns (deleted, deprecated).
    pub async fn delete_or_deprecate_removed_types<T: FleetTx>(
        &self,
        uow: &mut UnitOfWork<T>,
    ) -> FleetResult<(usize, usize)> {
        let mut deleted = 0;
        let mut deprecated = 0;
        for mut catalog_type in uow.list_catalog_types(self.kind).await? {
            if self.checksums.contains_key(catalog_type.id.as_str()) {
                continue;
            }
            if self.is_type_used(uow, &catalog_type.id).await? {
                if !catalog_type.deprecated {
                    catalog_type.deprecated = true;
                    catalog_type.updated_at = Utc::now();
                    tracing::info!(kind = %self.kind, type_id = %catalog_type.id, "Deprecating type removed from catalog");
                    uow.upsert_catalog_type(catalog_type).await?;
                    deprecated += 1;
                }
            } else {
                tracing::info!(kind = %self.kind, type_id = %catalog_type.id, "Deleting type removed from catalog");
                uow.delete_catalog_type(self.kind, &catalog_type.id).await?;
                deleted += 1;
            }
        }
        Ok((deleted, deprecated))
    }

    /// Upsert every configured type with its channels' shard metadata, then
    /// persist the entry checksum. Any failure aborts the whole batch.
    pub async fn reconcile_catalog_entries<T: FleetTx>(&self, uow: &mut UnitOfWork<T>) -> FleetResult<()> {
        for entry in &self.entries {
            let type_id = CatalogTypeId::new(entry.id.as_str());
            let existing = uow.get_catalog_type(self.kind, &type_id).await?;
            let mut catalog_type = CatalogType {
                id: type_id.clone(),
                kind: self.kind,
                name: entry.name.clone(),
                description: entry.description.clone(),
                channels: entry.channels.keys().cloned().collect(),
                checksum: existing.and_then(|t| t.checksum),
                deprecated: false,
                updated_at: Utc::now(),
            };
            uow.upsert_catalog_type(catalog_type.clone()).await?;

            for (channel, channel_config) in &entry.channels {
                self.put_shard_metadata(uow, &type_id, channel, &channel_config.shard_metadata)
                    .await?;
            }

            catalog_type.checksum = self.checksums.get(&entry.id).cloned();
            uow.upsert_catalog_type(catalog_type).await?;
            tracing::debug!(kind = %self.kind, type_id = %type_id, "Catalog entry reconciled");
        }
        Ok(())
    }

    /// Whether every configured type is persisted with its current checksum
    pub async fn catalog_entries_reconciled<T: FleetTx>(&self, uow: &mut UnitOfWork<T>) -> FleetResult<bool> {
        let persisted: HashMap<CatalogTypeId, Option<String>> = uow
            .list_catalog_types(self.kind)
            .await?
            .into_iter()
            .map(|t| (t.id, t.checksum))
            .collect();

        Ok(self.checksums.iter().all(|(id, checksum)| {
            persisted
                .get(&CatalogTypeId::new(id.as_str()))
                .is_some_and(|stored| stored.as_deref() == Some(checksum.as_str()))
        }))
    }

    /// Delete deployments whose workload row no longer exists
    pub async fn cleanup_dangling_deployments<T: FleetTx>(&self, uow: &mut UnitOfWork<T>) -> FleetResult<usize> {
        let filter = DeploymentFilter::default();
        let mut removed = 0;
        match self.kind {
            CatalogKind::Connector => {
                for deployment in uow.list_connector_deployments(&filter).await? {
                    if uow.get_connector(&deployment.connector_id).await?.is_none() {
                        uow.delete_connector_deployment(&deployment.id).await?;
                        removed += 1;
                    }
                }
            }
            CatalogKind::Processor => {
                for deployment in uow.list_processor_deployments(&filter).await? {
                    if uow.get_processor(&deployment.processor_id).await?.is_none() {
                        uow.delete_processor_deployment(&deployment.id).await?;
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            tracing::info!(kind = %self.kind, removed, "Removed dangling deployments");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::storage::{ConnectorRepository, InMemoryStore};
    use fleet_types::{Connector, ConnectorId};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn create_test_entry(id: &str, revision: serde_json::Value) -> CatalogEntry {
        let mut channels = BTreeMap::new();
        channels.insert(
            "stable".to_string(),
            ChannelConfig {
                shard_metadata: json!({ "connector_revision": revision, "image": "quay.io/sink:1" }),
            },
        );
        CatalogEntry {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            channels,
        }
    }

    #[test]
    fn test_revision_must_be_an_integer() {
        assert_eq!(
            shard_metadata_revision(CatalogKind::Connector, &json!({"connector_revision": 7})).unwrap(),
            7
        );
        assert!(matches!(
            shard_metadata_revision(CatalogKind::Connector, &json!({"connector_revision": "7"})),
            Err(FleetError::Catalog(_))
        ));
        assert!(matches!(
            shard_metadata_revision(CatalogKind::Processor, &json!({"connector_revision": 7})),
            Err(FleetError::Catalog(_))
        ));
    }

    #[test]
    fn test_checksum_tracks_entry_content() {
        let a = entry_checksum(&create_test_entry("sink", json!(1))).unwrap();
        let b = entry_checksum(&create_test_entry("sink", json!(1))).unwrap();
        let c = entry_checksum(&create_test_entry("sink", json!(2))).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_reconcile_converges_catalog() {
        let store = InMemoryStore::new();
        let service =
            CatalogTypesService::new(CatalogKind::Connector, vec![create_test_entry("sink", json!(3))]).unwrap();

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        assert!(!service.catalog_entries_reconciled(&mut uow).await.unwrap());
        service.reconcile_catalog_entries(&mut uow).await.unwrap();
        assert!(service.catalog_entries_reconciled(&mut uow).await.unwrap());

        let latest = service
            .latest_shard_metadata(&mut uow, &CatalogTypeId::new("sink"), "stable")
            .await
            .unwrap();
        assert_eq!(latest.revision, 3);
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_revision_aborts_batch() {
        let store = InMemoryStore::new();
        let service = CatalogTypesService::new(
            CatalogKind::Connector,
            vec![create_test_entry("sink", json!(1)), create_test_entry("source", json!("x"))],
        )
        .unwrap();

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        let result = service.reconcile_catalog_entries(&mut uow).await;
        assert!(matches!(result, Err(FleetError::Catalog(_))));
        uow.resolve(result).await.unwrap_err();

        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        assert!(service.list_types(&mut uow).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removed_types_are_deleted_or_deprecated() {
        let store = InMemoryStore::new();
        let old = CatalogTypesService::new(
            CatalogKind::Connector,
            vec![create_test_entry("used", json!(1)), create_test_entry("unused", json!(1))],
        )
        .unwrap();
        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        old.reconcile_catalog_entries(&mut uow).await.unwrap();
        uow.insert_connector(Connector::new(
            ConnectorId::new("c1"),
            "c1",
            "alice",
            CatalogTypeId::new("used"),
            "stable",
        ))
        .await
        .unwrap();
        uow.commit().await.unwrap();

        let new = CatalogTypesService::new(CatalogKind::Connector, vec![]).unwrap();
        let mut uow = UnitOfWork::begin(&store).await.unwrap();
        assert_eq!(new.delete_or_deprecate_removed_types(&mut uow).await.unwrap(), (1, 1));
        let used = new.get_type(&mut uow, &CatalogTypeId::new("used")).await.unwrap();
        assert!(used.deprecated);
        assert!(new
            .get_type(&mut uow, &CatalogTypeId::new("unused"))
            .await
            .unwrap_err()
            .is_not_found());

        // Second pass has nothing left to do
        assert_eq!(new.delete_or_deprecate_removed_types(&mut uow).await.unwrap(), (0, 0));
    }
}
