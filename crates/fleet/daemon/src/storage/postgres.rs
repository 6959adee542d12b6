//! PostgreSQL storage implementation
//!
//! Entities are stored as JSONB documents next to the columns the
//! reconcilers filter and version-check on. Versions come from the
//! `fleet_versions` sequence shared by every table.

use super::traits::*;
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::Utc;
use fleet_types::{
    CatalogKind, CatalogType, CatalogTypeId, ClusterId, Connector, ConnectorCluster,
    ConnectorDeployment, ConnectorId, ConnectorNamespace, ConnectorPhase, ConnectorStatus,
    DeploymentId, DeploymentStatus, NamespaceId, Processor, ProcessorDeployment, ProcessorId,
    ProcessorPhase, ProcessorStatus, ShardMetadata, ShardMetadataPayload,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;

/// PostgreSQL-backed storage
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and initialize schema
    pub async fn new(
        url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        Self::from_pool(pool).await
    }

    /// Use an existing pool, initializing the schema
    pub async fn from_pool(pool: PgPool) -> Result<Self, StorageError> {
        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// The underlying pool, shared with the signal bus
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn initialize_schema(&self) -> Result<(), StorageError> {
        let statements = [
            r#"CREATE SEQUENCE IF NOT EXISTS fleet_versions;"#,
            r#"
            CREATE TABLE IF NOT EXISTS connectors (
                id TEXT PRIMARY KEY,
                version BIGINT NOT NULL,
                desired_state TEXT NOT NULL,
                phase TEXT NOT NULL,
                namespace_id TEXT,
                data JSONB NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS connectors_version ON connectors(version);"#,
            r#"
            CREATE TABLE IF NOT EXISTS processors (
                id TEXT PRIMARY KEY,
                version BIGINT NOT NULL,
                desired_state TEXT NOT NULL,
                phase TEXT NOT NULL,
                namespace_id TEXT NOT NULL,
                data JSONB NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS processors_version ON processors(version);"#,
            r#"
            CREATE TABLE IF NOT EXISTS connector_clusters (
                id TEXT PRIMARY KEY,
                version BIGINT NOT NULL,
                phase TEXT NOT NULL,
                organisation_id TEXT NOT NULL,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS connector_namespaces (
                id TEXT PRIMARY KEY,
                version BIGINT NOT NULL,
                cluster_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                expiration TIMESTAMPTZ,
                data JSONB NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS connector_namespaces_cluster_id ON connector_namespaces(cluster_id);"#,
            r#"
            CREATE TABLE IF NOT EXISTS connector_deployments (
                id TEXT PRIMARY KEY,
                connector_id TEXT NOT NULL UNIQUE,
                cluster_id TEXT NOT NULL,
                version BIGINT NOT NULL,
                status_version BIGINT NOT NULL,
                data JSONB NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS processor_deployments (
                id TEXT PRIMARY KEY,
                processor_id TEXT NOT NULL UNIQUE,
                cluster_id TEXT NOT NULL,
                version BIGINT NOT NULL,
                status_version BIGINT NOT NULL,
                data JSONB NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS catalog_types (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                data JSONB NOT NULL,
                PRIMARY KEY (kind, id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS shard_metadata (
                id BIGSERIAL PRIMARY KEY,
                kind TEXT NOT NULL,
                type_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                revision BIGINT NOT NULL,
                latest_id BIGINT,
                payload BYTEA NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS shard_metadata_type_channel ON shard_metadata(kind, type_id, channel);"#,
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(query_error)?;
        }

        Ok(())
    }
}

#[async_trait]
impl FleetStore for PostgresStore {
    type Tx = PgTx;

    async fn begin(&self) -> StorageResult<PgTx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(PgTx { tx })
    }
}

fn query_error(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::Conflict(db.message().to_string())
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StorageError::Connection(e.to_string())
        }
        _ => StorageError::Query(e.to_string()),
    }
}

fn to_json<T: Serialize>(value: &T) -> StorageResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| StorageError::InvalidData(format!("json serialize error: {}", e)))
}

fn from_row<T: DeserializeOwned>(row: &PgRow) -> StorageResult<T> {
    let data: Value = row.try_get("data").map_err(query_error)?;
    serde_json::from_value(data)
        .map_err(|e| StorageError::InvalidData(format!("json deserialize error: {}", e)))
}

/// Transaction over [`PostgresStore`]
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn next_version(&mut self) -> StorageResult<i64> {
        let row = sqlx::query("SELECT nextval('fleet_versions') AS version")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(query_error)?;
        row.try_get("version").map_err(query_error)
    }

    async fn fetch_doc<T: DeserializeOwned>(&mut self, sql: &str, id: &str) -> StorageResult<Option<T>> {
        let row = sqlx::query(sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(query_error)?;
        row.as_ref().map(from_row).transpose()
    }

    async fn delete_by_id(&mut self, sql: &str, id: &str) -> StorageResult<bool> {
        let result = sqlx::query(sql)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    /// Distinguish a missing row from a version conflict after an update matched nothing
    async fn missed_update(&mut self, table: &str, entity: &str, id: &str, version: i64) -> StorageError {
        let sql = format!("SELECT 1 FROM {table} WHERE id = $1");
        match sqlx::query(&sql).bind(id).fetch_optional(&mut *self.tx).await {
            Ok(Some(_)) => StorageError::Conflict(format!(
                "{entity} {id} has a newer version than {version}"
            )),
            Ok(None) => StorageError::NotFound(format!("{entity} {id}")),
            Err(e) => query_error(e),
        }
    }
}

#[async_trait]
impl FleetTx for PgTx {
    async fn commit(self) -> StorageResult<()> {
        self.tx.commit().await.map_err(query_error)
    }

    async fn rollback(self) -> StorageResult<()> {
        self.tx.rollback().await.map_err(query_error)
    }
}

#[async_trait]
impl ConnectorRepository for PgTx {
    async fn get_connector(&mut self, id: &ConnectorId) -> StorageResult<Option<Connector>> {
        self.fetch_doc("SELECT data FROM connectors WHERE id = $1", id.as_str())
            .await
    }

    async fn list_connectors(&mut self, filter: &ConnectorFilter) -> StorageResult<Vec<Connector>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM connectors
            WHERE ($1::TEXT IS NULL OR desired_state = $1)
              AND ($2::BIGINT IS NULL OR version > $2)
            ORDER BY version
            "#,
        )
        .bind(filter.desired_state.map(|d| d.as_str()))
        .bind(filter.version_above)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(query_error)?;

        let mut connectors = Vec::with_capacity(rows.len());
        for row in &rows {
            let connector: Connector = from_row(row)?;
            if filter.matches(&connector) {
                connectors.push(connector);
            }
        }
        Ok(connectors)
    }

    async fn insert_connector(&mut self, mut connector: Connector) -> StorageResult<Connector> {
        connector.version = self.next_version().await?;
        sqlx::query(
            r#"
            INSERT INTO connectors (id, version, desired_state, phase, namespace_id, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(connector.id.as_str())
        .bind(connector.version)
        .bind(connector.desired_state.as_str())
        .bind(connector.status.phase.as_str())
        .bind(connector.namespace_id.as_ref().map(|ns| ns.as_str()))
        .bind(to_json(&connector)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;
        Ok(connector)
    }

    async fn update_connector(&mut self, mut connector: Connector) -> StorageResult<Connector> {
        let based_on = connector.version;
        connector.version = self.next_version().await?;
        connector.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE connectors
            SET version = $3, desired_state = $4, phase = $5, namespace_id = $6, data = $7
            WHERE id = $1 AND version <= $2
            "#,
        )
        .bind(connector.id.as_str())
        .bind(based_on)
        .bind(connector.version)
        .bind(connector.desired_state.as_str())
        .bind(connector.status.phase.as_str())
        .bind(connector.namespace_id.as_ref().map(|ns| ns.as_str()))
        .bind(to_json(&connector)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self
                .missed_update("connectors", "connector", connector.id.as_str(), based_on)
                .await);
        }
        Ok(connector)
    }

    async fn save_connector_status(
        &mut self,
        id: &ConnectorId,
        status: &ConnectorStatus,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE connectors
            SET phase = $2, data = jsonb_set(data, '{status}', $3)
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(status.phase.as_str())
        .bind(to_json(status)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("connector {id}")));
        }
        Ok(())
    }

    async fn delete_connector(&mut self, id: &ConnectorId) -> StorageResult<bool> {
        self.delete_by_id("DELETE FROM connectors WHERE id = $1", id.as_str())
            .await
    }
}

#[async_trait]
impl ProcessorRepository for PgTx {
    async fn get_processor(&mut self, id: &ProcessorId) -> StorageResult<Option<Processor>> {
        self.fetch_doc("SELECT data FROM processors WHERE id = $1", id.as_str())
            .await
    }

    async fn list_processors(&mut self, filter: &ProcessorFilter) -> StorageResult<Vec<Processor>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM processors
            WHERE ($1::TEXT IS NULL OR desired_state = $1)
              AND ($2::BIGINT IS NULL OR version > $2)
            ORDER BY version
            "#,
        )
        .bind(filter.desired_state.map(|d| d.as_str()))
        .bind(filter.version_above)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(query_error)?;

        let mut processors = Vec::with_capacity(rows.len());
        for row in &rows {
            let processor: Processor = from_row(row)?;
            if filter.matches(&processor) {
                processors.push(processor);
            }
        }
        Ok(processors)
    }

    async fn insert_processor(&mut self, mut processor: Processor) -> StorageResult<Processor> {
        processor.version = self.next_version().await?;
        sqlx::query(
            r#"
            INSERT INTO processors (id, version, desired_state, phase, namespace_id, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(processor.id.as_str())
        .bind(processor.version)
        .bind(processor.desired_state.as_str())
        .bind(processor.status.phase.as_str())
        .bind(processor.namespace_id.as_str())
        .bind(to_json(&processor)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;
        Ok(processor)
    }

    async fn update_processor(&mut self, mut processor: Processor) -> StorageResult<Processor> {
        let based_on = processor.version;
        processor.version = self.next_version().await?;
        processor.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE processors
            SET version = $3, desired_state = $4, phase = $5, namespace_id = $6, data = $7
            WHERE id = $1 AND version <= $2
            "#,
        )
        .bind(processor.id.as_str())
        .bind(based_on)
        .bind(processor.version)
        .bind(processor.desired_state.as_str())
        .bind(processor.status.phase.as_str())
        .bind(processor.namespace_id.as_str())
        .bind(to_json(&processor)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self
                .missed_update("processors", "processor", processor.id.as_str(), based_on)
                .await);
        }
        Ok(processor)
    }

    async fn save_processor_status(
        &mut self,
        id: &ProcessorId,
        status: &ProcessorStatus,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE processors
            SET phase = $2, data = jsonb_set(data, '{status}', $3)
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(status.phase.as_str())
        .bind(to_json(status)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("processor {id}")));
        }
        Ok(())
    }

    async fn delete_processor(&mut self, id: &ProcessorId) -> StorageResult<bool> {
        self.delete_by_id("DELETE FROM processors WHERE id = $1", id.as_str())
            .await
    }
}

#[async_trait]
impl ClusterRepository for PgTx {
    async fn get_cluster(&mut self, id: &ClusterId) -> StorageResult<Option<ConnectorCluster>> {
        self.fetch_doc("SELECT data FROM connector_clusters WHERE id = $1", id.as_str())
            .await
    }

    async fn list_clusters(&mut self, filter: &ClusterFilter) -> StorageResult<Vec<ConnectorCluster>> {
        let rows = sqlx::query(
            "SELECT data FROM connector_clusters ORDER BY updated_at DESC, version DESC",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(query_error)?;

        let mut clusters = Vec::with_capacity(rows.len());
        for row in &rows {
            let cluster: ConnectorCluster = from_row(row)?;
            if filter.matches(&cluster) {
                clusters.push(cluster);
            }
        }
        Ok(clusters)
    }

    async fn insert_cluster(&mut self, mut cluster: ConnectorCluster) -> StorageResult<ConnectorCluster> {
        cluster.version = self.next_version().await?;
        sqlx::query(
            r#"
            INSERT INTO connector_clusters (id, version, phase, organisation_id, data, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(cluster.id.as_str())
        .bind(cluster.version)
        .bind(cluster.phase.as_str())
        .bind(&cluster.organisation_id)
        .bind(to_json(&cluster)?)
        .bind(cluster.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;
        Ok(cluster)
    }

    async fn update_cluster(&mut self, mut cluster: ConnectorCluster) -> StorageResult<ConnectorCluster> {
        let based_on = cluster.version;
        cluster.version = self.next_version().await?;
        cluster.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE connector_clusters
            SET version = $3, phase = $4, organisation_id = $5, data = $6, updated_at = $7
            WHERE id = $1 AND version <= $2
            "#,
        )
        .bind(cluster.id.as_str())
        .bind(based_on)
        .bind(cluster.version)
        .bind(cluster.phase.as_str())
        .bind(&cluster.organisation_id)
        .bind(to_json(&cluster)?)
        .bind(cluster.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self
                .missed_update("connector_clusters", "cluster", cluster.id.as_str(), based_on)
                .await);
        }
        Ok(cluster)
    }

    async fn delete_cluster(&mut self, id: &ClusterId) -> StorageResult<bool> {
        self.delete_by_id("DELETE FROM connector_clusters WHERE id = $1", id.as_str())
            .await
    }
}

#[async_trait]
impl NamespaceRepository for PgTx {
    async fn get_namespace(&mut self, id: &NamespaceId) -> StorageResult<Option<ConnectorNamespace>> {
        self.fetch_doc("SELECT data FROM connector_namespaces WHERE id = $1", id.as_str())
            .await
    }

    async fn list_namespaces(
        &mut self,
        filter: &NamespaceFilter,
    ) -> StorageResult<Vec<ConnectorNamespace>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM connector_namespaces
            WHERE ($1::TIMESTAMPTZ IS NULL OR expiration < $1)
            ORDER BY version
            "#,
        )
        .bind(filter.expired_before)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(query_error)?;

        let mut namespaces = Vec::with_capacity(rows.len());
        for row in &rows {
            let namespace: ConnectorNamespace = from_row(row)?;
            if filter.matches(&namespace) {
                namespaces.push(namespace);
            }
        }
        Ok(namespaces)
    }

    async fn insert_namespace(
        &mut self,
        mut namespace: ConnectorNamespace,
    ) -> StorageResult<ConnectorNamespace> {
        namespace.version = self.next_version().await?;
        sqlx::query(
            r#"
            INSERT INTO connector_namespaces (id, version, cluster_id, phase, expiration, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(namespace.id.as_str())
        .bind(namespace.version)
        .bind(namespace.cluster_id.as_str())
        .bind(namespace.phase.as_str())
        .bind(namespace.expiration)
        .bind(to_json(&namespace)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;
        Ok(namespace)
    }

    async fn update_namespace(
        &mut self,
        mut namespace: ConnectorNamespace,
    ) -> StorageResult<ConnectorNamespace> {
        let based_on = namespace.version;
        namespace.version = self.next_version().await?;
        namespace.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE connector_namespaces
            SET version = $3, cluster_id = $4, phase = $5, expiration = $6, data = $7
            WHERE id = $1 AND version <= $2
            "#,
        )
        .bind(namespace.id.as_str())
        .bind(based_on)
        .bind(namespace.version)
        .bind(namespace.cluster_id.as_str())
        .bind(namespace.phase.as_str())
        .bind(namespace.expiration)
        .bind(to_json(&namespace)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self
                .missed_update("connector_namespaces", "namespace", namespace.id.as_str(), based_on)
                .await);
        }
        Ok(namespace)
    }

    async fn delete_namespace(&mut self, id: &NamespaceId) -> StorageResult<bool> {
        self.delete_by_id("DELETE FROM connector_namespaces WHERE id = $1", id.as_str())
            .await
    }
}

#[async_trait]
impl DeploymentRepository for PgTx {
    async fn get_connector_deployment(
        &mut self,
        id: &DeploymentId,
    ) -> StorageResult<Option<ConnectorDeployment>> {
        self.fetch_doc("SELECT data FROM connector_deployments WHERE id = $1", id.as_str())
            .await
    }

    async fn get_connector_deployment_by_connector(
        &mut self,
        connector_id: &ConnectorId,
    ) -> StorageResult<Option<ConnectorDeployment>> {
        self.fetch_doc(
            "SELECT data FROM connector_deployments WHERE connector_id = $1",
            connector_id.as_str(),
        )
        .await
    }

    async fn list_connector_deployments(
        &mut self,
        filter: &DeploymentFilter,
    ) -> StorageResult<Vec<ConnectorDeployment>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM connector_deployments
            WHERE ($1::TEXT IS NULL OR cluster_id = $1)
            ORDER BY version
            "#,
        )
        .bind(filter.cluster_id.as_ref().map(|c| c.as_str()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(query_error)?;

        let mut deployments = Vec::with_capacity(rows.len());
        for row in &rows {
            let deployment: ConnectorDeployment = from_row(row)?;
            if filter.matches_connector(&deployment) {
                deployments.push(deployment);
            }
        }
        Ok(deployments)
    }

    async fn insert_connector_deployment(
        &mut self,
        mut deployment: ConnectorDeployment,
    ) -> StorageResult<ConnectorDeployment> {
        deployment.version = self.next_version().await?;
        sqlx::query(
            r#"
            INSERT INTO connector_deployments (id, connector_id, cluster_id, version, status_version, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(deployment.id.as_str())
        .bind(deployment.connector_id.as_str())
        .bind(deployment.cluster_id.as_str())
        .bind(deployment.version)
        .bind(deployment.status.version)
        .bind(to_json(&deployment)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;
        Ok(deployment)
    }

    async fn update_connector_deployment(
        &mut self,
        mut deployment: ConnectorDeployment,
    ) -> StorageResult<ConnectorDeployment> {
        let based_on = deployment.version;
        deployment.version = self.next_version().await?;
        deployment.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE connector_deployments
            SET version = $3, cluster_id = $4, data = jsonb_set($5, '{status}', data->'status')
            WHERE id = $1 AND version <= $2
            "#,
        )
        .bind(deployment.id.as_str())
        .bind(based_on)
        .bind(deployment.version)
        .bind(deployment.cluster_id.as_str())
        .bind(to_json(&deployment)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self
                .missed_update(
                    "connector_deployments",
                    "connector deployment",
                    deployment.id.as_str(),
                    based_on,
                )
                .await);
        }
        Ok(deployment)
    }

    async fn save_connector_deployment_status(
        &mut self,
        id: &DeploymentId,
        status: &DeploymentStatus<ConnectorPhase>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE connector_deployments
            SET status_version = $2, data = jsonb_set(data, '{status}', $3)
            WHERE id = $1 AND status_version <= $2
            "#,
        )
        .bind(id.as_str())
        .bind(status.version)
        .bind(to_json(status)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self
                .missed_update(
                    "connector_deployments",
                    "connector deployment status",
                    id.as_str(),
                    status.version,
                )
                .await);
        }
        Ok(())
    }

    async fn delete_connector_deployment(&mut self, id: &DeploymentId) -> StorageResult<bool> {
        self.delete_by_id("DELETE FROM connector_deployments WHERE id = $1", id.as_str())
            .await
    }

    async fn get_processor_deployment(
        &mut self,
        id: &DeploymentId,
    ) -> StorageResult<Option<ProcessorDeployment>> {
        self.fetch_doc("SELECT data FROM processor_deployments WHERE id = $1", id.as_str())
            .await
    }

    async fn get_processor_deployment_by_processor(
        &mut self,
        processor_id: &ProcessorId,
    ) -> StorageResult<Option<ProcessorDeployment>> {
        self.fetch_doc(
            "SELECT data FROM processor_deployments WHERE processor_id = $1",
            processor_id.as_str(),
        )
        .await
    }

    async fn list_processor_deployments(
        &mut self,
        filter: &DeploymentFilter,
    ) -> StorageResult<Vec<ProcessorDeployment>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM processor_deployments
            WHERE ($1::TEXT IS NULL OR cluster_id = $1)
            ORDER BY version
            "#,
        )
        .bind(filter.cluster_id.as_ref().map(|c| c.as_str()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(query_error)?;

        let mut deployments = Vec::with_capacity(rows.len());
        for row in &rows {
            let deployment: ProcessorDeployment = from_row(row)?;
            if filter.matches_processor(&deployment) {
                deployments.push(deployment);
            }
        }
        Ok(deployments)
    }

    async fn insert_processor_deployment(
        &mut self,
        mut deployment: ProcessorDeployment,
    ) -> StorageResult<ProcessorDeployment> {
        deployment.version = self.next_version().await?;
        sqlx::query(
            r#"
            INSERT INTO processor_deployments (id, processor_id, cluster_id, version, status_version, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(deployment.id.as_str())
        .bind(deployment.processor_id.as_str())
        .bind(deployment.cluster_id.as_str())
        .bind(deployment.version)
        .bind(deployment.status.version)
        .bind(to_json(&deployment)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;
        Ok(deployment)
    }

    async fn update_processor_deployment(
        &mut self,
        mut deployment: ProcessorDeployment,
    ) -> StorageResult<ProcessorDeployment> {
        let based_on = deployment.version;
        deployment.version = self.next_version().await?;
        deployment.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE processor_deployments
            SET version = $3, cluster_id = $4, data = jsonb_set($5, '{status}', data->'status')
            WHERE id = $1 AND version <= $2
            "#,
        )
        .bind(deployment.id.as_str())
        .bind(based_on)
        .bind(deployment.version)
        .bind(deployment.cluster_id.as_str())
        .bind(to_json(&deployment)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self
                .missed_update(
                    "processor_deployments",
                    "processor deployment",
                    deployment.id.as_str(),
                    based_on,
                )
                .await);
        }
        Ok(deployment)
    }

    async fn save_processor_deployment_status(
        &mut self,
        id: &DeploymentId,
        status: &DeploymentStatus<ProcessorPhase>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE processor_deployments
            SET status_version = $2, data = jsonb_set(data, '{status}', $3)
            WHERE id = $1 AND status_version <= $2
            "#,
        )
        .bind(id.as_str())
        .bind(status.version)
        .bind(to_json(status)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(self
                .missed_update(
                    "processor_deployments",
                    "processor deployment status",
                    id.as_str(),
                    status.version,
                )
                .await);
        }
        Ok(())
    }

    async fn delete_processor_deployment(&mut self, id: &DeploymentId) -> StorageResult<bool> {
        self.delete_by_id("DELETE FROM processor_deployments WHERE id = $1", id.as_str())
            .await
    }
}

fn shard_metadata_from_row(row: &PgRow) -> StorageResult<ShardMetadata> {
    let kind: String = row.try_get("kind").map_err(query_error)?;
    let kind = match kind.as_str() {
        "connector" => CatalogKind::Connector,
        "processor" => CatalogKind::Processor,
        other => {
            return Err(StorageError::InvalidData(format!(
                "unknown catalog kind '{other}'"
            )))
        }
    };
    let type_id: String = row.try_get("type_id").map_err(query_error)?;
    let payload: Vec<u8> = row.try_get("payload").map_err(query_error)?;

    Ok(ShardMetadata {
        id: row.try_get("id").map_err(query_error)?,
        kind,
        type_id: CatalogTypeId::new(type_id),
        channel: row.try_get("channel").map_err(query_error)?,
        revision: row.try_get("revision").map_err(query_error)?,
        latest_id: row.try_get("latest_id").map_err(query_error)?,
        payload: ShardMetadataPayload::from_bytes(payload),
    })
}

const SHARD_METADATA_COLUMNS: &str = "id, kind, type_id, channel, revision, latest_id, payload";

#[async_trait]
impl CatalogRepository for PgTx {
    async fn get_catalog_type(
        &mut self,
        kind: CatalogKind,
        id: &CatalogTypeId,
    ) -> StorageResult<Option<CatalogType>> {
        let row = sqlx::query("SELECT data FROM catalog_types WHERE kind = $1 AND id = $2")
            .bind(kind.as_str())
            .bind(id.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(query_error)?;
        row.as_ref().map(from_row).transpose()
    }

    async fn list_catalog_types(&mut self, kind: CatalogKind) -> StorageResult<Vec<CatalogType>> {
        let rows = sqlx::query("SELECT data FROM catalog_types WHERE kind = $1 ORDER BY id")
            .bind(kind.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(query_error)?;
        rows.iter().map(from_row).collect()
    }

    async fn upsert_catalog_type(&mut self, catalog_type: CatalogType) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO catalog_types (kind, id, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (kind, id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(catalog_type.kind.as_str())
        .bind(catalog_type.id.as_str())
        .bind(to_json(&catalog_type)?)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn delete_catalog_type(
        &mut self,
        kind: CatalogKind,
        id: &CatalogTypeId,
    ) -> StorageResult<bool> {
        sqlx::query("DELETE FROM shard_metadata WHERE kind = $1 AND type_id = $2")
            .bind(kind.as_str())
            .bind(id.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(query_error)?;

        let result = sqlx::query("DELETE FROM catalog_types WHERE kind = $1 AND id = $2")
            .bind(kind.as_str())
            .bind(id.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn put_shard_metadata(
        &mut self,
        kind: CatalogKind,
        type_id: &CatalogTypeId,
        channel: &str,
        revision: i64,
        payload: ShardMetadataPayload,
    ) -> StorageResult<ShardMetadata> {
        let existing = sqlx::query(
            r#"
            SELECT id FROM shard_metadata
            WHERE kind = $1 AND type_id = $2 AND channel = $3 AND payload = $4
            "#,
        )
        .bind(kind.as_str())
        .bind(type_id.as_str())
        .bind(channel)
        .bind(payload.as_bytes())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(query_error)?;

        let id: i64 = match existing {
            Some(row) => row.try_get("id").map_err(query_error)?,
            None => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO shard_metadata (kind, type_id, channel, revision, payload)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING id
                    "#,
                )
                .bind(kind.as_str())
                .bind(type_id.as_str())
                .bind(channel)
                .bind(revision)
                .bind(payload.as_bytes())
                .fetch_one(&mut *self.tx)
                .await
                .map_err(query_error)?;
                row.try_get("id").map_err(query_error)?
            }
        };

        // Same transaction as the insert, so readers never see a stale back-pointer.
        sqlx::query(
            r#"
            WITH latest AS (
                SELECT id FROM shard_metadata
                WHERE kind = $1 AND type_id = $2 AND channel = $3
                ORDER BY revision DESC, id DESC
                LIMIT 1
            )
            UPDATE shard_metadata
            SET latest_id = CASE WHEN shard_metadata.id = latest.id THEN NULL ELSE latest.id END
            FROM latest
            WHERE kind = $1 AND type_id = $2 AND channel = $3
            "#,
        )
        .bind(kind.as_str())
        .bind(type_id.as_str())
        .bind(channel)
        .execute(&mut *self.tx)
        .await
        .map_err(query_error)?;

        self.get_shard_metadata(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("shard metadata {id}")))
    }

    async fn latest_shard_metadata(
        &mut self,
        kind: CatalogKind,
        type_id: &CatalogTypeId,
        channel: &str,
    ) -> StorageResult<Option<ShardMetadata>> {
        let sql = format!(
            r#"
            SELECT {SHARD_METADATA_COLUMNS} FROM shard_metadata
            WHERE kind = $1 AND type_id = $2 AND channel = $3
            ORDER BY revision DESC, id DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(type_id.as_str())
            .bind(channel)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(query_error)?;
        row.as_ref().map(shard_metadata_from_row).transpose()
    }

    async fn get_shard_metadata(&mut self, id: i64) -> StorageResult<Option<ShardMetadata>> {
        let sql = format!("SELECT {SHARD_METADATA_COLUMNS} FROM shard_metadata WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(query_error)?;
        row.as_ref().map(shard_metadata_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::ConnectorDesiredState;

    async fn test_store() -> PostgresStore {
        let url = std::env::var("FLEET_TEST_DATABASE_URL").unwrap();
        PostgresStore::new(&url, 5, 5).await.unwrap()
    }

    #[tokio::test]
    #[ignore = "requires FLEET_TEST_DATABASE_URL"]
    async fn test_stale_connector_update_conflicts() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();

        let connector = Connector::new(
            ConnectorId::generate(),
            "pg-test",
            "alice",
            CatalogTypeId::new("log_sink_0.1"),
            "stable",
        );
        let stale = tx.insert_connector(connector).await.unwrap();
        let mut fresh = stale.clone();
        fresh.desired_state = ConnectorDesiredState::Stopped;
        tx.update_connector(fresh).await.unwrap();

        let err = tx.update_connector(stale).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires FLEET_TEST_DATABASE_URL"]
    async fn test_shard_metadata_latest_pointer() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let type_id = CatalogTypeId::generate();
        let payload = |rev: i64| {
            ShardMetadataPayload::from_json(&serde_json::json!({ "connector_revision": rev })).unwrap()
        };

        let first = tx
            .put_shard_metadata(CatalogKind::Connector, &type_id, "stable", 1, payload(1))
            .await
            .unwrap();
        let second = tx
            .put_shard_metadata(CatalogKind::Connector, &type_id, "stable", 2, payload(2))
            .await
            .unwrap();

        let first = tx.get_shard_metadata(first.id).await.unwrap().unwrap();
        assert_eq!(first.latest_id, Some(second.id));
        assert_eq!(second.latest_id, None);
        tx.rollback().await.unwrap();
    }
}
