//! Configuration for fleet-daemon

use crate::error::FleetError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Cross-replica signal bus configuration
    #[serde(default)]
    pub signal_bus: SignalBusConfig,

    /// Reconcile worker configuration
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Namespace placement configuration
    #[serde(default)]
    pub namespaces: NamespaceConfig,

    /// Static connector and processor catalog
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    #[default]
    Memory,

    /// PostgreSQL storage
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,
    },
}

impl StorageConfig {
    /// PostgreSQL storage at `url`, keeping pool settings already configured
    pub fn with_postgres_url(&self, url: impl Into<String>) -> Self {
        let (max_connections, connect_timeout_secs) = match self {
            StorageConfig::Postgres {
                max_connections,
                connect_timeout_secs,
                ..
            } => (*max_connections, *connect_timeout_secs),
            StorageConfig::Memory => (default_pool_size(), default_connection_timeout()),
        };
        StorageConfig::Postgres {
            url: url.into(),
            max_connections,
            connect_timeout_secs,
        }
    }

    /// Backend name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            StorageConfig::Memory => "memory",
            StorageConfig::Postgres { .. } => "postgres",
        }
    }
}

/// Signal bus configuration, used by the PostgreSQL bus only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalBusConfig {
    /// LISTEN/NOTIFY channel shared by all replicas
    #[serde(default = "default_signal_channel")]
    pub channel: String,

    /// Ping the connection after this long without a notification
    #[serde(default = "default_ping_after")]
    pub ping_after_secs: u64,

    /// First reconnect delay after a lost connection
    #[serde(default = "default_reconnect_min")]
    pub reconnect_min_secs: u64,

    /// Reconnect delay cap
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,

    /// Delay before restarting a failed listener
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
}

impl Default for SignalBusConfig {
    fn default() -> Self {
        Self {
            channel: default_signal_channel(),
            ping_after_secs: default_ping_after(),
            reconnect_min_secs: default_reconnect_min(),
            reconnect_max_secs: default_reconnect_max(),
            restart_delay_secs: default_restart_delay(),
        }
    }
}

impl SignalBusConfig {
    pub fn ping_after(&self) -> Duration {
        Duration::from_secs(self.ping_after_secs)
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_secs(self.reconnect_min_secs)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs.max(self.reconnect_min_secs))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

/// Reconcile worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Reconciliation interval in seconds
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// How often the readiness gate re-checks catalog convergence
    #[serde(default = "default_catalog_check_interval")]
    pub catalog_check_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            catalog_check_interval_secs: default_catalog_check_interval(),
        }
    }
}

impl WorkerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn catalog_check_interval(&self) -> Duration {
        Duration::from_secs(self.catalog_check_interval_secs.max(1))
    }
}

/// Namespace placement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Organisations whose clusters host evaluation namespaces
    #[serde(default)]
    pub eval_organisations: Vec<String>,

    /// Lifetime of an evaluation namespace
    #[serde(default = "default_eval_duration")]
    pub eval_duration_hours: i64,

    /// Fixed seed for evaluation cluster selection
    #[serde(default)]
    pub eval_seed: Option<u64>,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            eval_organisations: Vec::new(),
            eval_duration_hours: default_eval_duration(),
            eval_seed: None,
        }
    }
}

impl NamespaceConfig {
    pub fn eval_duration(&self) -> chrono::Duration {
        chrono::Duration::hours(self.eval_duration_hours)
    }
}

/// A catalog channel: the shard metadata agents receive for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub shard_metadata: serde_json::Value,
}

/// A connector or processor type as configured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

/// Static catalog, inline and from JSON files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub connectors: Vec<CatalogEntry>,

    #[serde(default)]
    pub processors: Vec<CatalogEntry>,

    /// Files holding a JSON array of connector catalog entries
    #[serde(default)]
    pub connector_catalog_files: Vec<PathBuf>,

    /// Files holding a JSON array of processor catalog entries
    #[serde(default)]
    pub processor_catalog_files: Vec<PathBuf>,
}

impl CatalogConfig {
    /// Inline connector entries followed by entries loaded from files
    pub fn connector_entries(&self) -> Result<Vec<CatalogEntry>, FleetError> {
        Self::collect(&self.connectors, &self.connector_catalog_files)
    }

    /// Inline processor entries followed by entries loaded from files
    pub fn processor_entries(&self) -> Result<Vec<CatalogEntry>, FleetError> {
        Self::collect(&self.processors, &self.processor_catalog_files)
    }

    fn collect(inline: &[CatalogEntry], files: &[PathBuf]) -> Result<Vec<CatalogEntry>, FleetError> {
        let mut entries = inline.to_vec();
        for path in files {
            let raw = std::fs::read(path).map_err(|e| {
                FleetError::Catalog(format!("failed to read {}: {e}", path.display()))
            })?;
            let loaded: Vec<CatalogEntry> = serde_json::from_slice(&raw).map_err(|e| {
                FleetError::Catalog(format!("failed to parse {}: {e}", path.display()))
            })?;
            entries.extend(loaded);
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.id.as_str()) {
                return Err(FleetError::Catalog(format!(
                    "duplicate catalog entry id '{}'",
                    entry.id
                )));
            }
        }
        Ok(entries)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_signal_channel() -> String {
    "signalbus".to_string()
}

fn default_ping_after() -> u64 {
    90
}

fn default_reconnect_min() -> u64 {
    10
}

fn default_reconnect_max() -> u64 {
    60
}

fn default_restart_delay() -> u64 {
    10
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_catalog_check_interval() -> u64 {
    5
}

fn default_eval_duration() -> i64 {
    48
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration from defaults, an optional file and `FLEET_*` variables
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Nested keys use a double underscore, e.g. FLEET_WORKERS__RECONCILE_INTERVAL_SECS
        builder = builder.add_source(
            config::Environment::with_prefix("FLEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.signal_bus.channel, "signalbus");
        assert!(config.catalog.connectors.is_empty());
    }

    #[test]
    fn test_signal_bus_defaults() {
        let config = SignalBusConfig::default();
        assert_eq!(config.ping_after(), Duration::from_secs(90));
        assert_eq!(config.reconnect_min(), Duration::from_secs(10));
        assert_eq!(config.reconnect_max(), Duration::from_secs(60));
    }

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.reconcile_interval_secs, 30);
        assert_eq!(config.catalog_check_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = DaemonConfig::load(None).unwrap();
        assert_eq!(config.namespaces.eval_duration_hours, 48);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_postgres_storage_deserializes() {
        let json = r#"{"type": "postgres", "url": "postgres://localhost/fleet"}"#;
        let storage: StorageConfig = serde_json::from_str(json).unwrap();
        match storage {
            StorageConfig::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => {
                assert_eq!(url, "postgres://localhost/fleet");
                assert_eq!(max_connections, 10);
                assert_eq!(connect_timeout_secs, 5);
            }
            StorageConfig::Memory => panic!("expected postgres storage"),
        }
    }

    #[test]
    fn test_postgres_url_override_keeps_pool_settings() {
        let storage = StorageConfig::Memory.with_postgres_url("postgres://db/fleet");
        assert!(matches!(
            storage,
            StorageConfig::Postgres { max_connections: 10, connect_timeout_secs: 5, .. }
        ));

        let tuned = StorageConfig::Postgres {
            url: "postgres://old/fleet".into(),
            max_connections: 32,
            connect_timeout_secs: 2,
        };
        match tuned.with_postgres_url("postgres://new/fleet") {
            StorageConfig::Postgres { url, max_connections, .. } => {
                assert_eq!(url, "postgres://new/fleet");
                assert_eq!(max_connections, 32);
            }
            StorageConfig::Memory => panic!("expected postgres storage"),
        }
        assert_eq!(tuned.kind(), "postgres");
    }

    #[test]
    fn test_duplicate_catalog_ids_are_rejected() {
        let entry = CatalogEntry {
            id: "log_sink_0.1".into(),
            name: "Log sink".into(),
            description: String::new(),
            channels: BTreeMap::new(),
        };
        let catalog = CatalogConfig {
            connectors: vec![entry.clone(), entry],
            ..Default::default()
        };
        assert!(matches!(
            catalog.connector_entries(),
            Err(FleetError::Catalog(_))
        ));
    }
}
