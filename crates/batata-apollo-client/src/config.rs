//! Client configuration and the per-cycle application identity snapshot

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, Map};
use if_addrs::IfAddr;
use serde::Deserialize;

use crate::error::Result;

/// Namespace used by the default-namespace shortcuts on the client
pub const DEFAULT_NAMESPACE: &str = "application";

/// Cluster used when none is configured
pub const DEFAULT_CLUSTER: &str = "default";

/// How the background task keeps the cache current
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Long-poll `/notifications/v2` and fetch only the namespaces that changed
    #[default]
    Notify,
    /// Fetch every namespace on a fixed interval
    Bulk,
}

/// Configuration for the Apollo config client
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Application ID
    pub app_id: String,
    /// Cluster name
    pub cluster: String,
    /// Namespaces to load at startup, in order
    pub namespaces: Vec<String>,
    /// Access key secret, enables request signing when set
    pub secret: Option<String>,
    /// Meta server address used for discovery and as the direct fallback node
    pub meta_server: String,
    /// Gray release label forwarded to the server
    pub label: Option<String>,
    /// Client IP reported to the server, detected when absent
    pub client_ip: Option<String>,
    /// Whether successful updates are written to the backup store
    pub backup_enabled: bool,
    /// Directory for backup snapshots
    pub backup_path: PathBuf,
    /// Fail `start` when no namespace could be loaded from anywhere
    pub must_start: bool,
    /// Background sync strategy
    pub sync_mode: SyncMode,
    /// Timeout for regular config and discovery requests in milliseconds
    pub sync_timeout_ms: u64,
    /// Timeout for long-poll requests in milliseconds
    pub notify_timeout_ms: u64,
    /// Attempts per node before failing over
    pub max_attempts: u32,
    /// Sleep between attempts against the same node in milliseconds
    pub retry_backoff_ms: u64,
    /// Delay before re-arming a failed long poll in milliseconds
    pub notify_retry_delay_ms: u64,
    /// Interval between bulk refreshes in milliseconds (bulk mode)
    pub refresh_interval_ms: u64,
    /// Interval between discovery refreshes in milliseconds
    pub discovery_refresh_interval_ms: u64,
    /// How long a node marked down is skipped, in milliseconds
    pub server_retry_window_ms: u64,
    /// TTL for cached keys in milliseconds, 0 means no expiry
    pub cache_ttl_ms: u64,
    /// Pending events buffered per listener before events are dropped
    pub listener_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            cluster: DEFAULT_CLUSTER.to_string(),
            namespaces: vec![DEFAULT_NAMESPACE.to_string()],
            secret: None,
            meta_server: "http://127.0.0.1:8080".to_string(),
            label: None,
            client_ip: None,
            backup_enabled: true,
            backup_path: PathBuf::from(".apollo-backup"),
            must_start: false,
            sync_mode: SyncMode::Notify,
            sync_timeout_ms: 1000,
            notify_timeout_ms: 600_000,
            max_attempts: 5,
            retry_backoff_ms: 1000,
            notify_retry_delay_ms: 2000,
            refresh_interval_ms: 300_000,
            discovery_refresh_interval_ms: 1_200_000,
            server_retry_window_ms: 30_000,
            cache_ttl_ms: 0,
            listener_queue_capacity: 128,
        }
    }
}

impl ClientConfig {
    /// Create a config for an application against a single meta server
    pub fn new(app_id: &str, meta_server: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            meta_server: meta_server.to_string(),
            ..Default::default()
        }
    }

    /// Load configuration from an optional file layered with `APOLLO_*` environment variables.
    ///
    /// `APOLLO_NAMESPACES` accepts a comma-separated list.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`ClientConfig::load`], reading variables from `env` instead of the process when given.
    pub fn load_with_env(path: Option<&Path>, env: Option<Map<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("APOLLO")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("namespaces")
                .source(env),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Set the cluster
    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.cluster = cluster.to_string();
        self
    }

    /// Set the namespaces loaded at startup
    pub fn with_namespaces(mut self, namespaces: &[&str]) -> Self {
        self.namespaces = namespaces.iter().map(|ns| ns.to_string()).collect();
        self
    }

    /// Set the access key secret
    pub fn with_secret(mut self, secret: &str) -> Self {
        self.secret = Some(secret.to_string());
        self
    }

    /// Set the gray release label
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    /// Set the reported client IP
    pub fn with_client_ip(mut self, ip: &str) -> Self {
        self.client_ip = Some(ip.to_string());
        self
    }

    /// Enable or disable backups under the given directory
    pub fn with_backup(mut self, enabled: bool, path: impl Into<PathBuf>) -> Self {
        self.backup_enabled = enabled;
        self.backup_path = path.into();
        self
    }

    /// Mark the configuration as mandatory at startup
    pub fn with_must_start(mut self, must_start: bool) -> Self {
        self.must_start = must_start;
        self
    }

    /// Set the background sync strategy
    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Set timeouts for regular and long-poll requests
    pub fn with_timeouts(mut self, sync_ms: u64, notify_ms: u64) -> Self {
        self.sync_timeout_ms = sync_ms;
        self.notify_timeout_ms = notify_ms;
        self
    }

    /// Set the per-node retry budget and backoff
    pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.max_attempts = max_attempts;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    /// Set the TTL for cached keys, 0 disables expiry
    pub fn with_cache_ttl(mut self, ttl_ms: u64) -> Self {
        self.cache_ttl_ms = ttl_ms;
        self
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn notify_retry_delay(&self) -> Duration {
        Duration::from_millis(self.notify_retry_delay_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn discovery_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_refresh_interval_ms)
    }

    pub fn server_retry_window(&self) -> Duration {
        Duration::from_millis(self.server_retry_window_ms)
    }

    /// Cache TTL, `None` when keys never expire
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_ms > 0).then(|| Duration::from_millis(self.cache_ttl_ms))
    }

    /// Build the identity snapshot used by one sync cycle
    pub fn identity(&self) -> AppIdentity {
        AppIdentity {
            app_id: self.app_id.clone(),
            cluster: self.cluster.clone(),
            namespaces: self.namespaces.clone(),
            secret: self.secret.clone(),
            meta_server: self.meta_server.clone(),
            label: self.label.clone().filter(|l| !l.is_empty()),
            client_ip: self.client_ip.clone().unwrap_or_else(local_ip),
            sync_timeout: Duration::from_millis(self.sync_timeout_ms),
            backup_path: self.backup_path.clone(),
        }
    }
}

/// Immutable view of who this client is, taken once per sync cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppIdentity {
    pub app_id: String,
    pub cluster: String,
    pub namespaces: Vec<String>,
    pub secret: Option<String>,
    pub meta_server: String,
    pub label: Option<String>,
    pub client_ip: String,
    pub sync_timeout: Duration,
    pub backup_path: PathBuf,
}

impl AppIdentity {
    /// Copy of this identity with `namespace` appended, if it is not already present
    pub fn with_namespace(&self, namespace: &str) -> Option<Self> {
        if self.namespaces.iter().any(|ns| ns == namespace) {
            return None;
        }
        let mut next = self.clone();
        next.namespaces.push(namespace.to_string());
        Some(next)
    }
}

/// Get the first non-loopback IPv4 address, or "127.0.0.1"
pub fn local_ip() -> String {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|addrs| {
            addrs
                .into_iter()
                .find(|iface| !iface.is_loopback() && matches!(iface.addr, IfAddr::V4(_)))
                .and_then(|iface| match iface.addr {
                    IfAddr::V4(addr) => Some(addr.ip.to_string()),
                    _ => None,
                })
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.cluster, "default");
        assert_eq!(config.namespaces, vec!["application"]);
        assert_eq!(config.sync_timeout_ms, 1000);
        assert_eq!(config.notify_timeout_ms, 600_000);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.sync_mode, SyncMode::Notify);
        assert!(config.cache_ttl().is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::new("app1", "http://meta:8080")
            .with_cluster("dev")
            .with_namespaces(&["application", "db.yaml"])
            .with_secret("s3cret")
            .with_label("canary")
            .with_client_ip("10.0.0.1")
            .with_retry(3, 10)
            .with_cache_ttl(5000);

        assert_eq!(config.app_id, "app1");
        assert_eq!(config.meta_server, "http://meta:8080");
        assert_eq!(config.cluster, "dev");
        assert_eq!(config.namespaces.len(), 2);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_backoff(), Duration::from_millis(10));
        assert_eq!(config.cache_ttl(), Some(Duration::from_secs(5)));

        let identity = config.identity();
        assert_eq!(identity.client_ip, "10.0.0.1");
        assert_eq!(identity.label.as_deref(), Some("canary"));
        assert_eq!(identity.sync_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_identity_empty_label_dropped() {
        let identity = ClientConfig::new("app", "http://meta")
            .with_label("")
            .with_client_ip("1.1.1.1")
            .identity();
        assert!(identity.label.is_none());
    }

    #[test]
    fn test_identity_with_namespace() {
        let identity = ClientConfig::new("app", "http://meta")
            .with_client_ip("1.1.1.1")
            .identity();
        assert!(identity.with_namespace("application").is_none());

        let next = identity.with_namespace("db.yaml").unwrap();
        assert_eq!(next.namespaces, vec!["application", "db.yaml"]);
        assert_eq!(identity.namespaces, vec!["application"]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apollo.json");
        std::fs::write(
            &path,
            r#"{"app_id":"from-file","cluster":"prod","namespaces":["a","b"],"max_attempts":2}"#,
        )
        .unwrap();

        let config = ClientConfig::load(Some(&path)).unwrap();
        assert_eq!(config.app_id, "from-file");
        assert_eq!(config.cluster, "prod");
        assert_eq!(config.namespaces, vec!["a", "b"]);
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.sync_timeout_ms, 1000);
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apollo.json");
        std::fs::write(
            &path,
            r#"{"app_id":"from-file","cluster":"prod","namespaces":["x"],"max_attempts":2}"#,
        )
        .unwrap();

        let env = Map::from([
            ("APOLLO_APP_ID".to_string(), "from-env".to_string()),
            ("APOLLO_NAMESPACES".to_string(), "a,b".to_string()),
            ("APOLLO_MAX_ATTEMPTS".to_string(), "4".to_string()),
        ]);
        let config = ClientConfig::load_with_env(Some(&path), Some(env)).unwrap();

        assert_eq!(config.app_id, "from-env");
        assert_eq!(config.namespaces, vec!["a", "b"]);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.cluster, "prod");
    }

    #[test]
    fn test_env_only() {
        let env = Map::from([
            ("APOLLO_APP_ID".to_string(), "env-app".to_string()),
            ("APOLLO_META_SERVER".to_string(), "http://meta:8080".to_string()),
            ("APOLLO_NAMESPACES".to_string(), "application,db.yaml".to_string()),
        ]);
        let config = ClientConfig::load_with_env(None, Some(env)).unwrap();

        assert_eq!(config.app_id, "env-app");
        assert_eq!(config.meta_server, "http://meta:8080");
        assert_eq!(config.namespaces, vec!["application", "db.yaml"]);
        assert_eq!(config.cluster, "default");
    }

    #[test]
    fn test_local_ip_not_empty() {
        assert!(!local_ip().is_empty());
    }
}
