//! Remote sync client for the Apollo Config Service
//!
//! Provides:
//! - Protocol URL builders for config, notification and discovery requests
//! - A failover loop over the known config service nodes
//! - Bulk and long-poll sync strategies producing per-namespace outcomes

pub mod bulk;
pub mod notify;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::ConfigCache;
use crate::config::AppIdentity;
use crate::error::{ClientError, Result};
use crate::http::{Fetched, Fetcher};
use crate::model::{ApolloConfig, ApolloConfigNotification, ServiceDto};
use crate::parser::ParserRegistry;

use self::server::{ServerInfo, ServerRegistry};

pub use self::bulk::BulkSync;
pub use self::notify::{NotificationTable, NotifySync};

/// Result of syncing one namespace
#[derive(Debug)]
pub enum NamespaceSync {
    /// New record from the config service
    Fetched(ApolloConfig),
    /// The cached release is current
    NotModified,
    /// Remote sync failed and the namespace was seeded from its backup
    Backup(ApolloConfig),
    /// Remote sync failed, nothing to apply
    Failed(ClientError),
}

impl NamespaceSync {
    /// Whether the config service answered for this namespace
    pub fn is_remote_success(&self) -> bool {
        matches!(self, NamespaceSync::Fetched(_) | NamespaceSync::NotModified)
    }
}

#[derive(Debug)]
pub struct SyncOutcome {
    pub namespace: String,
    /// Start order of this sync among syncs of the same namespace
    pub ticket: u64,
    pub result: NamespaceSync,
}

impl SyncOutcome {
    pub fn new(namespace: &str, ticket: u64, result: NamespaceSync) -> Self {
        Self {
            namespace: namespace.to_string(),
            ticket,
            result,
        }
    }
}

/// Outcomes of one sync cycle
#[derive(Debug, Default)]
pub struct SyncReport {
    pub outcomes: Vec<SyncOutcome>,
    /// Set when the cycle failed as a whole, e.g. the long poll itself
    pub failure: Option<ClientError>,
}

/// One refresh cycle over the configured namespaces.
///
/// Strategies never write values; applying the outcomes is left to the caller,
/// which drops any record whose ticket was overtaken.
#[async_trait]
pub trait SyncStrategy: Send + Sync + 'static {
    async fn sync(&self, identity: &AppIdentity, cache: &ConfigCache) -> SyncReport;

    /// Start tracking a namespace added at runtime
    fn track(&self, _namespace: &str) {}
}

/// Protocol client shared by both strategies
#[derive(Clone)]
pub struct RemoteClient {
    fetcher: Fetcher,
    servers: Arc<ServerRegistry>,
    parsers: ParserRegistry,
    max_attempts: u32,
    notify_timeout: Duration,
}

impl RemoteClient {
    pub fn new(
        fetcher: Fetcher,
        servers: Arc<ServerRegistry>,
        parsers: ParserRegistry,
        max_attempts: u32,
        notify_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            servers,
            parsers,
            max_attempts,
            notify_timeout,
        }
    }

    pub fn servers(&self) -> &Arc<ServerRegistry> {
        &self.servers
    }

    // ============== URLs ==============

    /// `{host}configs/{appId}/{cluster}/{namespace}?releaseKey&ip&label`
    pub fn sync_url(
        host: &str,
        identity: &AppIdentity,
        namespace: &str,
        release_key: &str,
    ) -> Result<Url> {
        let mut url = base_url(host)?;
        extend_path(
            &mut url,
            &[
                "configs",
                identity.app_id.as_str(),
                identity.cluster.as_str(),
                namespace,
            ],
        )?;
        {
            let mut query = url.query_pairs_mut();
            if !release_key.is_empty() {
                query.append_pair("releaseKey", release_key);
            }
            query.append_pair("ip", &identity.client_ip);
            if let Some(label) = &identity.label {
                query.append_pair("label", label);
            }
        }
        Ok(url)
    }

    /// `{host}notifications/v2?appId&cluster&notifications&ip&label`
    pub fn notify_url(
        host: &str,
        identity: &AppIdentity,
        notifications: &[ApolloConfigNotification],
    ) -> Result<Url> {
        let notifications = serde_json::to_string(notifications).map_err(|e| {
            ClientError::ParseFailure {
                namespace: identity.namespaces.join(","),
                source: e,
            }
        })?;

        let mut url = base_url(host)?;
        extend_path(&mut url, &["notifications", "v2"])?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("appId", &identity.app_id)
                .append_pair("cluster", &identity.cluster)
                .append_pair("notifications", &notifications)
                .append_pair("ip", &identity.client_ip);
            if let Some(label) = &identity.label {
                query.append_pair("label", label);
            }
        }
        Ok(url)
    }

    /// `{meta}services/config?appId&ip`
    pub fn discovery_url(identity: &AppIdentity) -> Result<Url> {
        let mut url = base_url(&identity.meta_server)?;
        extend_path(&mut url, &["services", "config"])?;
        url.query_pairs_mut()
            .append_pair("appId", &identity.app_id)
            .append_pair("ip", &identity.client_ip);
        Ok(url)
    }

    // ============== Requests ==============

    /// Run one request against the selected nodes until one answers.
    ///
    /// A failed node is marked down before moving on. `401` is returned at
    /// once without marking the node down: a rejected signature fails the same
    /// way on every node, so it is surfaced to the caller instead of failing over.
    pub async fn request_with_failover<F>(
        &self,
        identity: &AppIdentity,
        timeout: Duration,
        build_url: F,
    ) -> Result<Fetched>
    where
        F: Fn(&str) -> Result<Url> + Send + Sync,
    {
        let meta = &identity.meta_server;
        let mut last_error = None;

        for _ in 0..=self.servers.len(meta) {
            let Some(host) = self.servers.select(meta) else {
                break;
            };
            let url = build_url(&host)?;

            match self.fetcher.fetch(&url, timeout, self.max_attempts).await {
                Ok(fetched) => return Ok(fetched),
                Err(e) if !e.is_node_failure() => return Err(e),
                Err(e) => {
                    warn!("Config service node {} failed: {}", host, e);
                    self.servers.mark_down(meta, &host);
                    last_error = Some(Box::new(e));
                }
            }
        }

        Err(ClientError::AllNodesFailed { last: last_error })
    }

    /// Fetch the current record of a namespace, `None` when `release_key` is current.
    pub async fn fetch_config(
        &self,
        identity: &AppIdentity,
        namespace: &str,
        release_key: &str,
    ) -> Result<Option<ApolloConfig>> {
        let fetched = self
            .request_with_failover(identity, identity.sync_timeout, |host| {
                Self::sync_url(host, identity, namespace, release_key)
            })
            .await?;

        let body = match fetched {
            Fetched::Body(body) => body,
            Fetched::NotModified => return Ok(None),
        };

        let mut config: ApolloConfig =
            serde_json::from_str(&body).map_err(|e| ClientError::ParseFailure {
                namespace: namespace.to_string(),
                source: e,
            })?;
        let configurations = std::mem::take(&mut config.configurations);
        config.configurations = self.parsers.transform(namespace, configurations);

        debug!(
            namespace = %namespace,
            "Fetched release {} with {} keys",
            config.release_key,
            config.configurations.len()
        );
        Ok(Some(config))
    }

    /// Long-poll for changed namespaces. An empty list means nothing changed.
    pub async fn poll_notifications(
        &self,
        identity: &AppIdentity,
        notifications: &[ApolloConfigNotification],
    ) -> Result<Vec<ApolloConfigNotification>> {
        let fetched = self
            .request_with_failover(identity, self.notify_timeout, |host| {
                Self::notify_url(host, identity, notifications)
            })
            .await?;

        match fetched {
            Fetched::NotModified => Ok(Vec::new()),
            Fetched::Body(body) if body.trim().is_empty() => Ok(Vec::new()),
            Fetched::Body(body) => {
                serde_json::from_str(&body).map_err(|e| ClientError::ParseFailure {
                    namespace: identity.namespaces.join(","),
                    source: e,
                })
            }
        }
    }

    /// Reload the replica list from the discovery endpoint.
    ///
    /// On failure, or when the service reports no replicas, the previous
    /// list is kept. Returns the number of known replicas.
    pub async fn refresh_servers(&self, identity: &AppIdentity) -> Result<usize> {
        let meta = &identity.meta_server;
        let url = Self::discovery_url(identity)?;

        let body = match self
            .fetcher
            .fetch(&url, identity.sync_timeout, self.max_attempts)
            .await?
        {
            Fetched::Body(body) => body,
            Fetched::NotModified => return Ok(self.servers.len(meta)),
        };

        let services: Vec<ServiceDto> =
            serde_json::from_str(&body).map_err(|e| ClientError::ParseFailure {
                namespace: "services/config".to_string(),
                source: e,
            })?;

        if services.is_empty() {
            info!("Discovery at {} returned no config service nodes", meta);
            return Ok(self.servers.len(meta));
        }

        let servers: Vec<ServerInfo> = services.into_iter().map(ServerInfo::from).collect();
        let count = servers.len();
        self.servers.replace(meta, servers);
        Ok(count)
    }
}

fn base_url(host: &str) -> Result<Url> {
    Ok(Url::parse(&server::normalize_url(host))?)
}

fn extend_path(url: &mut Url, segments: &[&str]) -> Result<()> {
    url.path_segments_mut()
        .map_err(|_| ClientError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .pop_if_empty()
        .extend(segments);
    Ok(())
}
