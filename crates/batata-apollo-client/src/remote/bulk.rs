//! One-shot full refresh of every configured namespace

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::backup::BackupStore;
use crate::cache::ConfigCache;
use crate::config::AppIdentity;
use crate::error::ClientError;

use super::{NamespaceSync, RemoteClient, SyncOutcome, SyncReport, SyncStrategy};

/// Fetches each namespace in turn, falling back to its backup on failure.
#[derive(Clone)]
pub struct BulkSync {
    remote: RemoteClient,
    backup: Option<Arc<dyn BackupStore>>,
}

impl BulkSync {
    pub fn new(remote: RemoteClient, backup: Option<Arc<dyn BackupStore>>) -> Self {
        Self { remote, backup }
    }

    pub fn remote(&self) -> &RemoteClient {
        &self.remote
    }

    /// Sync one namespace against its cached release key
    pub async fn sync_namespace(
        &self,
        identity: &AppIdentity,
        namespace: &str,
        cache: &ConfigCache,
    ) -> SyncOutcome {
        let ticket = cache.begin_sync(namespace);
        let release_key = cache.release_key(namespace);
        let result = match self
            .remote
            .fetch_config(identity, namespace, &release_key)
            .await
        {
            Ok(Some(config)) => NamespaceSync::Fetched(config),
            Ok(None) => NamespaceSync::NotModified,
            Err(e) => self.fallback(namespace, e, cache).await,
        };
        SyncOutcome::new(namespace, ticket, result)
    }

    /// Sync every namespace of `identity`; a failing namespace never blocks the others.
    pub async fn sync_all(&self, identity: &AppIdentity, cache: &ConfigCache) -> SyncReport {
        let mut outcomes = Vec::with_capacity(identity.namespaces.len());
        for namespace in &identity.namespaces {
            outcomes.push(self.sync_namespace(identity, namespace, cache).await);
        }
        SyncReport {
            outcomes,
            failure: None,
        }
    }

    /// Outcome for a namespace whose remote sync failed.
    ///
    /// The backup is only consulted while the namespace has never been loaded.
    pub async fn fallback(
        &self,
        namespace: &str,
        error: ClientError,
        cache: &ConfigCache,
    ) -> NamespaceSync {
        warn!(namespace = %namespace, "Sync failed: {}", error);

        if cache.is_initialized(namespace) {
            return NamespaceSync::Failed(error);
        }
        let Some(backup) = &self.backup else {
            return NamespaceSync::Failed(error);
        };

        match backup.load(namespace).await {
            Ok(Some(config)) => {
                info!(
                    namespace = %namespace,
                    "Loaded backup snapshot with release {}",
                    config.release_key
                );
                NamespaceSync::Backup(config)
            }
            Ok(None) => NamespaceSync::Failed(ClientError::BackupUnavailable {
                namespace: namespace.to_string(),
            }),
            Err(e) => {
                warn!(namespace = %namespace, "Failed to load backup snapshot: {}", e);
                NamespaceSync::Failed(ClientError::BackupUnavailable {
                    namespace: namespace.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl SyncStrategy for BulkSync {
    async fn sync(&self, identity: &AppIdentity, cache: &ConfigCache) -> SyncReport {
        self.sync_all(identity, cache).await
    }
}
