//! Long-poll sync driven by notification watermarks

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::cache::ConfigCache;
use crate::config::AppIdentity;
use crate::error::ClientError;
use crate::model::{ApolloConfigNotification, INITIAL_NOTIFICATION_ID};

use super::{BulkSync, SyncOutcome, SyncReport, SyncStrategy};

/// Last seen notification id per namespace
#[derive(Debug, Default)]
pub struct NotificationTable {
    ids: DashMap<String, i64>,
}

impl NotificationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a namespace at the initial watermark
    pub fn ensure(&self, namespace: &str) {
        self.ids
            .entry(namespace.to_string())
            .or_insert(INITIAL_NOTIFICATION_ID);
    }

    pub fn get(&self, namespace: &str) -> Option<i64> {
        self.ids.get(namespace).map(|id| *id)
    }

    pub fn advance(&self, namespace: &str, notification_id: i64) {
        self.ids.insert(namespace.to_string(), notification_id);
    }

    /// Query entries for `namespaces`, untracked ones at the initial watermark
    pub fn notifications(&self, namespaces: &[String]) -> Vec<ApolloConfigNotification> {
        namespaces
            .iter()
            .map(|ns| {
                ApolloConfigNotification::new(ns, self.get(ns).unwrap_or(INITIAL_NOTIFICATION_ID))
            })
            .collect()
    }

    pub fn snapshot(&self) -> HashMap<String, i64> {
        self.ids
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

/// Long-poll strategy.
///
/// Each cycle blocks on the notification endpoint, then fetches every
/// namespace reported as changed. A namespace's watermark only advances once
/// its own fetch succeeded, so a failed fetch is reported again by the next poll.
pub struct NotifySync {
    bulk: BulkSync,
    table: NotificationTable,
}

impl NotifySync {
    pub fn new(bulk: BulkSync) -> Self {
        Self {
            bulk,
            table: NotificationTable::new(),
        }
    }

    pub fn table(&self) -> &NotificationTable {
        &self.table
    }

    /// Run one poll cycle, limited to `only` when given.
    pub async fn poll(
        &self,
        identity: &AppIdentity,
        cache: &ConfigCache,
        only: Option<&str>,
    ) -> SyncReport {
        let namespaces: Vec<String> = match only {
            Some(ns) => vec![ns.to_string()],
            None => identity.namespaces.clone(),
        };
        for ns in &namespaces {
            self.table.ensure(ns);
        }

        let notifications = self.table.notifications(&namespaces);
        let changed = match self
            .bulk
            .remote()
            .poll_notifications(identity, &notifications)
            .await
        {
            Ok(changed) => changed,
            Err(e) => {
                warn!("Long poll for {} failed: {}", identity.app_id, e);
                let mut outcomes = Vec::new();
                for ns in &namespaces {
                    let ticket = cache.begin_sync(ns);
                    let error = ClientError::TransientNetwork(e.to_string());
                    let result = self.bulk.fallback(ns, error, cache).await;
                    outcomes.push(SyncOutcome::new(ns, ticket, result));
                }
                return SyncReport {
                    outcomes,
                    failure: Some(e),
                };
            }
        };

        let mut outcomes = Vec::with_capacity(changed.len());
        for notification in changed {
            let ns = notification.namespace_name.as_str();
            if !namespaces.iter().any(|n| n == ns) {
                debug!("Ignoring notification for untracked namespace {}", ns);
                continue;
            }

            let outcome = self.bulk.sync_namespace(identity, ns, cache).await;
            if outcome.result.is_remote_success() {
                self.table.advance(ns, notification.notification_id);
            }
            outcomes.push(outcome);
        }

        SyncReport {
            outcomes,
            failure: None,
        }
    }
}

#[async_trait]
impl SyncStrategy for NotifySync {
    async fn sync(&self, identity: &AppIdentity, cache: &ConfigCache) -> SyncReport {
        self.poll(identity, cache, None).await
    }

    fn track(&self, namespace: &str) {
        self.table.ensure(namespace);
    }
}
