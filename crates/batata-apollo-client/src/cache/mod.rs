//! Per-namespace config cache and change diff engine
//!
//! Values are stored as strings; typed accessors convert on read and fall
//! back to the caller's default instead of failing.

pub mod store;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard, watch};

use crate::listener::{ChangeEvent, ConfigChange, FullChangeEvent};
use crate::model::{ApolloConfig, ApolloConnConfig, CONTENT_KEY};

use self::store::{CacheStore, MemoryStore};

/// Creates the store for a newly seen namespace
pub type StoreFactory = Arc<dyn Fn() -> Box<dyn CacheStore> + Send + Sync>;

/// Cached state of one namespace.
pub struct NamespaceCache {
    name: String,
    store: Box<dyn CacheStore>,
    /// Guards the values together with the version pointer
    section: RwLock<Option<ApolloConnConfig>>,
    initialized: AtomicBool,
    ready: watch::Sender<bool>,
    update_lock: Mutex<()>,
    /// Last ticket handed out by `begin_sync`
    sync_seq: AtomicU64,
    /// Ticket of the sync whose record is currently applied
    applied_seq: AtomicU64,
    backup_lock: Mutex<()>,
}

impl NamespaceCache {
    pub fn new(name: &str) -> Self {
        Self::with_store(name, Box::new(MemoryStore::new()))
    }

    pub fn with_store(name: &str, store: Box<dyn CacheStore>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            store,
            section: RwLock::new(None),
            initialized: AtomicBool::new(false),
            ready,
            update_lock: Mutex::new(()),
            sync_seq: AtomicU64::new(0),
            applied_seq: AtomicU64::new(0),
            backup_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serializes update-and-dispatch for this namespace
    pub async fn lock_updates(&self) -> MutexGuard<'_, ()> {
        self.update_lock.lock().await
    }

    /// Serializes backup writes for this namespace
    pub async fn lock_backup(&self) -> MutexGuard<'_, ()> {
        self.backup_lock.lock().await
    }

    /// Ticket for a sync starting now; later syncs get larger tickets.
    pub fn begin_sync(&self) -> u64 {
        self.sync_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Claim the namespace for the record of sync `ticket`.
    ///
    /// Returns `false` when a sync started later has already been applied, in
    /// which case the record must be dropped. Call with the update lock held.
    pub fn claim_sync(&self, ticket: u64) -> bool {
        if ticket <= self.applied_seq.load(Ordering::Acquire) {
            return false;
        }
        self.applied_seq.store(ticket, Ordering::Release);
        true
    }

    /// Replace the values with `incoming`, returning the non-empty diff.
    pub fn update(
        &self,
        incoming: &HashMap<String, String>,
        ttl: Option<Duration>,
    ) -> Option<ChangeEvent> {
        let _section = self.section.write();
        let changes = self.apply_values(incoming, ttl);
        self.mark_initialized();
        self.into_event(changes)
    }

    /// Replace values and version pointer of this namespace in one write section.
    pub fn apply(&self, config: &ApolloConfig, ttl: Option<Duration>) -> Option<ChangeEvent> {
        let mut section = self.section.write();
        let changes = self.apply_values(&config.configurations, ttl);
        *section = Some(config.connection());
        self.mark_initialized();
        self.into_event(changes)
    }

    /// Refresh the TTL of every key without changing any value.
    pub fn touch(&self, ttl: Option<Duration>) {
        let _section = self.section.read();
        self.store.touch(ttl);
    }

    fn apply_values(
        &self,
        incoming: &HashMap<String, String>,
        ttl: Option<Duration>,
    ) -> HashMap<String, ConfigChange> {
        let mut seen: HashSet<String> = HashSet::new();
        self.store.range(&mut |k, _| {
            seen.insert(k.to_string());
            true
        });

        let mut changes = HashMap::new();
        if incoming.is_empty() && seen.is_empty() {
            return changes;
        }

        for (key, value) in incoming {
            if seen.remove(key) {
                match self.store.get(key) {
                    Some(old) if old != *value => {
                        changes.insert(key.clone(), ConfigChange::modified(&old, value));
                    }
                    Some(_) => {}
                    None => {
                        changes.insert(key.clone(), ConfigChange::added(value));
                    }
                }
            } else {
                changes.insert(key.clone(), ConfigChange::added(value));
            }
            self.store.set(key, value, ttl);
        }

        for key in seen {
            if let Some(old) = self.store.get(&key) {
                changes.insert(key.clone(), ConfigChange::deleted(&old));
            }
            self.store.delete(&key);
        }

        changes
    }

    fn into_event(&self, changes: HashMap<String, ConfigChange>) -> Option<ChangeEvent> {
        if changes.is_empty() {
            return None;
        }
        Some(ChangeEvent {
            namespace: self.name.clone(),
            changes,
        })
    }

    fn mark_initialized(&self) {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            self.ready.send_replace(true);
        }
    }

    /// Whether the first load has completed
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Block until the first load completes or `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        if self.is_initialized() {
            return true;
        }
        let mut rx = self.ready.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        )
    }

    /// Current release key, empty until loaded from a record
    pub fn release_key(&self) -> String {
        self.section
            .read()
            .as_ref()
            .map(|c| c.release_key.clone())
            .unwrap_or_default()
    }

    /// Current version pointer
    pub fn connection(&self) -> Option<ApolloConnConfig> {
        self.section.read().clone()
    }

    /// Consistent copy of all values with the release key they belong to
    pub fn snapshot(&self) -> (HashMap<String, String>, String) {
        let section = self.section.read();
        let mut values = HashMap::new();
        self.store.range(&mut |k, v| {
            values.insert(k.to_string(), v.to_string());
            true
        });
        let release_key = section
            .as_ref()
            .map(|c| c.release_key.clone())
            .unwrap_or_default();
        (values, release_key)
    }

    /// Copy of all values
    pub fn values(&self) -> HashMap<String, String> {
        self.snapshot().0
    }

    pub fn full_event(&self) -> FullChangeEvent {
        FullChangeEvent {
            namespace: self.name.clone(),
            configurations: self.values(),
        }
    }

    // ============== Accessors ==============

    pub fn get_value(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    /// Raw value, or `default` when missing
    pub fn get_string_value(&self, key: &str, default: &str) -> String {
        self.get_value(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_int_value(&self, key: &str, default: i64) -> i64 {
        self.get_parsed(key).unwrap_or(default)
    }

    pub fn get_float_value(&self, key: &str, default: f64) -> f64 {
        self.get_parsed(key).unwrap_or(default)
    }

    pub fn get_bool_value(&self, key: &str, default: bool) -> bool {
        self.get_value(key)
            .and_then(|v| parse_bool(&v))
            .unwrap_or(default)
    }

    /// Value split on `separator`, or `default` when missing
    pub fn get_string_slice_value(
        &self,
        key: &str,
        separator: &str,
        default: Vec<String>,
    ) -> Vec<String> {
        match self.get_value(key) {
            Some(v) if !separator.is_empty() => v.split(separator).map(str::to_string).collect(),
            Some(v) => vec![v],
            None => default,
        }
    }

    /// Value split on `separator` with every item parsed, or `default` if any item fails
    pub fn get_int_slice_value(&self, key: &str, separator: &str, default: Vec<i64>) -> Vec<i64> {
        self.get_value(key)
            .filter(|_| !separator.is_empty())
            .and_then(|v| {
                v.split(separator)
                    .map(|item| item.trim().parse::<i64>().ok())
                    .collect::<Option<Vec<_>>>()
            })
            .unwrap_or(default)
    }

    /// Raw body of a non-properties namespace
    pub fn content(&self) -> Option<String> {
        self.get_value(CONTENT_KEY)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        self.store.range(&mut |k, _| {
            keys.push(k.to_string());
            true
        });
        keys
    }

    /// Visit entries until `f` returns `false`
    pub fn range(&self, f: &mut dyn FnMut(&str, &str) -> bool) {
        self.store.range(f);
    }

    pub fn count(&self) -> usize {
        self.store.count()
    }

    /// Drop every value; the namespace stays initialized
    pub fn clear(&self) {
        let _section = self.section.write();
        self.store.clear();
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get_value(key).and_then(|v| v.trim().parse().ok())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "t" | "T" => Some(true),
        "0" | "f" | "F" => Some(false),
        v if v.eq_ignore_ascii_case("true") => Some(true),
        v if v.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

/// All namespace caches of a client
pub struct ConfigCache {
    namespaces: DashMap<String, Arc<NamespaceCache>>,
    store_factory: StoreFactory,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::with_store_factory(Arc::new(|| Box::new(MemoryStore::new()) as Box<dyn CacheStore>))
    }

    pub fn with_store_factory(store_factory: StoreFactory) -> Self {
        Self {
            namespaces: DashMap::new(),
            store_factory,
        }
    }

    pub fn get(&self, namespace: &str) -> Option<Arc<NamespaceCache>> {
        self.namespaces.get(namespace).map(|e| e.clone())
    }

    pub fn get_or_create(&self, namespace: &str) -> Arc<NamespaceCache> {
        self.namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| {
                Arc::new(NamespaceCache::with_store(
                    namespace,
                    (self.store_factory)(),
                ))
            })
            .clone()
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    /// Whether the namespace has completed its first load
    pub fn is_initialized(&self, namespace: &str) -> bool {
        self.get(namespace).is_some_and(|ns| ns.is_initialized())
    }

    /// Ticket for a sync of `namespace` starting now
    pub fn begin_sync(&self, namespace: &str) -> u64 {
        self.get_or_create(namespace).begin_sync()
    }

    pub fn release_key(&self, namespace: &str) -> String {
        self.get(namespace)
            .map(|ns| ns.release_key())
            .unwrap_or_default()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new()
    }
}
