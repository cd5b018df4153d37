//! Apollo client facade
//!
//! Owns the namespace caches, the listener dispatch and the two background
//! loops (config sync and replica discovery).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{AuthHook, HmacAuthHook};
use crate::backup::{BackupStore, FileBackupStore};
use crate::cache::{ConfigCache, NamespaceCache, StoreFactory};
use crate::config::{AppIdentity, ClientConfig, DEFAULT_NAMESPACE, SyncMode};
use crate::error::{ClientError, Result};
use crate::http::Fetcher;
use crate::listener::router::{KeyChangeListener, KeyRouter};
use crate::listener::{ChangeDispatcher, ChangeListener};
use crate::model::{ApolloConfig, ConfigFormat};
use crate::parser::{ContentParser, ParserRegistry};
use crate::remote::server::ServerRegistry;
use crate::remote::{
    BulkSync, NamespaceSync, NotifySync, RemoteClient, SyncOutcome, SyncReport, SyncStrategy,
};

/// Builder for [`ApolloClient`] with optional pluggable parts.
pub struct ApolloClientBuilder {
    config: ClientConfig,
    backup_store: Option<Arc<dyn BackupStore>>,
    auth_hook: Option<Arc<dyn AuthHook>>,
    parsers: ParserRegistry,
    store_factory: Option<StoreFactory>,
}

impl ApolloClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            backup_store: None,
            auth_hook: None,
            parsers: ParserRegistry::new(),
            store_factory: None,
        }
    }

    /// Replace the file backup under `backup_path`
    pub fn backup_store(mut self, store: Arc<dyn BackupStore>) -> Self {
        self.backup_store = Some(store);
        self
    }

    /// Replace the HMAC signer installed when a secret is configured
    pub fn auth_hook(mut self, hook: Arc<dyn AuthHook>) -> Self {
        self.auth_hook = Some(hook);
        self
    }

    pub fn parser(mut self, format: ConfigFormat, parser: Arc<dyn ContentParser>) -> Self {
        self.parsers.register(format, parser);
        self
    }

    pub fn store_factory(mut self, factory: StoreFactory) -> Self {
        self.store_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<ApolloClient> {
        let config = self.config;
        let identity = config.identity();

        let mut fetcher = Fetcher::new(config.retry_backoff())?;
        let auth_hook = self.auth_hook.or_else(|| {
            identity.secret.as_deref().map(|secret| {
                Arc::new(HmacAuthHook::new(&identity.app_id, secret)) as Arc<dyn AuthHook>
            })
        });
        if let Some(hook) = auth_hook {
            fetcher = fetcher.with_auth_hook(hook);
        }

        let servers = Arc::new(ServerRegistry::new(config.server_retry_window()));
        let remote = RemoteClient::new(
            fetcher,
            servers.clone(),
            self.parsers,
            config.max_attempts,
            config.notify_timeout(),
        );

        let backup = if config.backup_enabled {
            Some(self.backup_store.unwrap_or_else(|| {
                Arc::new(FileBackupStore::new(identity.backup_path.clone())) as Arc<dyn BackupStore>
            }))
        } else {
            None
        };

        let bulk = BulkSync::new(remote, backup.clone());
        let strategy: Arc<dyn SyncStrategy> = match config.sync_mode {
            SyncMode::Bulk => Arc::new(bulk.clone()),
            SyncMode::Notify => Arc::new(NotifySync::new(bulk.clone())),
        };

        let cache = match self.store_factory {
            Some(factory) => ConfigCache::with_store_factory(factory),
            None => ConfigCache::new(),
        };
        for ns in &identity.namespaces {
            cache.get_or_create(ns);
            strategy.track(ns);
        }

        let dispatcher = ChangeDispatcher::new(config.listener_queue_capacity);
        let key_router = Arc::new(KeyRouter::new());
        dispatcher.add_listener(key_router.clone());

        let (stop_tx, _) = watch::channel(false);

        Ok(ApolloClient {
            inner: Arc::new(ClientInner {
                config,
                identity: RwLock::new(identity),
                bulk,
                strategy,
                cache,
                dispatcher,
                key_router,
                backup,
                servers,
            }),
            started: AtomicBool::new(false),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

struct ClientInner {
    config: ClientConfig,
    identity: RwLock<AppIdentity>,
    bulk: BulkSync,
    strategy: Arc<dyn SyncStrategy>,
    cache: ConfigCache,
    dispatcher: ChangeDispatcher,
    key_router: Arc<KeyRouter>,
    backup: Option<Arc<dyn BackupStore>>,
    servers: Arc<ServerRegistry>,
}

impl ClientInner {
    fn identity(&self) -> AppIdentity {
        self.identity.read().clone()
    }

    async fn refresh_servers(&self, identity: &AppIdentity) {
        match self.bulk.remote().refresh_servers(identity).await {
            Ok(count) => debug!("{} config service nodes known", count),
            Err(e) => warn!(
                "Config service discovery via {} failed: {}",
                identity.meta_server, e
            ),
        }
    }

    async fn apply_report(&self, report: SyncReport) {
        for outcome in report.outcomes {
            self.apply_outcome(outcome).await;
        }
    }

    /// Apply one outcome under the namespace's update lock.
    ///
    /// A fetched record is dropped when a sync of the same namespace that
    /// started later was applied first. A backup record only seeds a namespace
    /// that is still unloaded once the lock is held.
    async fn apply_outcome(&self, outcome: SyncOutcome) {
        let ns = self.cache.get_or_create(&outcome.namespace);
        let _guard = ns.lock_updates().await;

        match outcome.result {
            NamespaceSync::Fetched(config) => {
                if !ns.claim_sync(outcome.ticket) {
                    debug!(
                        namespace = %outcome.namespace,
                        "Dropping release {} overtaken by a later sync", config.release_key
                    );
                    return;
                }
                self.apply_config(&ns, &config);
                self.save_backup(ns.clone(), config);
            }
            NamespaceSync::Backup(config) if !ns.is_initialized() => {
                self.apply_config(&ns, &config)
            }
            NamespaceSync::Backup(config) => debug!(
                namespace = %outcome.namespace,
                "Namespace loaded meanwhile, ignoring backup release {}", config.release_key
            ),
            NamespaceSync::NotModified => ns.touch(self.config.cache_ttl()),
            NamespaceSync::Failed(e) => {
                debug!(namespace = %outcome.namespace, "Keeping cached values: {}", e)
            }
        }
    }

    /// Update and dispatch; the caller holds the namespace's update lock
    fn apply_config(&self, ns: &NamespaceCache, config: &ApolloConfig) {
        if let Some(event) = ns.apply(config, self.config.cache_ttl()) {
            info!(
                namespace = %ns.name(),
                "Applied release {} ({} changed keys)",
                config.release_key,
                event.changes.len()
            );
            self.dispatcher.dispatch(event, ns.full_event());
        }
    }

    /// Write the snapshot in the background, skipping releases already superseded.
    fn save_backup(&self, ns: Arc<NamespaceCache>, config: ApolloConfig) {
        let Some(backup) = self.backup.clone() else {
            return;
        };
        tokio::spawn(write_backup(backup, ns, config));
    }

    fn check_loaded(&self, identity: &AppIdentity) -> Result<()> {
        if !self.config.must_start {
            return Ok(());
        }
        if identity
            .namespaces
            .iter()
            .any(|ns| self.cache.is_initialized(ns))
        {
            return Ok(());
        }
        match identity.namespaces.first() {
            Some(ns) => Err(ClientError::BackupUnavailable {
                namespace: ns.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Apollo config client.
///
/// Keeps the configured namespaces in sync with the config service and
/// notifies listeners of every change. Dropping the client stops its
/// background loops.
pub struct ApolloClient {
    inner: Arc<ClientInner>,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ApolloClient {
    pub fn builder(config: ClientConfig) -> ApolloClientBuilder {
        ApolloClientBuilder::new(config)
    }

    pub fn new(config: ClientConfig) -> Result<Self> {
        ApolloClientBuilder::new(config).build()
    }

    // ============== Lifecycle ==============

    /// Load every namespace once and start the background loops.
    ///
    /// Fails only when `must_start` is set and no namespace could be loaded
    /// from the config service or a backup.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_tx.send_replace(false);

        let identity = self.inner.identity();
        info!(
            "Starting Apollo client for app {} on {} ({} namespaces)",
            identity.app_id,
            identity.meta_server,
            identity.namespaces.len()
        );

        self.inner.refresh_servers(&identity).await;
        if let Err(e) = self.sync_all().await {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(run_sync_loop(
            self.inner.clone(),
            self.stop_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(run_discovery_loop(
            self.inner.clone(),
            self.stop_tx.subscribe(),
        )));
        Ok(())
    }

    /// Stop the background loops and wait for them to finish.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.started.store(false, Ordering::Release);
        info!("Apollo client stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    // ============== Sync ==============

    /// Fetch every namespace once and apply the results.
    pub async fn sync_all(&self) -> Result<()> {
        let identity = self.inner.identity();
        let report = self.inner.bulk.sync_all(&identity, &self.inner.cache).await;
        self.inner.apply_report(report).await;
        self.inner.check_loaded(&identity)
    }

    /// Run one cycle of the configured strategy and apply the results.
    ///
    /// Returns the cycle's failure, after any backup fallback was applied.
    pub async fn sync_once(&self) -> Result<()> {
        let identity = self.inner.identity();
        let mut report = self
            .inner
            .strategy
            .sync(&identity, &self.inner.cache)
            .await;
        let failure = report.failure.take();
        self.inner.apply_report(report).await;
        failure.map_or(Ok(()), Err)
    }

    // ============== Namespaces ==============

    pub fn namespace(&self, namespace: &str) -> Option<Arc<NamespaceCache>> {
        self.inner.cache.get(namespace)
    }

    /// Namespace cache, loading the namespace first if it is not known yet.
    pub async fn namespace_and_init(&self, namespace: &str) -> Result<Arc<NamespaceCache>> {
        if let Some(ns) = self.inner.cache.get(namespace)
            && ns.is_initialized()
        {
            return Ok(ns);
        }

        let identity = {
            let mut identity = self.inner.identity.write();
            if let Some(next) = identity.with_namespace(namespace) {
                *identity = next;
            }
            identity.clone()
        };
        self.inner.strategy.track(namespace);
        let ns = self.inner.cache.get_or_create(namespace);

        let outcome = self
            .inner
            .bulk
            .sync_namespace(&identity, namespace, &self.inner.cache)
            .await;
        self.inner.apply_outcome(outcome).await;

        if ns.is_initialized() {
            Ok(ns)
        } else {
            Err(ClientError::BackupUnavailable {
                namespace: namespace.to_string(),
            })
        }
    }

    /// Wait until `namespace` completed its first load, up to `timeout`.
    pub async fn wait_for_namespace(&self, namespace: &str, timeout: Duration) -> bool {
        self.inner
            .cache
            .get_or_create(namespace)
            .wait_ready(timeout)
            .await
    }

    // ============== Default namespace accessors ==============

    fn default_namespace(&self) -> Option<Arc<NamespaceCache>> {
        self.inner.cache.get(DEFAULT_NAMESPACE)
    }

    pub fn get_value(&self, key: &str) -> Option<String> {
        self.default_namespace().and_then(|ns| ns.get_value(key))
    }

    pub fn get_string_value(&self, key: &str, default: &str) -> String {
        self.default_namespace()
            .map(|ns| ns.get_string_value(key, default))
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_int_value(&self, key: &str, default: i64) -> i64 {
        self.default_namespace()
            .map_or(default, |ns| ns.get_int_value(key, default))
    }

    pub fn get_float_value(&self, key: &str, default: f64) -> f64 {
        self.default_namespace()
            .map_or(default, |ns| ns.get_float_value(key, default))
    }

    pub fn get_bool_value(&self, key: &str, default: bool) -> bool {
        self.default_namespace()
            .map_or(default, |ns| ns.get_bool_value(key, default))
    }

    pub fn get_string_slice_value(
        &self,
        key: &str,
        separator: &str,
        default: Vec<String>,
    ) -> Vec<String> {
        match self.default_namespace() {
            Some(ns) => ns.get_string_slice_value(key, separator, default),
            None => default,
        }
    }

    pub fn get_int_slice_value(&self, key: &str, separator: &str, default: Vec<i64>) -> Vec<i64> {
        match self.default_namespace() {
            Some(ns) => ns.get_int_slice_value(key, separator, default),
            None => default,
        }
    }

    // ============== Listeners ==============

    /// Returns `false` if the listener was already registered.
    pub fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> bool {
        self.inner.dispatcher.add_listener(listener)
    }

    pub fn remove_change_listener(&self, listener: &Arc<dyn ChangeListener>) -> bool {
        self.inner.dispatcher.remove_listener(listener)
    }

    /// Registered whole-event listeners, in registration order
    pub fn listeners(&self) -> Vec<Arc<dyn ChangeListener>> {
        let router: Arc<dyn ChangeListener> = self.inner.key_router.clone();
        let mut listeners = self.inner.dispatcher.listeners();
        listeners.retain(|l| !Arc::ptr_eq(l, &router));
        listeners
    }

    /// Bind a key listener to every pattern; nothing is bound if one is invalid.
    pub fn add_key_listener(
        &self,
        patterns: &[&str],
        listener: Arc<dyn KeyChangeListener>,
    ) -> Result<()> {
        self.inner
            .key_router
            .register(patterns, listener)
            .map_err(|e| ClientError::Other(e.into()))
    }

    pub fn remove_key_listener(&self, pattern: &str, listener: &Arc<dyn KeyChangeListener>) -> bool {
        self.inner.key_router.unregister(pattern, listener)
    }

    pub fn key_router(&self) -> &Arc<KeyRouter> {
        &self.inner.key_router
    }

    // ============== Diagnostics ==============

    pub fn server_registry(&self) -> Arc<ServerRegistry> {
        self.inner.servers.clone()
    }

    /// Current identity snapshot
    pub fn identity(&self) -> AppIdentity {
        self.inner.identity()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &ConfigCache {
        &self.inner.cache
    }
}

impl Drop for ApolloClient {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

async fn write_backup(backup: Arc<dyn BackupStore>, ns: Arc<NamespaceCache>, config: ApolloConfig) {
    let _guard = ns.lock_backup().await;
    if ns.release_key() != config.release_key {
        debug!(
            namespace = %config.namespace_name,
            "Skipping backup of superseded release {}", config.release_key
        );
        return;
    }
    if let Err(e) = backup.save(&config).await {
        warn!(
            namespace = %config.namespace_name,
            "Failed to save backup snapshot: {}", e
        );
    }
}

/// Sleep for `delay`; `false` when stop was signalled first
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = stop.changed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn run_sync_loop(inner: Arc<ClientInner>, mut stop: watch::Receiver<bool>) {
    let mode = inner.config.sync_mode;
    debug!("Sync loop started in {:?} mode", mode);

    loop {
        if mode == SyncMode::Bulk && !wait_or_stop(&mut stop, inner.config.refresh_interval()).await
        {
            break;
        }

        let identity = inner.identity();
        let report = tokio::select! {
            _ = stop.changed() => break,
            report = inner.strategy.sync(&identity, &inner.cache) => report,
        };

        let failed = report.failure.is_some();
        inner.apply_report(report).await;

        if failed && !wait_or_stop(&mut stop, inner.config.notify_retry_delay()).await {
            break;
        }
    }

    debug!("Sync loop stopped");
}

async fn run_discovery_loop(inner: Arc<ClientInner>, mut stop: watch::Receiver<bool>) {
    let interval = inner.config.discovery_refresh_interval();
    while wait_or_stop(&mut stop, interval).await {
        let identity = inner.identity();
        tokio::select! {
            _ = stop.changed() => break,
            _ = inner.refresh_servers(&identity) => {}
        }
    }
    debug!("Discovery loop stopped");
}
