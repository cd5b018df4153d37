//! Config service replica registry and failover host selection

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::model::ServiceDto;

/// One known config service replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub homepage_url: String,
    pub instance_id: String,
    pub down: bool,
    /// When a down node becomes selectable again
    pub next_try_at: Option<Instant>,
}

impl ServerInfo {
    pub fn new(homepage_url: &str, instance_id: &str) -> Self {
        Self {
            homepage_url: normalize_url(homepage_url),
            instance_id: instance_id.to_string(),
            down: false,
            next_try_at: None,
        }
    }

    fn is_available(&self, now: Instant) -> bool {
        !self.down || self.next_try_at.is_some_and(|at| at <= now)
    }
}

impl From<ServiceDto> for ServerInfo {
    fn from(dto: ServiceDto) -> Self {
        ServerInfo::new(&dto.homepage_url, &dto.instance_id)
    }
}

/// Replica list for one discovery address
#[derive(Debug, Default)]
struct ServerSet {
    servers: Vec<ServerInfo>,
    cursor: usize,
    /// Direct connection to the meta address is bypassed until then
    direct_retry_at: Option<Instant>,
}

/// Tracks known replicas per discovery address.
///
/// Down nodes are skipped until their retry window elapses or the list is
/// replaced by a discovery refresh. Selection rotates a cursor across the
/// replicas in discovery order.
pub struct ServerRegistry {
    sets: Mutex<HashMap<String, ServerSet>>,
    retry_window: Duration,
}

impl ServerRegistry {
    pub fn new(retry_window: Duration) -> Self {
        Self {
            sets: Mutex::new(HashMap::new()),
            retry_window,
        }
    }

    /// Replace the whole replica list for a discovery address.
    pub fn replace(&self, discovery_addr: &str, servers: Vec<ServerInfo>) {
        let key = normalize_url(discovery_addr);
        info!(
            "Refreshed config service list for {}: {} nodes",
            key,
            servers.len()
        );
        let mut sets = self.sets.lock();
        sets.insert(
            key,
            ServerSet {
                servers,
                cursor: 0,
                direct_retry_at: None,
            },
        );
    }

    /// Mark every replica whose URL matches `host` as down.
    ///
    /// Marking the discovery address itself also bypasses direct connection to
    /// it until the retry window elapses.
    pub fn mark_down(&self, discovery_addr: &str, host: &str) {
        let key = normalize_url(discovery_addr);
        let host = normalize_url(host);
        let next_try_at = Instant::now() + self.retry_window;

        let mut sets = self.sets.lock();
        let set = sets.entry(key.clone()).or_default();

        for server in set
            .servers
            .iter_mut()
            .filter(|s| s.homepage_url.contains(&host) || host.contains(&s.homepage_url))
        {
            debug!("Marking config service node down: {}", server.homepage_url);
            server.down = true;
            server.next_try_at = Some(next_try_at);
        }

        if host == key {
            set.direct_retry_at = Some(next_try_at);
        }
    }

    /// Pick the next available node for a discovery address.
    ///
    /// With no known replicas the discovery address itself is returned, unless
    /// it is inside its retry window.
    pub fn select(&self, discovery_addr: &str) -> Option<String> {
        let key = normalize_url(discovery_addr);
        let now = Instant::now();

        let mut sets = self.sets.lock();
        let set = sets.entry(key.clone()).or_default();

        if set.servers.is_empty() {
            return match set.direct_retry_at {
                Some(at) if at > now => None,
                _ => Some(key),
            };
        }

        let len = set.servers.len();
        for offset in 0..len {
            let index = (set.cursor + offset) % len;
            let server = &mut set.servers[index];
            if server.is_available(now) {
                if server.down {
                    server.down = false;
                    server.next_try_at = None;
                }
                set.cursor = (index + 1) % len;
                return Some(server.homepage_url.clone());
            }
        }

        None
    }

    /// Number of known replicas for a discovery address
    pub fn len(&self, discovery_addr: &str) -> usize {
        self.sets
            .lock()
            .get(&normalize_url(discovery_addr))
            .map(|s| s.servers.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, discovery_addr: &str) -> bool {
        self.len(discovery_addr) == 0
    }

    /// Whether requests go straight to the discovery address
    pub fn is_connect_directly(&self, discovery_addr: &str) -> bool {
        let now = Instant::now();
        self.sets
            .lock()
            .get(&normalize_url(discovery_addr))
            .map(|s| s.servers.is_empty() && s.direct_retry_at.is_none_or(|at| at <= now))
            .unwrap_or(true)
    }

    /// Snapshot of the replicas known for a discovery address
    pub fn servers(&self, discovery_addr: &str) -> Vec<ServerInfo> {
        self.sets
            .lock()
            .get(&normalize_url(discovery_addr))
            .map(|s| s.servers.clone())
            .unwrap_or_default()
    }
}

/// Normalize a base URL to end with a single `/`
pub fn normalize_url(url: &str) -> String {
    format!("{}/", url.trim().trim_end_matches('/'))
}
