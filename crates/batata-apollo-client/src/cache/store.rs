//! Pluggable key-value store backing a namespace cache

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Key-level atomic store for one namespace.
///
/// Readers of a single key see either the old or the new value, never a mix.
pub trait CacheStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value`, expiring after `ttl` when given
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>);

    /// Returns whether the key was present
    fn delete(&self, key: &str) -> bool;

    /// Visit live entries until `f` returns `false`
    fn range(&self, f: &mut dyn FnMut(&str, &str) -> bool);

    fn clear(&self);

    fn count(&self) -> usize;

    /// Extend the TTL of every live entry without touching values
    fn touch(&self, ttl: Option<Duration>) {
        let mut entries = Vec::new();
        self.range(&mut |k, v| {
            entries.push((k.to_string(), v.to_string()));
            true
        });
        for (k, v) in entries {
            self.set(&k, &v, ttl);
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory store on a concurrent map
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn range(&self, f: &mut dyn FnMut(&str, &str) -> bool) {
        let now = Instant::now();
        for entry in self.entries.iter() {
            if entry.is_live(now) && !f(entry.key(), &entry.value) {
                break;
            }
        }
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn count(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    fn touch(&self, ttl: Option<Duration>) {
        let now = Instant::now();
        for mut entry in self.entries.iter_mut() {
            if entry.is_live(now) {
                entry.expires_at = ttl.map(|ttl| now + ttl);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let store = MemoryStore::new();
        store.set("a", "1", None);
        assert_eq!(store.get("a").as_deref(), Some("1"));
        assert_eq!(store.count(), 1);

        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_expired_entries_hidden() {
        let store = MemoryStore::new();
        store.set("gone", "x", Some(Duration::ZERO));
        store.set("kept", "y", None);

        assert!(store.get("gone").is_none());
        assert_eq!(store.count(), 1);

        let mut seen = Vec::new();
        store.range(&mut |k, _| {
            seen.push(k.to_string());
            true
        });
        assert_eq!(seen, vec!["kept"]);
    }

    #[test]
    fn test_touch_extends_ttl() {
        let store = MemoryStore::new();
        store.set("a", "1", Some(Duration::from_secs(60)));
        store.touch(None);
        assert_eq!(store.get("a").as_deref(), Some("1"));

        store.touch(Some(Duration::ZERO));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_clear() {
        let store = MemoryStore::new();
        store.set("a", "1", None);
        store.set("b", "2", None);
        store.clear();
        assert_eq!(store.count(), 0);
    }
}
