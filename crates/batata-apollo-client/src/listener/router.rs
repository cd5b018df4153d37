//! Regex-keyed routing of changed keys to key listeners

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tracing::error;

use super::{ChangeEvent, ChangeListener};

/// Trait for receiving changes of keys matching a registered pattern.
pub trait KeyChangeListener: Send + Sync + 'static {
    /// `value` is the new value, or the old one when the key was deleted.
    fn on_key_change(&self, namespace: &str, key: &str, value: &str);
}

/// A simple key listener that invokes a closure.
pub struct FnKeyChangeListener<F>
where
    F: Fn(&str, &str, &str) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnKeyChangeListener<F>
where
    F: Fn(&str, &str, &str) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> KeyChangeListener for FnKeyChangeListener<F>
where
    F: Fn(&str, &str, &str) + Send + Sync + 'static,
{
    fn on_key_change(&self, namespace: &str, key: &str, value: &str) {
        (self.f)(namespace, key, value);
    }
}

#[derive(Clone)]
struct Binding {
    pattern: String,
    regex: Regex,
    listener: Arc<dyn KeyChangeListener>,
}

/// Routes each changed key to every listener bound to a matching pattern.
///
/// A `(listener, pattern)` pair is bound at most once.
#[derive(Default)]
pub struct KeyRouter {
    bindings: RwLock<Vec<Binding>>,
}

impl KeyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `listener` to each pattern. Nothing is bound if a pattern is invalid.
    pub fn register(
        &self,
        patterns: &[&str],
        listener: Arc<dyn KeyChangeListener>,
    ) -> Result<(), regex::Error> {
        let compiled = patterns
            .iter()
            .map(|p| Regex::new(p).map(|regex| (p.to_string(), regex)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut bindings = self.bindings.write();
        for (pattern, regex) in compiled {
            let exists = bindings
                .iter()
                .any(|b| b.pattern == pattern && Arc::ptr_eq(&b.listener, &listener));
            if !exists {
                bindings.push(Binding {
                    pattern,
                    regex,
                    listener: listener.clone(),
                });
            }
        }
        Ok(())
    }

    /// Remove the exact `(listener, pattern)` binding. Returns whether it existed.
    pub fn unregister(&self, pattern: &str, listener: &Arc<dyn KeyChangeListener>) -> bool {
        let mut bindings = self.bindings.write();
        let before = bindings.len();
        bindings.retain(|b| !(b.pattern == pattern && Arc::ptr_eq(&b.listener, listener)));
        bindings.len() != before
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// Deliver every matching `(key, value)` of an event
    pub fn route(&self, event: &ChangeEvent) {
        let bindings: Vec<Binding> = self.bindings.read().clone();
        if bindings.is_empty() {
            return;
        }

        for (key, change) in &event.changes {
            let Some(value) = change.effective_value() else {
                continue;
            };
            for binding in bindings.iter().filter(|b| b.regex.is_match(key)) {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    binding.listener.on_key_change(&event.namespace, key, value)
                }));
                if result.is_err() {
                    error!(
                        "Key listener for pattern {} panicked on key {}",
                        binding.pattern, key
                    );
                }
            }
        }
    }
}

impl ChangeListener for KeyRouter {
    fn on_change(&self, event: &ChangeEvent) {
        self.route(event);
    }
}
