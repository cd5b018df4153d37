//! Change events and their delivery to listeners
//!
//! Every whole-event listener owns a bounded queue drained by its own task, so a
//! slow or panicking listener never holds up the others or the sync loop.
//! Events for one namespace reach a given listener in the order they were
//! dispatched.

pub mod router;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Kind of change for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// Change of a single key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub change_type: ChangeType,
}

impl ConfigChange {
    pub fn added(new_value: &str) -> Self {
        Self {
            old_value: None,
            new_value: Some(new_value.to_string()),
            change_type: ChangeType::Added,
        }
    }

    pub fn modified(old_value: &str, new_value: &str) -> Self {
        Self {
            old_value: Some(old_value.to_string()),
            new_value: Some(new_value.to_string()),
            change_type: ChangeType::Modified,
        }
    }

    pub fn deleted(old_value: &str) -> Self {
        Self {
            old_value: Some(old_value.to_string()),
            new_value: None,
            change_type: ChangeType::Deleted,
        }
    }

    /// New value for added/modified keys, old value for deleted ones
    pub fn effective_value(&self) -> Option<&str> {
        match self.change_type {
            ChangeType::Deleted => self.old_value.as_deref(),
            _ => self.new_value.as_deref(),
        }
    }
}

/// Non-empty diff of one namespace update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub namespace: String,
    pub changes: HashMap<String, ConfigChange>,
}

/// Complete key-value state of a namespace after a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullChangeEvent {
    pub namespace: String,
    pub configurations: HashMap<String, String>,
}

/// Trait for receiving config change events.
pub trait ChangeListener: Send + Sync + 'static {
    /// Called with the diff of every non-empty update.
    fn on_change(&self, event: &ChangeEvent);

    /// Called with the full new state after every non-empty update.
    fn on_newest_change(&self, _event: &FullChangeEvent) {}
}

/// A simple listener that invokes a closure.
pub struct FnChangeListener<F>
where
    F: Fn(&ChangeEvent) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnChangeListener<F>
where
    F: Fn(&ChangeEvent) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ChangeListener for FnChangeListener<F>
where
    F: Fn(&ChangeEvent) + Send + Sync + 'static,
{
    fn on_change(&self, event: &ChangeEvent) {
        (self.f)(event);
    }
}

/// A diff and the full state it produced, queued as one unit
#[derive(Clone)]
struct Delivery {
    change: Arc<ChangeEvent>,
    full: Arc<FullChangeEvent>,
}

struct ListenerSlot {
    listener: Arc<dyn ChangeListener>,
    queue: OnceLock<mpsc::Sender<Delivery>>,
}

impl ListenerSlot {
    /// Queue for this listener, spawning its worker on first use
    fn sender(&self, capacity: usize) -> &mpsc::Sender<Delivery> {
        self.queue.get_or_init(|| {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            tokio::spawn(run_listener(self.listener.clone(), rx));
            tx
        })
    }
}

async fn run_listener(listener: Arc<dyn ChangeListener>, mut rx: mpsc::Receiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        let diff = catch_unwind(AssertUnwindSafe(|| listener.on_change(&delivery.change)));
        let full = catch_unwind(AssertUnwindSafe(|| {
            listener.on_newest_change(&delivery.full)
        }));

        if diff.is_err() || full.is_err() {
            error!(
                "Config change listener panicked for namespace {}",
                delivery.change.namespace
            );
        }
    }
    debug!("Config change listener worker stopped");
}

/// Ordered list of whole-event listeners.
pub struct ChangeDispatcher {
    listeners: RwLock<Vec<Arc<ListenerSlot>>>,
    queue_capacity: usize,
}

impl ChangeDispatcher {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            queue_capacity,
        }
    }

    /// Register a listener. Returns `false` if it was already registered.
    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners
            .iter()
            .any(|slot| Arc::ptr_eq(&slot.listener, &listener))
        {
            return false;
        }
        listeners.push(Arc::new(ListenerSlot {
            listener,
            queue: OnceLock::new(),
        }));
        true
    }

    /// Remove a listener. Its worker stops once its queue drains.
    pub fn remove_listener(&self, listener: &Arc<dyn ChangeListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|slot| !Arc::ptr_eq(&slot.listener, listener));
        listeners.len() != before
    }

    /// Registered listeners in registration order
    pub fn listeners(&self) -> Vec<Arc<dyn ChangeListener>> {
        self.listeners
            .read()
            .iter()
            .map(|slot| slot.listener.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Queue a change and the resulting full state for every listener.
    ///
    /// Must run inside a Tokio runtime. A listener whose queue is full misses
    /// both the diff and the full state of this event.
    pub fn dispatch(&self, event: ChangeEvent, full: FullChangeEvent) {
        let slots: Vec<Arc<ListenerSlot>> = self.listeners.read().clone();
        if slots.is_empty() {
            return;
        }

        let delivery = Delivery {
            change: Arc::new(event),
            full: Arc::new(full),
        };

        for slot in slots {
            let sender = slot.sender(self.queue_capacity);
            if let Err(e) = sender.try_send(delivery.clone()) {
                warn!(
                    "Dropping change event for namespace {}: listener queue {}",
                    delivery.change.namespace,
                    match e {
                        mpsc::error::TrySendError::Full(_) => "full",
                        mpsc::error::TrySendError::Closed(_) => "closed",
                    }
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn event(namespace: &str, key: &str) -> (ChangeEvent, FullChangeEvent) {
        (
            ChangeEvent {
                namespace: namespace.to_string(),
                changes: HashMap::from([(key.to_string(), ConfigChange::added("v"))]),
            },
            FullChangeEvent {
                namespace: namespace.to_string(),
                configurations: HashMap::from([(key.to_string(), "v".to_string())]),
            },
        )
    }

    async fn wait_until(f: impl Fn() -> bool) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_effective_value() {
        assert_eq!(ConfigChange::added("n").effective_value(), Some("n"));
        assert_eq!(ConfigChange::modified("o", "n").effective_value(), Some("n"));
        assert_eq!(ConfigChange::deleted("o").effective_value(), Some("o"));
    }

    #[test]
    fn test_add_listener_deduplicates() {
        let dispatcher = ChangeDispatcher::new(8);
        let listener: Arc<dyn ChangeListener> = Arc::new(FnChangeListener::new(|_: &ChangeEvent| {}));

        assert!(dispatcher.add_listener(listener.clone()));
        assert!(!dispatcher.add_listener(listener.clone()));
        assert_eq!(dispatcher.len(), 1);

        assert!(dispatcher.remove_listener(&listener));
        assert!(!dispatcher.remove_listener(&listener));
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_reaches_all_listeners() {
        let dispatcher = ChangeDispatcher::new(8);
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            dispatcher.add_listener(Arc::new(FnChangeListener::new(move |_: &ChangeEvent| {
                count.fetch_add(1, Ordering::SeqCst);
            })));
        }

        let (change, full) = event("application", "a");
        dispatcher.dispatch(change, full);

        wait_until(|| count.load(Ordering::SeqCst) == 3).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panicking_listener_isolated() {
        let dispatcher = ChangeDispatcher::new(8);
        let count = Arc::new(AtomicUsize::new(0));

        dispatcher.add_listener(Arc::new(FnChangeListener::new(|_: &ChangeEvent| panic!("boom"))));
        let counter = count.clone();
        dispatcher.add_listener(Arc::new(FnChangeListener::new(move |_: &ChangeEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        for key in ["a", "b"] {
            let (change, full) = event("application", key);
            dispatcher.dispatch(change, full);
        }

        wait_until(|| count.load(Ordering::SeqCst) == 2).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let dispatcher = ChangeDispatcher::new(16);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let sink = seen.clone();
        dispatcher.add_listener(Arc::new(FnChangeListener::new(move |e: &ChangeEvent| {
            let key = e.changes.keys().next().cloned().unwrap_or_default();
            sink.lock().push(key);
        })));

        for key in ["1", "2", "3", "4"] {
            let (change, full) = event("application", key);
            dispatcher.dispatch(change, full);
        }

        wait_until(|| seen.lock().len() == 4).await;
        assert_eq!(*seen.lock(), vec!["1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_newest_change_delivered() {
        struct FullRecorder(parking_lot::Mutex<Vec<FullChangeEvent>>);

        impl ChangeListener for FullRecorder {
            fn on_change(&self, _event: &ChangeEvent) {}

            fn on_newest_change(&self, event: &FullChangeEvent) {
                self.0.lock().push(event.clone());
            }
        }

        let dispatcher = ChangeDispatcher::new(8);
        let recorder = Arc::new(FullRecorder(parking_lot::Mutex::new(Vec::new())));
        dispatcher.add_listener(recorder.clone());

        let (change, full) = event("application", "k");
        dispatcher.dispatch(change, full.clone());

        wait_until(|| !recorder.0.lock().is_empty()).await;
        assert_eq!(recorder.0.lock()[0], full);
    }

    #[tokio::test]
    async fn test_full_queue_drops_diff_and_state_together() {
        #[derive(Default)]
        struct Counter {
            changes: AtomicUsize,
            fulls: AtomicUsize,
        }

        impl ChangeListener for Counter {
            fn on_change(&self, _event: &ChangeEvent) {
                self.changes.fetch_add(1, Ordering::SeqCst);
            }

            fn on_newest_change(&self, _event: &FullChangeEvent) {
                self.fulls.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dispatcher = ChangeDispatcher::new(1);
        let counter = Arc::new(Counter::default());
        dispatcher.add_listener(counter.clone());

        // The worker cannot drain before the next await, so the second event
        // finds the queue full.
        for key in ["a", "b"] {
            let (change, full) = event("application", key);
            dispatcher.dispatch(change, full);
        }

        wait_until(|| counter.fulls.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.changes.load(Ordering::SeqCst), 1);
        assert_eq!(counter.fulls.load(Ordering::SeqCst), 1);
    }
}
