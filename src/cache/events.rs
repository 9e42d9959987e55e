//! Cache Event Listeners
//!
//! Notification hook fired synchronously on the calling thread after a
//! mutation commits. Replication or monitoring layers implement
//! [`CacheEventListener`] and handle their own threading.
//!
//! Listeners are never called while the cache holds a tier lock, so they
//! may call back into the cache.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use super::element::{Element, ElementKey};
use super::engine::Cache;

/// Receiver of cache notifications; every method defaults to a no-op
pub trait CacheEventListener: Send + Sync {
    /// A new key was stored
    fn on_put(&self, _cache: &Cache, _element: &Element) {}

    /// An existing key was replaced
    fn on_update(&self, _cache: &Cache, _element: &Element) {}

    /// A key was removed by a caller
    fn on_remove(&self, _cache: &Cache, _element: &Element) {}

    /// An element was found expired and removed
    fn on_expire(&self, _cache: &Cache, _element: &Element) {}

    /// An element was evicted from memory and discarded
    fn on_evict(&self, _cache: &Cache, _element: &Element) {}

    /// Every element was removed
    fn on_remove_all(&self, _cache: &Cache) {}

    /// The cache is shutting down
    fn on_dispose(&self, _cache: &Cache) {}
}

/// A notification waiting to be dispatched once tier locks are released
#[derive(Debug, Clone)]
pub(crate) enum Notification {
    Put(Element),
    Update(Element),
    Remove(Element),
    Expire(Element),
    Evict(Element),
    RemoveAll,
}

/// Listeners registered on one cache
#[derive(Default)]
pub struct RegisteredListeners {
    listeners: RwLock<Vec<Arc<dyn CacheEventListener>>>,
}

impl RegisteredListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn CacheEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove a listener by identity; `true` if it was registered
    pub fn unregister(&self, listener: &Arc<dyn CacheEventListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub(crate) fn dispatch(&self, cache: &Cache, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        // Snapshot so listeners may register/unregister while being called
        let listeners = self.listeners.read().clone();
        for notification in &notifications {
            for listener in &listeners {
                match notification {
                    Notification::Put(e) => listener.on_put(cache, e),
                    Notification::Update(e) => listener.on_update(cache, e),
                    Notification::Remove(e) => listener.on_remove(cache, e),
                    Notification::Expire(e) => listener.on_expire(cache, e),
                    Notification::Evict(e) => listener.on_evict(cache, e),
                    Notification::RemoveAll => listener.on_remove_all(cache),
                }
            }
        }
    }

    pub(crate) fn dispose(&self, cache: &Cache) {
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_dispose(cache);
        }
    }
}

// =============================================================================
// Built-in Listeners
// =============================================================================

/// Recorded notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "key")]
pub enum CacheEvent {
    Put(ElementKey),
    Update(ElementKey),
    Remove(ElementKey),
    Expire(ElementKey),
    Evict(ElementKey),
    RemoveAll,
    Dispose,
}

impl CacheEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::Put(_) => "put",
            CacheEvent::Update(_) => "update",
            CacheEvent::Remove(_) => "remove",
            CacheEvent::Expire(_) => "expire",
            CacheEvent::Evict(_) => "evict",
            CacheEvent::RemoveAll => "remove_all",
            CacheEvent::Dispose => "dispose",
        }
    }
}

/// Listener that records every notification in memory
#[derive(Debug, Default)]
pub struct EventCollector {
    events: RwLock<Vec<CacheEvent>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.read().clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<CacheEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    fn record(&self, event: CacheEvent) {
        self.events.write().push(event);
    }
}

impl CacheEventListener for EventCollector {
    fn on_put(&self, _cache: &Cache, element: &Element) {
        self.record(CacheEvent::Put(element.key().clone()));
    }

    fn on_update(&self, _cache: &Cache, element: &Element) {
        self.record(CacheEvent::Update(element.key().clone()));
    }

    fn on_remove(&self, _cache: &Cache, element: &Element) {
        self.record(CacheEvent::Remove(element.key().clone()));
    }

    fn on_expire(&self, _cache: &Cache, element: &Element) {
        self.record(CacheEvent::Expire(element.key().clone()));
    }

    fn on_evict(&self, _cache: &Cache, element: &Element) {
        self.record(CacheEvent::Evict(element.key().clone()));
    }

    fn on_remove_all(&self, _cache: &Cache) {
        self.record(CacheEvent::RemoveAll);
    }

    fn on_dispose(&self, _cache: &Cache) {
        self.record(CacheEvent::Dispose);
    }
}

/// Listener that writes every notification to the tracing log
#[derive(Debug, Clone, Default)]
pub struct LoggingListener {
    /// Log at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    fn log(&self, cache: &Cache, event: &str, key: Option<&ElementKey>) {
        let name = cache.name();
        match (self.info_level, key) {
            (true, Some(key)) => info!(cache = %name, event, key = %key, "Cache event"),
            (true, None) => info!(cache = %name, event, "Cache event"),
            (false, Some(key)) => debug!(cache = %name, event, key = %key, "Cache event"),
            (false, None) => debug!(cache = %name, event, "Cache event"),
        }
    }
}

impl CacheEventListener for LoggingListener {
    fn on_put(&self, cache: &Cache, element: &Element) {
        self.log(cache, "put", Some(element.key()));
    }

    fn on_update(&self, cache: &Cache, element: &Element) {
        self.log(cache, "update", Some(element.key()));
    }

    fn on_remove(&self, cache: &Cache, element: &Element) {
        self.log(cache, "remove", Some(element.key()));
    }

    fn on_expire(&self, cache: &Cache, element: &Element) {
        self.log(cache, "expire", Some(element.key()));
    }

    fn on_evict(&self, cache: &Cache, element: &Element) {
        self.log(cache, "evict", Some(element.key()));
    }

    fn on_remove_all(&self, cache: &Cache) {
        self.log(cache, "remove_all", None);
    }

    fn on_dispose(&self, cache: &Cache) {
        self.log(cache, "dispose", None);
    }
}
