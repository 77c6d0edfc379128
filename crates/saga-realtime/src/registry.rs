use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::teardown::Teardown;

/// Names of every channel with a live supervisor.
///
/// Only presence is tracked here; the channel itself belongs to the
/// supervisor that registered it. Each entry also carries a reconnect signal
/// so the health monitor can force every live channel to be recreated.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `name` present. Returns false, changing nothing, if it already was.
    pub fn register(&self, name: &str) -> bool {
        self.acquire(name).is_some()
    }

    /// Check-and-set under one lock; two racing callers cannot both win.
    pub(crate) fn acquire(&self, name: &str) -> Option<Arc<Notify>> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if channels.contains_key(name) {
            debug!("channel {} already registered", name);
            return None;
        }
        let signal = Arc::new(Notify::new());
        channels.insert(name.to_string(), signal.clone());
        Some(signal)
    }

    pub fn unregister(&self, name: &str) {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Ask every registered channel to tear down and recreate its subscription.
    /// Returns how many channels were signalled.
    pub fn request_reconnect_all(&self) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        for signal in channels.values() {
            signal.notify_one();
        }
        info!("requested reconnect of {} channels", channels.len());
        channels.len()
    }
}

/// Result of [`SubscriptionCache::acquire`].
pub struct Acquired<V> {
    pub value: V,
    pub teardown: Teardown,
    /// True when an existing live subscription was handed back.
    pub reused: bool,
}

/// Memoized scope -> live subscription map.
///
/// Asking for a scope that already has a live subscription returns that one
/// instead of opening a second.
pub struct SubscriptionCache<K, V> {
    live: Mutex<HashMap<K, (V, Teardown)>>,
}

impl<K, V> Default for SubscriptionCache<K, V> {
    fn default() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> SubscriptionCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: K, open: impl FnOnce() -> (V, Teardown)) -> Acquired<V> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((value, teardown)) = live.get(&key) {
            if !teardown.is_done() {
                return Acquired {
                    value: value.clone(),
                    teardown: teardown.clone(),
                    reused: true,
                };
            }
        }
        let (value, teardown) = open();
        live.insert(key, (value.clone(), teardown.clone()));
        Acquired {
            value,
            teardown,
            reused: false,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.get(key)
            .filter(|(_, teardown)| !teardown.is_done())
            .map(|(value, _)| value.clone())
    }

    /// Tears the scope's subscription down and forgets it.
    pub fn release(&self, key: &K) -> bool {
        let removed = self.live.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        match removed {
            Some((_, teardown)) => {
                teardown.run();
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self) {
        let drained: Vec<_> = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, (_, teardown)) in drained {
            teardown.run();
        }
    }

    pub fn len(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn second_registration_is_refused() {
        let registry = ChannelRegistry::new();
        assert!(registry.register("c1"));
        assert!(!registry.register("c1"));
        assert_eq!(registry.len(), 1);

        registry.unregister("c1");
        assert!(!registry.contains("c1"));
        assert!(registry.register("c1"));
    }

    #[test]
    fn unregister_of_unknown_name_is_harmless() {
        let registry = ChannelRegistry::new();
        registry.unregister("never-registered");
        assert!(registry.is_empty());
    }

    #[test]
    fn cache_reuses_live_subscription() {
        let cache: SubscriptionCache<u32, &'static str> = SubscriptionCache::new();
        let opened = Arc::new(AtomicUsize::new(0));

        let open = || {
            opened.fetch_add(1, Ordering::SeqCst);
            ("feed", Teardown::new(|| {}))
        };
        let first = cache.acquire(7, open);
        let second = cache.acquire(7, || {
            opened.fetch_add(1, Ordering::SeqCst);
            ("other", Teardown::new(|| {}))
        });

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(second.value, "feed");
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_reopens_after_teardown() {
        let cache: SubscriptionCache<u32, u32> = SubscriptionCache::new();
        let first = cache.acquire(1, || (10, Teardown::new(|| {})));
        first.teardown.run();

        let second = cache.acquire(1, || (20, Teardown::new(|| {})));
        assert!(!second.reused);
        assert_eq!(second.value, 20);

        assert!(cache.release(&1));
        assert!(!cache.release(&1));
        assert!(cache.is_empty());
    }
}
