use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use saga_types::events::ChangeEvent;
use saga_types::subscription::SubscriptionDescriptor;

use crate::transport::{
    ChannelStatus, Transport, TransportChannel, TransportError, TransportEvent, TransportHandle,
};

/// In-process pub/sub service. Every device in a test or simulation opens its
/// channels against the same hub.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    /// Open subscriptions: conn_id -> subscriber
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,

    /// Number of upcoming `open` calls that fail.
    failing_opens: AtomicU32,

    /// Every successful `open` since the hub was created.
    opens: AtomicU64,

    /// Every `open` call, failed or not.
    attempts: AtomicU64,
}

struct Subscriber {
    name: String,
    descriptor: SubscriptionDescriptor,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fan a database change out to every channel whose descriptor matches.
    /// Returns the number of channels it was delivered to.
    pub fn publish_change(&self, event: ChangeEvent) -> usize {
        let subscribers = self.inner.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        for subscriber in subscribers.values() {
            if subscriber.descriptor.matches(&event)
                && subscriber.tx.send(TransportEvent::Change(event.clone())).is_ok()
            {
                delivered += 1;
            }
        }
        trace!("change on {} delivered to {} channels", event.table, delivered);
        delivered
    }

    /// Push a status transition to every subscriber of `name`.
    pub fn inject_status(&self, name: &str, status: ChannelStatus) -> usize {
        let subscribers = self.inner.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        subscribers
            .values()
            .filter(|s| s.name == name)
            .filter(|s| s.tx.send(TransportEvent::Status(status.clone())).is_ok())
            .count()
    }

    /// Make the next `count` calls to `open` fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.inner.failing_opens.store(count, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> u64 {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn open_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Subscriptions currently open under `name`.
    pub fn live_count(&self, name: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.name == name)
            .count()
    }

    fn relay(&self, name: &str, from: Uuid, event: &str, payload: Value) {
        let subscribers = self.inner.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        for (&conn_id, subscriber) in subscribers.iter() {
            if conn_id != from && subscriber.name == name {
                let _ = subscriber.tx.send(TransportEvent::Broadcast {
                    event: event.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }

    fn remove(&self, conn_id: Uuid) {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn_id);
    }

    fn take_failure(&self) -> bool {
        self.inner
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Transport for MemoryHub {
    fn open(&self, name: &str, descriptor: &SubscriptionDescriptor) -> Result<TransportChannel, TransportError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            debug!("memory hub refusing open of {}", name);
            return Err(TransportError::Unavailable(format!("open of {name} refused")));
        }

        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Status(ChannelStatus::Subscribed));

        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                conn_id,
                Subscriber {
                    name: name.to_string(),
                    descriptor: descriptor.clone(),
                    tx,
                },
            );
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        Ok(TransportChannel {
            events: rx,
            handle: Box::new(MemoryHandle {
                hub: self.clone(),
                conn_id,
                name: name.to_string(),
            }),
        })
    }
}

struct MemoryHandle {
    hub: MemoryHub,
    conn_id: Uuid,
    name: String,
}

impl TransportHandle for MemoryHandle {
    fn broadcast(&self, event: &str, payload: Value) {
        self.hub.relay(&self.name, self.conn_id, event, payload);
    }

    fn unsubscribe(&self) {
        self.hub.remove(self.conn_id);
    }
}
