//! Fanout hub: the registry of viewer subscriptions
//!
//! The ingest session calls [`FanoutHub::broadcast`] from its packet
//! callback; every subscription owns a bounded queue drained by one
//! forwarding task. Delivery is strictly non-blocking: when a viewer's
//! queue is full the packet is dropped for that viewer only, because a
//! stale video frame is worth less than the next fresh one.
//!
//! ```text
//! RTSP ingest --broadcast--> FanoutHub --try_send--> [queue] --> forwarding task (viewer A)
//!                                      \--try_send--> [queue] --> forwarding task (viewer B)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::packet::SharedPacket;

/// Default per-subscription queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 512;

/// Subscription identifier, unique for the lifetime of a hub
pub type SubscriptionId = u64;

/// Delivery counters for one subscription
#[derive(Debug, Default)]
struct SubscriptionCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

struct SubscriberEntry {
    tx: mpsc::Sender<SharedPacket>,
    closed: Arc<AtomicBool>,
    counters: Arc<SubscriptionCounters>,
}

impl SubscriberEntry {
    fn close(self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the sender wakes a receiver parked in `recv`
        drop(self.tx);
    }
}

#[derive(Default)]
struct Registry {
    shut_down: bool,
    subscribers: HashMap<SubscriptionId, SubscriberEntry>,
}

struct HubInner {
    capacity: usize,
    next_id: AtomicU64,
    broadcasts: AtomicU64,
    registry: RwLock<Registry>,
}

impl HubInner {
    fn remove(&self, id: SubscriptionId) -> bool {
        let entry = self.registry.write().subscribers.remove(&id);
        match entry {
            Some(entry) => {
                entry.close();
                debug!("Subscription {} removed from fanout hub", id);
                true
            }
            None => false,
        }
    }
}

/// Registry of live subscriptions with non-blocking broadcast
#[derive(Clone)]
pub struct FanoutHub {
    inner: Arc<HubInner>,
}

impl FanoutHub {
    /// Create a hub whose subscriptions hold at most `capacity` packets
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                broadcasts: AtomicU64::new(0),
                registry: RwLock::new(Registry::default()),
            }),
        }
    }

    /// Per-subscription queue capacity
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Register a new subscription
    ///
    /// After [`shutdown`](Self::shutdown) the returned subscription is
    /// already closed and never registered.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let closed = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(SubscriptionCounters::default());

        let entry = SubscriberEntry {
            tx,
            closed: closed.clone(),
            counters: counters.clone(),
        };

        {
            let mut registry = self.inner.registry.write();
            if registry.shut_down {
                entry.close();
            } else {
                registry.subscribers.insert(id, entry);
            }
        }

        debug!("Subscription {} created", id);

        Subscription {
            id,
            rx,
            closed,
            counters,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscription and close its queue
    ///
    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove(id)
    }

    /// Offer `packet` to every subscription without waiting
    ///
    /// Returns the number of subscriptions that accepted the packet.
    pub fn broadcast(&self, packet: SharedPacket) -> usize {
        self.inner.broadcasts.fetch_add(1, Ordering::Relaxed);

        let registry = self.inner.registry.read();
        let mut delivered = 0;

        for (id, entry) in registry.subscribers.iter() {
            match entry.tx.try_send(packet.clone()) {
                Ok(()) => {
                    entry.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = entry.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!("Subscription {} queue full, dropped packet ({} total)", id, dropped);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Receiver already gone; unsubscribe will follow from its drop
                }
            }
        }

        delivered
    }

    /// Close every subscription and refuse new ones
    pub fn shutdown(&self) {
        let drained: Vec<SubscriberEntry> = {
            let mut registry = self.inner.registry.write();
            if registry.shut_down {
                return;
            }
            registry.shut_down = true;
            registry.subscribers.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            entry.close();
        }

        info!("Fanout hub shut down, closed {} subscriptions", count);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.registry.read().shut_down
    }

    /// Number of registered subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.read().subscribers.len()
    }

    /// Snapshot of hub and per-subscription counters
    pub fn stats(&self) -> HubStats {
        let registry = self.inner.registry.read();
        let mut subscriptions: Vec<SubscriptionStats> = registry
            .subscribers
            .iter()
            .map(|(id, entry)| SubscriptionStats {
                id: *id,
                delivered: entry.counters.delivered.load(Ordering::Relaxed),
                dropped: entry.counters.dropped.load(Ordering::Relaxed),
                queued: self.inner.capacity - entry.tx.capacity(),
            })
            .collect();
        subscriptions.sort_by_key(|s| s.id);

        HubStats {
            queue_capacity: self.inner.capacity,
            subscribers: subscriptions.len(),
            broadcasts: self.inner.broadcasts.load(Ordering::Relaxed),
            shut_down: registry.shut_down,
            subscriptions,
        }
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Receiving end of one viewer's queue
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<SharedPacket>,
    closed: Arc<AtomicBool>,
    counters: Arc<SubscriptionCounters>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next packet; `None` once the subscription is closed
    ///
    /// Packets still buffered when the subscription is closed are discarded.
    pub async fn recv(&mut self) -> Option<SharedPacket> {
        if self.is_closed() {
            return None;
        }
        let packet = self.rx.recv().await?;
        if self.is_closed() {
            return None;
        }
        Some(packet)
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<SharedPacket> {
        if self.is_closed() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Packets dropped for this subscription because its queue was full
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Packets accepted into this subscription's queue
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    /// Remove this subscription from its hub; idempotent
    pub fn unsubscribe(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Per-subscription counters
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    pub id: SubscriptionId,
    pub delivered: u64,
    pub dropped: u64,
    pub queued: usize,
}

/// Hub-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub queue_capacity: usize,
    pub subscribers: usize,
    pub broadcasts: u64,
    pub shut_down: bool,
    pub subscriptions: Vec<SubscriptionStats>,
}
