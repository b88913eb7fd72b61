//! Bus event fan-out.
//!
//! The driver is the single producer; any number of subscribers each get
//! their own bounded channel. Dispatch is a non-blocking `try_send` so a
//! stalled consumer can never stall the decode loop: a subscriber that
//! overflows its buffer is disconnected and sees its stream end.
//!
//! Subscriptions are tokens: dropping an [`EventStream`] unregisters it in
//! O(1).

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;
use tracing::warn;

/// A state change observed on the bus.
///
/// Node-level events are gated by the publish debounce; service-level events
/// fire on every `NEW_SERVER`/`DEL_SERVER`, published or not, for callers
/// that want raw visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    /// A node finished its initial service burst and became visible.
    NodeAdded(u32),
    /// A published node deregistered all of its services.
    NodeRemoved(u32),
    ServiceAdded { node_id: u32, service: u32 },
    ServiceRemoved { node_id: u32, service: u32 },
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BusEvent::NodeAdded(_) => EventKind::NodeAdded,
            BusEvent::NodeRemoved(_) => EventKind::NodeRemoved,
            BusEvent::ServiceAdded { .. } => EventKind::ServiceAdded,
            BusEvent::ServiceRemoved { .. } => EventKind::ServiceRemoved,
        }
    }

    /// The node this event concerns.
    pub fn node_id(&self) -> u32 {
        match *self {
            BusEvent::NodeAdded(node_id)
            | BusEvent::NodeRemoved(node_id)
            | BusEvent::ServiceAdded { node_id, .. }
            | BusEvent::ServiceRemoved { node_id, .. } => node_id,
        }
    }
}

/// Discriminant of [`BusEvent`], used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeAdded,
    NodeRemoved,
    ServiceAdded,
    ServiceRemoved,
}

struct Subscriber {
    sender: mpsc::Sender<BusEvent>,
    filter: Option<EventKind>,
}

pub(crate) struct EventRegistry {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    buffer_size: usize,
    closed: AtomicBool,
}

impl EventRegistry {
    pub(crate) fn new(buffer_size: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer_size,
            closed: AtomicBool::new(false),
        }
    }

    /// Register a subscriber, optionally filtered to one event kind.
    pub(crate) fn register(self: &Arc<Self>, filter: Option<EventKind>) -> EventStream {
        let (sender, receiver) = mpsc::channel(self.buffer_size);
        if self.closed.load(Ordering::Acquire) {
            // Ended stream: the sender is dropped before anyone can use it.
            return EventStream {
                id: 0,
                receiver,
                registry: Arc::clone(self),
            };
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, Subscriber { sender, filter });
        if self.closed.load(Ordering::Acquire) {
            // Lost the race against close(): do not leave a stream that can
            // never end.
            self.subscribers.remove(&id);
        }
        trace!(subscriber_id = id, "event subscriber registered");
        EventStream {
            id,
            receiver,
            registry: Arc::clone(self),
        }
    }

    /// Disconnect every subscriber and reject future registrations. Called
    /// once by the driver on its way out.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers.clear();
    }

    /// Deliver `event` to every matching subscriber. Events reach each
    /// subscriber in emission order; a subscriber whose buffer is full is
    /// dropped.
    pub(crate) fn emit(&self, event: BusEvent) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if let Some(filter) = subscriber.filter {
                if filter != event.kind() {
                    continue;
                }
            }
            match subscriber.sender.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        subscriber_id = *entry.key(),
                        "event subscriber overflowed its buffer, disconnecting"
                    );
                    dead.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }

    fn unregister(&self, id: u64) {
        self.subscribers.remove(&id);
        trace!(subscriber_id = id, "event subscriber unregistered");
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// A live event subscription.
///
/// The stream ends (`recv` returns `None`) when the observer shuts down or
/// this subscriber fell too far behind and was disconnected.
pub struct EventStream {
    id: u64,
    receiver: mpsc::Receiver<BusEvent>,
    registry: Arc<EventRegistry>,
}

impl EventStream {
    /// Receive the next event, in the order the observer processed them.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` when no event
    /// is queued right now.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
