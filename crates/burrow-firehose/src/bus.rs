use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use burrow_types::Did;
use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::event::{EventBody, EventKind, FirehoseEvent};

/// Default capacity of each subscriber's queue.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// Filter for subscribing to a subset of firehose events.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// If set, only events about these accounts are delivered.
    pub dids: Option<Vec<Did>>,
    /// If set, only events of these kinds are delivered.
    pub kinds: Option<Vec<EventKind>>,
}

impl EventFilter {
    /// Returns `true` if the given event matches this filter.
    pub fn matches(&self, event: &FirehoseEvent) -> bool {
        if let Some(ref dids) = self.dids {
            match event.body.did() {
                Some(did) if dids.contains(did) => {}
                _ => return false,
            }
        }
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        true
    }
}

struct Subscriber {
    id: u64,
    filter: EventFilter,
    sender: mpsc::Sender<FirehoseEvent>,
    lagged: Arc<AtomicBool>,
}

struct BusState {
    next_seq: i64,
    subscribers: Vec<Subscriber>,
}

/// In-process fan-out of repository events.
///
/// Sequence numbers are assigned under the same lock that routes the
/// event, so every subscriber observes events in `seq` order. Each
/// subscriber has a bounded queue; a subscriber whose queue is full is
/// disconnected instead of blocking the publisher.
pub struct EventBus {
    state: RwLock<BusState>,
    next_id: AtomicU64,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(BusState {
                next_seq: 1,
                subscribers: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Stamp an event with the next sequence number and the current time,
    /// then deliver it to every matching subscriber.
    pub fn publish(&self, body: EventBody) -> FirehoseEvent {
        let mut state = self.state.write().expect("bus lock poisoned");
        let event = FirehoseEvent {
            seq: state.next_seq,
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            body,
        };
        state.next_seq += 1;

        state.subscribers.retain(|sub| {
            if !sub.filter.matches(&event) {
                return !sub.sender.is_closed();
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = sub.id, seq = event.seq, "subscriber queue full, disconnecting");
                    sub.lagged.store(true, Ordering::Release);
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });

        debug!(seq = event.seq, kind = %event.kind(), "event published");
        event
    }

    /// Register a subscriber. It receives exactly the matching events
    /// published after this call returns.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let lagged = Arc::new(AtomicBool::new(false));
        self.state
            .write()
            .expect("bus lock poisoned")
            .subscribers
            .push(Subscriber {
                id,
                filter,
                sender,
                lagged: Arc::clone(&lagged),
            });
        debug!(subscriber = id, "subscribed");
        Subscription { id, receiver, lagged }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.state
            .write()
            .expect("bus lock poisoned")
            .subscribers
            .retain(|sub| sub.id != id);
    }

    /// Drop every subscriber. Their streams end once drained.
    pub fn close(&self) {
        let mut state = self.state.write().expect("bus lock poisoned");
        debug!(subscribers = state.subscribers.len(), "closing event bus");
        state.subscribers.clear();
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.read().expect("bus lock poisoned").subscribers.len()
    }

    /// Sequence number the next published event will carry.
    pub fn next_seq(&self) -> i64 {
        self.state.read().expect("bus lock poisoned").next_seq
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

/// Receiving end of a bus subscription.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<FirehoseEvent>,
    lagged: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the bus dropped this subscriber and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<FirehoseEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FirehoseEvent> {
        self.receiver.try_recv().ok()
    }

    /// Whether the bus disconnected this subscriber for falling behind.
    pub fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }
}
