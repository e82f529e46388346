//! Outbound events and subscriber registries.
//!
//! Handlers registered with [`Subscribers`] run synchronously in
//! registration order. A panicking handler is logged and skipped; delivery
//! continues with the next one.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::fleet::health::Alert;
use crate::fleet::health::HealthMetrics;
use crate::show::state::OddsUpdate;
use crate::show::state::RaceResults;
use crate::show::state::StateChange;

/// Capacity of the bridge channel; slow receivers observe `Lagged`
const BRIDGE_CAPACITY: usize = 256;

/// Named events for the external broadcast bridge (SSE/WebSocket)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum Event {
    StateChange(StateChange),
    OddsUpdate(OddsUpdate),
    Results(RaceResults),
    DeviceHealthUpdate(HealthMetrics),
    DeviceAlert(Alert),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::StateChange(_) => "state_change",
            Event::OddsUpdate(_) => "odds_update",
            Event::Results(_) => "results",
            Event::DeviceHealthUpdate(_) => "device_health_update",
            Event::DeviceAlert(_) => "device_alert",
        }
    }
}

/// Handle returned by [`Subscribers::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered list of synchronous handlers
pub struct Subscribers<T> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, Handler<T>)>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns false if `id` was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every handler. Returns how many completed.
    ///
    /// The handler list is snapshotted first, so a handler may subscribe or
    /// unsubscribe without deadlocking.
    pub fn notify(&self, event: &T) -> usize {
        let snapshot: Vec<(SubscriptionId, Handler<T>)> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut delivered = 0;
        for (id, handler) in snapshot {
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!("Subscriber {:?} panicked, continuing delivery", id),
            }
        }
        delivered
    }
}

/// Subscriber registry plus a channel bridge for async consumers
pub struct EventBus {
    subscribers: Subscribers<Event>,
    bridge: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (bridge, _) = broadcast::channel(BRIDGE_CAPACITY);
        Self {
            subscribers: Subscribers::new(),
            bridge,
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&Event) + Send + Sync + 'static) -> SubscriptionId {
        self.subscribers.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Receiver for the external broadcast bridge
    pub fn bridge(&self) -> broadcast::Receiver<Event> {
        self.bridge.subscribe()
    }

    pub fn publish(&self, event: Event) {
        self.subscribers.notify(&event);
        // No bridge receivers is normal before a viewer connects
        let _ = self.bridge.send(event);
    }
}
