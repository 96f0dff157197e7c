//! Type-keyed publish/subscribe
//!
//! Delivery order for one `emit` is: exact-type listeners in registration
//! order, then wildcard listeners in registration order. Async listeners are
//! started in that order and spawned onto the current tokio runtime; the
//! emitter never waits for them. A listener that panics or fails is logged
//! and does not affect the emitter or its siblings.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{error, trace, warn};

use super::{Event, EventType};
use crate::subscription::{ListenerSet, Subscription};

/// Soft cap on listeners per key before a leak warning is logged
pub const DEFAULT_MAX_LISTENERS: usize = 100;

/// Synchronous event listener
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Asynchronous event listener; its future is spawned, not awaited
pub type AsyncListener = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// What a listener is registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
    Type(EventType),
    /// Wildcard: every event
    Any,
}

impl From<EventType> for EventFilter {
    fn from(event_type: EventType) -> Self {
        EventFilter::Type(event_type)
    }
}

#[derive(Clone)]
enum Handler {
    Sync(Listener),
    Async(AsyncListener),
}

#[derive(Clone)]
struct Entry {
    handler: Handler,
    once: bool,
}

struct BusInner {
    listeners: Mutex<HashMap<EventFilter, ListenerSet<Entry>>>,
    max_listeners: usize,
}

/// Event bus shared by the coordinator and its observers.
///
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_max_listeners(DEFAULT_MAX_LISTENERS)
    }

    pub fn with_max_listeners(max_listeners: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(HashMap::new()),
                max_listeners,
            }),
        }
    }

    /// Register a synchronous listener for one type or for [`EventFilter::Any`]
    pub fn on<F>(&self, filter: impl Into<EventFilter>, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add_listener(filter, Arc::new(listener))
    }

    /// Register an already shared listener, so it can later be passed to [`off`](Self::off)
    pub fn add_listener(&self, filter: impl Into<EventFilter>, listener: Listener) -> Subscription {
        self.register(filter.into(), Handler::Sync(listener), false)
    }

    /// Register an async listener
    pub fn on_async<F>(&self, filter: impl Into<EventFilter>, listener: F) -> Subscription
    where
        F: Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.register(filter.into(), Handler::Async(Arc::new(listener)), false)
    }

    /// Register a listener that is removed after its first delivery
    pub fn once<F>(&self, filter: impl Into<EventFilter>, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(filter.into(), Handler::Sync(Arc::new(listener)), true)
    }

    /// Remove a listener registered through [`add_listener`](Self::add_listener)
    pub fn off(&self, filter: impl Into<EventFilter>, listener: &Listener) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = self.inner.listeners.lock();
        listeners
            .get_mut(&filter.into())
            .map(|set| {
                set.remove_first(|entry| match &entry.handler {
                    Handler::Sync(l) => Arc::as_ptr(l) as *const () == target,
                    Handler::Async(_) => false,
                })
            })
            .unwrap_or(false)
    }

    /// Deliver `event` to every matching listener
    pub fn emit(&self, event: impl Into<Event>) {
        let event = event.into();
        let event_type = event.event_type();

        let targets = {
            let mut listeners = self.inner.listeners.lock();
            let mut targets = Vec::new();
            for filter in [EventFilter::Type(event_type), EventFilter::Any] {
                if let Some(set) = listeners.get_mut(&filter) {
                    for (id, entry) in set.entries() {
                        if entry.once {
                            set.remove(id);
                        }
                        targets.push(entry.handler);
                    }
                }
            }
            targets
        };

        trace!(event = %event_type, listeners = targets.len(), "emitting event");

        for handler in targets {
            match handler {
                Handler::Sync(listener) => {
                    if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                        error!(event = %event_type, "event listener panicked");
                    }
                }
                Handler::Async(listener) => {
                    match catch_unwind(AssertUnwindSafe(|| listener(event.clone()))) {
                        Ok(future) => spawn_listener(event_type, future),
                        Err(_) => error!(event = %event_type, "async event listener panicked"),
                    }
                }
            }
        }
    }

    /// Clear listeners for one key, or every key when `filter` is `None`
    pub fn remove_all_listeners(&self, filter: Option<EventFilter>) {
        let mut listeners = self.inner.listeners.lock();
        match filter {
            Some(filter) => {
                listeners.remove(&filter);
            }
            None => listeners.clear(),
        }
    }

    pub fn listener_count(&self, filter: impl Into<EventFilter>) -> usize {
        self.inner
            .listeners
            .lock()
            .get(&filter.into())
            .map(|set| set.len())
            .unwrap_or(0)
    }

    fn register(&self, filter: EventFilter, handler: Handler, once: bool) -> Subscription {
        let id = {
            let mut listeners = self.inner.listeners.lock();
            let set = listeners.entry(filter).or_insert_with(ListenerSet::new);
            let id = set.insert(Entry { handler, once });
            if set.len() == self.inner.max_listeners + 1 {
                warn!(
                    ?filter,
                    count = set.len(),
                    max = self.inner.max_listeners,
                    "possible listener leak: listener count exceeds soft cap"
                );
            }
            id
        };

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Some(set) = inner.listeners.lock().get_mut(&filter) {
                    set.remove(id);
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_listener(event_type: EventType, future: BoxFuture<'static, anyhow::Result<()>>) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = future.await {
                    warn!(event = %event_type, error = %e, "async event listener failed");
                }
            });
        }
        Err(_) => {
            warn!(event = %event_type, "no tokio runtime available, async listener skipped");
        }
    }
}
