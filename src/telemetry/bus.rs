//! Telemetry bus with ordered dispatch and per-event fan-out
//!
//! Events are drained by a single background loop in emission order; each
//! event's handlers run concurrently and the loop waits for all of them
//! before advancing. This keeps inter-event ordering global while still
//! letting slow handlers of one event overlap each other.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Notify};
use tracing::warn;

use crate::models::TelemetryEvent;

/// Topic that matches every event
pub const TOPIC_WILDCARD: &str = "*";

/// Async callback invoked once per matching event
pub type TelemetryHandler = Arc<dyn Fn(TelemetryEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`TelemetryHandler`]
pub fn handler<F, Fut>(f: F) -> TelemetryHandler
where
    F: Fn(TelemetryEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Identifies one subscription so it can be removed later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: TelemetryHandler,
}

struct BusInner {
    subscribers: Mutex<HashMap<String, Vec<Subscription>>>,
    queue: Mutex<VecDeque<TelemetryEvent>>,
    wakeup: Notify,
    dispatching: AtomicBool,
    next_id: AtomicU64,
}

/// In-process pub/sub bus
///
/// One instance is constructed per process (or per test) and passed
/// explicitly to every dependent. `Clone` shares the same bus.
#[derive(Clone)]
pub struct TelemetryBus {
    inner: Arc<BusInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                wakeup: Notify::new(),
                dispatching: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a handler for a topic (`"*"` receives every event)
    pub fn subscribe(&self, topic: impl Into<String>, handler: TelemetryHandler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.subscribers)
            .entry(topic.into())
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    /// Remove a previously registered handler; unknown ids are a no-op
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let mut subscribers = lock(&self.inner.subscribers);
        if let Some(list) = subscribers.get_mut(topic) {
            list.retain(|sub| sub.id != id);
            if list.is_empty() {
                subscribers.remove(topic);
            }
        }
    }

    /// Enqueue an event and return immediately
    ///
    /// The dispatch loop is started lazily on the first emit while idle
    /// and exits again once the queue drains with no handlers remaining.
    pub fn emit(&self, topic: impl Into<String>, payload: serde_json::Value) {
        let event = TelemetryEvent::new(topic, payload);
        lock(&self.inner.queue).push_back(event);
        if !self.inner.dispatching.swap(true, Ordering::AcqRel) {
            let inner = self.inner.clone();
            tokio::spawn(dispatch_loop(inner));
        } else {
            self.inner.wakeup.notify_one();
        }
    }

    /// Derived per-call queue for long-polling one topic
    pub fn watch(&self, topic: impl Into<String>) -> TelemetryStream {
        let topic = topic.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(
            topic.clone(),
            handler(move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                }
            }),
        );
        TelemetryStream {
            bus: self.clone(),
            topic,
            id,
            rx,
        }
    }

    /// Number of live subscriptions across all topics
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).values().map(Vec::len).sum()
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event stream backed by a dedicated subscription
///
/// Dropping the stream removes its forwarding handler from the bus.
pub struct TelemetryStream {
    bus: TelemetryBus,
    topic: String,
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<TelemetryEvent>,
}

impl TelemetryStream {
    /// Wait for the next event on the watched topic
    pub async fn next(&mut self) -> Option<TelemetryEvent> {
        self.rx.recv().await
    }

    /// Take an already delivered event without waiting
    pub fn try_next(&mut self) -> Option<TelemetryEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for TelemetryStream {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.topic, self.id);
    }
}

async fn dispatch_loop(inner: Arc<BusInner>) {
    loop {
        let event = lock(&inner.queue).pop_front();
        match event {
            Some(event) => dispatch_event(&inner, event).await,
            None => {
                if !lock(&inner.subscribers).is_empty() {
                    inner.wakeup.notified().await;
                    continue;
                }
                inner.dispatching.store(false, Ordering::Release);
                // An emit may have enqueued between the pop and the store;
                // reclaim the loop unless that emit already spawned one.
                if !lock(&inner.queue).is_empty()
                    && !inner.dispatching.swap(true, Ordering::AcqRel)
                {
                    continue;
                }
                break;
            }
        }
    }
}

async fn dispatch_event(inner: &Arc<BusInner>, event: TelemetryEvent) {
    let handlers: Vec<TelemetryHandler> = {
        let subscribers = lock(&inner.subscribers);
        let mut matching = Vec::new();
        if let Some(list) = subscribers.get(&event.topic) {
            matching.extend(list.iter().map(|sub| sub.handler.clone()));
        }
        if event.topic != TOPIC_WILDCARD {
            if let Some(list) = subscribers.get(TOPIC_WILDCARD) {
                matching.extend(list.iter().map(|sub| sub.handler.clone()));
            }
        }
        matching
    };

    if handlers.is_empty() {
        return;
    }

    // Each handler runs in its own task so a panic is isolated from the
    // loop and from sibling handlers.
    let tasks: Vec<_> = handlers
        .into_iter()
        .map(|handler| {
            let event = event.clone();
            tokio::spawn(async move { handler(event).await })
        })
        .collect();

    for task in tasks {
        if let Err(err) = task.await {
            warn!(topic = %event.topic, "telemetry handler failed: {err}");
        }
    }
}
