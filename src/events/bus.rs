//! Priority event bus with concurrent per-event fan-out

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{EventHandler, EventType, FailedEvent, SystemEvent};

/// Configuration for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Pending events beyond this are dropped at publish time
    pub max_queue_size: usize,
    /// Upper bound on a single handler invocation
    pub handler_timeout: Duration,
    /// Capacity of the failed-events list
    pub max_failed_events: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            handler_timeout: Duration::from_secs(30),
            max_failed_events: 1000,
        }
    }
}

/// Snapshot of bus counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    pub queue_depth: usize,
    pub total_published: u64,
    pub total_processed: u64,
    pub total_dropped: u64,
    pub total_errors: u64,
    /// Handler count per event type, keyed by the type's display name
    pub subscriber_counts: HashMap<String, usize>,
}

struct Subscriber {
    id: Uuid,
    handler: Arc<dyn EventHandler>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Pending events ordered by `(priority, sequence)`; the sequence number
/// keeps equal priorities FIFO.
#[derive(Debug, Default)]
struct PendingQueue {
    order: PriorityQueue<u64, Reverse<(u8, u64)>>,
    events: HashMap<u64, SystemEvent>,
    next_seq: u64,
}

impl PendingQueue {
    fn len(&self) -> usize {
        self.order.len()
    }

    fn push(&mut self, event: SystemEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.push(seq, Reverse((event.priority.value(), seq)));
        self.events.insert(seq, event);
    }

    fn pop(&mut self) -> Option<SystemEvent> {
        let (seq, _) = self.order.pop()?;
        self.events.remove(&seq)
    }
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// In-process publish/subscribe bus.
///
/// Publishing never blocks: a full queue drops the new event. A single
/// consumer loop dequeues the highest-priority event and runs all of its
/// handlers concurrently, waiting for them before taking the next event.
pub struct EventBus {
    /// Bus configuration
    config: EventBusConfig,
    /// Pending events
    queue: Mutex<PendingQueue>,
    /// Handlers by event type
    subscribers: DashMap<EventType, Vec<Subscriber>>,
    /// Bounded list of handler failures
    failed: Mutex<VecDeque<FailedEvent>>,
    /// Wakes the processing loop on publish
    notify: Notify,
    /// Shutdown signal for the processing loop
    shutdown_tx: watch::Sender<bool>,
    /// Running processing loop, if started
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    counters: BusCounters,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("queue_depth", &self.queue.lock().len())
            .field("subscribed_types", &self.subscribers.len())
            .field("counters", &self.counters)
            .finish()
    }
}

impl EventBus {
    /// Create a new event bus
    pub fn new(config: EventBusConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            queue: Mutex::new(PendingQueue::default()),
            subscribers: DashMap::new(),
            failed: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            shutdown_tx,
            loop_handle: Mutex::new(None),
            counters: BusCounters::default(),
        }
    }

    /// Register a handler for `event_type`. Returns an id usable with
    /// [`EventBus::unsubscribe`].
    pub fn subscribe<H>(&self, event_type: EventType, handler: H) -> Uuid
    where
        H: EventHandler + 'static,
    {
        let id = Uuid::new_v4();
        debug!("Subscribing handler '{}' to {}", handler.name(), event_type);

        self.subscribers
            .entry(event_type)
            .or_default()
            .push(Subscriber {
                id,
                handler: Arc::new(handler),
            });
        id
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut removed = false;
        for mut subscribers in self.subscribers.iter_mut() {
            let before = subscribers.len();
            subscribers.retain(|subscriber| subscriber.id != id);
            removed |= subscribers.len() != before;
        }
        removed
    }

    /// Remove every handler for `event_type`, returning how many there were
    pub fn unsubscribe_all(&self, event_type: &EventType) -> usize {
        self.subscribers
            .remove(event_type)
            .map_or(0, |(_, subscribers)| subscribers.len())
    }

    /// Enqueue an event. Returns `false` if the queue was full and the event
    /// was dropped.
    pub fn publish(&self, event: SystemEvent) -> bool {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.config.max_queue_size {
                drop(queue);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Event queue full ({}), dropping {} event {}",
                    self.config.max_queue_size, event.event_type, event.id
                );
                return false;
            }
            queue.push(event);
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        true
    }

    /// Dequeue and dispatch one event. Returns `false` if nothing was pending.
    pub async fn process_next(&self) -> bool {
        let Some(event) = self.queue.lock().pop() else {
            return false;
        };
        let event = Arc::new(event);

        let handlers: Vec<Arc<dyn EventHandler>> = self
            .subscribers
            .get(&event.event_type)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .map(|subscriber| Arc::clone(&subscriber.handler))
                    .collect()
            })
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!("No subscribers for {} event {}", event.event_type, event.id);
            self.counters.processed.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let timeout = self.config.handler_timeout;
        let dispatches = handlers.into_iter().map(|handler| {
            let name = handler.name().to_string();
            let event = Arc::clone(&event);
            let task = tokio::spawn(async move {
                tokio::time::timeout(timeout, handler.handle(event)).await
            });
            async move { (name, task.await) }
        });

        for (handler_name, outcome) in join_all(dispatches).await {
            let failure = match outcome {
                Ok(Ok(Ok(()))) => continue,
                Ok(Ok(Err(e))) => e.to_string(),
                Ok(Err(_)) => format!("timed out after {:?}", timeout),
                Err(e) => format!("handler task failed: {}", e),
            };

            error!(
                "Handler '{}' failed for {} event {}: {}",
                handler_name, event.event_type, event.id, failure
            );
            self.record_failure(&event, handler_name, failure);
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn record_failure(&self, event: &SystemEvent, handler: String, error: String) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);

        let mut failed = self.failed.lock();
        failed.push_back(FailedEvent {
            event: event.clone(),
            handler,
            error,
            failed_at: Utc::now(),
        });
        while failed.len() > self.config.max_failed_events {
            failed.pop_front();
        }
    }

    /// Start the processing loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut handle = self.loop_handle.lock();
        if handle.as_ref().map_or(false, |h| !h.is_finished()) {
            warn!("Event bus processing loop already running");
            return false;
        }

        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let bus = Arc::clone(self);

        *handle = Some(tokio::spawn(async move {
            info!("Event bus processing loop started");
            'outer: loop {
                loop {
                    let stopping = *shutdown_rx.borrow();
                    if stopping {
                        break 'outer;
                    }
                    if !bus.process_next().await {
                        break;
                    }
                }

                tokio::select! {
                    _ = bus.notify.notified() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break 'outer;
                        }
                    }
                }
            }
            info!(
                "Event bus processing loop stopped with {} events pending",
                bus.queue.lock().len()
            );
        }));
        true
    }

    /// Stop the processing loop and wait for the in-flight event to finish
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.loop_handle.lock().take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Event bus processing loop ended abnormally: {}", e);
            }
        }
    }

    /// Most recent failures, oldest first
    pub fn failed_events(&self, limit: usize) -> Vec<FailedEvent> {
        let failed = self.failed.lock();
        let skip = failed.len().saturating_sub(limit);
        failed.iter().skip(skip).cloned().collect()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn stats(&self) -> EventBusStats {
        let subscriber_counts = self
            .subscribers
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().len()))
            .collect();

        EventBusStats {
            queue_depth: self.queue_depth(),
            total_published: self.counters.published.load(Ordering::Relaxed),
            total_processed: self.counters.processed.load(Ordering::Relaxed),
            total_dropped: self.counters.dropped.load(Ordering::Relaxed),
            total_errors: self.counters.errors.load(Ordering::Relaxed),
            subscriber_counts,
        }
    }
}
