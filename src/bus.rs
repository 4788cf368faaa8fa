// ===============================
// src/bus.rs
// ===============================
//
// In-process fan-out of accepted listing events.
// `publish` never waits: each subscriber owns a bounded queue and a worker
// task. On overflow the oldest undelivered event of that subscriber is
// dropped. A panicking handler is caught, counted, dead-lettered, and the
// worker carries on with the next event.
//
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{KindTag, ListingEvent};
use crate::metrics::{BUS_DROPPED, BUS_PUBLISHED, DEAD_LETTERS, HANDLER_PANICS};
use crate::store::Store;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: Arc<ListingEvent>);
}

/// Adapts an async closure into a `Handler`.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Arc<ListingEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, event: Arc<ListingEvent>) {
        (self.0)(event).await
    }
}

/// Where events that killed a handler end up.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, event_id: Option<u64>, worker: &str, reason: &str);
}

#[async_trait]
impl DeadLetterSink for Store {
    async fn dead_letter(&self, event_id: Option<u64>, worker: &str, reason: &str) {
        if let Err(e) = self.record_dead_letter(event_id, worker, reason).await {
            error!(?e, ?event_id, worker, "failed to persist dead letter");
        }
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Arc<ListingEvent>>,
    // front item is being handled
    in_flight: bool,
    closed: bool,
}

struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

impl Queue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns true when something had to be dropped.
    fn push(&self, ev: Arc<ListingEvent>) -> bool {
        let dropped = {
            let mut st = self.lock();
            if st.closed {
                return false;
            }
            let mut dropped = false;
            if st.items.len() >= self.capacity {
                let victim = if st.in_flight { st.items.remove(1) } else { st.items.pop_front() };
                dropped = victim.is_some();
            }
            st.items.push_back(ev);
            dropped
        };
        self.notify.notify_one();
        dropped
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberStats {
    pub name: String,
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
}

struct Subscription {
    name: String,
    kinds: Vec<KindTag>,
    queue: Arc<Queue>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    fn wants(&self, tag: KindTag) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&tag)
    }
}

pub struct EventBus {
    subs: RwLock<Vec<Arc<Subscription>>>,
    // serializes publishers so every subscriber sees one acceptance order
    publish_lock: Mutex<()>,
    capacity: usize,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    closed: AtomicBool,
    accepted: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize, dead_letters: Option<Arc<dyn DeadLetterSink>>) -> Self {
        EventBus {
            subs: RwLock::new(Vec::new()),
            publish_lock: Mutex::new(()),
            capacity: capacity.max(1),
            dead_letters,
            closed: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
        }
    }

    fn subs(&self) -> Vec<Arc<Subscription>> {
        match self.subs.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Registers `handler` for `kinds` (empty = every kind) and starts its worker.
    pub fn subscribe(&self, name: &str, kinds: &[KindTag], handler: Arc<dyn Handler>) {
        let queue = Arc::new(Queue {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: self.capacity,
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        });
        let task = tokio::spawn(run_worker(
            name.to_string(),
            queue.clone(),
            handler,
            self.dead_letters.clone(),
        ));
        let sub = Arc::new(Subscription {
            name: name.to_string(),
            kinds: kinds.to_vec(),
            queue,
            task: Mutex::new(Some(task)),
        });
        match self.subs.write() {
            Ok(mut g) => g.push(sub),
            Err(poisoned) => poisoned.into_inner().push(sub),
        }
        info!(subscriber = name, ?kinds, capacity = self.capacity, "bus subscriber registered");
    }

    /// Hands the event to every interested subscriber. Never blocks on a
    /// subscriber; returns false once the bus is shut down.
    pub fn publish(&self, event: ListingEvent) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let event = Arc::new(event);
        let tag = event.kind.tag();
        let _order = match self.publish_lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        for sub in self.subs().iter().filter(|s| s.wants(tag)) {
            if sub.queue.push(event.clone()) {
                sub.queue.dropped.fetch_add(1, Ordering::Relaxed);
                BUS_DROPPED.with_label_values(&[&sub.name]).inc();
                debug!(subscriber = %sub.name, event_id = event.id, "subscriber queue full, dropped oldest");
            }
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        BUS_PUBLISHED.inc();
        true
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Vec<SubscriberStats> {
        self.subs()
            .iter()
            .map(|s| SubscriberStats {
                name: s.name.clone(),
                queued: s.queue.lock().items.len(),
                delivered: s.queue.delivered.load(Ordering::Relaxed),
                dropped: s.queue.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn subscriber_stats(&self, name: &str) -> Option<SubscriberStats> {
        self.stats().into_iter().find(|s| s.name == name)
    }

    /// Stops accepting events and lets workers drain what is queued.
    /// Workers still busy at `deadline` are aborted. Returns how many were.
    pub async fn shutdown(&self, deadline: Duration) -> usize {
        self.closed.store(true, Ordering::Release);
        let subs = self.subs();
        let mut tasks = Vec::new();
        for sub in &subs {
            sub.queue.lock().closed = true;
            sub.queue.notify.notify_one();
            let handle = match sub.task.lock() {
                Ok(mut g) => g.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(h) = handle {
                tasks.push((sub.name.clone(), h));
            }
        }

        let until = tokio::time::Instant::now() + deadline;
        let mut aborted = 0;
        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(until, &mut handle).await {
                Ok(_) => debug!(subscriber = %name, "bus worker drained"),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                    warn!(subscriber = %name, "bus worker still busy at drain deadline, aborted");
                }
            }
        }
        info!(aborted, "event bus stopped");
        aborted
    }
}

async fn run_worker(
    name: String,
    queue: Arc<Queue>,
    handler: Arc<dyn Handler>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
) {
    loop {
        let next = {
            let mut st = queue.lock();
            match st.items.front().cloned() {
                Some(ev) => {
                    st.in_flight = true;
                    Some(ev)
                }
                None if st.closed => break,
                None => None,
            }
        };
        let Some(ev) = next else {
            queue.notify.notified().await;
            continue;
        };

        let outcome = AssertUnwindSafe(handler.handle(ev.clone())).catch_unwind().await;

        {
            let mut st = queue.lock();
            st.items.pop_front();
            st.in_flight = false;
        }
        queue.delivered.fetch_add(1, Ordering::Relaxed);

        if let Err(payload) = outcome {
            let reason = panic_message(payload.as_ref());
            HANDLER_PANICS.with_label_values(&[&name]).inc();
            DEAD_LETTERS.inc();
            error!(subscriber = %name, event_id = ev.id, symbol = %ev.symbol, %reason, "handler panicked, event dead-lettered");
            if let Some(sink) = &dead_letters {
                sink.dead_letter(Some(ev.id), &name, &reason).await;
            }
        }
    }
    debug!(subscriber = %name, "bus worker exited");
}
