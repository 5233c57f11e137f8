//! Notification events and the in-process dispatcher.
//!
//! Repositories publish the four event kinds with `pg_notify` inside their
//! mutating transactions; the channel name is the event kind and the payload
//! is the JSON body of the matching struct below. A listener task decodes
//! notifications with [`Event::decode`] and hands them to a [`Dispatcher`],
//! which fans them out to subscribers.
//!
//! Each subscriber owns a tokio task fed by a bounded channel. Publishing
//! never waits: a full subscriber queue drops the event with a warning, a
//! failing or panicking handler only affects its own task. Delivery is
//! best-effort and at-most-once per physical notification.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::WorkerState;

// ============================================================================
// Event kinds and payloads
// ============================================================================

/// Fixed notification channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobAvailable,
    JobCompleted,
    JobFailed,
    WorkerStateChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::JobAvailable,
        EventKind::JobCompleted,
        EventKind::JobFailed,
        EventKind::WorkerStateChanged,
    ];

    /// PostgreSQL channel name.
    pub fn channel(&self) -> &'static str {
        match self {
            EventKind::JobAvailable => "job_available",
            EventKind::JobCompleted => "job_completed",
            EventKind::JobFailed => "job_failed",
            EventKind::WorkerStateChanged => "worker_state_changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.channel())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.channel() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown event kind: {}", s)))
    }
}

/// A job became claimable in `pool`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAvailable {
    pub pool: String,
    pub job_id: Uuid,
    pub priority: i32,
    pub job_type: String,
}

/// A job finished successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: Uuid,
    pub pool: String,
    pub worker_id: Uuid,
    pub job_type: String,
}

/// An attempt failed (handler error, timeout, or reclaim).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailed {
    pub job_id: Uuid,
    pub pool: String,
    pub worker_id: Uuid,
    pub error: String,
}

/// A worker moved between lifecycle states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStateChanged {
    pub worker_id: Uuid,
    pub pool: String,
    pub new_state: WorkerState,
    pub prev_state: Option<WorkerState>,
}

/// Any notification carried by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    JobAvailable(JobAvailable),
    JobCompleted(JobCompleted),
    JobFailed(JobFailed),
    WorkerStateChanged(WorkerStateChanged),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::JobAvailable(_) => EventKind::JobAvailable,
            Event::JobCompleted(_) => EventKind::JobCompleted,
            Event::JobFailed(_) => EventKind::JobFailed,
            Event::WorkerStateChanged(_) => EventKind::WorkerStateChanged,
        }
    }

    /// Pool the event belongs to.
    pub fn pool(&self) -> &str {
        match self {
            Event::JobAvailable(e) => &e.pool,
            Event::JobCompleted(e) => &e.pool,
            Event::JobFailed(e) => &e.pool,
            Event::WorkerStateChanged(e) => &e.pool,
        }
    }

    /// JSON body sent as the notification payload.
    pub fn payload(&self) -> Result<String> {
        let body = match self {
            Event::JobAvailable(e) => serde_json::to_string(e)?,
            Event::JobCompleted(e) => serde_json::to_string(e)?,
            Event::JobFailed(e) => serde_json::to_string(e)?,
            Event::WorkerStateChanged(e) => serde_json::to_string(e)?,
        };
        Ok(body)
    }

    /// Rebuild an event from a channel name and payload.
    pub fn decode(channel: &str, payload: &str) -> Result<Self> {
        let event = match channel.parse::<EventKind>()? {
            EventKind::JobAvailable => Event::JobAvailable(serde_json::from_str(payload)?),
            EventKind::JobCompleted => Event::JobCompleted(serde_json::from_str(payload)?),
            EventKind::JobFailed => Event::JobFailed(serde_json::from_str(payload)?),
            EventKind::WorkerStateChanged => {
                Event::WorkerStateChanged(serde_json::from_str(payload)?)
            }
        };
        Ok(event)
    }
}

/// Cut an error message to at most `max_bytes` bytes (plus an ellipsis)
/// without splitting a character.
pub fn truncate_error(error: &str, max_bytes: usize) -> String {
    if error.len() <= max_bytes {
        return error.to_string();
    }
    let mut end = max_bytes;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &error[..end])
}

/// Drop NUL characters, which PostgreSQL text and jsonb cannot store.
pub fn strip_nul(text: &str) -> String {
    text.replace('\0', "")
}

// ============================================================================
// Handlers
// ============================================================================

/// A subscriber callback.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Event) -> Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Handle returned by [`Dispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<Event>,
}

struct Inner {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Fan-out of events to per-kind subscribers.
///
/// Cloning is cheap; clones share the subscriber table.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(defaults::SUBSCRIBER_CAPACITY)
    }
}

impl Dispatcher {
    /// Create a dispatcher whose subscribers buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Register `handler` for `kind`. Must be called within a tokio runtime.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::channel::<Event>(self.inner.capacity);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        subscription = %id,
                        event_kind = %kind,
                        error = %e,
                        "Subscriber handler failed"
                    ),
                    Err(_) => error!(
                        subscription = %id,
                        event_kind = %kind,
                        "Subscriber handler panicked"
                    ),
                }
            }
            debug!(subscription = %id, event_kind = %kind, "Subscriber task finished");
        });

        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Subscriber { id, tx });

        debug!(subscription = %id, event_kind = %kind, "Subscribed");
        id
    }

    /// Remove a subscription. Its task exits once queued events drain.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for list in subscribers.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                list.remove(pos);
                debug!(subscription = %id, "Unsubscribed");
                return true;
            }
        }
        false
    }

    /// Deliver `event` to every subscriber of its kind without waiting.
    ///
    /// Returns the number of subscribers that accepted the event.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(list) = subscribers.get(&kind) {
                for subscriber in list {
                    match subscriber.tx.try_send(event.clone()) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) => warn!(
                            subscription = %subscriber.id,
                            event_kind = %kind,
                            "Subscriber queue full, dropping event"
                        ),
                        Err(TrySendError::Closed(_)) => closed.push(subscriber.id),
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self
                .inner
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(list) = subscribers.get_mut(&kind) {
                list.retain(|s| !closed.contains(&s.id));
            }
        }

        debug!(event_kind = %kind, subscriber_count = delivered, "Dispatcher publish");
        delivered
    }

    /// Live subscribers for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

// ============================================================================
// Tests
// ============================================================================
