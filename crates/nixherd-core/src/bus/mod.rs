//! Log broadcast bus.
//!
//! Fans log lines and lifecycle events from supervised children out to every
//! attached session. Publishing never blocks: each subscriber owns a bounded
//! inbox, and an event that does not fit is dropped for that subscriber only,
//! with a per-subscriber drop counter. Subscribers whose inbox has been
//! closed (the receiving side was dropped) are pruned on the next publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Per-subscriber inbox capacity, in events.
pub const INBOX_CAPACITY: usize = 1024;

/// Which stream of a managed child an event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
    /// Lifecycle events emitted by the supervisor itself.
    System,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A single log line or lifecycle event, keyed by package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Package key the event belongs to.
    pub package_key: String,

    /// Originating stream.
    pub stream: LogStream,

    /// Line content, without the trailing newline.
    pub text: String,

    /// When the supervisor observed the line.
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn now(package_key: impl Into<String>, stream: LogStream, text: impl Into<String>) -> Self {
        Self {
            package_key: package_key.into(),
            stream,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Opaque handle identifying one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Slot {
    tx: mpsc::Sender<LogEvent>,
    dropped: Arc<AtomicU64>,
}

/// Many-to-many publish/subscribe fanout for [`LogEvent`]s.
///
/// The bus owns only the sending halves; receiving halves live in
/// [`Subscription`]s owned by sessions. Dropping a `Subscription` without
/// calling [`LogBus::unsubscribe`] is tolerated — the dead slot is removed
/// the next time a publish hits it.
pub struct LogBus {
    slots: Mutex<HashMap<SubscriberId, Slot>>,
}

impl LogBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new subscriber with a bounded inbox.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let id = SubscriberId::new();
        let dropped = Arc::new(AtomicU64::new(0));
        let mut slots = self.slots.lock().expect("bus lock poisoned");
        slots.insert(
            id,
            Slot {
                tx,
                dropped: Arc::clone(&dropped),
            },
        );
        Subscription { id, rx, dropped }
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut slots = self.slots.lock().expect("bus lock poisoned");
        slots.remove(&id);
    }

    /// Deliver `event` to every current subscriber without blocking.
    ///
    /// A full inbox drops the event for that subscriber and bumps its drop
    /// counter; a closed inbox removes the subscriber.
    pub fn publish(&self, event: &LogEvent) {
        let mut slots = self.slots.lock().expect("bus lock poisoned");
        let mut dead = Vec::new();
        for (id, slot) in slots.iter() {
            match slot.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    slot.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            slots.remove(&id);
            tracing::debug!(subscriber = %id, "pruned closed subscriber");
        }
    }

    /// Number of currently registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.slots.lock().expect("bus lock poisoned").len()
    }
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's receiving end: the bounded inbox plus its drop counter.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<LogEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// The handle identifying this subscriber on the bus.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Receive the next event, waiting until one arrives.
    ///
    /// Returns `None` once the subscriber has been removed from the bus and
    /// the inbox is drained.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<LogEvent> {
        self.rx.try_recv().ok()
    }

    /// Poll for the next event. Used by stream adapters.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<LogEvent>> {
        self.rx.poll_recv(cx)
    }

    /// How many events were dropped because this inbox was full.
    #[must_use]
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("dropped", &self.drop_count())
            .finish()
    }
}
