//! Bounded in-memory audit trail for session lifecycle events.
//!
//! Every component narrates its state transitions through [`EventLog`]. The
//! log keeps a fixed-capacity ring (oldest entries evicted silently), mirrors
//! each event to `tracing`, and fans live events out to channel subscribers
//! used by the gateway's server-push feed. A subscriber whose channel is gone
//! is dropped during the same append and never breaks other subscribers.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Local;
use deskhive_core::current_unix_timestamp_ms;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

/// Ring capacity; matches the longest window the admin feed replays from.
pub const EVENT_LOG_CAPACITY: usize = 2_000;

pub const EVENT_SESSION_REQUESTED: &str = "session_requested";
pub const EVENT_SESSION_CREATED: &str = "session_created";
pub const EVENT_SESSION_ERROR: &str = "session_error";
pub const EVENT_SESSION_DESTROYED: &str = "session_destroyed";
pub const EVENT_SESSION_EXTENDED: &str = "session_extended";
pub const EVENT_SESSION_EXPIRED: &str = "session_expired";
pub const EVENT_HOST_UNHEALTHY: &str = "host_unhealthy";
pub const EVENT_HOST_HEALTHY: &str = "host_healthy";
pub const EVENT_ADMIN_ACTION: &str = "admin_action";

/// Severity attached to an event; mirrored to the matching `tracing` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl EventLevel {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// One recorded lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp_ms: u64,
    /// Human-readable local time, for the admin feed.
    pub datetime: String,
    pub kind: String,
    pub level: EventLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub metadata: Value,
}

/// Event under construction; `metadata` defaults to an empty object.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: &'static str,
    pub level: EventLevel,
    pub message: String,
    pub user_id: Option<u64>,
    pub username: Option<String>,
    pub metadata: Value,
}

impl EventDraft {
    pub fn new(kind: &'static str, level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            kind,
            level,
            message: message.into(),
            user_id: None,
            username: None,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn for_user(
        kind: &'static str,
        level: EventLevel,
        message: impl Into<String>,
        user_id: u64,
        username: &str,
    ) -> Self {
        let mut draft = Self::new(kind, level, message);
        draft.user_id = Some(user_id);
        draft.username = Some(username.to_string());
        draft
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Live feed handle returned by [`EventLog::subscribe`].
///
/// Dropping the receiver is enough to unsubscribe: the next append notices
/// the closed channel and removes the entry.
pub struct EventSubscription {
    pub id: u64,
    pub receiver: UnboundedReceiver<Event>,
}

struct EventSubscriber {
    id: u64,
    sender: UnboundedSender<Event>,
}

struct EventLogInner {
    events: VecDeque<Event>,
    subscribers: Vec<EventSubscriber>,
    next_subscriber_id: u64,
}

/// Append-only bounded event ring with live fan-out.
pub struct EventLog {
    capacity: usize,
    inner: Mutex<EventLogInner>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(EventLogInner {
                events: VecDeque::new(),
                subscribers: Vec::new(),
                next_subscriber_id: 1,
            }),
        }
    }

    /// Appends an event, fans it out to live subscribers, and mirrors it to
    /// `tracing`. Returns the recorded event.
    pub fn record(&self, draft: EventDraft) -> Event {
        let event = Event {
            timestamp_ms: current_unix_timestamp_ms(),
            datetime: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            kind: draft.kind.to_string(),
            level: draft.level,
            message: draft.message,
            user_id: draft.user_id,
            username: draft.username,
            metadata: draft.metadata,
        };

        let mut dropped: Vec<u64> = Vec::new();
        {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.events.push_back(event.clone());
            while inner.events.len() > self.capacity {
                inner.events.pop_front();
            }
            inner.subscribers.retain(|subscriber| {
                if subscriber.sender.send(event.clone()).is_ok() {
                    true
                } else {
                    dropped.push(subscriber.id);
                    false
                }
            });
        }
        for id in dropped {
            warn!("event subscriber {id} disconnected and was removed");
        }

        let line = match (&event.username, event.user_id) {
            (Some(username), Some(user_id)) => format!(
                "[{}] user {username} (id {user_id}): {}",
                event.kind, event.message
            ),
            _ => format!("[{}] {}", event.kind, event.message),
        };
        match event.level {
            EventLevel::Error => error!("{line}"),
            EventLevel::Warning => warn!("{line}"),
            EventLevel::Info => info!("{line}"),
        }

        event
    }

    /// Returns up to `limit` most recent events, oldest first within the
    /// window. A zero limit returns the whole ring.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let inner = lock_unpoisoned(&self.inner);
        let skip = if limit == 0 {
            0
        } else {
            inner.events.len().saturating_sub(limit)
        };
        inner.events.iter().skip(skip).cloned().collect()
    }

    /// Registers a live subscriber backed by an unbounded channel.
    pub fn subscribe(&self) -> EventSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = lock_unpoisoned(&self.inner);
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id = inner.next_subscriber_id.saturating_add(1);
        inner.subscribers.push(EventSubscriber { id, sender });
        EventSubscription { id, receiver }
    }

    /// Removes a subscriber registered via [`EventLog::subscribe`].
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.subscribers.retain(|subscriber| subscriber.id != id);
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.inner).subscribers.len()
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
