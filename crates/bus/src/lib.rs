// Path: crates/bus/src/lib.rs
//! # Herd Event Bus
//!
//! In-process, tag-routed publish/subscribe used by reactors, returners,
//! and internal observers. Tags are forward-slash-delimited paths;
//! subscribers register a literal tag, a `/`-terminated prefix, or a glob.
//!
//! The bus is bounded: a subscriber that falls more than the ring capacity
//! behind loses the oldest events and receives a one-shot
//! `herd/bus/overflow` warning event before resuming. Ordering is
//! guaranteed per producer, not globally.
#![cfg_attr(
    not(test),
    deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)
)]

use herd_types::event::Event;
use tokio::sync::broadcast;

/// The tag of the warning event injected when a subscriber lags.
pub const OVERFLOW_TAG: &str = "herd/bus/overflow";

/// How a subscription matches event tags.
#[derive(Debug, Clone)]
enum TagPattern {
    /// Everything.
    All,
    /// Exact tag.
    Literal(String),
    /// Path prefix; written with a trailing `/`.
    Prefix(String),
    /// Shell glob over the whole tag.
    Glob(glob::Pattern),
}

impl TagPattern {
    fn parse(pattern: &str) -> Result<Self, String> {
        if pattern.is_empty() {
            return Ok(Self::All);
        }
        if pattern.contains(['*', '?', '[']) {
            return glob::Pattern::new(pattern)
                .map(Self::Glob)
                .map_err(|e| format!("bad tag glob {:?}: {}", pattern, e));
        }
        if let Some(prefix) = pattern.strip_suffix('/') {
            return Ok(Self::Prefix(format!("{}/", prefix)));
        }
        Ok(Self::Literal(pattern.to_string()))
    }

    fn matches(&self, tag: &str) -> bool {
        match self {
            Self::All => true,
            Self::Literal(lit) => tag == lit,
            Self::Prefix(prefix) => tag.starts_with(prefix.as_str()),
            Self::Glob(pattern) => pattern.matches(tag),
        }
    }
}

/// The bus handle. Cheap to clone; every clone publishes into the same
/// ring.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a bus with the given ring capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fires an event. Never blocks; an event with no subscribers is
    /// simply dropped.
    pub fn fire(&self, event: Event) {
        tracing::trace!(tag = %event.tag, "event");
        let _ = self.tx.send(event);
    }

    /// Convenience: fire a single-key event.
    pub fn fire_single(&self, tag: impl Into<String>, key: &str, value: serde_json::Value) {
        self.fire(Event::single(tag, key, value));
    }

    /// Subscribes with a tag pattern. Events fired before this call are
    /// not delivered.
    pub fn subscribe(&self, pattern: &str) -> Result<EventStream, String> {
        Ok(EventStream {
            rx: self.tx.subscribe(),
            pattern: TagPattern::parse(pattern)?,
        })
    }
}

/// One subscriber's view of the bus.
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
    pattern: TagPattern,
}

impl EventStream {
    /// Waits for the next matching event. Returns `None` once the bus is
    /// gone. A lagging subscriber gets one `herd/bus/overflow` warning
    /// carrying the drop count, then resumes with the oldest retained
    /// event.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.pattern.matches(&event.tag) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagged, events dropped");
                    return Some(Event::single(
                        OVERFLOW_TAG,
                        "dropped",
                        serde_json::json!(missed),
                    ));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll used at shutdown to drain what is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.pattern.matches(&event.tag) {
                        return Some(event);
                    }
                }
                Err(_) => return None,
            }
        }
    }
}
