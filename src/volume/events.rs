//! Change notifications.
//!
//! Every directory of a volume publishes into one [`EventHub`]. Subscribers get their
//! own bounded channel; a subscriber that falls behind loses events instead of
//! stalling the index writer that publishes them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Update,
    Delete,
    /// An index commit landed.
    Commit,
    /// A resource's index writer stopped.
    WriterDied,
}

/// One notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: EventKind,

    pub resource: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,

    /// Properties written by the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<serde_json::Map<String, serde_json::Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seqno: Option<u64>,
}

impl Event {
    pub fn new(event: EventKind, resource: impl Into<String>) -> Self {
        Self {
            event,
            resource: resource.into(),
            guid: None,
            props: None,
            seqno: None,
        }
    }

    pub fn guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = Some(guid.into());
        self
    }

    pub fn props(mut self, props: serde_json::Map<String, serde_json::Value>) -> Self {
        self.props = Some(props);
        self
    }

    pub fn seqno(mut self, seqno: u64) -> Self {
        self.seqno = Some(seqno);
        self
    }

    /// Renders the event as one line of JSON, newline included.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}

/// Subscription filter. Empty fields match everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub resource: Option<String>,

    #[serde(default)]
    pub guid: Option<String>,

    #[serde(default)]
    pub events: Vec<EventKind>,
}

impl EventFilter {
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn events(mut self, events: &[EventKind]) -> Self {
        self.events = events.to_vec();
        self
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(resource) = &self.resource {
            if resource != &event.resource {
                return false;
            }
        }
        if let Some(guid) = &self.guid {
            if event.guid.as_ref() != Some(guid) {
                return false;
            }
        }
        self.events.is_empty() || self.events.contains(&event.event)
    }
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
    canceled: AtomicBool,
}

/// Receiving end of a subscription.
pub struct Subscription {
    pub id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<Event> {
        ReceiverStream::new(self.rx)
    }
}

/// Fan-out of events to subscribers.
pub struct EventHub {
    subscribers: DashMap<u64, Arc<Subscriber>>,
    next_id: AtomicU64,

    /// Capacity of each subscriber channel
    buffer: usize,
}

impl EventHub {
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        })
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.insert(
            id,
            Arc::new(Subscriber {
                filter,
                tx,
                canceled: AtomicBool::new(false),
            }),
        );
        debug!(subscription = id, "Subscribed");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        match self.subscribers.remove(&id) {
            Some((_, subscriber)) => {
                subscriber.canceled.store(true, Ordering::SeqCst);
                debug!(subscription = id, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Delivers `event` to every matching subscriber without blocking.
    pub fn publish(&self, event: Event) {
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if subscriber.canceled.load(Ordering::SeqCst) || !subscriber.filter.matches(&event) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        subscription = *entry.key(),
                        resource = %event.resource,
                        "Subscriber is lagging, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        for id in closed {
            self.unsubscribe(id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
