//! In-process event bus feeding SSE subscribers.
//!
//! Publishers never block: each subscriber owns a bounded queue, and when a
//! queue is full the oldest event is evicted and accounted for. The gap is
//! surfaced to the subscriber as a synthetic `events.dropped` marker before
//! the next delivered event, so events are never silently lost. Delivery
//! order per subscriber matches publish order; there is no cross-subscriber
//! ordering. Dropping a [`Subscription`] releases its buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::models::ChunkStatus;

/// Stable event-type names; these strings are a wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "chunk.created")]
    ChunkCreated,
    #[serde(rename = "chunk.updated")]
    ChunkUpdated,
    #[serde(rename = "entities.extracted")]
    EntitiesExtracted,
    #[serde(rename = "compaction.level.complete")]
    CompactionLevelComplete,
    #[serde(rename = "compaction.failed")]
    CompactionFailed,
    #[serde(rename = "mcp.status_changed")]
    McpStatusChanged,
    #[serde(rename = "events.dropped")]
    EventsDropped,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ChunkCreated => "chunk.created",
            EventKind::ChunkUpdated => "chunk.updated",
            EventKind::EntitiesExtracted => "entities.extracted",
            EventKind::CompactionLevelComplete => "compaction.level.complete",
            EventKind::CompactionFailed => "compaction.failed",
            EventKind::McpStatusChanged => "mcp.status_changed",
            EventKind::EventsDropped => "events.dropped",
        }
    }
}

/// A transient pipeline event. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            chunk_id: None,
            project_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn chunk_created(chunk_id: Uuid, project_id: Option<Uuid>) -> Self {
        Self {
            chunk_id: Some(chunk_id),
            project_id,
            ..Self::new(EventKind::ChunkCreated, serde_json::json!({}))
        }
    }

    pub fn chunk_updated(chunk_id: Uuid, status: ChunkStatus) -> Self {
        Self {
            chunk_id: Some(chunk_id),
            ..Self::new(
                EventKind::ChunkUpdated,
                serde_json::json!({ "status": status.as_str() }),
            )
        }
    }

    pub fn entities_extracted(chunk_id: Uuid, counts: &[(&'static str, usize)]) -> Self {
        let counts: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(kind, n)| (kind.to_string(), serde_json::json!(n)))
            .collect();
        Self {
            chunk_id: Some(chunk_id),
            ..Self::new(
                EventKind::EntitiesExtracted,
                serde_json::Value::Object(counts),
            )
        }
    }

    pub fn compaction_level_complete(project_id: Uuid, depth: i64, chunk_count: usize) -> Self {
        Self {
            project_id: Some(project_id),
            ..Self::new(
                EventKind::CompactionLevelComplete,
                serde_json::json!({ "depth": depth, "chunks": chunk_count }),
            )
        }
    }

    pub fn compaction_failed(project_id: Uuid, error: &str) -> Self {
        Self {
            project_id: Some(project_id),
            ..Self::new(
                EventKind::CompactionFailed,
                serde_json::json!({ "error": error }),
            )
        }
    }

    pub fn mcp_status_changed(server: &str, state: &str) -> Self {
        Self::new(
            EventKind::McpStatusChanged,
            serde_json::json!({ "server": server, "state": state }),
        )
    }

    fn events_dropped(count: u64) -> Self {
        Self::new(EventKind::EventsDropped, serde_json::json!({ "count": count }))
    }
}

struct SubscriberState {
    queue: Mutex<SubscriberQueue>,
    notify: Notify,
}

struct SubscriberQueue {
    events: VecDeque<Event>,
    /// Events evicted since the subscriber last drained past the gap.
    dropped: u64,
}

struct BusInner {
    subscribers: Mutex<HashMap<u64, Arc<SubscriberState>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// The in-process pub/sub fan-out point.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Deliver an event to every live subscriber. Never blocks; a full
    /// subscriber loses its oldest event and gains a pending drop marker.
    pub fn publish(&self, event: Event) {
        let subscribers = self.inner.subscribers.lock().unwrap();
        for state in subscribers.values() {
            let mut queue = state.queue.lock().unwrap();
            if queue.events.len() >= self.inner.capacity {
                queue.events.pop_front();
                queue.dropped += 1;
            }
            queue.events.push_back(event.clone());
            drop(queue);
            state.notify.notify_one();
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SubscriberState {
            queue: Mutex::new(SubscriberQueue {
                events: VecDeque::new(),
                dropped: 0,
            }),
            notify: Notify::new(),
        });
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&state));
        Subscription {
            id,
            state,
            bus: Arc::clone(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }
}

/// One subscriber's view of the bus. Dropping it unregisters the
/// subscriber and frees its buffer.
pub struct Subscription {
    id: u64,
    state: Arc<SubscriberState>,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Next event in publish order. A gap caused by overflow yields an
    /// `events.dropped` marker before the first event after the gap.
    pub async fn recv(&mut self) -> Event {
        loop {
            {
                let mut queue = self.state.queue.lock().unwrap();
                if queue.dropped > 0 {
                    let marker = Event::events_dropped(queue.dropped);
                    queue.dropped = 0;
                    return marker;
                }
                if let Some(event) = queue.events.pop_front() {
                    return event;
                }
            }
            self.state.notify.notified().await;
        }
    }

    /// Non-blocking variant used by tests and draining loops.
    pub fn try_recv(&mut self) -> Option<Event> {
        let mut queue = self.state.queue.lock().unwrap();
        if queue.dropped > 0 {
            let marker = Event::events_dropped(queue.dropped);
            queue.dropped = 0;
            return Some(marker);
        }
        queue.events.pop_front()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.subscribers.lock().unwrap().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_order_preserved() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(Event::chunk_updated(Uuid::from_u128(i), ChunkStatus::Processed));
        }
        for i in 0..5 {
            let event = sub.recv().await;
            assert_eq!(event.chunk_id, Some(Uuid::from_u128(i)));
        }
    }

    #[tokio::test]
    async fn test_overflow_inserts_drop_marker() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(Event::chunk_updated(Uuid::from_u128(i), ChunkStatus::Processed));
        }
        // Three oldest events were evicted; the marker reports them.
        let marker = sub.recv().await;
        assert_eq!(marker.kind, EventKind::EventsDropped);
        assert_eq!(marker.payload["count"], 3);
        // Survivors are the newest two, still in order.
        assert_eq!(sub.recv().await.chunk_id, Some(Uuid::from_u128(3)));
        assert_eq!(sub.recv().await.chunk_id, Some(Uuid::from_u128(4)));
    }

    #[tokio::test]
    async fn test_drop_releases_subscriber() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_are_independent() {
        let bus = EventBus::new(4);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(Event::chunk_created(Uuid::from_u128(1), None));
        assert!(a.try_recv().is_some());
        assert!(b.try_recv().is_some());
        assert!(a.try_recv().is_none());
    }
}
