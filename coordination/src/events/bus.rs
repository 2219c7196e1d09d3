//! Event bus for task-lifecycle observers.
//!
//! Tokio broadcast channel pub/sub with optional persistence to the store,
//! so webhook and WebSocket subscribers can observe task lifecycle events.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::TaskEventKind;
use crate::state::SharedStateStore;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("failed to persist event: {0}")]
    PersistFailed(String),
    #[error("channel closed")]
    ChannelClosed,
}

pub type EventBusResult<T> = Result<T, EventBusError>;

pub type SharedEventBus = Arc<EventBus>;

pub struct EventBus {
    sender: broadcast::Sender<TaskEventKind>,
    store: Option<SharedStateStore>,
    persist_events: bool,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            store: None,
            persist_events: false,
        }
    }

    pub fn with_persistence(store: SharedStateStore) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            store: Some(store),
            persist_events: true,
        }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    pub fn set_persist_events(&mut self, persist: bool) {
        self.persist_events = persist;
    }

    pub fn publish(&self, event: TaskEventKind) -> EventBusResult<()> {
        let event_type = event.event_type();

        if self.persist_events {
            if let Some(store) = &self.store {
                let event_id = TaskEventKind::new_id();
                if let Err(e) = store.put_event(&event_id, &event) {
                    warn!(event_type, "failed to persist event: {e}");
                    return Err(EventBusError::PersistFailed(e.to_string()));
                }
                debug!(event_type, event_id, "event persisted");
            }
        }

        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type, receivers = count, "event published");
                Ok(())
            }
            Err(_) => {
                debug!(event_type, "event published (no receivers)");
                Ok(())
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEventKind> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Selective subscription filter.
pub struct EventFilter {
    pub task_id: Option<String>,
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self {
            task_id: None,
            event_types: None,
        }
    }

    pub fn task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    pub fn matches(&self, event: &TaskEventKind) -> bool {
        if let Some(ref tid) = self.task_id {
            if event.task_id() != tid {
                return false;
            }
        }
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        true
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FilteredReceiver {
    receiver: broadcast::Receiver<TaskEventKind>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<TaskEventKind>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    pub async fn recv(&mut self) -> Result<TaskEventKind, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

pub trait EventBusExt {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

impl EventBusExt for SharedEventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(task_id: &str) -> TaskEventKind {
        TaskEventKind::TaskCreated {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();
        bus.publish(sample("t1")).unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "task_created");
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = EventBus::new().shared();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(sample("t1")).unwrap();

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.event_type(), e2.event_type());
    }

    #[test]
    fn filter_matches_task_and_type() {
        let filter = EventFilter::new().task("t1").types(vec!["task_created"]);
        assert!(filter.matches(&sample("t1")));
        assert!(!filter.matches(&sample("t2")));
    }

    #[tokio::test]
    async fn filtered_receiver_skips_non_matching() {
        let bus = EventBus::new();
        let filter = EventFilter::new().task("target");
        let mut filtered = bus.subscribe_filtered(filter);

        let bus_clone = bus;
        tokio::spawn(async move {
            bus_clone.publish(sample("other")).unwrap();
            bus_clone.publish(sample("target")).unwrap();
        });

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.task_id(), "target");
    }
}
