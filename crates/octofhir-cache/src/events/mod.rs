//! Domain event streams feeding cache invalidation.
//!
//! # Architecture
//!
//! ```text
//! producer ──publish──► EventStream ──subscribe(types)──► InvalidationSubscriber
//!                        │                                        │
//!                        ├─ BroadcastEventStream (in-process)     ▼
//!                        └─ RedisEventStream (pub/sub)     CacheClient::invalidate_pattern
//! ```

mod redis;

pub use redis::RedisEventStream;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::{CacheError, CacheResult};

/// Default buffer size for the in-process bus.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Event envelope consumed from a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    /// The envelope as JSON, used for placeholder lookups.
    pub fn envelope(&self) -> Value {
        serde_json::json!({ "type": self.event_type, "data": self.data })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub group_id: String,
    pub from_beginning: bool,
}

/// Stream of events; items are errors when the transport hiccups.
pub type EventSubscription = BoxStream<'static, CacheResult<DomainEvent>>;

/// Source of domain events.
#[async_trait]
pub trait EventStream: Send + Sync {
    fn name(&self) -> &str;

    /// Subscribe to the given event types.
    async fn subscribe(
        &self,
        event_types: &[String],
        options: &SubscribeOptions,
    ) -> CacheResult<EventSubscription>;
}

/// In-process event bus over a tokio broadcast channel.
///
/// Events published before a subscription are not received.
#[derive(Clone)]
pub struct BroadcastEventStream {
    sender: broadcast::Sender<DomainEvent>,
}

impl BroadcastEventStream {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event, returning how many subscribers received it.
    pub fn publish(&self, event: DomainEvent) -> usize {
        self.sender.send(event).unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BroadcastEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastEventStream")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[async_trait]
impl EventStream for BroadcastEventStream {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn subscribe(
        &self,
        event_types: &[String],
        _options: &SubscribeOptions,
    ) -> CacheResult<EventSubscription> {
        let wanted: HashSet<String> = event_types.iter().cloned().collect();
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| {
            let item = match item {
                Ok(event) if wanted.contains(&event.event_type) => Some(Ok(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(
                    CacheError::event_stream(format!("subscriber lagged, {skipped} events dropped")),
                )),
            };
            std::future::ready(item)
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options() -> SubscribeOptions {
        SubscribeOptions {
            group_id: "test".into(),
            from_beginning: false,
        }
    }

    #[test]
    fn test_envelope_wire_format() {
        let event: DomainEvent =
            serde_json::from_value(json!({"type": "OrderShipped", "data": {"orderId": "O1"}}))
                .unwrap();
        assert_eq!(event.event_type, "OrderShipped");
        assert_eq!(
            event.envelope(),
            json!({"type": "OrderShipped", "data": {"orderId": "O1"}})
        );

        let bare: DomainEvent = serde_json::from_value(json!({"type": "Ping"})).unwrap();
        assert_eq!(bare.data, Value::Null);
    }

    #[tokio::test]
    async fn test_subscription_filters_by_type() {
        let bus = BroadcastEventStream::new();
        let mut stream = bus
            .subscribe(&["OrderShipped".to_string()], &options())
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(DomainEvent::new("PatientUpdated", json!({})));
        bus.publish(DomainEvent::new("OrderShipped", json!({"orderId": "O1"})));

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.event_type, "OrderShipped");
        assert_eq!(event.data["orderId"], "O1");
    }

    #[tokio::test]
    async fn test_lag_surfaces_as_error() {
        let bus = BroadcastEventStream::with_capacity(1);
        let mut stream = bus
            .subscribe(&["Tick".to_string()], &options())
            .await
            .unwrap();

        bus.publish(DomainEvent::new("Tick", json!(1)));
        bus.publish(DomainEvent::new("Tick", json!(2)));

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "event_stream");
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.data, json!(2));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = BroadcastEventStream::new();
        assert_eq!(bus.publish(DomainEvent::new("X", Value::Null)), 0);
    }
}
