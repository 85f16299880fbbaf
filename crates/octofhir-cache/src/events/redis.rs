//! Redis pub/sub event stream.
//!
//! Each event type travels on its own channel, `<prefix><type>`, as a JSON
//! envelope. Pub/sub keeps no history: a subscriber only sees events published
//! while it is connected.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use super::{DomainEvent, EventStream, EventSubscription, SubscribeOptions};
use crate::error::{CacheError, CacheResult};

/// Event stream backed by Redis pub/sub.
///
/// Subscriptions use a dedicated connection (pooled connections cannot
/// SUBSCRIBE), so this holds a plain client rather than the cache pool.
pub struct RedisEventStream {
    client: redis::Client,
    channel_prefix: String,
}

impl RedisEventStream {
    pub fn new(redis_url: &str, channel_prefix: impl Into<String>) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            channel_prefix: channel_prefix.into(),
        })
    }

    /// Channel carrying events of `event_type`.
    pub fn channel(&self, event_type: &str) -> String {
        format!("{}{}", self.channel_prefix, event_type)
    }

    /// Publish an event for every subscribed instance.
    pub async fn publish(&self, event: &DomainEvent) -> CacheResult<()> {
        let message = serde_json::to_string(event)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let receivers: i64 = conn.publish(self.channel(&event.event_type), &message).await?;

        debug!(
            event_type = %event.event_type,
            receivers,
            "Published event to Redis"
        );
        Ok(())
    }
}

impl std::fmt::Debug for RedisEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEventStream")
            .field("channel_prefix", &self.channel_prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventStream for RedisEventStream {
    fn name(&self) -> &str {
        "redis"
    }

    async fn subscribe(
        &self,
        event_types: &[String],
        options: &SubscribeOptions,
    ) -> CacheResult<EventSubscription> {
        if options.from_beginning {
            warn!(
                group_id = %options.group_id,
                "Redis pub/sub keeps no history, from_beginning is ignored"
            );
        }

        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            CacheError::event_stream(format!("failed to open pub/sub connection: {e}"))
        })?;

        for event_type in event_types {
            let channel = self.channel(event_type);
            pubsub.subscribe(&channel).await.map_err(|e| {
                CacheError::event_stream(format!("failed to subscribe to {channel}: {e}"))
            })?;
        }

        info!(
            group_id = %options.group_id,
            channels = event_types.len(),
            "Subscribed to Redis event channels"
        );

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let item = match msg.get_payload::<String>() {
                Ok(payload) => match serde_json::from_str::<DomainEvent>(&payload) {
                    Ok(event) => Some(Ok(event)),
                    Err(e) => {
                        warn!(
                            channel = %msg.get_channel_name(),
                            error = %e,
                            "Failed to deserialize Redis event"
                        );
                        None
                    }
                },
                Err(e) => Some(Err(CacheError::event_stream(format!(
                    "unreadable message on {}: {e}",
                    msg.get_channel_name()
                )))),
            };
            std::future::ready(item)
        });

        Ok(stream.boxed())
    }
}
