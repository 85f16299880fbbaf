//! Event-driven cache invalidation.
//!
//! Rules map an event type to key pattern templates such as
//! `order:{data.orderId}:*`. When an event arrives, every `{dotted.path}`
//! placeholder is resolved against the event envelope (`{type, data}`) and the
//! resulting pattern is invalidated.
//!
//! ## Example Flow
//!
//! ```text
//! OrderShipped {data: {orderId: "O1"}}
//!   ↓  rule: OrderShipped -> ["order:{data.orderId}:*"]
//! invalidate_pattern("order:O1:*")
//!   ↓
//! KEYS order:O1:* → DEL ... → local tier eviction
//! ```

use futures_util::StreamExt;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::CacheClient;
use crate::config::EventInvalidationConfig;
use crate::error::CacheResult;
use crate::events::{DomainEvent, EventStream, EventSubscription, SubscribeOptions};
use crate::metrics;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300); // 5 minutes max

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").expect("placeholder regex is valid"));

/// Resolve `{dotted.path}` placeholders against a JSON document.
///
/// Strings substitute raw; numbers, booleans and containers as compact JSON.
/// Tokens whose path is missing or null are left as written.
pub fn resolve_template(template: &str, envelope: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match lookup(envelope, &caps[1]) {
            None | Some(Value::Null) => caps[0].to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        })
        .into_owned()
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Consumes domain events and invalidates the key patterns derived from them.
pub struct InvalidationSubscriber {
    rules: BTreeMap<String, Vec<String>>,
    events: Arc<dyn EventStream>,
    options: SubscribeOptions,
}

impl InvalidationSubscriber {
    pub fn new(config: &EventInvalidationConfig, events: Arc<dyn EventStream>) -> Self {
        let mut rules = BTreeMap::new();
        for (event_type, templates) in &config.invalidation_map {
            if templates.is_empty() {
                info!(event_type = %event_type, "No invalidation patterns, not subscribing");
                continue;
            }
            rules.insert(event_type.clone(), templates.clone());
        }
        Self {
            rules,
            events,
            options: SubscribeOptions {
                group_id: config.group_id.clone(),
                from_beginning: config.from_beginning,
            },
        }
    }

    /// Event types with at least one template.
    pub fn event_types(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    pub async fn subscribe(&self) -> CacheResult<EventSubscription> {
        let event_types = self.event_types();
        let subscription = self.events.subscribe(&event_types, &self.options).await?;
        info!(
            stream = self.events.name(),
            event_types = ?event_types,
            "Subscribed to invalidation events"
        );
        Ok(subscription)
    }

    /// Invalidate every pattern mapped to the event's type.
    ///
    /// Returns the number of keys deleted. Failing patterns are logged and
    /// skipped.
    pub async fn handle_event(&self, client: &CacheClient, event: &DomainEvent) -> u64 {
        let Some(templates) = self.rules.get(&event.event_type) else {
            debug!(event_type = %event.event_type, "No invalidation rule for event");
            return 0;
        };

        let envelope = event.envelope();
        let mut total = 0;
        for template in templates {
            let pattern = resolve_template(template, &envelope);
            match client.invalidate_pattern(&pattern).await {
                Ok(deleted) => total += deleted,
                Err(e) => {
                    warn!(
                        event_type = %event.event_type,
                        pattern = %pattern,
                        error = %e,
                        "Failed to invalidate pattern"
                    );
                }
            }
        }

        info!(
            event_type = %event.event_type,
            patterns = templates.len(),
            deleted = total,
            "Processed invalidation event"
        );
        metrics::record_invalidation(&event.event_type, total);
        total
    }

    /// Start the consuming task.
    ///
    /// `initial` is an already-open subscription; when absent (or once it
    /// ends) the task resubscribes with exponential backoff until cancelled.
    pub fn spawn(
        self: Arc<Self>,
        client: Weak<CacheClient>,
        initial: Option<EventSubscription>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(client, initial, token).await;
            info!("Invalidation subscriber stopped");
        })
    }

    async fn run(
        &self,
        client: Weak<CacheClient>,
        mut subscription: Option<EventSubscription>,
        token: CancellationToken,
    ) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let mut stream = match subscription.take() {
                Some(stream) => stream,
                None => {
                    let result = tokio::select! {
                        biased;
                        _ = token.cancelled() => return,
                        result = self.subscribe() => result,
                    };
                    match result {
                        Ok(stream) => {
                            backoff = INITIAL_BACKOFF;
                            stream
                        }
                        Err(e) => {
                            error!(
                                error = %e,
                                backoff_secs = backoff.as_secs(),
                                "Invalidation subscribe failed, retrying..."
                            );
                            if !sleep_or_cancel(backoff, &token).await {
                                return;
                            }
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                            continue;
                        }
                    }
                }
            };

            loop {
                let item = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(event)) => {
                        let Some(client) = client.upgrade() else {
                            return;
                        };
                        self.handle_event(&client, &event).await;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Invalidation event stream error");
                    }
                    None => {
                        warn!(
                            backoff_secs = backoff.as_secs(),
                            "Invalidation event stream ended, resubscribing..."
                        );
                        break;
                    }
                }
            }

            if !sleep_or_cancel(backoff, &token).await {
                return;
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

impl std::fmt::Debug for InvalidationSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationSubscriber")
            .field("rules", &self.rules)
            .field("stream", &self.events.name())
            .field("options", &self.options)
            .finish()
    }
}

/// Sleep for `duration`; `false` if cancelled first.
async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventStream;
    use serde_json::json;

    #[test]
    fn test_resolve_string_placeholder() {
        let envelope = json!({"type": "OrderShipped", "data": {"orderId": "O1"}});
        assert_eq!(
            resolve_template("order:{data.orderId}:*", &envelope),
            "order:O1:*"
        );
        assert_eq!(resolve_template("events:{type}", &envelope), "events:OrderShipped");
    }

    #[test]
    fn test_resolve_non_string_values() {
        let envelope = json!({
            "type": "BedAssigned",
            "data": {"ward": 7, "urgent": true, "tags": ["a", "b"], "beds": [{"id": "B3"}]}
        });
        assert_eq!(resolve_template("ward:{data.ward}", &envelope), "ward:7");
        assert_eq!(resolve_template("u:{data.urgent}", &envelope), "u:true");
        assert_eq!(resolve_template("t:{data.tags}", &envelope), r#"t:["a","b"]"#);
        assert_eq!(resolve_template("bed:{data.beds.0.id}", &envelope), "bed:B3");
    }

    #[test]
    fn test_missing_or_null_left_literal() {
        let envelope = json!({"type": "X", "data": {"gone": null}});
        assert_eq!(
            resolve_template("a:{data.missing}:{data.gone}:{data.gone.deeper}", &envelope),
            "a:{data.missing}:{data.gone}:{data.gone.deeper}"
        );
        assert_eq!(resolve_template("plain:*", &envelope), "plain:*");
    }

    #[test]
    fn test_empty_rules_not_subscribed() {
        let mut config = EventInvalidationConfig::default();
        config
            .invalidation_map
            .insert("OrderShipped".into(), vec!["order:{data.orderId}:*".into()]);
        config.invalidation_map.insert("Noop".into(), vec![]);

        let subscriber = InvalidationSubscriber::new(&config, Arc::new(BroadcastEventStream::new()));
        assert_eq!(subscriber.event_types(), vec!["OrderShipped".to_string()]);
    }
}
