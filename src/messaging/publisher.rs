use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Message, TopicResolver, Transport, ATTR_EVENT_ID, ATTR_EVENT_KIND, ATTR_TIMESTAMP};
use crate::error::PipelineError;
use crate::event::{Event, EventSerializer, RetryPolicies};

/// Publishes typed events.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<(), PipelineError>;
}

/// [`Publisher`] that serializes events and sends them through a
/// [`Transport`], retrying transient transport failures.
pub struct TransportPublisher {
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn EventSerializer>,
    topics: TopicResolver,
    policies: RetryPolicies,
}

impl TransportPublisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn EventSerializer>,
        topics: TopicResolver,
        policies: RetryPolicies,
    ) -> Self {
        Self {
            transport,
            serializer,
            topics,
            policies,
        }
    }

    /// Build the transport message for an event.
    pub fn encode(&self, event: &Event) -> Result<Message, PipelineError> {
        let data = self.serializer.serialize(event)?;
        Ok(Message::new(data)
            .with_attribute(ATTR_EVENT_KIND, event.kind().as_str())
            .with_attribute(ATTR_EVENT_ID, event.event_id())
            .with_attribute(ATTR_TIMESTAMP, event.timestamp().to_rfc3339()))
    }
}

#[async_trait]
impl Publisher for TransportPublisher {
    async fn publish(&self, event: &Event) -> Result<(), PipelineError> {
        let topic = self.topics.resolve(event.kind());
        let policy = self.policies.for_kind(event.kind());
        let message = self.encode(event)?;

        let mut attempt = 1;
        loop {
            match self.transport.publish(topic, message.clone()).await {
                Ok(message_id) => {
                    debug!(
                        kind = %event.kind(),
                        event_id = event.event_id(),
                        topic,
                        message_id = %message_id,
                        "Published event"
                    );
                    return Ok(());
                }
                Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        kind = %event.kind(),
                        event_id = event.event_id(),
                        topic,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::error::{ErrorKind, TransportError};
    use crate::event::{Delete, EventKind, JsonSerializer, RetryPolicy};
    use crate::messaging::{Delivery, InMemoryTransport};

    /// Transport that rejects the first `failures` publishes.
    struct FlakyTransport {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn publish(&self, topic: &str, _message: Message) -> Result<String, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(TransportError::Publish {
                    topic: topic.to_string(),
                    message: "unavailable".to_string(),
                });
            }
            Ok(call.to_string())
        }

        async fn pull(&self, _subscription: &str) -> Result<Box<dyn Delivery>, TransportError> {
            Err(TransportError::Closed)
        }
    }

    fn fast_policies(max_attempts: u32) -> RetryPolicies {
        RetryPolicies::new(
            RetryPolicy::new(
                max_attempts,
                Duration::from_millis(1),
                Duration::from_millis(5),
                1.0,
            )
            .unwrap(),
        )
    }

    fn delete_event() -> Event {
        Event::new(Delete {
            content_id: "c-1".into(),
        })
    }

    #[tokio::test]
    async fn test_publish_sets_attributes_and_topic() {
        let transport = Arc::new(InMemoryTransport::recording());
        let publisher = TransportPublisher::new(
            transport.clone(),
            Arc::new(JsonSerializer::new()),
            TopicResolver::new("events").with(EventKind::Delete, "deletes"),
            RetryPolicies::default(),
        );

        let event = delete_event();
        publisher.publish(&event).await.unwrap();

        assert!(transport.published("events").is_empty());
        let published = transport.published("deletes");
        assert_eq!(published.len(), 1);
        let message = &published[0];
        assert_eq!(message.attribute(ATTR_EVENT_KIND), Some("delete"));
        assert_eq!(message.attribute(ATTR_EVENT_ID), Some(event.event_id()));
        assert_eq!(
            message.attribute(ATTR_TIMESTAMP),
            Some(event.timestamp().to_rfc3339().as_str())
        );
    }

    #[tokio::test]
    async fn test_publish_retries_transient_failures() {
        let transport = Arc::new(FlakyTransport {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let publisher = TransportPublisher::new(
            transport.clone(),
            Arc::new(JsonSerializer::new()),
            TopicResolver::new("events"),
            fast_policies(3),
        );

        publisher.publish(&delete_event()).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_publish_gives_up_after_max_attempts() {
        let transport = Arc::new(FlakyTransport {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let publisher = TransportPublisher::new(
            transport.clone(),
            Arc::new(JsonSerializer::new()),
            TopicResolver::new("events"),
            fast_policies(2),
        );

        let err = publisher.publish(&delete_event()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }
}
