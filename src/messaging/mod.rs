//! Message transport abstraction and the event publisher/subscriber on top.
//!
//! The transport is an at-least-once pub/sub backend with per-message
//! ack/nack. This module defines the contract ([`Transport`], [`Delivery`])
//! and an in-process implementation; [`TransportPublisher`] and
//! [`TransportSubscriber`] turn typed events into messages and back.

mod memory;
mod publisher;
mod subscriber;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::TransportError;
use crate::event::EventKind;

pub use memory::{InMemoryTransport, InMemoryTransportConfig};
pub use publisher::{Publisher, TransportPublisher};
pub use subscriber::{SubscriberConfig, TransportSubscriber};

/// Attribute carrying the event kind's wire name
pub const ATTR_EVENT_KIND: &str = "event_kind";

/// Attribute carrying the envelope id
pub const ATTR_EVENT_ID: &str = "event_id";

/// Attribute carrying the envelope timestamp (RFC 3339)
pub const ATTR_TIMESTAMP: &str = "timestamp";

// =============================================================================
// Message
// =============================================================================

/// A message body plus string attributes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub data: Bytes,
    pub attributes: HashMap<String, String>,
}

impl Message {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

// =============================================================================
// Transport
// =============================================================================

/// At-least-once pub/sub backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a message to a topic, returning the transport's message id.
    async fn publish(&self, topic: &str, message: Message) -> Result<String, TransportError>;

    /// Wait for the next message on a subscription.
    ///
    /// Returns [`TransportError::Closed`] once the transport shuts down.
    async fn pull(&self, subscription: &str) -> Result<Box<dyn Delivery>, TransportError>;
}

/// One delivery of a message to a subscriber.
///
/// A delivery dropped without [`ack`](Delivery::ack) is redelivered.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn message_id(&self) -> &str;

    fn message(&self) -> &Message;

    /// 1-based delivery attempt for this message
    fn attempt(&self) -> u32;

    /// When the message was first delivered
    fn first_attempt_at(&self) -> DateTime<Utc>;

    /// Settle the message; it will not be delivered again.
    async fn ack(&mut self) -> Result<(), TransportError>;

    /// Hand the message back for redelivery.
    async fn nack(&mut self) -> Result<(), TransportError>;

    /// Hand the message back, to be redelivered no sooner than `delay`.
    async fn nack_after(&mut self, delay: Duration) -> Result<(), TransportError>;

    /// Push back the ack deadline while the handler is still running.
    async fn extend_deadline(&self, by: Duration) -> Result<(), TransportError>;
}

// =============================================================================
// Topic Resolution
// =============================================================================

/// Maps event kinds to topics, with a default topic for unmapped kinds.
#[derive(Debug, Clone)]
pub struct TopicResolver {
    default: String,
    by_kind: HashMap<EventKind, String>,
}

impl TopicResolver {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            by_kind: HashMap::new(),
        }
    }

    pub fn with(mut self, kind: EventKind, topic: impl Into<String>) -> Self {
        self.by_kind.insert(kind, topic.into());
        self
    }

    pub fn resolve(&self, kind: EventKind) -> &str {
        self.by_kind.get(&kind).unwrap_or(&self.default)
    }

    /// Every distinct topic this resolver can return.
    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = std::iter::once(self.default.as_str())
            .chain(self.by_kind.values().map(String::as_str))
            .collect();
        topics.sort_unstable();
        topics.dedup();
        topics
    }
}

/// Parse `kind=topic`, as accepted by `--topic`.
pub fn parse_topic_override(s: &str) -> Result<(EventKind, String), String> {
    let (kind, topic) = s
        .split_once('=')
        .ok_or_else(|| format!("expected kind=topic, got '{s}'"))?;
    if topic.is_empty() {
        return Err(format!("empty topic for '{kind}'"));
    }
    let kind: EventKind = kind.parse().map_err(|e| format!("{e}"))?;
    Ok((kind, topic.to_string()))
}
