//! In-process transport.
//!
//! Topics fan out to subscriptions; each subscription is a queue of pending
//! messages. A delivery that is nacked or dropped without an ack goes back
//! on its queue, up to a maximum number of attempts after which it is moved
//! to the subscription's dead-letter list.
//!
//! The published log is off unless `record_published` is set, and each
//! dead-letter list keeps only its most recent `max_dead_letters` messages.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Delivery, Message, Transport};
use crate::error::TransportError;

/// Default number of delivery attempts before dead-lettering
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 10;

/// Default number of dead letters kept per subscription
pub const DEFAULT_MAX_DEAD_LETTERS: usize = 1000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Redelivery behaviour of the in-process transport.
#[derive(Debug, Clone, Copy)]
pub struct InMemoryTransportConfig {
    /// Deliveries per message before it is dead-lettered
    pub max_delivery_attempts: u32,

    /// Minimum delay before a nacked or abandoned message becomes visible again
    pub redelivery_delay: Duration,

    /// Dead letters kept per subscription; the oldest are evicted first
    pub max_dead_letters: usize,

    /// Keep a copy of every published message for [`InMemoryTransport::published`]
    pub record_published: bool,
}

impl Default for InMemoryTransportConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            redelivery_delay: Duration::ZERO,
            max_dead_letters: DEFAULT_MAX_DEAD_LETTERS,
            record_published: false,
        }
    }
}

// =============================================================================
// Subscription Queue
// =============================================================================

struct Pending {
    id: String,
    message: Message,
    attempt: u32,
    first_attempt_at: Option<DateTime<Utc>>,
    visible_at: Instant,
}

struct SubscriptionQueue {
    name: String,
    pending: Mutex<VecDeque<Pending>>,
    dead_letters: Mutex<VecDeque<Message>>,
    notify: Notify,
    in_flight: AtomicUsize,
    acked: AtomicU64,
    extensions: AtomicU64,
}

impl SubscriptionQueue {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pending: Mutex::new(VecDeque::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            in_flight: AtomicUsize::new(0),
            acked: AtomicU64::new(0),
            extensions: AtomicU64::new(0),
        }
    }

    fn push(&self, pending: Pending) {
        lock(&self.pending).push_back(pending);
        self.notify.notify_waiters();
    }

    /// Put a delivered message back and release its in-flight slot.
    fn push_back_delivered(&self, pending: Pending) {
        {
            let mut queue = lock(&self.pending);
            queue.push_back(pending);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.notify.notify_waiters();
    }

    /// Return a delivered message for redelivery after `delay`, or
    /// dead-letter it once it has used up its attempts.
    fn requeue(&self, mut pending: Pending, delay: Duration, config: &InMemoryTransportConfig) {
        if pending.attempt >= config.max_delivery_attempts {
            warn!(
                subscription = %self.name,
                message_id = %pending.id,
                attempts = pending.attempt,
                "Message exceeded delivery attempts, dead-lettering"
            );
            {
                let mut dead = lock(&self.dead_letters);
                dead.push_back(pending.message);
                while dead.len() > config.max_dead_letters {
                    dead.pop_front();
                }
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        pending.visible_at = Instant::now() + delay.max(config.redelivery_delay);
        self.push_back_delivered(pending);
    }

    fn is_idle(&self) -> bool {
        // Pull and requeue update `in_flight` while holding the pending lock
        let pending = lock(&self.pending);
        pending.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0
    }
}

// =============================================================================
// Transport
// =============================================================================

struct TransportState {
    topics: HashMap<String, Vec<Arc<SubscriptionQueue>>>,
    subscriptions: HashMap<String, Arc<SubscriptionQueue>>,
    published: HashMap<String, Vec<Message>>,
}

struct TransportInner {
    config: InMemoryTransportConfig,
    state: Mutex<TransportState>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

/// In-process at-least-once transport.
///
/// Cloning is cheap; clones share the same topics and queues.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<TransportInner>,
}

impl InMemoryTransport {
    pub fn new(config: InMemoryTransportConfig) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                config,
                state: Mutex::new(TransportState {
                    topics: HashMap::new(),
                    subscriptions: HashMap::new(),
                    published: HashMap::new(),
                }),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a subscription to a topic. Messages published before the
    /// subscription exists are not delivered to it.
    pub fn create_subscription(&self, topic: &str, subscription: &str) {
        let mut state = lock(&self.inner.state);
        if state.subscriptions.contains_key(subscription) {
            return;
        }
        let queue = Arc::new(SubscriptionQueue::new(subscription));
        state
            .subscriptions
            .insert(subscription.to_string(), queue.clone());
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(queue);
        debug!(topic, subscription, "Created subscription");
    }

    /// A transport that keeps a log of published messages.
    pub fn recording() -> Self {
        Self::new(InMemoryTransportConfig {
            record_published: true,
            ..Default::default()
        })
    }

    /// Every message published to `topic`, in publish order.
    ///
    /// Always empty unless `record_published` is set.
    pub fn published(&self, topic: &str) -> Vec<Message> {
        lock(&self.inner.state)
            .published
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages moved out of `subscription` after too many attempts.
    pub fn dead_letters(&self, subscription: &str) -> Vec<Message> {
        self.queue(subscription)
            .map(|q| lock(&q.dead_letters).iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages acknowledged on `subscription`.
    pub fn acked(&self, subscription: &str) -> u64 {
        self.queue(subscription)
            .map(|q| q.acked.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Number of deadline extensions requested on `subscription`.
    pub fn deadline_extensions(&self, subscription: &str) -> u64 {
        self.queue(subscription)
            .map(|q| q.extensions.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// True when no subscription has pending or in-flight messages.
    pub fn is_idle(&self) -> bool {
        lock(&self.inner.state)
            .subscriptions
            .values()
            .all(|q| q.is_idle())
    }

    /// Shut down: pending and future pulls fail with `Closed`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        for queue in lock(&self.inner.state).subscriptions.values() {
            queue.notify.notify_waiters();
        }
    }

    fn queue(&self, subscription: &str) -> Option<Arc<SubscriptionQueue>> {
        lock(&self.inner.state)
            .subscriptions
            .get(subscription)
            .cloned()
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(InMemoryTransportConfig::default())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, topic: &str, message: Message) -> Result<String, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let queues = {
            let mut state = lock(&self.inner.state);
            if self.inner.config.record_published {
                state
                    .published
                    .entry(topic.to_string())
                    .or_default()
                    .push(message.clone());
            }
            state.topics.get(topic).cloned().unwrap_or_default()
        };

        let now = Instant::now();
        for queue in &queues {
            queue.push(Pending {
                id: id.clone(),
                message: message.clone(),
                attempt: 0,
                first_attempt_at: None,
                visible_at: now,
            });
        }

        debug!(topic, message_id = %id, fanout = queues.len(), "Published message");
        Ok(id)
    }

    async fn pull(&self, subscription: &str) -> Result<Box<dyn Delivery>, TransportError> {
        let queue = self
            .queue(subscription)
            .ok_or_else(|| TransportError::UnknownSubscription(subscription.to_string()))?;

        loop {
            // Register interest before checking so a concurrent push is not missed
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(TransportError::Closed);
            }

            let now = Instant::now();
            let next_visible = {
                let mut pending = lock(&queue.pending);
                let ready = pending
                    .iter()
                    .position(|p| p.visible_at <= now)
                    .and_then(|pos| pending.remove(pos));

                if let Some(mut message) = ready {
                    message.attempt += 1;
                    message.first_attempt_at.get_or_insert_with(Utc::now);
                    return Ok(Box::new(InMemoryDelivery::new(
                        message,
                        queue.clone(),
                        self.inner.config,
                    )));
                }

                pending.iter().map(|p| p.visible_at).min()
            };

            match next_visible {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

// =============================================================================
// Delivery
// =============================================================================

struct InMemoryDelivery {
    id: String,
    message: Message,
    attempt: u32,
    first_attempt_at: DateTime<Utc>,
    settled: bool,
    queue: Arc<SubscriptionQueue>,
    config: InMemoryTransportConfig,
}

impl InMemoryDelivery {
    fn new(pending: Pending, queue: Arc<SubscriptionQueue>, config: InMemoryTransportConfig) -> Self {
        queue.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            first_attempt_at: pending.first_attempt_at.unwrap_or_else(Utc::now),
            id: pending.id,
            message: pending.message,
            attempt: pending.attempt,
            settled: false,
            queue,
            config,
        }
    }

    /// Mark settled, returning false if it already was.
    fn settle(&mut self) -> bool {
        !std::mem::replace(&mut self.settled, true)
    }

    fn finish(&self) {
        self.queue.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn requeue(&mut self, delay: Duration) {
        if !self.settle() {
            return;
        }
        self.queue.requeue(
            Pending {
                id: self.id.clone(),
                message: std::mem::take(&mut self.message),
                attempt: self.attempt,
                first_attempt_at: Some(self.first_attempt_at),
                visible_at: Instant::now(),
            },
            delay,
            &self.config,
        );
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn message_id(&self) -> &str {
        &self.id
    }

    fn message(&self) -> &Message {
        &self.message
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    fn first_attempt_at(&self) -> DateTime<Utc> {
        self.first_attempt_at
    }

    async fn ack(&mut self) -> Result<(), TransportError> {
        if self.settle() {
            self.queue.acked.fetch_add(1, Ordering::SeqCst);
            self.finish();
        }
        Ok(())
    }

    async fn nack(&mut self) -> Result<(), TransportError> {
        self.requeue(Duration::ZERO);
        Ok(())
    }

    async fn nack_after(&mut self, delay: Duration) -> Result<(), TransportError> {
        self.requeue(delay);
        Ok(())
    }

    async fn extend_deadline(&self, by: Duration) -> Result<(), TransportError> {
        self.queue.extensions.fetch_add(1, Ordering::SeqCst);
        debug!(
            subscription = %self.queue.name,
            message_id = %self.id,
            extend_by_ms = by.as_millis() as u64,
            "Extended ack deadline"
        );
        Ok(())
    }
}

impl Drop for InMemoryDelivery {
    fn drop(&mut self) {
        // Abandoned without ack: redeliver
        self.requeue(Duration::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(max_attempts: u32) -> InMemoryTransport {
        let transport = InMemoryTransport::new(InMemoryTransportConfig {
            max_delivery_attempts: max_attempts,
            record_published: true,
            ..Default::default()
        });
        transport.create_subscription("events", "sub-a");
        transport.create_subscription("events", "sub-b");
        transport
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscription() {
        let transport = transport(3);
        transport.publish("events", Message::new("hello")).await.unwrap();

        let mut a = transport.pull("sub-a").await.unwrap();
        let mut b = transport.pull("sub-b").await.unwrap();
        assert_eq!(a.message().data, "hello");
        assert_eq!(b.message().data, "hello");
        assert_eq!(a.attempt(), 1);

        a.ack().await.unwrap();
        b.ack().await.unwrap();
        assert!(transport.is_idle());
        assert_eq!(transport.published("events").len(), 1);
    }

    #[tokio::test]
    async fn test_nack_and_drop_redeliver() {
        let transport = transport(5);
        transport.publish("events", Message::new("m")).await.unwrap();

        let mut first = transport.pull("sub-a").await.unwrap();
        first.nack().await.unwrap();

        let second = transport.pull("sub-a").await.unwrap();
        assert_eq!(second.attempt(), 2);
        drop(second);

        let mut third = transport.pull("sub-a").await.unwrap();
        assert_eq!(third.attempt(), 3);
        third.ack().await.unwrap();
        assert_eq!(transport.acked("sub-a"), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let transport = transport(2);
        transport.publish("events", Message::new("poison")).await.unwrap();

        for _ in 0..2 {
            let mut delivery = transport.pull("sub-a").await.unwrap();
            delivery.nack().await.unwrap();
        }

        let dead = transport.dead_letters("sub-a");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].data, "poison");
    }

    #[tokio::test]
    async fn test_nack_after_delays_redelivery() {
        let transport = transport(5);
        transport.publish("events", Message::new("m")).await.unwrap();

        let mut first = transport.pull("sub-a").await.unwrap();
        let nacked_at = Instant::now();
        first.nack_after(Duration::from_millis(50)).await.unwrap();
        assert!(!transport.is_idle());

        let second = transport.pull("sub-a").await.unwrap();
        assert_eq!(second.attempt(), 2);
        assert!(nacked_at.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_published_log_is_opt_in() {
        let transport = InMemoryTransport::default();
        transport.create_subscription("events", "sub-a");
        for _ in 0..100 {
            transport.publish("events", Message::new("m")).await.unwrap();
            transport.pull("sub-a").await.unwrap().ack().await.unwrap();
        }

        assert!(transport.published("events").is_empty());
        assert_eq!(transport.acked("sub-a"), 100);
        assert!(transport.is_idle());
    }

    #[tokio::test]
    async fn test_dead_letters_are_capped() {
        let transport = InMemoryTransport::new(InMemoryTransportConfig {
            max_delivery_attempts: 1,
            max_dead_letters: 2,
            ..Default::default()
        });
        transport.create_subscription("events", "sub-a");

        for body in ["one", "two", "three"] {
            transport.publish("events", Message::new(body)).await.unwrap();
            transport.pull("sub-a").await.unwrap().nack().await.unwrap();
        }

        let dead = transport.dead_letters("sub-a");
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0].data, "two");
        assert_eq!(dead[1].data, "three");
    }

    #[tokio::test]
    async fn test_pull_waits_for_publish() {
        let transport = transport(3);
        let puller = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.pull("sub-a").await.map(|d| d.message().clone()) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.publish("events", Message::new("late")).await.unwrap();

        let message = puller.await.unwrap().unwrap();
        assert_eq!(message.data, "late");
    }

    #[tokio::test]
    async fn test_close_wakes_pullers() {
        let transport = transport(3);
        let puller = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.pull("sub-a").await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.close();

        assert!(matches!(puller.await.unwrap(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_unknown_subscription() {
        let transport = transport(3);
        let result = transport.pull("missing").await;
        assert!(matches!(result, Err(TransportError::UnknownSubscription(_))));
    }
}
