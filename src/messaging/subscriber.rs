use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Delivery, Transport, ATTR_EVENT_KIND};
use crate::error::{PipelineError, TransportError};
use crate::event::{Event, EventKind, EventSerializer, RetryPolicies};
use crate::pipeline::EventHandler;

/// Default bound on concurrently processed messages
pub const DEFAULT_MAX_IN_FLIGHT: usize = 100;

/// Default interval between ack-deadline extensions
pub const DEFAULT_EXTEND_INTERVAL: Duration = Duration::from_secs(30);

/// Subscriber tuning.
#[derive(Debug, Clone, Copy)]
pub struct SubscriberConfig {
    /// Maximum messages handled at once
    pub max_in_flight: usize,

    /// How often the ack deadline is pushed back while a handler runs
    pub extend_interval: Duration,

    /// How far each extension pushes the deadline
    pub extend_by: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            extend_interval: DEFAULT_EXTEND_INTERVAL,
            extend_by: DEFAULT_EXTEND_INTERVAL * 2,
        }
    }
}

/// Pulls messages from a subscription and dispatches them to one handler.
///
/// # Ack policy
///
/// | Outcome                                  | Action                      |
/// |------------------------------------------|-----------------------------|
/// | missing or unknown `event_kind`          | nack                        |
/// | kind belongs to another handler          | ack                         |
/// | body cannot be decoded                   | log, ack                    |
/// | handler `Ok`                             | ack                         |
/// | non-retryable handler error              | log, ack                    |
/// | `Internal`, attempts left                | nack after policy backoff   |
/// | `Internal`, attempts exhausted           | `on_exhausted`, ack         |
#[derive(Clone)]
pub struct TransportSubscriber {
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn EventSerializer>,
    policies: RetryPolicies,
    config: SubscriberConfig,
}

impl TransportSubscriber {
    pub fn new(
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn EventSerializer>,
        policies: RetryPolicies,
        config: SubscriberConfig,
    ) -> Self {
        Self {
            transport,
            serializer,
            policies,
            config,
        }
    }

    /// Run until `cancel` fires or the transport closes.
    ///
    /// Each message is handled on its own task. On cancellation, in-flight
    /// handlers are aborted and their messages left for redelivery.
    pub async fn subscribe(
        &self,
        subscription: &str,
        handler: Arc<dyn EventHandler>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut tasks = JoinSet::new();

        info!(
            subscription,
            handler = handler.name(),
            max_in_flight = self.config.max_in_flight,
            "Subscriber started"
        );

        let result = loop {
            // Reap finished tasks
            while tasks.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(TransportError::Closed),
                },
            };

            let delivery = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                delivery = self.transport.pull(subscription) => match delivery {
                    Ok(delivery) => delivery,
                    Err(TransportError::Closed) => break Ok(()),
                    Err(e) => break Err(e),
                },
            };

            let worker = self.clone();
            let handler = handler.clone();
            tasks.spawn(async move {
                worker.process(handler, delivery).await;
                drop(permit);
            });
        };

        // Aborting drops each in-flight delivery unacked
        tasks.shutdown().await;
        info!(subscription, handler = handler.name(), "Subscriber stopped");
        result
    }

    async fn process(&self, handler: Arc<dyn EventHandler>, mut delivery: Box<dyn Delivery>) {
        let message_id = delivery.message_id().to_string();
        let attempt = delivery.attempt();

        let Some(kind_name) = delivery.message().attribute(ATTR_EVENT_KIND).map(str::to_string)
        else {
            warn!(message_id, "Message has no event_kind attribute, nacking");
            settle(delivery.nack().await, &message_id);
            return;
        };

        let kind: EventKind = match kind_name.parse() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(message_id, event_kind = %kind_name, error = %e, "Unknown event kind, nacking");
                settle(delivery.nack().await, &message_id);
                return;
            }
        };

        if kind != handler.kind() {
            debug!(
                message_id,
                kind = %kind,
                handler = handler.name(),
                "Event is for another handler, acking"
            );
            settle(delivery.ack().await, &message_id);
            return;
        }

        let event = match self.serializer.deserialize(&delivery.message().data, &kind_name) {
            Ok(event) => event,
            Err(e) => {
                error!(message_id, kind = %kind, error = %e, "Undecodable message, dropping");
                settle(delivery.ack().await, &message_id);
                return;
            }
        };

        let result = self.run_with_deadline(handler.as_ref(), &event, delivery.as_ref()).await;

        match result {
            Ok(()) => {
                debug!(
                    handler = handler.name(),
                    event_id = event.event_id(),
                    attempt,
                    "Event handled"
                );
                settle(delivery.ack().await, &message_id);
            }
            Err(e) if !e.kind().is_retryable() => {
                warn!(
                    handler = handler.name(),
                    event_id = event.event_id(),
                    error_kind = %e.kind(),
                    error = %e,
                    "Event rejected, dropping"
                );
                settle(delivery.ack().await, &message_id);
            }
            Err(e) => {
                let policy = self.policies.for_kind(kind);
                if policy.should_retry(attempt) {
                    let backoff = policy.backoff(attempt);
                    warn!(
                        handler = handler.name(),
                        event_id = event.event_id(),
                        attempt,
                        max_attempts = policy.max_attempts(),
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Event failed, scheduling redelivery"
                    );
                    settle(delivery.nack_after(backoff).await, &message_id);
                    return;
                }

                let retry = policy.metadata(attempt, delivery.first_attempt_at(), Utc::now());
                error!(
                    handler = handler.name(),
                    event_id = event.event_id(),
                    attempt,
                    error = %e,
                    "Event failed, retries exhausted"
                );
                if let Err(hook_err) = handler.on_exhausted(&event, &e, retry).await {
                    error!(
                        handler = handler.name(),
                        event_id = event.event_id(),
                        error = %hook_err,
                        "Exhaustion hook failed, leaving for redelivery"
                    );
                    return;
                }
                settle(delivery.ack().await, &message_id);
            }
        }
    }

    /// Run the handler, extending the ack deadline on a timer until it finishes.
    async fn run_with_deadline(
        &self,
        handler: &dyn EventHandler,
        event: &Event,
        delivery: &dyn Delivery,
    ) -> Result<(), PipelineError> {
        let handle = handler.handle(event);
        tokio::pin!(handle);

        let mut ticker = tokio::time::interval(self.config.extend_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut handle => return result,
                _ = ticker.tick() => {
                    if let Err(e) = delivery.extend_deadline(self.config.extend_by).await {
                        warn!(message_id = delivery.message_id(), error = %e, "Failed to extend ack deadline");
                    }
                }
            }
        }
    }
}

fn settle(result: Result<(), TransportError>, message_id: &str) {
    if let Err(e) = result {
        warn!(message_id, error = %e, "Failed to settle message");
    }
}
