use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::EventHandler;
use crate::error::TransportError;
use crate::messaging::TransportSubscriber;

/// Subscription name for a handler listening on a topic.
pub fn subscription_name(topic: &str, handler: &str) -> String {
    format!("{topic}.{handler}")
}

/// Lifecycle wrapper binding one handler to one subscription.
pub struct HandlerRunner {
    subscriber: TransportSubscriber,
    subscription: String,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
}

impl HandlerRunner {
    pub fn new(
        subscriber: TransportSubscriber,
        subscription: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            subscriber,
            subscription: subscription.into(),
            handler,
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.handler.name()
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Consume the subscription until [`stop`](Self::stop) is called or the
    /// transport fails.
    pub async fn start(&self) -> Result<(), TransportError> {
        info!(
            handler = self.handler.name(),
            kind = %self.handler.kind(),
            subscription = %self.subscription,
            "Starting handler"
        );
        self.subscriber
            .subscribe(&self.subscription, self.handler.clone(), self.cancel.clone())
            .await
    }

    /// Stop consuming. Safe to call more than once.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!(handler = self.handler.name(), "Stopping handler");
            self.cancel.cancel();
        }
    }
}
