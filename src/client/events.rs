//! Topic-routed domain events.
//!
//! Events flow through a durable topic exchange, independent of RPC
//! traffic. Publishers stamp the current time and publish persistently;
//! subscribers bind a durable queue to one or more routing-key patterns
//! (`*` one segment, `#` zero or more). Delivery is fire-and-forget:
//! handler failures are logged and the message is acknowledged anyway.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::{lock_ignore_poison, MessagingClient};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    Address,
    Delivery,
    Envelope,
    Error,
    EventMessage,
    JsonMap,
    PublishOptions,
    Result,
    SubscribeOptions,
    Subscription,
    SubscriptionHandle,
};

/// Default events exchange shared by the service fleet.
pub const DEFAULT_EVENTS_EXCHANGE: &str = "events";

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Type-erased async event handler.
type EventHandlerFn = Arc<dyn Fn(EventMessage) -> BoxFuture<Result<()>> + Send + Sync>;

impl MessagingClient {
    // ---
    /// Declare the durable topic exchange this client publishes events
    /// to. Must be called before [`publish_event`](Self::publish_event).
    pub async fn setup_event_publisher(&self, exchange_name: &str) -> Result<()> {
        // ---
        let transport = self.transport()?;

        transport.declare_exchange(exchange_name).await?;
        *lock_ignore_poison(&self.inner.events_exchange) = Some(Arc::from(exchange_name));

        log_info!(
            "[{}] event publisher ready (exchange={exchange_name})",
            self.service_name()
        );
        Ok(())
    }

    /// Publish a domain event.
    ///
    /// The event is stamped with the current time and published
    /// persistently (it survives a broker restart). The routing key
    /// defaults to `event_type` when none is given.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the client is not connected or
    /// `setup_event_publisher()` was never called.
    pub async fn publish_event(
        &self,
        event_type: &str,
        data: JsonMap,
        routing_key: Option<&str>,
    ) -> Result<()> {
        // ---
        let transport = self.transport()?;

        let exchange = lock_ignore_poison(&self.inner.events_exchange)
            .clone()
            .ok_or_else(|| {
                Error::Config(
                    "event publisher not set up; call setup_event_publisher() first".into(),
                )
            })?;

        let routing_key = routing_key.unwrap_or(event_type);
        let message = EventMessage::now(event_type, data);
        let envelope = Envelope::event(Address::from(routing_key), message.encode()?);

        transport
            .publish(envelope, PublishOptions::persistent(exchange))
            .await?;

        log_debug!(
            "[{}] published event {event_type} (routing_key={routing_key})",
            self.service_name()
        );
        Ok(())
    }

    /// Subscribe a durable queue to events matching the given patterns.
    ///
    /// Declares the topic exchange and the queue, binds every pattern,
    /// and consumes: each delivery is decoded and passed to the handler.
    /// Handler (and decode) failures are logged and the message is still
    /// acknowledged — events are never redelivered to a failing handler.
    pub async fn subscribe_events<F, Fut>(
        &self,
        queue: &str,
        binding_patterns: &[&str],
        handler: F,
        exchange_name: &str,
    ) -> Result<()>
    where
        F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        // ---
        let transport = self.transport()?;

        let handler: EventHandlerFn = Arc::new(move |event| {
            Box::pin(handler(event)) as BoxFuture<Result<()>>
        });

        transport.declare_exchange(exchange_name).await?;

        let handle = transport
            .subscribe(
                Subscription::from(queue),
                SubscribeOptions::bound(exchange_name, binding_patterns),
            )
            .await?;

        let task = tokio::spawn(run_event_subscriber(
            self.service_name().to_string(),
            queue.to_string(),
            handler,
            handle,
        ));

        lock_ignore_poison(&self.inner.tasks).push(task);

        log_info!(
            "[{}] subscribed to events {binding_patterns:?} (queue={queue})",
            self.service_name()
        );
        Ok(())
    }
}

/// Dispatcher: spawns one handler task per delivered event.
async fn run_event_subscriber(
    service_name: String,
    queue: String,
    handler: EventHandlerFn,
    mut handle: SubscriptionHandle,
) {
    // ---
    while let Some(delivery) = handle.inbox.recv().await {
        tokio::spawn(handle_event(
            service_name.clone(),
            handler.clone(),
            delivery,
        ));
    }

    log_debug!("[{service_name}] event subscriber stopped for {queue}");
}

async fn handle_event(service_name: String, handler: EventHandlerFn, delivery: Delivery) {
    // ---
    match EventMessage::decode(&delivery.envelope.payload) {
        Ok(event) => {
            log_debug!("[{service_name}] received event {}", event.event_type);
            if let Err(err) = handler(event).await {
                log_error!("[{service_name}] event handler failed: {err}");
            }
        }
        Err(err) => {
            log_error!("[{service_name}] failed to decode event: {err}");
        }
    }

    // Always acknowledge: failed events are not redelivered.
    if let Err(e) = delivery.ack().await {
        log_error!("[{service_name}] failed to ack event: {e}");
    }
}
