//! Command consumption with structured error replies.
//!
//! Each consumed queue gets a dispatcher task; every delivery spawns a
//! handler task, so distinct messages process concurrently up to the
//! queue's prefetch (the broker withholds further deliveries while that
//! many are unacknowledged). A message is acknowledged only after its
//! handler and any reply publish have completed — for every outcome.
//! There is no negative-acknowledgment path: a failed message is
//! answered with a structured error and consumed, not requeued.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::{lock_ignore_poison, MessagingClient};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    CommandRequest,
    CommandResponse,
    Delivery,
    Envelope,
    JsonMap,
    PublishOptions,
    Result,
    SubscribeOptions,
    Subscription,
    SubscriptionHandle,
    TransportPtr,
};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Type-erased async command handler.
type CommandHandlerFn = Arc<dyn Fn(CommandRequest) -> BoxFuture<Result<JsonMap>> + Send + Sync>;

impl MessagingClient {
    // ---
    /// Begin consuming commands from a durable queue.
    ///
    /// For each delivered message the handler is awaited to completion.
    /// If the message carries a `reply_to`, the handler's result — or a
    /// `{success: false, error, error_type}` envelope when it fails — is
    /// published back with the original correlation id. The message is
    /// acknowledged after that, regardless of outcome. A body that fails
    /// to decode is treated as a handler failure.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the client is not connected, and
    /// `Error::Transport` if the queue cannot be declared or consumed.
    pub async fn consume<F, Fut>(&self, queue: &str, handler: F, prefetch: u16) -> Result<()>
    where
        F: Fn(CommandRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonMap>> + Send + 'static,
    {
        // ---
        let transport = self.transport()?;

        let handler: CommandHandlerFn = Arc::new(move |request| {
            Box::pin(handler(request)) as BoxFuture<Result<JsonMap>>
        });

        let handle = transport
            .subscribe(
                Subscription::from(queue),
                SubscribeOptions::durable_queue(Some(prefetch)),
            )
            .await?;

        let task = tokio::spawn(run_command_consumer(
            self.service_name().to_string(),
            queue.to_string(),
            transport,
            handler,
            handle,
        ));

        lock_ignore_poison(&self.inner.tasks).push(task);

        log_info!(
            "[{}] consuming commands from {queue} (prefetch={prefetch})",
            self.service_name()
        );
        Ok(())
    }
}

/// Dispatcher: spawns one handler task per delivery.
async fn run_command_consumer(
    service_name: String,
    queue: String,
    transport: TransportPtr,
    handler: CommandHandlerFn,
    mut handle: SubscriptionHandle,
) {
    // ---
    while let Some(delivery) = handle.inbox.recv().await {
        tokio::spawn(handle_command(
            service_name.clone(),
            transport.clone(),
            handler.clone(),
            delivery,
        ));
    }

    log_debug!("[{service_name}] command consumer stopped for {queue}");
}

async fn handle_command(
    service_name: String,
    transport: TransportPtr,
    handler: CommandHandlerFn,
    delivery: Delivery,
) {
    // ---
    let correlation_id = delivery.envelope.correlation_id.clone();
    let reply_to = delivery.envelope.reply_to.clone();

    // A body that fails to decode is a handler failure: the caller still
    // receives a structured error reply.
    let outcome = match CommandRequest::decode(&delivery.envelope.payload) {
        Ok(request) => {
            log_debug!(
                "[{service_name}] handling command {} (correlation_id={correlation_id:?})",
                request.command
            );
            handler(request).await
        }
        Err(err) => Err(err),
    };

    let response = match outcome {
        Ok(data) => CommandResponse::ok(data),
        Err(err) => {
            log_error!("[{service_name}] command handler failed: {err}");
            CommandResponse::from_error(&err)
        }
    };

    if let Some(reply_to) = reply_to {
        match response.encode() {
            Ok(payload) => {
                let envelope = Envelope::response(reply_to, payload, correlation_id);
                if let Err(e) = transport.publish(envelope, PublishOptions::direct()).await {
                    log_error!("[{service_name}] failed to publish reply: {e}");
                }
            }
            Err(e) => {
                log_error!("[{service_name}] failed to encode reply: {e}");
            }
        }
    }

    // Always acknowledge: failed work is not requeued.
    if let Err(e) = delivery.ack().await {
        log_error!("[{service_name}] failed to ack command: {e}");
    }
}
