//! RPC request/reply over an exclusive reply queue.
//!
//! # Architecture
//!
//! `setup_rpc_client()` declares one exclusive, auto-delete reply queue
//! unique to this client instance and spawns a listener task consuming
//! it. Each `call()` generates a fresh correlation id, registers a slot
//! in the pending-call table, and publishes its request with `reply_to`
//! set to the reply queue. The listener matches incoming replies against
//! the table by correlation id; arrival order is irrelevant, so any
//! number of calls may be in flight concurrently.
//!
//! Unmatched replies — late arrivals after a timeout, or ids this client
//! never issued — are logged and dropped without affecting other calls.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use uuid::Uuid;

use super::{lock_ignore_poison, MessagingClient, RpcState};
use crate::client::pending::PendingCalls;
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    Address,
    CommandRequest,
    CommandResponse,
    CorrelationId,
    Envelope,
    Error,
    PublishOptions,
    Result,
    SubscribeOptions,
    Subscription,
    SubscriptionHandle,
};

impl MessagingClient {
    // ---
    /// Declare this client's reply queue and start the reply listener.
    ///
    /// Must be called once, after [`connect`](Self::connect) and before
    /// any [`call`](Self::call).
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the client is not connected or the RPC
    /// client was already set up, and `Error::Transport` if the reply
    /// queue cannot be declared.
    pub async fn setup_rpc_client(&self) -> Result<()> {
        // ---
        let transport = self.transport()?;

        if lock_ignore_poison(&self.inner.rpc).is_some() {
            return Err(Error::Config("RPC client already set up".into()));
        }

        // Generated client-side so every transport shares the same
        // addressing; unique per client instance.
        let reply_queue: Arc<str> = Arc::from(format!(
            "{}.replies.{}",
            self.service_name(),
            Uuid::new_v4()
        ));

        let handle = transport
            .subscribe(
                Subscription::from(reply_queue.clone()),
                SubscribeOptions::exclusive_reply(),
            )
            .await?;

        let listener = tokio::spawn(run_reply_listener(
            self.service_name().to_string(),
            self.inner.pending.clone(),
            handle,
        ));

        *lock_ignore_poison(&self.inner.rpc) = Some(RpcState {
            reply_queue,
            listener,
        });

        log_info!("[{}] RPC client ready", self.service_name());
        Ok(())
    }

    /// Reply-queue name of this client, once set up.
    pub fn reply_queue(&self) -> Option<Arc<str>> {
        // ---
        lock_ignore_poison(&self.inner.rpc)
            .as_ref()
            .map(|rpc| rpc.reply_queue.clone())
    }

    /// Call a remote service using the configured default timeout.
    ///
    /// See [`call_with_timeout`](Self::call_with_timeout).
    pub async fn call(&self, queue: &str, request: CommandRequest) -> Result<CommandResponse> {
        // ---
        self.call_with_timeout(queue, request, self.inner.config.call_timeout)
            .await
    }

    /// Call a remote service and await its reply.
    ///
    /// Publishes the request to `queue` (default-exchange delivery) and
    /// resolves with the decoded reply. A remote handler failure is *not*
    /// an error here: it arrives as `CommandResponse { success: false, .. }`
    /// and the caller inspects `success`.
    ///
    /// Any number of calls may be outstanding concurrently from one
    /// client; each has its own correlation id, pending-call entry, and
    /// deadline.
    ///
    /// # Errors
    ///
    /// - `Error::Config` — not connected, or `setup_rpc_client()` was
    ///   never called
    /// - `Error::Timeout` — no reply within `timeout`; the pending entry
    ///   is removed and a late reply will be logged and dropped
    /// - `Error::Serialization` — the reply body failed to decode
    /// - `Error::ConnectionLost` — the connection was torn down while
    ///   the call was outstanding
    pub async fn call_with_timeout(
        &self,
        queue: &str,
        request: CommandRequest,
        timeout: Duration,
    ) -> Result<CommandResponse> {
        // ---
        let transport = self.transport()?;

        let reply_queue = self.reply_queue().ok_or_else(|| {
            Error::Config("RPC client not set up; call setup_rpc_client() first".into())
        })?;

        let payload = request.encode()?;
        let correlation_id = CorrelationId::generate();
        let rx = self.inner.pending.register(correlation_id.as_str());

        let envelope = Envelope::request(
            Address::from(queue),
            payload,
            Arc::from(correlation_id.as_str()),
            Address::from(reply_queue),
        );

        if let Err(e) = transport.publish(envelope, PublishOptions::direct()).await {
            self.inner.pending.remove(correlation_id.as_str());
            return Err(e);
        }

        log_debug!(
            "[{}] call to {queue} (correlation_id={correlation_id})",
            self.service_name()
        );

        match time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Slot dropped without resolution: the table was torn down.
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                self.inner.pending.remove(correlation_id.as_str());
                log_warn!(
                    "[{}] call to {queue} timed out (correlation_id={correlation_id})",
                    self.service_name()
                );
                Err(Error::Timeout)
            }
        }
    }

    /// Number of calls currently awaiting replies. Diagnostics only.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }
}

/// Reply listener: resolves pending calls from the reply queue.
async fn run_reply_listener(
    service_name: String,
    pending: Arc<PendingCalls>,
    mut handle: SubscriptionHandle,
) {
    // ---
    while let Some(delivery) = handle.inbox.recv().await {
        if let Err(e) = delivery.ack().await {
            log_warn!("[{service_name}] failed to ack reply: {e}");
        }

        let envelope = &delivery.envelope;

        let Some(correlation_id) = envelope.correlation_id.clone() else {
            log_warn!("[{service_name}] reply without correlation_id dropped");
            continue;
        };

        // A reply that fails to decode still resolves the call: the
        // caller gets the decode error instead of waiting out its
        // timeout.
        let outcome = CommandResponse::decode(&envelope.payload);

        if !pending.resolve(&correlation_id, outcome) {
            log_warn!("[{service_name}] unmatched reply dropped (correlation_id={correlation_id})");
        }
    }

    // The transport shut down underneath us; nobody will resolve these.
    log_debug!("[{service_name}] reply listener stopped");
    pending.fail_all();
}
