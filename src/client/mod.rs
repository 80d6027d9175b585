//! Messaging client facade.
//!
//! [`MessagingClient`] is the one client type every service and the
//! gateway construct at bootstrap: it owns the broker connection
//! lifecycle and exposes the three messaging patterns on top of it —
//! RPC calls ([`call`](MessagingClient::call)), command consumption
//! ([`consume`](MessagingClient::consume)), and domain events
//! ([`publish_event`](MessagingClient::publish_event) /
//! [`subscribe_events`](MessagingClient::subscribe_events)).
//!
//! The client is constructed explicitly and passed by handle into
//! whatever needs it; cloning is cheap (`Arc`-backed) and clones share
//! the same connection and state.
//!
//! # Lifecycle
//!
//! `Disconnected → Connecting → Connected → Closing → Closed`
//!
//! Messaging operations are valid only in `Connected` and fail with a
//! configuration error otherwise. `Closing`/`Closed` are terminal: a
//! closed client is never reconnected, construct a new one instead.

mod consumer;
mod events;
mod pending;
mod rpc;

pub use events::DEFAULT_EVENTS_EXCHANGE;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use crate::{
    // ---
    log_error,
    log_info,
    ClientConfig,
    Error,
    Result,
    TransportPtr,
};

use pending::PendingCalls;

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Mutex poisoning indicates that another task panicked while holding the
/// lock. The state protected here (lifecycle flag, pending-call map, task
/// handles) has no invariants spanning multiple fields; the worst outcome
/// of continuing is a dropped or unmatched reply. This also avoids
/// propagating non-`Send` poison errors across async boundaries.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    // ---
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// RPC sub-state: set once by `setup_rpc_client()`.
struct RpcState {
    // ---
    reply_queue: Arc<str>,
    listener: JoinHandle<()>,
}

/// Broker messaging client.
///
/// Cheap to clone (internally `Arc`-backed); clones share the connection,
/// state machine, and pending-call table.
pub struct MessagingClient {
    inner: Arc<Inner>,
}

impl Clone for MessagingClient {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner {
    // ---
    config: ClientConfig,

    /// Transport supplied by the builder, used instead of dialing the
    /// broker (memory-transport tests).
    injected_transport: Option<TransportPtr>,

    /// Live transport, set while connected.
    transport: Mutex<Option<TransportPtr>>,

    state: Mutex<ConnectionState>,

    /// Outstanding RPC calls keyed by correlation id.
    pending: Arc<PendingCalls>,

    /// Reply-queue state, set by `setup_rpc_client()`.
    rpc: Mutex<Option<RpcState>>,

    /// Events exchange, set by `setup_event_publisher()`.
    events_exchange: Mutex<Option<Arc<str>>>,

    /// Consumer and subscriber dispatcher tasks, aborted on close.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessagingClient {
    // ---
    /// Service name this client was configured with.
    pub fn service_name(&self) -> &str {
        &self.inner.config.service_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *lock_ignore_poison(&self.inner.state)
    }

    /// Establish the broker connection and shared channel.
    ///
    /// Valid only from the `Disconnected` state; a closed client cannot
    /// be reconnected.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when called from any state other than
    /// `Disconnected`, or `Error::Transport` when the broker is
    /// unreachable (the client returns to `Disconnected` in that case).
    pub async fn connect(&self) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.inner.state);
            match *state {
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                other => {
                    return Err(Error::Config(format!(
                        "cannot connect while {other}"
                    )));
                }
            }
        }

        match self.open_transport().await {
            Ok(transport) => {
                *lock_ignore_poison(&self.inner.transport) = Some(transport);
                *lock_ignore_poison(&self.inner.state) = ConnectionState::Connected;
                log_info!("[{}] connected to broker", self.service_name());
                Ok(())
            }
            Err(e) => {
                *lock_ignore_poison(&self.inner.state) = ConnectionState::Disconnected;
                log_error!("[{}] failed to connect to broker: {e}", self.service_name());
                Err(e)
            }
        }
    }

    async fn open_transport(&self) -> Result<TransportPtr> {
        // ---
        if let Some(transport) = &self.inner.injected_transport {
            return Ok(transport.clone());
        }

        #[cfg(feature = "transport_amqp")]
        {
            crate::transport::create_amqp_transport(&self.inner.config).await
        }

        #[cfg(not(feature = "transport_amqp"))]
        {
            Err(Error::Config(
                "no transport available: enable the transport_amqp feature or inject one".into(),
            ))
        }
    }

    /// Shut the client down.
    ///
    /// Safe to call in any state, including before `connect()` ever
    /// succeeded, and idempotent. Consumer tasks are stopped, callers
    /// still waiting on replies fail with a connection-lost error, and
    /// transport close errors are swallowed and logged. The client ends
    /// in the terminal `Closed` state.
    pub async fn close(&self) {
        // ---
        {
            let mut state = lock_ignore_poison(&self.inner.state);
            match *state {
                ConnectionState::Closing | ConnectionState::Closed => return,
                _ => *state = ConnectionState::Closing,
            }
        }

        // Stop the reply listener and dispatcher tasks before failing
        // pending calls, so no late resolution races the teardown.
        if let Some(rpc) = lock_ignore_poison(&self.inner.rpc).take() {
            rpc.listener.abort();
        }
        for task in lock_ignore_poison(&self.inner.tasks).drain(..) {
            task.abort();
        }

        self.inner.pending.fail_all();

        let transport = lock_ignore_poison(&self.inner.transport).take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                log_error!("[{}] error closing transport: {e}", self.service_name());
            }
        }

        *lock_ignore_poison(&self.inner.state) = ConnectionState::Closed;
        log_info!("[{}] disconnected from broker", self.service_name());
    }

    /// Transport handle, gated on the `Connected` state.
    pub(crate) fn transport(&self) -> Result<TransportPtr> {
        // ---
        let state = *lock_ignore_poison(&self.inner.state);
        if state != ConnectionState::Connected {
            return Err(Error::Config(format!(
                "client is {state}; call connect() first"
            )));
        }

        lock_ignore_poison(&self.inner.transport)
            .clone()
            .ok_or_else(|| Error::Config("client is not connected".into()))
    }
}

/// Builder for [`MessagingClient`].
///
/// By default the built client dials the broker URI from its config on
/// `connect()`; tests inject a shared memory transport instead.
pub struct MessagingClientBuilder {
    // ---
    config: ClientConfig,
    transport: Option<TransportPtr>,
}

impl MessagingClientBuilder {
    // ---
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
        }
    }

    /// Use an explicitly provided transport instead of dialing the
    /// configured broker URI.
    pub fn with_transport(mut self, transport: TransportPtr) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the client in the `Disconnected` state.
    pub fn build(self) -> MessagingClient {
        // ---
        MessagingClient {
            inner: Arc::new(Inner {
                config: self.config,
                injected_transport: self.transport,
                transport: Mutex::new(None),
                state: Mutex::new(ConnectionState::Disconnected),
                pending: Arc::new(PendingCalls::new()),
                rpc: Mutex::new(None),
                events_exchange: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}
