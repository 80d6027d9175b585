// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the domain-level transport interface used by the
//! client facade to exchange messages. It intentionally avoids any
//! reference to concrete protocols, brokers, or client libraries.
//!
//! The transport layer is responsible only for delivering opaque envelopes
//! to declared queues and exchanges. Higher-level semantics such as RPC
//! correlation, timeouts, or structured error replies are handled
//! elsewhere.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use crate::Result;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Content-type marker carried on every message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A transport address: a routing key, resolved against either the
/// default exchange (where it names a queue directly) or a topic
/// exchange (where bindings match it).
///
/// Addresses are immutable, cheap to clone, and safe to share across
/// threads.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Address(value.into())
    }
}

/// A queue to consume from, identified by name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(pub Arc<str>);

impl<T> From<T> for Subscription
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Subscription(value.into())
    }
}

/// An opaque message envelope.
///
/// An `Envelope` is the unit of transport between producers and consumers.
/// It carries a payload along with the metadata used by higher-level
/// layers for RPC correlation and reply routing. The transport does not
/// interpret the payload.
///
/// Invariants maintained by the constructors: a response's
/// `correlation_id` equals the request's, and `reply_to` is never set on
/// a response or an event.
#[derive(Clone, Debug)]
pub struct Envelope {
    // ---
    /// Routing key used by the transport for delivery.
    pub address: Address,

    /// Opaque payload bytes (a UTF-8 JSON document).
    pub payload: Bytes,

    /// Correlation identifier used to associate requests with responses.
    pub correlation_id: Option<Arc<str>>,

    /// Reply address; present only on requests that expect a reply.
    pub reply_to: Option<Address>,

    /// Content type marker, fixed to `application/json` by constructors.
    pub content_type: Option<Arc<str>>,
}

impl Envelope {
    // ---
    /// Create a command request envelope expecting a reply.
    pub fn request(
        address: Address,
        payload: Bytes,
        correlation_id: Arc<str>,
        reply_to: Address,
    ) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(Arc::from(CONTENT_TYPE_JSON)),
        }
    }

    /// Create a response envelope addressed to a request's `reply_to`.
    ///
    /// `correlation_id` is passed through from the request; a request
    /// that arrived without one produces a reply without one.
    pub fn response(address: Address, payload: Bytes, correlation_id: Option<Arc<str>>) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id,
            reply_to: None,
            content_type: Some(Arc::from(CONTENT_TYPE_JSON)),
        }
    }

    /// Create a fire-and-forget event envelope.
    pub fn event(address: Address, payload: Bytes) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id: None,
            reply_to: None,
            content_type: Some(Arc::from(CONTENT_TYPE_JSON)),
        }
    }
}

/// Publish-side delivery options.
#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    // ---
    /// Target exchange. `None` publishes through the default exchange,
    /// where the routing key addresses a queue directly.
    pub exchange: Option<Arc<str>>,

    /// Persistent delivery (survives a broker restart).
    pub persistent: bool,
}

impl PublishOptions {
    // ---
    /// Default-exchange publish with transient delivery (commands and
    /// responses).
    pub fn direct() -> Self {
        Self::default()
    }

    /// Topic-exchange publish with persistent delivery (events).
    pub fn persistent(exchange: impl Into<Arc<str>>) -> Self {
        Self {
            exchange: Some(exchange.into()),
            persistent: true,
        }
    }
}

/// One queue-to-exchange binding.
#[derive(Clone, Debug)]
pub struct Binding {
    pub exchange: Arc<str>,
    pub pattern: Arc<str>,
}

/// Subscribe-side queue options.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    // ---
    /// Queue survives a broker restart.
    pub durable: bool,

    /// Queue is restricted to this connection.
    pub exclusive: bool,

    /// Queue is deleted when its last consumer disconnects.
    pub auto_delete: bool,

    /// Per-subscription prefetch; `None` keeps the channel default.
    pub prefetch: Option<u16>,

    /// Topic-exchange bindings to establish for this queue.
    pub bindings: Vec<Binding>,
}

impl SubscribeOptions {
    // ---
    /// Durable, non-auto-delete queue for command consumption.
    pub fn durable_queue(prefetch: Option<u16>) -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            prefetch,
            bindings: Vec::new(),
        }
    }

    /// Exclusive, auto-delete queue for RPC replies.
    pub fn exclusive_reply() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
            prefetch: None,
            bindings: Vec::new(),
        }
    }

    /// Durable queue bound to a topic exchange with the given patterns.
    pub fn bound(exchange: impl Into<Arc<str>>, patterns: &[&str]) -> Self {
        // ---
        let exchange = exchange.into();
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            prefetch: None,
            bindings: patterns
                .iter()
                .map(|pattern| Binding {
                    exchange: exchange.clone(),
                    pattern: Arc::from(*pattern),
                })
                .collect(),
        }
    }
}

/// Manual acknowledgment seam.
///
/// Consumers acknowledge a delivery only after their handler (and any
/// reply publish) has completed; until then the delivery occupies one of
/// the queue's prefetch slots.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// A message handed to a consumer, acknowledged explicitly.
pub struct Delivery {
    // ---
    pub envelope: Envelope,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    // ---
    pub fn new(envelope: Envelope, acker: Arc<dyn Acknowledger>) -> Self {
        Self { envelope, acker }
    }

    /// Acknowledge the delivery, releasing its prefetch slot.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }
}

/// Handle returned from a successful subscription.
///
/// The subscription remains active until either the handle is dropped
/// (receiver channel closes) or the transport is closed.
pub struct SubscriptionHandle {
    // ---
    /// Receiver channel for deliveries on this queue.
    pub inbox: mpsc::Receiver<Delivery>,
}

/// Transport abstraction.
///
/// A `Transport` owns one logical broker connection and one multiplexed
/// channel, and provides delivery of message envelopes between queues and
/// exchanges. Stronger semantics (correlation, timeouts, error replies)
/// are provided by higher layers.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, messages published *after*
///   that point and routed to the queue are deliverable.
/// - At most `prefetch` deliveries per queue are outstanding
///   (unacknowledged) at any moment.
///
/// The in-memory transport serves as the reference implementation of
/// these semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Publish an envelope.
    ///
    /// With no exchange in `opts`, the envelope's address names the target
    /// queue (default-exchange delivery). With an exchange, the address is
    /// a routing key matched against queue bindings.
    async fn publish(&self, env: Envelope, opts: PublishOptions) -> Result<()>;

    /// Declare a queue (and any bindings in `opts`) and begin consuming it.
    async fn subscribe(&self, sub: Subscription, opts: SubscribeOptions)
        -> Result<SubscriptionHandle>;

    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`: `.clone()` is cheap, clones share the
/// same underlying connection, and the concrete transport type stays
/// hidden behind the domain interface.
pub type TransportPtr = Arc<dyn Transport>;
