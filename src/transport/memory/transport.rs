// src/transport/memory/transport.rs

//! In-memory transport implementation.
//!
//! This file contains the concrete implementation of the domain-level
//! `Transport` trait using in-process data structures only.
//!
//! The memory transport is the **reference implementation** of transport
//! semantics: named queues with competing consumers, topic exchanges with
//! `*`/`#` pattern bindings, and per-queue prefetch enforced through a
//! semaphore whose permits are released on acknowledgment. The AMQP
//! transport is expected to approximate this behavior as closely as the
//! broker allows.
//!
//! ## Semantics
//!
//! - Subscriptions are registered immediately; once `subscribe()` returns,
//!   subsequent matching publishes are deliverable.
//! - Each queue delivers a message to exactly one consumer (round-robin
//!   when several consume the same queue).
//! - At most `prefetch` deliveries per queue are unacknowledged at any
//!   moment; an unacked delivery holds its slot until acked or dropped.
//! - Publishing to a queue nobody declared is silently dropped, matching
//!   unroutable default-exchange publishes.
//!
//! ## Non-Goals
//!
//! - Persistence or durability (the `durable`/`persistent` flags are
//!   accepted and ignored)
//! - Network behavior or failure simulation

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};

use crate::{
    // ---
    log_debug,
    topic_matches,
    Acknowledger,
    Delivery,
    Envelope,
    Error,
    PublishOptions,
    Result,
    SubscribeOptions,
    Subscription,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

/// Prefetch applied when a subscription does not set its own, mirroring
/// the channel-level default a connected client configures.
const DEFAULT_PREFETCH: u16 = 10;

type ConsumerList = Arc<RwLock<Vec<mpsc::Sender<Delivery>>>>;

/// Per-queue state: an unbounded intake buffer feeding a pump task that
/// enforces prefetch and fans deliveries out to consumers.
struct QueueEntry {
    // ---
    input: mpsc::UnboundedSender<Envelope>,
    consumers: ConsumerList,
    permits: Arc<Semaphore>,
}

/// Acknowledger backed by an owned semaphore permit; acking (or dropping
/// the delivery) releases the queue's prefetch slot.
struct PermitAcker {
    permit: StdMutex<Option<OwnedSemaphorePermit>>,
}

#[async_trait::async_trait]
impl Acknowledger for PermitAcker {
    async fn ack(&self) -> Result<()> {
        // ---
        self.permit.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

struct MemoryTransport {
    // ---
    queues: RwLock<HashMap<String, QueueEntry>>,
    bindings: RwLock<Vec<(String, String, String)>>, // (exchange, pattern, queue)
    exchanges: RwLock<HashSet<String>>,
}

impl MemoryTransport {
    // ---
    /// Look up or create a queue entry, spawning its pump task on first
    /// declaration. The first subscriber's prefetch wins.
    async fn declare_queue(&self, name: &str, prefetch: u16) -> ConsumerList {
        // ---
        let mut queues = self.queues.write().await;

        if let Some(entry) = queues.get(name) {
            return entry.consumers.clone();
        }

        let (input, input_rx) = mpsc::unbounded_channel();
        let consumers: ConsumerList = Arc::new(RwLock::new(Vec::new()));

        // Prefetch 0 means unlimited, as it does on the broker.
        let slots = if prefetch == 0 {
            Semaphore::MAX_PERMITS
        } else {
            prefetch as usize
        };
        let permits = Arc::new(Semaphore::new(slots));

        tokio::spawn(run_queue_pump(
            name.to_string(),
            input_rx,
            permits.clone(),
            consumers.clone(),
        ));

        queues.insert(
            name.to_string(),
            QueueEntry {
                input,
                consumers: consumers.clone(),
                permits,
            },
        );

        consumers
    }

    async fn route_to_queue(&self, queue: &str, env: Envelope) {
        // ---
        let queues = self.queues.read().await;
        match queues.get(queue) {
            Some(entry) => {
                if entry.input.send(env).is_err() {
                    log_debug!("queue {queue} is shut down, message dropped");
                }
            }
            None => {
                log_debug!("no queue {queue} declared, message dropped");
            }
        }
    }
}

/// Pump task: pulls buffered envelopes, waits for a prefetch slot, and
/// hands the delivery to one live consumer (round-robin).
async fn run_queue_pump(
    queue: String,
    mut input: mpsc::UnboundedReceiver<Envelope>,
    permits: Arc<Semaphore>,
    consumers: ConsumerList,
) {
    // ---
    let mut next = 0usize;

    while let Some(env) = input.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            // Semaphore closed by transport shutdown.
            break;
        };

        let acker: Arc<dyn Acknowledger> = Arc::new(PermitAcker {
            permit: StdMutex::new(Some(permit)),
        });
        let mut delivery = Delivery::new(env, acker);

        let senders = consumers.read().await.clone();
        if senders.is_empty() {
            log_debug!("queue {queue} has no consumers, message dropped");
            continue;
        }

        // Try consumers starting at the round-robin cursor; a dead
        // consumer (dropped handle) hands the delivery to the next one.
        let mut delivered = false;
        for offset in 0..senders.len() {
            let idx = (next + offset) % senders.len();
            match senders[idx].send(delivery).await {
                Ok(()) => {
                    next = (idx + 1) % senders.len();
                    delivered = true;
                    break;
                }
                Err(mpsc::error::SendError(returned)) => {
                    delivery = returned;
                }
            }
        }

        if !delivered {
            log_debug!("all consumers of queue {queue} are gone, message dropped");
        }
    }

    log_debug!("queue pump stopped for {queue}");
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---

    async fn publish(&self, env: Envelope, opts: PublishOptions) -> Result<()> {
        // ---
        match opts.exchange {
            None => {
                // Default exchange: routing key names the queue.
                let queue = env.address.0.to_string();
                self.route_to_queue(&queue, env).await;
            }
            Some(exchange) => {
                let exchange = exchange.as_ref();
                if !self.exchanges.read().await.contains(exchange) {
                    return Err(Error::Transport(format!(
                        "memory: exchange {exchange} not declared"
                    )));
                }

                let routing_key = env.address.0.as_ref();
                let targets: HashSet<String> = self
                    .bindings
                    .read()
                    .await
                    .iter()
                    .filter(|(bound_exchange, pattern, _)| {
                        bound_exchange.as_str() == exchange && topic_matches(pattern, routing_key)
                    })
                    .map(|(_, _, queue)| queue.clone())
                    .collect();

                for queue in targets {
                    self.route_to_queue(&queue, env.clone()).await;
                }
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        sub: Subscription,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        // ---
        let queue = sub.0.to_string();
        let prefetch = opts.prefetch.unwrap_or(DEFAULT_PREFETCH);

        let consumers = self.declare_queue(&queue, prefetch).await;

        let (tx, rx) = mpsc::channel(16);
        consumers.write().await.push(tx);

        if !opts.bindings.is_empty() {
            let mut exchanges = self.exchanges.write().await;
            let mut bindings = self.bindings.write().await;
            for binding in &opts.bindings {
                exchanges.insert(binding.exchange.to_string());
                let record = (
                    binding.exchange.to_string(),
                    binding.pattern.to_string(),
                    queue.clone(),
                );
                if !bindings.contains(&record) {
                    bindings.push(record);
                }
            }
        }

        Ok(SubscriptionHandle { inbox: rx })
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        // ---
        self.exchanges.write().await.insert(name.to_string());
        Ok(())
    }

    /// Close the transport: drops every queue so pump tasks wind down and
    /// consumer inboxes observe end-of-stream.
    async fn close(&self) -> Result<()> {
        // ---
        let mut queues = self.queues.write().await;
        for entry in queues.values() {
            entry.permits.close();
        }
        queues.clear();

        self.bindings.write().await.clear();
        self.exchanges.write().await.clear();
        Ok(())
    }
}

/// Create a new in-memory transport.
///
/// This transport is always available and requires no external resources.
/// Sharing one instance between several clients simulates a broker those
/// clients all connect to.
pub async fn create_memory_transport() -> Result<TransportPtr> {
    // ---
    let transport = MemoryTransport {
        // ---
        queues: RwLock::new(HashMap::new()),
        bindings: RwLock::new(Vec::new()),
        exchanges: RwLock::new(HashSet::new()),
    };

    Ok(Arc::new(transport))
}
