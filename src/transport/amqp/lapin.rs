//! AMQP transport implementation using `lapin`.
//!
//! This module provides an implementation of the `Transport` trait backed
//! by an AMQP broker connection. It follows an **actor-based concurrency
//! model** to safely integrate with the underlying AMQP client.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the AMQP connection and
//!   channel.
//! - The actor is responsible for:
//!   - publishing outbound messages,
//!   - declaring queues and exchanges and binding them,
//!   - starting consumers,
//!   - reconnecting after a dropped connection,
//!   - clean shutdown of the connection.
//! - All interaction with the AMQP client is serialized through this
//!   actor; no other task ever touches the connection directly.
//!
//! ## Wire mapping
//!
//! The message body is the envelope's JSON payload alone. Correlation id,
//! reply-to and content type ride in the AMQP message properties, and
//! persistent publishes set `delivery_mode=2`, so messages interoperate
//! with the existing service fleet.
//!
//! ## Reconnect behavior
//!
//! When a consumer stream ends because the connection dropped, the actor
//! reconnects with exponential backoff and **re-declares every recorded
//! subscription** (queue, bindings, prefetch, consumer). In-flight RPC
//! calls are not republished; their replies are lost and surface as
//! timeouts at the caller. Deliveries that were unacknowledged at the
//! time of the drop are redelivered by the broker.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    ExchangeKind,
};

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::retry::retry_with_backoff;
use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    Acknowledger,
    Address,
    ClientConfig,
    Delivery,
    Envelope,
    Error,
    PublishOptions,
    Result,
    RetryConfig,
    SubscribeOptions,
    Subscription,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        env: Envelope,
        opts: PublishOptions,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        queue: String,
        opts: SubscribeOptions,
        out: mpsc::Sender<Delivery>,
        resp: oneshot::Sender<Result<()>>,
    },
    DeclareExchange {
        name: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

enum ActorStep {
    //
    Cmd(Cmd),
    ConsumerLost(String),
    Closed,
}

/// AMQP transport handle.
///
/// Cheap to clone behind [`TransportPtr`]; all work happens in the actor.
pub struct AmqpTransport {
    // ---
    cmd_tx: mpsc::Sender<Cmd>,
}

impl AmqpTransport {
    // ---
    async fn send_cmd<T>(
        &self,
        cmd: Cmd,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        // ---
        self.cmd_tx.send(cmd).await.map_err(|e| {
            let msg = format!("actor command channel closed: {e}");
            Error::Transport(msg)
        })?;

        rx.await.map_err(|e| {
            let msg = format!("actor responder channel read failed: {e}");
            Error::Transport(msg)
        })?
    }
}

/// Acknowledger wrapping the broker delivery's acker.
struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait::async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        // ---
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| Error::Transport(format!("amqp: ack failed: {e}")))
    }
}

/// Everything needed to re-establish one subscription after a reconnect.
struct SubRecord {
    // ---
    opts: SubscribeOptions,
    out: mpsc::Sender<Delivery>,
    task: JoinHandle<()>,
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    service_name: String,
    uri: String,
    prefetch: u16,
    reconnect: RetryConfig,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    lost_tx: mpsc::UnboundedSender<String>,
    lost_rx: mpsc::UnboundedReceiver<String>,
    subscriptions: HashMap<String, SubRecord>,
    closing: bool,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("[{}] AMQP actor started", self.service_name);

        loop {
            match self.next_step().await {
                ActorStep::Cmd(cmd) => {
                    self.handle_cmd(cmd).await;
                }
                ActorStep::ConsumerLost(queue) => {
                    log_warn!(
                        "[{}] consumer stream for {queue} ended",
                        self.service_name
                    );
                    self.reconnect_and_resubscribe().await;
                }
                ActorStep::Closed => {
                    log_info!("[{}] AMQP actor shutting down", self.service_name);
                    break;
                }
            }
        }

        log_info!("[{}] AMQP actor stopped", self.service_name);
    }

    async fn next_step(&mut self) -> ActorStep {
        // ---
        tokio::select! {
            cmd = self.cmd_rx.recv() => match cmd {
                Some(cmd) => ActorStep::Cmd(cmd),
                None => ActorStep::Closed,
            },
            lost = self.lost_rx.recv() => match lost {
                Some(queue) => ActorStep::ConsumerLost(queue),
                None => ActorStep::Closed,
            },
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::Publish { env, opts, resp } => {
                let result = self.do_publish(env, opts).await;
                let _ = resp.send(result);
            }
            Cmd::Subscribe {
                queue,
                opts,
                out,
                resp,
            } => {
                let result = self.do_subscribe(queue, opts, out).await;
                let _ = resp.send(result);
            }
            Cmd::DeclareExchange { name, resp } => {
                let result = self.do_declare_exchange(&name).await;
                let _ = resp.send(result);
            }
            Cmd::Close { resp } => {
                self.do_close().await;
                let _ = resp.send(Ok(()));
            }
        }
    }

    async fn do_publish(&mut self, env: Envelope, opts: PublishOptions) -> Result<()> {
        // ---
        if !self.connection.status().connected() {
            // A pure publisher has no consumer stream to notice the drop.
            self.reconnect_and_resubscribe().await;
            if !self.connection.status().connected() {
                return Err(Error::ConnectionLost);
            }
        }

        let exchange = opts.exchange.as_deref().unwrap_or("");
        let routing_key = env.address.0.as_ref();

        let mut properties =
            BasicProperties::default().with_content_type(crate::CONTENT_TYPE_JSON.into());
        if let Some(correlation_id) = &env.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_ref().into());
        }
        if let Some(reply_to) = &env.reply_to {
            properties = properties.with_reply_to(reply_to.0.as_ref().into());
        }
        if opts.persistent {
            properties = properties.with_delivery_mode(2);
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &env.payload,
                properties,
            )
            .await
            .map_err(|e| Error::Transport(format!("amqp: publish failed: {e}")))?;

        log_debug!(
            "[{}] published to exchange={exchange:?} routing_key={routing_key}",
            self.service_name
        );
        Ok(())
    }

    async fn do_subscribe(
        &mut self,
        queue: String,
        opts: SubscribeOptions,
        out: mpsc::Sender<Delivery>,
    ) -> Result<()> {
        // ---
        if self.subscriptions.contains_key(&queue) {
            return Err(Error::Config(format!("queue {queue} is already consumed")));
        }

        let task = self.start_consumer(&queue, &opts, out.clone()).await?;
        self.subscriptions.insert(queue, SubRecord { opts, out, task });
        Ok(())
    }

    /// Declare the queue (and bindings), apply prefetch, and start a
    /// consumer task bridging broker deliveries into `out`.
    async fn start_consumer(
        &mut self,
        queue: &str,
        opts: &SubscribeOptions,
        out: mpsc::Sender<Delivery>,
    ) -> Result<JoinHandle<()>> {
        // ---
        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: opts.durable,
            exclusive: opts.exclusive,
            auto_delete: opts.auto_delete,
            nowait: false,
        };

        self.channel
            .queue_declare(queue, queue_opts, FieldTable::default())
            .await
            .map_err(|e| Error::Transport(format!("amqp: queue declare failed: {e}")))?;

        if let Some(prefetch) = opts.prefetch {
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| Error::Transport(format!("amqp: basic_qos failed: {e}")))?;
        }

        for binding in &opts.bindings {
            self.do_declare_exchange(&binding.exchange).await?;
            self.channel
                .queue_bind(
                    queue,
                    &binding.exchange,
                    &binding.pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| Error::Transport(format!("amqp: queue bind failed: {e}")))?;
        }

        let consumer = self
            .channel
            .basic_consume(
                queue,
                &format!("{}-{queue}", self.service_name),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Transport(format!("amqp: consume failed: {e}")))?;

        log_info!("[{}] consuming queue {queue}", self.service_name);

        Ok(tokio::spawn(run_consumer(
            self.service_name.clone(),
            queue.to_string(),
            consumer,
            out,
            self.lost_tx.clone(),
        )))
    }

    async fn do_declare_exchange(&mut self, name: &str) -> Result<()> {
        // ---
        let exchange_opts = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };

        self.channel
            .exchange_declare(name, ExchangeKind::Topic, exchange_opts, FieldTable::default())
            .await
            .map_err(|e| Error::Transport(format!("amqp: exchange declare failed: {e}")))
    }

    async fn do_close(&mut self) {
        // ---
        self.closing = true;

        for record in self.subscriptions.values() {
            record.task.abort();
        }
        self.subscriptions.clear();

        let _ = self.channel.close(200, "client shutdown").await;
        let _ = self.connection.close(200, "client shutdown").await;

        // Drain remaining commands, then exit via the Closed step.
        self.cmd_rx.close();
    }

    /// Re-establish the connection and every recorded subscription.
    ///
    /// On backoff exhaustion the transport gives up: subscription records
    /// are dropped, so consumer inboxes observe end-of-stream and
    /// higher layers fail their outstanding work.
    async fn reconnect_and_resubscribe(&mut self) {
        // ---
        if self.closing {
            return;
        }

        log_warn!("[{}] connection lost, reconnecting", self.service_name);

        for record in self.subscriptions.values() {
            record.task.abort();
        }

        let uri = self.uri.clone();
        let prefetch = self.prefetch;
        let service_name = self.service_name.clone();
        let reconnect = self.reconnect.clone();

        let outcome = retry_with_backoff(&reconnect, || {
            let uri = uri.clone();
            let service_name = service_name.clone();
            async move { open_channel(&uri, prefetch, &service_name).await }
        })
        .await;

        match outcome {
            Ok((connection, channel)) => {
                self.connection = connection;
                self.channel = channel;

                let queues: Vec<String> = self.subscriptions.keys().cloned().collect();
                for queue in queues {
                    let (opts, out) = match self.subscriptions.get(&queue) {
                        Some(record) => (record.opts.clone(), record.out.clone()),
                        None => continue,
                    };

                    match self.start_consumer(&queue, &opts, out).await {
                        Ok(task) => {
                            if let Some(record) = self.subscriptions.get_mut(&queue) {
                                record.task = task;
                            }
                        }
                        Err(e) => {
                            log_error!(
                                "[{}] failed to re-subscribe {queue}: {e}",
                                self.service_name
                            );
                            self.subscriptions.remove(&queue);
                        }
                    }
                }

                // Notifications queued by the aborted consumers are stale now.
                while self.lost_rx.try_recv().is_ok() {}

                log_info!("[{}] reconnected to AMQP broker", self.service_name);
            }
            Err(e) => {
                log_error!(
                    "[{}] reconnect failed, giving up: {e}",
                    self.service_name
                );
                self.subscriptions.clear();
            }
        }
    }
}

/// Consumer task: bridges one queue's broker deliveries into the
/// subscriber channel, mapping AMQP properties onto envelope fields.
async fn run_consumer(
    service_name: String,
    queue: String,
    mut consumer: lapin::Consumer,
    out: mpsc::Sender<Delivery>,
    lost_tx: mpsc::UnboundedSender<String>,
) {
    // ---
    use futures_lite::stream::StreamExt;

    let mut subscriber_gone = false;

    while let Some(delivery_result) = consumer.next().await {
        match delivery_result {
            Ok(delivery) => {
                let lapin::message::Delivery {
                    routing_key,
                    properties,
                    data,
                    acker,
                    ..
                } = delivery;

                let envelope = Envelope {
                    address: Address::from(routing_key.as_str()),
                    payload: Bytes::from(data),
                    correlation_id: properties
                        .correlation_id()
                        .clone()
                        .map(|s| Arc::<str>::from(s.as_str())),
                    reply_to: properties
                        .reply_to()
                        .clone()
                        .map(|s| Address::from(s.as_str())),
                    content_type: properties
                        .content_type()
                        .clone()
                        .map(|s| Arc::<str>::from(s.as_str())),
                };

                let acker: Arc<dyn Acknowledger> = Arc::new(AmqpAcker { acker });

                if out.send(Delivery::new(envelope, acker)).await.is_err() {
                    log_debug!("[{service_name}] subscriber for {queue} dropped, stopping consumer");
                    subscriber_gone = true;
                    break;
                }
            }
            Err(e) => {
                log_error!("[{service_name}] consumer error on {queue}: {e}");
                break;
            }
        }
    }

    if !subscriber_gone {
        // Stream ended underneath us: connection or channel dropped.
        let _ = lost_tx.send(queue);
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    async fn publish(&self, env: Envelope, opts: PublishOptions) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::Publish { env, opts, resp: tx }, rx).await
    }

    async fn subscribe(
        &self,
        sub: Subscription,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        // ---
        let queue = sub.0.as_ref().to_string();
        let (out, inbox) = mpsc::channel(16);

        let (tx, rx) = oneshot::channel();
        self.send_cmd(
            Cmd::Subscribe {
                queue,
                opts,
                out,
                resp: tx,
            },
            rx,
        )
        .await?;

        Ok(SubscriptionHandle { inbox })
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(
            Cmd::DeclareExchange {
                name: name.to_string(),
                resp: tx,
            },
            rx,
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Cmd::Close { resp: tx }).await;
        let _ = rx.await;
        Ok(())
    }
}

/// Creates a lapin-based AMQP transport from the given configuration.
///
/// The connection to the broker happens immediately; the channel-level
/// prefetch from `config` is applied before the transport is returned.
///
/// # Errors
///
/// Returns `Error::Transport` if the broker URI cannot be reached or the
/// channel cannot be created.
pub async fn create_amqp_transport(config: &ClientConfig) -> Result<TransportPtr> {
    // ---
    let (connection, channel) =
        open_channel(&config.broker_uri, config.prefetch, &config.service_name).await?;

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (lost_tx, lost_rx) = mpsc::unbounded_channel();

    let actor = Actor {
        service_name: config.service_name.clone(),
        uri: config.broker_uri.clone(),
        prefetch: config.prefetch,
        reconnect: config.reconnect.clone(),
        connection,
        channel,
        cmd_rx,
        lost_tx,
        lost_rx,
        subscriptions: HashMap::new(),
        closing: false,
    };

    tokio::spawn(actor.run());

    Ok(Arc::new(AmqpTransport { cmd_tx }))
}

/// Open a connection and channel, applying the channel-level prefetch.
async fn open_channel(uri: &str, prefetch: u16, service_name: &str) -> Result<(Connection, Channel)> {
    // ---
    log_info!("[{service_name}] connecting to AMQP broker");

    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("[{service_name}] {msg}");
            Error::Transport(msg)
        })?;

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("[{service_name}] {msg}");
        Error::Transport(msg)
    })?;

    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .map_err(|e| Error::Transport(format!("amqp: basic_qos failed: {e}")))?;

    log_info!("[{service_name}] connected to AMQP broker");

    Ok((connection, channel))
}
