//! Event publish/subscribe integration tests over a shared in-memory
//! broker, covering topic wildcard semantics and the always-ack policy.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use taskbus::{
    //
    create_memory_transport,
    ClientConfig,
    Error,
    EventMessage,
    JsonMap,
    MessagingClient,
    MessagingClientBuilder,
    TransportPtr,
    DEFAULT_EVENTS_EXCHANGE,
};

fn object(value: serde_json::Value) -> JsonMap {
    // ---
    value.as_object().expect("json object").clone()
}

async fn connected_client(service_name: &str, transport: TransportPtr) -> MessagingClient {
    // ---
    let client = MessagingClientBuilder::new(ClientConfig::new("amqp://unused", service_name))
        .with_transport(transport)
        .build();
    client.connect().await.expect("connect");
    client
}

/// Subscribe with a handler that forwards every event into a channel.
async fn subscribe_collector(
    client: &MessagingClient,
    queue: &str,
    patterns: &[&str],
) -> mpsc::UnboundedReceiver<EventMessage> {
    // ---
    let (tx, rx) = mpsc::unbounded_channel();

    client
        .subscribe_events(
            queue,
            patterns,
            move |event: EventMessage| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok(())
                }
            },
            DEFAULT_EVENTS_EXCHANGE,
        )
        .await
        .expect("subscribe");

    rx
}

#[tokio::test]
async fn test_event_fan_out_by_pattern() {
    // ---
    let broker = create_memory_transport().await.unwrap();

    let tasks_svc = connected_client("tasks-subscriber", broker.clone()).await;
    let users_svc = connected_client("users-subscriber", broker.clone()).await;

    let mut task_events = subscribe_collector(&tasks_svc, "tasks.events", &["task.*"]).await;
    let mut user_events = subscribe_collector(&users_svc, "users.events", &["user.*"]).await;

    let publisher = connected_client("tasks", broker.clone()).await;
    publisher
        .setup_event_publisher(DEFAULT_EVENTS_EXCHANGE)
        .await
        .unwrap();

    // No explicit routing key: the event type routes the message.
    publisher
        .publish_event("task.created", object(json!({"id": 7})), None)
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), task_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type, "task.created");
    assert_eq!(event.data["id"], json!(7));
    assert!(event.timestamp > 0.0);

    // The user.* subscriber never sees it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(user_events.try_recv().is_err());

    publisher.close().await;
    tasks_svc.close().await;
    users_svc.close().await;
}

#[tokio::test]
async fn test_hash_pattern_matches_deeper_keys() {
    // ---
    let broker = create_memory_transport().await.unwrap();

    let audit_svc = connected_client("audit", broker.clone()).await;
    let ui_svc = connected_client("ui", broker.clone()).await;

    let mut hash_events = subscribe_collector(&audit_svc, "audit.events", &["task.#"]).await;
    let mut star_events = subscribe_collector(&ui_svc, "ui.events", &["task.*"]).await;

    let publisher = connected_client("tasks", broker.clone()).await;
    publisher
        .setup_event_publisher(DEFAULT_EVENTS_EXCHANGE)
        .await
        .unwrap();

    publisher
        .publish_event("task.created", JsonMap::new(), None)
        .await
        .unwrap();
    publisher
        .publish_event("task.created.v2", JsonMap::new(), None)
        .await
        .unwrap();

    // `task.#` matches both keys. Handlers run as spawned tasks, so
    // collect both before asserting rather than relying on order.
    let mut received = vec![
        timeout(Duration::from_secs(2), hash_events.recv())
            .await
            .unwrap()
            .unwrap()
            .event_type,
        timeout(Duration::from_secs(2), hash_events.recv())
            .await
            .unwrap()
            .unwrap()
            .event_type,
    ];
    received.sort();
    assert_eq!(received, ["task.created", "task.created.v2"]);

    // `task.*` matches only the two-segment key.
    let only = timeout(Duration::from_secs(2), star_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(only.event_type, "task.created");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(star_events.try_recv().is_err());

    publisher.close().await;
    audit_svc.close().await;
    ui_svc.close().await;
}

#[tokio::test]
async fn test_explicit_routing_key_overrides_event_type() {
    // ---
    let broker = create_memory_transport().await.unwrap();

    let audit_svc = connected_client("audit", broker.clone()).await;
    let tasks_svc = connected_client("tasks-subscriber", broker.clone()).await;

    let mut audit_events = subscribe_collector(&audit_svc, "audit.events", &["audit.*"]).await;
    let mut task_events = subscribe_collector(&tasks_svc, "tasks.events", &["task.*"]).await;

    let publisher = connected_client("tasks", broker.clone()).await;
    publisher
        .setup_event_publisher(DEFAULT_EVENTS_EXCHANGE)
        .await
        .unwrap();

    publisher
        .publish_event("task.deleted", object(json!({"id": 3})), Some("audit.task"))
        .await
        .unwrap();

    // Routed by the explicit key, not the event type.
    let event = timeout(Duration::from_secs(2), audit_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type, "task.deleted");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(task_events.try_recv().is_err());

    publisher.close().await;
    audit_svc.close().await;
    tasks_svc.close().await;
}

#[tokio::test]
async fn test_publish_before_setup_fails() {
    // ---
    let broker = create_memory_transport().await.unwrap();
    let client = connected_client("tasks", broker).await;

    let err = client
        .publish_event("task.created", JsonMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    client.close().await;
}

#[tokio::test]
async fn test_failing_handler_still_acks() {
    // ---
    let broker = create_memory_transport().await.unwrap();

    let subscriber = connected_client("audit", broker.clone()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    subscriber
        .subscribe_events(
            "audit.events",
            &["task.*"],
            move |event: EventMessage| {
                let tx = tx.clone();
                async move {
                    if event.event_type == "task.broken" {
                        return Err(Error::handler("AuditError", "cannot record"));
                    }
                    let _ = tx.send(event.event_type);
                    Ok(())
                }
            },
            DEFAULT_EVENTS_EXCHANGE,
        )
        .await
        .unwrap();

    let publisher = connected_client("tasks", broker.clone()).await;
    publisher
        .setup_event_publisher(DEFAULT_EVENTS_EXCHANGE)
        .await
        .unwrap();

    // The first event fails in the handler; it is still acknowledged,
    // so the second one flows through.
    publisher
        .publish_event("task.broken", JsonMap::new(), None)
        .await
        .unwrap();
    publisher
        .publish_event("task.created", JsonMap::new(), None)
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, "task.created");

    publisher.close().await;
    subscriber.close().await;
}
