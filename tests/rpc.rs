//! RPC request/reply integration tests over a shared in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use taskbus::{
    //
    create_memory_transport,
    Address,
    ClientConfig,
    CommandRequest,
    CommandResponse,
    Envelope,
    Error,
    JsonMap,
    MessagingClient,
    MessagingClientBuilder,
    PublishOptions,
    Transport,
    TransportPtr,
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

#[tokio::test]
async fn test_call_round_trip() {
    // ---
    let broker = create_memory_transport().await.unwrap();

    let service = connected_client("users", broker.clone()).await;
    service
        .consume(
            "users.commands",
            |request: CommandRequest| async move {
                assert_eq!(request.command, "get_user");
                assert_eq!(request.data["id"], json!(42));
                Ok(object(json!({"id": 42, "username": "alice"})))
            },
            10,
        )
        .await
        .unwrap();

    let gateway = connected_client("gateway", broker.clone()).await;
    gateway.setup_rpc_client().await.unwrap();

    let response = gateway
        .call_with_timeout(
            "users.commands",
            CommandRequest::new("get_user", object(json!({"id": 42}))),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.data.unwrap()["username"], json!("alice"));
    assert!(response.error.is_none());
    assert_eq!(gateway.pending_calls(), 0);

    gateway.close().await;
    service.close().await;
}

#[tokio::test]
async fn test_concurrent_calls_resolve_by_correlation() {
    // ---
    let broker = create_memory_transport().await.unwrap();

    let service = connected_client("math", broker.clone()).await;
    service
        .consume(
            "math.commands",
            |request: CommandRequest| async move {
                let value = request.data["value"].as_i64().unwrap();
                // Later requests answer sooner, so replies arrive out of
                // order and only correlation ids can match them up.
                tokio::time::sleep(Duration::from_millis(100 - (value as u64) * 10)).await;
                Ok(object(json!({"doubled": value * 2})))
            },
            10,
        )
        .await
        .unwrap();

    let gateway = connected_client("gateway", broker.clone()).await;
    gateway.setup_rpc_client().await.unwrap();

    let mut handles = Vec::new();

    for value in 0..10i64 {
        // ---
        let client = gateway.clone();

        handles.push(tokio::spawn(async move {
            let response = client
                .call_with_timeout(
                    "math.commands",
                    CommandRequest::new("double", object(json!({"value": value}))),
                    Duration::from_secs(5),
                )
                .await
                .unwrap();
            (value, response)
        }));
    }

    for handle in handles {
        let (value, response) = handle.await.unwrap();
        assert!(response.success);
        assert_eq!(response.data.unwrap()["doubled"], json!(value * 2));
    }

    assert_eq!(gateway.pending_calls(), 0);
    gateway.close().await;
    service.close().await;
}

#[tokio::test]
async fn test_timeout_cleans_pending_table() {
    // ---
    let broker = create_memory_transport().await.unwrap();

    let gateway = connected_client("gateway", broker).await;
    gateway.setup_rpc_client().await.unwrap();

    // Nobody consumes this queue, so no reply ever arrives.
    for _ in 0..5 {
        let err = gateway
            .call_with_timeout(
                "tasks.commands",
                CommandRequest::new("ping", JsonMap::new()),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    // No leaked entries after the timeouts.
    assert_eq!(gateway.pending_calls(), 0);
    gateway.close().await;
}

#[tokio::test]
async fn test_unmatched_reply_dropped() {
    // ---
    let broker = create_memory_transport().await.unwrap();

    let service = connected_client("tags", broker.clone()).await;
    service
        .consume(
            "tags.commands",
            |_request: CommandRequest| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(object(json!({"ok": true})))
            },
            10,
        )
        .await
        .unwrap();

    let gateway = connected_client("gateway", broker.clone()).await;
    gateway.setup_rpc_client().await.unwrap();

    let first = {
        let client = gateway.clone();
        tokio::spawn(async move {
            client
                .call_with_timeout(
                    "tags.commands",
                    CommandRequest::new("list_tags", JsonMap::new()),
                    Duration::from_secs(5),
                )
                .await
        })
    };
    let second = {
        let client = gateway.clone();
        tokio::spawn(async move {
            client
                .call_with_timeout(
                    "tags.commands",
                    CommandRequest::new("list_tags", JsonMap::new()),
                    Duration::from_secs(5),
                )
                .await
        })
    };

    // Let both calls register, then inject a reply nobody asked for.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let reply_queue = gateway.reply_queue().unwrap();
    let stray = Envelope::response(
        Address::from(reply_queue),
        CommandResponse::ok(JsonMap::new()).encode().unwrap(),
        Some(Arc::from("no-such-correlation-id")),
    );
    broker.publish(stray, PublishOptions::direct()).await.unwrap();

    // Both real calls still resolve correctly.
    assert!(first.await.unwrap().unwrap().success);
    assert!(second.await.unwrap().unwrap().success);
    assert_eq!(gateway.pending_calls(), 0);

    gateway.close().await;
    service.close().await;
}

#[tokio::test]
async fn test_handler_failure_becomes_structured_error_reply() {
    // ---
    let broker = create_memory_transport().await.unwrap();

    let service = connected_client("tasks", broker.clone()).await;

    // prefetch 1: if a failed message were never acked, the follow-up
    // call below could not be delivered at all.
    service
        .consume(
            "tasks.commands",
            |request: CommandRequest| async move {
                if request.command == "explode" {
                    Err(Error::handler("TaskNotFound", "task 7 missing"))
                } else {
                    Ok(object(json!({"ok": true})))
                }
            },
            1,
        )
        .await
        .unwrap();

    let gateway = connected_client("gateway", broker.clone()).await;
    gateway.setup_rpc_client().await.unwrap();

    let response = gateway
        .call_with_timeout(
            "tasks.commands",
            CommandRequest::new("explode", JsonMap::new()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    // The remote failure is a value, not an Err.
    assert!(!response.success);
    assert_eq!(response.error_kind.as_deref(), Some("TaskNotFound"));
    assert_eq!(response.error.as_deref(), Some("TaskNotFound: task 7 missing"));
    assert!(response.data.is_none());

    // The failed message was acknowledged: the queue keeps moving.
    let response = gateway
        .call_with_timeout(
            "tasks.commands",
            CommandRequest::new("noop", JsonMap::new()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert!(response.success);

    gateway.close().await;
    service.close().await;
}

#[tokio::test]
async fn test_call_before_setup_fails_fast() {
    // ---
    let broker = create_memory_transport().await.unwrap();
    let gateway = connected_client("gateway", broker).await;

    let err = gateway
        .call("users.commands", CommandRequest::new("get_user", JsonMap::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    gateway.close().await;
}

#[tokio::test]
async fn test_operations_require_connect() {
    // ---
    let client =
        MessagingClientBuilder::new(ClientConfig::new("amqp://unused", "gateway")).build();

    assert!(matches!(
        client.setup_rpc_client().await,
        Err(Error::Config(_))
    ));
    assert!(matches!(
        client
            .publish_event("task.created", JsonMap::new(), None)
            .await,
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn test_close_fails_outstanding_calls() {
    // ---
    let broker = create_memory_transport().await.unwrap();

    let service = connected_client("slow", broker.clone()).await;
    service
        .consume(
            "slow.commands",
            |_request: CommandRequest| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(JsonMap::new())
            },
            10,
        )
        .await
        .unwrap();

    let gateway = connected_client("gateway", broker.clone()).await;
    gateway.setup_rpc_client().await.unwrap();

    let call = {
        let client = gateway.clone();
        tokio::spawn(async move {
            client
                .call_with_timeout(
                    "slow.commands",
                    CommandRequest::new("wait", JsonMap::new()),
                    Duration::from_secs(10),
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    gateway.close().await;

    let outcome = call.await.unwrap();
    assert!(matches!(outcome, Err(Error::ConnectionLost)));

    service.close().await;
}
