//! Publish/subscribe over real connections: fan-out, idempotent close,
//! and dead-subscriber removal.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use vector_rpc::pubsub::{SubscriptionOptions, SubscriptionService};
use vector_rpc::{Endpoint, RpcServer, ServerConfig};

async fn publisher_server() -> (RpcServer, u16) {
    let config = ServerConfig {
        endpoints: vec![Endpoint::tcp("127.0.0.1", 0)],
        ..ServerConfig::default()
    };
    let server = RpcServer::new(config);
    server.start().await.unwrap();
    let addr = server.bound_addr(0).unwrap();
    let port = addr.rsplit(':').next().unwrap().parse().unwrap();
    (server, port)
}

#[tokio::test]
async fn test_fan_out_reaches_every_subscriber_in_order() {
    let (server, port) = publisher_server().await;
    let publisher = server.publishing_service().publisher("prices");

    let service = SubscriptionService::new();
    let endpoint = Endpoint::tcp("127.0.0.1", port);

    let received_a: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let received_b: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_a = Arc::clone(&received_a);
    let sink_b = Arc::clone(&received_b);

    let sub_a = service
        .create_subscription(
            endpoint.clone(),
            "prices",
            SubscriptionOptions::default(),
            move |payload| sink_a.lock().push(payload),
            || {},
        )
        .await
        .unwrap();
    let sub_b = service
        .create_subscription(
            endpoint,
            "prices",
            SubscriptionOptions::default(),
            move |payload| sink_b.lock().push(payload),
            || {},
        )
        .await
        .unwrap();
    assert_eq!(publisher.subscriber_count(), 2);
    assert_ne!(sub_a.connection_guid, sub_b.connection_guid);

    for i in 0..5u8 {
        publisher.publish(&[i, i, i]).await.unwrap();
    }

    // Delivery is asynchronous; wait for both sinks to drain.
    for _ in 0..100 {
        if received_a.lock().len() == 5 && received_b.lock().len() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let got_a = received_a.lock().clone();
    let got_b = received_b.lock().clone();
    // Order is preserved per subscriber.
    let want: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i, i, i]).collect();
    assert_eq!(got_a, want);
    assert_eq!(got_b, want);

    sub_a.close();
    sub_b.close();
    server.stop();
}

#[tokio::test]
async fn test_close_is_idempotent_and_unregisters() {
    let (server, port) = publisher_server().await;
    let publisher = server.publishing_service().publisher("topic");

    let service = SubscriptionService::new();
    let sub = service
        .create_subscription(
            Endpoint::tcp("127.0.0.1", port),
            "topic",
            SubscriptionOptions::default(),
            |_| {},
            || {},
        )
        .await
        .unwrap();
    assert_eq!(service.active_subscriptions().len(), 1);

    sub.close();
    assert!(sub.is_closed());
    // Second close is a no-op.
    sub.close();
    assert!(service.active_subscriptions().is_empty());

    // The publisher notices the dead connection on its next publish.
    for _ in 0..50 {
        publisher.publish(b"x").await.unwrap();
        if publisher.subscriber_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(publisher.subscriber_count(), 0);
    server.stop();
}

#[tokio::test]
async fn test_subscription_to_unknown_topic_is_refused() {
    let (server, port) = publisher_server().await;
    // No publisher created for this topic.
    let service = SubscriptionService::new();
    let err = service
        .create_subscription(
            Endpoint::tcp("127.0.0.1", port),
            "nobody-publishes-this",
            SubscriptionOptions::default(),
            |_| {},
            || {},
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, vector_rpc::ErrorCode::SubscriptionRefused);
    server.stop();
}

#[tokio::test]
async fn test_publisher_disconnect_fires_callback() {
    let (server, port) = publisher_server().await;
    let _publisher = server.publishing_service().publisher("t");

    let service = SubscriptionService::new();
    let disconnected = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&disconnected);
    let sub = service
        .create_subscription(
            Endpoint::tcp("127.0.0.1", port),
            "t",
            SubscriptionOptions::default(),
            |_| {},
            move || *flag.lock() = true,
        )
        .await
        .unwrap();

    // Closing the topic drops the server-side queue; the subscriber's
    // connection closes and the callback must fire.
    server.publishing_service().close_topic("t");
    for _ in 0..100 {
        if sub.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(sub.is_closed());
    assert!(*disconnected.lock());
    server.stop();
}

#[tokio::test]
async fn test_stale_pinger_is_reaped_within_deadline() {
    let (server, port) = publisher_server().await;
    let publisher = server.publishing_service().publisher("watched");

    let service = SubscriptionService::new();
    // Subscriber A pings; subscriber B declares pings, then goes silent
    // (its process would have been killed).
    let sub_a = service
        .create_subscription(
            Endpoint::tcp("127.0.0.1", port),
            "watched",
            SubscriptionOptions {
                ping_interval_ms: 200,
                ..SubscriptionOptions::default()
            },
            |_| {},
            || {},
        )
        .await
        .unwrap();
    // Subscriber B declares a ping interval during the OOB exchange but
    // never actually pings: the connection stays open while the process
    // behind it is effectively frozen.
    let mut frozen = vector_rpc::ClientStub::new(Endpoint::tcp("127.0.0.1", port)).unwrap();
    let response = frozen
        .send_oob(vector_rpc::wire::OobRequest::RequestSubscription {
            runtime_version: frozen.runtime_version(),
            topic: "watched".into(),
            sub_ping_interval_ms: 200,
        })
        .await
        .unwrap();
    assert_eq!(response.error_code, 0);
    assert_eq!(publisher.subscriber_count(), 2);

    // Within 2×interval + 5 s the reaper must drop B and keep A.
    tokio::time::sleep(Duration::from_millis(2 * 200 + 5_200)).await;
    publisher.drop_idle_transports();
    assert_eq!(publisher.subscriber_count(), 1);

    sub_a.close();
    drop(frozen);
    server.stop();
}
