//! TCP server and client tests.

use eventhub::{
    Event, Hub, HubClient, HubConfig, HubDirectory, HubError, HubMode, HubServer,
    InMemoryStorage, RemoteSubscription, ServerConfig,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    id: u64,
}

impl Event for OrderCreated {
    fn event_type() -> &'static str {
        "OrderCreated"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Unrouted;

impl Event for Unrouted {}

struct TestServer {
    addr: SocketAddr,
    hub: Hub<OrderCreated>,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_server(mode: HubMode) -> TestServer {
    let shutdown = CancellationToken::new();
    let config = HubConfig::with_mode(mode)
        .retry_backoff(Duration::from_millis(10))
        .idle_poll_ceiling(Duration::from_millis(100));
    let directory = Arc::new(HubDirectory::new(config, shutdown.clone()));
    let hub: Hub<OrderCreated> = directory.create_hub(Arc::new(InMemoryStorage::new()));
    directory.initialize_all().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HubServer::new(directory, ServerConfig::with_addr(addr));
    tokio::spawn(async move {
        server
            .serve(listener, std::future::pending())
            .await
            .unwrap();
    });

    TestServer {
        addr,
        hub,
        shutdown,
    }
}

async fn wait_connected(hub: &Hub<OrderCreated>, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while hub.stats().connected != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscribers did not connect");
}

async fn next_order(sub: &mut RemoteSubscription<OrderCreated>) -> OrderCreated {
    tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("timed out waiting for event")
        .expect("stream ended")
        .expect("bad event")
}

#[tokio::test]
async fn test_broker_publish_reaches_remote_subscriber() {
    let server = start_server(HubMode::EVENT_PUBLISHER | HubMode::EVENT_BROKER).await;

    let mut sub = HubClient::subscribe::<OrderCreated, _>(server.addr, "A")
        .await
        .unwrap();
    wait_connected(&server.hub, 1).await;

    let mut client = HubClient::connect(server.addr).await.unwrap();
    client.publish(&OrderCreated { id: 1 }).await.unwrap();
    client.publish(&OrderCreated { id: 2 }).await.unwrap();

    // Each publish is routed on its own task, so arrival order may differ.
    let mut ids = vec![next_order(&mut sub).await.id, next_order(&mut sub).await.id];
    ids.sort();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
async fn test_publish_rejected_without_broker_mode() {
    let server = start_server(HubMode::EVENT_PUBLISHER).await;

    let mut client = HubClient::connect(server.addr).await.unwrap();
    let err = client.publish(&OrderCreated { id: 1 }).await.unwrap_err();
    assert!(matches!(err, HubError::PublishRejected(_)));

    // The connection stays usable after a rejection.
    let err = client.publish(&OrderCreated { id: 2 }).await.unwrap_err();
    assert!(matches!(err, HubError::PublishRejected(_)));
}

#[tokio::test]
async fn test_publish_unregistered_type_rejected() {
    let server = start_server(HubMode::EVENT_PUBLISHER | HubMode::EVENT_BROKER).await;

    let mut client = HubClient::connect(server.addr).await.unwrap();
    let err = client.publish(&Unrouted).await.unwrap_err();
    assert!(matches!(err, HubError::PublishRejected(ref m) if m.contains("no hub registered")));
}

#[tokio::test]
async fn test_subscribe_unregistered_type_gets_error() {
    let server = start_server(HubMode::EVENT_PUBLISHER).await;

    let mut sub = HubClient::subscribe::<Unrouted, _>(server.addr, "A")
        .await
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .unwrap();
    assert!(matches!(first, Some(Err(HubError::Transport(_)))));
}

#[tokio::test]
async fn test_client_disconnect_ends_subscriber_loop() {
    let server = start_server(HubMode::EVENT_PUBLISHER).await;

    let sub = HubClient::subscribe::<OrderCreated, _>(server.addr, "A")
        .await
        .unwrap();
    wait_connected(&server.hub, 1).await;

    drop(sub);
    wait_connected(&server.hub, 0).await;

    // Still known, so later events queue up for a reconnect.
    server
        .hub
        .broadcast(&OrderCreated { id: 5 }, CancellationToken::new())
        .await
        .unwrap();

    let mut sub = HubClient::subscribe::<OrderCreated, _>(server.addr, "A")
        .await
        .unwrap();
    assert_eq!(next_order(&mut sub).await.id, 5);
}
