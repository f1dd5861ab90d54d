//! Connection Tests - Failures, Endpoint Selection and Indirect Proxies
//!
//! These tests exercise:
//! - Pending calls failing when the server goes away
//! - Falling back from an unreachable endpoint to the next one
//! - Endpoint selection by invocation mode and security
//! - Destroyed communicators
//! - Indirect proxies resolved through a locator

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;

use common::*;
use objrpc::{Communicator, Identity, RpcError, StaticLocator};

/// Port with nothing listening on it
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Test: deactivating the server fails the outstanding call, and later
/// calls cannot connect
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_shutdown_fails_pending_calls() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();
    let cl = MyClassPrx::unchecked_cast(
        &communicator.string_to_proxy(&server.reference("test")).unwrap(),
    );
    cl.ice_ping().await.unwrap();
    let connection = cl.ice_get_connection().await.unwrap();

    let pending = tokio::spawn({
        let cl = cl.clone();
        async move { cl.op_sleep(2000).await }
    });
    assert!(wait_until(Duration::from_secs(1), || connection.pending_count() == 1).await);

    server.adapter.deactivate();

    let err = pending.await.unwrap().unwrap_err();
    assert!(
        matches!(err, RpcError::ConnectionLost { .. }),
        "expected ConnectionLost, got {:?}",
        err
    );
    assert!(connection.is_closed());
    assert!(wait_until(Duration::from_secs(1), || communicator.connection_count() == 0).await);

    let err = cl.op_void().await.unwrap_err();
    assert!(
        matches!(err, RpcError::ConnectFailed { .. }),
        "expected ConnectFailed, got {:?}",
        err
    );
    assert_eq!(communicator.pool_stats().connections_closed, 1);

    server.communicator.destroy().await;
}

/// Test: an unreachable first endpoint is skipped
#[tokio::test]
async fn test_endpoint_fallback() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();
    let reference = format!(
        "test:tcp -h 127.0.0.1 -p {} -t 2000:tcp -h 127.0.0.1 -p {} -t 2000",
        dead_port().await,
        server.tcp.port
    );
    let cl = MyClassPrx::unchecked_cast(&communicator.string_to_proxy(&reference).unwrap());

    cl.op_void().await.unwrap();
    let connection = cl.ice_get_connection().await.unwrap();
    assert_eq!(connection.endpoint().port, server.tcp.port);

    let stats = communicator.pool_stats();
    assert_eq!(stats.connect_failures, 1);
    assert_eq!(stats.connections_created, 1);

    // Every endpoint unreachable: the last connect failure is reported
    let unreachable = communicator
        .string_to_proxy(&format!("test:tcp -h 127.0.0.1 -p {} -t 2000", dead_port().await))
        .unwrap();
    assert!(matches!(
        unreachable.ice_ping().await,
        Err(RpcError::ConnectFailed { .. })
    ));

    server.shutdown().await;
}

/// Test: endpoints are chosen by mode and security
#[tokio::test]
async fn test_no_suitable_endpoint() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();

    // Twoway needs a stream endpoint
    let udp_only = communicator
        .string_to_proxy(&format!("test:udp -h 127.0.0.1 -p {}", server.udp.port))
        .unwrap();
    assert!(matches!(udp_only.ice_ping().await, Err(RpcError::NoEndpoint(_))));
    udp_only.ice_datagram().ice_ping().await.unwrap();

    // Datagram needs a datagram endpoint
    let tcp_only = communicator
        .string_to_proxy(&server.reference("test"))
        .unwrap();
    assert!(matches!(
        tcp_only.ice_datagram().invoke("opVoid", Bytes::new()).await,
        Err(RpcError::NoEndpoint(_))
    ));

    // Secure proxies never use plain endpoints
    assert!(matches!(
        tcp_only.ice_secure(true).ice_ping().await,
        Err(RpcError::NoEndpoint(_))
    ));
    assert_eq!(communicator.connection_count(), 0);

    server.shutdown().await;
}

/// Test: a destroyed communicator refuses further work
#[tokio::test]
async fn test_destroyed_communicator() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();
    let cl = communicator.string_to_proxy(&server.reference("test")).unwrap();
    cl.ice_ping().await.unwrap();
    assert_eq!(communicator.connection_count(), 1);

    communicator.destroy().await;
    assert!(communicator.is_destroyed());
    assert_eq!(communicator.connection_count(), 0);

    assert!(matches!(cl.ice_ping().await, Err(RpcError::CommunicatorDestroyed)));
    assert!(matches!(
        communicator.string_to_proxy(&server.reference("test")),
        Err(RpcError::CommunicatorDestroyed)
    ));
    assert!(matches!(
        communicator.create_object_adapter("late"),
        Err(RpcError::CommunicatorDestroyed)
    ));

    // Destroying twice is harmless
    communicator.destroy().await;
    server.shutdown().await;
}

/// Test: indirect proxies resolve their adapter id through the locator
#[tokio::test]
async fn test_indirect_proxy() {
    init_logging();

    let server = TestServer::start_with_id(Some("TestAdapter")).await;

    let locator = Arc::new(StaticLocator::new());
    locator.register("TestAdapter", vec![server.tcp.clone()]);
    let communicator = Communicator::builder()
        .locator(locator.clone())
        .build()
        .unwrap();

    let indirect = communicator.string_to_proxy("test @ TestAdapter").unwrap();
    assert_eq!(indirect.ice_get_adapter_id(), Some("TestAdapter"));
    assert!(indirect.ice_get_endpoints().is_empty());

    let cl = MyClassPrx::checked_cast(&indirect).await.unwrap().unwrap();
    cl.op_void().await.unwrap();

    // The adapter hands out proxies in the same form
    let created = server.adapter.create_proxy(Identity::new("test"));
    assert_eq!(created.ice_get_adapter_id(), Some("TestAdapter"));
    assert_eq!(communicator.string_to_proxy(&created.ice_to_string()).unwrap(), indirect);

    let unknown = communicator.string_to_proxy("test @ Nowhere").unwrap();
    assert!(matches!(
        unknown.ice_ping().await,
        Err(RpcError::NotRegistered(id)) if id == "Nowhere"
    ));

    // Unregistering takes effect for new connections
    assert!(locator.unregister("TestAdapter"));
    let fresh = client();
    fresh.set_locator(Some(locator));
    assert!(matches!(
        fresh.string_to_proxy("test @ TestAdapter").unwrap().ice_ping().await,
        Err(RpcError::NotRegistered(_))
    ));

    // Direct endpoints on the same adapter still work
    let direct = communicator
        .string_to_proxy(&server.reference("test"))
        .unwrap();
    direct.ice_ping().await.unwrap();

    server.shutdown().await;
}
