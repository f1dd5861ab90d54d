//! Twoway Tests - Request/Reply Invocations
//!
//! These tests exercise:
//! - Twoway operations with results, user exceptions and missing operations
//! - Request contexts from the proxy and per call
//! - Per-call timeouts that leave the connection usable
//! - Timeouts and flags given in the reference string
//! - Many concurrent callers sharing one pooled connection

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::Barrier;
use tracing::info;

use common::*;
use objrpc::{Context, RpcError};
use objrpc_wire::encoding::get_string;

/// Test: the basic twoway operations on MyClass and MyDerivedClass
#[tokio::test]
async fn test_twoway_operations() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();
    let base = communicator.string_to_proxy(&server.reference("test")).unwrap();
    let cl = MyClassPrx::checked_cast(&base).await.unwrap().unwrap();
    let derived = MyDerivedClassPrx::checked_cast(&cl).await.unwrap().unwrap();

    cl.ice_ping().await.unwrap();
    cl.op_void().await.unwrap();
    derived.op_void().await.unwrap();
    derived.op_derived().await.unwrap();

    let (r, p3) = cl.op_string("hello", "world").await.unwrap();
    assert_eq!(r, "hello world");
    assert_eq!(p3, "world hello");

    match cl.op_user_exception().await {
        Err(RpcError::User(ex)) => {
            let mut payload = ex.payload.clone();
            assert_eq!(get_string(&mut payload).unwrap(), SOME_EXCEPTION);
        }
        other => panic!("expected user exception, got {:?}", other),
    }

    match base.invoke("opNothing", Bytes::new()).await {
        Err(RpcError::OperationNotExist {
            identity,
            operation,
            ..
        }) => {
            assert_eq!(identity.name, "test");
            assert_eq!(operation, "opNothing");
        }
        other => panic!("expected OperationNotExist, got {:?}", other),
    }

    // Every call above shared one connection
    assert_eq!(communicator.pool_stats().connections_created, 1);
    server.shutdown().await;
}

/// Test: the proxy context is sent with every request and a per-call
/// context replaces it
#[tokio::test]
async fn test_context_propagation() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();
    let cl = MyClassPrx::unchecked_cast(
        &communicator.string_to_proxy(&server.reference("test")).unwrap(),
    );

    assert!(cl.op_context().await.unwrap().is_empty());

    let proxy_context = Context::from([("proxy".to_string(), "yes".to_string())]);
    let with_context = MyClassPrx::unchecked_cast(&cl.ice_context(proxy_context.clone()));
    assert_eq!(with_context.op_context().await.unwrap(), proxy_context);

    let call_context = Context::from([("call".to_string(), "only".to_string())]);
    let mut results = with_context
        .invoke_with_context("opContext", Bytes::new(), &call_context)
        .await
        .unwrap();
    let seen = objrpc_wire::encoding::get_context(&mut results).unwrap();
    assert_eq!(seen, call_context);

    // The original proxy is unaffected
    assert!(cl.op_context().await.unwrap().is_empty());
    server.shutdown().await;
}

/// Test: a call slower than the proxy timeout fails with Timeout, and the
/// connection keeps serving later calls
#[tokio::test]
async fn test_timeout() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();
    let cl = MyClassPrx::checked_cast(
        &communicator.string_to_proxy(&server.reference("test")).unwrap(),
    )
    .await
    .unwrap()
    .unwrap();

    let cl_timeout = MyClassPrx::unchecked_cast(&cl.ice_timeout(Duration::from_millis(500)));
    let start = Instant::now();
    let err = cl_timeout.op_sleep(1000).await.unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {:?}", err);
    assert!(start.elapsed() < Duration::from_millis(900));

    let connection = cl.ice_get_connection().await.unwrap();
    assert!(!connection.is_closed());

    // Same connection, still usable; the late reply is discarded
    cl.op_void().await.unwrap();
    cl_timeout.op_sleep(10).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    cl.op_void().await.unwrap();

    let again = cl.ice_get_connection().await.unwrap();
    assert!(Arc::ptr_eq(&connection, &again));
    assert_eq!(connection.pending_count(), 0);
    assert_eq!(communicator.pool_stats().connections_created, 1);

    server.shutdown().await;
}

/// Test: the timeout written in the reference string bounds calls, and
/// flags after the endpoint list apply to the proxy
#[tokio::test]
async fn test_timeout_from_reference_string() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();
    let text = format!("test:tcp -h 127.0.0.1 -p {} -t 500", server.tcp.port);
    let cl = MyClassPrx::unchecked_cast(&communicator.string_to_proxy(&text).unwrap());
    assert_eq!(cl.ice_get_timeout(), Some(Duration::from_millis(500)));

    let start = Instant::now();
    let err = cl.op_sleep(1000).await.unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {:?}", err);
    assert!(start.elapsed() < Duration::from_millis(900));
    cl.op_sleep(10).await.unwrap();

    let oneway = communicator
        .string_to_proxy(&format!("{} -o", text))
        .unwrap();
    assert!(oneway.ice_is_oneway());
    assert_eq!(oneway, cl.ice_twoway());
    MyClassPrx::unchecked_cast(&oneway).op_byte_s_oneway(7).await.unwrap();

    let servant = server.servant.clone();
    assert!(wait_until(Duration::from_secs(5), || servant.oneways() == vec![7]).await);

    server.shutdown().await;
}

/// Test: replies complete independently of request order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replies_out_of_order() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();
    let cl = MyClassPrx::unchecked_cast(
        &communicator.string_to_proxy(&server.reference("test")).unwrap(),
    );
    cl.ice_ping().await.unwrap();

    let slow = tokio::spawn({
        let cl = cl.clone();
        async move {
            cl.op_sleep(500).await.unwrap();
            Instant::now()
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    cl.op_void().await.unwrap();
    let fast_done = Instant::now();
    let slow_done = slow.await.unwrap();
    assert!(fast_done < slow_done);

    server.shutdown().await;
}

/// Test: many concurrent first calls through fresh proxies share a
/// single connection
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_callers_share_connection() {
    init_logging();

    const NUM_CALLERS: usize = 50;
    const CALLS_PER_CALLER: usize = 20;

    let server = TestServer::start().await;
    let communicator = client();
    let reference = server.reference("test");
    let barrier = Arc::new(Barrier::new(NUM_CALLERS));

    let handles: Vec<_> = (0..NUM_CALLERS)
        .map(|caller| {
            let proxy = communicator.string_to_proxy(&reference).unwrap();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                let cl = MyClassPrx::unchecked_cast(&proxy);
                barrier.wait().await;
                for call in 0..CALLS_PER_CALLER {
                    let a = format!("caller_{}", caller);
                    let b = format!("call_{}", call);
                    let (r, p3) = cl.op_string(&a, &b).await.unwrap();
                    assert_eq!(r, format!("{} {}", a, b));
                    assert_eq!(p3, format!("{} {}", b, a));
                }
            })
        })
        .collect();

    let start = Instant::now();
    for result in join_all(handles).await {
        result.unwrap();
    }
    info!(
        "{} calls from {} callers in {:?}",
        NUM_CALLERS * CALLS_PER_CALLER,
        NUM_CALLERS,
        start.elapsed()
    );

    let stats = communicator.pool_stats();
    assert_eq!(stats.connections_created, 1);
    assert_eq!(stats.connect_failures, 0);
    assert_eq!(communicator.connection_count(), 1);
    assert_eq!(server.adapter.stats().snapshot().connections_accepted, 1);

    server.shutdown().await;
}
