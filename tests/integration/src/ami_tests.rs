//! AMI Tests - Asynchronous Invocations
//!
//! These tests exercise:
//! - begin_invoke handles awaited as futures
//! - Completion callbacks
//! - The blocking call path from a plain thread
//! - Cancelling an outstanding call
//! - Out-of-order completion of concurrent asynchronous calls

mod common;

use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::oneshot;

use common::*;
use objrpc::RpcError;
use objrpc_wire::encoding::get_string;

/// Test: begin_invoke results are awaited like any future
#[tokio::test]
async fn test_begin_invoke() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();
    let cl = communicator.string_to_proxy(&server.reference("test")).unwrap();

    let pending = cl.begin_invoke("opString", encode_strings(&["a", "b"]));
    assert_eq!(pending.operation(), "opString");
    let mut results = pending.await.unwrap();
    assert_eq!(get_string(&mut results).unwrap(), "a b");
    assert_eq!(get_string(&mut results).unwrap(), "b a");

    let failed = cl.begin_invoke("opUserException", Bytes::new()).await;
    assert!(failed.unwrap_err().user_exception().is_some());

    server.shutdown().await;
}

/// Test: the callback sees the outcome of the call
#[tokio::test]
async fn test_invoke_with_callback() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();
    let cl = communicator.string_to_proxy(&server.reference("test")).unwrap();

    let (tx, rx) = oneshot::channel();
    let handle = cl.invoke_with_callback("opString", encode_strings(&["x", "y"]), move |result| {
        let _ = tx.send(result);
    });

    let mut results = rx.await.unwrap().unwrap();
    assert_eq!(get_string(&mut results).unwrap(), "x y");
    handle.await.unwrap();

    let (tx, rx) = oneshot::channel();
    cl.invoke_with_callback("opNothing", Bytes::new(), move |result| {
        let _ = tx.send(result);
    });
    assert!(matches!(
        rx.await.unwrap(),
        Err(RpcError::OperationNotExist { .. })
    ));

    server.shutdown().await;
}

/// Test: invoke_blocking from a thread outside the runtime
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invoke_blocking() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();
    let cl = communicator.string_to_proxy(&server.reference("test")).unwrap();

    let outcome = tokio::task::spawn_blocking(move || {
        let mut results = cl.invoke_blocking("opString", encode_strings(&["sync", "call"]))?;
        let r = get_string(&mut results).map_err(|e| RpcError::Protocol(e.to_string()))?;
        cl.invoke_blocking("opVoid", Bytes::new())?;
        Ok::<_, RpcError>(r)
    })
    .await
    .unwrap();

    assert_eq!(outcome.unwrap(), "sync call");
    server.shutdown().await;
}

/// Test: a cancelled call completes with an error naming the operation
#[tokio::test]
async fn test_cancel() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();
    let cl = communicator.string_to_proxy(&server.reference("test")).unwrap();
    cl.ice_ping().await.unwrap();

    let pending = cl.begin_invoke("opSleep", encode_i32(1000));
    assert!(!pending.is_completed());
    pending.cancel();

    match pending.await {
        Err(RpcError::Unknown(reason)) => assert!(reason.contains("opSleep")),
        other => panic!("expected cancellation, got {:?}", other),
    }

    // The connection is unaffected
    cl.invoke("opVoid", Bytes::new()).await.unwrap();
    server.shutdown().await;
}

/// Test: a short call started after a long one finishes first
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_out_of_order_completion() {
    init_logging();

    let server = TestServer::start().await;
    let communicator = client();
    let cl = communicator.string_to_proxy(&server.reference("test")).unwrap();
    cl.ice_ping().await.unwrap();

    let slow = cl.begin_invoke("opSleep", encode_i32(500));
    let fast = cl.begin_invoke("opSleep", encode_i32(10));

    fast.await.unwrap();
    assert!(!slow.is_completed());
    slow.await.unwrap();

    let calls: Vec<_> = (0..20)
        .map(|i| {
            let a = format!("{}", i);
            cl.begin_invoke("opString", encode_strings(&[a.as_str(), "n"]))
        })
        .collect();
    for (i, result) in join_all(calls).await.into_iter().enumerate() {
        let mut results = result.unwrap();
        assert_eq!(get_string(&mut results).unwrap(), format!("{} n", i));
    }

    assert!(wait_until(Duration::from_secs(1), || communicator.connection_count() == 1).await);
    server.shutdown().await;
}
