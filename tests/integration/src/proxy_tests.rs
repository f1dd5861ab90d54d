//! Proxy Tests - References and Proxy Methods
//!
//! These tests exercise:
//! - Turning reference strings into proxies and back
//! - The ice_* mutators and their accessors
//! - Proxy equality
//! - Rejection of malformed references

mod common;

use std::time::Duration;

use common::*;
use objrpc::{Endpoint, Identity, RpcError, TransportKind};

/// Test: string_to_proxy and ice_communicator
#[tokio::test]
async fn test_string_to_proxy() {
    init_logging();

    let communicator = client();
    let base = communicator
        .string_to_proxy("test:default -p 12010 -t 10000")
        .unwrap();

    assert_eq!(base.ice_communicator(), communicator);
    assert_eq!(base.ice_get_identity(), &Identity::new("test"));
    assert_eq!(
        base.ice_get_endpoints(),
        &[Endpoint::tcp("127.0.0.1", 12010).with_timeout(Some(Duration::from_secs(10)))]
    );
    assert!(base.ice_is_twoway());
    assert!(!base.ice_is_secure());
    assert!(base.ice_is_collocation_optimized());

    // A proxy from another communicator belongs to that one
    let other = client();
    assert_ne!(base.ice_communicator(), other);
}

/// Test: every mutator returns a proxy with the setting applied
#[tokio::test]
async fn test_proxy_methods() {
    init_logging();

    let communicator = client();
    let base = communicator
        .string_to_proxy("test:default -p 12010 -t 10000")
        .unwrap();

    assert_eq!(
        base.ice_identity(Identity::parse("other").unwrap())
            .ice_get_identity()
            .to_string(),
        "other"
    );
    assert_eq!(base.ice_facet("facet").ice_get_facet(), "facet");
    assert_eq!(base.ice_adapter_id("id").ice_get_adapter_id(), Some("id"));
    assert!(base.ice_twoway().ice_is_twoway());
    assert!(base.ice_oneway().ice_is_oneway());
    assert!(base.ice_batch_oneway().ice_is_batch_oneway());
    assert!(base.ice_datagram().ice_is_datagram());
    assert!(base.ice_batch_datagram().ice_is_batch_datagram());
    assert!(base.ice_secure(true).ice_is_secure());
    assert!(!base.ice_secure(false).ice_is_secure());
    assert!(base
        .ice_collocation_optimized(true)
        .ice_is_collocation_optimized());
    assert!(!base
        .ice_collocation_optimized(false)
        .ice_is_collocation_optimized());

    // The original is untouched
    assert!(base.ice_is_twoway());
    assert_eq!(base.ice_get_facet(), "");
    assert_eq!(base.ice_get_adapter_id(), None);
}

/// Test: printed references parse back to an equal proxy
#[tokio::test]
async fn test_proxy_to_string_round_trip() {
    init_logging();

    let communicator = client();
    let references = [
        "test:tcp -h 127.0.0.1 -p 12010 -t 10000",
        "test -f facet -o:tcp -h 127.0.0.1 -p 12010",
        "cat/test -D:udp -h 127.0.0.1 -p 12011",
        "test @ TestAdapter",
        "test:tcp -h 127.0.0.1 -p 12010:udp -h 127.0.0.1 -p 12011",
        "test:tcp -h ::1 -p 12010",
    ];

    for text in references {
        let proxy = communicator.string_to_proxy(text).unwrap();
        let printed = proxy.ice_to_string();
        let reparsed = communicator.string_to_proxy(&printed).unwrap();
        assert_eq!(proxy, reparsed, "`{}` printed as `{}`", text, printed);
        assert_eq!(proxy.ice_get_mode(), reparsed.ice_get_mode());
        assert_eq!(proxy.ice_get_timeout(), reparsed.ice_get_timeout());
    }

    let ipv6 = communicator.string_to_proxy("test:tcp -h ::1 -p 12010").unwrap();
    assert_eq!(ipv6.ice_get_endpoints()[0].host, "::1");
    assert_eq!(ipv6.ice_get_endpoints()[0].kind, TransportKind::Tcp);
}

/// Test: equality follows identity, facet and addressing only
#[tokio::test]
async fn test_proxy_equality() {
    init_logging();

    let communicator = client();
    let base = communicator
        .string_to_proxy("test:tcp -h 127.0.0.1 -p 12010")
        .unwrap();

    assert_eq!(base, base.ice_oneway());
    assert_eq!(base, base.ice_timeout(Duration::from_millis(500)));
    assert_eq!(base, base.ice_secure(true));

    assert_ne!(base, base.ice_facet("facet"));
    assert_ne!(base, base.ice_identity(Identity::new("other")));
    assert_ne!(
        base,
        base.ice_endpoints(vec![Endpoint::tcp("127.0.0.1", 12011)])
    );
}

/// Test: malformed references are rejected with the offending token
#[tokio::test]
async fn test_malformed_references() {
    init_logging();

    let communicator = client();
    for text in [
        "",
        "test -x",
        "test:tcp -h 127.0.0.1",
        "test:bogus -p 1",
        "test:tcp -p 70000",
        "test -t 0:tcp -p 1",
        "test @",
    ] {
        match communicator.string_to_proxy(text) {
            Err(RpcError::MalformedReference { .. }) | Err(RpcError::MalformedEndpoint(_)) => {}
            other => panic!("`{}` gave {:?}", text, other),
        }
    }
}
