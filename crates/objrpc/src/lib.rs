//! Object RPC: proxies, references and the invocation core
//!
//! This crate lets a client call operations on remote objects through
//! proxies. It sits on top of `objrpc-wire`, which owns the message
//! format and transports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Communicator        config, pool, locator, adapters        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ObjectPrx / typed proxies     checked & unchecked casts    │
//! │  Reference           identity, facet, mode, endpoints       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Invocation engine   collocated ─► ObjectAdapter            │
//! │                      remote     ─► ConnectionPool           │
//! │  Connection          pending replies, batch queues          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Connector (tcp/udp)           objrpc-wire frames           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use objrpc::Communicator;
//!
//! #[tokio::main]
//! async fn main() -> objrpc::Result<()> {
//!     let communicator = Communicator::new()?;
//!     let proxy = communicator.string_to_proxy("test:tcp -h 127.0.0.1 -p 12010 -t 10000")?;
//!
//!     proxy.ice_ping().await?;
//!     let results = proxy.invoke("opString", Bytes::new()).await?;
//!     println!("{} result bytes", results.len());
//!
//!     communicator.destroy().await;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod batch;
pub mod communicator;
pub mod connection;
pub mod connector;
pub mod endpoint;
pub mod error;
mod invocation;
pub mod locator;
pub mod pool;
pub mod proxy;
pub mod reference;

pub use adapter::{
    AdapterStats, AdapterStatsSnapshot, Current, DispatchError, DispatchFuture, DispatchResult,
    ObjectAdapter, Servant, OBJECT_TYPE_ID,
};
pub use batch::{BatchMode, BatchState};
pub use communicator::{Communicator, CommunicatorBuilder, CommunicatorConfig};
pub use connection::Connection;
pub use connector::{Connector, Link, TcpConnector};
pub use endpoint::{Endpoint, TransportKind};
pub use error::{Result, RpcError, UserException};
pub use locator::{Locator, StaticLocator};
pub use pool::{ConnectionKey, ConnectionPool, PoolStats, PoolStatsSnapshot};
pub use proxy::{
    checked_cast, checked_cast_facet, checked_cast_with_context, unchecked_cast, AsyncResult,
    ObjectPrx, TypedProxy,
};
pub use reference::Reference;

pub use objrpc_wire::{Context, Identity, InvocationMode};
