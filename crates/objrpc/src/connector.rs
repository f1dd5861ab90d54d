//! Transport provider
//!
//! A [`Connector`] turns an endpoint into a [`Link`]: a message sink and a
//! message source. The pool only ever talks to links, so tests and
//! embedders can supply their own transports.

use crate::endpoint::{Endpoint, TransportKind};
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use objrpc_wire::{FrameSink, FrameSource, FrameTransport, UdpFrameTransport, DEFAULT_MAX_MESSAGE_SIZE};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;

/// An established transport to one endpoint
pub struct Link {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
    /// Connectionless: no validation handshake and no replies
    pub datagram: bool,
}

/// Establishes transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint, secure: bool) -> Result<Link>;
}

/// TCP and UDP over tokio sockets
#[derive(Debug, Clone)]
pub struct TcpConnector {
    max_message_size: usize,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, max_size: usize) -> Self {
        self.max_message_size = max_size;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn connect_failed(endpoint: &Endpoint, reason: impl ToString) -> RpcError {
    RpcError::ConnectFailed {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    }
}

async fn resolve(endpoint: &Endpoint) -> Result<SocketAddr> {
    tokio::net::lookup_host(endpoint.address())
        .await
        .map_err(|e| connect_failed(endpoint, e))?
        .next()
        .ok_or_else(|| connect_failed(endpoint, "host did not resolve"))
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint, secure: bool) -> Result<Link> {
        if secure && !endpoint.is_secure() {
            return Err(connect_failed(endpoint, "endpoint is not secure"));
        }

        match endpoint.kind {
            TransportKind::Tcp => {
                let addr = resolve(endpoint).await?;
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| connect_failed(endpoint, e))?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| connect_failed(endpoint, e))?;
                debug!("Connected to {} ({})", endpoint, addr);

                let (reader, writer) = stream.into_split();
                Ok(Link {
                    sink: Box::new(
                        FrameTransport::new(writer).with_max_message_size(self.max_message_size),
                    ),
                    source: Box::new(
                        FrameTransport::new(reader).with_max_message_size(self.max_message_size),
                    ),
                    datagram: false,
                })
            }
            TransportKind::Udp => {
                let addr = resolve(endpoint).await?;
                let sink = UdpFrameTransport::connect(addr)
                    .await
                    .map_err(|e| connect_failed(endpoint, e))?;
                let source = UdpFrameTransport::new(sink.socket().clone());
                debug!("Opened datagram socket to {} ({})", endpoint, addr);
                Ok(Link {
                    sink: Box::new(sink),
                    source: Box::new(source),
                    datagram: true,
                })
            }
            TransportKind::Ssl => Err(connect_failed(endpoint, "ssl transport is not available")),
        }
    }
}
