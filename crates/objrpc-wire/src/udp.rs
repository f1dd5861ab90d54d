//! Datagram transport
//!
//! Each UDP datagram carries exactly one complete message. Only requests
//! that expect no reply travel this way, so the message size is bounded
//! by the datagram payload limit.

use crate::error::{Result, WireError};
use crate::frame::MessageHeader;
use crate::transport::{FrameSink, FrameSource};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::{debug, trace};

/// Maximum theoretical UDP payload size
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// Datagram message transport
pub struct UdpFrameTransport {
    socket: Arc<UdpSocket>,
    max_message_size: usize,
    recv_buf: BytesMut,
}

impl UdpFrameTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self::with_max_size(socket, MAX_UDP_PAYLOAD)
    }

    pub fn with_max_size(socket: Arc<UdpSocket>, max_message_size: usize) -> Self {
        let max_size = max_message_size.min(MAX_UDP_PAYLOAD);
        Self {
            socket,
            max_message_size: max_size,
            recv_buf: BytesMut::with_capacity(max_size),
        }
    }

    /// Bind to a local address, e.g. `"127.0.0.1:0"`
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::new(Arc::new(socket)))
    }

    /// Bind an ephemeral local port and connect it to `addr`
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok(Self::new(Arc::new(socket)))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    fn check_size(&self, len: usize) -> Result<()> {
        if len > self.max_message_size {
            debug!(
                "Datagram of {} bytes exceeds the {} byte limit",
                len, self.max_message_size
            );
            return Err(WireError::MessageTooLarge {
                size: len,
                max: self.max_message_size,
            });
        }
        Ok(())
    }

    /// Send a message on the connected socket
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.check_size(data.len())?;
        self.socket.send(data).await?;
        trace!("Sent {} byte datagram", data.len());
        Ok(())
    }

    /// Receive one message and its sender. Datagrams too short to hold a
    /// header are rejected.
    pub async fn recv_from(&mut self) -> Result<(Bytes, SocketAddr)> {
        self.recv_buf.clear();
        self.recv_buf.resize(self.max_message_size, 0);

        let (len, addr) = self.socket.recv_from(&mut self.recv_buf).await?;
        self.recv_buf.truncate(len);
        if let Err(e) = MessageHeader::decode(&self.recv_buf) {
            debug!("Malformed {} byte datagram from {}: {}", len, addr, e);
            return Err(e);
        }
        trace!("Received {} byte datagram from {}", len, addr);

        Ok((self.recv_buf.split().freeze(), addr))
    }

    /// Receive one message on the connected socket
    pub async fn recv(&mut self) -> Result<Bytes> {
        self.recv_buf.clear();
        self.recv_buf.resize(self.max_message_size, 0);

        let len = self.socket.recv(&mut self.recv_buf).await?;
        self.recv_buf.truncate(len);

        Ok(self.recv_buf.split().freeze())
    }
}

#[async_trait]
impl FrameSink for UdpFrameTransport {
    async fn send_frame(&mut self, data: Bytes) -> Result<()> {
        self.send(&data).await
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FrameSource for UdpFrameTransport {
    async fn recv_frame(&mut self) -> Result<Bytes> {
        self.recv().await
    }
}
