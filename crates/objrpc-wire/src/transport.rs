//! Stream transport
//!
//! Messages are self-delimiting via the size field in the header, so a
//! byte stream can carry them back to back.

use crate::error::{Result, WireError};
use crate::frame::{Frame, MessageHeader, HEADER_SIZE};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Default maximum message size (1 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Writes encoded messages to a peer
#[async_trait]
pub trait FrameSink: Send {
    /// Write one complete, already encoded message
    async fn send_frame(&mut self, data: Bytes) -> Result<()>;

    /// Shut the write side down
    async fn close(&mut self) -> Result<()>;
}

/// Reads encoded messages from a peer
#[async_trait]
pub trait FrameSource: Send {
    /// Read one complete message (header included)
    async fn recv_frame(&mut self) -> Result<Bytes>;
}

/// Message reader/writer over any async byte stream
pub struct FrameTransport<T> {
    inner: T,
    max_message_size: usize,
    read_buf: BytesMut,
}

impl<T> FrameTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_message_size(mut self, max_size: usize) -> Self {
        self.max_message_size = max_size;
        self
    }

}

impl<T: AsyncRead + Unpin> FrameTransport<T> {
    /// Read a complete message
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        while self.read_buf.len() < HEADER_SIZE {
            let n = self.fill_buf().await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    trace!("Stream closed by peer");
                    return Err(WireError::ConnectionClosed);
                }
                debug!("Stream closed inside a message header");
                return Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "incomplete message header",
                )));
            }
        }

        let header = MessageHeader::decode(&self.read_buf)?;
        let size = header.message_size as usize;
        if size > self.max_message_size {
            debug!(
                "Incoming message of {} bytes exceeds the {} byte limit",
                size, self.max_message_size
            );
            return Err(WireError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        while self.read_buf.len() < size {
            let n = self.fill_buf().await?;
            if n == 0 {
                debug!("Stream closed after {} of {} bytes", self.read_buf.len(), size);
                return Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "incomplete message: expected {} bytes, got {}",
                        size,
                        self.read_buf.len()
                    ),
                )));
            }
        }

        trace!("Read {:?} message ({} bytes)", header.message_type, size);
        Ok(self.read_buf.split_to(size).freeze())
    }

    /// Read and decode a complete message
    pub async fn read_frame_decoded(&mut self) -> Result<Frame> {
        let data = self.read_frame().await?;
        Frame::decode(&data)
    }

    async fn fill_buf(&mut self) -> Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < 4096 {
            self.read_buf.reserve(8192);
        }
        Ok(self.inner.read_buf(&mut self.read_buf).await?)
    }
}

impl<T: AsyncWrite + Unpin> FrameTransport<T> {
    /// Write a complete message (already encoded)
    pub async fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.max_message_size {
            return Err(WireError::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        trace!("Wrote {} byte message", data.len());
        Ok(())
    }

    /// Encode and write a message
    pub async fn write_frame_encoded(&mut self, frame: &Frame) -> Result<()> {
        let data = frame.encode();
        self.write_frame(&data).await
    }
}

#[async_trait]
impl<T: AsyncWrite + Unpin + Send> FrameSink for FrameTransport<T> {
    async fn send_frame(&mut self, data: Bytes) -> Result<()> {
        self.write_frame(&data).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl<T: AsyncRead + Unpin + Send> FrameSource for FrameTransport<T> {
    async fn recv_frame(&mut self) -> Result<Bytes> {
        self.read_frame().await
    }
}
