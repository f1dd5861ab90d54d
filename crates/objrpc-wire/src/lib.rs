//! Wire format and transports for object RPC
//!
//! This crate holds everything that touches bytes:
//!
//! - Encoding primitives (compact sizes, strings, contexts, encapsulations)
//! - Request, batch request, reply, validate and close messages
//! - A framed reader/writer for byte streams (TCP)
//! - A datagram transport (UDP)
//!
//! # Example
//!
//! ```no_run
//! use objrpc_wire::{Frame, FrameTransport, Identity, RequestFrame};
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() {
//!     let stream = TcpStream::connect("127.0.0.1:10000").await.unwrap();
//!     let mut transport = FrameTransport::new(stream);
//!
//!     // Servers greet with ValidateConnection
//!     assert_eq!(
//!         transport.read_frame_decoded().await.unwrap(),
//!         Frame::ValidateConnection
//!     );
//!
//!     let mut request = RequestFrame::new(Identity::new("test"), "ice_ping");
//!     request.request_id = 1;
//!     transport.write_frame(&request.encode()).await.unwrap();
//! }
//! ```

pub mod encoding;
pub mod error;
pub mod frame;
pub mod transport;
pub mod types;
pub mod udp;

pub use error::{Result, WireError};
pub use frame::{
    BatchRequestFrame, Frame, MessageHeader, MessageType, ReplyFrame, ReplyOutcome, ReplyStatus,
    RequestFrame, RequestTarget, HEADER_SIZE,
};
pub use transport::{FrameSink, FrameSource, FrameTransport, DEFAULT_MAX_MESSAGE_SIZE};
pub use types::{Context, Identity, IdentityParseError, InvocationMode};
pub use udp::{UdpFrameTransport, MAX_UDP_PAYLOAD};
