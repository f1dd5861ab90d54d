//! Message frames
//!
//! Every message starts with a 14-byte header:
//!
//! ```text
//! +--------+--------+--------+--------+
//! |  'I'   |  'c'   |  'e'   |  'P'   |   magic
//! +--------+--------+--------+--------+
//! |prot maj|prot min|enc maj |enc min |
//! +--------+--------+--------+--------+
//! |  type  | compr  |    message size ...
//! +--------+--------+--------+--------+
//!      ... (i32 LE, incl. header)     |
//! +--------+--------+
//! ```
//!
//! Request body:
//!
//! ```text
//! request_id: i32      # 0 for oneway/datagram; absent in batch bodies
//! identity: string string
//! facet: string[]      # zero or one element
//! operation: string
//! mode: u8             # InvocationMode
//! context: dict<string, string>
//! params: encapsulation
//! ```
//!
//! Reply body: `request_id: i32`, `status: u8`, then a status-specific body.

use crate::encoding::{
    get_context, get_encapsulation, get_i32, get_string, get_string_seq, put_context,
    put_encapsulation, put_string, put_string_seq, ENCODING_MAJOR, ENCODING_MINOR,
};
use crate::error::{Result, WireError};
use crate::types::{Context, Identity, InvocationMode};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol magic
pub const MAGIC: [u8; 4] = [b'I', b'c', b'e', b'P'];
/// Protocol major version
pub const PROTOCOL_MAJOR: u8 = 1;
/// Protocol minor version
pub const PROTOCOL_MINOR: u8 = 0;
/// Size of the message header
pub const HEADER_SIZE: usize = 14;

/// Compression byte: not compressed
const COMPRESSION_NONE: u8 = 0;
/// Compression byte: not compressed, sender could decompress
const COMPRESSION_SUPPORTED: u8 = 1;

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    BatchRequest = 1,
    Reply = 2,
    ValidateConnection = 3,
    CloseConnection = 4,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::BatchRequest),
            2 => Some(Self::Reply),
            3 => Some(Self::ValidateConnection),
            4 => Some(Self::CloseConnection),
            _ => None,
        }
    }
}

/// Message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub compression: u8,
    /// Total message size including this header
    pub message_size: u32,
}

impl MessageHeader {
    pub const SIZE: usize = HEADER_SIZE;

    pub fn new(message_type: MessageType, message_size: usize) -> Self {
        Self {
            message_type,
            compression: COMPRESSION_NONE,
            message_size: message_size as u32,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_MAJOR);
        buf.put_u8(PROTOCOL_MINOR);
        buf.put_u8(ENCODING_MAJOR);
        buf.put_u8(ENCODING_MINOR);
        buf.put_u8(self.message_type as u8);
        buf.put_u8(self.compression);
        buf.put_i32_le(self.message_size as i32);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(WireError::BufferUnderflow {
                needed: HEADER_SIZE,
                have: data.len(),
            });
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }

        let (prot_major, prot_minor) = (data[4], data[5]);
        if prot_major != PROTOCOL_MAJOR || prot_minor > PROTOCOL_MINOR {
            return Err(WireError::UnsupportedProtocol {
                major: prot_major,
                minor: prot_minor,
            });
        }

        let (enc_major, enc_minor) = (data[6], data[7]);
        if enc_major != ENCODING_MAJOR || enc_minor > ENCODING_MINOR {
            return Err(WireError::UnsupportedEncoding {
                major: enc_major,
                minor: enc_minor,
            });
        }

        let message_type =
            MessageType::from_u8(data[8]).ok_or(WireError::InvalidMessageType(data[8]))?;

        let compression = data[9];
        if compression != COMPRESSION_NONE && compression != COMPRESSION_SUPPORTED {
            return Err(WireError::CompressionNotSupported);
        }

        let size = i32::from_le_bytes([data[10], data[11], data[12], data[13]]);
        if size < HEADER_SIZE as i32 {
            return Err(WireError::InvalidSize(size));
        }

        Ok(Self {
            message_type,
            compression,
            message_size: size as u32,
        })
    }
}

/// Reserve header space, let `body` write, then patch the header in.
fn encode_message(message_type: MessageType, body: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(&[0u8; HEADER_SIZE]);
    body(&mut buf);

    let header = MessageHeader::new(message_type, buf.len());
    let mut header_buf = BytesMut::with_capacity(HEADER_SIZE);
    header.encode(&mut header_buf);
    buf[..HEADER_SIZE].copy_from_slice(&header_buf);

    buf.freeze()
}

fn put_facet<B: BufMut>(buf: &mut B, facet: &str) {
    if facet.is_empty() {
        put_string_seq::<B, &str>(buf, &[]);
    } else {
        put_string_seq(buf, &[facet]);
    }
}

fn get_facet<B: Buf>(buf: &mut B) -> Result<String> {
    let mut facets = get_string_seq(buf)?;
    match facets.len() {
        0 => Ok(String::new()),
        1 => Ok(facets.remove(0)),
        n => Err(WireError::InvalidSize(n as i32)),
    }
}

/// A request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    /// Correlates the reply; 0 when no reply is expected
    pub request_id: i32,
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: InvocationMode,
    pub context: Context,
    /// Marshaled arguments (encapsulation payload)
    pub params: Bytes,
}

impl RequestFrame {
    pub fn new(identity: Identity, operation: impl Into<String>) -> Self {
        Self {
            request_id: 0,
            identity,
            facet: String::new(),
            operation: operation.into(),
            mode: InvocationMode::Twoway,
            context: Context::new(),
            params: Bytes::new(),
        }
    }

    /// Encode the request body, with or without the leading request id
    pub fn encode_body<B: BufMut>(&self, buf: &mut B, with_request_id: bool) {
        if with_request_id {
            buf.put_i32_le(self.request_id);
        }
        self.identity.encode(buf);
        put_facet(buf, &self.facet);
        put_string(buf, &self.operation);
        buf.put_u8(self.mode as u8);
        put_context(buf, &self.context);
        put_encapsulation(buf, &self.params);
    }

    pub fn decode_body<B: Buf>(buf: &mut B, with_request_id: bool) -> Result<Self> {
        let request_id = if with_request_id { get_i32(buf)? } else { 0 };
        let identity = Identity::decode(buf)?;
        let facet = get_facet(buf)?;
        let operation = get_string(buf)?;
        let mode = InvocationMode::decode(buf)?;
        let context = get_context(buf)?;
        let params = get_encapsulation(buf)?;
        Ok(Self {
            request_id,
            identity,
            facet,
            operation,
            mode,
            context,
            params,
        })
    }

    /// Body as queued in a batch (no request id)
    pub fn batch_body(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.params.len());
        self.encode_body(&mut buf, false);
        buf.freeze()
    }

    /// Full Request message
    pub fn encode(&self) -> Bytes {
        encode_message(MessageType::Request, |buf| self.encode_body(buf, true))
    }
}

/// A batch of requests, delivered as one message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchRequestFrame {
    pub requests: Vec<RequestFrame>,
}

impl BatchRequestFrame {
    /// Encode a BatchRequest message from bodies produced by
    /// [`RequestFrame::batch_body`], preserving their order.
    pub fn encode_bodies(bodies: &[Bytes]) -> Bytes {
        encode_message(MessageType::BatchRequest, |buf| {
            buf.put_i32_le(bodies.len() as i32);
            for body in bodies {
                buf.put_slice(body);
            }
        })
    }

    pub fn encode(&self) -> Bytes {
        let bodies: Vec<Bytes> = self.requests.iter().map(RequestFrame::batch_body).collect();
        Self::encode_bodies(&bodies)
    }

    pub fn decode_body<B: Buf>(buf: &mut B) -> Result<Self> {
        let count = get_i32(buf)?;
        if count < 0 {
            return Err(WireError::InvalidSize(count));
        }
        let mut requests = Vec::with_capacity((count as usize).min(1024));
        for _ in 0..count {
            requests.push(RequestFrame::decode_body(buf, false)?);
        }
        Ok(Self { requests })
    }
}

/// Reply status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    UnknownLocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

impl ReplyStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::UserException),
            2 => Some(Self::ObjectNotExist),
            3 => Some(Self::FacetNotExist),
            4 => Some(Self::OperationNotExist),
            5 => Some(Self::UnknownLocalException),
            6 => Some(Self::UnknownUserException),
            7 => Some(Self::UnknownException),
            _ => None,
        }
    }
}

/// Target named in a "does not exist" reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
}

impl RequestTarget {
    pub fn of(request: &RequestFrame) -> Self {
        Self {
            identity: request.identity.clone(),
            facet: request.facet.clone(),
            operation: request.operation.clone(),
        }
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.identity.encode(buf);
        put_facet(buf, &self.facet);
        put_string(buf, &self.operation);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self {
            identity: Identity::decode(buf)?,
            facet: get_facet(buf)?,
            operation: get_string(buf)?,
        })
    }
}

/// Outcome carried by a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Marshaled results
    Ok(Bytes),
    /// Marshaled application exception
    UserException(Bytes),
    ObjectNotExist(RequestTarget),
    FacetNotExist(RequestTarget),
    OperationNotExist(RequestTarget),
    UnknownLocalException(String),
    UnknownUserException(String),
    UnknownException(String),
}

impl ReplyOutcome {
    pub fn status(&self) -> ReplyStatus {
        match self {
            Self::Ok(_) => ReplyStatus::Ok,
            Self::UserException(_) => ReplyStatus::UserException,
            Self::ObjectNotExist(_) => ReplyStatus::ObjectNotExist,
            Self::FacetNotExist(_) => ReplyStatus::FacetNotExist,
            Self::OperationNotExist(_) => ReplyStatus::OperationNotExist,
            Self::UnknownLocalException(_) => ReplyStatus::UnknownLocalException,
            Self::UnknownUserException(_) => ReplyStatus::UnknownUserException,
            Self::UnknownException(_) => ReplyStatus::UnknownException,
        }
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.status() as u8);
        match self {
            Self::Ok(data) | Self::UserException(data) => put_encapsulation(buf, data),
            Self::ObjectNotExist(target)
            | Self::FacetNotExist(target)
            | Self::OperationNotExist(target) => target.encode(buf),
            Self::UnknownLocalException(msg)
            | Self::UnknownUserException(msg)
            | Self::UnknownException(msg) => put_string(buf, msg),
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(WireError::BufferUnderflow { needed: 1, have: 0 });
        }
        let raw = buf.get_u8();
        let status = ReplyStatus::from_u8(raw).ok_or(WireError::InvalidReplyStatus(raw))?;
        let outcome = match status {
            ReplyStatus::Ok => Self::Ok(get_encapsulation(buf)?),
            ReplyStatus::UserException => Self::UserException(get_encapsulation(buf)?),
            ReplyStatus::ObjectNotExist => Self::ObjectNotExist(RequestTarget::decode(buf)?),
            ReplyStatus::FacetNotExist => Self::FacetNotExist(RequestTarget::decode(buf)?),
            ReplyStatus::OperationNotExist => {
                Self::OperationNotExist(RequestTarget::decode(buf)?)
            }
            ReplyStatus::UnknownLocalException => Self::UnknownLocalException(get_string(buf)?),
            ReplyStatus::UnknownUserException => Self::UnknownUserException(get_string(buf)?),
            ReplyStatus::UnknownException => Self::UnknownException(get_string(buf)?),
        };
        Ok(outcome)
    }
}

/// A reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub request_id: i32,
    pub outcome: ReplyOutcome,
}

impl ReplyFrame {
    pub fn new(request_id: i32, outcome: ReplyOutcome) -> Self {
        Self {
            request_id,
            outcome,
        }
    }

    pub fn encode(&self) -> Bytes {
        encode_message(MessageType::Reply, |buf| {
            buf.put_i32_le(self.request_id);
            self.outcome.encode(buf);
        })
    }

    pub fn decode_body<B: Buf>(buf: &mut B) -> Result<Self> {
        let request_id = get_i32(buf)?;
        let outcome = ReplyOutcome::decode(buf)?;
        Ok(Self {
            request_id,
            outcome,
        })
    }
}

/// Any message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(RequestFrame),
    BatchRequest(BatchRequestFrame),
    Reply(ReplyFrame),
    ValidateConnection,
    CloseConnection,
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Request(_) => MessageType::Request,
            Self::BatchRequest(_) => MessageType::BatchRequest,
            Self::Reply(_) => MessageType::Reply,
            Self::ValidateConnection => MessageType::ValidateConnection,
            Self::CloseConnection => MessageType::CloseConnection,
        }
    }

    /// Decode one complete message
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = MessageHeader::decode(data)?;
        let size = header.message_size as usize;
        if data.len() < size {
            return Err(WireError::BufferUnderflow {
                needed: size,
                have: data.len(),
            });
        }

        let mut body = &data[HEADER_SIZE..size];
        let frame = match header.message_type {
            MessageType::Request => Self::Request(RequestFrame::decode_body(&mut body, true)?),
            MessageType::BatchRequest => {
                Self::BatchRequest(BatchRequestFrame::decode_body(&mut body)?)
            }
            MessageType::Reply => Self::Reply(ReplyFrame::decode_body(&mut body)?),
            MessageType::ValidateConnection => Self::ValidateConnection,
            MessageType::CloseConnection => Self::CloseConnection,
        };

        if body.has_remaining() {
            return Err(WireError::TrailingData(body.remaining()));
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Self::Request(request) => request.encode(),
            Self::BatchRequest(batch) => batch.encode(),
            Self::Reply(reply) => reply.encode(),
            Self::ValidateConnection => encode_message(MessageType::ValidateConnection, |_| {}),
            Self::CloseConnection => encode_message(MessageType::CloseConnection, |_| {}),
        }
    }
}

/// Encoded size of a BatchRequest message holding `bodies_len` body bytes
pub fn batch_message_size(bodies_len: usize) -> usize {
    HEADER_SIZE + 4 + bodies_len
}
