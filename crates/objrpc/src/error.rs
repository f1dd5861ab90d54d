//! Error types for proxies and invocations

use bytes::Bytes;
use objrpc_wire::{Identity, WireError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;

/// Application-level exception raised by a remote object.
///
/// The payload is whatever the servant marshaled; this layer carries it
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserException {
    pub payload: Bytes,
}

impl UserException {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

impl fmt::Display for UserException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user exception ({} bytes)", self.payload.len())
    }
}

/// RPC errors.
///
/// Cloneable: a single transport failure is delivered to every caller
/// waiting on the connection.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Reference text could not be parsed
    #[error("malformed reference `{reference}`: {reason} (at `{token}`)")]
    MalformedReference {
        reference: String,
        token: String,
        reason: String,
    },

    #[error("malformed endpoint `{0}`")]
    MalformedEndpoint(String),

    /// Transport connect (or connection validation) failed
    #[error("connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// Per-call timeout elapsed; the connection survives
    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),

    /// Connection failed or was closed while the call was outstanding
    #[error("connection to {endpoint} lost: {reason}")]
    ConnectionLost { endpoint: String, reason: String },

    #[error("object `{identity}` does not exist")]
    ObjectNotExist {
        identity: Identity,
        facet: String,
        operation: String,
    },

    #[error("facet `{facet}` of object `{identity}` does not exist")]
    FacetNotExist {
        identity: Identity,
        facet: String,
        operation: String,
    },

    #[error("operation `{operation}` does not exist on object `{identity}`")]
    OperationNotExist {
        identity: Identity,
        facet: String,
        operation: String,
    },

    /// Raised by the remote object's own logic
    #[error("{0}")]
    User(UserException),

    /// Indirect resolution failed
    #[error("adapter `{0}` is not registered")]
    NotRegistered(String),

    /// No endpoint qualifies for the invocation mode and security
    #[error("no suitable endpoint for `{0}`")]
    NoEndpoint(String),

    #[error("unknown local exception: {0}")]
    UnknownLocal(String),

    #[error("unknown user exception: {0}")]
    UnknownUser(String),

    #[error("unknown exception: {0}")]
    Unknown(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("datagram of {size} bytes exceeds maximum {max}")]
    DatagramLimit { size: usize, max: usize },

    #[error("communicator destroyed")]
    CommunicatorDestroyed,

    /// Object adapter is deactivated or cannot listen
    #[error("object adapter `{adapter}`: {reason}")]
    Adapter { adapter: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RpcError {
    pub(crate) fn malformed(
        reference: &str,
        token: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedReference {
            reference: reference.to_string(),
            token: token.into(),
            reason: reason.into(),
        }
    }

    /// Map a wire error seen on an established connection
    pub(crate) fn from_wire(endpoint: &str, err: WireError) -> Self {
        match err {
            WireError::Io(_) | WireError::ConnectionClosed => Self::ConnectionLost {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            },
            WireError::MessageTooLarge { size, max } => Self::Protocol(format!(
                "message of {} bytes exceeds maximum {}",
                size, max
            )),
            other => Self::Protocol(other.to_string()),
        }
    }

    /// Errors after which the connection is no longer usable
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. } | Self::ConnectFailed { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn user_exception(&self) -> Option<&UserException> {
        match self {
            Self::User(ex) => Some(ex),
            _ => None,
        }
    }
}
