//! Endpoints
//!
//! Textual form: `tcp|ssl|udp|default [-h host] -p port [-t timeoutMs]`.
//! `default` is an alias for `tcp`.

use crate::error::{Result, RpcError};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Host used when an endpoint omits `-h`
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Transport kind of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    Tcp,
    Ssl,
    Udp,
}

impl TransportKind {
    pub fn is_secure(self) -> bool {
        self == Self::Ssl
    }

    pub fn is_datagram(self) -> bool {
        self == Self::Udp
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ssl => "ssl",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transport address a remote object can be reached at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    /// Bounds connection establishment (connect + validation); also the
    /// call timeout of a reference without a `-t` flag
    pub timeout: Option<Duration>,
}

impl Endpoint {
    pub fn new(kind: TransportKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            timeout: None,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(TransportKind::Tcp, host, port)
    }

    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self::new(TransportKind::Udp, host, port)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_secure(&self) -> bool {
        self.kind.is_secure()
    }

    pub fn is_datagram(&self) -> bool {
        self.kind.is_datagram()
    }

    /// `host:port`, for socket address resolution
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Parse one endpoint from its textual form
    pub fn parse(text: &str) -> Result<Self> {
        let malformed = || RpcError::MalformedEndpoint(text.trim().to_string());

        let mut tokens = text.split_whitespace();
        let kind = match tokens.next() {
            Some("tcp") | Some("default") => TransportKind::Tcp,
            Some("ssl") => TransportKind::Ssl,
            Some("udp") => TransportKind::Udp,
            _ => return Err(malformed()),
        };

        let mut host = None;
        let mut port = None;
        let mut timeout = None;
        while let Some(option) = tokens.next() {
            let value = tokens.next().ok_or_else(malformed)?;
            match option {
                "-h" => host = Some(value.to_string()),
                "-p" => port = Some(value.parse::<u16>().map_err(|_| malformed())?),
                "-t" => {
                    let ms: i64 = value.parse().map_err(|_| malformed())?;
                    timeout = match ms {
                        -1 => None,
                        ms if ms > 0 => Some(Duration::from_millis(ms as u64)),
                        _ => return Err(malformed()),
                    };
                }
                _ => return Err(malformed()),
            }
        }

        Ok(Self {
            kind,
            host: host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: port.ok_or_else(malformed)?,
            timeout,
        })
    }
}

impl FromStr for Endpoint {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -h {} -p {}", self.kind, self.host, self.port)?;
        if let Some(timeout) = self.timeout {
            write!(f, " -t {}", timeout.as_millis())?;
        }
        Ok(())
    }
}
