//! Value types carried in every request
//!
//! - [`Identity`]: name + category of a remote object
//! - [`Context`]: out-of-band string metadata attached to a request
//! - [`InvocationMode`]: how a request is delivered

use crate::encoding::{get_string, put_string};
use crate::error::{Result, WireError};
use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Request context: string keys to string values
pub type Context = HashMap<String, String>;

/// Identity of a remote object within a server process
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

/// Error returned when an identity string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid identity `{input}`: {reason}")]
pub struct IdentityParseError {
    pub input: String,
    pub reason: &'static str,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
        }
    }

    pub fn with_category(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    /// Parse `name` or `category/name`. `\` escapes the next character.
    pub fn parse(input: &str) -> std::result::Result<Self, IdentityParseError> {
        let err = |reason| IdentityParseError {
            input: input.to_string(),
            reason,
        };

        let mut category: Option<String> = None;
        let mut current = String::new();
        let mut chars = input.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '\\' => match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(err("dangling escape")),
                },
                '/' => {
                    if category.is_some() {
                        return Err(err("more than one unescaped `/`"));
                    }
                    category = Some(std::mem::take(&mut current));
                }
                other => current.push(other),
            }
        }

        let identity = Identity {
            name: current,
            category: category.unwrap_or_default(),
        };

        if identity.name.is_empty() {
            return Err(err("empty name"));
        }
        Ok(identity)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        put_string(buf, &self.name);
        put_string(buf, &self.category);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let name = get_string(buf)?;
        let category = get_string(buf)?;
        Ok(Self { name, category })
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, part: &str) -> fmt::Result {
    for ch in part.chars() {
        if ch == '/' || ch == '\\' {
            write!(f, "\\")?;
        }
        write!(f, "{}", ch)?;
    }
    Ok(())
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.category.is_empty() {
            write_escaped(f, &self.category)?;
            write!(f, "/")?;
        }
        write_escaped(f, &self.name)
    }
}

impl FromStr for Identity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Identity::parse(s)
    }
}

/// Invocation mode of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum InvocationMode {
    /// Request/reply
    #[default]
    Twoway = 0,
    /// Fire and forget over a stream connection
    Oneway = 1,
    /// Queued, sent on flush over a stream connection
    BatchOneway = 2,
    /// Fire and forget over a datagram endpoint
    Datagram = 3,
    /// Queued, sent on flush over a datagram endpoint
    BatchDatagram = 4,
}

impl InvocationMode {
    pub const ALL: [InvocationMode; 5] = [
        Self::Twoway,
        Self::Oneway,
        Self::BatchOneway,
        Self::Datagram,
        Self::BatchDatagram,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Twoway),
            1 => Some(Self::Oneway),
            2 => Some(Self::BatchOneway),
            3 => Some(Self::Datagram),
            4 => Some(Self::BatchDatagram),
            _ => None,
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(WireError::BufferUnderflow { needed: 1, have: 0 });
        }
        let raw = buf.get_u8();
        Self::from_u8(raw).ok_or(WireError::InvalidMode(raw))
    }

    /// A reply is expected
    pub fn is_twoway(self) -> bool {
        self == Self::Twoway
    }

    /// Queued until flushed
    pub fn is_batch(self) -> bool {
        matches!(self, Self::BatchOneway | Self::BatchDatagram)
    }

    /// Delivered over datagram endpoints
    pub fn is_datagram(self) -> bool {
        matches!(self, Self::Datagram | Self::BatchDatagram)
    }

    /// Command-line flag used in the reference string form, if any
    pub fn flag(self) -> Option<&'static str> {
        match self {
            Self::Twoway => None,
            Self::Oneway => Some("-o"),
            Self::BatchOneway => Some("-O"),
            Self::Datagram => Some("-d"),
            Self::BatchDatagram => Some("-D"),
        }
    }
}

impl fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Twoway => "twoway",
            Self::Oneway => "oneway",
            Self::BatchOneway => "batch-oneway",
            Self::Datagram => "datagram",
            Self::BatchDatagram => "batch-datagram",
        };
        write!(f, "{}", name)
    }
}
