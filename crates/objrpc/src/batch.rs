//! Batch queues
//!
//! Requests sent in a batch mode are marshaled immediately but held until
//! flushed, then transmitted together as one BatchRequest message.

use bytes::Bytes;
use objrpc_wire::InvocationMode;

/// Which batch queue a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchMode {
    Oneway,
    Datagram,
}

impl BatchMode {
    /// Batch queue for `mode`, if it is a batch mode
    pub fn of(mode: InvocationMode) -> Option<Self> {
        match mode {
            InvocationMode::BatchOneway => Some(Self::Oneway),
            InvocationMode::BatchDatagram => Some(Self::Datagram),
            _ => None,
        }
    }
}

/// Observable state of a batch queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Empty,
    Accumulating(usize),
}

/// Ordered buffer of marshaled request bodies
#[derive(Debug, Default)]
pub struct BatchQueue {
    requests: Vec<Bytes>,
    size: usize,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, body: Bytes) {
        self.size += body.len();
        self.requests.push(body);
    }

    /// Take every queued request in submission order, leaving the queue empty
    pub fn take(&mut self) -> Vec<Bytes> {
        self.size = 0;
        std::mem::take(&mut self.requests)
    }

    /// Drop everything queued; returns how many requests were lost
    pub fn discard(&mut self) -> usize {
        self.size = 0;
        let count = self.requests.len();
        self.requests.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Total size of the queued bodies in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn state(&self) -> BatchState {
        match self.requests.len() {
            0 => BatchState::Empty,
            n => BatchState::Accumulating(n),
        }
    }
}
