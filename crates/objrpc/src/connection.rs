//! Client connections
//!
//! A [`Connection`] multiplexes concurrent requests over one transport.
//! Twoway requests register a reply slot keyed by request id; a reader
//! task routes each reply to its slot, so replies may complete in any
//! order. Writes are serialized through the sink lock.
//!
//! A connection fails as a whole: every pending caller receives the same
//! `ConnectionLost` error and unflushed batches are discarded. A per-call
//! timeout only abandons that call's slot.

use crate::batch::{BatchMode, BatchQueue, BatchState};
use crate::connector::{Connector, Link};
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use bytes::Bytes;
use objrpc_wire::frame::batch_message_size;
use objrpc_wire::{
    BatchRequestFrame, Frame, FrameSink, FrameSource, ReplyFrame, ReplyOutcome, RequestFrame,
    WireError, MAX_UDP_PAYLOAD,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

type ReplySender = oneshot::Sender<Result<ReplyOutcome>>;

struct RequestTable {
    pending: HashMap<i32, ReplySender>,
    /// Set once; the connection accepts nothing afterwards
    closed: Option<RpcError>,
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// A client connection to one endpoint
pub struct Connection {
    endpoint: Endpoint,
    datagram: bool,
    max_message_size: usize,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    requests: Mutex<RequestTable>,
    next_request_id: AtomicI32,
    batch_oneway: Mutex<BatchQueue>,
    batch_datagram: Mutex<BatchQueue>,
    reader: Mutex<Option<JoinHandle<()>>>,
    on_close: Mutex<Option<CloseHook>>,
}

/// Removes a pending slot when the waiting call finishes or is dropped
struct PendingGuard<'a> {
    connection: &'a Connection,
    request_id: i32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.connection
            .requests
            .lock()
            .pending
            .remove(&self.request_id);
    }
}

fn connect_failed(endpoint: &Endpoint, reason: impl ToString) -> RpcError {
    RpcError::ConnectFailed {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    }
}

impl Connection {
    /// Connect through `connector` and, for stream transports, wait for the
    /// peer's ValidateConnection. The endpoint timeout bounds both steps.
    pub async fn establish(
        connector: &dyn Connector,
        endpoint: &Endpoint,
        secure: bool,
        max_message_size: usize,
    ) -> Result<Arc<Self>> {
        let handshake = async {
            let mut link = connector.connect(endpoint, secure).await?;
            if !link.datagram {
                let data = link
                    .source
                    .recv_frame()
                    .await
                    .map_err(|e| connect_failed(endpoint, e))?;
                match Frame::decode(&data) {
                    Ok(Frame::ValidateConnection) => {}
                    Ok(other) => {
                        return Err(connect_failed(
                            endpoint,
                            format!("expected connection validation, got {:?}", other.message_type()),
                        ))
                    }
                    Err(e) => return Err(connect_failed(endpoint, e)),
                }
            }
            Ok::<Link, RpcError>(link)
        };

        let link = match endpoint.timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| connect_failed(endpoint, format!("timed out after {:?}", limit)))??,
            None => handshake.await?,
        };

        debug!("Connection to {} established", endpoint);
        Ok(Self::from_link(link, endpoint.clone(), max_message_size))
    }

    /// Wrap an already validated link and start its reader
    pub fn from_link(link: Link, endpoint: Endpoint, max_message_size: usize) -> Arc<Self> {
        let Link {
            sink,
            source,
            datagram,
        } = link;
        let max_message_size = if datagram {
            max_message_size.min(MAX_UDP_PAYLOAD)
        } else {
            max_message_size
        };

        let connection = Arc::new(Self {
            endpoint,
            datagram,
            max_message_size,
            sink: tokio::sync::Mutex::new(sink),
            requests: Mutex::new(RequestTable {
                pending: HashMap::new(),
                closed: None,
            }),
            next_request_id: AtomicI32::new(1),
            batch_oneway: Mutex::new(BatchQueue::new()),
            batch_datagram: Mutex::new(BatchQueue::new()),
            reader: Mutex::new(None),
            on_close: Mutex::new(None),
        });

        // Datagram links never carry replies
        if !datagram {
            let handle = tokio::spawn(read_loop(Arc::downgrade(&connection), source));
            *connection.reader.lock() = Some(handle);
        }
        connection
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_datagram(&self) -> bool {
        self.datagram
    }

    pub fn is_closed(&self) -> bool {
        self.requests.lock().closed.is_some()
    }

    /// Why the connection closed, if it has
    pub fn close_reason(&self) -> Option<RpcError> {
        self.requests.lock().closed.clone()
    }

    /// Twoway requests still awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.requests.lock().pending.len()
    }

    pub fn batch_state(&self, mode: BatchMode) -> BatchState {
        self.batch(mode).lock().state()
    }

    /// Run `hook` once when the connection closes (immediately if it
    /// already has)
    pub fn set_on_close(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_closed() {
            hook();
            return;
        }
        *self.on_close.lock() = Some(Box::new(hook));
        // Closed while installing: make sure the hook still runs
        if self.is_closed() {
            if let Some(hook) = self.on_close.lock().take() {
                hook();
            }
        }
    }

    fn batch(&self, mode: BatchMode) -> &Mutex<BatchQueue> {
        match mode {
            BatchMode::Oneway => &self.batch_oneway,
            BatchMode::Datagram => &self.batch_datagram,
        }
    }

    fn next_request_id(&self) -> i32 {
        // Positive ids only; 0 marks requests without a reply
        match self.next_request_id.fetch_add(1, Ordering::Relaxed) & i32::MAX {
            0 => 1,
            id => id,
        }
    }

    fn check_open(&self) -> Result<()> {
        match &self.requests.lock().closed {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size <= self.max_message_size {
            return Ok(());
        }
        if self.datagram {
            Err(RpcError::DatagramLimit {
                size,
                max: self.max_message_size,
            })
        } else {
            Err(RpcError::Protocol(format!(
                "message of {} bytes exceeds maximum {}",
                size, self.max_message_size
            )))
        }
    }

    fn lost(&self, reason: impl Into<String>) -> RpcError {
        RpcError::ConnectionLost {
            endpoint: self.endpoint.to_string(),
            reason: reason.into(),
        }
    }

    fn on_write_error(&self, err: WireError) -> RpcError {
        let err = RpcError::from_wire(&self.endpoint.to_string(), err);
        self.fail(err.clone());
        err
    }

    /// Send a twoway request and wait for its reply.
    ///
    /// The request id is assigned here and `timeout` starts now. Expiry
    /// while waiting for the reply fails only this call. Expiry while the
    /// request is being written leaves a partial message on the stream, so
    /// the connection is closed with ConnectionLost for every other user;
    /// this caller still gets Timeout.
    pub async fn invoke_twoway(
        &self,
        mut request: RequestFrame,
        timeout: Option<Duration>,
    ) -> Result<ReplyOutcome> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let timed_out = || RpcError::Timeout(timeout.unwrap_or_default());

        let request_id = self.next_request_id();
        request.request_id = request_id;
        let data = request.encode();
        self.check_size(data.len())?;

        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.requests.lock();
            if let Some(err) = &table.closed {
                return Err(err.clone());
            }
            table.pending.insert(request_id, tx);
        }
        let _guard = PendingGuard {
            connection: self,
            request_id,
        };

        trace!(
            "Sending request {} `{}` to {}",
            request_id,
            request.operation,
            self.endpoint
        );

        let mut sink = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.sink.lock()).await {
                Ok(sink) => sink,
                Err(_) => return Err(timed_out()),
            },
            None => self.sink.lock().await,
        };
        let write = sink.send_frame(data);
        let written = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, write).await.ok(),
            None => Some(write.await),
        };
        drop(sink);

        match written {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(self.on_write_error(e)),
            None => {
                self.fail(self.lost("timed out writing request"));
                return Err(timed_out());
            }
        }

        let reply = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    debug!("Request {} to {} timed out", request_id, self.endpoint);
                    return Err(timed_out());
                }
            },
            None => rx.await,
        };

        match reply {
            Ok(outcome) => outcome,
            Err(_) => Err(self.lost("reply slot dropped")),
        }
    }

    /// Send a request that expects no reply
    pub async fn send_oneway(&self, mut request: RequestFrame) -> Result<()> {
        request.request_id = 0;
        let data = request.encode();
        self.check_size(data.len())?;
        self.check_open()?;

        let mut sink = self.sink.lock().await;
        trace!("Sending {} `{}` to {}", request.mode, request.operation, self.endpoint);
        sink.send_frame(data)
            .await
            .map_err(|e| self.on_write_error(e))
    }

    /// Append a marshaled request body to a batch queue. If the batch
    /// would outgrow the message size limit, what is queued goes out
    /// first.
    pub async fn queue_batch(&self, mode: BatchMode, body: Bytes) -> Result<()> {
        self.check_open()?;
        let limit = self.max_message_size;
        self.check_size(batch_message_size(body.len()))?;

        {
            let mut queue = self.batch(mode).lock();
            if batch_message_size(queue.size() + body.len()) <= limit {
                queue.push(body);
                return Ok(());
            }
        }

        // Holding the sink from take to send keeps batches in order
        let mut sink = self.sink.lock().await;
        let bodies = {
            let mut queue = self.batch(mode).lock();
            let bodies = if batch_message_size(queue.size() + body.len()) > limit {
                queue.take()
            } else {
                Vec::new()
            };
            queue.push(body);
            bodies
        };

        if !bodies.is_empty() {
            debug!(
                "Batch for {} full, sending {} requests",
                self.endpoint,
                bodies.len()
            );
            sink.send_frame(BatchRequestFrame::encode_bodies(&bodies))
                .await
                .map_err(|e| self.on_write_error(e))?;
        }
        Ok(())
    }

    /// Transmit a batch queue as one message; returns the number of
    /// requests sent
    pub async fn flush_batch(&self, mode: BatchMode) -> Result<usize> {
        self.check_open()?;
        let mut sink = self.sink.lock().await;
        let bodies = self.batch(mode).lock().take();
        if bodies.is_empty() {
            return Ok(0);
        }

        debug!("Flushing {} batched requests to {}", bodies.len(), self.endpoint);
        sink.send_frame(BatchRequestFrame::encode_bodies(&bodies))
            .await
            .map_err(|e| self.on_write_error(e))?;
        Ok(bodies.len())
    }

    /// Flush both batch queues
    pub async fn flush_batches(&self) -> Result<usize> {
        let oneway = self.flush_batch(BatchMode::Oneway).await?;
        let datagram = self.flush_batch(BatchMode::Datagram).await?;
        Ok(oneway + datagram)
    }

    /// Close the connection, optionally flushing batch queues first.
    /// Pending twoway calls fail with `ConnectionLost`.
    pub async fn close(&self, flush: bool) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let flushed = if flush {
            self.flush_batches().await.map(|_| ())
        } else {
            Ok(())
        };

        {
            let mut sink = self.sink.lock().await;
            if !self.datagram {
                let _ = sink.send_frame(Frame::CloseConnection.encode()).await;
            }
            let _ = sink.close().await;
        }

        if self.terminate(self.lost("connection closed")) {
            debug!("Connection to {} closed", self.endpoint);
        }
        flushed
    }

    /// Fail the connection: pending calls get `err`, batches are dropped
    pub(crate) fn fail(&self, err: RpcError) {
        if self.terminate(err.clone()) {
            warn!("Connection to {} failed: {}", self.endpoint, err);
        }
    }

    /// Returns false if the connection was already closed
    fn terminate(&self, err: RpcError) -> bool {
        let waiters = {
            let mut table = self.requests.lock();
            if table.closed.is_some() {
                return false;
            }
            table.closed = Some(err.clone());
            std::mem::take(&mut table.pending)
        };

        for (_, tx) in waiters {
            let _ = tx.send(Err(err.clone()));
        }

        for mode in [BatchMode::Oneway, BatchMode::Datagram] {
            let lost = self.batch(mode).lock().discard();
            if lost > 0 {
                warn!(
                    "Discarded {} unflushed batch requests for {}",
                    lost, self.endpoint
                );
            }
        }

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        if let Some(hook) = self.on_close.lock().take() {
            hook();
        }
        true
    }

    fn dispatch_reply(&self, reply: ReplyFrame) {
        let waiter = self.requests.lock().pending.remove(&reply.request_id);
        match waiter {
            Some(tx) => {
                trace!("Reply {} from {}", reply.request_id, self.endpoint);
                let _ = tx.send(Ok(reply.outcome));
            }
            None => debug!(
                "Dropping reply {} from {}: no pending request",
                reply.request_id, self.endpoint
            ),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint.to_string())
            .field("datagram", &self.datagram)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop(connection: Weak<Connection>, mut source: Box<dyn FrameSource>) {
    loop {
        let received = source.recv_frame().await;
        let connection = match connection.upgrade() {
            Some(connection) => connection,
            None => return,
        };

        let data = match received {
            Ok(data) => data,
            Err(e) => {
                let err = RpcError::from_wire(&connection.endpoint.to_string(), e);
                connection.fail(err);
                return;
            }
        };

        match Frame::decode(&data) {
            Ok(Frame::Reply(reply)) => connection.dispatch_reply(reply),
            Ok(Frame::ValidateConnection) => trace!("Validation from {}", connection.endpoint),
            Ok(Frame::CloseConnection) => {
                debug!("Peer {} closed the connection", connection.endpoint);
                connection.fail(connection.lost("closed by peer"));
                return;
            }
            Ok(other) => {
                connection.fail(RpcError::Protocol(format!(
                    "unexpected {:?} message from server",
                    other.message_type()
                )));
                return;
            }
            Err(e) => {
                connection.fail(RpcError::Protocol(e.to_string()));
                return;
            }
        }
    }
}
