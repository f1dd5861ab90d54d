//! Object adapter
//!
//! Server side of the protocol: a registry of servants keyed by identity
//! and facet, stream and datagram listeners, and request dispatch.
//!
//! # Dispatch
//!
//! - Each accepted connection runs in its own task and greets the peer
//!   with ValidateConnection
//! - Twoway requests are dispatched concurrently; replies are written as
//!   they complete, so they may leave out of order
//! - Oneway and batched requests are dispatched in arrival order
//! - `ice_ping`, `ice_isA`, `ice_ids` and `ice_id` are answered for every
//!   servant
//!
//! The same dispatch path serves collocated invocations from proxies of
//! the owning communicator.

use crate::batch::BatchMode;
use crate::communicator::Instance;
use crate::endpoint::{Endpoint, TransportKind};
use crate::error::{Result, RpcError};
use crate::proxy::ObjectPrx;
use crate::reference::Reference;
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use objrpc_wire::encoding::{get_string, put_bool, put_string, put_string_seq};
use objrpc_wire::{
    Context, Frame, FrameTransport, Identity, InvocationMode, MessageType, ReplyFrame,
    ReplyOutcome, RequestFrame, RequestTarget, UdpFrameTransport, WireError,
};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Type id every servant implements
pub const OBJECT_TYPE_ID: &str = "::Ice::Object";

/// Failure raised by a servant operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Application exception; the payload is returned to the caller as is
    #[error("user exception ({} bytes)", .0.len())]
    User(Bytes),
    #[error("operation does not exist")]
    OperationNotExist,
    #[error("{0}")]
    Unknown(String),
}

pub type DispatchResult = std::result::Result<Bytes, DispatchError>;

/// Future returned by [`Servant::dispatch`]
pub type DispatchFuture = Pin<Box<dyn Future<Output = DispatchResult> + Send>>;

/// Request information passed to servants
#[derive(Debug, Clone)]
pub struct Current {
    /// Name of the dispatching adapter
    pub adapter: String,
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: InvocationMode,
    pub context: Context,
    /// 0 for requests without a reply
    pub request_id: i32,
}

/// A servant: the server-side implementation of an object
///
/// # Example
///
/// ```ignore
/// struct Hello;
///
/// impl Servant for Hello {
///     fn type_ids(&self) -> &[&'static str] {
///         &["::Demo::Hello"]
///     }
///
///     fn dispatch(self: Arc<Self>, current: Current, _params: Bytes) -> DispatchFuture {
///         Box::pin(async move {
///             match current.operation.as_str() {
///                 "sayHello" => Ok(Bytes::new()),
///                 _ => Err(DispatchError::OperationNotExist),
///             }
///         })
///     }
/// }
/// ```
pub trait Servant: Send + Sync + 'static {
    /// Implemented type ids, most derived first
    fn type_ids(&self) -> &[&'static str];

    /// Handle a non built-in operation
    fn dispatch(self: Arc<Self>, current: Current, params: Bytes) -> DispatchFuture;

    /// Answer `ice_isA`
    fn ice_is_a(&self, type_id: &str, _current: &Current) -> bool {
        type_id == OBJECT_TYPE_ID || self.type_ids().iter().any(|id| *id == type_id)
    }
}

/// Adapter statistics
#[derive(Debug, Default)]
pub struct AdapterStats {
    pub connections_accepted: AtomicU64,
    pub requests_dispatched: AtomicU64,
    pub batches_dispatched: AtomicU64,
    pub datagrams_received: AtomicU64,
}

impl AdapterStats {
    pub fn snapshot(&self) -> AdapterStatsSnapshot {
        AdapterStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of adapter statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterStatsSnapshot {
    pub connections_accepted: u64,
    pub requests_dispatched: u64,
    pub batches_dispatched: u64,
    pub datagrams_received: u64,
}

type ServantKey = (Identity, String);

pub(crate) struct AdapterShared {
    name: String,
    adapter_id: Option<String>,
    instance: Arc<Instance>,
    servants: RwLock<HashMap<ServantKey, Arc<dyn Servant>>>,
    endpoints: RwLock<Vec<Endpoint>>,
    active: AtomicBool,
    shutdown: watch::Sender<bool>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    /// Batched requests from collocated proxies, one queue per mode
    collocated_oneway: Mutex<Vec<RequestFrame>>,
    collocated_datagram: Mutex<Vec<RequestFrame>>,
    stats: AdapterStats,
}

impl AdapterShared {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn inactive(&self) -> RpcError {
        RpcError::Adapter {
            adapter: self.name.clone(),
            reason: "deactivated".to_string(),
        }
    }

    fn servant(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        self.servants
            .read()
            .get(&(identity.clone(), facet.to_string()))
            .cloned()
    }

    fn has_identity(&self, identity: &Identity) -> bool {
        self.servants.read().keys().any(|(id, _)| id == identity)
    }

    /// Whether a proxy with `reference` addresses an object of this adapter
    pub(crate) fn hosts(&self, reference: &Reference) -> bool {
        if !self.is_active() {
            return false;
        }
        if let Some(adapter_id) = &reference.adapter_id {
            return self.adapter_id.as_ref() == Some(adapter_id);
        }
        if reference.is_well_known() {
            return self.has_identity(&reference.identity);
        }
        let published = self.endpoints.read();
        reference.endpoints.iter().any(|endpoint| {
            published.iter().any(|own| {
                own.kind == endpoint.kind && own.port == endpoint.port && own.host == endpoint.host
            })
        })
    }

    /// Dispatch one request to its servant
    pub(crate) async fn dispatch(&self, request: RequestFrame) -> ReplyOutcome {
        self.stats.requests_dispatched.fetch_add(1, Ordering::Relaxed);
        let target = RequestTarget::of(&request);

        let servant = match self.servant(&request.identity, &request.facet) {
            Some(servant) => servant,
            None if self.has_identity(&request.identity) => {
                debug!("No facet `{}` for {}", request.facet, request.identity);
                return ReplyOutcome::FacetNotExist(target);
            }
            None => {
                debug!("No servant for {}", request.identity);
                return ReplyOutcome::ObjectNotExist(target);
            }
        };

        let RequestFrame {
            request_id,
            identity,
            facet,
            operation,
            mode,
            context,
            params,
        } = request;
        let current = Current {
            adapter: self.name.clone(),
            identity,
            facet,
            operation,
            mode,
            context,
            request_id,
        };
        trace!("Dispatching `{}` on {}", current.operation, current.identity);

        match current.operation.as_str() {
            "ice_ping" => return ReplyOutcome::Ok(Bytes::new()),
            "ice_isA" => {
                let mut params = params;
                return match get_string(&mut params) {
                    Ok(type_id) => {
                        let mut buf = BytesMut::with_capacity(1);
                        put_bool(&mut buf, servant.ice_is_a(&type_id, &current));
                        ReplyOutcome::Ok(buf.freeze())
                    }
                    Err(e) => ReplyOutcome::UnknownLocalException(format!("ice_isA: {}", e)),
                };
            }
            "ice_ids" => {
                let mut ids: Vec<&str> = servant.type_ids().to_vec();
                ids.push(OBJECT_TYPE_ID);
                ids.sort_unstable();
                ids.dedup();
                let mut buf = BytesMut::new();
                put_string_seq(&mut buf, &ids);
                return ReplyOutcome::Ok(buf.freeze());
            }
            "ice_id" => {
                let id = servant.type_ids().first().copied().unwrap_or(OBJECT_TYPE_ID);
                let mut buf = BytesMut::new();
                put_string(&mut buf, id);
                return ReplyOutcome::Ok(buf.freeze());
            }
            _ => {}
        }

        match AssertUnwindSafe(servant.dispatch(current, params))
            .catch_unwind()
            .await
        {
            Ok(Ok(results)) => ReplyOutcome::Ok(results),
            Ok(Err(DispatchError::User(payload))) => ReplyOutcome::UserException(payload),
            Ok(Err(DispatchError::OperationNotExist)) => ReplyOutcome::OperationNotExist(target),
            Ok(Err(DispatchError::Unknown(reason))) => ReplyOutcome::UnknownException(reason),
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(
                    "Servant {} panicked in `{}`: {}",
                    target.identity, target.operation, reason
                );
                ReplyOutcome::UnknownException(reason)
            }
        }
    }

    fn collocated_batch(&self, mode: BatchMode) -> &Mutex<Vec<RequestFrame>> {
        match mode {
            BatchMode::Oneway => &self.collocated_oneway,
            BatchMode::Datagram => &self.collocated_datagram,
        }
    }

    pub(crate) fn queue_collocated_batch(
        &self,
        mode: BatchMode,
        request: RequestFrame,
    ) -> Result<()> {
        if !self.is_active() {
            return Err(self.inactive());
        }
        self.collocated_batch(mode).lock().push(request);
        Ok(())
    }

    /// Dispatch the queued collocated requests of `mode` in order; returns
    /// how many
    pub(crate) async fn flush_collocated_batch(&self, mode: BatchMode) -> usize {
        let requests = std::mem::take(&mut *self.collocated_batch(mode).lock());
        if requests.is_empty() {
            return 0;
        }
        let count = requests.len();
        self.stats.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        for request in requests {
            self.dispatch(request).await;
        }
        count
    }

    pub(crate) async fn flush_collocated_batches(&self) -> usize {
        self.flush_collocated_batch(BatchMode::Oneway).await
            + self.flush_collocated_batch(BatchMode::Datagram).await
    }

    pub(crate) fn deactivate(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        for listener in self.listeners.lock().drain(..) {
            listener.abort();
        }
        let dropped = [BatchMode::Oneway, BatchMode::Datagram]
            .into_iter()
            .map(|mode| std::mem::take(&mut *self.collocated_batch(mode).lock()).len())
            .sum::<usize>();
        if dropped > 0 {
            warn!(
                "Adapter `{}` discarded {} queued collocated batch requests",
                self.name, dropped
            );
        }
        info!("Object adapter `{}` deactivated", self.name);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "servant panicked".to_string()
    }
}

/// A set of servants reachable through listeners or collocated proxies
#[derive(Clone)]
pub struct ObjectAdapter {
    shared: Arc<AdapterShared>,
}

impl ObjectAdapter {
    pub(crate) fn new(instance: Arc<Instance>, name: &str, adapter_id: Option<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(AdapterShared {
                name: name.to_string(),
                adapter_id: adapter_id.filter(|id| !id.is_empty()),
                instance,
                servants: RwLock::new(HashMap::new()),
                endpoints: RwLock::new(Vec::new()),
                active: AtomicBool::new(true),
                shutdown,
                listeners: Mutex::new(Vec::new()),
                collocated_oneway: Mutex::new(Vec::new()),
                collocated_datagram: Mutex::new(Vec::new()),
                stats: AdapterStats::default(),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<AdapterShared> {
        &self.shared
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn adapter_id(&self) -> Option<&str> {
        self.shared.adapter_id.as_deref()
    }

    pub fn stats(&self) -> &AdapterStats {
        &self.shared.stats
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Register `servant` under `identity` and return a proxy for it
    pub fn add(&self, servant: Arc<dyn Servant>, identity: Identity) -> Result<ObjectPrx> {
        self.add_facet(servant, identity, "")
    }

    pub fn add_facet(
        &self,
        servant: Arc<dyn Servant>,
        identity: Identity,
        facet: &str,
    ) -> Result<ObjectPrx> {
        if !self.shared.is_active() {
            return Err(self.shared.inactive());
        }
        {
            let mut servants = self.shared.servants.write();
            let key = (identity.clone(), facet.to_string());
            if servants.contains_key(&key) {
                return Err(RpcError::Adapter {
                    adapter: self.shared.name.clone(),
                    reason: format!("`{}` facet `{}` is already registered", identity, facet),
                });
            }
            servants.insert(key, servant);
        }
        debug!("Adapter `{}` added {} facet `{}`", self.shared.name, identity, facet);
        Ok(self.create_proxy(identity).ice_facet(facet))
    }

    pub fn remove(&self, identity: &Identity) -> Option<Arc<dyn Servant>> {
        self.remove_facet(identity, "")
    }

    pub fn remove_facet(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        self.shared
            .servants
            .write()
            .remove(&(identity.clone(), facet.to_string()))
    }

    pub fn find(&self, identity: &Identity) -> Option<Arc<dyn Servant>> {
        self.shared.servant(identity, "")
    }

    pub fn find_facet(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        self.shared.servant(identity, facet)
    }

    /// Start listening on `endpoint` (port 0 picks a free port) and
    /// publish the bound endpoint
    pub async fn listen(&self, endpoint: &str) -> Result<Endpoint> {
        let requested: Endpoint = endpoint.parse()?;
        if !self.shared.is_active() {
            return Err(self.shared.inactive());
        }
        let listen_failed = |e: &dyn std::fmt::Display| RpcError::Adapter {
            adapter: self.shared.name.clone(),
            reason: format!("cannot listen on {}: {}", requested, e),
        };

        let (published, task) = match requested.kind {
            TransportKind::Tcp => {
                let listener = TcpListener::bind(requested.address())
                    .await
                    .map_err(|e| listen_failed(&e))?;
                let local = listener.local_addr().map_err(|e| listen_failed(&e))?;
                let published = Endpoint {
                    port: local.port(),
                    ..requested.clone()
                };
                let task = tokio::spawn(accept_loop(
                    self.shared.clone(),
                    listener,
                    self.shared.shutdown.subscribe(),
                ));
                (published, task)
            }
            TransportKind::Udp => {
                let transport = UdpFrameTransport::bind(requested.address())
                    .await
                    .map_err(|e| listen_failed(&e))?;
                let local = transport.local_addr().map_err(|e| listen_failed(&e))?;
                let published = Endpoint {
                    port: local.port(),
                    ..requested.clone()
                };
                let task = tokio::spawn(serve_datagrams(
                    self.shared.clone(),
                    transport,
                    self.shared.shutdown.subscribe(),
                ));
                (published, task)
            }
            TransportKind::Ssl => {
                return Err(RpcError::Adapter {
                    adapter: self.shared.name.clone(),
                    reason: "ssl transport is not available".to_string(),
                })
            }
        };

        info!("Object adapter `{}` listening on {}", self.shared.name, published);
        self.shared.listeners.lock().push(task);
        self.shared.endpoints.write().push(published.clone());
        Ok(published)
    }

    /// Published endpoints, in listen order
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.shared.endpoints.read().clone()
    }

    /// Proxy for `identity`: indirect when the adapter has an id, direct
    /// over the published endpoints otherwise
    pub fn create_proxy(&self, identity: Identity) -> ObjectPrx {
        let instance = &self.shared.instance;
        let config = &instance.config;
        let base = Reference::new(identity)
            .with_timeout(config.default_timeout)
            .with_collocation_optimized(config.collocation_optimized)
            .with_context(config.default_context.clone());
        let reference = match &self.shared.adapter_id {
            Some(adapter_id) => base.with_adapter_id(Some(adapter_id.clone())),
            None => base.with_endpoints(self.endpoints()),
        };
        ObjectPrx::new(reference, instance.clone())
    }

    /// Stop listening and close every accepted connection
    pub fn deactivate(&self) {
        self.shared.deactivate();
    }
}

impl std::fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("name", &self.shared.name)
            .field("adapter_id", &self.shared.adapter_id)
            .field("endpoints", &self.endpoints())
            .field("active", &self.is_active())
            .finish()
    }
}

async fn accept_loop(
    shared: Arc<AdapterShared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => return,

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Adapter `{}` accept failed: {}", shared.name, e);
                        continue;
                    }
                };
                shared.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                debug!("Adapter `{}` accepted connection from {}", shared.name, peer);

                let shared = shared.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    match serve_connection(shared, stream, shutdown).await {
                        Ok(()) | Err(WireError::ConnectionClosed) => {
                            debug!("Connection from {} closed", peer)
                        }
                        Err(e) => warn!("Connection error from {}: {}", peer, e),
                    }
                });
            }
        }
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<FrameTransport<tokio::net::tcp::OwnedWriteHalf>>>;

async fn serve_connection(
    shared: Arc<AdapterShared>,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> objrpc_wire::Result<()> {
    let max_message_size = shared.instance.config.max_message_size;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut reader = FrameTransport::new(reader).with_max_message_size(max_message_size);
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(
        FrameTransport::new(writer).with_max_message_size(max_message_size),
    ));

    writer
        .lock()
        .await
        .write_frame_encoded(&Frame::ValidateConnection)
        .await?;

    loop {
        if *shutdown.borrow() {
            let _ = writer
                .lock()
                .await
                .write_frame_encoded(&Frame::CloseConnection)
                .await;
            return Ok(());
        }

        let data = tokio::select! {
            _ = shutdown.changed() => continue,
            data = reader.read_frame() => data?,
        };

        match Frame::decode(&data)? {
            Frame::Request(request) if request.mode.is_twoway() && request.request_id != 0 => {
                let shared = shared.clone();
                let writer = writer.clone();
                tokio::spawn(async move {
                    let request_id = request.request_id;
                    let outcome = shared.dispatch(request).await;
                    let reply = ReplyFrame::new(request_id, outcome).encode();
                    if let Err(e) = writer.lock().await.write_frame(&reply).await {
                        debug!("Reply {} not delivered: {}", request_id, e);
                    }
                });
            }
            Frame::Request(request) => {
                shared.dispatch(request).await;
            }
            Frame::BatchRequest(batch) => {
                shared.stats.batches_dispatched.fetch_add(1, Ordering::Relaxed);
                trace!("Dispatching batch of {} requests", batch.requests.len());
                for request in batch.requests {
                    shared.dispatch(request).await;
                }
            }
            Frame::ValidateConnection => {}
            Frame::CloseConnection => return Ok(()),
            Frame::Reply(_) => return Err(WireError::InvalidMessageType(MessageType::Reply as u8)),
        }
    }
}

async fn serve_datagrams(
    shared: Arc<AdapterShared>,
    mut transport: UdpFrameTransport,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let received: objrpc_wire::Result<(Bytes, SocketAddr)> = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            received = transport.recv_from() => received,
        };
        let (data, peer) = match received {
            Ok(received) => received,
            Err(e) => {
                debug!("Adapter `{}` dropped datagram: {}", shared.name, e);
                continue;
            }
        };
        shared.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);

        match Frame::decode(&data) {
            Ok(Frame::Request(request)) => {
                shared.dispatch(request).await;
            }
            Ok(Frame::BatchRequest(batch)) => {
                shared.stats.batches_dispatched.fetch_add(1, Ordering::Relaxed);
                for request in batch.requests {
                    shared.dispatch(request).await;
                }
            }
            Ok(other) => debug!(
                "Ignoring {:?} datagram from {}",
                other.message_type(),
                peer
            ),
            Err(e) => debug!("Bad datagram from {}: {}", peer, e),
        }
    }
}
