//! Proxies
//!
//! An [`ObjectPrx`] is an immutable handle on a remote object: a shared
//! [`Reference`] plus the communicator it belongs to. Every `ice_*`
//! mutator returns a new proxy and leaves the original untouched.
//!
//! Typed proxies are thin wrappers generated with [`define_proxy!`]; they
//! are narrowed from an `ObjectPrx` with a checked cast (the server
//! confirms the type with `ice_isA`) or an unchecked cast (no remote
//! call).

use crate::batch::BatchMode;
use crate::communicator::{Communicator, Instance};
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use crate::invocation;
use crate::reference::Reference;
use bytes::{Bytes, BytesMut};
use objrpc_wire::encoding::{get_bool, get_string, get_string_seq, put_string};
use objrpc_wire::{Context, Identity, InvocationMode};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Base proxy for any remote object
#[derive(Clone)]
pub struct ObjectPrx {
    reference: Arc<Reference>,
    instance: Arc<Instance>,
}

impl ObjectPrx {
    pub(crate) fn new(reference: Reference, instance: Arc<Instance>) -> Self {
        Self {
            reference: Arc::new(reference),
            instance,
        }
    }

    fn derive(&self, reference: Reference) -> Self {
        Self::new(reference, self.instance.clone())
    }

    pub fn ice_get_reference(&self) -> &Reference {
        &self.reference
    }

    pub fn ice_communicator(&self) -> Communicator {
        Communicator::from_instance(self.instance.clone())
    }

    pub fn ice_get_identity(&self) -> &Identity {
        &self.reference.identity
    }

    pub fn ice_get_facet(&self) -> &str {
        &self.reference.facet
    }

    pub fn ice_get_adapter_id(&self) -> Option<&str> {
        self.reference.adapter_id.as_deref()
    }

    pub fn ice_get_endpoints(&self) -> &[Endpoint] {
        &self.reference.endpoints
    }

    pub fn ice_get_timeout(&self) -> Option<Duration> {
        self.reference.timeout
    }

    pub fn ice_get_context(&self) -> &Context {
        &self.reference.context
    }

    pub fn ice_get_mode(&self) -> InvocationMode {
        self.reference.mode
    }

    pub fn ice_is_twoway(&self) -> bool {
        self.reference.mode == InvocationMode::Twoway
    }

    pub fn ice_is_oneway(&self) -> bool {
        self.reference.mode == InvocationMode::Oneway
    }

    pub fn ice_is_batch_oneway(&self) -> bool {
        self.reference.mode == InvocationMode::BatchOneway
    }

    pub fn ice_is_datagram(&self) -> bool {
        self.reference.mode == InvocationMode::Datagram
    }

    pub fn ice_is_batch_datagram(&self) -> bool {
        self.reference.mode == InvocationMode::BatchDatagram
    }

    pub fn ice_is_secure(&self) -> bool {
        self.reference.secure
    }

    pub fn ice_is_collocation_optimized(&self) -> bool {
        self.reference.collocation_optimized
    }

    pub fn ice_identity(&self, identity: Identity) -> Self {
        self.derive(self.reference.with_identity(identity))
    }

    pub fn ice_facet(&self, facet: &str) -> Self {
        self.derive(self.reference.with_facet(facet))
    }

    /// Make the proxy indirect; an empty id clears it
    pub fn ice_adapter_id(&self, adapter_id: &str) -> Self {
        self.derive(self.reference.with_adapter_id(Some(adapter_id.to_string())))
    }

    pub fn ice_endpoints(&self, endpoints: Vec<Endpoint>) -> Self {
        self.derive(self.reference.with_endpoints(endpoints))
    }

    pub fn ice_mode(&self, mode: InvocationMode) -> Self {
        self.derive(self.reference.with_mode(mode))
    }

    pub fn ice_twoway(&self) -> Self {
        self.ice_mode(InvocationMode::Twoway)
    }

    pub fn ice_oneway(&self) -> Self {
        self.ice_mode(InvocationMode::Oneway)
    }

    pub fn ice_batch_oneway(&self) -> Self {
        self.ice_mode(InvocationMode::BatchOneway)
    }

    pub fn ice_datagram(&self) -> Self {
        self.ice_mode(InvocationMode::Datagram)
    }

    pub fn ice_batch_datagram(&self) -> Self {
        self.ice_mode(InvocationMode::BatchDatagram)
    }

    pub fn ice_secure(&self, secure: bool) -> Self {
        self.derive(self.reference.with_secure(secure))
    }

    pub fn ice_collocation_optimized(&self, enabled: bool) -> Self {
        self.derive(self.reference.with_collocation_optimized(enabled))
    }

    /// Per-call timeout; `None` waits indefinitely
    pub fn ice_timeout(&self, timeout: impl Into<Option<Duration>>) -> Self {
        self.derive(self.reference.with_timeout(timeout.into()))
    }

    /// Context sent with every request made through the new proxy
    pub fn ice_context(&self, context: Context) -> Self {
        self.derive(self.reference.with_context(context))
    }

    pub fn ice_to_string(&self) -> String {
        self.reference.to_string()
    }

    /// Invoke `operation` with marshaled `params`; returns the marshaled
    /// results (empty for anything but twoway)
    pub async fn invoke(&self, operation: &str, params: Bytes) -> Result<Bytes> {
        invocation::invoke(&self.instance, &self.reference, operation, params, None).await
    }

    /// Invoke with an explicit context replacing the proxy's own
    pub async fn invoke_with_context(
        &self,
        operation: &str,
        params: Bytes,
        context: &Context,
    ) -> Result<Bytes> {
        invocation::invoke(
            &self.instance,
            &self.reference,
            operation,
            params,
            Some(context),
        )
        .await
    }

    /// Start an invocation in the background
    pub fn begin_invoke(&self, operation: &str, params: Bytes) -> AsyncResult {
        self.spawn_invoke(operation, params, None)
    }

    pub fn begin_invoke_with_context(
        &self,
        operation: &str,
        params: Bytes,
        context: Context,
    ) -> AsyncResult {
        self.spawn_invoke(operation, params, Some(context))
    }

    fn spawn_invoke(&self, operation: &str, params: Bytes, context: Option<Context>) -> AsyncResult {
        let proxy = self.clone();
        let op = operation.to_string();
        let handle = self.instance.runtime.spawn(async move {
            invocation::invoke(&proxy.instance, &proxy.reference, &op, params, context.as_ref())
                .await
        });
        AsyncResult {
            operation: operation.to_string(),
            handle,
        }
    }

    /// Start an invocation and run `callback` with its outcome on
    /// completion
    pub fn invoke_with_callback<F>(&self, operation: &str, params: Bytes, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        let proxy = self.clone();
        let op = operation.to_string();
        self.instance.runtime.spawn(async move {
            let result = proxy.invoke(&op, params).await;
            callback(result);
        })
    }

    /// Invoke and block the calling thread until the outcome is known.
    ///
    /// Must not be called from an async task; use `spawn_blocking` or a
    /// plain thread.
    pub fn invoke_blocking(&self, operation: &str, params: Bytes) -> Result<Bytes> {
        self.begin_invoke(operation, params).wait()
    }

    /// Check that the object exists
    pub async fn ice_ping(&self) -> Result<()> {
        self.invoke("ice_ping", Bytes::new()).await.map(|_| ())
    }

    /// Whether the object implements `type_id`. Always sent twoway.
    pub async fn ice_is_a(&self, type_id: &str) -> Result<bool> {
        self.is_a(type_id, None).await
    }

    pub async fn ice_is_a_with_context(&self, type_id: &str, context: &Context) -> Result<bool> {
        self.is_a(type_id, Some(context)).await
    }

    async fn is_a(&self, type_id: &str, context: Option<&Context>) -> Result<bool> {
        let mut params = BytesMut::new();
        put_string(&mut params, type_id);
        let mut results = self
            .twoway_call("ice_isA", params.freeze(), context)
            .await?;
        get_bool(&mut results).map_err(|e| RpcError::Protocol(e.to_string()))
    }

    /// Type ids of the object, sorted
    pub async fn ice_ids(&self) -> Result<Vec<String>> {
        let mut results = self.twoway_call("ice_ids", Bytes::new(), None).await?;
        get_string_seq(&mut results).map_err(|e| RpcError::Protocol(e.to_string()))
    }

    /// Most derived type id of the object
    pub async fn ice_id(&self) -> Result<String> {
        let mut results = self.twoway_call("ice_id", Bytes::new(), None).await?;
        get_string(&mut results).map_err(|e| RpcError::Protocol(e.to_string()))
    }

    async fn twoway_call(
        &self,
        operation: &str,
        params: Bytes,
        context: Option<&Context>,
    ) -> Result<Bytes> {
        let twoway;
        let reference = if self.reference.mode.is_twoway() {
            self.reference.as_ref()
        } else {
            twoway = self.reference.with_mode(InvocationMode::Twoway);
            &twoway
        };
        invocation::invoke(&self.instance, reference, operation, params, context).await
    }

    /// Connection this proxy's requests use, established if needed
    pub async fn ice_get_connection(&self) -> Result<Arc<Connection>> {
        self.instance.check_alive()?;
        invocation::connection_for(&self.instance, &self.reference).await
    }

    /// Send the batch queue this proxy's requests accumulate in
    pub async fn ice_flush_batch_requests(&self) -> Result<()> {
        self.instance.check_alive()?;
        if self.reference.collocation_optimized {
            if let Some(adapter) = self.instance.find_collocated(&self.reference) {
                match BatchMode::of(self.reference.mode) {
                    Some(mode) => adapter.flush_collocated_batch(mode).await,
                    None => adapter.flush_collocated_batches().await,
                };
                return Ok(());
            }
        }
        let connection = invocation::connection_for(&self.instance, &self.reference).await?;
        match BatchMode::of(self.reference.mode) {
            Some(mode) => connection.flush_batch(mode).await?,
            None => connection.flush_batches().await?,
        };
        Ok(())
    }
}

/// Proxies compare equal when they address the same object: identity,
/// facet, adapter id and endpoints. Mode, timeout, security and context
/// do not matter.
impl PartialEq for ObjectPrx {
    fn eq(&self, other: &Self) -> bool {
        self.reference.same_object(&other.reference)
    }
}

impl Eq for ObjectPrx {}

impl Hash for ObjectPrx {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.reference.identity.hash(state);
        self.reference.facet.hash(state);
        self.reference.adapter_id.hash(state);
        self.reference.endpoints.hash(state);
    }
}

impl fmt::Display for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.reference.fmt(f)
    }
}

impl fmt::Debug for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectPrx")
            .field(&self.reference.to_string())
            .finish()
    }
}

/// Handle on a background invocation
///
/// Await it from async code or call [`AsyncResult::wait`] from a
/// blocking thread.
pub struct AsyncResult {
    operation: String,
    handle: JoinHandle<Result<Bytes>>,
}

impl AsyncResult {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn is_completed(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abandon the invocation. A request already sent is not recalled.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Block the calling thread until the outcome is known
    pub fn wait(self) -> Result<Bytes> {
        futures::executor::block_on(self)
    }
}

impl Future for AsyncResult {
    type Output = Result<Bytes>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(RpcError::Unknown(format!(
                "`{}` was cancelled",
                this.operation
            ))),
            Err(e) => Err(RpcError::Unknown(e.to_string())),
        })
    }
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("operation", &self.operation)
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// A proxy narrowed to an interface
pub trait TypedProxy: Sized {
    /// Type id checked by `ice_isA`
    const TYPE_ID: &'static str;

    fn from_object_unchecked(proxy: ObjectPrx) -> Self;

    fn as_object(&self) -> &ObjectPrx;
}

impl TypedProxy for ObjectPrx {
    const TYPE_ID: &'static str = crate::adapter::OBJECT_TYPE_ID;

    fn from_object_unchecked(proxy: ObjectPrx) -> Self {
        proxy
    }

    fn as_object(&self) -> &ObjectPrx {
        self
    }
}

/// Narrow `proxy` after asking the object whether it implements
/// `P::TYPE_ID`. `Ok(None)` means it does not.
pub async fn checked_cast<P: TypedProxy>(proxy: &ObjectPrx) -> Result<Option<P>> {
    narrow(proxy, None).await
}

/// Checked cast whose `ice_isA` request carries `context`
pub async fn checked_cast_with_context<P: TypedProxy>(
    proxy: &ObjectPrx,
    context: &Context,
) -> Result<Option<P>> {
    narrow(proxy, Some(context)).await
}

/// Checked cast to a facet of the target; a missing facet yields `None`
pub async fn checked_cast_facet<P: TypedProxy>(proxy: &ObjectPrx, facet: &str) -> Result<Option<P>> {
    match narrow(&proxy.ice_facet(facet), None).await {
        Err(RpcError::FacetNotExist { .. }) => Ok(None),
        other => other,
    }
}

/// Narrow without contacting the object
pub fn unchecked_cast<P: TypedProxy>(proxy: &ObjectPrx) -> P {
    P::from_object_unchecked(proxy.clone())
}

async fn narrow<P: TypedProxy>(proxy: &ObjectPrx, context: Option<&Context>) -> Result<Option<P>> {
    if proxy.is_a(P::TYPE_ID, context).await? {
        Ok(Some(P::from_object_unchecked(proxy.clone())))
    } else {
        Ok(None)
    }
}

/// Define a typed proxy for an interface.
///
/// The generated type derefs to [`ObjectPrx`], compares equal to any
/// proxy for the same object, and has associated cast functions.
/// Operations are added with a plain `impl` block.
///
/// ```ignore
/// objrpc::define_proxy!(pub HelloPrx => "::Demo::Hello");
///
/// impl HelloPrx {
///     pub async fn say_hello(&self) -> objrpc::Result<()> {
///         self.invoke("sayHello", bytes::Bytes::new()).await.map(|_| ())
///     }
/// }
/// ```
#[macro_export]
macro_rules! define_proxy {
    ($(#[$meta:meta])* $vis:vis $name:ident => $type_id:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash)]
        $vis struct $name($crate::ObjectPrx);

        impl $crate::TypedProxy for $name {
            const TYPE_ID: &'static str = $type_id;

            fn from_object_unchecked(proxy: $crate::ObjectPrx) -> Self {
                Self(proxy)
            }

            fn as_object(&self) -> &$crate::ObjectPrx {
                &self.0
            }
        }

        #[allow(dead_code)]
        impl $name {
            pub fn ice_static_id() -> &'static str {
                $type_id
            }

            pub async fn checked_cast(
                proxy: &$crate::ObjectPrx,
            ) -> $crate::Result<::std::option::Option<Self>> {
                $crate::checked_cast(proxy).await
            }

            pub async fn checked_cast_with_context(
                proxy: &$crate::ObjectPrx,
                context: &$crate::Context,
            ) -> $crate::Result<::std::option::Option<Self>> {
                $crate::checked_cast_with_context(proxy, context).await
            }

            pub async fn checked_cast_facet(
                proxy: &$crate::ObjectPrx,
                facet: &str,
            ) -> $crate::Result<::std::option::Option<Self>> {
                $crate::checked_cast_facet(proxy, facet).await
            }

            pub fn unchecked_cast(proxy: &$crate::ObjectPrx) -> Self {
                $crate::unchecked_cast(proxy)
            }

            pub fn into_object(self) -> $crate::ObjectPrx {
                self.0
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = $crate::ObjectPrx;

            fn deref(&self) -> &$crate::ObjectPrx {
                &self.0
            }
        }

        impl ::std::convert::AsRef<$crate::ObjectPrx> for $name {
            fn as_ref(&self) -> &$crate::ObjectPrx {
                &self.0
            }
        }

        impl ::std::cmp::PartialEq<$crate::ObjectPrx> for $name {
            fn eq(&self, other: &$crate::ObjectPrx) -> bool {
                self.0 == *other
            }
        }

        impl ::std::cmp::PartialEq<$name> for $crate::ObjectPrx {
            fn eq(&self, other: &$name) -> bool {
                *self == other.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}
