//! Shared fixtures for the integration tests
//!
//! A test server runs an object adapter with:
//! - `test`: a `MyDerivedClass` servant
//! - `context`: a `TestCheckedCast` servant that records the context of
//!   the last `ice_isA` it answered
//!
//! listening on loopback TCP and UDP (ports picked by the OS).

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use objrpc::{
    define_proxy, Communicator, Context, Current, DispatchError, DispatchFuture, DispatchResult,
    Endpoint, Identity, ObjectAdapter, ObjectPrx, Result, RpcError, Servant,
};
use objrpc_wire::encoding::{get_context, get_i32, get_string, put_context, put_i32, put_string};
use objrpc_wire::WireError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::Once;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a log subscriber once per test binary. `RUST_LOG` overrides
/// the default `warn` level.
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub const MY_CLASS_ID: &str = "::Test::MyClass";
pub const MY_DERIVED_CLASS_ID: &str = "::Test::MyDerivedClass";
pub const TEST_CHECKED_CAST_ID: &str = "::Test::TestCheckedCast";

/// Payload of the user exception raised by `opUserException`
pub const SOME_EXCEPTION: &str = "::Test::SomeException";

fn bad_params(e: WireError) -> DispatchError {
    DispatchError::Unknown(format!("bad parameters: {}", e))
}

fn bad_results(e: WireError) -> RpcError {
    RpcError::Protocol(format!("bad results: {}", e))
}

pub fn encode_i32(value: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    put_i32(&mut buf, value);
    buf.freeze()
}

pub fn encode_strings(values: &[&str]) -> Bytes {
    let mut buf = BytesMut::new();
    for value in values {
        put_string(&mut buf, value);
    }
    buf.freeze()
}

pub fn encode_context(context: &Context) -> Bytes {
    let mut buf = BytesMut::new();
    put_context(&mut buf, context);
    buf.freeze()
}

/// Servant for `::Test::MyClass`, or `::Test::MyDerivedClass` when
/// created with [`MyClassI::derived`]
pub struct MyClassI {
    derived: bool,
    /// Sequence numbers received by `opByteSOneway`, in dispatch order
    pub oneways: Mutex<Vec<i32>>,
}

impl MyClassI {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            derived: false,
            oneways: Mutex::new(Vec::new()),
        })
    }

    pub fn derived() -> Arc<Self> {
        Arc::new(Self {
            derived: true,
            oneways: Mutex::new(Vec::new()),
        })
    }

    pub fn oneways(&self) -> Vec<i32> {
        self.oneways.lock().clone()
    }

    async fn handle(&self, current: Current, mut params: Bytes) -> DispatchResult {
        match current.operation.as_str() {
            "opVoid" => Ok(Bytes::new()),
            "opDerived" if self.derived => Ok(Bytes::new()),
            "opString" => {
                let p1 = get_string(&mut params).map_err(bad_params)?;
                let p2 = get_string(&mut params).map_err(bad_params)?;
                let r = format!("{} {}", p1, p2);
                let p3 = format!("{} {}", p2, p1);
                Ok(encode_strings(&[r.as_str(), p3.as_str()]))
            }
            "opSleep" => {
                let ms = get_i32(&mut params).map_err(bad_params)?;
                tokio::time::sleep(Duration::from_millis(ms.max(0) as u64)).await;
                Ok(Bytes::new())
            }
            "opContext" => Ok(encode_context(&current.context)),
            "opUserException" => Err(DispatchError::User(encode_strings(&[SOME_EXCEPTION]))),
            "opByteSOneway" => {
                let seq = get_i32(&mut params).map_err(bad_params)?;
                self.oneways.lock().push(seq);
                Ok(Bytes::new())
            }
            _ => Err(DispatchError::OperationNotExist),
        }
    }
}

impl Servant for MyClassI {
    fn type_ids(&self) -> &[&'static str] {
        if self.derived {
            &[MY_DERIVED_CLASS_ID, MY_CLASS_ID]
        } else {
            &[MY_CLASS_ID]
        }
    }

    fn dispatch(self: Arc<Self>, current: Current, params: Bytes) -> DispatchFuture {
        Box::pin(async move { self.handle(current, params).await })
    }
}

/// Servant that answers `getContext` with the context of the last
/// `ice_isA` request
#[derive(Default)]
pub struct TestCheckedCastI {
    context: Mutex<Context>,
}

impl Servant for TestCheckedCastI {
    fn type_ids(&self) -> &[&'static str] {
        &[TEST_CHECKED_CAST_ID]
    }

    fn dispatch(self: Arc<Self>, current: Current, _params: Bytes) -> DispatchFuture {
        Box::pin(async move {
            match current.operation.as_str() {
                "getContext" => Ok(encode_context(&self.context.lock())),
                _ => Err(DispatchError::OperationNotExist),
            }
        })
    }

    fn ice_is_a(&self, type_id: &str, current: &Current) -> bool {
        *self.context.lock() = current.context.clone();
        type_id == TEST_CHECKED_CAST_ID || type_id == objrpc::OBJECT_TYPE_ID
    }
}

define_proxy!(pub MyClassPrx => MY_CLASS_ID);
define_proxy!(pub MyDerivedClassPrx => MY_DERIVED_CLASS_ID);
define_proxy!(pub TestCheckedCastPrx => TEST_CHECKED_CAST_ID);

/// Operations of `::Test::MyClass`
#[async_trait]
pub trait MyClassOps: AsRef<ObjectPrx> + Sync {
    async fn op_void(&self) -> Result<()> {
        self.as_ref().invoke("opVoid", Bytes::new()).await.map(|_| ())
    }

    async fn op_string(&self, p1: &str, p2: &str) -> Result<(String, String)> {
        let mut results = self
            .as_ref()
            .invoke("opString", encode_strings(&[p1, p2]))
            .await?;
        let r = get_string(&mut results).map_err(bad_results)?;
        let p3 = get_string(&mut results).map_err(bad_results)?;
        Ok((r, p3))
    }

    async fn op_sleep(&self, ms: i32) -> Result<()> {
        self.as_ref()
            .invoke("opSleep", encode_i32(ms))
            .await
            .map(|_| ())
    }

    async fn op_context(&self) -> Result<Context> {
        let mut results = self.as_ref().invoke("opContext", Bytes::new()).await?;
        get_context(&mut results).map_err(bad_results)
    }

    async fn op_user_exception(&self) -> Result<()> {
        self.as_ref()
            .invoke("opUserException", Bytes::new())
            .await
            .map(|_| ())
    }

    async fn op_byte_s_oneway(&self, seq: i32) -> Result<()> {
        self.as_ref()
            .invoke("opByteSOneway", encode_i32(seq))
            .await
            .map(|_| ())
    }
}

impl MyClassOps for MyClassPrx {}
impl MyClassOps for MyDerivedClassPrx {}

impl MyDerivedClassPrx {
    pub async fn op_derived(&self) -> Result<()> {
        self.invoke("opDerived", Bytes::new()).await.map(|_| ())
    }
}

impl TestCheckedCastPrx {
    pub async fn get_context(&self) -> Result<Context> {
        let mut results = self.invoke("getContext", Bytes::new()).await?;
        get_context(&mut results).map_err(bad_results)
    }
}

/// A server communicator with the standard test objects
pub struct TestServer {
    pub communicator: Communicator,
    pub adapter: ObjectAdapter,
    pub tcp: Endpoint,
    pub udp: Endpoint,
    pub servant: Arc<MyClassI>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_id(None).await
    }

    /// Server whose adapter is registered as `adapter_id` (proxies it
    /// creates are indirect)
    pub async fn start_with_id(adapter_id: Option<&str>) -> Self {
        let communicator = Communicator::new().unwrap();
        let adapter = match adapter_id {
            Some(id) => communicator
                .create_object_adapter_with_id("TestAdapter", id)
                .unwrap(),
            None => communicator.create_object_adapter("TestAdapter").unwrap(),
        };
        let tcp = adapter.listen("tcp -h 127.0.0.1 -p 0").await.unwrap();
        let udp = adapter.listen("udp -h 127.0.0.1 -p 0").await.unwrap();

        let servant = MyClassI::derived();
        adapter.add(servant.clone(), Identity::new("test")).unwrap();
        adapter
            .add(Arc::new(TestCheckedCastI::default()), Identity::new("context"))
            .unwrap();
        info!("Test server listening on {} and {}", tcp, udp);

        Self {
            communicator,
            adapter,
            tcp,
            udp,
            servant,
        }
    }

    /// Reference text for `identity` over TCP with a 10s endpoint timeout
    pub fn reference(&self, identity: &str) -> String {
        format!("{}:tcp -h 127.0.0.1 -p {} -t 10000", identity, self.tcp.port)
    }

    /// Reference text for `identity` over TCP and UDP
    pub fn reference_with_udp(&self, identity: &str) -> String {
        format!(
            "{}:udp -h 127.0.0.1 -p {}",
            self.reference(identity),
            self.udp.port
        )
    }

    pub async fn shutdown(self) {
        self.adapter.deactivate();
        self.communicator.destroy().await;
    }
}

/// A client communicator separate from the server's, so calls go over
/// the network
pub fn client() -> Communicator {
    Communicator::new().unwrap()
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
