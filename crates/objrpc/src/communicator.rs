//! Communicator: configuration and process-wide shared state
//!
//! A [`Communicator`] owns the connection pool, the locator and the
//! object adapters. Proxies created from it keep it alive.

use crate::adapter::{AdapterShared, ObjectAdapter};
use crate::connector::{Connector, TcpConnector};
use crate::error::{Result, RpcError};
use crate::locator::Locator;
use crate::pool::{ConnectionPool, PoolStatsSnapshot};
use crate::proxy::ObjectPrx;
use crate::reference::{Reference, ReferenceDefaults};
use objrpc_wire::{Context, DEFAULT_MAX_MESSAGE_SIZE};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Communicator configuration
#[derive(Clone, Debug)]
pub struct CommunicatorConfig {
    /// Call timeout for references parsed with no `-t` at all
    pub default_timeout: Option<Duration>,
    /// Collocation optimization for references parsed from strings
    pub collocation_optimized: bool,
    /// Order secure endpoints before non-secure ones
    pub prefer_secure: bool,
    /// Largest message sent or accepted, in bytes
    pub max_message_size: usize,
    /// Context carried by proxies parsed from strings
    pub default_context: Context,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            collocation_optimized: true,
            prefer_secure: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            default_context: Context::new(),
        }
    }
}

pub(crate) struct Instance {
    pub(crate) config: CommunicatorConfig,
    pub(crate) runtime: Handle,
    pub(crate) pool: ConnectionPool,
    locator: RwLock<Option<Arc<dyn Locator>>>,
    adapters: RwLock<Vec<Weak<AdapterShared>>>,
    destroyed: AtomicBool,
}

impl Instance {
    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(RpcError::CommunicatorDestroyed);
        }
        Ok(())
    }

    pub(crate) fn locator(&self) -> Option<Arc<dyn Locator>> {
        self.locator.read().clone()
    }

    pub(crate) fn reference_defaults(&self) -> ReferenceDefaults {
        ReferenceDefaults {
            timeout: self.config.default_timeout,
            collocation_optimized: self.config.collocation_optimized,
            context: self.config.default_context.clone(),
        }
    }

    pub(crate) fn register_adapter(&self, adapter: &Arc<AdapterShared>) {
        let mut adapters = self.adapters.write();
        adapters.retain(|a| a.strong_count() > 0);
        adapters.push(Arc::downgrade(adapter));
    }

    pub(crate) fn adapters(&self) -> Vec<Arc<AdapterShared>> {
        self.adapters
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Active in-process adapter hosting the target of `reference`
    pub(crate) fn find_collocated(&self, reference: &Reference) -> Option<Arc<AdapterShared>> {
        self.adapters()
            .into_iter()
            .find(|adapter| adapter.hosts(reference))
    }
}

/// Builder for [`Communicator`]
pub struct CommunicatorBuilder {
    config: CommunicatorConfig,
    connector: Option<Arc<dyn Connector>>,
    locator: Option<Arc<dyn Locator>>,
    runtime: Option<Handle>,
}

impl CommunicatorBuilder {
    pub fn new() -> Self {
        Self {
            config: CommunicatorConfig::default(),
            connector: None,
            locator: None,
            runtime: None,
        }
    }

    pub fn config(mut self, config: CommunicatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn collocation_optimized(mut self, enabled: bool) -> Self {
        self.config.collocation_optimized = enabled;
        self
    }

    pub fn prefer_secure(mut self, enabled: bool) -> Self {
        self.config.prefer_secure = enabled;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn default_context(mut self, context: Context) -> Self {
        self.config.default_context = context;
        self
    }

    /// Transport provider; defaults to [`TcpConnector`]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn locator(mut self, locator: Arc<dyn Locator>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Runtime for background work; defaults to the current one
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<Communicator> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| RpcError::Config(e.to_string()))?,
        };
        if self.config.max_message_size < objrpc_wire::HEADER_SIZE {
            return Err(RpcError::Config(format!(
                "max_message_size {} is smaller than a message header",
                self.config.max_message_size
            )));
        }

        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(TcpConnector::new().with_max_message_size(self.config.max_message_size))
        });
        let pool = ConnectionPool::new(connector, self.config.max_message_size);

        debug!("Communicator created: {:?}", self.config);
        Ok(Communicator {
            instance: Arc::new(Instance {
                config: self.config,
                runtime,
                pool,
                locator: RwLock::new(self.locator),
                adapters: RwLock::new(Vec::new()),
                destroyed: AtomicBool::new(false),
            }),
        })
    }
}

impl Default for CommunicatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point: turns strings into proxies and owns shared resources
#[derive(Clone)]
pub struct Communicator {
    pub(crate) instance: Arc<Instance>,
}

impl Communicator {
    /// Communicator with default configuration on the current runtime
    pub fn new() -> Result<Self> {
        CommunicatorBuilder::new().build()
    }

    pub fn builder() -> CommunicatorBuilder {
        CommunicatorBuilder::new()
    }

    pub(crate) fn from_instance(instance: Arc<Instance>) -> Self {
        Self { instance }
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.instance.config
    }

    /// Parse a reference string into a proxy
    pub fn string_to_proxy(&self, text: &str) -> Result<ObjectPrx> {
        self.instance.check_alive()?;
        let reference = Reference::parse_with(text, &self.instance.reference_defaults())?;
        Ok(ObjectPrx::new(reference, self.instance.clone()))
    }

    pub fn proxy_to_string(&self, proxy: &ObjectPrx) -> String {
        proxy.to_string()
    }

    pub fn set_locator(&self, locator: Option<Arc<dyn Locator>>) {
        *self.instance.locator.write() = locator;
    }

    pub fn locator(&self) -> Option<Arc<dyn Locator>> {
        self.instance.locator()
    }

    pub fn create_object_adapter(&self, name: &str) -> Result<ObjectAdapter> {
        self.create_adapter(name, None)
    }

    /// Adapter whose proxies are indirect, resolved through `adapter_id`
    pub fn create_object_adapter_with_id(
        &self,
        name: &str,
        adapter_id: &str,
    ) -> Result<ObjectAdapter> {
        self.create_adapter(name, Some(adapter_id.to_string()))
    }

    fn create_adapter(&self, name: &str, adapter_id: Option<String>) -> Result<ObjectAdapter> {
        self.instance.check_alive()?;
        let adapter = ObjectAdapter::new(self.instance.clone(), name, adapter_id);
        self.instance.register_adapter(adapter.shared());
        Ok(adapter)
    }

    /// Flush the batch queues of every connection and collocated adapter
    pub async fn flush_batch_requests(&self) -> Result<()> {
        self.instance.check_alive()?;
        for adapter in self.instance.adapters() {
            adapter.flush_collocated_batches().await;
        }
        self.instance.pool.flush_all().await
    }

    /// Deactivate adapters and close every connection. Later invocations
    /// fail with `CommunicatorDestroyed`.
    pub async fn destroy(&self) {
        if self.instance.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        for adapter in self.instance.adapters() {
            adapter.deactivate();
        }
        self.instance.pool.close_all(false).await;
        info!("Communicator destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.instance.destroyed.load(Ordering::Acquire)
    }

    pub fn pool_stats(&self) -> PoolStatsSnapshot {
        self.instance.pool.stats().snapshot()
    }

    /// Open pooled connections
    pub fn connection_count(&self) -> usize {
        self.instance.pool.connection_count()
    }
}

impl PartialEq for Communicator {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.instance, &other.instance)
    }
}

impl Eq for Communicator {}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("config", &self.instance.config)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
