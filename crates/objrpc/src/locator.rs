//! Indirect reference resolution
//!
//! References of the form `identity @ adapterId` carry no endpoints; a
//! [`Locator`] maps the adapter id to the endpoints the adapter listens on.

use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Resolves adapter ids to endpoints
#[async_trait]
pub trait Locator: Send + Sync {
    /// Endpoints of `adapter_id`; `NotRegistered` if unknown
    async fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Vec<Endpoint>>;
}

/// In-memory adapter registry
#[derive(Debug, Default)]
pub struct StaticLocator {
    adapters: RwLock<HashMap<String, Vec<Endpoint>>>,
}

impl StaticLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the endpoints of an adapter
    pub fn register(&self, adapter_id: impl Into<String>, endpoints: Vec<Endpoint>) {
        let adapter_id = adapter_id.into();
        debug!("Registering adapter `{}` with {} endpoints", adapter_id, endpoints.len());
        self.adapters.write().insert(adapter_id, endpoints);
    }

    pub fn unregister(&self, adapter_id: &str) -> bool {
        self.adapters.write().remove(adapter_id).is_some()
    }
}

#[async_trait]
impl Locator for StaticLocator {
    async fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Vec<Endpoint>> {
        self.adapters
            .read()
            .get(adapter_id)
            .cloned()
            .ok_or_else(|| RpcError::NotRegistered(adapter_id.to_string()))
    }
}
