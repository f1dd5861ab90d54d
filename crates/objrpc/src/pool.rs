//! Connection pool
//!
//! One connection per (transport, host, port). Concurrent first use of a
//! key coordinates on a single in-flight establishment: every resolver of
//! the key waits on the same `OnceCell`. Closed connections evict
//! themselves and the next use of the key reconnects.

use crate::connection::Connection;
use crate::connector::Connector;
use crate::endpoint::{Endpoint, TransportKind};
use crate::error::{Result, RpcError};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Pool key: transport (and so security), host and port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
}

impl ConnectionKey {
    pub fn of(endpoint: &Endpoint) -> Self {
        Self {
            kind: endpoint.kind,
            host: endpoint.host.clone(),
            port: endpoint.port,
        }
    }
}

/// Pool statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    pub connections_created: AtomicU64,
    pub connect_failures: AtomicU64,
    pub connections_closed: AtomicU64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub connections_created: u64,
    pub connect_failures: u64,
    pub connections_closed: u64,
}

type Slot = Arc<OnceCell<Arc<Connection>>>;

struct PoolShared {
    connector: Arc<dyn Connector>,
    max_message_size: usize,
    slots: Mutex<HashMap<ConnectionKey, Slot>>,
    stats: PoolStats,
}

impl PoolShared {
    /// Drop the slot for `key` if it still holds `slot`
    fn evict(&self, key: &ConnectionKey, slot: &Slot) {
        let mut slots = self.slots.lock();
        if slots.get(key).map_or(false, |current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }
}

/// Shared pool of client connections
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, max_message_size: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                connector,
                max_message_size,
                slots: Mutex::new(HashMap::new()),
                stats: PoolStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    /// Connection to the first reachable endpoint, in order. Only connect
    /// failures move on to the next endpoint.
    pub async fn get(&self, endpoints: &[Endpoint], secure: bool) -> Result<Arc<Connection>> {
        let mut last_err = None;
        for endpoint in endpoints {
            match self.get_for_endpoint(endpoint, secure).await {
                Ok(connection) => return Ok(connection),
                Err(err @ RpcError::ConnectFailed { .. }) => {
                    debug!("{}; trying next endpoint", err);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| RpcError::NoEndpoint(String::from("empty endpoint list"))))
    }

    /// Connection for one endpoint, established on first use
    pub async fn get_for_endpoint(
        &self,
        endpoint: &Endpoint,
        secure: bool,
    ) -> Result<Arc<Connection>> {
        let key = ConnectionKey::of(endpoint);
        loop {
            let slot = self
                .shared
                .slots
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let established = slot
                .get_or_try_init(|| self.establish(endpoint, secure, &key, &slot))
                .await;

            match established {
                Ok(connection) if !connection.is_closed() => return Ok(connection.clone()),
                Ok(_) => self.shared.evict(&key, &slot),
                Err(err) => {
                    self.shared.evict(&key, &slot);
                    return Err(err);
                }
            }
        }
    }

    async fn establish(
        &self,
        endpoint: &Endpoint,
        secure: bool,
        key: &ConnectionKey,
        slot: &Slot,
    ) -> Result<Arc<Connection>> {
        let shared = &self.shared;
        let connection = match Connection::establish(
            shared.connector.as_ref(),
            endpoint,
            secure,
            shared.max_message_size,
        )
        .await
        {
            Ok(connection) => connection,
            Err(err) => {
                shared.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        shared.stats.connections_created.fetch_add(1, Ordering::Relaxed);

        let weak_pool: Weak<PoolShared> = Arc::downgrade(shared);
        let weak_slot = Arc::downgrade(slot);
        let key = key.clone();
        connection.set_on_close(move || {
            if let Some(pool) = weak_pool.upgrade() {
                pool.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                if let Some(slot) = weak_slot.upgrade() {
                    pool.evict(&key, &slot);
                }
            }
        });
        Ok(connection)
    }

    /// Open connections, in no particular order
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared
            .slots
            .lock()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .filter(|connection| !connection.is_closed())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Flush the batch queues of every open connection
    pub async fn flush_all(&self) -> Result<()> {
        let connections = self.connections();
        let results = join_all(connections.iter().map(|c| c.flush_batches())).await;
        for result in results {
            if let Err(err) = result {
                warn!("Batch flush failed: {}", err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Close every connection
    pub async fn close_all(&self, flush: bool) {
        let connections = self.connections();
        let results = join_all(connections.iter().map(|c| c.close(flush))).await;
        for (connection, result) in connections.iter().zip(results) {
            if let Err(err) = result {
                warn!("Closing {} failed: {}", connection.endpoint(), err);
            }
        }
        self.shared.slots.lock().clear();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connection_count())
            .finish()
    }
}
