use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::error::EtlError;
use crate::services::warehouse::{Dialect, Warehouse, WarehouseConnection};

pub type WorkerId = usize;

/// A worker's dedicated connection. Only its owning worker locks it.
pub type ConnectionHandle = Arc<Mutex<Box<dyn WarehouseConnection>>>;

/// Connection-affinity pool: each worker identifier gets exactly one
/// connection, created on first acquisition and reused afterwards.
/// Connections are never shared between workers.
pub struct ConnectionPool {
    warehouse: Arc<dyn Warehouse>,
    connections: RwLock<HashMap<WorkerId, ConnectionHandle>>,
}

impl ConnectionPool {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            warehouse,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.warehouse.dialect()
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Get or create the connection for the given worker
    /// This method is safe to call concurrently from multiple tasks
    pub async fn acquire(&self, worker_id: WorkerId) -> Result<ConnectionHandle, EtlError> {
        // Fast path: check if connection already exists (read lock)
        {
            let connections = self.connections.read().await;
            if let Some(conn) = connections.get(&worker_id) {
                return Ok(conn.clone());
            }
        }

        // Connect outside the lock; only this worker ever creates its own entry
        tracing::debug!(
            "Opening connection for worker {} to {}",
            worker_id,
            self.warehouse.describe()
        );
        let conn: ConnectionHandle = Arc::new(Mutex::new(self.warehouse.connect().await?));

        let mut connections = self.connections.write().await;
        Ok(connections.entry(worker_id).or_insert(conn).clone())
    }

    /// Drop a worker's connection after a connection-level failure, so the
    /// next acquisition reconnects
    pub async fn invalidate(&self, worker_id: WorkerId) -> bool {
        let removed = self.connections.write().await.remove(&worker_id);
        match removed {
            Some(handle) => {
                if let Ok(conn) = Arc::try_unwrap(handle) {
                    if let Err(e) = conn.into_inner().close().await {
                        tracing::debug!("Discarded connection for worker {}: {}", worker_id, e);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Get the number of open connections
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Close every outstanding connection. Close failures are logged, not
    /// returned. Returns the number of connections closed cleanly.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<(WorkerId, ConnectionHandle)> =
            self.connections.write().await.drain().collect();

        let mut closed = 0;
        for (worker_id, handle) in drained {
            match Arc::try_unwrap(handle) {
                Ok(conn) => match conn.into_inner().close().await {
                    Ok(()) => closed += 1,
                    Err(e) => tracing::warn!("Failed to close connection for worker {}: {}", worker_id, e),
                },
                Err(_) => tracing::warn!(
                    "Connection for worker {} still in use at shutdown; dropping it",
                    worker_id
                ),
            }
        }

        tracing::info!("Connection pool shut down ({} connections closed)", closed);
        closed
    }
}
