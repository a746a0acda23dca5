//! Per-address connection pool

use crate::common::PoolConfig;
use crate::transport::Transport;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A borrowed connection. Dropping it without `release` frees the slot and
/// discards the connection.
pub struct Pooled<C> {
    key: String,
    conn: C,
    _permit: OwnedSemaphorePermit,
}

impl<C> Pooled<C> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn conn(&self) -> &C {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

#[async_trait]
pub trait ConnectionPool<C: Send + 'static>: Send + Sync {
    /// Wait (bounded) for a connection to `key`.
    async fn borrow(&self, key: &str) -> Result<Pooled<C>>;

    /// Hand a healthy connection back.
    async fn release(&self, conn: Pooled<C>);

    /// Close and forget a broken connection.
    async fn invalidate(&self, conn: Pooled<C>);
}

struct Slot<C> {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<C>>,
}

/// Pool keyed by `host:port`, opening connections through a [`Transport`]
pub struct KeyedPool<T: Transport> {
    transport: Arc<T>,
    config: PoolConfig,
    slots: Mutex<HashMap<String, Arc<Slot<T::Connection>>>>,
}

impl<T: Transport> KeyedPool<T> {
    pub fn new(transport: Arc<T>, config: PoolConfig) -> Self {
        Self {
            transport,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &str) -> Arc<Slot<T::Connection>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    permits: Arc::new(Semaphore::new(self.config.max_connections)),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Idle connections currently parked for `key`.
    pub fn idle_count(&self, key: &str) -> usize {
        self.slot(key)
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl<T: Transport> ConnectionPool<T::Connection> for KeyedPool<T> {
    async fn borrow(&self, key: &str) -> Result<Pooled<T::Connection>> {
        let slot = self.slot(key);
        let timeout = Duration::from_millis(self.config.acquire_timeout_ms);
        let permit = match tokio::time::timeout(timeout, slot.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::System(format!("pool for {} is closed", key))),
            Err(_) => {
                return Err(Error::PoolExhausted {
                    key: key.to_string(),
                    timeout_ms: self.config.acquire_timeout_ms,
                })
            }
        };

        // Test on borrow: stale idle connections are closed, not handed out.
        loop {
            let candidate = slot.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
            match candidate {
                Some(conn) if self.transport.is_open(&conn) => {
                    return Ok(Pooled {
                        key: key.to_string(),
                        conn,
                        _permit: permit,
                    })
                }
                Some(conn) => self.transport.close(conn).await,
                None => break,
            }
        }

        let conn = self.transport.connect(key).await?;
        Ok(Pooled {
            key: key.to_string(),
            conn,
            _permit: permit,
        })
    }

    async fn release(&self, pooled: Pooled<T::Connection>) {
        let Pooled { key, conn, _permit } = pooled;
        if !self.transport.is_open(&conn) {
            self.transport.close(conn).await;
            return;
        }
        self.slot(&key)
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
    }

    async fn invalidate(&self, pooled: Pooled<T::Connection>) {
        tracing::debug!(key = %pooled.key, "Discarding broken connection");
        self.transport.close(pooled.conn).await;
    }
}
