//! Bounded retries for coordination calls
//!
//! Each call is limited by the connection timeout. Connection losses and timeouts are
//! retried `retry_times` more times, `retry_interval` apart. Any other error is final.

use super::{ChildWatch, ConnectionState, CoordinationClient, CreateMode};
use crate::common::CoordinatorConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub call_timeout: Duration,
    pub retry_interval: Duration,
    pub retry_times: u32,
}

impl From<&CoordinatorConfig> for RetryPolicy {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            call_timeout: Duration::from_millis(config.connection_timeout_ms),
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            retry_times: config.retry_times,
        }
    }
}

pub struct RetryingClient {
    inner: Arc<dyn CoordinationClient>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn CoordinationClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn run<T, F, Fut>(&self, op: &str, path: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let err = match tokio::time::timeout(self.policy.call_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(Error::ConnectionLoss)) => Error::ConnectionLoss,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::warn!(
                        path = %path,
                        "{} timed out after {:?}",
                        op,
                        self.policy.call_timeout
                    );
                    Error::ConnectionLoss
                }
            };
            if attempt >= self.policy.retry_times {
                return Err(err);
            }
            attempt += 1;
            tracing::debug!(path = %path, attempt, "Retrying {}", op);
            tokio::time::sleep(self.policy.retry_interval).await;
        }
    }
}

#[async_trait]
impl CoordinationClient for RetryingClient {
    async fn exists(&self, path: &str) -> Result<bool> {
        self.run("exists", path, || self.inner.exists(path)).await
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
        self.run("create", path, || self.inner.create(path, data.clone(), mode))
            .await
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.run("set_data", path, || self.inner.set_data(path, data.clone()))
            .await
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.run("get_data", path, || self.inner.get_data(path)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.run("delete", path, || self.inner.delete(path)).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.run("children", path, || self.inner.children(path)).await
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.connection_events()
    }

    async fn watch_children(&self, path: &str) -> Result<ChildWatch> {
        self.run("watch_children", path, || self.inner.watch_children(path))
            .await
    }
}
