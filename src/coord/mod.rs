//! Coordination store client
//!
//! Registrars talk to the tree only through [`CoordinationClient`]. The in-process
//! [`memory`] store implements it for single-process deployments and tests.

pub mod memory;
pub mod retry;

use crate::common::CoordinatorConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub use memory::{JournalEntry, MemorySession, MemoryTree, TreeOp};
pub use retry::{RetryPolicy, RetryingClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed when the owning session expires
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Suspended,
    Lost,
    Reconnected,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEventKind {
    Added,
    Removed,
    Updated,
}

/// Change to one child of a watched path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEvent {
    pub kind: ChildEventKind,
    /// Full path of the child
    pub path: String,
}

/// Persistent child watch. Dropping it cancels the subscription.
#[derive(Debug)]
pub struct ChildWatch {
    path: String,
    events: mpsc::UnboundedReceiver<ChildEvent>,
}

impl ChildWatch {
    pub fn new(path: impl Into<String>, events: mpsc::UnboundedReceiver<ChildEvent>) -> Self {
        Self {
            path: path.into(),
            events,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next event, or `None` once the store has shut the watch down.
    pub async fn next(&mut self) -> Option<ChildEvent> {
        self.events.recv().await
    }
}

/// Connected handle to a hierarchical coordination store.
///
/// `create` creates missing parents as persistent nodes. Ephemeral nodes belong to
/// the handle's current session.
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    async fn exists(&self, path: &str) -> Result<bool>;

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()>;

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()>;

    async fn get_data(&self, path: &str) -> Result<Vec<u8>>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Child node names (not full paths), sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Subscribe to session state transitions.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionState>;

    async fn watch_children(&self, path: &str) -> Result<ChildWatch>;
}

static MEMORY_TREES: Lazy<Mutex<HashMap<String, Arc<MemoryTree>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Process-wide in-memory tree registered under `name`.
pub fn shared_tree(name: &str) -> Arc<MemoryTree> {
    let mut trees = MEMORY_TREES
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    trees
        .entry(name.to_string())
        .or_insert_with(MemoryTree::new)
        .clone()
}

/// Open a session against the configured store.
///
/// The session expires after `session_timeout_ms` of suspension, and every call is
/// bounded and retried per the coordinator's timeout and retry settings.
pub fn connect(config: &CoordinatorConfig) -> Result<Arc<dyn CoordinationClient>> {
    match config.servers.split_once("://") {
        Some(("memory", name)) if !name.trim().is_empty() => {
            tracing::info!("Connecting to in-memory coordinator {}", name);
            let session = shared_tree(name.trim())
                .session_with_timeout(Duration::from_millis(config.session_timeout_ms));
            Ok(Arc::new(RetryingClient::new(
                Arc::new(session),
                RetryPolicy::from(config),
            )))
        }
        _ => Err(Error::InvalidConfig(format!(
            "unsupported coordinator servers: {}",
            config.servers
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_shares_named_tree() {
        let cfg = CoordinatorConfig {
            servers: "memory://coord-mod-test".into(),
            ..Default::default()
        };
        let a = connect(&cfg).unwrap();
        let b = connect(&cfg).unwrap();
        a.create("/x/y", b"1".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(b.get_data("/x/y").await.unwrap(), b"1");
    }

    #[test]
    fn test_connect_rejects_unknown_scheme() {
        let cfg = CoordinatorConfig {
            servers: "zk1:2181,zk2:2181".into(),
            ..Default::default()
        };
        assert!(matches!(connect(&cfg), Err(Error::InvalidConfig(_))));
    }
}
