//! In-process coordination tree
//!
//! A [`MemoryTree`] is shared by any number of [`MemorySession`]s. Each session owns
//! its ephemeral nodes; expiring the session drops them and notifies watchers, the
//! same way a real ensemble would.

use super::{ChildEvent, ChildEventKind, ChildWatch, ConnectionState, CreateMode, CoordinationClient};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOp {
    Create,
    SetData,
    Delete,
}

/// Writes kept by the journal; older entries are dropped first.
pub const JOURNAL_CAPACITY: usize = 1024;

/// A write issued by a session, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub session: u64,
    pub op: TreeOp,
    pub path: String,
}

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    ephemeral_owner: Option<u64>,
}

#[derive(Default)]
struct TreeState {
    nodes: BTreeMap<String, Node>,
    watchers: Vec<(String, mpsc::UnboundedSender<ChildEvent>)>,
    journal: VecDeque<JournalEntry>,
}

impl TreeState {
    fn notify(&mut self, child: &str, kind: ChildEventKind) {
        let Some(parent) = parent_of(child) else {
            return;
        };
        self.watchers.retain(|(path, tx)| {
            if path != parent {
                return !tx.is_closed();
            }
            tx.send(ChildEvent {
                kind,
                path: child.to_string(),
            })
            .is_ok()
        });
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    fn remove(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            self.notify(path, ChildEventKind::Removed);
        }
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => Some(parent),
        _ => None,
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') || path.contains("//") {
        return Err(Error::IllegalParameter(format!("tree path {}", path)));
    }
    Ok(())
}

/// Shared node storage
pub struct MemoryTree {
    state: Mutex<TreeState>,
    next_session: AtomicU64,
}

impl MemoryTree {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TreeState::default()),
            next_session: AtomicU64::new(1),
        })
    }

    /// Open a new connected session on this tree. It never times out while suspended.
    pub fn session(self: &Arc<Self>) -> MemorySession {
        self.open_session(None)
    }

    /// Open a session that expires when it stays suspended for `timeout` or longer.
    pub fn session_with_timeout(self: &Arc<Self>, timeout: Duration) -> MemorySession {
        self.open_session(Some(timeout))
    }

    fn open_session(self: &Arc<Self>, timeout: Option<Duration>) -> MemorySession {
        let (events, _) = broadcast::channel(64);
        MemorySession {
            tree: Arc::clone(self),
            id: AtomicU64::new(self.allocate_session()),
            connected: AtomicBool::new(true),
            lost: AtomicBool::new(false),
            suspended_at: Mutex::new(None),
            timeout,
            events,
        }
    }

    fn allocate_session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The most recent writes, at most [`JOURNAL_CAPACITY`], oldest first.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.iter().cloned().collect()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// All node paths currently in the tree.
    pub fn paths(&self) -> Vec<String> {
        self.lock().nodes.keys().cloned().collect()
    }

    fn drop_ephemerals(&self, session: u64) {
        let mut state = self.lock();
        let owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        for path in owned {
            state.remove(&path);
        }
    }
}

/// One client session on a [`MemoryTree`]
pub struct MemorySession {
    tree: Arc<MemoryTree>,
    id: AtomicU64,
    connected: AtomicBool,
    lost: AtomicBool,
    suspended_at: Mutex<Option<Instant>>,
    timeout: Option<Duration>,
    events: broadcast::Sender<ConnectionState>,
}

impl MemorySession {
    pub fn session_id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn tree(&self) -> &Arc<MemoryTree> {
        &self.tree
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn suspended_at(&self) -> MutexGuard<'_, Option<Instant>> {
        self.suspended_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Temporarily lose the connection; the session and its ephemerals survive
    /// unless the suspension outlasts the session timeout.
    pub fn suspend(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut since = self.suspended_at();
        if since.is_none() {
            *since = Some(Instant::now());
        }
        drop(since);
        let _ = self.events.send(ConnectionState::Suspended);
    }

    /// Lose the session: ephemeral nodes are deleted and `Lost` is broadcast.
    pub fn expire(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.lost.store(true, Ordering::SeqCst);
        self.tree.drop_ephemerals(self.session_id());
        let _ = self.events.send(ConnectionState::Lost);
    }

    /// Reconnect and broadcast `Reconnected`.
    ///
    /// A suspended session resumes with its ephemerals. A lost session, or one
    /// suspended for at least the session timeout, is expired and replaced by a
    /// fresh one.
    pub fn reconnect(&self) {
        let suspended_for = self.suspended_at().take().map(|since| since.elapsed());
        let lapsed = match (suspended_for, self.timeout) {
            (Some(elapsed), Some(timeout)) => elapsed >= timeout,
            _ => false,
        };
        if lapsed && !self.lost.load(Ordering::SeqCst) {
            tracing::warn!(session = self.session_id(), "Session timed out while suspended");
            self.expire();
        }
        if self.lost.swap(false, Ordering::SeqCst) {
            self.id.store(self.tree.allocate_session(), Ordering::SeqCst);
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectionState::Reconnected);
    }

    fn check_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::ConnectionLoss)
        }
    }

    fn record(&self, state: &mut TreeState, op: TreeOp, path: &str) {
        if state.journal.len() == JOURNAL_CAPACITY {
            state.journal.pop_front();
        }
        state.journal.push_back(JournalEntry {
            session: self.session_id(),
            op,
            path: path.to_string(),
        });
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_connected()?;
        Ok(self.tree.lock().nodes.contains_key(path))
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
        self.check_connected()?;
        validate_path(path)?;
        let mut state = self.tree.lock();
        if state.nodes.contains_key(path) {
            return Err(Error::NodeExists(path.to_string()));
        }

        let mut missing = Vec::new();
        let mut cursor = parent_of(path);
        while let Some(parent) = cursor {
            if state.nodes.contains_key(parent) {
                break;
            }
            missing.push(parent.to_string());
            cursor = parent_of(parent);
        }
        for parent in missing.into_iter().rev() {
            state.nodes.insert(
                parent.clone(),
                Node {
                    data: Vec::new(),
                    ephemeral_owner: None,
                },
            );
            state.notify(&parent, ChildEventKind::Added);
        }

        let ephemeral_owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.session_id()),
        };
        state.nodes.insert(
            path.to_string(),
            Node {
                data,
                ephemeral_owner,
            },
        );
        self.record(&mut state, TreeOp::Create, path);
        state.notify(path, ChildEventKind::Added);
        Ok(())
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.check_connected()?;
        let mut state = self.tree.lock();
        match state.nodes.get_mut(path) {
            Some(node) => node.data = data,
            None => return Err(Error::NoNode(path.to_string())),
        }
        self.record(&mut state, TreeOp::SetData, path);
        state.notify(path, ChildEventKind::Updated);
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.check_connected()?;
        self.tree
            .lock()
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_connected()?;
        let mut state = self.tree.lock();
        if !state.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        if state.has_children(path) {
            return Err(Error::NotEmpty(path.to_string()));
        }
        self.record(&mut state, TreeOp::Delete, path);
        state.remove(path);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.check_connected()?;
        let state = self.tree.lock();
        if !state.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        let prefix = format!("{}/", path);
        Ok(state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| &k[prefix.len()..])
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    async fn watch_children(&self, path: &str) -> Result<ChildWatch> {
        self.check_connected()?;
        validate_path(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.tree.lock().watchers.push((path.to_string(), tx));
        Ok(ChildWatch::new(path, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_makes_parents() {
        let tree = MemoryTree::new();
        let s = tree.session();
        s.create("/a/b/c", b"x".to_vec(), CreateMode::Ephemeral)
            .await
            .unwrap();
        assert!(s.exists("/a").await.unwrap());
        assert_eq!(s.children("/a").await.unwrap(), vec!["b"]);
        assert_eq!(s.get_data("/a/b/c").await.unwrap(), b"x");
        assert!(matches!(
            s.create("/a/b/c", vec![], CreateMode::Persistent).await,
            Err(Error::NodeExists(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let tree = MemoryTree::new();
        let s = tree.session();
        s.create("/a/b", vec![], CreateMode::Persistent).await.unwrap();
        assert!(matches!(s.delete("/a").await, Err(Error::NotEmpty(_))));
        s.delete("/a/b").await.unwrap();
        s.delete("/a").await.unwrap();
        assert!(matches!(s.delete("/a").await, Err(Error::NoNode(_))));
    }

    #[tokio::test]
    async fn test_children_excludes_grandchildren() {
        let tree = MemoryTree::new();
        let s = tree.session();
        s.create("/p/x/deep", vec![], CreateMode::Persistent).await.unwrap();
        s.create("/p/y", vec![], CreateMode::Persistent).await.unwrap();
        s.create("/pz", vec![], CreateMode::Persistent).await.unwrap();
        assert_eq!(s.children("/p").await.unwrap(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_watch_and_expiry() {
        let tree = MemoryTree::new();
        let owner = tree.session();
        let observer = tree.session();
        observer
            .create("/svc/providers", vec![], CreateMode::Persistent)
            .await
            .unwrap();

        let mut watch = observer.watch_children("/svc/providers").await.unwrap();
        let mut states = owner.connection_events();

        owner
            .create("/svc/providers/h:1:1", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();
        let added = watch.next().await.unwrap();
        assert_eq!(added.kind, ChildEventKind::Added);
        assert_eq!(added.path, "/svc/providers/h:1:1");

        owner.expire();
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Lost);
        let removed = watch.next().await.unwrap();
        assert_eq!(removed.kind, ChildEventKind::Removed);
        assert!(!observer.exists("/svc/providers/h:1:1").await.unwrap());
        assert!(matches!(owner.exists("/svc").await, Err(Error::ConnectionLoss)));

        owner.reconnect();
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Reconnected);
        assert!(owner.exists("/svc").await.unwrap());
    }

    #[tokio::test]
    async fn test_journal_records_session_writes() {
        let tree = MemoryTree::new();
        let s = tree.session();
        s.create("/j", vec![], CreateMode::Persistent).await.unwrap();
        s.set_data("/j", b"1".to_vec()).await.unwrap();
        let ops: Vec<TreeOp> = tree.journal().into_iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![TreeOp::Create, TreeOp::SetData]);
        tree.clear_journal();
        assert!(tree.journal().is_empty());
    }

    #[tokio::test]
    async fn test_journal_is_bounded() {
        let tree = MemoryTree::new();
        let s = tree.session();
        s.create("/cfg", vec![], CreateMode::Persistent).await.unwrap();
        for i in 0..JOURNAL_CAPACITY + 10 {
            s.set_data("/cfg", i.to_string().into_bytes()).await.unwrap();
        }

        let journal = tree.journal();
        assert_eq!(journal.len(), JOURNAL_CAPACITY);
        assert!(journal.iter().all(|e| e.op == TreeOp::SetData));
        assert_eq!(journal[0].path, "/cfg");
    }

    #[tokio::test]
    async fn test_short_suspension_keeps_session() {
        let tree = MemoryTree::new();
        let s = tree.session_with_timeout(Duration::from_secs(60));
        s.create("/svc/h:1:1", vec![], CreateMode::Ephemeral).await.unwrap();
        let id = s.session_id();

        s.suspend();
        assert!(matches!(s.exists("/svc").await, Err(Error::ConnectionLoss)));
        s.reconnect();
        assert_eq!(s.session_id(), id);
        assert!(s.exists("/svc/h:1:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_suspension_past_timeout_expires_session() {
        let tree = MemoryTree::new();
        let s = tree.session_with_timeout(Duration::from_millis(10));
        s.create("/svc/h:1:1", vec![], CreateMode::Ephemeral).await.unwrap();
        let id = s.session_id();
        let mut states = s.connection_events();

        s.suspend();
        tokio::time::sleep(Duration::from_millis(30)).await;
        s.reconnect();

        assert_eq!(states.recv().await.unwrap(), ConnectionState::Suspended);
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Lost);
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Reconnected);
        assert_ne!(s.session_id(), id);
        assert!(!s.exists("/svc/h:1:1").await.unwrap());
    }
}
