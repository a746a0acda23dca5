//! Consumer registrar
//!
//! One registrar per protocol. Publishes a `consumers/{host}` marker per reference,
//! loads each `providers/` child list into the [`AddressBook`] and keeps it current
//! with one persistent child watch per service key.

use super::address_book::AddressBook;
use super::application::{AppContext, AppInner, ApplicationRegistrar};
use super::descriptor::ReferenceDescriptor;
use super::Discovery;
use crate::common::path::{consumer_path, providers_path, service_path};
use crate::common::utils::{is_blank, timestamp_now};
use crate::common::ReferenceConfig;
use crate::coord::{ConnectionState, CreateMode};
use crate::invoke::{
    AddressResolver, ConnectionPool, InvocationHandler, KeyedPool, ProviderStrategy,
    RoundRobinStrategy, ServiceStub,
};
use crate::transport::Transport;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

struct ReferenceEntry<T: Transport> {
    descriptor: ReferenceDescriptor,
    stub: OnceLock<ServiceStub<T>>,
}

struct ConsumerInner<T: Transport> {
    app: Arc<AppContext>,
    app_inner: Weak<AppInner>,
    protocol: String,
    references: Mutex<Vec<Arc<ReferenceEntry<T>>>>,
    book: Arc<AddressBook>,
    watches: Mutex<HashMap<String, JoinHandle<()>>>,
    handler: Arc<InvocationHandler<T>>,
    discovered: AtomicBool,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    /// Serializes discovery, re-discovery, import and teardown
    op_lock: tokio::sync::Mutex<()>,
}

impl<T: Transport> Drop for ConsumerInner<T> {
    fn drop(&mut self) {
        if let Some(task) = self
            .reconnect
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        for (_, task) in self
            .watches
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            task.abort();
        }
    }
}

impl<T: Transport> ConsumerInner<T> {
    fn references(&self) -> Vec<Arc<ReferenceEntry<T>>> {
        self.references
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn service_path(&self, reference: &ReferenceDescriptor) -> String {
        service_path(
            &self.app.path(),
            &self.protocol,
            &reference.interface,
            &reference.version,
        )
    }

    /// Append new references, first registration per interface name wins.
    fn accept(&self, incoming: Vec<ReferenceDescriptor>) -> Vec<Arc<ReferenceEntry<T>>> {
        let mut references = self
            .references
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut seen: HashSet<String> = references
            .iter()
            .map(|r| r.descriptor.interface.clone())
            .collect();
        let mut fresh = Vec::new();
        for reference in incoming {
            if reference.protocol != self.protocol {
                tracing::debug!(
                    interface = %reference.interface,
                    "Skipping reference of protocol {}",
                    reference.protocol
                );
                continue;
            }
            if !seen.insert(reference.interface.clone()) {
                tracing::debug!(interface = %reference.interface, "Reference already imported");
                continue;
            }
            let entry = Arc::new(ReferenceEntry {
                descriptor: reference,
                stub: OnceLock::new(),
            });
            references.push(Arc::clone(&entry));
            fresh.push(entry);
        }
        fresh
    }

    async fn register_app(&self) -> Result<()> {
        match self.app_inner.upgrade() {
            Some(app) => ApplicationRegistrar::from_inner(app).register().await,
            None => self.app.register().await,
        }
    }

    async fn publish_marker(&self, reference: &ReferenceDescriptor) -> Result<()> {
        let client = self.app.client();
        let path = consumer_path(&self.service_path(reference), self.app.host());
        if client.exists(&path).await? {
            return Ok(());
        }
        let payload = serde_json::to_vec(&serde_json::json!({
            "host": self.app.host(),
            "reference": reference,
            "registered_at": timestamp_now(),
        }))?;
        match client.create(&path, payload, CreateMode::Ephemeral).await {
            Ok(()) | Err(Error::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn withdraw_marker(&self, reference: &ReferenceDescriptor) -> Result<()> {
        let path = consumer_path(&self.service_path(reference), self.app.host());
        match self.app.client().delete(&path).await {
            Ok(()) | Err(Error::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn is_watched(&self, key: &str) -> bool {
        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Full reload of one reference's providers, then watch it.
    ///
    /// Keys that are already watched are left alone: their list is kept current by the
    /// watch, and a reload could overwrite events applied after the listing.
    async fn discover_providers(self: &Arc<Self>, reference: &ReferenceDescriptor) -> Result<()> {
        let key = reference.key();
        if self.is_watched(&key) {
            tracing::debug!(key = %key, "Providers already watched, skipping reload");
            return Ok(());
        }

        let client = self.app.client();
        let path = providers_path(&self.service_path(reference));
        if !client.exists(&path).await? {
            match client.create(&path, Vec::new(), CreateMode::Persistent).await {
                Ok(()) | Err(Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let children = client.children(&path).await?;
        self.book.replace(&key, &children);
        tracing::info!(
            key = %key,
            "Discovered {} provider nodes",
            children.len()
        );
        self.ensure_watch(&key, &path).await
    }

    async fn ensure_watch(self: &Arc<Self>, key: &str, path: &str) -> Result<()> {
        if self.is_watched(key) {
            return Ok(());
        }

        let mut watch = self.app.client().watch_children(path).await?;
        let weak = Arc::downgrade(self);
        let watch_key = key.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = watch.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match inner.book.apply(&watch_key, &event) {
                    Ok(()) => tracing::debug!(key = %watch_key, "Applied {:?}", event),
                    Err(e) => tracing::warn!(key = %watch_key, "Ignoring watch event: {}", e),
                }
            }
        });

        match self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
        {
            Entry::Occupied(_) => task.abort(),
            Entry::Vacant(slot) => {
                slot.insert(task);
            }
        }
        Ok(())
    }

    async fn discover(self: &Arc<Self>, references: &[Arc<ReferenceEntry<T>>]) -> Result<()> {
        for entry in references {
            self.publish_marker(&entry.descriptor).await?;
        }
        for entry in references {
            self.discover_providers(&entry.descriptor).await?;
        }
        Ok(())
    }

    async fn discovery(self: &Arc<Self>) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.discovery_locked().await
    }

    async fn discovery_locked(self: &Arc<Self>) -> Result<()> {
        self.register_app().await?;
        let references = self.references();
        if references.is_empty() {
            tracing::info!(protocol = %self.protocol, "No references configured, skipping discovery");
            return Ok(());
        }

        self.discover(&references).await?;
        self.discovered.store(true, Ordering::SeqCst);
        self.subscribe_reconnect();
        tracing::info!(
            protocol = %self.protocol,
            "Discovery finished for {} references",
            references.len()
        );
        Ok(())
    }

    /// After a reconnect only the markers are re-published; watches and lists survive.
    async fn re_discovery(self: &Arc<Self>) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if !self.discovered.load(Ordering::SeqCst) {
            return self.discovery_locked().await;
        }
        for entry in self.references() {
            self.publish_marker(&entry.descriptor).await?;
        }
        tracing::info!(protocol = %self.protocol, "Consumer markers re-published");
        Ok(())
    }

    async fn un_discovery(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        for entry in self.references() {
            self.withdraw_marker(&entry.descriptor).await?;
        }
        self.discovered.store(false, Ordering::SeqCst);

        if let Some(task) = self
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        for (_, task) in self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            task.abort();
        }
        tracing::info!(protocol = %self.protocol, "Consumer markers removed");
        Ok(())
    }

    fn subscribe_reconnect(self: &Arc<Self>) {
        let mut slot = self
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let mut events = self.app.client().connection_events();
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionState::Reconnected) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        if let Err(e) = inner.re_discovery().await {
                            tracing::error!(
                                protocol = %inner.protocol,
                                "Re-discovery after reconnect failed: {}",
                                e
                            );
                        }
                    }
                    Ok(ConnectionState::Lost) => {
                        tracing::warn!("Coordinator session lost, consumer markers dropped");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Missed {} connection events", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }
}

/// Discovers providers for one protocol's references and hands out client stubs.
pub struct ConsumerRegistrar<T: Transport> {
    inner: Arc<ConsumerInner<T>>,
}

impl<T: Transport> Clone for ConsumerRegistrar<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> ConsumerRegistrar<T> {
    pub fn builder(protocol: &str, transport: Arc<T>) -> ConsumerBuilder<T> {
        ConsumerBuilder {
            protocol: protocol.to_string(),
            transport,
            strategy: None,
            pool: None,
            references: Vec::new(),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn book(&self) -> &Arc<AddressBook> {
        &self.inner.book
    }

    pub fn is_discovered(&self) -> bool {
        self.inner.discovered.load(Ordering::SeqCst)
    }

    /// Service keys with an installed child watch
    pub fn watched_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn references(&self) -> Vec<ReferenceDescriptor> {
        self.inner
            .references()
            .iter()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub async fn discovery(&self) -> Result<()> {
        self.inner.discovery().await
    }

    pub async fn re_discovery(&self) -> Result<()> {
        self.inner.re_discovery().await
    }

    pub async fn un_discovery(&self) -> Result<()> {
        self.inner.un_discovery().await
    }

    /// Add references at runtime. Existing watches are left untouched.
    pub async fn import_references(&self, incoming: Vec<ReferenceDescriptor>) -> Result<()> {
        let _op = self.inner.op_lock.lock().await;
        let fresh = self.inner.accept(incoming);
        if fresh.is_empty() {
            return Ok(());
        }
        tracing::info!(protocol = %self.inner.protocol, "Imported {} references", fresh.len());
        if self.is_discovered() {
            self.inner.discover(&fresh).await?;
        }
        Ok(())
    }

    /// Cached stub for `interface`, created on first use.
    pub fn stub(&self, interface: &str) -> Result<ServiceStub<T>> {
        let entry = self
            .inner
            .references()
            .into_iter()
            .find(|e| e.descriptor.interface == interface)
            .ok_or_else(|| Error::InterfaceNotImported(interface.to_string()))?;
        if !self.is_discovered() {
            return Err(Error::DiscoveryNotInitialized(self.inner.protocol.clone()));
        }
        let stub = entry.stub.get_or_init(|| {
            ServiceStub::new(entry.descriptor.clone(), Arc::clone(&self.inner.handler))
        });
        Ok(stub.clone())
    }
}

#[async_trait]
impl<T: Transport> Discovery for ConsumerRegistrar<T> {
    fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    async fn discovery(&self) -> Result<()> {
        self.inner.discovery().await
    }

    async fn re_discovery(&self) -> Result<()> {
        self.inner.re_discovery().await
    }

    async fn un_discovery(&self) -> Result<()> {
        self.inner.un_discovery().await
    }
}

pub struct ConsumerBuilder<T: Transport> {
    protocol: String,
    transport: Arc<T>,
    strategy: Option<Arc<dyn ProviderStrategy>>,
    pool: Option<Arc<dyn ConnectionPool<T::Connection>>>,
    references: Vec<ReferenceDescriptor>,
}

impl<T: Transport> ConsumerBuilder<T> {
    /// Defaults to [`RoundRobinStrategy`].
    pub fn strategy(mut self, strategy: Arc<dyn ProviderStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Defaults to a [`KeyedPool`] sized by the application's pool config.
    pub fn pool(mut self, pool: Arc<dyn ConnectionPool<T::Connection>>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn references(mut self, references: Vec<ReferenceDescriptor>) -> Self {
        self.references.extend(references);
        self
    }

    pub fn references_from(mut self, configs: &[ReferenceConfig]) -> Result<Self> {
        for cfg in configs {
            self.references.push(ReferenceDescriptor::try_from(cfg)?);
        }
        Ok(self)
    }

    /// Build the registrar and attach it to `app` for reconnect and teardown fan-out.
    pub fn build(self, app: &ApplicationRegistrar) -> Result<ConsumerRegistrar<T>> {
        if is_blank(&self.protocol) {
            return Err(Error::MissingRequiredParameter("consumer.protocol".into()));
        }

        let ctx = Arc::clone(app.context());
        let book = Arc::new(AddressBook::new());
        let strategy: Arc<dyn ProviderStrategy> = self
            .strategy
            .unwrap_or_else(|| Arc::new(RoundRobinStrategy::new()));
        let pool: Arc<dyn ConnectionPool<T::Connection>> = match self.pool {
            Some(pool) => pool,
            None => Arc::new(KeyedPool::new(
                Arc::clone(&self.transport),
                ctx.pool_config().clone(),
            )),
        };
        let handler = Arc::new(InvocationHandler::new(
            AddressResolver::new(Arc::clone(&book), strategy),
            pool,
            self.transport,
        ));

        let inner = Arc::new(ConsumerInner {
            app: ctx,
            app_inner: Arc::downgrade(app.inner()),
            protocol: self.protocol,
            references: Mutex::new(Vec::new()),
            book,
            watches: Mutex::new(HashMap::new()),
            handler,
            discovered: AtomicBool::new(false),
            reconnect: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        });
        inner.accept(self.references);

        let registrar = ConsumerRegistrar { inner };
        app.attach_consumer(Arc::new(registrar.clone()));
        Ok(registrar)
    }
}
