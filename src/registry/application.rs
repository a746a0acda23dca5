//! Application registrar
//!
//! Owns the application node and the provider/consumer registrars attached to it.
//! Registrars share an [`AppContext`] rather than a back-pointer to the registrar, so
//! there is no ownership cycle between the application and its children.

use super::descriptor::ApplicationDescriptor;
use super::notice::{NoticeKind, NoticeSink, ServerSnapshot, SyncSink};
use super::provider::ProviderRegistrar;
use super::Discovery;
use crate::common::utils::local_ip;
use crate::common::{ApplicationConfig, CoordinatorConfig, MonitorConfig, PoolConfig, RegistryConfig};
use crate::coord::{self, CoordinationClient, CreateMode};
use crate::monitor::telemetry::{StaticProbe, TelemetryProbe};
use crate::monitor::MonitorJob;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// State shared by the application registrar and every child registrar
pub struct AppContext {
    client: Arc<dyn CoordinationClient>,
    root: String,
    host: String,
    pool: PoolConfig,
    descriptor: RwLock<ApplicationDescriptor>,
    registered: AtomicBool,
    register_lock: tokio::sync::Mutex<()>,
    notice: Option<Arc<dyn NoticeSink>>,
    sync: Option<Arc<dyn SyncSink>>,
    alert_on_service: bool,
}

impl AppContext {
    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    /// Address used in provider and consumer node names
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool
    }

    pub fn descriptor(&self) -> ApplicationDescriptor {
        self.descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn path(&self) -> String {
        self.descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .path(&self.root)
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn alert_on_service(&self) -> bool {
        self.alert_on_service
    }

    pub fn has_notice_sink(&self) -> bool {
        self.notice.is_some()
    }

    /// Create the persistent application node if needed. Idempotent.
    pub async fn register(&self) -> Result<()> {
        let _guard = self.register_lock.lock().await;
        if self.is_registered() {
            return Ok(());
        }

        let descriptor = self.descriptor();
        let path = descriptor.path(&self.root);
        if !self.client.exists(&path).await? {
            match self
                .client
                .create(&path, descriptor.payload()?, CreateMode::Persistent)
                .await
            {
                Ok(()) | Err(Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.registered.store(true, Ordering::SeqCst);
        tracing::info!(path = %path, "Application registered");
        Ok(())
    }

    /// Deliver a notice to the owners. Failures are logged, never returned.
    pub async fn notify(&self, kind: NoticeKind, protocol: &str, message: &str) {
        let Some(sink) = &self.notice else {
            return;
        };
        let owners = self.descriptor().owners();
        if let Err(e) = sink.notify(&owners, &kind.title(protocol), message).await {
            tracing::warn!("Failed to deliver notice {:?}: {}", kind, e);
        }
    }

    /// Push a server snapshot to the sync sink, if any. Failures are logged.
    pub async fn sync(&self, snapshot: &ServerSnapshot, operator: &str) {
        let Some(sink) = &self.sync else {
            tracing::debug!("No sync sink configured");
            return;
        };
        if let Err(e) = sink.sync_services(snapshot, operator).await {
            tracing::error!("Sync to external sink failed: {}", e);
        }
    }
}

pub(crate) struct AppInner {
    pub(crate) ctx: Arc<AppContext>,
    pub(crate) providers: Mutex<Vec<ProviderRegistrar>>,
    pub(crate) consumers: Mutex<Vec<Arc<dyn Discovery>>>,
    pub(crate) monitor_config: Option<MonitorConfig>,
    pub(crate) probe: Arc<dyn TelemetryProbe>,
    monitor: Mutex<Option<MonitorJob>>,
}

/// Registers the application node and coordinates its child registrars.
#[derive(Clone)]
pub struct ApplicationRegistrar {
    inner: Arc<AppInner>,
}

impl ApplicationRegistrar {
    pub fn builder(app: ApplicationConfig) -> ApplicationBuilder {
        ApplicationBuilder::new(app)
    }

    /// Application, coordinator, pool and monitor sections of a loaded config.
    pub fn from_config(cfg: &RegistryConfig) -> Result<Self> {
        let mut builder = ApplicationBuilder::new(cfg.application.clone())
            .coordinator(cfg.coordinator.clone())
            .pool(cfg.pool.clone());
        if let Some(monitor) = &cfg.monitor {
            builder = builder.monitor(monitor.clone());
        }
        builder.build()
    }

    pub(crate) fn from_inner(inner: Arc<AppInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<AppInner> {
        &self.inner
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.inner.ctx
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        self.inner.ctx.client()
    }

    pub fn path(&self) -> String {
        self.inner.ctx.path()
    }

    pub fn descriptor(&self) -> ApplicationDescriptor {
        self.inner.ctx.descriptor()
    }

    pub fn is_registered(&self) -> bool {
        self.inner.ctx.is_registered()
    }

    pub fn providers(&self) -> Vec<ProviderRegistrar> {
        self.inner
            .providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn consumers(&self) -> Vec<Arc<dyn Discovery>> {
        self.inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn attach_provider(&self, provider: ProviderRegistrar) {
        self.inner
            .providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(provider);
    }

    pub(crate) fn attach_consumer(&self, consumer: Arc<dyn Discovery>) {
        self.inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(consumer);
    }

    pub async fn register(&self) -> Result<()> {
        self.inner.ctx.register().await?;
        self.ensure_monitor()
    }

    /// Tear down every child registrar, then the application node if it is empty.
    ///
    /// The first child failure is returned; children already torn down stay that way.
    pub async fn unregister(&self) -> Result<()> {
        for provider in self.providers() {
            provider.unregister().await?;
        }
        for consumer in self.consumers() {
            consumer.un_discovery().await?;
        }

        let ctx = &self.inner.ctx;
        let path = ctx.path();
        if ctx.client.exists(&path).await? && ctx.client.children(&path).await?.is_empty() {
            match ctx.client.delete(&path).await {
                Ok(()) => tracing::info!(path = %path, "Application node removed"),
                Err(Error::NoNode(_)) | Err(Error::NotEmpty(_)) => {}
                Err(e) => return Err(e),
            }
        }

        ctx.registered.store(false, Ordering::SeqCst);
        self.inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::info!("Application unregistered");
        Ok(())
    }

    /// Replace the application identity. Only allowed while unregistered.
    pub fn reconfigure(&self, app: ApplicationConfig) -> Result<()> {
        let _guard = self
            .inner
            .ctx
            .register_lock
            .try_lock()
            .map_err(|_| Error::IllegalParameter("application registration in progress".into()))?;
        if self.is_registered() {
            return Err(Error::IllegalParameter(
                "application must be unregistered before reconfiguring".into(),
            ));
        }
        let descriptor = ApplicationDescriptor::try_from(app)?;
        *self
            .inner
            .ctx
            .descriptor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = descriptor;
        Ok(())
    }

    fn ensure_monitor(&self) -> Result<()> {
        let Some(config) = &self.inner.monitor_config else {
            return Ok(());
        };
        let mut monitor = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if monitor.is_none() {
            *monitor = Some(MonitorJob::start(&self.inner, config)?);
        }
        Ok(())
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

pub struct ApplicationBuilder {
    app: ApplicationConfig,
    coordinator: CoordinatorConfig,
    client: Option<Arc<dyn CoordinationClient>>,
    host: Option<String>,
    pool: PoolConfig,
    monitor: Option<MonitorConfig>,
    notice: Option<Arc<dyn NoticeSink>>,
    sync: Option<Arc<dyn SyncSink>>,
    probe: Option<Arc<dyn TelemetryProbe>>,
}

impl ApplicationBuilder {
    fn new(app: ApplicationConfig) -> Self {
        Self {
            app,
            coordinator: CoordinatorConfig::default(),
            client: None,
            host: None,
            pool: PoolConfig::default(),
            monitor: None,
            notice: None,
            sync: None,
            probe: None,
        }
    }

    pub fn coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Use an existing client instead of connecting from the coordinator config.
    pub fn client(mut self, client: Arc<dyn CoordinationClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Override the advertised host (defaults to the detected local ip).
    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn notice_sink(mut self, sink: Arc<dyn NoticeSink>) -> Self {
        self.notice = Some(sink);
        self
    }

    pub fn sync_sink(mut self, sink: Arc<dyn SyncSink>) -> Self {
        self.sync = Some(sink);
        self
    }

    pub fn telemetry_probe(mut self, probe: Arc<dyn TelemetryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Validate, connect, and start monitor jobs when configured.
    ///
    /// Monitor jobs are spawned on the current Tokio runtime.
    pub fn build(self) -> Result<ApplicationRegistrar> {
        let descriptor = ApplicationDescriptor::try_from(self.app)?;
        self.coordinator.validate()?;
        if let Some(monitor) = &self.monitor {
            monitor.schedule()?;
        }

        let client = match self.client {
            Some(client) => client,
            None => coord::connect(&self.coordinator)?,
        };
        let alert_on_service = self.monitor.as_ref().map_or(true, |m| m.alert_on_service);
        if self.notice.is_none() {
            tracing::warn!("No notice sink configured, owners will not be alerted");
        }

        let ctx = Arc::new(AppContext {
            client,
            root: self.coordinator.root.clone(),
            host: self.host.unwrap_or_else(|| local_ip().to_string()),
            pool: self.pool,
            descriptor: RwLock::new(descriptor),
            registered: AtomicBool::new(false),
            register_lock: tokio::sync::Mutex::new(()),
            notice: self.notice,
            sync: self.sync,
            alert_on_service,
        });

        let registrar = ApplicationRegistrar {
            inner: Arc::new(AppInner {
                ctx,
                providers: Mutex::new(Vec::new()),
                consumers: Mutex::new(Vec::new()),
                monitor_config: self.monitor,
                probe: self.probe.unwrap_or_else(|| Arc::new(StaticProbe::default())),
                monitor: Mutex::new(None),
            }),
        };
        registrar.ensure_monitor()?;
        Ok(registrar)
    }
}
