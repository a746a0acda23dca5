//! Provider registrar
//!
//! One registrar per protocol. Publishes every ENABLED service as an ephemeral
//! `providers/{host}:{port}:{weight}` node and drives the protocol server.
//!
//! ```text
//! UNREGISTERED --register()--> REGISTERED --unregister()---------> UNREGISTERED (DISABLED)
//!                                         --kill_and_unregister()-> UNREGISTERED (KILLED)
//! ```

use super::application::{AppContext, AppInner, ApplicationRegistrar};
use super::descriptor::{MachineStats, ServiceDescriptor, ServiceStatus};
use super::notice::{NoticeKind, ServerSnapshot};
use crate::common::path::{provider_path, providers_path, service_path};
use crate::common::utils::{is_blank, notice_time};
use crate::common::ServiceConfig;
use crate::coord::{ConnectionState, CreateMode};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Network server for one protocol, driven by the provider registrar
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    async fn start_serving(&self, services: &[ServiceDescriptor]) -> Result<()>;

    fn is_serving(&self) -> bool;

    async fn stop_serving(&self) -> Result<()>;

    /// Expose additional services on an already running server.
    async fn add_services(&self, services: &[ServiceDescriptor]) -> Result<()>;
}

/// Reference-counted server handle for registrars sharing one listening port.
///
/// The first `start_serving` starts the inner server, later ones add their services.
/// The inner server stops when the last user stops.
pub struct SharedServer {
    inner: Arc<dyn ProtocolServer>,
    users: tokio::sync::Mutex<usize>,
}

impl SharedServer {
    pub fn new(inner: Arc<dyn ProtocolServer>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            users: tokio::sync::Mutex::new(0),
        })
    }

    pub async fn users(&self) -> usize {
        *self.users.lock().await
    }
}

#[async_trait]
impl ProtocolServer for SharedServer {
    async fn start_serving(&self, services: &[ServiceDescriptor]) -> Result<()> {
        let mut users = self.users.lock().await;
        if *users == 0 || !self.inner.is_serving() {
            self.inner.start_serving(services).await?;
        } else {
            self.inner.add_services(services).await?;
        }
        *users += 1;
        Ok(())
    }

    fn is_serving(&self) -> bool {
        self.inner.is_serving()
    }

    async fn stop_serving(&self) -> Result<()> {
        let mut users = self.users.lock().await;
        if *users == 0 {
            return Ok(());
        }
        *users -= 1;
        if *users == 0 {
            self.inner.stop_serving().await?;
        }
        Ok(())
    }

    async fn add_services(&self, services: &[ServiceDescriptor]) -> Result<()> {
        self.inner.add_services(services).await
    }
}

struct ProviderInner {
    app: Arc<AppContext>,
    app_inner: Weak<AppInner>,
    protocol: String,
    port: u16,
    server: Arc<dyn ProtocolServer>,
    services: tokio::sync::Mutex<Vec<ServiceDescriptor>>,
    registered: AtomicBool,
    /// Whether this registrar currently holds the server started
    started: AtomicBool,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ProviderInner {
    fn drop(&mut self) {
        if let Some(task) = self
            .reconnect
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl ProviderInner {
    fn service_path(&self, svc: &ServiceDescriptor) -> String {
        service_path(&self.app.path(), &self.protocol, &svc.interface, &svc.version)
    }

    fn node_path(&self, svc: &ServiceDescriptor) -> String {
        provider_path(&self.service_path(svc), &svc.node())
    }

    /// Keep this protocol's services, pin them to our host and port, drop duplicates.
    fn filter(&self, incoming: Vec<ServiceDescriptor>, existing: &[ServiceDescriptor]) -> Vec<ServiceDescriptor> {
        let mut seen: HashSet<String> = existing.iter().map(ServiceDescriptor::key).collect();
        let mut kept = Vec::new();
        for mut svc in incoming {
            if svc.protocol != self.protocol {
                tracing::debug!(
                    interface = %svc.interface,
                    "Skipping service of protocol {}",
                    svc.protocol
                );
                continue;
            }
            if !seen.insert(svc.key()) {
                tracing::warn!(interface = %svc.interface, "Duplicate service ignored");
                continue;
            }
            svc.port = self.port;
            svc.host = self.app.host().to_string();
            svc.ip = self.app.host().to_string();
            kept.push(svc);
        }
        kept
    }

    /// Create the ephemeral node, or refresh its payload if it already exists.
    async fn publish(&self, svc: &ServiceDescriptor) -> Result<()> {
        let client = self.app.client();
        let path = self.node_path(svc);
        let payload = svc.payload()?;
        if client.exists(&path).await? {
            return client.set_data(&path, payload).await;
        }
        match client.create(&path, payload.clone(), CreateMode::Ephemeral).await {
            Err(Error::NodeExists(_)) => client.set_data(&path, payload).await,
            other => other,
        }
    }

    async fn withdraw(&self, svc: &ServiceDescriptor) -> Result<()> {
        match self.app.client().delete(&self.node_path(svc)).await {
            Ok(()) | Err(Error::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Publish every ENABLED service; stops at the first failure.
    async fn publish_enabled(&self, services: &[ServiceDescriptor]) -> Result<Vec<String>> {
        let mut applied = Vec::new();
        for svc in services.iter().filter(|s| s.is_enabled()) {
            if let Err(e) = self.publish(svc).await {
                tracing::error!(interface = %svc.interface, "Failed to publish provider: {}", e);
                return Err(Error::Partial {
                    failed: vec![svc.interface.clone()],
                    applied,
                    reason: e.to_string(),
                });
            }
            applied.push(svc.interface.clone());
        }
        Ok(applied)
    }

    async fn start(&self, services: &[ServiceDescriptor]) -> Result<()> {
        if self.started.swap(false, Ordering::SeqCst) {
            self.server.stop_serving().await?;
        }
        self.server.start_serving(services).await?;
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.started.swap(false, Ordering::SeqCst) {
            self.server.stop_serving().await?;
        }
        Ok(())
    }

    /// Stop serving and remove every ENABLED node, marking it `status`.
    async fn teardown(&self, services: &mut [ServiceDescriptor], status: ServiceStatus) -> Result<()> {
        self.stop().await?;
        for svc in services.iter_mut().filter(|s| s.is_enabled()) {
            self.withdraw(svc).await?;
            svc.status = status;
            svc.touch();
        }
        self.registered.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn re_register(&self) -> Result<()> {
        let services = self.services.lock().await;
        if !self.registered.load(Ordering::SeqCst) {
            return Ok(());
        }
        let applied = self.publish_enabled(&services).await?;
        tracing::info!(
            protocol = %self.protocol,
            "Re-published {} provider nodes after reconnect",
            applied.len()
        );
        Ok(())
    }

    fn snapshot_of(&self, services: &[ServiceDescriptor]) -> ServerSnapshot {
        let app = self.app.descriptor();
        ServerSnapshot {
            application: app.name,
            env: app.env,
            group: app.group,
            protocol: self.protocol.clone(),
            host: self.app.host().to_string(),
            port: self.port,
            registered: self.registered.load(Ordering::SeqCst),
            services: services.to_vec(),
        }
    }

    fn notice_message(&self, what: &str, operator: &str) -> String {
        format!(
            "[{}] application [{}] provider [{}:{}] {} by [{}]",
            notice_time(),
            self.app.descriptor().name,
            self.app.host(),
            self.port,
            what,
            operator
        )
    }

    async fn notice(&self, kind: NoticeKind, what: &str, operator: &str) {
        if self.app.alert_on_service() {
            self.app
                .notify(kind, &self.protocol, &self.notice_message(what, operator))
                .await;
        }
    }

    async fn sync(&self, operator: &str) {
        let snapshot = {
            let services = self.services.lock().await;
            self.snapshot_of(&services)
        };
        self.app.sync(&snapshot, operator).await;
    }
}

/// Publishes one protocol's services and supervises its server.
#[derive(Clone)]
pub struct ProviderRegistrar {
    inner: Arc<ProviderInner>,
}

impl ProviderRegistrar {
    /// Create a registrar and attach it to `app`.
    ///
    /// Services of other protocols are dropped, the rest are pinned to `port` and the
    /// application host. Duplicate interface+version entries keep the first.
    pub fn new(
        app: &ApplicationRegistrar,
        protocol: &str,
        port: u16,
        server: Arc<dyn ProtocolServer>,
        services: Vec<ServiceDescriptor>,
    ) -> Result<Self> {
        if is_blank(protocol) {
            return Err(Error::MissingRequiredParameter("provider.protocol".into()));
        }
        if port < 1024 {
            return Err(Error::IllegalParameter(format!(
                "provider port {} outside 1024-65535",
                port
            )));
        }

        let mut inner = ProviderInner {
            app: Arc::clone(app.context()),
            app_inner: Arc::downgrade(app.inner()),
            protocol: protocol.to_string(),
            port,
            server,
            services: tokio::sync::Mutex::new(Vec::new()),
            registered: AtomicBool::new(false),
            started: AtomicBool::new(false),
            reconnect: Mutex::new(None),
        };
        let filtered = inner.filter(services, &[]);
        *inner.services.get_mut() = filtered;

        let registrar = Self {
            inner: Arc::new(inner),
        };
        app.attach_provider(registrar.clone());
        Ok(registrar)
    }

    /// Build from configured services; the registrar port is the first service's port.
    pub fn from_config(
        app: &ApplicationRegistrar,
        protocol: &str,
        server: Arc<dyn ProtocolServer>,
        services: &[ServiceConfig],
    ) -> Result<Self> {
        let descriptors = services
            .iter()
            .filter(|s| s.protocol == protocol)
            .map(ServiceDescriptor::try_from)
            .collect::<Result<Vec<_>>>()?;
        let port = descriptors.first().map(|s| s.port).ok_or_else(|| {
            Error::MissingRequiredParameter(format!("services for protocol {}", protocol))
        })?;
        Self::new(app, protocol, port, server, descriptors)
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    pub fn is_serving(&self) -> bool {
        self.inner.server.is_serving()
    }

    pub async fn services(&self) -> Vec<ServiceDescriptor> {
        self.inner.services.lock().await.clone()
    }

    pub fn providers_path(&self, svc: &ServiceDescriptor) -> String {
        providers_path(&self.inner.service_path(svc))
    }

    pub async fn snapshot(&self) -> ServerSnapshot {
        let services = self.inner.services.lock().await;
        self.inner.snapshot_of(&services)
    }

    async fn register_app(&self) -> Result<()> {
        match self.inner.app_inner.upgrade() {
            Some(app) => ApplicationRegistrar::from_inner(app).register().await,
            None => self.inner.app.register().await,
        }
    }

    /// Publish ENABLED services and start the protocol server. Idempotent.
    ///
    /// A tree write failure leaves the registrar unregistered and reports which
    /// interface failed in [`Error::Partial`].
    pub async fn register(&self) -> Result<()> {
        self.register_app().await?;

        let mut services = self.inner.services.lock().await;
        if self.is_registered() {
            return Ok(());
        }
        if services.is_empty() {
            tracing::info!(protocol = %self.inner.protocol, "No services to register");
            return Ok(());
        }

        services.iter_mut().for_each(ServiceDescriptor::touch);
        let applied = self.inner.publish_enabled(&services).await?;
        if let Err(e) = self.inner.start(&services).await {
            tracing::error!(protocol = %self.inner.protocol, "Protocol server failed to start: {}", e);
            for svc in services.iter().filter(|s| s.is_enabled()) {
                if let Err(e) = self.inner.withdraw(svc).await {
                    tracing::warn!(interface = %svc.interface, "Rollback failed: {}", e);
                }
            }
            return Err(e);
        }

        self.inner.registered.store(true, Ordering::SeqCst);
        drop(services);
        self.subscribe_reconnect();
        tracing::info!(
            protocol = %self.inner.protocol,
            port = self.inner.port,
            "Registered {} services",
            applied.len()
        );
        self.inner.sync("register").await;
        Ok(())
    }

    /// Stop serving, remove the nodes and mark the services DISABLED. Idempotent.
    pub async fn unregister(&self) -> Result<()> {
        {
            let mut services = self.inner.services.lock().await;
            if !self.is_registered() {
                return Ok(());
            }
            self.inner
                .teardown(&mut services, ServiceStatus::Disabled)
                .await?;
        }
        tracing::info!(protocol = %self.inner.protocol, "Provider unregistered");
        self.inner.sync("unregister").await;
        Ok(())
    }

    /// Stop serving, remove the nodes and mark the services KILLED.
    pub async fn kill_and_unregister(&self, operator: &str) -> Result<()> {
        {
            let mut services = self.inner.services.lock().await;
            self.inner
                .teardown(&mut services, ServiceStatus::Killed)
                .await?;
        }
        tracing::warn!(protocol = %self.inner.protocol, operator, "Protocol server killed");
        self.inner
            .notice(NoticeKind::ProtocolServerDisabled, "server killed", operator)
            .await;
        self.inner.sync(operator).await;
        Ok(())
    }

    /// Bring KILLED services back, re-publish and (re)start the protocol server.
    pub async fn revive(&self, operator: &str) -> Result<()> {
        self.register_app().await?;
        {
            let mut services = self.inner.services.lock().await;
            for svc in services.iter_mut() {
                if svc.status == ServiceStatus::Killed {
                    svc.status = ServiceStatus::Enabled;
                }
                svc.touch();
            }
            self.inner.publish_enabled(&services).await?;
            self.inner.start(&services).await?;
            self.inner.registered.store(true, Ordering::SeqCst);
        }
        self.subscribe_reconnect();
        tracing::info!(protocol = %self.inner.protocol, operator, "Protocol server revived");
        self.inner
            .notice(NoticeKind::ProtocolServerEnabled, "server started", operator)
            .await;
        self.inner.sync(operator).await;
        Ok(())
    }

    /// Mark one interface ENABLED and publish its node if the registrar is registered.
    pub async fn enable(&self, interface: &str, operator: &str) -> Result<()> {
        {
            let mut services = self.inner.services.lock().await;
            let svc = find_mut(&mut services, interface)?;
            svc.status = ServiceStatus::Enabled;
            svc.touch();
            if self.is_registered() {
                self.inner.publish(svc).await?;
            }
        }
        tracing::info!(interface, operator, "Service enabled");
        self.inner
            .notice(
                NoticeKind::ServiceEnabled,
                &format!("service [{}] enabled", interface),
                operator,
            )
            .await;
        self.inner.sync(operator).await;
        Ok(())
    }

    /// Mark one interface DISABLED and remove its node.
    pub async fn disable(&self, interface: &str, operator: &str) -> Result<()> {
        {
            let mut services = self.inner.services.lock().await;
            let svc = find_mut(&mut services, interface)?;
            self.inner.withdraw(svc).await?;
            svc.status = ServiceStatus::Disabled;
            svc.touch();
        }
        tracing::info!(interface, operator, "Service disabled");
        self.inner
            .notice(
                NoticeKind::ServiceDisabled,
                &format!("service [{}] disabled", interface),
                operator,
            )
            .await;
        self.inner.sync(operator).await;
        Ok(())
    }

    /// Enable every service. Failures are collected into [`Error::Partial`].
    pub async fn enable_all(&self, operator: &str) -> Result<()> {
        let mut failed = Vec::new();
        let mut applied = Vec::new();
        let mut reason = String::new();
        {
            let mut services = self.inner.services.lock().await;
            let registered = self.is_registered();
            for svc in services.iter_mut() {
                svc.status = ServiceStatus::Enabled;
                svc.touch();
                let published = if registered {
                    self.inner.publish(svc).await
                } else {
                    Ok(())
                };
                match published {
                    Ok(()) => applied.push(svc.interface.clone()),
                    Err(e) => {
                        reason = e.to_string();
                        failed.push(svc.interface.clone());
                    }
                }
            }
        }
        self.inner
            .notice(NoticeKind::ProviderEnabled, "all services enabled", operator)
            .await;
        self.inner.sync(operator).await;
        partial(failed, applied, reason)
    }

    /// Disable every service. Failures are collected into [`Error::Partial`].
    pub async fn disable_all(&self, operator: &str) -> Result<()> {
        let mut failed = Vec::new();
        let mut applied = Vec::new();
        let mut reason = String::new();
        {
            let mut services = self.inner.services.lock().await;
            for svc in services.iter_mut() {
                match self.inner.withdraw(svc).await {
                    Ok(()) => {
                        svc.status = ServiceStatus::Disabled;
                        svc.touch();
                        applied.push(svc.interface.clone());
                    }
                    Err(e) => {
                        reason = e.to_string();
                        failed.push(svc.interface.clone());
                    }
                }
            }
        }
        self.inner
            .notice(NoticeKind::ProviderDisabled, "all services disabled", operator)
            .await;
        self.inner.sync(operator).await;
        partial(failed, applied, reason)
    }

    /// Add services at runtime. When registered they are published and handed
    /// to the running server.
    pub async fn import_services(&self, incoming: Vec<ServiceDescriptor>) -> Result<()> {
        {
            let mut services = self.inner.services.lock().await;
            let fresh = self.inner.filter(incoming, &services);
            if fresh.is_empty() {
                return Ok(());
            }
            services.extend(fresh.iter().cloned());
            if self.is_registered() {
                self.inner.publish_enabled(&fresh).await?;
                self.inner.server.add_services(&fresh).await?;
            }
            tracing::info!(protocol = %self.inner.protocol, "Imported {} services", fresh.len());
        }
        self.inner.sync("import").await;
        Ok(())
    }

    /// Attach an operator annotation to every service payload.
    pub async fn set_other_message(&self, message: &str) -> Result<()> {
        {
            let mut services = self.inner.services.lock().await;
            for svc in services.iter_mut() {
                svc.other_message = Some(message.to_string());
            }
        }
        self.sync_payloads().await
    }

    /// Record host telemetry on every service; call [`sync_payloads`](Self::sync_payloads) to publish.
    pub async fn apply_telemetry(&self, stats: MachineStats) {
        let mut services = self.inner.services.lock().await;
        for svc in services.iter_mut() {
            svc.stats = stats;
            svc.touch();
        }
    }

    /// Re-write the payload of every ENABLED node.
    pub async fn sync_payloads(&self) -> Result<()> {
        let services = self.inner.services.lock().await;
        if !self.is_registered() {
            return Ok(());
        }
        self.inner.publish_enabled(&services).await.map(|_| ())
    }

    fn subscribe_reconnect(&self) {
        let mut slot = self
            .inner
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let mut events = self.inner.app.client().connection_events();
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionState::Reconnected) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        if let Err(e) = inner.re_register().await {
                            tracing::error!(
                                protocol = %inner.protocol,
                                "Re-registration after reconnect failed: {}",
                                e
                            );
                        }
                    }
                    Ok(ConnectionState::Lost) => {
                        tracing::warn!("Coordinator session lost, provider nodes dropped");
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

fn find_mut<'a>(services: &'a mut [ServiceDescriptor], interface: &str) -> Result<&'a mut ServiceDescriptor> {
    services
        .iter_mut()
        .find(|s| s.interface == interface)
        .ok_or_else(|| Error::IllegalParameter(format!("interface {} is not exported", interface)))
}

fn partial(failed: Vec<String>, applied: Vec<String>, reason: String) -> Result<()> {
    if failed.is_empty() {
        Ok(())
    } else {
        Err(Error::Partial {
            failed,
            applied,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ApplicationConfig;
    use crate::coord::{CoordinationClient, MemoryTree};
    use crate::transport::loopback::{LoopbackNetwork, LoopbackServer, ServiceImpl};

    fn app(tree: &Arc<MemoryTree>) -> ApplicationRegistrar {
        ApplicationRegistrar::builder(ApplicationConfig::new("orders", "trade", "alice", "test"))
            .client(Arc::new(tree.session()))
            .host("10.0.0.1")
            .build()
            .unwrap()
    }

    fn server(network: &Arc<LoopbackNetwork>) -> Arc<LoopbackServer> {
        Arc::new(
            LoopbackServer::new(Arc::clone(network))
                .implement("Echo", ServiceImpl::new())
                .implement("Clock", ServiceImpl::new()),
        )
    }

    fn echo(port: u16) -> ServiceDescriptor {
        ServiceDescriptor::new("loopback", "Echo", "1.0", port)
    }

    const ECHO_NODE: &str = "/soa/test/trade/orders_1.0.0/loopback/Echo_1.0/providers/10.0.0.1:9100:1";

    #[tokio::test]
    async fn test_filter_pins_port_and_dedupes() {
        let tree = MemoryTree::new();
        let app = app(&tree);
        let services = vec![
            echo(1).with_weight(3),
            echo(2),
            ServiceDescriptor::new("thrift", "Clock", "1.0", 3),
        ];
        let provider =
            ProviderRegistrar::new(&app, "loopback", 9100, server(&LoopbackNetwork::new()), services)
                .unwrap();
        let kept = provider.services().await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].port, 9100);
        assert_eq!(kept[0].weight, 3);
        assert_eq!(kept[0].ip, "10.0.0.1");
        assert_eq!(app.providers().len(), 1);
    }

    #[tokio::test]
    async fn test_low_port_rejected() {
        let tree = MemoryTree::new();
        let app = app(&tree);
        let result = ProviderRegistrar::new(&app, "loopback", 80, server(&LoopbackNetwork::new()), vec![]);
        assert!(matches!(result, Err(Error::IllegalParameter(_))));
    }

    #[tokio::test]
    async fn test_register_publishes_and_serves() {
        let tree = MemoryTree::new();
        let network = LoopbackNetwork::new();
        let app = app(&tree);
        let provider =
            ProviderRegistrar::new(&app, "loopback", 9100, server(&network), vec![echo(9100)]).unwrap();

        provider.register().await.unwrap();
        assert!(app.is_registered());
        assert!(provider.is_registered());
        assert!(provider.is_serving());
        assert!(tree.paths().contains(&ECHO_NODE.to_string()));

        provider.register().await.unwrap();
        provider.unregister().await.unwrap();
        assert!(!provider.is_serving());
        assert!(!tree.paths().contains(&ECHO_NODE.to_string()));
        assert_eq!(provider.services().await[0].status, ServiceStatus::Disabled);
    }

    #[tokio::test]
    async fn test_start_failure_rolls_back() {
        let tree = MemoryTree::new();
        let network = LoopbackNetwork::new();
        let app = app(&tree);
        let bare = Arc::new(LoopbackServer::new(Arc::clone(&network)));
        let provider = ProviderRegistrar::new(&app, "loopback", 9100, bare, vec![echo(9100)]).unwrap();

        assert!(provider.register().await.is_err());
        assert!(!provider.is_registered());
        assert!(!tree.paths().contains(&ECHO_NODE.to_string()));
    }

    #[tokio::test]
    async fn test_enable_disable_single_interface() {
        let tree = MemoryTree::new();
        let network = LoopbackNetwork::new();
        let app = app(&tree);
        let provider =
            ProviderRegistrar::new(&app, "loopback", 9100, server(&network), vec![echo(9100)]).unwrap();
        provider.register().await.unwrap();

        provider.disable("Echo", "ops").await.unwrap();
        assert!(!app.client().exists(ECHO_NODE).await.unwrap());
        provider.enable("Echo", "ops").await.unwrap();
        assert!(app.client().exists(ECHO_NODE).await.unwrap());

        assert!(matches!(
            provider.disable("Missing", "ops").await,
            Err(Error::IllegalParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_shared_server_refcount() {
        let network = LoopbackNetwork::new();
        let inner = server(&network);
        let shared = SharedServer::new(inner.clone());
        let a = vec![echo(9100).with_host("10.0.0.1")];
        let b = vec![ServiceDescriptor::new("loopback", "Clock", "1.0", 9100).with_host("10.0.0.1")];

        shared.start_serving(&a).await.unwrap();
        shared.start_serving(&b).await.unwrap();
        assert_eq!(shared.users().await, 2);

        shared.stop_serving().await.unwrap();
        assert!(shared.is_serving());
        shared.stop_serving().await.unwrap();
        assert!(!shared.is_serving());
        shared.stop_serving().await.unwrap();
        assert_eq!(shared.users().await, 0);
    }
}
