//! In-process transport
//!
//! Servers bind `host:port` on a shared [`LoopbackNetwork`]; the transport dispatches
//! calls straight to the bound handlers. Endpoints can be taken down and brought back
//! to simulate provider failures.

use super::{CallOutcome, Invocation, Transport};
use crate::common::path::service_key;
use crate::registry::descriptor::ServiceDescriptor;
use crate::registry::provider::ProtocolServer;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type MethodHandler = Arc<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;

/// Method table of one interface implementation
#[derive(Clone, Default)]
pub struct ServiceImpl {
    methods: HashMap<String, MethodHandler>,
}

impl ServiceImpl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.to_string(), Arc::new(f));
        self
    }
}

struct Endpoint {
    services: HashMap<String, ServiceImpl>,
    up: bool,
    served: u64,
}

/// Shared address space for loopback servers and transports
#[derive(Default)]
pub struct LoopbackNetwork {
    endpoints: Mutex<HashMap<String, Endpoint>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bind(&self, address: &str, services: HashMap<String, ServiceImpl>) {
        let mut endpoints = self.lock();
        let endpoint = endpoints.entry(address.to_string()).or_insert_with(|| Endpoint {
            services: HashMap::new(),
            up: true,
            served: 0,
        });
        endpoint.services.extend(services);
        endpoint.up = true;
    }

    fn unbind(&self, address: &str) {
        self.lock().remove(address);
    }

    /// Refuse connections to `address` until [`bring_up`](Self::bring_up).
    pub fn take_down(&self, address: &str) {
        if let Some(endpoint) = self.lock().get_mut(address) {
            endpoint.up = false;
        }
    }

    pub fn bring_up(&self, address: &str) {
        if let Some(endpoint) = self.lock().get_mut(address) {
            endpoint.up = true;
        }
    }

    pub fn is_reachable(&self, address: &str) -> bool {
        self.lock().get(address).is_some_and(|e| e.up)
    }

    /// Calls successfully dispatched to `address`.
    pub fn served(&self, address: &str) -> u64 {
        self.lock().get(address).map(|e| e.served).unwrap_or(0)
    }

    fn dispatch(&self, address: &str, call: &Invocation) -> Result<Value> {
        let handler = {
            let mut endpoints = self.lock();
            let endpoint = endpoints
                .get_mut(address)
                .filter(|e| e.up)
                .ok_or_else(|| Error::Connection(format!("{} refused connection", address)))?;
            let key = service_key(&call.interface, &call.version);
            let service = endpoint
                .services
                .get(&key)
                .ok_or_else(|| Error::Remote(format!("{} does not serve {}", address, key)))?;
            let handler = service.methods.get(&call.method).cloned().ok_or_else(|| {
                Error::IllegalArgument(format!("{} has no method {}", key, call.method))
            })?;
            endpoint.served += 1;
            handler
        };
        handler(call.args.clone()).map_err(|e| Error::Invocation(Box::new(e)))
    }
}

/// Protocol server bound on a [`LoopbackNetwork`]
pub struct LoopbackServer {
    network: Arc<LoopbackNetwork>,
    implementations: Mutex<HashMap<String, ServiceImpl>>,
    bound: Mutex<Option<String>>,
    serving: AtomicBool,
}

impl LoopbackServer {
    pub fn new(network: Arc<LoopbackNetwork>) -> Self {
        Self {
            network,
            implementations: Mutex::new(HashMap::new()),
            bound: Mutex::new(None),
            serving: AtomicBool::new(false),
        }
    }

    /// Register the implementation served for `interface`.
    pub fn implement(self, interface: &str, service: ServiceImpl) -> Self {
        self.implementations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(interface.to_string(), service);
        self
    }

    pub fn address(&self) -> Option<String> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn resolve(&self, services: &[ServiceDescriptor]) -> Result<HashMap<String, ServiceImpl>> {
        let implementations = self
            .implementations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        services
            .iter()
            .map(|svc| {
                implementations
                    .get(&svc.interface)
                    .cloned()
                    .map(|imp| (svc.key(), imp))
                    .ok_or_else(|| {
                        Error::IllegalParameter(format!("no implementation for {}", svc.interface))
                    })
            })
            .collect()
    }
}

#[async_trait]
impl ProtocolServer for LoopbackServer {
    async fn start_serving(&self, services: &[ServiceDescriptor]) -> Result<()> {
        let Some(first) = services.first() else {
            return Ok(());
        };
        let address = format!("{}:{}", first.ip, first.port);
        let table = self.resolve(services)?;
        self.network.bind(&address, table);
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = Some(address.clone());
        self.serving.store(true, Ordering::SeqCst);
        tracing::info!("Loopback server serving on {}", address);
        Ok(())
    }

    fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
            && self
                .address()
                .is_some_and(|addr| self.network.is_reachable(&addr))
    }

    async fn stop_serving(&self) -> Result<()> {
        if let Some(address) = self.bound.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.network.unbind(&address);
            tracing::info!("Loopback server on {} stopped", address);
        }
        self.serving.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn add_services(&self, services: &[ServiceDescriptor]) -> Result<()> {
        let Some(address) = self.address() else {
            return Err(Error::System("loopback server is not serving".into()));
        };
        let table = self.resolve(services)?;
        self.network.bind(&address, table);
        Ok(())
    }
}

#[derive(Debug)]
pub struct LoopbackConnection {
    pub id: u64,
    pub address: String,
    open: bool,
}

pub struct LoopbackClient {
    pub address: String,
}

/// Client side of the loopback protocol
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    next_id: AtomicU64,
}

impl LoopbackTransport {
    pub fn new(network: Arc<LoopbackNetwork>) -> Self {
        Self {
            network,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    type Connection = LoopbackConnection;
    type Client = LoopbackClient;

    async fn connect(&self, address: &str) -> Result<LoopbackConnection> {
        if !self.network.is_reachable(address) {
            return Err(Error::Connection(format!("{} refused connection", address)));
        }
        Ok(LoopbackConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            address: address.to_string(),
            open: true,
        })
    }

    fn is_open(&self, conn: &LoopbackConnection) -> bool {
        conn.open && self.network.is_reachable(&conn.address)
    }

    async fn close(&self, conn: LoopbackConnection) {
        tracing::debug!(address = %conn.address, id = conn.id, "Closing loopback connection");
    }

    fn client(&self, conn: &LoopbackConnection, _call: &Invocation) -> Result<LoopbackClient> {
        Ok(LoopbackClient {
            address: conn.address.clone(),
        })
    }

    async fn call(
        &self,
        conn: &mut LoopbackConnection,
        client: &LoopbackClient,
        call: &Invocation,
    ) -> CallOutcome {
        match self.network.dispatch(&client.address, call) {
            Ok(value) => CallOutcome::Success(value),
            Err(e) => {
                if e.is_connection_error() {
                    conn.open = false;
                }
                CallOutcome::from_error(e)
            }
        }
    }
}
