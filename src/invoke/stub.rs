//! Client stubs

use super::handler::InvocationHandler;
use super::resolver::{CallValidator, InvokeOptions};
use crate::common::path::normalize_uris;
use crate::common::utils::is_blank;
use crate::registry::descriptor::ReferenceDescriptor;
use crate::transport::{Invocation, Transport};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Typed entry point for calls to one referenced interface.
///
/// ```ignore
/// let stub = consumer.stub("OrderService")?;
/// let total: u64 = stub.call("count", vec![json!("open")]).await?;
/// let pinned = stub.with_sub_cluster(&["10.0.0.7:9100"])?;
/// ```
pub struct ServiceStub<T: Transport> {
    reference: ReferenceDescriptor,
    handler: Arc<InvocationHandler<T>>,
    options: InvokeOptions,
}

impl<T: Transport> Clone for ServiceStub<T> {
    fn clone(&self) -> Self {
        Self {
            reference: self.reference.clone(),
            handler: Arc::clone(&self.handler),
            options: self.options.clone(),
        }
    }
}

impl<T: Transport> ServiceStub<T> {
    pub fn new(reference: ReferenceDescriptor, handler: Arc<InvocationHandler<T>>) -> Self {
        Self {
            reference,
            handler,
            options: InvokeOptions::default(),
        }
    }

    pub fn reference(&self) -> &ReferenceDescriptor {
        &self.reference
    }

    /// Restrict calls to the given `host`, `host:port` or `proto://host[:port]` entries.
    ///
    /// Fails when no entry is given or none of them is a usable address.
    pub fn with_sub_cluster<S: AsRef<str>>(&self, hosts: &[S]) -> Result<Self> {
        if hosts.iter().all(|h| is_blank(h.as_ref())) {
            return Err(Error::MissingRequiredParameter(format!(
                "sub-cluster hosts for {}",
                self.reference.interface
            )));
        }
        let uris = normalize_uris(hosts, &self.reference.protocol);
        if uris.is_empty() {
            let given: Vec<&str> = hosts.iter().map(AsRef::as_ref).collect();
            return Err(Error::IllegalParameter(format!(
                "no valid sub-cluster host in {:?} for {}",
                given, self.reference.interface
            )));
        }
        let mut stub = self.clone();
        stub.options.sub_cluster = Some(uris);
        Ok(stub)
    }

    pub fn with_validator<F>(&self, validator: F) -> Self
    where
        F: Fn(&str, &Invocation) -> Result<()> + Send + Sync + 'static,
    {
        let mut stub = self.clone();
        let validator: Arc<CallValidator> = Arc::new(validator);
        stub.options.validator = Some(validator);
        stub
    }

    pub async fn call_raw(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let call = Invocation::new(
            &self.reference.interface,
            &self.reference.version,
            method,
            args,
        );
        self.handler
            .invoke(&call, self.reference.retry, &self.options)
            .await
    }

    pub async fn call<R: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<R> {
        let value = self.call_raw(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }
}
