//! Address resolution for one call

use super::strategy::ProviderStrategy;
use crate::common::path::{parse_port, service_key, HOST_PORT_SEPARATOR, NULL_PORT, PROTOCOL_HOST_SEPARATOR};
use crate::registry::address_book::AddressBook;
use crate::transport::Invocation;
use crate::{Error, Result};
use std::sync::Arc;

/// Per-call override of [`ProviderStrategy::validate`], given the chosen address.
pub type CallValidator = dyn Fn(&str, &Invocation) -> Result<()> + Send + Sync;

#[derive(Clone, Default)]
pub struct InvokeOptions {
    /// Normalized `protocol://host:port` URIs; the port may be `null`
    pub sub_cluster: Option<Vec<String>>,
    pub validator: Option<Arc<CallValidator>>,
}

pub struct AddressResolver {
    book: Arc<AddressBook>,
    strategy: Arc<dyn ProviderStrategy>,
}

impl AddressResolver {
    pub fn new(book: Arc<AddressBook>, strategy: Arc<dyn ProviderStrategy>) -> Self {
        Self { book, strategy }
    }

    /// Pick a `host:port` for `interface_version`, optionally pinned to a sub-cluster.
    pub fn resolve(
        &self,
        interface: &str,
        version: &str,
        sub_cluster: Option<&[String]>,
    ) -> Result<String> {
        let key = service_key(interface, version);
        let addresses = self
            .book
            .snapshot(&key)
            .filter(|list| !list.is_empty())
            .ok_or_else(|| Error::NoAvailableProvider(key.clone()))?;

        let uris = match sub_cluster {
            Some([]) => {
                return Err(Error::ProviderUriIllegal(format!("empty sub-cluster for {}", key)));
            }
            Some(uris) => uris,
            None => {
                return self
                    .strategy
                    .select(&addresses)
                    .cloned()
                    .ok_or(Error::NoAvailableProvider(key));
            }
        };

        let uri = self
            .strategy
            .select(uris)
            .ok_or_else(|| Error::NoAvailableProvider(key.clone()))?;
        let illegal = || Error::ProviderUriIllegal(format!("{} for {}", uri, key));

        let parts: Vec<&str> = uri.split(PROTOCOL_HOST_SEPARATOR).collect();
        if parts.len() != 2 {
            return Err(illegal());
        }
        let host_port: Vec<&str> = parts[1].split(HOST_PORT_SEPARATOR).collect();
        if host_port.len() != 2 {
            return Err(illegal());
        }
        let (host, port) = (host_port[0], host_port[1].trim());

        if port.eq_ignore_ascii_case(NULL_PORT) {
            return addresses
                .iter()
                .find(|address| match address.split_once(HOST_PORT_SEPARATOR) {
                    Some((h, p)) => h == host && parse_port(p).is_some(),
                    None => false,
                })
                .cloned()
                .ok_or_else(illegal);
        }

        let port = parse_port(port).ok_or_else(illegal)?;
        let address = format!("{}{}{}", host, HOST_PORT_SEPARATOR, port);
        if addresses.contains(&address) {
            Ok(address)
        } else {
            Err(illegal())
        }
    }

    /// Resolve then validate, the per-call validator taking precedence.
    pub fn resolve_for(&self, call: &Invocation, options: &InvokeOptions) -> Result<String> {
        let address = self.resolve(&call.interface, &call.version, options.sub_cluster.as_deref())?;
        match &options.validator {
            Some(validator) => validator(&address, call)?,
            None => self.strategy.validate(Some(&address), call)?,
        }
        Ok(address)
    }
}
