//! Coordination tree layout
//!
//! ```text
//! /{root}/{env}/{group}/{app}_{appVersion}
//!     /{protocol}/{interface}_{ifaceVersion}
//!         /providers/{host}:{port}:{weight}
//!         /consumers/{host}
//! ```

use crate::common::utils::{is_blank, shuffle};
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

pub const PATH_SEPARATOR: &str = "/";
pub const VERSION_SEPARATOR: &str = "_";
pub const HOST_PORT_SEPARATOR: &str = ":";
pub const PROTOCOL_HOST_SEPARATOR: &str = "://";
pub const NULL_PORT: &str = "null";
pub const OWNER_SEPARATOR: char = '|';
/// Upper bound on a provider's weight; larger weights are clamped.
pub const MAX_WEIGHT: u32 = 100;

const PROVIDERS: &str = "providers";
const CONSUMERS: &str = "consumers";

pub fn application_path(root: &str, env: &str, group: &str, name: &str, version: &str) -> String {
    format!(
        "/{}/{}/{}/{}{}{}",
        root.trim_matches('/'),
        env,
        group,
        name,
        VERSION_SEPARATOR,
        version
    )
}

/// Key used by address lists and tree nodes: `{interface}_{version}`
pub fn service_key(interface: &str, version: &str) -> String {
    format!("{}{}{}", interface, VERSION_SEPARATOR, version)
}

pub fn service_path(app_path: &str, protocol: &str, interface: &str, version: &str) -> String {
    format!(
        "{}/{}/{}",
        app_path,
        protocol,
        service_key(interface, version)
    )
}

pub fn providers_path(service_path: &str) -> String {
    format!("{}/{}", service_path, PROVIDERS)
}

pub fn consumers_path(service_path: &str) -> String {
    format!("{}/{}", service_path, CONSUMERS)
}

pub fn provider_path(service_path: &str, node: &ProviderNode) -> String {
    format!("{}/{}", providers_path(service_path), node)
}

pub fn consumer_path(service_path: &str, host: &str) -> String {
    format!("{}/{}", consumers_path(service_path), host)
}

/// Last segment of a tree path.
pub fn node_name(path: &str) -> &str {
    path.rsplit(PATH_SEPARATOR).next().unwrap_or(path)
}

/// Ports accepted in addresses: 1..=65535, digits only, no leading zero.
pub fn parse_port(s: &str) -> Option<u16> {
    let s = s.trim();
    if s.is_empty() || s.starts_with('0') || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u16>().ok().filter(|p| *p > 0)
}

/// Provider node name: `host:port:weight`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderNode {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl ProviderNode {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
        }
    }

    pub fn address(&self) -> String {
        format!("{}{}{}", self.host, HOST_PORT_SEPARATOR, self.port)
    }

    /// One `host:port` entry per unit of weight.
    pub fn expand(&self) -> Vec<String> {
        let address = self.address();
        vec![address; self.weight as usize]
    }
}

impl fmt::Display for ProviderNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.weight)
    }
}

impl FromStr for ProviderNode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(HOST_PORT_SEPARATOR).collect();
        if parts.len() != 3 || is_blank(parts[0]) {
            return Err(Error::IllegalParameter(format!("provider node {}", s)));
        }
        let port = parse_port(parts[1])
            .ok_or_else(|| Error::IllegalParameter(format!("provider port in {}", s)))?;
        let mut weight = parts[2]
            .trim()
            .parse::<u32>()
            .map_err(|_| Error::IllegalParameter(format!("provider weight in {}", s)))?;
        if weight > MAX_WEIGHT {
            tracing::warn!("Clamping weight of provider node {} to {}", s, MAX_WEIGHT);
            weight = MAX_WEIGHT;
        }
        Ok(ProviderNode::new(parts[0], port, weight))
    }
}

/// Expand provider node names by weight, skipping malformed ones, then shuffle.
pub fn expand_providers<S: AsRef<str>>(children: &[S]) -> Vec<String> {
    let mut addresses = Vec::new();
    for child in children {
        match child.as_ref().parse::<ProviderNode>() {
            Ok(node) => addresses.extend(node.expand()),
            Err(e) => tracing::warn!("Skipping provider node: {}", e),
        }
    }
    shuffle(&mut addresses);
    addresses
}

/// Normalize `host`, `host:port` and `proto://host[:port]` into `protocol://host:port`,
/// using `null` for a missing port. Blank hosts and invalid ports are dropped.
pub fn normalize_uris<S: AsRef<str>>(host_ports: &[S], protocol: &str) -> Vec<String> {
    let mut uris = Vec::new();
    for raw in host_ports {
        let raw = raw.as_ref().trim();
        if raw.is_empty() {
            continue;
        }
        let host_port = match raw.split_once(PROTOCOL_HOST_SEPARATOR) {
            Some((_, rest)) => rest,
            None => raw,
        };
        let mut parts = host_port.split(HOST_PORT_SEPARATOR);
        let host = parts.next().unwrap_or_default();
        if is_blank(host) {
            continue;
        }
        let port = match parts.next().map(str::trim) {
            None => NULL_PORT.to_string(),
            Some(p) if p.eq_ignore_ascii_case(NULL_PORT) => NULL_PORT.to_string(),
            Some(p) => match parse_port(p) {
                Some(port) => port.to_string(),
                None => continue,
            },
        };
        uris.push(format!(
            "{}{}{}{}{}",
            protocol, PROTOCOL_HOST_SEPARATOR, host, HOST_PORT_SEPARATOR, port
        ));
    }
    uris
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let app = application_path("soa", "prod", "trade", "orders", "1.0.0");
        assert_eq!(app, "/soa/prod/trade/orders_1.0.0");

        let svc = service_path(&app, "loopback", "OrderService", "2.1");
        assert_eq!(svc, "/soa/prod/trade/orders_1.0.0/loopback/OrderService_2.1");

        let node = ProviderNode::new("10.0.0.1", 9090, 3);
        assert_eq!(
            provider_path(&svc, &node),
            format!("{}/providers/10.0.0.1:9090:3", svc)
        );
        assert_eq!(consumer_path(&svc, "10.0.0.2"), format!("{}/consumers/10.0.0.2", svc));
        assert_eq!(node_name("/a/b/providers/h:1:1"), "h:1:1");
    }

    #[test]
    fn test_weight_expansion() {
        let node: ProviderNode = "10.0.0.1:9090:3".parse().unwrap();
        assert_eq!(node.expand(), vec!["10.0.0.1:9090"; 3]);
    }

    #[test]
    fn test_oversized_weight_is_clamped() {
        let node: ProviderNode = "h:9100:4000000000".parse().unwrap();
        assert_eq!(node.weight, MAX_WEIGHT);
        assert_eq!(node.expand().len(), MAX_WEIGHT as usize);

        assert!("h:9100:99999999999".parse::<ProviderNode>().is_err());
        assert_eq!(expand_providers(&["h:9100:4000000000"]).len(), MAX_WEIGHT as usize);
    }

    #[test]
    fn test_malformed_nodes_skipped() {
        let children = ["h1:100:2", "h2:100", "h3:abc:1", "h4:200:1:9", "h5:300:1"];
        let mut expanded = expand_providers(&children);
        expanded.sort();
        assert_eq!(expanded, vec!["h1:100", "h1:100", "h5:300"]);
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("1"), Some(1));
        assert_eq!(parse_port("65535"), Some(65535));
        assert_eq!(parse_port("0"), None);
        assert_eq!(parse_port("65536"), None);
        assert_eq!(parse_port("080"), None);
        assert_eq!(parse_port("-1"), None);
    }

    #[test]
    fn test_normalize_uris() {
        let input = [
            "thrift://stream001:8081",
            "thrift://stream002",
            "stream003:8081",
            "stream004",
            "stream005:null",
            "thrift://:null",
            "stream006:99999",
            "  ",
        ];
        assert_eq!(
            normalize_uris(&input, "thrift"),
            vec![
                "thrift://stream001:8081",
                "thrift://stream002:null",
                "thrift://stream003:8081",
                "thrift://stream004:null",
                "thrift://stream005:null",
            ]
        );
    }
}
