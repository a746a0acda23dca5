//! Descriptors published to the coordination tree

use crate::common::path::{self, ProviderNode, MAX_WEIGHT, OWNER_SEPARATOR};
use crate::common::utils::{local_ip, timestamp_now};
use crate::common::{ApplicationConfig, ReferenceConfig, ServiceConfig};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of the running application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDescriptor {
    pub name: String,
    pub group: String,
    pub owner: String,
    pub env: String,
    pub cluster: String,
    pub version: String,
}

impl ApplicationDescriptor {
    pub fn owners(&self) -> Vec<String> {
        self.owner
            .split(OWNER_SEPARATOR)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn path(&self, root: &str) -> String {
        path::application_path(root, &self.env, &self.group, &self.name, &self.version)
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl TryFrom<ApplicationConfig> for ApplicationDescriptor {
    type Error = Error;

    fn try_from(cfg: ApplicationConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            name: cfg.name,
            group: cfg.group,
            owner: cfg.owner,
            env: cfg.env,
            cluster: cfg.cluster,
            version: cfg.version,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Enabled,
    Disabled,
    Killed,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Enabled => write!(f, "ENABLED"),
            ServiceStatus::Disabled => write!(f, "DISABLED"),
            ServiceStatus::Killed => write!(f, "KILLED"),
        }
    }
}

/// Host telemetry carried in every provider payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineStats {
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub disk_usage: f64,
    pub processors: usize,
}

/// One exposed interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: Uuid,
    pub protocol: String,
    pub interface: String,
    pub version: String,
    pub host: String,
    pub ip: String,
    pub port: u16,
    pub weight: u32,
    pub status: ServiceStatus,
    pub stats: MachineStats,
    /// Free-form operator annotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_message: Option<String>,
    pub updated_at: String,
}

impl ServiceDescriptor {
    pub fn new(protocol: &str, interface: &str, version: &str, port: u16) -> Self {
        let ip = local_ip().to_string();
        Self {
            id: Uuid::new_v4(),
            protocol: protocol.to_string(),
            interface: interface.to_string(),
            version: version.to_string(),
            host: ip.clone(),
            ip,
            port,
            weight: 1,
            status: ServiceStatus::Enabled,
            stats: MachineStats::default(),
            other_message: None,
            updated_at: timestamp_now(),
        }
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self.ip = host.to_string();
        self
    }

    /// Weights below 1 are coerced to 1, weights above [`MAX_WEIGHT`] are clamped.
    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = if weight < 1 {
            1
        } else {
            weight.min(MAX_WEIGHT as i64) as u32
        };
        self
    }

    pub fn key(&self) -> String {
        path::service_key(&self.interface, &self.version)
    }

    pub fn node(&self) -> ProviderNode {
        ProviderNode::new(self.ip.clone(), self.port, self.weight)
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ServiceStatus::Enabled
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn touch(&mut self) {
        self.updated_at = timestamp_now();
    }
}

impl TryFrom<&ServiceConfig> for ServiceDescriptor {
    type Error = Error;

    fn try_from(cfg: &ServiceConfig) -> Result<Self> {
        cfg.validate()?;
        let port = u16::try_from(cfg.port)
            .map_err(|_| Error::IllegalParameter(format!("service port {}", cfg.port)))?;
        Ok(ServiceDescriptor::new(&cfg.protocol, &cfg.interface, &cfg.version, port)
            .with_weight(cfg.effective_weight() as i64))
    }
}

/// One required interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDescriptor {
    pub protocol: String,
    pub interface: String,
    pub version: String,
    pub retry: u32,
}

impl ReferenceDescriptor {
    pub fn new(protocol: &str, interface: &str, version: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            interface: interface.to_string(),
            version: version.to_string(),
            retry: 2,
        }
    }

    /// Negative budgets fall back to the default of 2.
    pub fn with_retry(mut self, retry: i64) -> Self {
        self.retry = u32::try_from(retry).unwrap_or(2);
        self
    }

    pub fn key(&self) -> String {
        path::service_key(&self.interface, &self.version)
    }
}

impl TryFrom<&ReferenceConfig> for ReferenceDescriptor {
    type Error = Error;

    fn try_from(cfg: &ReferenceConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(ReferenceDescriptor::new(&cfg.protocol, &cfg.interface, &cfg.version)
            .with_retry(cfg.effective_retry() as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_descriptor() {
        let cfg = ApplicationConfig::new("orders", "trade", "alice| bob||", "prod");
        let app = ApplicationDescriptor::try_from(cfg).unwrap();
        assert_eq!(app.owners(), vec!["alice", "bob"]);
        assert_eq!(app.path("soa"), "/soa/prod/trade/orders_1.0.0");

        let bad = ApplicationConfig::new("", "trade", "alice", "prod");
        assert!(ApplicationDescriptor::try_from(bad).is_err());
    }

    #[test]
    fn test_service_descriptor_coercion() {
        let svc = ServiceDescriptor::new("loopback", "Echo", "1.0", 9000)
            .with_host("10.0.0.1")
            .with_weight(0);
        assert_eq!(svc.weight, 1);
        assert_eq!(svc.node().to_string(), "10.0.0.1:9000:1");
        assert_eq!(svc.clone().with_weight(i64::MAX).weight, MAX_WEIGHT);
        assert_eq!(svc.key(), "Echo_1.0");

        let payload: serde_json::Value = serde_json::from_slice(&svc.payload().unwrap()).unwrap();
        assert_eq!(payload["status"], "ENABLED");
    }

    #[test]
    fn test_reference_retry_coercion() {
        let r = ReferenceDescriptor::new("loopback", "Echo", "1.0").with_retry(-4);
        assert_eq!(r.retry, 2);
        assert_eq!(r.with_retry(5).retry, 5);
    }

    #[test]
    fn test_service_from_config_checks_port() {
        let cfg = ServiceConfig::new("loopback", "Echo", "1.0", 22);
        assert!(matches!(
            ServiceDescriptor::try_from(&cfg),
            Err(Error::IllegalParameter(_))
        ));
    }
}
