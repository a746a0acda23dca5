//! Configuration for minirpc registrars

use crate::common::utils::{is_blank, parse_duration};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, usually loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    pub application: ApplicationConfig,

    /// Background monitoring; disabled when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorConfig>,

    /// Interfaces this process exposes
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Interfaces this process calls
    #[serde(default)]
    pub references: Vec<ReferenceConfig>,

    #[serde(default)]
    pub pool: PoolConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RegistryConfig {
    /// Load from a file, with `MINIRPC__SECTION__KEY` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("MINIRPC").separator("__"))
            .build()?;

        let cfg: RegistryConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that would produce malformed tree paths.
    pub fn validate(&self) -> Result<()> {
        self.coordinator.validate()?;
        self.application.validate()?;

        for service in &self.services {
            service.validate()?;
        }
        for reference in &self.references {
            reference.validate()?;
        }
        if let Some(monitor) = &self.monitor {
            monitor.schedule()?;
        }
        if self.pool.max_connections == 0 {
            return Err(Error::IllegalParameter(
                "pool.max_connections must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Coordination store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Connect string; `memory://<name>` selects the in-process store
    #[serde(default = "default_servers")]
    pub servers: String,

    /// Tree root, without leading slash
    #[serde(default = "default_root")]
    pub root: String,

    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
}

fn default_servers() -> String {
    "memory://default".to_string()
}
fn default_root() -> String {
    "soa".to_string()
}
fn default_session_timeout() -> u64 {
    60_000
}
fn default_connection_timeout() -> u64 {
    15_000
}
fn default_retry_interval() -> u64 {
    1_000
}
fn default_retry_times() -> u32 {
    3
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if is_blank(&self.servers) {
            return Err(Error::MissingRequiredParameter("coordinator.servers".into()));
        }
        if is_blank(&self.root) {
            return Err(Error::MissingRequiredParameter("coordinator.root".into()));
        }
        if self.session_timeout_ms == 0
            || self.connection_timeout_ms == 0
            || self.retry_interval_ms == 0
            || self.retry_times == 0
        {
            return Err(Error::IllegalParameter(
                "coordinator timeouts and retries must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            root: default_root(),
            session_timeout_ms: default_session_timeout(),
            connection_timeout_ms: default_connection_timeout(),
            retry_interval_ms: default_retry_interval(),
            retry_times: default_retry_times(),
        }
    }
}

/// Application identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub group: String,

    /// Pipe-separated owner list
    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub env: String,

    #[serde(default = "default_cluster")]
    pub cluster: String,

    #[serde(default = "default_version")]
    pub version: String,
}

fn default_cluster() -> String {
    "bdp".to_string()
}
fn default_version() -> String {
    "1.0.0".to_string()
}

impl ApplicationConfig {
    pub fn new(name: &str, group: &str, owner: &str, env: &str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            owner: owner.to_string(),
            env: env.to_string(),
            cluster: default_cluster(),
            version: default_version(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("application.name", &self.name),
            ("application.owner", &self.owner),
            ("application.group", &self.group),
            ("application.env", &self.env),
        ] {
            if is_blank(value) {
                return Err(Error::MissingRequiredParameter(field.to_string()));
            }
        }
        Ok(())
    }
}

/// One exposed interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub protocol: String,

    pub interface: String,

    #[serde(default = "default_version")]
    pub version: String,

    pub port: u32,

    /// Non-positive values are coerced to 1
    #[serde(default = "default_weight")]
    pub weight: i32,
}

fn default_weight() -> i32 {
    1
}

impl ServiceConfig {
    pub fn new(protocol: &str, interface: &str, version: &str, port: u32) -> Self {
        Self {
            protocol: protocol.to_string(),
            interface: interface.to_string(),
            version: version.to_string(),
            port,
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if is_blank(&self.protocol) {
            return Err(Error::MissingRequiredParameter("service.protocol".into()));
        }
        if is_blank(&self.interface) {
            return Err(Error::MissingRequiredParameter("service.interface".into()));
        }
        if !(1024..=65535).contains(&self.port) {
            return Err(Error::IllegalParameter(format!(
                "service port {} of {} must be within 1024-65535",
                self.port, self.interface
            )));
        }
        Ok(())
    }

    pub fn effective_weight(&self) -> u32 {
        if self.weight <= 0 {
            1
        } else {
            self.weight as u32
        }
    }
}

/// One required interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub protocol: String,

    pub interface: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Negative values are coerced to the default
    #[serde(default = "default_retry")]
    pub retry: i32,
}

fn default_retry() -> i32 {
    2
}

impl ReferenceConfig {
    pub fn new(protocol: &str, interface: &str, version: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            interface: interface.to_string(),
            version: version.to_string(),
            retry: default_retry(),
        }
    }

    pub fn with_retry(mut self, retry: i32) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if is_blank(&self.protocol) {
            return Err(Error::MissingRequiredParameter("reference.protocol".into()));
        }
        if is_blank(&self.interface) {
            return Err(Error::MissingRequiredParameter("reference.interface".into()));
        }
        Ok(())
    }

    pub fn effective_retry(&self) -> u32 {
        if self.retry < 0 {
            default_retry() as u32
        } else {
            self.retry as u32
        }
    }
}

/// Per-address connection pool limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

fn default_max_connections() -> usize {
    10
}
fn default_acquire_timeout() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

/// Background monitoring jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_sync_delay")]
    pub sync_initial_delay: String,
    #[serde(default = "default_sync_delay")]
    pub sync_period: String,

    #[serde(default = "default_service_delay")]
    pub service_initial_delay: String,
    #[serde(default = "default_service_period")]
    pub service_period: String,

    #[serde(default = "default_service_delay")]
    pub provider_initial_delay: String,
    #[serde(default = "default_provider_period")]
    pub provider_period: String,

    /// Restart dead protocol servers instead of alerting
    #[serde(default)]
    pub auto_process_service: bool,

    #[serde(default = "default_true")]
    pub alert_on_resource: bool,

    #[serde(default = "default_true")]
    pub alert_on_service: bool,

    /// Alert when fewer providers than this are online
    #[serde(default = "default_providers_threshold")]
    pub providers_threshold: usize,

    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,
    #[serde(default = "default_mem_threshold")]
    pub mem_threshold: f64,
    #[serde(default = "default_mem_threshold")]
    pub disk_threshold: f64,
}

fn default_sync_delay() -> String {
    "5s".to_string()
}
fn default_service_delay() -> String {
    "5m".to_string()
}
fn default_service_period() -> String {
    "10m".to_string()
}
fn default_provider_period() -> String {
    "8m".to_string()
}
fn default_true() -> bool {
    true
}
fn default_providers_threshold() -> usize {
    2
}
fn default_cpu_threshold() -> f64 {
    0.98
}
fn default_mem_threshold() -> f64 {
    0.95
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sync_initial_delay: default_sync_delay(),
            sync_period: default_sync_delay(),
            service_initial_delay: default_service_delay(),
            service_period: default_service_period(),
            provider_initial_delay: default_service_delay(),
            provider_period: default_provider_period(),
            auto_process_service: false,
            alert_on_resource: true,
            alert_on_service: true,
            providers_threshold: default_providers_threshold(),
            cpu_threshold: default_cpu_threshold(),
            mem_threshold: default_mem_threshold(),
            disk_threshold: default_mem_threshold(),
        }
    }
}

/// Parsed delays and periods of the three monitor jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSchedule {
    pub sync: (Duration, Duration),
    pub service: (Duration, Duration),
    pub provider: (Duration, Duration),
}

impl MonitorConfig {
    pub fn schedule(&self) -> Result<MonitorSchedule> {
        let pair = |delay: &str, period: &str| -> Result<(Duration, Duration)> {
            let period = parse_duration(period)?;
            if period.is_zero() {
                return Err(Error::InvalidConfig("monitor period must be positive".into()));
            }
            Ok((parse_duration(delay)?, period))
        };
        Ok(MonitorSchedule {
            sync: pair(&self.sync_initial_delay, &self.sync_period)?,
            service: pair(&self.service_initial_delay, &self.service_period)?,
            provider: pair(&self.provider_initial_delay, &self.provider_period)?,
        })
    }
}
