//! Common utilities and types shared across minirpc

pub mod config;
pub mod error;
pub mod path;
pub mod utils;

pub use config::{
    ApplicationConfig, CoordinatorConfig, MonitorConfig, MonitorSchedule, PoolConfig,
    ReferenceConfig, RegistryConfig, ServiceConfig,
};
pub use error::{Error, Result};
pub use path::{expand_providers, normalize_uris, service_key, ProviderNode};
pub use utils::{local_ip, parse_duration, timestamp_now};
