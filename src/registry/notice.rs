//! Operator notices and external state sync

use crate::registry::descriptor::ServiceDescriptor;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    ProtocolServiceAbnormal,
    ProviderAbnormal,
    InsufficientResource,
    ServiceDisabled,
    ServiceEnabled,
    ProviderDisabled,
    ProviderEnabled,
    ProtocolServerDisabled,
    ProtocolServerEnabled,
}

impl NoticeKind {
    pub fn title(&self, protocol: &str) -> String {
        match self {
            NoticeKind::ProtocolServiceAbnormal => {
                format!("Protocol[{}] Service of provider abnormal notice", protocol)
            }
            NoticeKind::ProviderAbnormal => "Provider abnormal notice".to_string(),
            NoticeKind::InsufficientResource => "Insufficient resource notice".to_string(),
            NoticeKind::ServiceDisabled => {
                format!("Protocol[{}] service disabled notice", protocol)
            }
            NoticeKind::ServiceEnabled => format!("Protocol[{}] service enabled notice", protocol),
            NoticeKind::ProviderDisabled => {
                format!("Protocol[{}] provider disabled notice", protocol)
            }
            NoticeKind::ProviderEnabled => {
                format!("Protocol[{}] provider enabled notice", protocol)
            }
            NoticeKind::ProtocolServerDisabled => {
                format!("Protocol[{}] server disabled notice", protocol)
            }
            NoticeKind::ProtocolServerEnabled => {
                format!("Protocol[{}] server enabled notice", protocol)
            }
        }
    }
}

/// Alert delivery to application owners
#[async_trait]
pub trait NoticeSink: Send + Sync {
    async fn notify(&self, owners: &[String], title: &str, message: &str) -> Result<()>;
}

/// State of one protocol server, pushed to an external store after changes
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub application: String,
    pub env: String,
    pub group: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub registered: bool,
    pub services: Vec<ServiceDescriptor>,
}

#[async_trait]
pub trait SyncSink: Send + Sync {
    async fn sync_services(&self, snapshot: &ServerSnapshot, operator: &str) -> Result<()>;
}

/// Writes notices to the log instead of delivering them
#[derive(Debug, Default)]
pub struct LoggingNoticeSink;

#[async_trait]
impl NoticeSink for LoggingNoticeSink {
    async fn notify(&self, owners: &[String], title: &str, message: &str) -> Result<()> {
        tracing::warn!(owners = ?owners, "{}: {}", title, message);
        Ok(())
    }
}
