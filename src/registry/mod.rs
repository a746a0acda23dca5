//! Registration and discovery against the coordination tree
//!
//! ```text
//! ApplicationRegistrar (app node, lifecycle fan-out, monitor jobs)
//!   ├── ProviderRegistrar   one per protocol: providers/{host}:{port}:{weight}
//!   └── ConsumerRegistrar   one per protocol: consumers/{host} + AddressBook + watches
//! ```

pub mod address_book;
pub mod application;
pub mod consumer;
pub mod descriptor;
pub mod notice;
pub mod provider;

use crate::Result;
use async_trait::async_trait;

pub use address_book::AddressBook;
pub use application::{AppContext, ApplicationBuilder, ApplicationRegistrar};
pub use consumer::{ConsumerBuilder, ConsumerRegistrar};
pub use descriptor::{
    ApplicationDescriptor, MachineStats, ReferenceDescriptor, ServiceDescriptor, ServiceStatus,
};
pub use notice::{LoggingNoticeSink, NoticeKind, NoticeSink, ServerSnapshot, SyncSink};
pub use provider::{ProtocolServer, ProviderRegistrar, SharedServer};

/// Consumer-side lifecycle, type-erased so the application can fan out to
/// registrars of different transports.
#[async_trait]
pub trait Discovery: Send + Sync {
    fn protocol(&self) -> &str;

    async fn discovery(&self) -> Result<()>;

    /// Reconnect handling: markers only once discovered, full discovery otherwise.
    async fn re_discovery(&self) -> Result<()>;

    async fn un_discovery(&self) -> Result<()>;
}
