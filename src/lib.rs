//! # minirpc
//!
//! Registry-based service discovery and retrying RPC invocation with:
//! - Versioned, weighted providers published as ephemeral nodes
//! - Consumers that watch provider sets and keep in-memory address lists
//! - Round-robin selection with sub-cluster pinning
//! - Bounded retries over pooled, transport-agnostic connections
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        Coordination tree                      │
//! │  /{root}/{env}/{group}/{app}_{ver}            │
//! │     /{protocol}/{iface}_{ver}                 │
//! │        /providers/{host}:{port}:{weight}      │
//! │        /consumers/{host}                      │
//! └──────────┬──────────────────────┬─────────────┘
//!            │ publish              │ watch
//!   ┌────────▼─────────┐   ┌────────▼──────────┐
//!   │ ProviderRegistrar│   │ ConsumerRegistrar │
//!   │  + ProtocolServer│   │  + AddressBook    │
//!   └──────────────────┘   └────────┬──────────┘
//!                                   │ resolve → borrow → call → retry
//!                          ┌────────▼──────────┐
//!                          │ InvocationHandler │
//!                          │  + KeyedPool      │
//!                          └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let app = ApplicationRegistrar::builder(ApplicationConfig::new("orders", "trade", "alice", "prod"))
//!     .coordinator(config.coordinator.clone())
//!     .build()?;
//!
//! let provider = ProviderRegistrar::from_config(&app, "loopback", server, &config.services)?;
//! provider.register().await?;
//!
//! let consumer = ConsumerRegistrar::builder("loopback", transport)
//!     .references_from(&config.references)?
//!     .build(&app)?;
//! consumer.discovery().await?;
//! let total: u64 = consumer.stub("OrderService")?.call("count", vec![]).await?;
//! ```
//!
//! ### Check a configuration
//! ```bash
//! minirpc check --config ./minirpc.toml
//! ```

pub mod common;
pub mod coord;
pub mod invoke;
pub mod monitor;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use common::{Error, RegistryConfig, Result};
pub use coord::{CoordinationClient, MemoryTree};
pub use invoke::{InvocationHandler, ServiceStub};
pub use registry::{ApplicationRegistrar, ConsumerRegistrar, ProviderRegistrar};
pub use transport::{CallOutcome, Invocation, Transport};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
