//! Consumer-side call pipeline

pub mod handler;
pub mod pool;
pub mod resolver;
pub mod strategy;
pub mod stub;

pub use handler::InvocationHandler;
pub use pool::{ConnectionPool, KeyedPool, Pooled};
pub use resolver::{AddressResolver, CallValidator, InvokeOptions};
pub use strategy::{ProviderStrategy, RandomStrategy, RoundRobinStrategy};
pub use stub::ServiceStub;
