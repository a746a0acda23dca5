//! Retrying invocation pipeline
//!
//! resolve -> borrow -> client -> call -> finish -> release/invalidate, repeated up to
//! `retry + 1` times. Fatal outcomes stop the loop immediately.

use super::pool::{ConnectionPool, Pooled};
use super::resolver::{AddressResolver, InvokeOptions};
use crate::transport::{CallOutcome, Invocation, Transport};
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;

pub struct InvocationHandler<T: Transport> {
    resolver: AddressResolver,
    pool: Arc<dyn ConnectionPool<T::Connection>>,
    transport: Arc<T>,
}

impl<T: Transport> InvocationHandler<T> {
    pub fn new(
        resolver: AddressResolver,
        pool: Arc<dyn ConnectionPool<T::Connection>>,
        transport: Arc<T>,
    ) -> Self {
        Self {
            resolver,
            pool,
            transport,
        }
    }

    pub async fn invoke(
        &self,
        call: &Invocation,
        retry: u32,
        options: &InvokeOptions,
    ) -> Result<Value> {
        let attempts = retry.saturating_add(1);
        for attempt in 1..=attempts {
            match self.attempt(call, options).await {
                CallOutcome::Success(value) => {
                    if attempt == 1 {
                        tracing::info!(
                            interface = %call.interface,
                            method = %call.method,
                            "execute successfully"
                        );
                    } else {
                        tracing::info!(
                            interface = %call.interface,
                            method = %call.method,
                            attempt,
                            "retry [{}] times successfully",
                            attempt - 1
                        );
                    }
                    return Ok(value);
                }
                CallOutcome::FatalFailure(cause) => {
                    tracing::error!(
                        interface = %call.interface,
                        method = %call.method,
                        attempt,
                        "execute error, not retrying: {}",
                        cause
                    );
                    return Err(cause.into_cause());
                }
                CallOutcome::TransientFailure { cause, .. } => {
                    tracing::warn!(
                        interface = %call.interface,
                        method = %call.method,
                        attempt,
                        "execute error: {}",
                        cause
                    );
                    if attempt == attempts {
                        return Err(cause.into_cause());
                    }
                }
            }
        }

        Err(Error::System(format!(
            "{}.{} exhausted {} attempts without an outcome",
            call.interface, call.method, attempts
        )))
    }

    async fn attempt(&self, call: &Invocation, options: &InvokeOptions) -> CallOutcome {
        let address = match self.resolver.resolve_for(call, options) {
            Ok(address) => address,
            Err(e) => return CallOutcome::from_error(e),
        };
        let mut pooled = match self.pool.borrow(&address).await {
            Ok(pooled) => pooled,
            Err(e) => return CallOutcome::from_error(e),
        };
        let client = match self.transport.client(pooled.conn(), call) {
            Ok(client) => client,
            Err(e) => {
                let outcome = CallOutcome::from_error(e);
                self.settle(pooled, &outcome).await;
                return outcome;
            }
        };

        let outcome = self.transport.call(pooled.conn_mut(), &client, call).await;
        self.transport.finish(&address, client, pooled.conn()).await;
        self.settle(pooled, &outcome).await;
        outcome
    }

    /// Broken connections are discarded, everything else goes back to the pool.
    async fn settle(&self, pooled: Pooled<T::Connection>, outcome: &CallOutcome) {
        match outcome {
            CallOutcome::TransientFailure { broken: true, .. } => self.pool.invalidate(pooled).await,
            _ => self.pool.release(pooled).await,
        }
    }
}
