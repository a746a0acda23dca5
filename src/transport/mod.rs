//! Transport adapters
//!
//! The invocation pipeline is generic over [`Transport`]: it never sees a wire format,
//! only connections, client handles and [`CallOutcome`]s.

pub mod loopback;

use crate::Error;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A method call routed through the invocation pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub interface: String,
    pub version: String,
    pub method: String,
    pub args: Vec<Value>,
}

impl Invocation {
    pub fn new(interface: &str, version: &str, method: &str, args: Vec<Value>) -> Self {
        Self {
            interface: interface.to_string(),
            version: version.to_string(),
            method: method.to_string(),
            args,
        }
    }
}

/// Result of one attempt, as classified by the adapter
#[derive(Debug)]
pub enum CallOutcome {
    Success(Value),
    /// Worth retrying; `broken` means the connection must be discarded
    TransientFailure { cause: Error, broken: bool },
    FatalFailure(Error),
}

impl CallOutcome {
    /// Default classification of an error raised during an attempt.
    pub fn from_error(err: Error) -> Self {
        if err.is_fatal() {
            CallOutcome::FatalFailure(err)
        } else {
            CallOutcome::TransientFailure {
                broken: err.is_connection_error(),
                cause: err,
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success(_))
    }
}

/// Per-protocol hooks used by the invocation handler and the connection pool.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;
    type Client: Send + Sync;

    /// Open a connection to `host:port`.
    async fn connect(&self, address: &str) -> Result<Self::Connection>;

    fn is_open(&self, conn: &Self::Connection) -> bool;

    async fn close(&self, conn: Self::Connection);

    /// Build the protocol client for one call on `conn`.
    fn client(&self, conn: &Self::Connection, call: &Invocation) -> Result<Self::Client>;

    async fn call(
        &self,
        conn: &mut Self::Connection,
        client: &Self::Client,
        call: &Invocation,
    ) -> CallOutcome;

    /// Runs after every attempt that obtained a client, whatever the outcome.
    async fn finish(&self, _key: &str, _client: Self::Client, _conn: &Self::Connection) {}
}
