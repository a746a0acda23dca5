//! Error types for minirpc

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Validation Errors ===
    #[error("Missing required parameter: {0}")]
    MissingRequiredParameter(String),

    #[error("Illegal parameter: {0}")]
    IllegalParameter(String),

    #[error("Provider URI illegal: {0}")]
    ProviderUriIllegal(String),

    // === Discovery Errors ===
    #[error("No available provider for {0}")]
    NoAvailableProvider(String),

    #[error("Interface not imported: {0}")]
    InterfaceNotImported(String),

    #[error("Discovery not initialized for protocol {0}")]
    DiscoveryNotInitialized(String),

    // === Registration Errors ===
    #[error("Partial registration: failed {failed:?}, applied {applied:?}: {reason}")]
    Partial {
        failed: Vec<String>,
        applied: Vec<String>,
        reason: String,
    },

    // === Coordination Errors ===
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Coordinator connection lost")]
    ConnectionLoss,

    // === Transport Errors ===
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Pool exhausted for {key} after {timeout_ms}ms")]
    PoolExhausted { key: String, timeout_ms: u64 },

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Invocation failed: {0}")]
    Invocation(Box<Error>),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System error: {0}")]
    System(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }

    /// Errors that must surface on the first attempt.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Invocation(inner) => inner.is_fatal(),
            Error::MissingRequiredParameter(_)
            | Error::IllegalParameter(_)
            | Error::ProviderUriIllegal(_)
            | Error::InterfaceNotImported(_)
            | Error::IllegalArgument(_) => true,
            _ => false,
        }
    }

    /// Does this error mean the held connection can no longer be used?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Invocation(inner) => inner.is_connection_error(),
            Error::Connection(_) | Error::Transport(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Strip reflective invocation wrappers down to the original cause.
    pub fn into_cause(self) -> Error {
        let mut err = self;
        while let Error::Invocation(inner) = err {
            err = *inner;
        }
        err
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::IllegalArgument("x".into()).is_fatal());
        assert!(Error::ProviderUriIllegal("x".into()).is_fatal());
        assert!(Error::Transport("reset".into()).is_retryable());
        assert!(Error::NoAvailableProvider("svc".into()).is_retryable());
        assert!(Error::Invocation(Box::new(Error::IllegalArgument("x".into()))).is_fatal());
    }

    #[test]
    fn test_into_cause_unwraps_nested() {
        let err = Error::Invocation(Box::new(Error::Invocation(Box::new(Error::Remote(
            "boom".into(),
        )))));
        assert!(matches!(err.into_cause(), Error::Remote(m) if m == "boom"));
    }

    #[test]
    fn test_connection_errors() {
        assert!(Error::Connection("refused".into()).is_connection_error());
        assert!(!Error::Remote("bad".into()).is_connection_error());
    }
}
