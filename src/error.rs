//! Crate-level error aggregate

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::engine::LifecycleError;
use crate::transport::TransportError;

/// Errors returned by [`crate::ChatBot`]
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    /// Transport error
    #[error("transport error: {0}")]
    TransportError(#[from] TransportError),

    /// Authorization error
    #[error("auth error: {0}")]
    AuthError(#[from] AuthError),

    /// Lifecycle error
    #[error("lifecycle error: {0}")]
    LifecycleError(#[from] LifecycleError),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BotError {
    /// Taxonomy kind when the error came from the transport
    pub fn transport_kind(&self) -> Option<crate::ErrorKind> {
        match self {
            BotError::TransportError(e) => Some(e.kind()),
            _ => None,
        }
    }
}
