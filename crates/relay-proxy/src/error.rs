use thiserror::Error;
use tokio_tungstenite::tungstenite;

use target_resolver::ResolveError;

/// Errors on the relay path. Every variant is scoped to one request or one
/// connection pair; none of them stop the gateway.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    InvalidTarget(#[from] ResolveError),

    #[error("origin '{origin}' is not allowed")]
    OriginNotAllowed { origin: String },

    #[error("local HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("timed out {what}")]
    Timeout { what: &'static str },

    #[error("no accepted upgrade is pending for tracking id '{tracking_id}'")]
    IllegalState { tracking_id: String },

    #[error("relay transport error: {reason}")]
    Transport { reason: String },

    #[error("external call to {service} failed: {reason}")]
    External { service: &'static str, reason: String },
}

impl RelayError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }
}
