use thiserror::Error;

/// Errors produced while computing a local target for a relayed URI.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("invalid target for '{uri}': {reason}")]
    InvalidTarget { uri: String, reason: String },
}

impl ResolveError {
    pub(crate) fn invalid(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            uri: uri.into(),
            reason: reason.into(),
        }
    }
}
