use thiserror::Error;

/// Failures while introspecting a token or asking the policy service.
///
/// Every variant is treated as "deny" by [`PermissionCache`](crate::PermissionCache).
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("request to {service} failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("token rejected by introspection endpoint: {reason}")]
    Rejected { reason: String },

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("token expired")]
    Expired,

    #[error("policy service answered with status {status}")]
    PolicyService { status: u16 },

    #[error("invalid endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },
}

impl AccessError {
    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            reason: reason.into(),
        }
    }
}
