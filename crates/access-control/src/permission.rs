use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::AccessError;

/// The resource a token must be allowed to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
}

/// External authorization policy: may the holder of `token` perform
/// `resource.action` on `resource`?
#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn resource_permission(
        &self,
        resource: &ResourceSpec,
        token: &str,
    ) -> Result<bool, AccessError>;
}

/// [`PermissionService`] backed by an HTTP policy endpoint.
///
/// Issues `GET <url>?resourceType=..&resourceId=..&action=..` with the token
/// as a bearer credential and expects either a bare JSON boolean or an object
/// with an `allowed` field.
pub struct HttpPermissionService {
    client: reqwest::Client,
    endpoint: Url,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PermissionAnswer {
    Bare(bool),
    Object { allowed: bool },
}

impl HttpPermissionService {
    pub fn new(client: reqwest::Client, endpoint: &str) -> Result<Self, AccessError> {
        let endpoint = Url::parse(endpoint).map_err(|e| AccessError::InvalidEndpoint {
            url: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl PermissionService for HttpPermissionService {
    async fn resource_permission(
        &self,
        resource: &ResourceSpec,
        token: &str,
    ) -> Result<bool, AccessError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("resourceType", &resource.resource_type)
            .append_pair("resourceId", &resource.resource_id)
            .append_pair("action", &resource.action);

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|source| AccessError::Transport {
                service: "permission",
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AccessError::PolicyService {
                status: status.as_u16(),
            });
        }

        let body: Value = response.json().await.map_err(|source| AccessError::Transport {
            service: "permission",
            source,
        })?;
        let answer: PermissionAnswer = serde_json::from_value(body)
            .map_err(|e| AccessError::malformed("permission response", e.to_string()))?;

        let allowed = match answer {
            PermissionAnswer::Bare(b) => b,
            PermissionAnswer::Object { allowed } => allowed,
        };
        debug!(
            resource_type = %resource.resource_type,
            resource_id = %resource.resource_id,
            action = %resource.action,
            allowed,
            "policy service answered"
        );
        Ok(allowed)
    }
}
