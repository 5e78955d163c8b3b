use std::sync::Arc;

use access_control::PermissionCache;
use async_trait::async_trait;
use http::header::{AUTHORIZATION, COOKIE};
use http::HeaderMap;

use super::RequestInspector;
use crate::request::RelayedRequest;

/// Extract the bearer token from an `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Find `name` in the `Cookie` header(s).
fn cookie_token<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, v)| *k == name && !v.is_empty())
        .map(|(_, v)| v)
}

/// Requires an access token the policy service grants access to.
///
/// The token is taken from a bearer `Authorization` header, or failing that
/// from the configured cookie. Requests without a token are rejected
/// outright; otherwise the answer comes from the shared [`PermissionCache`].
pub struct AuthorizationInspector {
    cache: Arc<PermissionCache>,
    cookie_name: String,
}

impl AuthorizationInspector {
    pub fn new(cache: Arc<PermissionCache>, cookie_name: impl Into<String>) -> Self {
        Self {
            cache,
            cookie_name: cookie_name.into(),
        }
    }

    fn token<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        bearer_token(headers).or_else(|| cookie_token(headers, &self.cookie_name))
    }

    async fn check(&self, request: &RelayedRequest) -> bool {
        let Some(token) = self.token(request.headers()) else {
            tracing::warn!(tracking_id = request.tracking_id(), "no access token presented");
            return false;
        };
        let permitted = self.cache.is_permitted(token).await;
        if !permitted {
            tracing::warn!(tracking_id = request.tracking_id(), "access token not permitted");
        }
        permitted
    }
}

#[async_trait]
impl RequestInspector for AuthorizationInspector {
    fn name(&self) -> &'static str {
        "authorization"
    }

    async fn inspect_request(&self, request: &RelayedRequest) -> bool {
        self.check(request).await
    }

    async fn inspect_upgrade(&self, request: &RelayedRequest) -> bool {
        self.check(request).await
    }
}
