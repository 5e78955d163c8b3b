//! Token introspection.
//!
//! The identity endpoint answers `GET tokeninfo?access_token=<token>` either
//! with an opaque-token document (`{"error": ..., "expires_in": ..., ...claims}`)
//! or with a self-contained signed token in compact JWS form whose payload
//! carries the claims and an `exp` timestamp. Both shapes are reduced to a
//! [`TokenInfo`].

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::clock::Clock;
use crate::error::AccessError;

/// Claims and expiry of an introspected token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub claims: Map<String, Value>,
    pub expires_at: DateTime<Utc>,
}

impl TokenInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Convenience accessor for a string claim such as `sub` or `scope`.
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }
}

/// Resolves a raw access token into claims and an expiry.
#[async_trait]
pub trait TokenIntrospector: Send + Sync {
    async fn introspect(&self, token: &str) -> Result<TokenInfo, AccessError>;
}

/// [`TokenIntrospector`] backed by an OAuth `tokeninfo` endpoint.
pub struct HttpTokenIntrospector {
    client: reqwest::Client,
    endpoint: Url,
    clock: Arc<dyn Clock>,
}

impl HttpTokenIntrospector {
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AccessError> {
        let endpoint = Url::parse(endpoint).map_err(|e| AccessError::InvalidEndpoint {
            url: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            endpoint,
            clock,
        })
    }
}

#[async_trait]
impl TokenIntrospector for HttpTokenIntrospector {
    async fn introspect(&self, token: &str) -> Result<TokenInfo, AccessError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("access_token", token);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| AccessError::Transport {
                service: "tokeninfo",
                source,
            })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| AccessError::Transport {
                service: "tokeninfo",
                source,
            })?;

        debug!(status = status.as_u16(), "tokeninfo answered");

        // Invalid tokens usually come back as 400 with an `error` document,
        // so the body is parsed before the status is considered.
        let info = parse_tokeninfo(&body, self.clock.now())?;
        if !status.is_success() {
            return Err(AccessError::Rejected {
                reason: format!("tokeninfo status {status}"),
            });
        }
        Ok(info)
    }
}

/// Parse a tokeninfo response body received at `now`.
pub fn parse_tokeninfo(body: &str, now: DateTime<Utc>) -> Result<TokenInfo, AccessError> {
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        parse_opaque(trimmed, now)
    } else {
        parse_signed(trimmed.trim_matches('"'))
    }
}

fn parse_opaque(body: &str, now: DateTime<Utc>) -> Result<TokenInfo, AccessError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| AccessError::malformed("tokeninfo response", e.to_string()))?;
    let Value::Object(mut claims) = value else {
        return Err(AccessError::malformed("tokeninfo response", "not a JSON object"));
    };

    if let Some(error) = claims.get("error").filter(|v| !v.is_null()) {
        let mut reason = value_to_string(error);
        if let Some(description) = claims.get("error_description").and_then(Value::as_str) {
            reason = format!("{reason}: {description}");
        }
        return Err(AccessError::Rejected { reason });
    }

    let expires_at = match claims.remove("expires_in") {
        Some(v) => {
            let secs = as_i64(&v)
                .ok_or_else(|| AccessError::malformed("tokeninfo response", "non-numeric expires_in"))?;
            TimeDelta::try_seconds(secs)
                .and_then(|delta| now.checked_add_signed(delta))
                .ok_or_else(|| AccessError::malformed("tokeninfo response", "expires_in out of range"))?
        }
        None => claims
            .get("exp")
            .and_then(as_i64)
            .and_then(|exp| DateTime::from_timestamp(exp, 0))
            .ok_or_else(|| AccessError::malformed("tokeninfo response", "missing expires_in"))?,
    };

    Ok(TokenInfo { claims, expires_at })
}

fn parse_signed(token: &str) -> Result<TokenInfo, AccessError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AccessError::malformed("signed token", "expected three segments"));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AccessError::malformed("signed token", e.to_string()))?;
    let claims: Map<String, Value> = serde_json::from_slice(&bytes)
        .map_err(|e| AccessError::malformed("signed token", e.to_string()))?;

    let expires_at = claims
        .get("exp")
        .and_then(as_i64)
        .and_then(|exp| DateTime::from_timestamp(exp, 0))
        .ok_or_else(|| AccessError::malformed("signed token", "missing exp claim"))?;

    Ok(TokenInfo { claims, expires_at })
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{stub_server, StubResponse};
    use crate::SystemClock;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn signed(payload: &str) -> String {
        format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256"}"#),
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode("sig")
        )
    }

    // -----------------------------------------------------------------------
    // opaque responses
    // -----------------------------------------------------------------------

    #[test]
    fn opaque_response_uses_expires_in() {
        let info =
            parse_tokeninfo(r#"{"expires_in": 3600, "sub": "alice", "scope": "read"}"#, now())
                .unwrap();
        assert_eq!(info.expires_at, now() + TimeDelta::seconds(3600));
        assert_eq!(info.claim_str("sub"), Some("alice"));
        assert!(!info.claims.contains_key("expires_in"));
    }

    #[test]
    fn opaque_response_accepts_string_expiry() {
        let info = parse_tokeninfo(r#"{"expires_in": "60"}"#, now()).unwrap();
        assert_eq!(info.expires_at, now() + TimeDelta::seconds(60));
    }

    #[test]
    fn opaque_error_is_rejection() {
        let err = parse_tokeninfo(
            r#"{"error": "invalid_token", "error_description": "expired"}"#,
            now(),
        )
        .unwrap_err();
        match err {
            AccessError::Rejected { reason } => assert_eq!(reason, "invalid_token: expired"),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn opaque_without_expiry_is_malformed() {
        let err = parse_tokeninfo(r#"{"sub": "alice"}"#, now()).unwrap_err();
        assert!(matches!(err, AccessError::Malformed { .. }));
    }

    #[test]
    fn null_error_is_ignored() {
        let info = parse_tokeninfo(r#"{"error": null, "expires_in": 5}"#, now()).unwrap();
        assert_eq!(info.expires_at, now() + TimeDelta::seconds(5));
    }

    // -----------------------------------------------------------------------
    // signed tokens
    // -----------------------------------------------------------------------

    #[test]
    fn out_of_range_expiry_is_malformed() {
        for body in [
            r#"{"expires_in": 100000000000000}"#,
            r#"{"expires_in": 9223372036854775807}"#,
            r#"{"expires_in": -9223372036854775808}"#,
        ] {
            let err = parse_tokeninfo(body, now()).unwrap_err();
            assert!(matches!(err, AccessError::Malformed { .. }), "{body}: {err}");
        }
    }

    #[test]
    fn signed_token_uses_exp_claim() {
        let token = signed(r#"{"sub":"bob","exp":1700000500}"#);
        let info = parse_tokeninfo(&token, now()).unwrap();
        assert_eq!(info.expires_at.timestamp(), 1_700_000_500);
        assert_eq!(info.claim_str("sub"), Some("bob"));
    }

    #[test]
    fn quoted_signed_token_is_accepted() {
        let token = format!("\"{}\"", signed(r#"{"exp":1700000001}"#));
        assert!(parse_tokeninfo(&token, now()).is_ok());
    }

    #[test]
    fn signed_token_without_exp_is_malformed() {
        let err = parse_tokeninfo(&signed(r#"{"sub":"bob"}"#), now()).unwrap_err();
        assert!(matches!(err, AccessError::Malformed { .. }));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(parse_tokeninfo("not-a-token", now()).is_err());
        assert!(parse_tokeninfo("a.b", now()).is_err());
        assert!(parse_tokeninfo("a.!!!.c", now()).is_err());
    }

    // -----------------------------------------------------------------------
    // HTTP introspector
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn http_introspector_sends_token_as_query() {
        let (addr, seen) = stub_server(StubResponse::ok(r#"{"expires_in": 120}"#)).await;
        let introspector = HttpTokenIntrospector::new(
            reqwest::Client::new(),
            &format!("http://{addr}/tokeninfo"),
            Arc::new(SystemClock),
        )
        .unwrap();

        let info = introspector.introspect("tok en").await.unwrap();
        assert!(info.expires_at > Utc::now());

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].uri, "/tokeninfo?access_token=tok+en");
    }

    #[tokio::test]
    async fn http_introspector_rejects_error_status() {
        let (addr, _) = stub_server(StubResponse::new(401, r#"{"expires_in": 120}"#)).await;
        let introspector = HttpTokenIntrospector::new(
            reqwest::Client::new(),
            &format!("http://{addr}/tokeninfo"),
            Arc::new(SystemClock),
        )
        .unwrap();

        let err = introspector.introspect("t").await.unwrap_err();
        assert!(matches!(err, AccessError::Rejected { .. }));
    }

    #[test]
    fn invalid_endpoint_is_reported() {
        let result =
            HttpTokenIntrospector::new(reqwest::Client::new(), "::nope", Arc::new(SystemClock));
        assert!(matches!(result, Err(AccessError::InvalidEndpoint { .. })));
    }
}
