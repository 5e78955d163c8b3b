use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ORIGIN, VARY,
};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::request::TargetResponse;

const CROSS_ORIGIN_RESOURCE_POLICY: HeaderName =
    HeaderName::from_static("cross-origin-resource-policy");

/// CORS allow-list and the parameters echoed back to allowed origins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origin patterns (glob-style with `*`).
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: String,
    #[serde(default = "default_allowed_headers")]
    pub allowed_headers: String,
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
    /// Value for `Cross-Origin-Resource-Policy`, if any.
    #[serde(default)]
    pub resource_policy: Option<String>,
    /// Answer `OPTIONS` locally instead of relaying it.
    #[serde(default = "default_true")]
    pub preflight: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_methods: default_allowed_methods(),
            allowed_headers: default_allowed_headers(),
            max_age_secs: default_max_age(),
            resource_policy: None,
            preflight: default_true(),
        }
    }
}

fn default_allowed_methods() -> String {
    "GET, POST, PUT, PATCH, DELETE, OPTIONS".to_string()
}

fn default_allowed_headers() -> String {
    "Authorization, Content-Type".to_string()
}

fn default_max_age() -> u64 {
    86400
}

fn default_true() -> bool {
    true
}

/// Match an origin against an allow-list entry. `*` stands for any run of
/// characters; the text before the first `*` must prefix the origin and the
/// text after the last `*` must end it, without the two overlapping.
fn origin_matches(pattern: &str, origin: &str) -> bool {
    let Some((head, rest)) = pattern.split_once('*') else {
        return pattern == origin;
    };
    let (middle, tail) = rest.rsplit_once('*').unwrap_or(("", rest));

    let Some(inner) = origin
        .strip_prefix(head)
        .and_then(|rest| rest.strip_suffix(tail))
    else {
        return false;
    };

    middle
        .split('*')
        .filter(|part| !part.is_empty())
        .try_fold(inner, |left, part| {
            left.find(part).map(|pos| &left[pos + part.len()..])
        })
        .is_some()
}

impl CorsConfig {
    pub fn is_allowed(&self, origin: &str) -> bool {
        !origin.is_empty()
            && self
                .allowed_origins
                .iter()
                .any(|pattern| origin_matches(pattern, origin))
    }

    /// Look at the request's `Origin`.
    ///
    /// - No `Origin` header: `Ok(None)`, no CORS headers are due.
    /// - Allowed origin: `Ok(Some(origin))`.
    /// - Anything else: `Err(OriginNotAllowed)`.
    pub fn check_origin(&self, headers: &HeaderMap) -> Result<Option<String>, RelayError> {
        let Some(value) = headers.get(ORIGIN) else {
            return Ok(None);
        };
        let origin = String::from_utf8_lossy(value.as_bytes()).into_owned();
        if self.is_allowed(&origin) {
            Ok(Some(origin))
        } else {
            Err(RelayError::OriginNotAllowed { origin })
        }
    }

    /// Add the CORS response headers for an allowed `origin`.
    pub fn apply_headers(&self, headers: &mut HeaderMap, origin: &str) {
        let mut set = |name: HeaderName, value: &str| {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        };
        set(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        set(ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
        set(ACCESS_CONTROL_ALLOW_METHODS, &self.allowed_methods);
        set(ACCESS_CONTROL_ALLOW_HEADERS, &self.allowed_headers);
        set(ACCESS_CONTROL_MAX_AGE, &self.max_age_secs.to_string());
        if let Some(policy) = &self.resource_policy {
            set(CROSS_ORIGIN_RESOURCE_POLICY, policy);
        }
        set(VARY, "Origin");
    }

    /// Answer a preflight `OPTIONS` without touching the target. CORS headers
    /// are only attached for allowed origins.
    pub fn preflight_response(&self, tracking_id: &str, headers: &HeaderMap) -> TargetResponse {
        let mut response = TargetResponse::new(tracking_id, StatusCode::NO_CONTENT);
        match self.check_origin(headers) {
            Ok(Some(origin)) => self.apply_headers(&mut response.headers, &origin),
            Ok(None) => {}
            Err(err) => tracing::warn!(tracking_id, %err, "preflight from disallowed origin"),
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CorsConfig {
        CorsConfig {
            allowed_origins: vec![
                "https://app.example.com".to_string(),
                "https://*.preview.example.com".to_string(),
            ],
            resource_policy: Some("cross-origin".to_string()),
            ..CorsConfig::default()
        }
    }

    fn origin(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static(value));
        headers
    }

    // -----------------------------------------------------------------------
    // check_origin
    // -----------------------------------------------------------------------

    #[test]
    fn no_origin_means_no_cors() {
        assert_eq!(config().check_origin(&HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn allowed_origin_is_returned() {
        let found = config().check_origin(&origin("https://app.example.com")).unwrap();
        assert_eq!(found.as_deref(), Some("https://app.example.com"));
        assert!(config()
            .check_origin(&origin("https://pr-7.preview.example.com"))
            .is_ok());
    }

    #[test]
    fn disallowed_origin_is_an_error() {
        match config().check_origin(&origin("https://evil.com")) {
            Err(RelayError::OriginNotAllowed { origin }) => assert_eq!(origin, "https://evil.com"),
            other => panic!("expected OriginNotAllowed, got {other:?}"),
        }
    }

    #[test]
    fn localhost_is_not_implicitly_allowed() {
        assert!(config().check_origin(&origin("http://localhost:3000")).is_err());
    }

    #[test]
    fn empty_allow_list_rejects_every_origin() {
        assert!(CorsConfig::default()
            .check_origin(&origin("https://app.example.com"))
            .is_err());
    }

    // -----------------------------------------------------------------------
    // headers and preflight
    // -----------------------------------------------------------------------

    #[test]
    fn apply_headers_echoes_configuration() {
        let mut headers = HeaderMap::new();
        config().apply_headers(&mut headers, "https://app.example.com");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example.com");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(
            headers[ACCESS_CONTROL_ALLOW_METHODS],
            "GET, POST, PUT, PATCH, DELETE, OPTIONS"
        );
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_HEADERS], "Authorization, Content-Type");
        assert_eq!(headers[ACCESS_CONTROL_MAX_AGE], "86400");
        assert_eq!(headers[CROSS_ORIGIN_RESOURCE_POLICY], "cross-origin");
        assert_eq!(headers[VARY], "Origin");
    }

    #[test]
    fn preflight_is_204_with_cors_for_allowed_origin() {
        let resp = config().preflight_response("t", &origin("https://app.example.com"));
        assert_eq!(resp.status, StatusCode::NO_CONTENT);
        assert!(resp.headers.contains_key(ACCESS_CONTROL_ALLOW_ORIGIN));
        assert!(resp.body.is_none());
    }

    #[test]
    fn preflight_from_disallowed_origin_has_no_cors() {
        let resp = config().preflight_response("t", &origin("https://evil.com"));
        assert_eq!(resp.status, StatusCode::NO_CONTENT);
        assert!(resp.headers.is_empty());
    }

    // -----------------------------------------------------------------------
    // origin patterns
    // -----------------------------------------------------------------------

    #[test]
    fn exact_patterns_match_whole_origin() {
        assert!(origin_matches("https://app.example.com", "https://app.example.com"));
        assert!(!origin_matches("https://app.example.com", "https://app.example.com.evil"));
    }

    #[test]
    fn wildcards_match_any_run() {
        assert!(origin_matches("https://*.example.com", "https://app.example.com"));
        assert!(origin_matches("https://*.example.*", "https://app.example.org"));
        assert!(origin_matches("https://*-*.example.com", "https://a-b.example.com"));
        assert!(!origin_matches("https://*-*.example.com", "https://ab.example.com"));
        assert!(origin_matches("*", "https://anything"));
    }

    #[test]
    fn prefix_and_suffix_must_not_overlap() {
        assert!(!origin_matches("https://a*a.com", "https://a.com"));
        assert!(!origin_matches("ab*ba", "aba"));
    }
}
