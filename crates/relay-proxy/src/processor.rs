use std::time::Duration;

use futures_util::TryStreamExt;
use http::header::{
    CONTENT_LENGTH, CONTENT_SECURITY_POLICY, CONTENT_TYPE, HOST, SET_COOKIE, TRANSFER_ENCODING,
    VIA,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use target_resolver::TargetConfig;

use crate::cors::CorsConfig;
use crate::error::RelayError;
use crate::request::{full_body, BoxError, RelayedRequest, TargetResponse};

const COOKIE_ATTRIBUTES: &str = "Secure; SameSite=None; HttpOnly; Partitioned";

/// Executes accepted requests against the local target and translates the
/// answer for the caller.
pub struct HttpRelayProcessor {
    client: reqwest::Client,
    cors: CorsConfig,
}

impl HttpRelayProcessor {
    pub fn new(client: reqwest::Client, cors: CorsConfig) -> Self {
        Self { client, cors }
    }

    /// Build a processor whose HTTP client uses the target's connect and
    /// read timeouts. Redirects are handed back to the caller untouched.
    pub fn from_config(target: &TargetConfig, cors: CorsConfig) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(target.connect_timeout_secs))
            .read_timeout(Duration::from_secs(target.read_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self::new(client, cors))
    }

    pub fn cors(&self) -> &CorsConfig {
        &self.cors
    }

    /// Relay `request` and always produce a response: failures become a
    /// synthesized JSON error.
    pub async fn execute(&self, request: RelayedRequest) -> TargetResponse {
        let tracking_id = request.tracking_id().to_string();
        match self.try_execute(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(%tracking_id, %err, "relayed request failed");
                error_response(&tracking_id, StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
            }
        }
    }

    pub async fn try_execute(
        &self,
        mut request: RelayedRequest,
    ) -> Result<TargetResponse, RelayError> {
        let origin = self.cors.check_origin(request.headers())?;

        let mut headers = request.target_headers().clone();
        headers.remove(HOST);
        headers.remove(VIA);
        headers.remove(TRANSFER_ENCODING);

        let method = request.method().clone();
        let mut builder = self
            .client
            .request(method.clone(), request.target_url().clone());

        match request.take_body().filter(|_| carries_body(&method)) {
            Some(body) => builder = builder.body(reqwest::Body::wrap_stream(body)),
            None => {
                headers.remove(CONTENT_LENGTH);
            }
        }

        tracing::debug!(
            tracking_id = request.tracking_id(),
            %method,
            target = %request.target_url(),
            "dispatching to local target"
        );

        let response = builder.headers(headers).send().await?;
        let status = response.status();
        let mut translated = TargetResponse::new(request.tracking_id(), status);
        translated.headers = translate_response_headers(response.headers());
        if let Some(origin) = origin {
            self.cors.apply_headers(&mut translated.headers, &origin);
        }
        translated.body = Some(Box::pin(
            response.bytes_stream().map_err(|e| Box::new(e) as BoxError),
        ));

        tracing::info!(
            tracking_id = request.tracking_id(),
            %method,
            status = status.as_u16(),
            "local target answered"
        );
        Ok(translated)
    }
}

fn carries_body(method: &Method) -> bool {
    method != Method::GET && method != Method::HEAD
}

/// Collapse the target's headers for the caller.
///
/// Only the first value of a multi-valued header survives, since the relay
/// response carries one value per name. `Transfer-Encoding` and
/// `Content-Security-Policy` are dropped and `Set-Cookie` is rewritten for
/// cross-site use.
pub fn translate_response_headers(source: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(source.keys_len());
    for name in source.keys() {
        if name == TRANSFER_ENCODING || name == CONTENT_SECURITY_POLICY {
            continue;
        }
        let Some(value) = source.get(name) else {
            continue;
        };
        if name == SET_COOKIE {
            let rewritten = value
                .to_str()
                .map_err(|e| e.to_string())
                .and_then(|cookie| {
                    HeaderValue::from_str(&rewrite_cookie(cookie)).map_err(|e| e.to_string())
                });
            match rewritten {
                Ok(value) => {
                    out.insert(SET_COOKIE, value);
                }
                Err(err) => {
                    tracing::warn!(%err, "Set-Cookie from target cannot be rewritten, dropped");
                }
            }
        } else {
            out.insert(name.clone(), value.clone());
        }
    }
    out
}

/// Force `Secure; SameSite=None; HttpOnly; Partitioned` on a cookie,
/// replacing whatever the target set for those attributes.
pub fn rewrite_cookie(cookie: &str) -> String {
    let mut parts = cookie.split(';').map(str::trim).filter(|p| !p.is_empty());
    let mut kept: Vec<&str> = parts.next().into_iter().collect();
    kept.extend(parts.filter(|attr| {
        let name = attr.split('=').next().unwrap_or_default().trim();
        !["secure", "samesite", "httponly", "partitioned"]
            .iter()
            .any(|a| name.eq_ignore_ascii_case(a))
    }));
    kept.push(COOKIE_ATTRIBUTES);
    kept.join("; ")
}

/// A gateway-made error: JSON `{"message", "tracking_id"}` and no CORS or
/// cookie handling.
pub fn error_response(tracking_id: &str, status: StatusCode, message: &str) -> TargetResponse {
    let body = serde_json::json!({
        "message": message,
        "tracking_id": tracking_id,
    });
    let mut response = TargetResponse::new(tracking_id, status);
    response
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response.body = Some(full_body(body.to_string()));
    response
}
