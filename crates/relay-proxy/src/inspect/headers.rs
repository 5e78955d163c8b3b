use async_trait::async_trait;
use http::HeaderMap;

use super::RequestInspector;
use crate::request::RelayedRequest;

const MASK: &str = "***";

/// Render headers for logging, masking any header whose name contains
/// "authorization" (this also covers `Proxy-Authorization`).
pub fn masked_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| {
            let name = name.as_str().to_string();
            let value = if name.contains("authorization") {
                MASK.to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            (name, value)
        })
        .collect();
    out.sort();
    out
}

/// Logs the caller's headers. Never rejects.
#[derive(Debug, Default)]
pub struct HeaderLogger;

impl HeaderLogger {
    fn log(&self, request: &RelayedRequest, kind: &'static str) {
        let headers = masked_headers(request.headers())
            .into_iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(
            tracking_id = request.tracking_id(),
            method = %request.method(),
            uri = %request.source_uri(),
            kind,
            headers = %headers,
            "inbound request"
        );
    }
}

#[async_trait]
impl RequestInspector for HeaderLogger {
    fn name(&self) -> &'static str {
        "header-logger"
    }

    async fn inspect_request(&self, request: &RelayedRequest) -> bool {
        self.log(request, "http");
        true
    }

    async fn inspect_upgrade(&self, request: &RelayedRequest) -> bool {
        self.log(request, "upgrade");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::tests::relayed;
    use http::HeaderValue;

    #[test]
    fn authorization_like_headers_are_masked() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic xyz"));
        headers.insert("accept", HeaderValue::from_static("text/html"));

        let masked = masked_headers(&headers);
        assert_eq!(
            masked,
            vec![
                ("accept".to_string(), "text/html".to_string()),
                ("authorization".to_string(), "***".to_string()),
                ("proxy-authorization".to_string(), "***".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn logger_always_accepts() {
        let logger = HeaderLogger;
        let req = relayed(HeaderMap::new());
        assert!(logger.inspect_request(&req).await);
        assert!(logger.inspect_upgrade(&req).await);
    }
}
