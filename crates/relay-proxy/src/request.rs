use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use futures_util::{stream, Stream};
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use target_resolver::TargetResolver;

use crate::error::RelayError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A streamed HTTP body.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// Wrap a fully buffered payload as a [`BodyStream`].
pub fn full_body(bytes: impl Into<Bytes>) -> BodyStream {
    let bytes = bytes.into();
    Box::pin(stream::once(async move { Ok(bytes) }))
}

/// A request exactly as the relay transport delivered it.
pub struct InboundRequest {
    pub tracking_id: String,
    pub method: Method,
    pub uri: Url,
    pub headers: HeaderMap,
    pub body: Option<BodyStream>,
}

impl InboundRequest {
    pub fn new(tracking_id: impl Into<String>, method: Method, uri: Url, headers: HeaderMap) -> Self {
        Self {
            tracking_id: tracking_id.into(),
            method,
            uri,
            headers,
            body: None,
        }
    }

    pub fn with_body(mut self, body: BodyStream) -> Self {
        self.body = Some(body);
        self
    }
}

impl std::fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRequest")
            .field("tracking_id", &self.tracking_id)
            .field("method", &self.method)
            .field("uri", &self.uri.as_str())
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// An inbound request with its local target computed. Immutable once built;
/// the body is only taken by whoever consumes the request.
/// The body is behind a mutex so the request stays `Sync`.
pub struct RelayedRequest {
    tracking_id: String,
    method: Method,
    headers: HeaderMap,
    target_headers: HeaderMap,
    body: Mutex<Option<BodyStream>>,
    source_uri: Url,
    target_url: Url,
    target_ws_uri: Option<Url>,
}

impl RelayedRequest {
    /// Build the relayed form of a plain HTTP request.
    pub fn for_http(inbound: InboundRequest, resolver: &TargetResolver) -> Result<Self, RelayError> {
        let target_url = resolver.resolve_http(&inbound.uri)?;
        Ok(Self::build(inbound, resolver, target_url, None))
    }

    /// Build the relayed form of a WebSocket upgrade request.
    pub fn for_upgrade(
        inbound: InboundRequest,
        resolver: &TargetResolver,
    ) -> Result<Self, RelayError> {
        let target_ws_uri = resolver.resolve_websocket(&inbound.uri)?;
        let target_url = resolver.resolve_http(&inbound.uri)?;
        Ok(Self::build(inbound, resolver, target_url, Some(target_ws_uri)))
    }

    fn build(
        inbound: InboundRequest,
        resolver: &TargetResolver,
        target_url: Url,
        target_ws_uri: Option<Url>,
    ) -> Self {
        let target_headers = resolver.target_headers(&inbound.headers);
        Self {
            tracking_id: inbound.tracking_id,
            method: inbound.method,
            headers: inbound.headers,
            target_headers,
            body: Mutex::new(inbound.body),
            source_uri: inbound.uri,
            target_url,
            target_ws_uri,
        }
    }

    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Headers as received from the caller.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Headers to send to the local target.
    pub fn target_headers(&self) -> &HeaderMap {
        &self.target_headers
    }

    pub fn source_uri(&self) -> &Url {
        &self.source_uri
    }

    pub fn target_url(&self) -> &Url {
        &self.target_url
    }

    pub fn target_ws_uri(&self) -> Option<&Url> {
        self.target_ws_uri.as_ref()
    }

    /// Give up ownership of the body stream.
    pub fn take_body(&mut self) -> Option<BodyStream> {
        self.body
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl std::fmt::Debug for RelayedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayedRequest")
            .field("tracking_id", &self.tracking_id)
            .field("method", &self.method)
            .field("source_uri", &self.source_uri.as_str())
            .field("target_url", &self.target_url.as_str())
            .field("target_ws_uri", &self.target_ws_uri.as_ref().map(Url::as_str))
            .finish()
    }
}

/// A response headed back to the caller, either translated from the local
/// target or synthesized by the gateway.
pub struct TargetResponse {
    pub tracking_id: String,
    pub status: StatusCode,
    pub status_text: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<BodyStream>,
}

impl TargetResponse {
    pub fn new(tracking_id: impl Into<String>, status: StatusCode) -> Self {
        Self {
            tracking_id: tracking_id.into(),
            status,
            status_text: status.canonical_reason().map(str::to_string),
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

impl std::fmt::Debug for TargetResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetResponse")
            .field("tracking_id", &self.tracking_id)
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}
