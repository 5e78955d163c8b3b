use std::borrow::Cow;

use http::HeaderMap;
use tracing::{debug, trace};
use url::Url;

use crate::error::ResolveError;
use crate::headers::translate_headers;
use crate::path::build_target_path;
use crate::rule::{RoutingRule, TargetConfig};

/// The routing decision for one inbound URI: where to send it and which
/// segment sequence to drop from its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route<'a> {
    /// `None` when the default rule was selected.
    pub rule: Option<&'a RoutingRule>,
    pub host: &'a str,
    pub strip: Cow<'a, str>,
}

/// Computes local target URLs for URIs presented by the relay.
#[derive(Debug, Clone)]
pub struct TargetResolver {
    connection_name: String,
    default_host: String,
    rules: Vec<RoutingRule>,
    strip_entity_path_http: bool,
    strip_entity_path_ws: bool,
    strip_authorization: bool,
}

impl TargetResolver {
    pub fn new(connection_name: impl Into<String>, config: &TargetConfig) -> Self {
        Self {
            connection_name: connection_name.into(),
            default_host: config.default_host.clone(),
            rules: config.routes.clone(),
            strip_entity_path_http: config.strip_entity_path_http,
            strip_entity_path_ws: config.strip_entity_path_ws,
            strip_authorization: config.strip_authorization,
        }
    }

    /// The tunnel's logical connection name (entity path).
    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    /// Select the first rule matching `uri`, falling back to the default rule.
    pub fn route(&self, uri: &Url, strip_entity_path: bool) -> Route<'_> {
        let uri_str = uri.as_str();

        if let Some(rule) = self.rules.iter().find(|r| r.matches(uri_str)) {
            trace!(rule = %rule.match_substring, uri = uri_str, "routing rule matched");
            return Route {
                rule: Some(rule),
                host: &rule.host,
                strip: Cow::Owned(rule.strip_segment(&self.connection_name)),
            };
        }

        let strip = if strip_entity_path {
            Cow::Borrowed(self.connection_name.as_str())
        } else {
            Cow::Borrowed("")
        };
        Route {
            rule: None,
            host: &self.default_host,
            strip,
        }
    }

    /// Resolve `uri` to a local target.
    ///
    /// `strip_entity_path` only affects the default rule. When `is_websocket`
    /// is set the resulting scheme is rewritten `http -> ws`, `https -> wss`;
    /// any other target scheme is rejected.
    pub fn resolve(
        &self,
        uri: &Url,
        is_websocket: bool,
        strip_entity_path: bool,
    ) -> Result<Url, ResolveError> {
        let route = self.route(uri, strip_entity_path);

        let mut target = format!(
            "{}{}",
            route.host.trim_end_matches('/'),
            build_target_path(uri.path(), &route.strip)
        );
        if let Some(query) = uri.query() {
            target.push('?');
            target.push_str(query);
        }

        let mut url = Url::parse(&target)
            .map_err(|e| ResolveError::invalid(uri.as_str(), format!("{target}: {e}")))?;

        if is_websocket {
            let scheme = match url.scheme() {
                "http" => "ws",
                "https" => "wss",
                other => {
                    return Err(ResolveError::invalid(
                        uri.as_str(),
                        format!("unsupported scheme '{other}' for a WebSocket target"),
                    ))
                }
            };
            url.set_scheme(scheme).map_err(|()| {
                ResolveError::invalid(uri.as_str(), format!("cannot rewrite scheme to {scheme}"))
            })?;
        }

        debug!(source = %uri, target = %url, is_websocket, "resolved target");
        Ok(url)
    }

    /// Resolve an HTTP target using the configured HTTP entity-path flag.
    pub fn resolve_http(&self, uri: &Url) -> Result<Url, ResolveError> {
        self.resolve(uri, false, self.strip_entity_path_http)
    }

    /// Resolve a WebSocket target using the configured WebSocket entity-path flag.
    pub fn resolve_websocket(&self, uri: &Url) -> Result<Url, ResolveError> {
        self.resolve(uri, true, self.strip_entity_path_ws)
    }

    /// Headers to forward to the local target.
    pub fn target_headers(&self, headers: &HeaderMap) -> HeaderMap {
        translate_headers(headers, self.strip_authorization)
    }
}
