use serde::{Deserialize, Serialize};

/// Placeholder in a rule's `strip` segment that is replaced by the tunnel's
/// connection name before matching.
pub const CONNECTION_NAME_TOKEN: &str = "{connection}";

/// A single routing rule. Rules are evaluated in declaration order and the
/// first rule whose `match` string occurs anywhere in the inbound URI wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingRule {
    /// Substring searched for in the full inbound URI.
    #[serde(rename = "match")]
    pub match_substring: String,
    /// Base URL of the local service for matching requests.
    pub host: String,
    /// Path segment sequence removed from the inbound path. May contain
    /// [`CONNECTION_NAME_TOKEN`].
    #[serde(default)]
    pub strip: String,
}

impl RoutingRule {
    pub fn new(
        match_substring: impl Into<String>,
        host: impl Into<String>,
        strip: impl Into<String>,
    ) -> Self {
        Self {
            match_substring: match_substring.into(),
            host: host.into(),
            strip: strip.into(),
        }
    }

    /// Returns `true` if this rule applies to the given inbound URI string.
    pub fn matches(&self, uri: &str) -> bool {
        !self.match_substring.is_empty() && uri.contains(&self.match_substring)
    }

    /// The strip segment with the connection-name token substituted.
    pub fn strip_segment(&self, connection_name: &str) -> String {
        self.strip.replace(CONNECTION_NAME_TOKEN, connection_name)
    }
}

/// Static routing configuration for the local target side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URL used when no routing rule matches.
    #[serde(default = "default_host")]
    pub default_host: String,
    /// Strip the connection-name segment from HTTP targets under the default rule.
    #[serde(default)]
    pub strip_entity_path_http: bool,
    /// Strip the connection-name segment from WebSocket targets under the default rule.
    #[serde(default)]
    pub strip_entity_path_ws: bool,
    /// Drop the `Authorization` header before forwarding.
    #[serde(default)]
    pub strip_authorization: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default)]
    pub routes: Vec<RoutingRule>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            default_host: default_host(),
            strip_entity_path_http: false,
            strip_entity_path_ws: false,
            strip_authorization: false,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            routes: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "http://localhost:9000".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    120
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_matches_by_substring() {
        let rule = RoutingRule::new("/api/", "http://localhost:9001", "");
        assert!(rule.matches("https://relay/conn/api/users"));
        assert!(!rule.matches("https://relay/conn/apix"));
    }

    #[test]
    fn empty_match_string_never_matches() {
        let rule = RoutingRule::new("", "http://localhost:9001", "");
        assert!(!rule.matches("https://relay/conn/api"));
    }

    #[test]
    fn strip_segment_substitutes_connection_name() {
        let rule = RoutingRule::new("/api", "http://h", "{connection}/api");
        assert_eq!(rule.strip_segment("conn"), "conn/api");
    }

    #[test]
    fn deserializes_yaml_routes() {
        let yaml = r#"
default_host: "http://localhost:7000"
strip_entity_path_http: true
routes:
  - match: "/grafana"
    host: "http://localhost:3000"
    strip: "{connection}/grafana"
  - match: "/docs"
    host: "http://localhost:4000"
"#;
        let config: TargetConfig = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.default_host, "http://localhost:7000");
        assert!(config.strip_entity_path_http);
        assert!(!config.strip_entity_path_ws);
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].match_substring, "/grafana");
        assert_eq!(config.routes[1].strip, "");
        assert_eq!(config.read_timeout_secs, 120);
    }
}
