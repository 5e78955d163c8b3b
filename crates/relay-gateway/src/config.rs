use std::net::SocketAddr;
use std::path::Path;

use access_control::AuthConfig;
use anyhow::{bail, Context};
use relay_proxy::{CorsConfig, HeartbeatConfig};
use serde::Deserialize;
use target_resolver::TargetConfig;
use tracing::warn;
use url::Url;

use crate::cli::Cli;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    #[serde(default = "default_status")]
    pub status_addr: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connection_name: default_connection_name(),
            listen_addr: default_listen(),
            status_addr: default_status(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Add the header-logging inspector to the chain.
    #[serde(default = "default_true")]
    pub log_headers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_headers: default_true(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_connection_name() -> String {
    "gateway".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_status() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_max_concurrent() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// If the file does not exist a default configuration is returned and a
/// warning is emitted.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    Ok(config)
}

impl Config {
    /// Merge command-line overrides into the loaded file.
    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(ref listen) = cli.listen {
            self.relay.listen_addr = listen.clone();
        }
        if let Some(ref status) = cli.status_listen {
            self.relay.status_addr = status.clone();
        }
        if let Some(ref target) = cli.default_target {
            self.target.default_host = target.clone();
        }
        if let Some(ref name) = cli.connection_name {
            self.relay.connection_name = name.clone();
        }
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.relay
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.relay.listen_addr))
    }

    pub fn status_addr(&self) -> anyhow::Result<SocketAddr> {
        self.relay
            .status_addr
            .parse()
            .with_context(|| format!("invalid status address '{}'", self.relay.status_addr))
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let name = &self.relay.connection_name;
        if name.is_empty() || name.contains('/') {
            bail!("relay.connection_name must be a single non-empty path segment, got '{name}'");
        }
        if self.relay.max_concurrent_requests == 0 {
            bail!("relay.max_concurrent_requests must be at least 1");
        }
        self.listen_addr()?;
        self.status_addr()?;

        http_url("target.default_host", &self.target.default_host)?;
        for (i, route) in self.target.routes.iter().enumerate() {
            http_url(&format!("target.routes[{i}].host"), &route.host)?;
            if route.match_substring.is_empty() {
                bail!("target.routes[{i}].match must not be empty");
            }
        }

        if self.auth.enabled {
            http_url("auth.tokeninfo_url", &self.auth.tokeninfo_url)?;
            http_url("auth.permission_url", &self.auth.permission_url)?;
        }

        if self.heartbeat.enabled {
            http_url("heartbeat.endpoint", &self.heartbeat.endpoint)?;
            if self.heartbeat.window_secs == 0 {
                bail!("heartbeat.window_secs must be greater than zero");
            }
        }
        Ok(())
    }
}

fn http_url(field: &str, value: &str) -> anyhow::Result<Url> {
    let url = Url::parse(value).with_context(|| format!("{field} is not a valid URL: '{value}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("{field} must be an http(s) URL, got '{value}'");
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    // -----------------------------------------------------------------------
    // load
    // -----------------------------------------------------------------------

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.relay.connection_name, "gateway");
        assert_eq!(config.relay.max_concurrent_requests, 256);
        assert_eq!(config.target.default_host, "http://localhost:9000");
        assert!(config.logging.log_headers);
        assert!(!config.auth.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_file_is_parsed() {
        let file = write_config(
            r#"
relay:
  connection_name: "my-connection"
  listen_addr: "0.0.0.0:9443"
  max_concurrent_requests: 16
target:
  default_host: "http://localhost:9000"
  strip_entity_path_http: true
  strip_authorization: true
  routes:
    - match: "/api/"
      host: "http://localhost:9001"
      strip: "{connection}/api"
cors:
  allowed_origins: ["https://app.example.com"]
  resource_policy: "cross-origin"
  preflight: false
auth:
  enabled: true
  tokeninfo_url: "https://identity.example.com/tokeninfo"
  permission_url: "https://policy.example.com/permission"
  resource_id: "ws-123"
heartbeat:
  enabled: true
  window_secs: 30
  endpoint: "https://lifecycle.example.com/heartbeat"
  workspace_id: "ws-123"
logging:
  level: "debug"
  log_headers: false
"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.relay.connection_name, "my-connection");
        assert_eq!(config.relay.status_addr, "127.0.0.1:8081");
        assert_eq!(config.relay.max_concurrent_requests, 16);
        assert!(config.target.strip_entity_path_http);
        assert!(config.target.strip_authorization);
        assert_eq!(config.target.routes.len(), 1);
        assert_eq!(config.target.routes[0].strip, "{connection}/api");
        assert_eq!(config.cors.allowed_origins, vec!["https://app.example.com"]);
        assert!(!config.cors.preflight);
        assert_eq!(config.auth.resource_type, "workspace");
        assert_eq!(config.auth.action, "connect");
        assert_eq!(config.heartbeat.window_secs, 30);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.log_headers);
        config.validate().unwrap();
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let file = write_config("relay: [unclosed");
        assert!(load(file.path()).is_err());
    }

    // -----------------------------------------------------------------------
    // overrides
    // -----------------------------------------------------------------------

    #[test]
    fn cli_overrides_win() {
        let cli = Cli::parse_from([
            "relay-gateway",
            "--listen",
            "127.0.0.1:7000",
            "--status-listen",
            "127.0.0.1:7001",
            "--default-target",
            "http://localhost:3000",
            "--connection-name",
            "tunnel-a",
        ]);
        let mut config = Config::default();
        config.apply_overrides(&cli);
        assert_eq!(config.relay.listen_addr, "127.0.0.1:7000");
        assert_eq!(config.relay.status_addr, "127.0.0.1:7001");
        assert_eq!(config.target.default_host, "http://localhost:3000");
        assert_eq!(config.relay.connection_name, "tunnel-a");
        assert_eq!(cli.config, std::path::PathBuf::from("gateway.yaml"));
    }

    // -----------------------------------------------------------------------
    // validate
    // -----------------------------------------------------------------------

    #[test]
    fn non_http_default_host_is_rejected() {
        let mut config = Config::default();
        config.target.default_host = "ftp://localhost".to_string();
        assert!(config.validate().is_err());
        config.target.default_host = "localhost:9000".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn connection_name_must_be_one_segment() {
        let mut config = Config::default();
        config.relay.connection_name = String::new();
        assert!(config.validate().is_err());
        config.relay.connection_name = "a/b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn enabled_auth_requires_endpoints() {
        let mut config = Config::default();
        config.auth.enabled = true;
        assert!(config.validate().is_err());
        config.auth.tokeninfo_url = "https://id.example.com/tokeninfo".to_string();
        config.auth.permission_url = "https://policy.example.com/check".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn enabled_heartbeat_requires_endpoint_and_window() {
        let mut config = Config::default();
        config.heartbeat.enabled = true;
        assert!(config.validate().is_err());
        config.heartbeat.endpoint = "https://lifecycle.example.com/beat".to_string();
        config.heartbeat.window_secs = 0;
        assert!(config.validate().is_err());
        config.heartbeat.window_secs = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_addresses_are_rejected() {
        let mut config = Config::default();
        config.relay.listen_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }
}
