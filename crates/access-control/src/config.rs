use serde::{Deserialize, Serialize};

/// Settings for the authorization gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Token introspection endpoint, called as `GET <url>?access_token=<token>`.
    #[serde(default)]
    pub tokeninfo_url: String,
    /// Resource-permission endpoint of the policy service.
    #[serde(default)]
    pub permission_url: String,
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default = "default_action")]
    pub action: String,
    /// Cookie consulted when no bearer `Authorization` header is present.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tokeninfo_url: String::new(),
            permission_url: String::new(),
            resource_type: default_resource_type(),
            resource_id: String::new(),
            action: default_action(),
            cookie_name: default_cookie_name(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_resource_type() -> String {
    "workspace".to_string()
}

fn default_action() -> String {
    "connect".to_string()
}

fn default_cookie_name() -> String {
    "access_token".to_string()
}

fn default_request_timeout() -> u64 {
    10
}
