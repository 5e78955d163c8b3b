use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use access_control::Clock;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::authorization::bearer_token;
use super::RequestInspector;
use crate::error::RelayError;
use crate::request::RelayedRequest;

/// Settings for the keep-alive pings sent to the lifecycle service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Minimum number of seconds between two pings.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub workspace_id: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_secs: default_window_secs(),
            endpoint: String::new(),
            workspace_id: String::new(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

/// Client for the external lifecycle endpoint.
#[async_trait]
pub trait LifecycleClient: Send + Sync {
    async fn keep_alive(
        &self,
        token: &str,
        workspace_id: &str,
        connection_name: &str,
    ) -> Result<(), RelayError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeepAlive<'a> {
    workspace_id: &'a str,
    connection_name: &'a str,
}

/// [`LifecycleClient`] that POSTs a JSON keep-alive with the caller's token.
pub struct HttpLifecycleClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpLifecycleClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, RelayError> {
        let endpoint = Url::parse(endpoint).map_err(|e| RelayError::External {
            service: "lifecycle",
            reason: format!("invalid endpoint '{endpoint}': {e}"),
        })?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl LifecycleClient for HttpLifecycleClient {
    async fn keep_alive(
        &self,
        token: &str,
        workspace_id: &str,
        connection_name: &str,
    ) -> Result<(), RelayError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(token)
            .json(&KeepAlive {
                workspace_id,
                connection_name,
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::External {
                service: "lifecycle",
                reason: format!("status {status}"),
            });
        }
        Ok(())
    }
}

/// Fire-and-forget keep-alive on a sliding window. Never rejects.
///
/// At most one ping is started per window, no matter how many requests
/// arrive concurrently. Requests without a bearer token do not consume the
/// window.
pub struct HeartbeatInspector {
    client: Arc<dyn LifecycleClient>,
    clock: Arc<dyn Clock>,
    window: TimeDelta,
    workspace_id: String,
    connection_name: String,
    last_sent: Mutex<Option<DateTime<Utc>>>,
}

impl HeartbeatInspector {
    pub fn new(
        config: &HeartbeatConfig,
        connection_name: impl Into<String>,
        client: Arc<dyn LifecycleClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let window = i64::try_from(config.window_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        Self {
            client,
            clock,
            window,
            workspace_id: config.workspace_id.clone(),
            connection_name: connection_name.into(),
            last_sent: Mutex::new(None),
        }
    }

    /// Atomically check the window and advance it. Returns `true` when the
    /// caller should send a ping.
    fn claim_slot(&self) -> bool {
        let now = self.clock.now();
        let mut last = self.last_sent.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(sent) if now.signed_duration_since(sent) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn beat(&self, request: &RelayedRequest) {
        let Some(token) = bearer_token(request.headers()) else {
            return;
        };
        if !self.claim_slot() {
            return;
        }

        let client = Arc::clone(&self.client);
        let token = token.to_string();
        let workspace_id = self.workspace_id.clone();
        let connection_name = self.connection_name.clone();
        let tracking_id = request.tracking_id().to_string();
        tokio::spawn(async move {
            match client.keep_alive(&token, &workspace_id, &connection_name).await {
                Ok(()) => tracing::debug!(%tracking_id, "heartbeat sent"),
                Err(err) => tracing::warn!(%tracking_id, %err, "heartbeat failed"),
            }
        });
    }
}

#[async_trait]
impl RequestInspector for HeartbeatInspector {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn inspect_request(&self, request: &RelayedRequest) -> bool {
        self.beat(request);
        true
    }

    async fn inspect_upgrade(&self, request: &RelayedRequest) -> bool {
        self.beat(request);
        true
    }
}
