use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::clock::{epoch, Clock};
use crate::config::AuthConfig;
use crate::error::AccessError;
use crate::permission::{HttpPermissionService, PermissionService, ResourceSpec};
use crate::token::{HttpTokenIntrospector, TokenIntrospector};

/// Outcome of one permission evaluation for a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedPermission {
    pub granted: bool,
    pub expires_at: DateTime<Utc>,
}

impl CachedPermission {
    pub fn granted(expires_at: DateTime<Utc>) -> Self {
        Self {
            granted: true,
            expires_at,
        }
    }

    pub fn denied() -> Self {
        Self {
            granted: false,
            expires_at: epoch(),
        }
    }

    /// A permission is only servable while granted and strictly before expiry.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.granted && self.expires_at > now
    }
}

type Slot = Arc<OnceCell<CachedPermission>>;

/// Memoizes the external authorization decision per raw access token.
///
/// Each distinct token is evaluated at most once for as long as its grant is
/// valid; concurrent lookups for the same token share the single in-flight
/// evaluation. Denials and failures are handed back to the callers that
/// waited on them and then dropped, so the next lookup evaluates again.
pub struct PermissionCache {
    introspector: Arc<dyn TokenIntrospector>,
    policy: Arc<dyn PermissionService>,
    resource: ResourceSpec,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Slot>>,
}

impl PermissionCache {
    pub fn new(
        introspector: Arc<dyn TokenIntrospector>,
        policy: Arc<dyn PermissionService>,
        resource: ResourceSpec,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            introspector,
            policy,
            resource,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Build a cache that talks to the HTTP endpoints named in `config`.
    pub fn from_config(config: &AuthConfig, clock: Arc<dyn Clock>) -> Result<Self, AccessError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|source| AccessError::Transport {
                service: "http client",
                source,
            })?;

        let introspector =
            HttpTokenIntrospector::new(client.clone(), &config.tokeninfo_url, Arc::clone(&clock))?;
        let policy = HttpPermissionService::new(client, &config.permission_url)?;
        let resource = ResourceSpec {
            resource_type: config.resource_type.clone(),
            resource_id: config.resource_id.clone(),
            action: config.action.clone(),
        };

        Ok(Self::new(
            Arc::new(introspector),
            Arc::new(policy),
            resource,
            clock,
        ))
    }

    /// Return the instant until which `token` is permitted, or the Unix epoch
    /// when it is not.
    pub async fn check_permission(&self, token: &str) -> DateTime<Utc> {
        let slot = self.slot_for(token);
        let permission = *slot.get_or_init(|| self.evaluate(token)).await;

        if !permission.is_valid_at(self.clock.now()) {
            let mut entries = self.lock();
            if entries.get(token).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                entries.remove(token);
            }
        }

        permission.expires_at
    }

    /// Convenience wrapper: is `token` permitted right now?
    pub async fn is_permitted(&self, token: &str) -> bool {
        self.check_permission(token).await > self.clock.now()
    }

    /// Number of tokens currently memoized (including in-flight evaluations).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find the live slot for `token`, replacing it if its grant has lapsed.
    fn slot_for(&self, token: &str) -> Slot {
        let now = self.clock.now();
        let mut entries = self.lock();

        if let Some(slot) = entries.get(token) {
            let live = slot.get().map_or(true, |p| p.is_valid_at(now));
            if live {
                return Arc::clone(slot);
            }
        }

        // Prune lapsed grants while we hold the lock anyway.
        entries.retain(|_, s| s.get().map_or(true, |p| p.is_valid_at(now)));

        let slot: Slot = Arc::new(OnceCell::new());
        entries.insert(token.to_string(), Arc::clone(&slot));
        slot
    }

    async fn evaluate(&self, token: &str) -> CachedPermission {
        let info = match self.introspector.introspect(token).await {
            Ok(info) => info,
            Err(err) => {
                warn!(%err, "token introspection failed; denying");
                return CachedPermission::denied();
            }
        };

        if info.is_expired_at(self.clock.now()) {
            debug!(expires_at = %info.expires_at, "token already expired; denying");
            return CachedPermission::denied();
        }

        match self.policy.resource_permission(&self.resource, token).await {
            Ok(true) => {
                debug!(expires_at = %info.expires_at, "permission granted");
                CachedPermission::granted(info.expires_at)
            }
            Ok(false) => {
                info!(
                    resource_type = %self.resource.resource_type,
                    resource_id = %self.resource.resource_id,
                    action = %self.resource.action,
                    subject = info.claim_str("sub").unwrap_or("<unknown>"),
                    "permission denied by policy service"
                );
                CachedPermission::denied()
            }
            Err(err) => {
                warn!(%err, "policy check failed; denying");
                CachedPermission::denied()
            }
        }
    }
}
