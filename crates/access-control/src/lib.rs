//! # access-control
//!
//! Decides whether the bearer of an access token may use the tunnel.
//!
//! A token is first introspected against an identity endpoint (which may
//! answer with an opaque-token JSON document or with a self-contained signed
//! token), then checked once against an external authorization policy. Grants
//! are memoized per raw token until the token itself expires; denials and
//! failures are never cached.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use access_control::{AuthConfig, PermissionCache, SystemClock};
//!
//! # async fn example(config: AuthConfig) -> Result<(), access_control::AccessError> {
//! let cache = PermissionCache::from_config(&config, Arc::new(SystemClock))?;
//! let expiry = cache.check_permission("opaque-token").await;
//! println!("token usable until {expiry}");
//! # Ok(())
//! # }
//! ```

mod cache;
mod clock;
mod config;
mod error;
mod permission;
pub mod token;

pub use cache::{CachedPermission, PermissionCache};
pub use clock::{epoch, Clock, SystemClock};
pub use config::AuthConfig;
pub use error::AccessError;
pub use permission::{HttpPermissionService, PermissionService, ResourceSpec};
pub use token::{HttpTokenIntrospector, TokenInfo, TokenIntrospector};

#[cfg(test)]
pub(crate) mod testing;
