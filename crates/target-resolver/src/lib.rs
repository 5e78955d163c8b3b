//! # target-resolver
//!
//! Maps URIs presented by the hybrid-connection relay onto the local service
//! that actually answers them. Resolution is pure: no I/O happens here.
//!
//! ## Quick start
//!
//! ```rust
//! use target_resolver::{TargetConfig, TargetResolver};
//! use url::Url;
//!
//! let config = TargetConfig {
//!     default_host: "http://local:9000".to_string(),
//!     ..TargetConfig::default()
//! };
//! let resolver = TargetResolver::new("conn", &config);
//! let inbound = Url::parse("https://relay/conn/foo?x=1").unwrap();
//! let target = resolver.resolve(&inbound, false, true).unwrap();
//! assert_eq!(target.as_str(), "http://local:9000/foo?x=1");
//! ```

mod error;
mod headers;
pub mod path;
mod resolver;
mod rule;

pub use error::ResolveError;
pub use headers::translate_headers;
pub use resolver::{Route, TargetResolver};
pub use rule::{RoutingRule, TargetConfig, CONNECTION_NAME_TOKEN};
