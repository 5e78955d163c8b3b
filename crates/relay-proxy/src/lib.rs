//! # relay-proxy
//!
//! The relay path of the tunnel gateway.
//!
//! A [`RelayTransport`] delivers HTTP requests, upgrade offers and ready
//! caller channels as [`RelayEvent`]s. The [`RelayPipeline`] resolves each
//! one to a local target, runs it through the [`InspectionPipeline`], and
//! then either executes it with the [`HttpRelayProcessor`] or pairs it with a
//! local WebSocket in the [`ConnectionManager`].
//!
//! # Architecture
//!
//! ```text
//! Caller <--relay--> RelayTransport --> RelayPipeline --> [Inspectors]
//!                                                              |
//!                                       +----------------------+
//!                                       |                      |
//!                              HttpRelayProcessor      ConnectionManager
//!                                       |                      |
//!                                 local HTTP target     local WebSocket
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relay_proxy::{
//!     CorsConfig, HeaderLogger, InMemoryTransport, InspectionPipeline, RelayPipeline,
//!     RequestInspector,
//! };
//! use target_resolver::TargetConfig;
//!
//! # async fn example() -> Result<(), relay_proxy::RelayError> {
//! let inspectors: Vec<Arc<dyn RequestInspector>> = vec![Arc::new(HeaderLogger)];
//! let pipeline = RelayPipeline::from_config(
//!     "my-connection",
//!     &TargetConfig::default(),
//!     CorsConfig::default(),
//!     InspectionPipeline::new(inspectors),
//!     256,
//! )?;
//! let (transport, _events) = InMemoryTransport::new("my-connection");
//! let (_shutdown, rx) = tokio::sync::broadcast::channel(1);
//! pipeline.run(&transport, rx).await
//! # }
//! ```

mod cors;
mod error;
pub mod inspect;
mod pipeline;
mod processor;
mod request;
pub mod transport;
pub mod websocket;

pub use cors::CorsConfig;
pub use error::RelayError;
pub use inspect::{
    AuthorizationInspector, HeaderLogger, HeartbeatConfig, HeartbeatInspector,
    HttpLifecycleClient, InspectionPipeline, LifecycleClient, RequestInspector,
};
pub use pipeline::RelayPipeline;
pub use processor::{error_response, rewrite_cookie, translate_response_headers, HttpRelayProcessor};
pub use request::{full_body, BodyStream, BoxError, InboundRequest, RelayedRequest, TargetResponse};
pub use transport::{
    CallerChannel, EventSender, HttpExchange, InMemoryTransport, RelayEvent, RelayTransport,
    ResponseSink, UpgradeExchange,
};
pub use websocket::{ConnectionManager, ConnectionPair, PairEnd};

#[cfg(test)]
pub(crate) mod testing;
