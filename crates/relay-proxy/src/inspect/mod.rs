//! The inspection gate every relayed request and upgrade passes through.

mod authorization;
mod headers;
mod heartbeat;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::request::RelayedRequest;

pub use authorization::{bearer_token, AuthorizationInspector};
pub use headers::{masked_headers, HeaderLogger};
pub use heartbeat::{HeartbeatConfig, HeartbeatInspector, HttpLifecycleClient, LifecycleClient};

/// Trait for accept/reject checks on inbound traffic.
///
/// The same ordered list of inspectors sees both plain HTTP requests and
/// WebSocket upgrade requests; each inspector decides for itself whether the
/// two call sites differ.
#[async_trait]
pub trait RequestInspector: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &'static str {
        "inspector"
    }

    async fn inspect_request(&self, request: &RelayedRequest) -> bool;

    async fn inspect_upgrade(&self, request: &RelayedRequest) -> bool;
}

#[derive(Debug, Clone, Copy)]
enum CallSite {
    Request,
    Upgrade,
}

/// Ordered inspector chain with unanimous-verdict aggregation.
///
/// Every inspector runs (no short-circuit) and its verdict goes into a set.
/// The request is accepted iff that set holds exactly one value and the
/// value is `true`. An empty chain therefore rejects everything.
#[derive(Clone, Default)]
pub struct InspectionPipeline {
    inspectors: Vec<Arc<dyn RequestInspector>>,
}

impl InspectionPipeline {
    pub fn new(inspectors: Vec<Arc<dyn RequestInspector>>) -> Self {
        Self { inspectors }
    }

    pub fn len(&self) -> usize {
        self.inspectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inspectors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.inspectors.iter().map(|i| i.name()).collect()
    }

    /// Gate for a plain HTTP request.
    pub async fn accept_request(&self, request: &RelayedRequest) -> bool {
        self.run(request, CallSite::Request).await
    }

    /// Gate for a WebSocket upgrade request.
    pub async fn accept_upgrade(&self, request: &RelayedRequest) -> bool {
        self.run(request, CallSite::Upgrade).await
    }

    async fn run(&self, request: &RelayedRequest, site: CallSite) -> bool {
        let mut verdicts = HashSet::new();
        for inspector in &self.inspectors {
            let verdict = match site {
                CallSite::Request => inspector.inspect_request(request).await,
                CallSite::Upgrade => inspector.inspect_upgrade(request).await,
            };
            if !verdict {
                tracing::debug!(
                    tracking_id = request.tracking_id(),
                    inspector = inspector.name(),
                    ?site,
                    "inspector rejected"
                );
            }
            verdicts.insert(verdict);
        }

        let accepted = unanimous(&verdicts);
        if !accepted {
            tracing::warn!(
                tracking_id = request.tracking_id(),
                uri = %request.source_uri(),
                ?site,
                inspectors = self.inspectors.len(),
                "request rejected by inspection gate"
            );
        }
        accepted
    }
}

fn unanimous(verdicts: &HashSet<bool>) -> bool {
    verdicts.len() == 1 && verdicts.contains(&true)
}
