use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use target_resolver::{TargetConfig, TargetResolver};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;

use crate::cors::CorsConfig;
use crate::error::RelayError;
use crate::inspect::InspectionPipeline;
use crate::processor::{error_response, HttpRelayProcessor};
use crate::request::RelayedRequest;
use crate::transport::{CallerChannel, HttpExchange, RelayEvent, RelayTransport, UpgradeExchange};
use crate::websocket::ConnectionManager;

/// How long in-flight work gets to finish once the tunnel is closing.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

struct Inner {
    resolver: TargetResolver,
    inspection: Arc<InspectionPipeline>,
    processor: HttpRelayProcessor,
    connections: ConnectionManager,
    permits: Arc<Semaphore>,
}

/// Wires relay events through the inspection gate into the HTTP processor
/// or the WebSocket connection manager, and owns the tunnel lifecycle.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct RelayPipeline {
    inner: Arc<Inner>,
}

impl RelayPipeline {
    pub fn new(
        resolver: TargetResolver,
        inspection: InspectionPipeline,
        processor: HttpRelayProcessor,
        ws_connect_timeout: Duration,
        max_concurrent_requests: usize,
    ) -> Self {
        let inspection = Arc::new(inspection);
        let connections = ConnectionManager::new(Arc::clone(&inspection), ws_connect_timeout);
        Self {
            inner: Arc::new(Inner {
                resolver,
                inspection,
                processor,
                connections,
                permits: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
            }),
        }
    }

    pub fn from_config(
        connection_name: &str,
        target: &TargetConfig,
        cors: CorsConfig,
        inspection: InspectionPipeline,
        max_concurrent_requests: usize,
    ) -> Result<Self, RelayError> {
        let processor = HttpRelayProcessor::from_config(target, cors)?;
        Ok(Self::new(
            TargetResolver::new(connection_name, target),
            inspection,
            processor,
            Duration::from_secs(target.connect_timeout_secs),
            max_concurrent_requests,
        ))
    }

    pub fn live_pairs(&self) -> usize {
        self.inner.connections.live_pairs()
    }

    pub fn inspectors(&self) -> Vec<&'static str> {
        self.inner.inspection.names()
    }

    /// Bring the tunnel online and serve its events until shutdown is
    /// signalled or the transport stops delivering. Every live pair is torn
    /// down and in-flight work drained (bounded by a timeout) before the
    /// tunnel is closed and this returns.
    pub async fn run(
        &self,
        transport: &dyn RelayTransport,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), RelayError> {
        let mut events = transport.open().await?;
        tracing::info!(
            connection = transport.connection_name(),
            inspectors = ?self.inspectors(),
            "relay tunnel online"
        );

        let mut tasks = JoinSet::new();
        loop {
            let event = tokio::select! {
                Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::warn!("relay transport stopped delivering events");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("shutdown signal received, closing tunnel");
                    break;
                }
            };
            self.dispatch(event, &mut tasks);
        }

        self.inner.connections.shutdown();
        let in_flight = tasks.len();
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                in_flight,
                remaining = tasks.len(),
                "in-flight work did not finish in time, aborting"
            );
            tasks.abort_all();
        }
        transport.close().await?;
        tracing::info!(connection = transport.connection_name(), "relay tunnel closed");
        Ok(())
    }

    /// Hand one event to its own task. Requests and upgrades are bounded by
    /// the concurrency limit; established pairs are not.
    fn dispatch(&self, event: RelayEvent, tasks: &mut JoinSet<()>) {
        match event {
            RelayEvent::Http(exchange) => {
                let this = self.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = Arc::clone(&this.inner.permits).acquire_owned().await else {
                        return;
                    };
                    this.handle_http(exchange).await;
                });
            }
            RelayEvent::Upgrade(exchange) => {
                let this = self.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = Arc::clone(&this.inner.permits).acquire_owned().await else {
                        return;
                    };
                    this.handle_upgrade(exchange).await;
                });
            }
            RelayEvent::ChannelReady(channel) => {
                let this = self.clone();
                tasks.spawn(async move { this.handle_channel(channel).await });
            }
            RelayEvent::UpgradeFailed { tracking_id } => {
                self.inner.connections.abandon(&tracking_id);
            }
        }
    }

    pub async fn handle_http(&self, exchange: HttpExchange) {
        let HttpExchange { request, responder } = exchange;
        let tracking_id = request.tracking_id.clone();
        let inner = &self.inner;

        let response = if request.method == Method::OPTIONS && inner.processor.cors().preflight {
            inner
                .processor
                .cors()
                .preflight_response(&tracking_id, &request.headers)
        } else {
            match RelayedRequest::for_http(request, &inner.resolver) {
                Err(err) => {
                    tracing::warn!(%tracking_id, %err, "cannot resolve target");
                    error_response(&tracking_id, StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
                }
                Ok(relayed) => {
                    if inner.inspection.accept_request(&relayed).await {
                        inner.processor.execute(relayed).await
                    } else {
                        error_response(&tracking_id, StatusCode::FORBIDDEN, "request rejected")
                    }
                }
            }
        };

        if let Err(err) = responder.send(response) {
            tracing::debug!(%tracking_id, %err, "response not delivered");
        }
    }

    pub async fn handle_upgrade(&self, exchange: UpgradeExchange) {
        let UpgradeExchange {
            request,
            acknowledge,
        } = exchange;
        let tracking_id = request.tracking_id.clone();

        let accepted = match RelayedRequest::for_upgrade(request, &self.inner.resolver) {
            Ok(relayed) => self.inner.connections.on_upgrade(relayed).await,
            Err(err) => {
                tracing::warn!(%tracking_id, %err, "cannot resolve WebSocket target");
                false
            }
        };

        if acknowledge.send(accepted).is_err() && accepted {
            tracing::debug!(%tracking_id, "transport dropped the acknowledgement");
            self.inner.connections.abandon(&tracking_id);
        }
    }

    pub async fn handle_channel(&self, channel: CallerChannel) {
        let tracking_id = channel.tracking_id().to_string();
        if let Err(err) = self.inner.connections.on_channel_ready(channel).await {
            tracing::warn!(%tracking_id, %err, "WebSocket relay not established");
        }
    }
}
