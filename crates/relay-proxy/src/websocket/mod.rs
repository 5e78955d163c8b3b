//! Pairing of accepted upgrades with local WebSocket connections.

mod relay;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use http::header::COOKIE;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use crate::error::RelayError;
use crate::inspect::InspectionPipeline;
use crate::request::RelayedRequest;
use crate::transport::{CallerChannel, WsHalves};

pub(crate) use relay::close_side;
pub use relay::{ConnectionPair, PairEnd};

/// Accepted upgrades older than this without a channel are dropped.
const PENDING_TTL: Duration = Duration::from_secs(120);

struct PendingAccept {
    request: RelayedRequest,
    accepted_at: Instant,
}

/// Correlates "upgrade accepted" with the later "channel ready" event.
/// Every entry leaves the table exactly once.
#[derive(Default)]
struct PendingAccepts {
    entries: Mutex<HashMap<String, PendingAccept>>,
}

impl PendingAccepts {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingAccept>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, request: RelayedRequest) {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, p| p.accepted_at.elapsed() < PENDING_TTL);
        let pruned = before - entries.len();
        if pruned > 0 {
            tracing::warn!(pruned, "dropped accepted upgrades that never got a channel");
        }
        entries.insert(
            request.tracking_id().to_string(),
            PendingAccept {
                request,
                accepted_at: Instant::now(),
            },
        );
    }

    fn take(&self, tracking_id: &str) -> Option<RelayedRequest> {
        self.lock().remove(tracking_id).map(|p| p.request)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

#[derive(Debug, Clone)]
struct LivePair {
    target: Url,
    since: Instant,
}

/// Owns the WebSocket half of the relay: the upgrade gate, the pending
/// accept table, the live-pair bookkeeping and the relay loops.
pub struct ConnectionManager {
    inspection: Arc<InspectionPipeline>,
    pending: PendingAccepts,
    live: Mutex<HashMap<String, LivePair>>,
    connect_timeout: Duration,
    shutdown: broadcast::Sender<()>,
    closing: AtomicBool,
}

impl ConnectionManager {
    pub fn new(inspection: Arc<InspectionPipeline>, connect_timeout: Duration) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inspection,
            pending: PendingAccepts::default(),
            live: Mutex::new(HashMap::new()),
            connect_timeout,
            shutdown,
            closing: AtomicBool::new(false),
        }
    }

    /// Run the inspection gate for an upgrade. On acceptance the request is
    /// parked until its channel arrives.
    pub async fn on_upgrade(&self, request: RelayedRequest) -> bool {
        if !self.inspection.accept_upgrade(&request).await {
            return false;
        }
        tracing::debug!(
            tracking_id = request.tracking_id(),
            target = ?request.target_ws_uri().map(Url::as_str),
            "upgrade accepted"
        );
        self.pending.insert(request);
        true
    }

    /// Forget an accepted upgrade that will never get a channel.
    pub fn abandon(&self, tracking_id: &str) -> bool {
        let removed = self.pending.take(tracking_id).is_some();
        if removed {
            tracing::debug!(%tracking_id, "accepted upgrade abandoned");
        }
        removed
    }

    /// Pair a ready caller channel with a fresh local WebSocket and relay
    /// until the pair ends.
    pub async fn on_channel_ready(&self, channel: CallerChannel) -> Result<PairEnd, RelayError> {
        let tracking_id = channel.tracking_id().to_string();
        let mut caller = channel.into_halves();

        let Some(request) = self.pending.take(&tracking_id) else {
            tracing::error!(%tracking_id, "channel ready without an accepted upgrade");
            close_side(&mut caller.sink, CloseCode::Error, "no accepted upgrade").await;
            return Err(RelayError::IllegalState { tracking_id });
        };

        // Subscribe before connecting so a shutdown during the connect still
        // reaches the pair.
        let shutdown = self.shutdown.subscribe();
        if self.closing.load(Ordering::SeqCst) {
            close_side(&mut caller.sink, CloseCode::Away, "gateway shutting down").await;
            return Ok(PairEnd::Shutdown);
        }

        let (local, target) = match self.connect_local(&request).await {
            Ok(connected) => connected,
            Err(err) => {
                tracing::error!(%tracking_id, %err, "local WebSocket connect failed");
                let reason = format!("local endpoint unavailable: {err}");
                close_side(&mut caller.sink, CloseCode::Error, &reason).await;
                return Err(err);
            }
        };

        tracing::info!(%tracking_id, target = %target, "connection pair established");
        self.live_lock().insert(
            tracking_id.clone(),
            LivePair {
                target,
                since: Instant::now(),
            },
        );

        let end = ConnectionPair::new(tracking_id.clone(), caller, local)
            .relay(shutdown)
            .await;

        if let Some(pair) = self.live_lock().remove(&tracking_id) {
            tracing::debug!(
                %tracking_id,
                target = %pair.target,
                secs = pair.since.elapsed().as_secs(),
                "connection pair removed"
            );
        }
        Ok(end)
    }

    async fn connect_local(&self, request: &RelayedRequest) -> Result<(WsHalves, Url), RelayError> {
        let target = request
            .target_ws_uri()
            .cloned()
            .ok_or_else(|| RelayError::transport("upgrade request has no WebSocket target"))?;

        let mut handshake = target.as_str().into_client_request()?;
        for cookie in request.headers().get_all(COOKIE) {
            handshake.headers_mut().append(COOKIE, cookie.clone());
        }

        let (socket, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(handshake),
        )
        .await
        .map_err(|_| RelayError::Timeout {
            what: "connecting to the local WebSocket",
        })??;

        Ok((WsHalves::new(socket), target))
    }

    /// Close every live pair with a going-away frame and refuse new ones.
    pub fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }

    pub fn live_pairs(&self) -> usize {
        self.live_lock().len()
    }

    pub fn is_live(&self, tracking_id: &str) -> bool {
        self.live_lock().contains_key(tracking_id)
    }

    pub fn pending_accepts(&self) -> usize {
        self.pending.len()
    }

    fn live_lock(&self) -> MutexGuard<'_, HashMap<String, LivePair>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
