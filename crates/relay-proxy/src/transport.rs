//! The seam between the gateway and the hybrid-connection relay.
//!
//! A relay transport turns its callbacks into a stream of [`RelayEvent`]s.
//! HTTP requests carry a one-shot [`ResponseSink`] back to the caller,
//! upgrade requests carry a one-shot acknowledgement, and once an
//! acknowledged upgrade completes the transport emits a
//! [`RelayEvent::ChannelReady`] correlated by the same tracking id.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::error::RelayError;
use crate::request::{InboundRequest, TargetResponse};

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Capacity of the event channel between a transport and the pipeline.
pub const EVENT_BUFFER: usize = 1024;

/// One WebSocket endpoint split into its write and read halves.
pub struct WsHalves {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl WsHalves {
    pub fn new<S>(socket: S) -> Self
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + 'static,
    {
        let (sink, stream) = socket.split();
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Caller-side channel handed over by the transport once an accepted
/// upgrade has completed.
pub struct CallerChannel {
    tracking_id: String,
    halves: WsHalves,
}

impl CallerChannel {
    pub fn new<S>(tracking_id: impl Into<String>, socket: S) -> Self
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + 'static,
    {
        Self {
            tracking_id: tracking_id.into(),
            halves: WsHalves::new(socket),
        }
    }

    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    pub fn into_halves(self) -> WsHalves {
        self.halves
    }
}

/// Write side for one caller's HTTP response.
pub struct ResponseSink(oneshot::Sender<TargetResponse>);

impl ResponseSink {
    pub fn new() -> (Self, oneshot::Receiver<TargetResponse>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Deliver the response. Fails only when the caller has gone away.
    pub fn send(self, response: TargetResponse) -> Result<(), RelayError> {
        self.0
            .send(response)
            .map_err(|r| RelayError::transport(format!("caller for {} went away", r.tracking_id)))
    }
}

pub struct HttpExchange {
    pub request: InboundRequest,
    pub responder: ResponseSink,
}

pub struct UpgradeExchange {
    pub request: InboundRequest,
    /// `true` acknowledges the upgrade; `false` refuses it.
    pub acknowledge: oneshot::Sender<bool>,
}

pub enum RelayEvent {
    Http(HttpExchange),
    Upgrade(UpgradeExchange),
    ChannelReady(CallerChannel),
    /// An acknowledged upgrade will never produce a channel.
    UpgradeFailed { tracking_id: String },
}

/// What the gateway needs from a hybrid-connection relay.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Logical connection name (entity path) of the tunnel.
    fn connection_name(&self) -> &str;

    /// Bring the tunnel online and start delivering events.
    async fn open(&self) -> Result<mpsc::Receiver<RelayEvent>, RelayError>;

    /// Take the tunnel offline. Closing an offline tunnel is a no-op.
    async fn close(&self) -> Result<(), RelayError>;

    fn is_online(&self) -> bool;
}

/// Producer handle used by transport implementations to emit events and
/// wait for the gateway's answers.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<RelayEvent>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<RelayEvent>) -> Self {
        Self { tx }
    }

    async fn emit(&self, event: RelayEvent) -> Result<(), RelayError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| RelayError::transport("gateway is no longer receiving events"))
    }

    /// Relay an HTTP request and wait for the response.
    pub async fn request(&self, request: InboundRequest) -> Result<TargetResponse, RelayError> {
        let (responder, rx) = ResponseSink::new();
        self.emit(RelayEvent::Http(HttpExchange { request, responder }))
            .await?;
        rx.await
            .map_err(|_| RelayError::transport("gateway dropped the request"))
    }

    /// Offer an upgrade and wait for the acknowledgement.
    pub async fn upgrade(&self, request: InboundRequest) -> Result<bool, RelayError> {
        let (acknowledge, rx) = oneshot::channel();
        self.emit(RelayEvent::Upgrade(UpgradeExchange {
            request,
            acknowledge,
        }))
        .await?;
        Ok(rx.await.unwrap_or(false))
    }

    pub async fn channel_ready(&self, channel: CallerChannel) -> Result<(), RelayError> {
        self.emit(RelayEvent::ChannelReady(channel)).await
    }

    pub async fn upgrade_failed(&self, tracking_id: impl Into<String>) -> Result<(), RelayError> {
        self.emit(RelayEvent::UpgradeFailed {
            tracking_id: tracking_id.into(),
        })
        .await
    }
}

/// In-process transport: events are injected through an [`EventSender`].
/// Useful for embedding the gateway behind a relay SDK that already owns
/// its own event loop, and for tests.
pub struct InMemoryTransport {
    connection_name: String,
    rx: Mutex<Option<mpsc::Receiver<RelayEvent>>>,
    online: AtomicBool,
}

impl InMemoryTransport {
    pub fn new(connection_name: impl Into<String>) -> (Self, EventSender) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let transport = Self {
            connection_name: connection_name.into(),
            rx: Mutex::new(Some(rx)),
            online: AtomicBool::new(false),
        };
        (transport, EventSender::new(tx))
    }
}

#[async_trait]
impl RelayTransport for InMemoryTransport {
    fn connection_name(&self) -> &str {
        &self.connection_name
    }

    async fn open(&self) -> Result<mpsc::Receiver<RelayEvent>, RelayError> {
        let rx = self
            .rx
            .lock()
            .map_err(|_| RelayError::transport("transport state poisoned"))?
            .take()
            .ok_or_else(|| RelayError::transport("transport was already opened"))?;
        self.online.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.online.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, StatusCode};
    use url::Url;

    fn inbound() -> InboundRequest {
        InboundRequest::new(
            "t1",
            Method::GET,
            Url::parse("https://relay/conn/").unwrap(),
            HeaderMap::new(),
        )
    }

    #[tokio::test]
    async fn open_is_single_shot() {
        let (transport, _tx) = InMemoryTransport::new("conn");
        assert!(!transport.is_online());
        assert!(transport.open().await.is_ok());
        assert!(transport.is_online());
        assert!(transport.open().await.is_err());
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_online());
    }

    #[tokio::test]
    async fn request_round_trips_through_events() {
        let (transport, tx) = InMemoryTransport::new("conn");
        let mut events = transport.open().await.unwrap();

        let answer = tokio::spawn(async move {
            match events.recv().await {
                Some(RelayEvent::Http(exchange)) => exchange
                    .responder
                    .send(TargetResponse::new(exchange.request.tracking_id, StatusCode::ACCEPTED))
                    .unwrap(),
                _ => panic!("expected an HTTP event"),
            }
        });

        let response = tx.request(inbound()).await.unwrap();
        assert_eq!(response.status, StatusCode::ACCEPTED);
        assert_eq!(response.tracking_id, "t1");
        answer.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_acknowledgement_counts_as_refusal() {
        let (transport, tx) = InMemoryTransport::new("conn");
        let mut events = transport.open().await.unwrap();
        tokio::spawn(async move {
            let _ = events.recv().await;
        });
        assert!(!tx.upgrade(inbound()).await.unwrap());
    }

    #[tokio::test]
    async fn sending_after_gateway_stopped_fails() {
        let (transport, tx) = InMemoryTransport::new("conn");
        drop(transport.open().await.unwrap());
        assert!(tx.request(inbound()).await.is_err());
    }
}
