//! A relay transport that serves the tunnel's public side on a local socket.
//!
//! Each HTTP request on `/<connection_name>/...` becomes a relay event with a
//! fresh tracking id. WebSocket upgrades are offered to the gateway and only
//! answered `101` once acknowledged; the upgraded socket is then handed over
//! as the caller channel.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{CONNECTION, CONTENT_TYPE, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::ext::ReasonPhrase;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use relay_proxy::transport::EVENT_BUFFER;
use relay_proxy::{
    BoxError, CallerChannel, EventSender, InboundRequest, RelayError, RelayEvent, RelayTransport,
    TargetResponse,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use url::Url;

type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

fn empty_body() -> ResponseBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

fn text_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let body = serde_json::json!({ "message": message }).to_string();
    let mut response = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// State shared by every connection served by one open tunnel.
struct Tunnel {
    connection_name: String,
    events: EventSender,
}

impl Tunnel {
    fn owns_path(&self, path: &str) -> bool {
        path.strip_prefix('/')
            .and_then(|p| p.strip_prefix(self.connection_name.as_str()))
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }
}

pub struct LoopbackRelay {
    connection_name: String,
    listen_addr: SocketAddr,
    online: Arc<AtomicBool>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl LoopbackRelay {
    pub fn new(connection_name: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            connection_name: connection_name.into(),
            listen_addr,
            online: Arc::new(AtomicBool::new(false)),
            stop: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// The bound address once the tunnel is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RelayTransport for LoopbackRelay {
    fn connection_name(&self) -> &str {
        &self.connection_name
    }

    async fn open(&self) -> Result<mpsc::Receiver<RelayEvent>, RelayError> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| RelayError::transport(format!("bind {}: {e}", self.listen_addr)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RelayError::transport(e.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (stop_tx, stop_rx) = watch::channel(false);
        let tunnel = Arc::new(Tunnel {
            connection_name: self.connection_name.clone(),
            events: EventSender::new(tx),
        });

        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);
        self.online.store(true, Ordering::SeqCst);
        info!(addr = %local_addr, connection = %self.connection_name, "loopback relay listening");

        tokio::spawn(accept_loop(listener, tunnel, stop_rx, Arc::clone(&self.online)));
        Ok(rx)
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.online.store(false, Ordering::SeqCst);
        if let Some(stop) = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = stop.send(true);
        }
        Ok(())
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Pause after a failed accept. Errors such as EMFILE repeat immediately,
/// so retrying without a pause would spin.
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) async fn pause_after_accept_error(listener: &'static str, err: &std::io::Error) {
    warn!(listener, %err, "accept failed, retrying shortly");
    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
}

async fn accept_loop(
    listener: TcpListener,
    tunnel: Arc<Tunnel>,
    mut stop: watch::Receiver<bool>,
    online: Arc<AtomicBool>,
) {
    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    pause_after_accept_error("relay", &err).await;
                    continue;
                }
            },
            _ = stop.changed() => break,
        };

        let tunnel = Arc::clone(&tunnel);
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let tunnel = Arc::clone(&tunnel);
                async move { Ok::<_, Infallible>(handle(req, tunnel).await) }
            });
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), svc)
                .with_upgrades()
                .await
            {
                debug!(%remote_addr, %err, "relay connection ended with error");
            }
        });
    }
    online.store(false, Ordering::SeqCst);
    info!("loopback relay stopped accepting");
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
        && headers.contains_key(SEC_WEBSOCKET_KEY)
}

/// The URI as a relay would present it to the listener.
fn relay_uri(req: &Request<Incoming>) -> Result<Url, String> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    Url::parse(&format!("http://{host}{path}")).map_err(|e| e.to_string())
}

async fn handle(req: Request<Incoming>, tunnel: Arc<Tunnel>) -> Response<ResponseBody> {
    if !tunnel.owns_path(req.uri().path()) {
        return text_response(StatusCode::NOT_FOUND, "unknown connection");
    }
    let uri = match relay_uri(&req) {
        Ok(uri) => uri,
        Err(reason) => return text_response(StatusCode::BAD_REQUEST, &reason),
    };
    let tracking_id = uuid::Uuid::new_v4().to_string();

    if is_websocket_upgrade(req.headers()) {
        handle_upgrade(req, uri, tracking_id, tunnel).await
    } else {
        handle_http(req, uri, tracking_id, tunnel).await
    }
}

async fn handle_http(
    req: Request<Incoming>,
    uri: Url,
    tracking_id: String,
    tunnel: Arc<Tunnel>,
) -> Response<ResponseBody> {
    let (parts, body) = req.into_parts();
    let mut inbound = InboundRequest::new(tracking_id.clone(), parts.method, uri, parts.headers);
    if !body.is_end_stream() {
        inbound = inbound.with_body(Box::pin(
            body.into_data_stream().map_err(|e| Box::new(e) as BoxError),
        ));
    }

    match tunnel.events.request(inbound).await {
        Ok(response) => into_hyper_response(response),
        Err(err) => {
            warn!(%tracking_id, %err, "request not relayed");
            text_response(StatusCode::BAD_GATEWAY, &err.to_string())
        }
    }
}

async fn handle_upgrade(
    mut req: Request<Incoming>,
    uri: Url,
    tracking_id: String,
    tunnel: Arc<Tunnel>,
) -> Response<ResponseBody> {
    let Some(accept_key) = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
    else {
        return text_response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
    };
    let on_upgrade = hyper::upgrade::on(&mut req);

    let inbound = InboundRequest::new(
        tracking_id.clone(),
        req.method().clone(),
        uri,
        req.headers().clone(),
    );
    match tunnel.events.upgrade(inbound).await {
        Ok(true) => {}
        Ok(false) => return text_response(StatusCode::FORBIDDEN, "upgrade rejected"),
        Err(err) => {
            warn!(%tracking_id, %err, "upgrade not relayed");
            return text_response(StatusCode::BAD_GATEWAY, &err.to_string());
        }
    }

    tokio::spawn(async move {
        let result = match on_upgrade.await {
            Ok(upgraded) => {
                let socket =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                tunnel
                    .events
                    .channel_ready(CallerChannel::new(tracking_id.clone(), socket))
                    .await
            }
            Err(err) => {
                warn!(%tracking_id, %err, "upgrade did not complete");
                tunnel.events.upgrade_failed(tracking_id.clone()).await
            }
        };
        if let Err(err) = result {
            warn!(%tracking_id, %err, "gateway missed channel event");
        }
    });

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(accept) = HeaderValue::from_str(&accept_key) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    }
    response
}

fn into_hyper_response(target: TargetResponse) -> Response<ResponseBody> {
    let body = match target.body {
        Some(stream) => StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync(),
        None => empty_body(),
    };
    let mut response = Response::new(body);
    *response.status_mut() = target.status;
    *response.headers_mut() = target.headers;
    if let Some(reason) = target
        .status_text
        .and_then(|text| ReasonPhrase::try_from(text.into_bytes()).ok())
    {
        response.extensions_mut().insert(reason);
    }
    response
}
