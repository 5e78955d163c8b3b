//! Loopback HTTP and WebSocket targets used by the unit tests.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::HeaderMap;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
pub struct TargetReply {
    pub status: u16,
    pub headers: Vec<(&'static str, &'static str)>,
    pub body: &'static str,
}

impl TargetReply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: "",
        }
    }

    pub fn ok(body: &'static str) -> Self {
        Self {
            body,
            ..Self::status(200)
        }
    }

    pub fn header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers.push((name, value));
        self
    }
}

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub type Seen = Arc<Mutex<Vec<SeenRequest>>>;

/// Serve `reply` for every request on a fresh loopback port and record what
/// arrived.
pub async fn http_target(reply: TargetReply) -> (SocketAddr, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));

    let seen_srv = Arc::clone(&seen);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = Arc::clone(&seen_srv);
            let reply = reply.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    let seen = Arc::clone(&seen);
                    let reply = reply.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.unwrap().to_bytes();
                        seen.lock().unwrap().push(SeenRequest {
                            method: parts.method.to_string(),
                            path: parts
                                .uri
                                .path_and_query()
                                .map(|p| p.as_str().to_string())
                                .unwrap_or_default(),
                            headers: parts.headers,
                            body,
                        });
                        let mut builder = hyper::Response::builder().status(reply.status);
                        for (name, value) in &reply.headers {
                            builder = builder.header(*name, *value);
                        }
                        Ok::<_, Infallible>(builder.body(Full::new(Bytes::from(reply.body))).unwrap())
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    (addr, seen)
}

#[derive(Debug, Clone, Copy)]
pub enum WsBehaviour {
    /// Echo text and binary frames until the peer closes.
    Echo,
    /// Echo the first data frame, then close.
    CloseAfterFirst,
    /// Hold the handshake for the given time, then echo.
    SlowHandshake(std::time::Duration),
}

/// Cookie header observed on each WebSocket handshake.
pub type SeenCookies = Arc<Mutex<Vec<Option<String>>>>;

/// Local WebSocket target on a fresh loopback port.
pub async fn ws_target(behaviour: WsBehaviour) -> (SocketAddr, SeenCookies) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cookies: SeenCookies = Arc::new(Mutex::new(Vec::new()));

    let cookies_srv = Arc::clone(&cookies);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let cookies = Arc::clone(&cookies_srv);
            tokio::spawn(async move {
                let callback = move |req: &HsRequest, resp: HsResponse| -> Result<HsResponse, ErrorResponse> {
                    let cookie = req
                        .headers()
                        .get("cookie")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    cookies.lock().unwrap().push(cookie);
                    Ok(resp)
                };
                if let WsBehaviour::SlowHandshake(delay) = behaviour {
                    tokio::time::sleep(delay).await;
                }
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Text(_) | Message::Binary(_) => {
                            if ws.send(msg).await.is_err() {
                                break;
                            }
                            if matches!(behaviour, WsBehaviour::CloseAfterFirst) {
                                let _ = ws.close(None).await;
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    (addr, cookies)
}
