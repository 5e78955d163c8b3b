//! Liveness probe: `{"status":"running","online":<bool>,"live_pairs":<n>}`
//! on every path.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Response};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use relay_proxy::{RelayPipeline, RelayTransport};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::loopback::pause_after_accept_error;

#[derive(Debug, Serialize)]
pub struct Status {
    pub status: &'static str,
    pub online: bool,
    pub live_pairs: usize,
}

/// What the probe reports on.
#[derive(Clone)]
pub struct StatusSource {
    transport: Arc<dyn RelayTransport>,
    pipeline: RelayPipeline,
}

impl StatusSource {
    pub fn new(transport: Arc<dyn RelayTransport>, pipeline: RelayPipeline) -> Self {
        Self {
            transport,
            pipeline,
        }
    }

    pub fn snapshot(&self) -> Status {
        Status {
            status: "running",
            online: self.transport.is_online(),
            live_pairs: self.pipeline.live_pairs(),
        }
    }
}

fn status_response(status: &Status) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(status).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Serve the probe on `listener` until shutdown is signalled.
pub async fn serve(
    listener: TcpListener,
    source: StatusSource,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "status probe listening");
    }
    loop {
        let (stream, remote_addr): (_, SocketAddr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    pause_after_accept_error("status", &err).await;
                    continue;
                }
            },
            _ = shutdown.recv() => break,
        };

        let source = source.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |_req| {
                let status = source.snapshot();
                async move { Ok::<_, Infallible>(status_response(&status)) }
            });
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), svc)
                .await
            {
                debug!(%remote_addr, %err, "status connection ended with error");
            }
        });
    }
    info!("status probe stopped");
}
