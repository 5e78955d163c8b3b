use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::transport::{FrameSink, FrameStream, WsHalves};

/// Longest close reason we send; a close frame's payload is capped at 125
/// bytes including the two-byte code.
const MAX_CLOSE_REASON: usize = 120;

/// Upper bound on flushing a close frame to a peer that stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How a relayed WebSocket session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairEnd {
    CallerClosed,
    LocalClosed,
    CallerFailed(String),
    LocalFailed(String),
    Shutdown,
}

/// Result of pumping frames in one direction.
enum Flow {
    Closed,
    ReadFailed(String),
    WriteFailed(String),
}

/// Copy text and binary frames from `reader` to `writer` until the reader
/// closes or either side fails. Control frames are answered by each
/// endpoint's own protocol stack and are not forwarded.
async fn pump(reader: &mut FrameStream, writer: &mut FrameSink) -> Flow {
    while let Some(frame) = reader.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => return Flow::ReadFailed(err.to_string()),
        };
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                if let Err(err) = writer.send(msg).await {
                    return Flow::WriteFailed(err.to_string());
                }
            }
            Message::Close(_) => return Flow::Closed,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    Flow::Closed
}

/// Truncate `reason` to fit in a close frame without splitting a character.
fn close_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// Send a close frame and shut the sink. Errors are ignored so closing an
/// already-closed side is a no-op.
pub(crate) async fn close_side(sink: &mut FrameSink, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: close_reason(reason).into(),
    };
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
    })
    .await;
}

/// One caller-side channel joined to one local WebSocket.
pub struct ConnectionPair {
    tracking_id: String,
    caller: WsHalves,
    local: WsHalves,
}

impl ConnectionPair {
    pub fn new(tracking_id: impl Into<String>, caller: WsHalves, local: WsHalves) -> Self {
        Self {
            tracking_id: tracking_id.into(),
            caller,
            local,
        }
    }

    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    /// Relay frames both ways until one side closes, fails, or shutdown is
    /// signalled, then close both sides.
    pub async fn relay(self, mut shutdown: broadcast::Receiver<()>) -> PairEnd {
        let Self {
            tracking_id,
            mut caller,
            mut local,
        } = self;

        let end = {
            let upstream = pump(&mut caller.stream, &mut local.sink);
            let downstream = pump(&mut local.stream, &mut caller.sink);
            tokio::select! {
                flow = upstream => match flow {
                    Flow::Closed => PairEnd::CallerClosed,
                    Flow::ReadFailed(e) => PairEnd::CallerFailed(e),
                    Flow::WriteFailed(e) => PairEnd::LocalFailed(e),
                },
                flow = downstream => match flow {
                    Flow::Closed => PairEnd::LocalClosed,
                    Flow::ReadFailed(e) => PairEnd::LocalFailed(e),
                    Flow::WriteFailed(e) => PairEnd::CallerFailed(e),
                },
                _ = shutdown.recv() => PairEnd::Shutdown,
            }
        };

        match &end {
            PairEnd::CallerClosed => {
                close_side(&mut local.sink, CloseCode::Normal, "caller closed").await;
                close_side(&mut caller.sink, CloseCode::Normal, "").await;
            }
            PairEnd::LocalClosed => {
                close_side(&mut caller.sink, CloseCode::Error, "local endpoint closed").await;
                close_side(&mut local.sink, CloseCode::Normal, "").await;
            }
            PairEnd::LocalFailed(reason) => {
                let reason = format!("local endpoint failed: {reason}");
                close_side(&mut caller.sink, CloseCode::Error, &reason).await;
                close_side(&mut local.sink, CloseCode::Error, "").await;
            }
            PairEnd::CallerFailed(_) => {
                close_side(&mut local.sink, CloseCode::Away, "caller failed").await;
                close_side(&mut caller.sink, CloseCode::Error, "").await;
            }
            PairEnd::Shutdown => {
                close_side(&mut caller.sink, CloseCode::Away, "gateway shutting down").await;
                close_side(&mut local.sink, CloseCode::Away, "gateway shutting down").await;
            }
        }

        match &end {
            PairEnd::CallerFailed(reason) | PairEnd::LocalFailed(reason) => {
                tracing::warn!(%tracking_id, ?end, %reason, "connection pair failed");
            }
            _ => tracing::info!(%tracking_id, ?end, "connection pair closed"),
        }
        end
    }
}
