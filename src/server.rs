//! WebSocket front door
//!
//! Each accepted connection is split into a writer task that owns the sink
//! and drains the session's ordered outbound queue, a reader task that turns
//! frames into `Inbound` messages, and the session loop itself.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::{Inbound, ServerMessage};
use crate::services::Services;
use crate::session::SessionOrchestrator;

pub const WS_PATH: &str = "/ws";

/// Inbound frames waiting for the session loop
const INBOUND_QUEUE: usize = 64;

/// How long the writer gets to flush queued events after a session ends
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Accept connections until `shutdown` resolves, then close every session
pub async fn serve<F>(listener: TcpListener, services: Arc<Services>, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::debug!("Connection from {}", peer);
                    tokio::spawn(handle_connection(Arc::clone(&services), stream, peer));
                }
                Err(e) => log::warn!("Failed to accept connection: {}", e),
            },
            _ = &mut shutdown => {
                log::info!("Shutdown requested");
                break;
            }
        }
    }

    services.shutdown().await;
}

pub async fn handle_connection(services: Arc<Services>, stream: TcpStream, peer: SocketAddr) {
    let mut conversation = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != WS_PATH {
            let mut err = ErrorResponse::new(Some(format!("Unknown path {}", req.uri().path())));
            *err.status_mut() = StatusCode::NOT_FOUND;
            return Err(err);
        }
        conversation = req.uri().query().and_then(conversation_param);
        Ok(resp)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };
    log::info!("Client {} connected", peer);

    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(services.settings.outbound_queue);
    let (in_tx, in_rx) = mpsc::channel::<Inbound>(INBOUND_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match msg.to_json() {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Failed to encode {} event: {}", msg.kind(), e);
                    continue;
                }
            };
            if let Err(e) = sink.send(WsMessage::Text(text)).await {
                log::debug!("Write to {} failed: {}", peer, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = source.next().await {
            let inbound = match frame {
                Ok(WsMessage::Binary(bytes)) => Inbound::Audio(bytes),
                Ok(WsMessage::Text(text)) => Inbound::from_text(&text),
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    log::debug!("Read from {} failed: {}", peer, e);
                    break;
                }
            };
            if in_tx.send(inbound).await.is_err() {
                break;
            }
        }
    });

    let session = SessionOrchestrator::accept(services, out_tx, conversation).await;
    session.run(in_rx).await;

    reader.abort();
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        log::warn!("Writer for {} did not drain in time", peer);
    }
    log::info!("Client {} disconnected", peer);
}

/// `conversation` (or `conversation_id`) from a query string
fn conversation_param(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        match key {
            "conversation" | "conversation_id" if !value.is_empty() => Some(value.to_string()),
            _ => None,
        }
    })
}
