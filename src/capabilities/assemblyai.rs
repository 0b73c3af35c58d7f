//! AssemblyAI streaming (v3) recognizer
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://streaming.assemblyai.com/v3/ws?sample_rate=..&format_turns=true`
//!    with the API key in the `Authorization` header
//! 2. Receive `Begin`
//! 3. Stream raw PCM16 frames as binary messages
//! 4. Receive `Turn` messages; `end_of_turn` marks the turn boundary. With
//!    `format_turns` the unformatted end-of-turn message is followed by a
//!    formatted one, which is the authoritative final text
//! 5. Send `{"type":"Terminate"}`, receive `Termination`
//!
//! # Retry Strategy
//!
//! Initial connection retries 3 times with exponential backoff (1s, 2s).
//! Mid-session disconnects surface as `RecognizerEvent::Error` and are not
//! retried here; the client resumes by sending `start_recording` again.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitStream, StreamExt};
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::{CapabilityError, Recognizer, RecognizerConfig, RecognizerEvent, RecognizerFeed};

/// AssemblyAI streaming endpoint (query string appended per session)
pub const STREAMING_API_URL: &str = "wss://streaming.assemblyai.com/v3/ws";

/// Maximum retry attempts for initial connection
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Capacity of the event channel towards the session loop
const EVENT_QUEUE: usize = 100;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Protocol
// ============================================================================

/// Messages sent to AssemblyAI besides binary audio
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// End the session; the server answers with `Termination`
    Terminate,
    /// Force the current turn to end now
    ForceEndpoint,
}

/// Messages received from AssemblyAI
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Begin {
        id: String,
        #[serde(default)]
        expires_at: Option<u64>,
    },
    Turn {
        #[serde(default)]
        turn_order: u64,
        #[serde(default)]
        transcript: String,
        #[serde(default)]
        end_of_turn: bool,
        #[serde(default)]
        turn_is_formatted: bool,
        #[serde(default)]
        end_of_turn_confidence: Option<f32>,
    },
    Termination {
        #[serde(default)]
        audio_duration_seconds: Option<f64>,
    },
    /// Catch-all for message types we don't handle
    #[serde(other)]
    Unknown,
}

/// Translate a server message into a recognizer event
///
/// With `format_turns` enabled only the formatted end-of-turn message is
/// final; the unformatted one is shown as a partial.
pub fn to_event(msg: ServerMessage, format_turns: bool) -> Option<RecognizerEvent> {
    match msg {
        ServerMessage::Turn {
            transcript,
            end_of_turn,
            turn_is_formatted,
            end_of_turn_confidence,
            ..
        } => {
            let authoritative = end_of_turn && (turn_is_formatted || !format_turns);
            if authoritative {
                Some(RecognizerEvent::Final {
                    text: transcript,
                    end_of_turn: true,
                    confidence: end_of_turn_confidence,
                })
            } else if transcript.is_empty() {
                None
            } else {
                Some(RecognizerEvent::Partial { text: transcript })
            }
        }
        ServerMessage::Termination { .. } => Some(RecognizerEvent::Terminated),
        ServerMessage::Begin { .. } | ServerMessage::Unknown => None,
    }
}

// ============================================================================
// Client
// ============================================================================

/// Streaming recognizer backed by AssemblyAI
#[derive(Debug, Clone)]
pub struct AssemblyAiRecognizer {
    api_key: String,
    format_turns: bool,
}

impl AssemblyAiRecognizer {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            format_turns: true,
        }
    }

    /// Build from `ASSEMBLYAI_API_KEY`, or `None` when it is not configured
    pub fn from_env() -> Option<Self> {
        get_api_key().map(Self::new)
    }
}

impl Recognizer for AssemblyAiRecognizer {
    fn begin(
        &self,
        config: RecognizerConfig,
    ) -> BoxFuture<'static, Result<RecognizerFeed, CapabilityError>> {
        let api_key = self.api_key.clone();
        let format_turns = self.format_turns;
        Box::pin(async move { connect(&api_key, format_turns, &config).await })
    }
}

/// Connect with retries and start the background driver
async fn connect(
    api_key: &str,
    format_turns: bool,
    config: &RecognizerConfig,
) -> Result<RecognizerFeed, CapabilityError> {
    let mut last_error = None;

    for attempt in 0..MAX_RETRIES {
        if attempt > 0 {
            let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
            log::info!(
                "Retrying AssemblyAI connection in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                MAX_RETRIES
            );
            tokio::time::sleep(delay).await;
        }

        match try_connect(api_key, format_turns, config).await {
            Ok(feed) => return Ok(feed),
            // Bad credentials will not get better by retrying
            Err(e @ CapabilityError::Unavailable(_)) => return Err(e),
            Err(e) => {
                log::warn!("AssemblyAI connection attempt {} failed: {}", attempt + 1, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| CapabilityError::Failed("Max retries exceeded".to_string())))
}

/// Single connection attempt (no retries)
async fn try_connect(
    api_key: &str,
    format_turns: bool,
    config: &RecognizerConfig,
) -> Result<RecognizerFeed, CapabilityError> {
    let url = format!(
        "{}?sample_rate={}&encoding=pcm_s16le&format_turns={}",
        STREAMING_API_URL, config.sample_rate, format_turns
    );
    let mut request = url
        .into_client_request()
        .map_err(|e| CapabilityError::Failed(e.to_string()))?;

    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(api_key)
            .map_err(|e| CapabilityError::Unavailable(format!("invalid API key: {}", e)))?,
    );

    log::info!("Connecting to AssemblyAI streaming API...");

    let (ws_stream, _response) = timeout(
        config.connect_timeout,
        connect_async_with_config(request, None, false),
    )
    .await
    .map_err(|_| CapabilityError::Timeout)?
    .map_err(|e| CapabilityError::Failed(e.to_string()))?;

    let (write, mut read) = ws_stream.split();

    // Wait for Begin
    let session_id = timeout(config.connect_timeout, wait_for_begin(&mut read))
        .await
        .map_err(|_| CapabilityError::Timeout)??;
    log::info!("AssemblyAI session started: {}", session_id);

    let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(config.audio_queue);
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

    let driver = tokio::spawn(drive(write, read, audio_rx, events_tx, format_turns));

    Ok(RecognizerFeed::new(audio_tx, events_rx, Some(driver)))
}

async fn wait_for_begin(read: &mut SplitStream<WsStream>) -> Result<String, CapabilityError> {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Begin { id, .. }) => return Ok(id),
                Ok(_) => log::debug!("Ignoring message while waiting for Begin"),
                Err(e) => log::warn!("Failed to parse AssemblyAI message: {}", e),
            },
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "no reason".to_string());
                return Err(CapabilityError::Failed(format!(
                    "Connection closed before session began: {}",
                    reason
                )));
            }
            Err(e) => return Err(CapabilityError::Failed(e.to_string())),
            _ => {} // Ignore ping/pong/binary
        }
    }
    Err(CapabilityError::Failed("Stream ended".to_string()))
}

/// Background I/O: forward audio up, translate transcripts down
async fn drive(
    mut write: futures_util::stream::SplitSink<WsStream, Message>,
    mut read: SplitStream<WsStream>,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    events_tx: mpsc::Sender<RecognizerEvent>,
    format_turns: bool,
) {
    let mut frames_sent: u64 = 0;
    let mut terminating = false;

    loop {
        tokio::select! {
            frame = audio_rx.recv(), if !terminating => match frame {
                Some(frame) => {
                    if let Err(e) = write.send(Message::Binary(frame)).await {
                        log::warn!("AssemblyAI: failed to send audio: {}", e);
                        let _ = events_tx
                            .send(RecognizerEvent::Error { message: e.to_string() })
                            .await;
                        break;
                    }
                    frames_sent += 1;
                    if frames_sent % 100 == 0 {
                        log::debug!("AssemblyAI: sent {} frames", frames_sent);
                    }
                }
                None => {
                    // Feed released: ask the server to end the session
                    terminating = true;
                    if let Ok(json) = serde_json::to_string(&ClientMessage::Terminate) {
                        let _ = write.send(Message::Text(json)).await;
                    }
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => {
                        let Some(event) = to_event(msg, format_turns) else { continue };
                        let done = event == RecognizerEvent::Terminated;
                        if events_tx.send(event).await.is_err() && !terminating {
                            log::debug!("AssemblyAI: event receiver closed");
                        }
                        if done {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Failed to parse AssemblyAI message: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    log::info!("AssemblyAI closed the connection: {:?}", frame);
                    if !terminating {
                        let message = frame
                            .map(|f| format!("closed by server ({}): {}", f.code, f.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                        let _ = events_tx.send(RecognizerEvent::Error { message }).await;
                    }
                    break;
                }
                Some(Err(e)) => {
                    log::warn!("AssemblyAI WebSocket error: {}", e);
                    let _ = events_tx
                        .send(RecognizerEvent::Error { message: e.to_string() })
                        .await;
                    break;
                }
                Some(Ok(_)) => {} // Ignore ping/pong/binary
                None => {
                    let _ = events_tx.send(RecognizerEvent::Terminated).await;
                    break;
                }
            },
        }
    }

    if let Err(e) = write.close().await {
        log::debug!("AssemblyAI: error closing WebSocket: {}", e);
    }
    log::debug!("AssemblyAI driver exiting after {} frames", frames_sent);
}

/// Get the AssemblyAI API key from environment
pub fn get_api_key() -> Option<String> {
    std::env::var("ASSEMBLYAI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}
