//! External capability interfaces
//!
//! The orchestrator only talks to speech recognition, response generation and
//! speech synthesis through the traits in this module. Concrete vendor
//! adapters live in `assemblyai`, `gemini` and `murf`; tests plug in stubs.
//!
//! All three are modeled as channels or streams rather than callbacks, so the
//! order in which their output is consumed is decided by the session loop.

pub mod assemblyai;
pub mod gemini;
pub mod murf;

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::history::Message;

/// How long a released recognizer driver gets to shut down cleanly before it
/// is aborted
const RECOGNIZER_RELEASE_GRACE: Duration = Duration::from_secs(2);

/// Upstream capability a status or error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Transcription,
    Generation,
    Synthesis,
}

impl Service {
    pub fn label(&self) -> &'static str {
        match self {
            Service::Transcription => "Transcription",
            Service::Generation => "Response generation",
            Service::Synthesis => "Speech synthesis",
        }
    }
}

/// Errors raised by capability adapters
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityError {
    /// Credentials or configuration missing
    Unavailable(String),
    /// The call did not produce its next item within the ceiling
    Timeout,
    /// The call failed (network, HTTP status, protocol, parse)
    Failed(String),
}

impl std::fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityError::Unavailable(e) => write!(f, "not configured: {}", e),
            CapabilityError::Timeout => write!(f, "timed out"),
            CapabilityError::Failed(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CapabilityError {}

// ============================================================================
// Recognizer
// ============================================================================

/// Settings passed to `Recognizer::begin`
#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    /// PCM16 sample rate of the client's audio frames
    pub sample_rate: u32,
    /// Ceiling for establishing the upstream connection
    pub connect_timeout: Duration,
    /// Capacity of the audio hand-off queue
    pub audio_queue: usize,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            connect_timeout: Duration::from_secs(10),
            audio_queue: 64,
        }
    }
}

/// Events produced by a recognizer feed, delivered in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerEvent {
    Partial {
        text: String,
    },
    Final {
        text: String,
        end_of_turn: bool,
        confidence: Option<f32>,
    },
    Error {
        message: String,
    },
    Terminated,
}

/// Why a frame could not be handed to the recognizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedError {
    /// Hand-off queue is full; the frame was dropped
    Full,
    /// The feed has been released or its driver exited
    Closed,
}

/// Live recognizer connection for one session
///
/// Audio goes in through a bounded queue (`try_send_audio` never waits);
/// events come out through the receiver returned by `take_events`. The
/// optional driver task is the adapter's background I/O and is torn down by
/// `close()` or on drop.
pub struct RecognizerFeed {
    audio_tx: Option<mpsc::Sender<Vec<u8>>>,
    events: Option<mpsc::Receiver<RecognizerEvent>>,
    driver: Option<JoinHandle<()>>,
}

impl RecognizerFeed {
    pub fn new(
        audio_tx: mpsc::Sender<Vec<u8>>,
        events: mpsc::Receiver<RecognizerEvent>,
        driver: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            audio_tx: Some(audio_tx),
            events: Some(events),
            driver,
        }
    }

    /// Hand a frame to the recognizer without waiting
    pub fn try_send_audio(&self, frame: Vec<u8>) -> Result<(), FeedError> {
        let tx = self.audio_tx.as_ref().ok_or(FeedError::Closed)?;
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FeedError::Full,
            mpsc::error::TrySendError::Closed(_) => FeedError::Closed,
        })
    }

    /// Take ownership of the event receiver so the session loop can select on it
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<RecognizerEvent>> {
        self.events.take()
    }

    pub fn is_open(&self) -> bool {
        self.audio_tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Release the feed
    ///
    /// Closing the audio queue lets the driver end the upstream session
    /// gracefully; if it has not finished within the grace period it is
    /// aborted. Calling this more than once is a no-op.
    pub fn close(&mut self) {
        self.audio_tx = None;
        self.events = None;
        if let Some(mut driver) = self.driver.take() {
            tokio::spawn(async move {
                if tokio::time::timeout(RECOGNIZER_RELEASE_GRACE, &mut driver)
                    .await
                    .is_err()
                {
                    log::debug!("Recognizer driver did not stop in time, aborting");
                    driver.abort();
                }
            });
        }
    }
}

impl Drop for RecognizerFeed {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Speech-to-text capability
pub trait Recognizer: Send + Sync + 'static {
    fn begin(&self, config: RecognizerConfig)
        -> BoxFuture<'static, Result<RecognizerFeed, CapabilityError>>;
}

// ============================================================================
// Generator
// ============================================================================

/// Lazy sequence of reply text fragments; may fail at any item
pub type FragmentStream = BoxStream<'static, Result<String, CapabilityError>>;

/// Language-model capability
pub trait ResponseGenerator: Send + Sync + 'static {
    /// Start generating a reply to `history` (an owned snapshot)
    fn generate(&self, history: Vec<Message>) -> FragmentStream;
}

// ============================================================================
// Synthesizer
// ============================================================================

/// Lazy sequence of encoded audio fragments for one piece of text
pub type AudioStream = BoxStream<'static, Result<Vec<u8>, CapabilityError>>;

/// Text-to-speech capability
pub trait SpeechSynthesizer: Send + Sync + 'static {
    fn begin(&self, voice_id: &str)
        -> BoxFuture<'static, Result<Box<dyn SynthesizerFeed>, CapabilityError>>;
}

/// Synthesizer connection for one response
pub trait SynthesizerFeed: Send {
    /// Synthesize one text fragment. `is_final` marks the last fragment of
    /// the current response.
    fn synthesize(&mut self, text: String, is_final: bool) -> AudioStream;

    /// Reset for a new turn without tearing down the connection
    fn clear(&mut self);
}

// ============================================================================
// Helpers
// ============================================================================

/// Wait for the next item of a capability stream, bounded by `limit`
///
/// Exhaustion is `Ok(None)`; an elapsed ceiling is `CapabilityError::Timeout`.
pub async fn next_within<S, T>(stream: &mut S, limit: Duration) -> Result<Option<T>, CapabilityError>
where
    S: Stream<Item = Result<T, CapabilityError>> + Unpin,
{
    match tokio::time::timeout(limit, stream.next()).await {
        Err(_) => Err(CapabilityError::Timeout),
        Ok(None) => Ok(None),
        Ok(Some(item)) => item.map(Some),
    }
}

/// Adapt a channel receiver into a boxed stream
pub fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}
