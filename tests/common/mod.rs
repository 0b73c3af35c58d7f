//! Stub capabilities and a harness for driving a session without a socket

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use parley::capabilities::{
    AudioStream, CapabilityError, FragmentStream, Recognizer, RecognizerConfig, RecognizerEvent,
    RecognizerFeed, ResponseGenerator, SpeechSynthesizer, SynthesizerFeed,
};
use parley::fallback::{FallbackPolicy, StaticAsset};
use parley::history::{ConversationHistoryStore, Message};
use parley::protocol::{Inbound, ServerMessage};
use parley::services::Services;
use parley::session::SessionOrchestrator;
use parley::settings::AppSettings;

pub const FALLBACK_AUDIO: &[u8] = b"fallback-mp3-bytes";
pub const FALLBACK_MESSAGE: &str = "Sorry, I can't answer right now.";
pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Recognizer
// ============================================================================

/// Replies to the Nth audio frame with the Nth scripted event
#[derive(Clone, Default)]
pub struct ScriptedRecognizer {
    script: Arc<Mutex<VecDeque<RecognizerEvent>>>,
    pub frames: Arc<AtomicUsize>,
    pub released: Arc<AtomicBool>,
    pub connects: Arc<AtomicUsize>,
}

impl ScriptedRecognizer {
    pub fn new(script: Vec<RecognizerEvent>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Self::default()
        }
    }

    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Recognizer for ScriptedRecognizer {
    fn begin(&self, config: RecognizerConfig) -> BoxFuture<'static, Result<RecognizerFeed, CapabilityError>> {
        let this = self.clone();
        Box::pin(async move {
            this.connects.fetch_add(1, Ordering::SeqCst);
            let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(config.audio_queue);
            let (events_tx, events_rx) = mpsc::channel(16);

            let driver = tokio::spawn(async move {
                while audio_rx.recv().await.is_some() {
                    this.frames.fetch_add(1, Ordering::SeqCst);
                    let next = this.script.lock().unwrap().pop_front();
                    if let Some(event) = next {
                        if events_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                this.released.store(true, Ordering::SeqCst);
            });

            Ok(RecognizerFeed::new(audio_tx, events_rx, Some(driver)))
        })
    }
}

pub struct FailingRecognizer;

impl Recognizer for FailingRecognizer {
    fn begin(&self, _config: RecognizerConfig) -> BoxFuture<'static, Result<RecognizerFeed, CapabilityError>> {
        Box::pin(async { Err(CapabilityError::Failed("handshake rejected".to_string())) })
    }
}

pub fn partial(text: &str) -> RecognizerEvent {
    RecognizerEvent::Partial {
        text: text.to_string(),
    }
}

pub fn end_of_turn(text: &str) -> RecognizerEvent {
    RecognizerEvent::Final {
        text: text.to_string(),
        end_of_turn: true,
        confidence: Some(0.92),
    }
}

// ============================================================================
// Generator
// ============================================================================

#[derive(Clone)]
pub struct ScriptedGenerator {
    fragments: Vec<Result<String, CapabilityError>>,
    pub calls: Arc<AtomicUsize>,
    pub prompts: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl ScriptedGenerator {
    pub fn new(fragments: &[&str]) -> Self {
        Self::with_results(fragments.iter().map(|f| Ok(f.to_string())).collect())
    }

    pub fn with_results(fragments: Vec<Result<String, CapabilityError>>) -> Self {
        Self {
            fragments,
            calls: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing() -> Self {
        Self::with_results(vec![Err(CapabilityError::Failed("model overloaded".to_string()))])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ResponseGenerator for ScriptedGenerator {
    fn generate(&self, history: Vec<Message>) -> FragmentStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(history);
        stream::iter(self.fragments.clone()).boxed()
    }
}

/// Never yields a fragment
pub struct StalledGenerator;

impl ResponseGenerator for StalledGenerator {
    fn generate(&self, _history: Vec<Message>) -> FragmentStream {
        stream::pending().boxed()
    }
}

/// Yields one fragment, then holds the response open until released
#[derive(Clone, Default)]
pub struct GatedGenerator {
    gate: Arc<Notify>,
}

impl GatedGenerator {
    pub fn release(&self) {
        self.gate.notify_one();
    }
}

impl ResponseGenerator for GatedGenerator {
    fn generate(&self, _history: Vec<Message>) -> FragmentStream {
        let gate = Arc::clone(&self.gate);
        stream::iter(vec![Ok("Let me think.".to_string())])
            .chain(stream::once(async move {
                gate.notified().await;
                Ok(" Done.".to_string())
            }))
            .boxed()
    }
}

// ============================================================================
// Synthesizer
// ============================================================================

/// Audio bytes are the fragment text
pub struct EchoSynthesizer;

struct EchoFeed;

impl SpeechSynthesizer for EchoSynthesizer {
    fn begin(&self, _voice_id: &str) -> BoxFuture<'static, Result<Box<dyn SynthesizerFeed>, CapabilityError>> {
        Box::pin(async { Ok(Box::new(EchoFeed) as Box<dyn SynthesizerFeed>) })
    }
}

impl SynthesizerFeed for EchoFeed {
    fn synthesize(&mut self, text: String, _is_final: bool) -> AudioStream {
        if text.trim().is_empty() {
            return stream::empty().boxed();
        }
        stream::iter(vec![Ok(text.into_bytes())]).boxed()
    }

    fn clear(&mut self) {}
}

pub struct FailingSynthesizer;

impl SpeechSynthesizer for FailingSynthesizer {
    fn begin(&self, _voice_id: &str) -> BoxFuture<'static, Result<Box<dyn SynthesizerFeed>, CapabilityError>> {
        Box::pin(async { Err(CapabilityError::Failed("voice service down".to_string())) })
    }
}

/// Opens fine, but its audio never arrives
pub struct StalledSynthesizer;

struct StalledFeed;

impl SpeechSynthesizer for StalledSynthesizer {
    fn begin(&self, _voice_id: &str) -> BoxFuture<'static, Result<Box<dyn SynthesizerFeed>, CapabilityError>> {
        Box::pin(async { Ok(Box::new(StalledFeed) as Box<dyn SynthesizerFeed>) })
    }
}

impl SynthesizerFeed for StalledFeed {
    fn synthesize(&mut self, _text: String, _is_final: bool) -> AudioStream {
        stream::pending().boxed()
    }

    fn clear(&mut self) {}
}

// ============================================================================
// Harness
// ============================================================================

pub fn services() -> Services {
    services_with(AppSettings::default())
}

pub fn services_with(settings: AppSettings) -> Services {
    Services::new(settings, ConversationHistoryStore::in_memory())
        .with_fallback(FallbackPolicy::new(FALLBACK_MESSAGE, StaticAsset(FALLBACK_AUDIO.to_vec())))
}

/// Wait until `ready` holds, polling
pub async fn eventually<F>(ready: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

pub struct Harness {
    pub services: Arc<Services>,
    pub inbound: Option<mpsc::Sender<Inbound>>,
    pub outbound: mpsc::Receiver<ServerMessage>,
    pub session_id: String,
    pub conversation_id: String,
    pub task: JoinHandle<()>,
}

impl Harness {
    pub async fn start(services: Services) -> Self {
        Self::resume(Arc::new(services), None).await
    }

    pub async fn resume(services: Arc<Services>, conversation: Option<String>) -> Self {
        let (out_tx, outbound) = mpsc::channel(256);
        let (in_tx, in_rx) = mpsc::channel(64);
        let session = SessionOrchestrator::accept(Arc::clone(&services), out_tx, conversation).await;
        let session_id = session.id().to_string();
        let conversation_id = session.conversation_id().to_string();
        let task = tokio::spawn(session.run(in_rx));
        Self {
            services,
            inbound: Some(in_tx),
            outbound,
            session_id,
            conversation_id,
            task,
        }
    }

    pub async fn send(&self, msg: Inbound) {
        self.inbound
            .as_ref()
            .expect("inbound already closed")
            .send(msg)
            .await
            .expect("session loop gone");
    }

    pub async fn send_text(&self, text: &str) {
        self.send(Inbound::from_text(text)).await;
    }

    pub async fn send_audio(&self, frames: usize) {
        for _ in 0..frames {
            self.send(Inbound::Audio(vec![1u8; 320])).await;
        }
    }

    pub async fn next(&mut self) -> ServerMessage {
        tokio::time::timeout(WAIT, self.outbound.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("outbound closed")
    }

    /// Collect events up to and including the first one matching `done`
    pub async fn until<F>(&mut self, done: F) -> Vec<ServerMessage>
    where
        F: Fn(&ServerMessage) -> bool,
    {
        let mut seen = Vec::new();
        loop {
            let msg = self.next().await;
            let stop = done(&msg);
            seen.push(msg);
            if stop {
                return seen;
            }
        }
    }

    /// Events that arrive within `window`
    pub async fn quiet_for(&mut self, window: Duration) -> Vec<ServerMessage> {
        let mut seen = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout(window, self.outbound.recv()).await {
            seen.push(msg);
        }
        seen
    }

    /// Drop the client side and wait for the session loop to finish
    pub async fn disconnect(mut self) -> Arc<Services> {
        self.inbound = None;
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("session did not close")
            .expect("session task panicked");
        self.services
    }
}

pub fn is_status(msg: &ServerMessage, text: &str) -> bool {
    matches!(msg, ServerMessage::Status { message } if message == text)
}

pub fn is_ready_for_next_turn(msg: &ServerMessage) -> bool {
    is_status(msg, "Ready for next turn.")
}

pub fn kinds(events: &[ServerMessage]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind()).collect()
}

pub fn position<F>(events: &[ServerMessage], pred: F) -> usize
where
    F: Fn(&ServerMessage) -> bool,
{
    events
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("event not found in {:?}", kinds(events)))
}
