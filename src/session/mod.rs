//! Per-connection session orchestration
//!
//! A `SessionOrchestrator` owns one client connection from accept to close.
//! Its run loop selects over inbound client messages, recognizer events,
//! response pipeline events and the registry's cancellation token, feeds
//! each through the reducer in `state_machine`, and executes the resulting
//! effects in order. All outbound events go through one bounded queue
//! drained by the connection's writer task, so the client sees them in
//! generation order.

mod pipeline;
mod registry;

pub use pipeline::{PipelineContext, PipelineEvent, TaskGuard};
pub use registry::{SessionHandle, SessionRegistry};

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::{analyze_pcm16, AudioFrameValidator, PendingAudio};
use crate::capabilities::{CapabilityError, FeedError, RecognizerEvent, RecognizerFeed, Service};
use crate::error::SessionError;
use crate::metrics;
use crate::protocol::{ClientMessage, Inbound, ServerMessage};
use crate::services::Services;
use crate::state_machine::{reduce, Effect, Event, State};

type ConnectResult = Result<RecognizerFeed, CapabilityError>;

impl From<RecognizerEvent> for Event {
    fn from(event: RecognizerEvent) -> Self {
        match event {
            RecognizerEvent::Partial { text } => Event::RecognizerPartial { text },
            RecognizerEvent::Final {
                text,
                end_of_turn,
                confidence,
            } => Event::RecognizerFinal {
                text,
                end_of_turn,
                confidence,
            },
            RecognizerEvent::Error { message } => Event::RecognizerError { message },
            RecognizerEvent::Terminated => Event::RecognizerTerminated,
        }
    }
}

impl From<PipelineEvent> for Event {
    fn from(event: PipelineEvent) -> Self {
        match event {
            PipelineEvent::SynthesisStarted { turn_id } => Event::SynthesisStarted { turn_id },
            PipelineEvent::Finished {
                turn_id,
                assistant_text,
            } => Event::ResponseFinished {
                turn_id,
                assistant_text,
            },
        }
    }
}

pub struct SessionOrchestrator {
    id: String,
    conversation_id: String,
    services: Arc<Services>,
    handle: Arc<SessionHandle>,
    state: State,
    outbound: mpsc::Sender<ServerMessage>,
    transport_lost: bool,

    validator: AudioFrameValidator,
    pending: PendingAudio,
    rejected_frames: u64,
    dropped_frames: u64,

    recognizer: Option<RecognizerFeed>,
    recognizer_events: Option<mpsc::Receiver<RecognizerEvent>>,
    recognizer_wanted: bool,
    recognizer_connecting: bool,
    connect_tx: mpsc::Sender<ConnectResult>,
    connect_rx: mpsc::Receiver<ConnectResult>,

    pipeline: Option<(Uuid, TaskGuard<()>)>,
    pipeline_tx: mpsc::Sender<PipelineEvent>,
    pipeline_rx: mpsc::Receiver<PipelineEvent>,

    unregistered: bool,
}

impl SessionOrchestrator {
    /// Allocate and register a session, then announce readiness and the
    /// availability of each capability.
    ///
    /// `conversation_id` resumes a stored conversation when it is a valid UUID;
    /// otherwise the session id doubles as the conversation id.
    pub async fn accept(
        services: Arc<Services>,
        outbound: mpsc::Sender<ServerMessage>,
        conversation_id: Option<String>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let conversation_id = resolve_conversation(&services, conversation_id, &id);
        let handle = services.registry.register(&id, &conversation_id);
        metrics::record(&services.metrics, |m| m.session_opened());

        let settings = &services.settings;
        let validator = AudioFrameValidator::new(settings.min_frame_bytes, settings.max_frame_bytes);
        let pending = PendingAudio::new(settings.max_buffered_frames);
        let (connect_tx, connect_rx) = mpsc::channel(1);
        let (pipeline_tx, pipeline_rx) = mpsc::channel(16);

        log::info!("Session {} accepted (conversation {})", id, conversation_id);

        let mut session = Self {
            id,
            conversation_id,
            services,
            handle,
            state: State::Connected,
            outbound,
            transport_lost: false,
            validator,
            pending,
            rejected_frames: 0,
            dropped_frames: 0,
            recognizer: None,
            recognizer_events: None,
            recognizer_wanted: false,
            recognizer_connecting: false,
            connect_tx,
            connect_rx,
            pipeline: None,
            pipeline_tx,
            pipeline_rx,
            unregistered: false,
        };

        session.dispatch(Event::Ready).await;
        for service in [Service::Transcription, Service::Generation, Service::Synthesis] {
            let msg = if session.services.is_configured(service) {
                ServerMessage::service_status(service, true, format!("{} available", service.label()))
            } else {
                ServerMessage::service_status(service, false, Services::missing_reason(service))
            };
            session.emit_or_close(msg).await;
        }
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn handle(&self) -> Arc<SessionHandle> {
        Arc::clone(&self.handle)
    }

    /// Drive the session until it is closed
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) {
        let token = self.handle.token().clone();

        while self.state != State::Closed {
            tokio::select! {
                _ = token.cancelled() => self.close("server shutting down").await,
                msg = inbound.recv() => match msg {
                    Some(Inbound::Audio(bytes)) => self.on_audio_frame(bytes).await,
                    Some(Inbound::Control(control)) => self.on_control(control).await,
                    Some(Inbound::Invalid(reason)) => {
                        log::debug!("Session {}: invalid control message: {}", self.id, reason);
                        self.emit_or_close(ServerMessage::error(&SessionError::Validation(reason)))
                            .await;
                    }
                    None => self.close("client disconnected").await,
                },
                event = recv_opt(&mut self.recognizer_events) => self.on_recognizer_event(event).await,
                Some(result) = self.connect_rx.recv() => self.on_recognizer_connected(result).await,
                Some(event) = self.pipeline_rx.recv() => self.on_pipeline_event(event).await,
                _ = self.outbound.closed() => {
                    self.transport_failed(SessionError::TransportFailure("outbound channel closed".to_string()))
                        .await
                }
            }
        }

        log::info!(
            "Session {} finished ({} frames rejected, {} dropped, {} evicted while busy)",
            self.id,
            self.rejected_frames,
            self.dropped_frames,
            self.pending.evicted()
        );
    }

    /// Validate a frame and hand it to the state machine
    pub async fn on_audio_frame(&mut self, bytes: Vec<u8>) {
        let verdict = self.validator.validate(&bytes);
        if !verdict.is_accepted() {
            self.rejected_frames += 1;
            log::debug!("Session {}: dropping frame: {}", self.id, verdict);
            return;
        }
        if log::log_enabled!(log::Level::Trace) {
            let stats = analyze_pcm16(&bytes);
            log::trace!(
                "Session {}: frame {} samples, peak {}, rms {:.1}{}",
                self.id,
                stats.samples,
                stats.peak_abs,
                stats.rms,
                if stats.is_silent() { " (silent)" } else { "" }
            );
        }
        self.dispatch(Event::AudioAccepted(bytes)).await;
    }

    pub async fn on_control(&mut self, msg: ClientMessage) {
        log::debug!("Session {}: control {:?}", self.id, msg);
        let event = match msg {
            ClientMessage::StartRecording => Event::StartRecording,
            ClientMessage::StopRecording => Event::StopRecording,
            ClientMessage::GenerateTts { text } => Event::GenerateTts { text },
        };
        self.dispatch(event).await;
    }

    /// Close the session: cancel the pipeline, release the recognizer,
    /// unregister. Idempotent.
    pub async fn close(&mut self, reason: &str) {
        self.dispatch(Event::Close {
            reason: reason.to_string(),
        })
        .await;
    }

    async fn on_recognizer_event(&mut self, event: Option<RecognizerEvent>) {
        match event {
            Some(event) => self.dispatch(event.into()).await,
            None => {
                // Driver exited without a terminal event
                self.recognizer_events = None;
                if self.recognizer.is_some() {
                    self.dispatch(Event::RecognizerTerminated).await;
                }
            }
        }
    }

    async fn on_recognizer_connected(&mut self, result: ConnectResult) {
        self.recognizer_connecting = false;
        match result {
            Ok(mut feed) => {
                if !self.recognizer_wanted || self.state.is_closed() {
                    log::debug!("Session {}: recognizer connected after stop, releasing", self.id);
                    feed.close();
                    return;
                }
                self.recognizer_events = feed.take_events();
                self.recognizer = Some(feed);
                log::info!("Session {}: recognizer connected", self.id);

                if !self.state.is_busy() {
                    self.flush_pending();
                }
                self.emit_or_close(ServerMessage::service_status(
                    Service::Transcription,
                    true,
                    "Transcription connected",
                ))
                .await;
                self.emit_or_close(ServerMessage::status("Recording started")).await;
            }
            Err(e) => {
                self.recognizer_wanted = false;
                self.pending.clear();
                if self.state.is_closed() {
                    return;
                }
                let err = SessionError::from_capability(Service::Transcription, e);
                log::warn!("Session {}: {}", self.id, err);
                self.record_error(&err);
                self.emit_or_close(ServerMessage::error(&err)).await;
                self.emit_or_close(ServerMessage::service_status(
                    Service::Transcription,
                    false,
                    err.to_string(),
                ))
                .await;
            }
        }
    }

    async fn on_pipeline_event(&mut self, event: PipelineEvent) {
        if let PipelineEvent::Finished { turn_id, .. } = &event {
            if self.pipeline.as_ref().is_some_and(|(id, _)| id == turn_id) {
                self.pipeline = None;
            }
        }
        self.dispatch(event.into()).await;
    }

    /// Run an event (and any follow-ups) through the reducer
    async fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            let name = event.name();
            let (next, effects) = reduce(&self.state, event);
            if next.name() != self.state.name() {
                log::debug!(
                    "Session {}: {} --{}--> {}",
                    self.id,
                    self.state.name(),
                    name,
                    next.name()
                );
            }
            self.state = next;

            for effect in effects {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }

            // The turn boundary is processed before any other input
            if matches!(self.state, State::TurnFinalized { .. }) {
                queue.push_front(Event::CommitTurn);
            }
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::Emit(msg) => match self.send_out(msg).await {
                Ok(()) => None,
                Err(e) => self.on_send_error(e),
            },
            Effect::ForwardAudio(frame) => {
                self.forward(frame);
                None
            }
            Effect::BufferAudio(frame) => {
                self.pending.push(frame);
                None
            }
            Effect::FlushBufferedAudio => {
                if self.recognizer.is_some() {
                    self.flush_pending();
                } else if !self.recognizer_connecting {
                    self.pending.clear();
                }
                None
            }
            Effect::StartRecognizer => self.start_recognizer().await,
            Effect::StopRecognizer => {
                self.recognizer_wanted = false;
                if self.release_recognizer() && !self.state.is_closed() {
                    return self.emit_event(ServerMessage::status("Recording stopped")).await;
                }
                None
            }
            Effect::RecognizerLost { message } => {
                self.recognizer_wanted = false;
                self.release_recognizer();
                let err = SessionError::CapabilityFailure {
                    service: Service::Transcription,
                    reason: message,
                };
                log::warn!("Session {}: {}", self.id, err);
                self.record_error(&err);
                if let Some(close) = self.emit_event(ServerMessage::error(&err)).await {
                    return Some(close);
                }
                self.emit_event(ServerMessage::service_status(
                    Service::Transcription,
                    false,
                    err.to_string(),
                ))
                .await
            }
            Effect::AppendHistory(message) => {
                self.services.history.append(&self.conversation_id, message);
                None
            }
            Effect::StartResponse { turn_id } => {
                let history = self.services.history.snapshot(&self.conversation_id);
                let guard = pipeline::spawn_response(self.pipeline_context(turn_id), history);
                self.pipeline = Some((turn_id, guard));
                None
            }
            Effect::SpeakText { turn_id, text } => {
                let guard = pipeline::spawn_speech(self.pipeline_context(turn_id), text);
                self.pipeline = Some((turn_id, guard));
                None
            }
            Effect::EmptyTurn => {
                metrics::record(&self.services.metrics, |m| m.empty_turn());
                None
            }
            Effect::CancelResponse => {
                if let Some((turn_id, guard)) = self.pipeline.take() {
                    if guard.is_finished() {
                        log::debug!("Session {}: response {} already finished", self.id, turn_id);
                    } else {
                        log::info!("Session {}: cancelling response {}", self.id, turn_id);
                    }
                    drop(guard);
                    metrics::record(&self.services.metrics, |m| m.response_cancelled(turn_id));
                }
                None
            }
            Effect::Unregister => {
                if !self.unregistered {
                    self.unregistered = true;
                    self.pending.clear();
                    if self.services.registry.remove(&self.id).is_none() {
                        log::warn!("Session {} was not registered at close", self.id);
                    }
                    self.handle.close();
                    metrics::record(&self.services.metrics, |m| m.session_closed());
                    if let Some(summary) = metrics::summary(&self.services.metrics) {
                        log::info!("Session {} closed. Metrics: {}", self.id, summary);
                    }
                }
                Some(Event::Released)
            }
        }
    }

    async fn start_recognizer(&mut self) -> Option<Event> {
        self.recognizer_wanted = true;
        if self.recognizer.is_some() || self.recognizer_connecting {
            log::debug!("Session {}: recognizer already active", self.id);
            return None;
        }

        let Some(recognizer) = self.services.recognizer.clone() else {
            // Audio is still accepted; it just goes nowhere
            let reason = Services::missing_reason(Service::Transcription);
            log::info!("Session {}: transcription unavailable ({})", self.id, reason);
            return self
                .emit_event(ServerMessage::status(format!(
                    "Transcription unavailable: {}",
                    reason
                )))
                .await;
        };

        self.recognizer_connecting = true;
        let connecting = recognizer.begin(self.services.settings.recognizer_config());
        let tx = self.connect_tx.clone();
        tokio::spawn(async move {
            // If the session is gone the feed is dropped, which aborts its driver
            let _ = tx.send(connecting.await).await;
        });

        self.emit_event(ServerMessage::status("Connecting to transcription service..."))
            .await
    }

    /// Returns whether a live feed was released
    fn release_recognizer(&mut self) -> bool {
        self.recognizer_events = None;
        match self.recognizer.take() {
            Some(mut feed) => {
                feed.close();
                log::info!("Session {}: recognizer released", self.id);
                true
            }
            None => false,
        }
    }

    fn forward(&mut self, frame: Vec<u8>) {
        if let Some(feed) = &self.recognizer {
            match feed.try_send_audio(frame) {
                Ok(()) => {}
                Err(FeedError::Full) => {
                    self.dropped_frames += 1;
                    log::warn!("Session {}: recognizer queue full, dropping frame", self.id);
                }
                Err(FeedError::Closed) => {
                    self.dropped_frames += 1;
                    log::debug!("Session {}: recognizer feed closed, dropping frame", self.id);
                }
            }
        } else if self.recognizer_connecting {
            self.pending.push(frame);
        } else {
            self.dropped_frames += 1;
        }
    }

    fn flush_pending(&mut self) {
        let frames = self.pending.drain_all();
        if frames.is_empty() {
            return;
        }
        log::debug!("Session {}: flushing {} buffered frames", self.id, frames.len());
        for frame in frames {
            self.forward(frame);
        }
    }

    fn pipeline_context(&self, turn_id: Uuid) -> PipelineContext {
        let settings = &self.services.settings;
        PipelineContext {
            turn_id,
            generator: self.services.generator.clone(),
            synthesizer: self.services.synthesizer.clone(),
            voice_id: settings.voice_id().to_string(),
            fallback: Arc::clone(&self.services.fallback),
            metrics: Arc::clone(&self.services.metrics),
            outbound: self.outbound.clone(),
            events: self.pipeline_tx.clone(),
            step_timeout: settings.capability_timeout(),
            max_response_chars: settings.max_response_chars,
        }
    }

    async fn send_out(&mut self, msg: ServerMessage) -> Result<(), SessionError> {
        if self.transport_lost {
            return Err(SessionError::TransportFailure("connection lost".to_string()));
        }
        log::trace!("Session {}: -> {}", self.id, msg.kind());
        self.outbound
            .send(msg)
            .await
            .map_err(|_| SessionError::TransportFailure("client connection closed".to_string()))
    }

    /// Send from inside effect execution; a failure becomes a close event
    async fn emit_event(&mut self, msg: ServerMessage) -> Option<Event> {
        match self.send_out(msg).await {
            Ok(()) => None,
            Err(e) => self.on_send_error(e),
        }
    }

    /// Send from outside the reducer; a failure closes the session
    async fn emit_or_close(&mut self, msg: ServerMessage) {
        if let Err(e) = self.send_out(msg).await {
            self.transport_failed(e).await;
        }
    }

    /// Only fatal errors close the session
    fn on_send_error(&mut self, err: SessionError) -> Option<Event> {
        if !err.is_fatal() {
            log::warn!("Session {}: {}", self.id, err);
            self.record_error(&err);
            return None;
        }
        if !self.transport_lost {
            self.transport_lost = true;
            log::warn!("Session {}: {}", self.id, err);
            self.record_error(&err);
        }
        Some(Event::Close {
            reason: err.to_string(),
        })
    }

    async fn transport_failed(&mut self, err: SessionError) {
        if let Some(close) = self.on_send_error(err) {
            self.dispatch(close).await;
        }
    }

    fn record_error(&self, err: &SessionError) {
        let session_id = self.id.clone();
        metrics::record(&self.services.metrics, |m| {
            m.record_error(err.kind().as_str(), err.to_string(), Some(session_id))
        });
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        // Never leave a registry entry behind, even if the loop was aborted
        if !self.unregistered {
            self.services.registry.remove(&self.id);
            metrics::record(&self.services.metrics, |m| m.session_closed());
        }
    }
}

fn resolve_conversation(services: &Services, requested: Option<String>, session_id: &str) -> String {
    match requested {
        Some(id) if Uuid::parse_str(&id).is_ok() => {
            if services.history.contains(&id) {
                log::info!("Resuming conversation {}", id);
            }
            id
        }
        Some(id) => {
            log::warn!("Ignoring invalid conversation id {:?}", id);
            session_id.to_string()
        }
        None => session_id.to_string(),
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
