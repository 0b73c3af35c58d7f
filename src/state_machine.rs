//! Session state machine
//!
//! Single-writer pattern: every transition of a session goes through
//! `reduce()`, which returns the next state and the effects the session loop
//! must execute, in order. The reducer does no I/O.
//!
//! ```text
//! Connected → AwaitingAudio → TurnAccumulating → TurnFinalized
//!     → GeneratingResponse → Synthesizing → AwaitingAudio
//! (any) → Closing → Closed
//! ```
//!
//! `TurnFinalized` is transient: the session loop dispatches `CommitTurn`
//! immediately after entering it, before handling any other input.

use uuid::Uuid;

use crate::history::Message;
use crate::protocol::ServerMessage;
use crate::transcript::TranscriptAccumulator;

#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Connected,
    AwaitingAudio,
    TurnAccumulating {
        turn_id: Uuid,
        transcript: TranscriptAccumulator,
    },
    TurnFinalized {
        turn_id: Uuid,
        text: String,
    },
    GeneratingResponse {
        turn_id: Uuid,
    },
    Synthesizing {
        turn_id: Uuid,
    },
    Closing,
    Closed,
}

impl Default for State {
    fn default() -> Self {
        State::Connected
    }
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Connected => "connected",
            State::AwaitingAudio => "awaiting_audio",
            State::TurnAccumulating { .. } => "turn_accumulating",
            State::TurnFinalized { .. } => "turn_finalized",
            State::GeneratingResponse { .. } => "generating_response",
            State::Synthesizing { .. } => "synthesizing",
            State::Closing => "closing",
            State::Closed => "closed",
        }
    }

    /// A response (or one-shot synthesis) is in flight
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            State::GeneratingResponse { .. } | State::Synthesizing { .. }
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, State::Closing | State::Closed)
    }

    fn response_id(&self) -> Option<Uuid> {
        match self {
            State::GeneratingResponse { turn_id } | State::Synthesizing { turn_id } => {
                Some(*turn_id)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Session registered and outbound channel open
    Ready,
    /// A validated inbound audio frame
    AudioAccepted(Vec<u8>),
    StartRecording,
    StopRecording,
    GenerateTts {
        text: String,
    },

    // Recognizer events
    RecognizerPartial {
        text: String,
    },
    RecognizerFinal {
        text: String,
        end_of_turn: bool,
        confidence: Option<f32>,
    },
    RecognizerError {
        message: String,
    },
    RecognizerTerminated,

    /// Process the finalized turn (dispatched by the loop, never by clients)
    CommitTurn,

    // Pipeline events (carry the turn id so stale ones are ignored)
    SynthesisStarted {
        turn_id: Uuid,
    },
    ResponseFinished {
        turn_id: Uuid,
        /// Assistant message to record; `None` for one-shot synthesis
        assistant_text: Option<String>,
    },

    Close {
        reason: String,
    },
    /// Feeds released and registry entry removed
    Released,
}

impl Event {
    /// Event name for logging (audio payloads are never logged)
    pub fn name(&self) -> &'static str {
        match self {
            Event::Ready => "ready",
            Event::AudioAccepted(_) => "audio",
            Event::StartRecording => "start_recording",
            Event::StopRecording => "stop_recording",
            Event::GenerateTts { .. } => "generate_tts",
            Event::RecognizerPartial { .. } => "recognizer_partial",
            Event::RecognizerFinal { .. } => "recognizer_final",
            Event::RecognizerError { .. } => "recognizer_error",
            Event::RecognizerTerminated => "recognizer_terminated",
            Event::CommitTurn => "commit_turn",
            Event::SynthesisStarted { .. } => "synthesis_started",
            Event::ResponseFinished { .. } => "response_finished",
            Event::Close { .. } => "close",
            Event::Released => "released",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Effect {
    Emit(ServerMessage),
    /// Hand a frame to the recognizer feed
    ForwardAudio(Vec<u8>),
    /// Hold a frame until the session is ready for audio again
    BufferAudio(Vec<u8>),
    FlushBufferedAudio,
    StartRecognizer,
    StopRecognizer,
    /// Recognizer failed: report it and drop the feed
    RecognizerLost {
        message: String,
    },
    AppendHistory(Message),
    StartResponse {
        turn_id: Uuid,
    },
    SpeakText {
        turn_id: Uuid,
        text: String,
    },
    /// Turn boundary with no speech
    EmptyTurn,
    CancelResponse,
    Unregister,
}

const READY_MESSAGE: &str = "Connected. Ready for audio.";
const NEXT_TURN_MESSAGE: &str = "Ready for next turn.";

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore pipeline events with stale turn ids
/// - Transcripts arriving while a response is in flight are dropped
/// - Close is idempotent
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    // Helper: check if a pipeline event's id is stale
    let is_stale = |eid: Uuid| state.response_id() != Some(eid);

    match (state, event) {
        // -----------------
        // Closing / Closed
        // -----------------
        (State::Closing, Released) => (State::Closed, vec![]),
        (State::Closing | State::Closed, _) => (state.clone(), vec![]),

        (_, Close { reason }) => {
            log::info!("Session closing from {}: {}", state.name(), reason);
            (
                State::Closing,
                vec![CancelResponse, StopRecognizer, Unregister],
            )
        }

        // -----------------
        // Connected
        // -----------------
        (State::Connected, Ready) => (
            State::AwaitingAudio,
            vec![Emit(ServerMessage::status(READY_MESSAGE))],
        ),
        (State::Connected, event) => {
            log::debug!("Ignoring {} before session is ready", event.name());
            (state.clone(), vec![])
        }

        // -----------------
        // Audio
        // -----------------
        (State::AwaitingAudio | State::TurnAccumulating { .. }, AudioAccepted(frame)) => {
            (state.clone(), vec![ForwardAudio(frame)])
        }
        (State::GeneratingResponse { .. } | State::Synthesizing { .. }, AudioAccepted(frame)) => {
            (state.clone(), vec![BufferAudio(frame)])
        }

        // -----------------
        // Recording control
        // -----------------
        (_, StartRecording) => (state.clone(), vec![StartRecognizer]),

        (State::TurnAccumulating { turn_id, transcript }, StopRecording) => {
            // The user ended the span explicitly
            let (next, mut effects) = finalize(*turn_id, transcript);
            effects.insert(0, StopRecognizer);
            (next, effects)
        }
        (_, StopRecording) => (state.clone(), vec![StopRecognizer]),

        (State::AwaitingAudio, GenerateTts { text }) => {
            let turn_id = Uuid::new_v4();
            (
                State::Synthesizing { turn_id },
                vec![SpeakText { turn_id, text }],
            )
        }
        (_, GenerateTts { .. }) => (
            state.clone(),
            vec![Emit(ServerMessage::error(&crate::error::SessionError::Validation(
                "generate_tts is only accepted between turns".to_string(),
            )))],
        ),

        // -----------------
        // Recognizer events
        // -----------------
        (State::GeneratingResponse { .. } | State::Synthesizing { .. }, RecognizerPartial { .. })
        | (State::GeneratingResponse { .. } | State::Synthesizing { .. }, RecognizerFinal { .. }) => {
            log::warn!(
                "Dropping transcript received while {} (audio from before the turn boundary)",
                state.name()
            );
            (state.clone(), vec![])
        }

        (State::AwaitingAudio, RecognizerPartial { text }) => {
            let mut transcript = TranscriptAccumulator::start();
            transcript.process_partial(&text);
            (
                State::TurnAccumulating {
                    turn_id: Uuid::new_v4(),
                    transcript,
                },
                vec![Emit(partial(text))],
            )
        }
        (State::TurnAccumulating { turn_id, transcript }, RecognizerPartial { text }) => {
            let mut transcript = transcript.clone();
            transcript.process_partial(&text);
            (
                State::TurnAccumulating {
                    turn_id: *turn_id,
                    transcript,
                },
                vec![Emit(partial(text))],
            )
        }

        (
            State::AwaitingAudio,
            RecognizerFinal {
                text,
                end_of_turn,
                confidence,
            },
        ) => accept_final(
            Uuid::new_v4(),
            TranscriptAccumulator::start(),
            text,
            end_of_turn,
            confidence,
        ),
        (
            State::TurnAccumulating { turn_id, transcript },
            RecognizerFinal {
                text,
                end_of_turn,
                confidence,
            },
        ) => accept_final(*turn_id, transcript.clone(), text, end_of_turn, confidence),

        (State::TurnAccumulating { transcript, .. }, RecognizerError { message }) => {
            log::warn!(
                "Recognizer failed mid-turn, discarding partial turn {:?}",
                transcript.display_text()
            );
            (State::AwaitingAudio, vec![RecognizerLost { message }])
        }
        (_, RecognizerError { message }) => (state.clone(), vec![RecognizerLost { message }]),

        (State::TurnAccumulating { turn_id, transcript }, RecognizerTerminated) => {
            let (next, mut effects) = finalize(*turn_id, transcript);
            effects.insert(0, StopRecognizer);
            (next, effects)
        }
        (_, RecognizerTerminated) => (state.clone(), vec![StopRecognizer]),

        // -----------------
        // TurnFinalized
        // -----------------
        (State::TurnFinalized { turn_id, text }, CommitTurn) => {
            if text.trim().is_empty() {
                log::info!("Turn {} had no speech, back to awaiting audio", turn_id);
                (State::AwaitingAudio, vec![EmptyTurn])
            } else {
                (
                    State::GeneratingResponse { turn_id: *turn_id },
                    vec![
                        AppendHistory(Message::user(text.clone())),
                        StartResponse { turn_id: *turn_id },
                    ],
                )
            }
        }

        // -----------------
        // Response pipeline
        // -----------------
        (State::GeneratingResponse { turn_id }, SynthesisStarted { turn_id: id }) if *turn_id == id => {
            (State::Synthesizing { turn_id: *turn_id }, vec![])
        }
        (
            State::GeneratingResponse { .. } | State::Synthesizing { .. },
            ResponseFinished {
                turn_id,
                assistant_text,
            },
        ) if !is_stale(turn_id) => {
            let mut effects = Vec::new();
            if let Some(text) = assistant_text {
                effects.push(AppendHistory(Message::assistant(text)));
            }
            effects.push(Emit(ServerMessage::status(NEXT_TURN_MESSAGE)));
            effects.push(FlushBufferedAudio);
            (State::AwaitingAudio, effects)
        }
        (_, SynthesisStarted { turn_id } | ResponseFinished { turn_id, .. }) => {
            log::debug!("Ignoring stale pipeline event for turn {}", turn_id);
            (state.clone(), vec![])
        }

        // -----------------
        // Everything else is a no-op
        // -----------------
        (_, event) => {
            log::debug!("Ignoring {} in state {}", event.name(), state.name());
            (state.clone(), vec![])
        }
    }
}

fn partial(text: String) -> ServerMessage {
    ServerMessage::Transcription {
        text,
        is_final: false,
        confidence: None,
    }
}

fn accept_final(
    turn_id: Uuid,
    mut transcript: TranscriptAccumulator,
    text: String,
    end_of_turn: bool,
    confidence: Option<f32>,
) -> (State, Vec<Effect>) {
    transcript.process_final(&text);

    let mut effects = Vec::new();
    if !text.trim().is_empty() {
        effects.push(Effect::Emit(ServerMessage::Transcription {
            text,
            is_final: true,
            confidence,
        }));
    }

    if end_of_turn {
        let (next, more) = finalize(turn_id, &transcript);
        effects.extend(more);
        (next, effects)
    } else {
        (
            State::TurnAccumulating {
                turn_id,
                transcript,
            },
            effects,
        )
    }
}

/// Turn boundary: emit `turn_detection` and enter `TurnFinalized`
fn finalize(turn_id: Uuid, transcript: &TranscriptAccumulator) -> (State, Vec<Effect>) {
    let text = transcript.text().to_string();
    let duration_ms = transcript.duration().as_millis() as u64;
    log::info!(
        "Turn {} finalized after {}ms ({} chars)",
        turn_id,
        duration_ms,
        text.len()
    );
    (
        State::TurnFinalized {
            turn_id,
            text: text.clone(),
        },
        vec![Effect::Emit(ServerMessage::TurnDetection { text, duration_ms })],
    )
}
