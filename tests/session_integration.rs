//! End-to-end session tests
//!
//! Each test drives a real `SessionOrchestrator` loop through its inbound
//! channel and observes the ordered outbound event stream. Capabilities are
//! in-process stubs (see `common`), so no API keys or network are needed.
//!
//! ```bash
//! cargo test --test session_integration
//! ```

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use parley::capabilities::Service;
use parley::error::ErrorKind;
use parley::history::{Message, Role};
use parley::protocol::{ClientMessage, Inbound, ServerMessage};
use parley::session::SessionOrchestrator;
use parley::settings::AppSettings;
use parley::state_machine::State;
use tokio::sync::mpsc;

fn history(harness: &Harness) -> Vec<Message> {
    harness.services.history.snapshot(&harness.conversation_id)
}

async fn start_recording(harness: &mut Harness) {
    harness.send_text(r#"{"type":"start_recording"}"#).await;
    harness.until(|m| is_status(m, "Recording started")).await;
}

// ============================================================================
// Connection setup
// ============================================================================

#[tokio::test]
async fn accept_announces_ready_and_capabilities() {
    let services = services().with_generator(Arc::new(ScriptedGenerator::new(&["hi"])));
    let mut harness = Harness::start(services).await;

    assert!(is_status(&harness.next().await, "Connected. Ready for audio."));

    let mut statuses = Vec::new();
    for _ in 0..3 {
        match harness.next().await {
            ServerMessage::ServiceStatus {
                service, connected, ..
            } => statuses.push((service, connected)),
            other => panic!("expected service_status, got {:?}", other),
        }
    }
    assert_eq!(
        statuses,
        vec![
            (Service::Transcription, false),
            (Service::Generation, true),
            (Service::Synthesis, false),
        ]
    );
    assert_eq!(harness.services.registry.len(), 1);
    assert!(harness.services.registry.lookup(&harness.session_id).is_some());
}

#[tokio::test]
async fn invalid_control_message_is_a_validation_error() {
    let mut harness = Harness::start(services()).await;
    harness.quiet_for(Duration::from_millis(50)).await;

    harness.send_text("{not json").await;
    match harness.next().await {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::Validation),
        other => panic!("expected error, got {:?}", other),
    }

    // Still serving
    harness.send_text(r#"{"type":"generate_tts","text":"   "}"#).await;
    match harness.next().await {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::Validation),
        other => panic!("expected error, got {:?}", other),
    }
}

// ============================================================================
// Full turns
// ============================================================================

#[tokio::test]
async fn hello_there_turn_streams_text_and_audio() {
    let recognizer = ScriptedRecognizer::new(vec![partial("hel"), end_of_turn("hello there")]);
    let generator = ScriptedGenerator::new(&["Hi! ", "How can I help?"]);
    let services = services()
        .with_recognizer(Arc::new(recognizer.clone()))
        .with_generator(Arc::new(generator.clone()))
        .with_synthesizer(Arc::new(EchoSynthesizer));
    let mut harness = Harness::start(services).await;

    start_recording(&mut harness).await;
    harness.send_audio(2).await;
    let events = harness.until(is_ready_for_next_turn).await;

    let partial_at = position(&events, |m| {
        matches!(m, ServerMessage::Transcription { text, is_final: false, .. } if text == "hel")
    });
    let final_at = position(&events, |m| {
        matches!(m, ServerMessage::Transcription { text, is_final: true, .. } if text == "hello there")
    });
    let turn_at = position(&events, |m| {
        matches!(m, ServerMessage::TurnDetection { text, .. } if text == "hello there")
    });
    let start_at = position(&events, |m| matches!(m, ServerMessage::LlmResponseStart { .. }));
    let first_chunk_at = position(&events, |m| matches!(m, ServerMessage::LlmChunk { .. }));
    let end_at = position(&events, |m| matches!(m, ServerMessage::LlmResponseEnd { .. }));

    assert!(partial_at < final_at);
    assert!(final_at < turn_at);
    assert!(turn_at < start_at);
    assert!(start_at < first_chunk_at);
    assert!(first_chunk_at < end_at);
    assert!(events.iter().any(|m| m.audio_bytes().is_some()));
    assert!(is_ready_for_next_turn(events.last().unwrap()));

    match &events[end_at] {
        ServerMessage::LlmResponseEnd { text, .. } => assert_eq!(text, "Hi! How can I help?"),
        _ => unreachable!(),
    }

    assert_eq!(recognizer.frames(), 2);
    assert_eq!(generator.calls(), 1);
    assert_eq!(
        history(&harness),
        vec![
            Message::user("hello there"),
            Message::assistant("Hi! How can I help?")
        ]
    );
}

#[tokio::test]
async fn audio_for_a_fragment_never_precedes_its_chunk() {
    let recognizer = ScriptedRecognizer::new(vec![end_of_turn("tell me a story")]);
    let generator = ScriptedGenerator::new(&["Once ", "upon ", "a ", "time."]);
    let services = services()
        .with_recognizer(Arc::new(recognizer))
        .with_generator(Arc::new(generator))
        .with_synthesizer(Arc::new(EchoSynthesizer));
    let mut harness = Harness::start(services).await;

    start_recording(&mut harness).await;
    harness.send_audio(1).await;
    let events = harness.until(is_ready_for_next_turn).await;

    let mut audio_seen = 0;
    for (at, event) in events.iter().enumerate() {
        if let ServerMessage::StreamingAudio {
            index: Some(index),
            is_fallback,
            ..
        } = event
        {
            assert!(!is_fallback);
            let chunk_at = position(&events, |m| {
                matches!(m, ServerMessage::LlmChunk { index: i, .. } if i == index)
            });
            assert!(chunk_at < at, "audio {} emitted before its chunk", index);
            audio_seen += 1;
        }
    }
    assert_eq!(audio_seen, 4);
}

#[tokio::test]
async fn consecutive_turns_share_history() {
    let recognizer = ScriptedRecognizer::new(vec![end_of_turn("first"), end_of_turn("second")]);
    let generator = ScriptedGenerator::new(&["ok"]);
    let services = services()
        .with_recognizer(Arc::new(recognizer))
        .with_generator(Arc::new(generator.clone()))
        .with_synthesizer(Arc::new(EchoSynthesizer));
    let mut harness = Harness::start(services).await;

    start_recording(&mut harness).await;
    harness.send_audio(1).await;
    harness.until(is_ready_for_next_turn).await;
    harness.send_audio(1).await;
    harness.until(is_ready_for_next_turn).await;

    let roles: Vec<Role> = history(&harness).into_iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );

    // The second prompt saw the whole first turn
    let prompts = generator.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[1].len(), 3);
    assert_eq!(prompts[1][2], Message::user("second"));
}

// ============================================================================
// Degraded paths
// ============================================================================

#[tokio::test]
async fn generator_failure_sends_fallback() {
    let recognizer = ScriptedRecognizer::new(vec![end_of_turn("hello there")]);
    let services = services()
        .with_recognizer(Arc::new(recognizer))
        .with_generator(Arc::new(ScriptedGenerator::failing()))
        .with_synthesizer(Arc::new(EchoSynthesizer));
    let mut harness = Harness::start(services).await;

    start_recording(&mut harness).await;
    harness.send_audio(1).await;
    let events = harness.until(is_ready_for_next_turn).await;

    let start_at = position(&events, |m| matches!(m, ServerMessage::LlmResponseStart { .. }));
    let error_at = position(&events, |m| {
        matches!(m, ServerMessage::Error { kind: ErrorKind::CapabilityFailure, .. })
    });
    let fallback_at = position(&events, |m| {
        matches!(m, ServerMessage::StreamingAudio { is_fallback: true, .. })
    });
    assert!(start_at < error_at);
    assert!(error_at < fallback_at);
    assert_eq!(events[fallback_at].audio_bytes().unwrap(), FALLBACK_AUDIO);
    assert!(!events.iter().any(|m| matches!(m, ServerMessage::LlmChunk { .. })));

    match events.iter().find(|m| matches!(m, ServerMessage::LlmResponseEnd { .. })) {
        Some(ServerMessage::LlmResponseEnd { text, .. }) => assert_eq!(text, FALLBACK_MESSAGE),
        other => panic!("expected llm_response_end, got {:?}", other),
    }
    assert_eq!(
        history(&harness),
        vec![
            Message::user("hello there"),
            Message::assistant(FALLBACK_MESSAGE)
        ]
    );
}

#[tokio::test]
async fn generator_failure_mid_stream_replaces_partial_text() {
    let recognizer = ScriptedRecognizer::new(vec![end_of_turn("question")]);
    let generator = ScriptedGenerator::with_results(vec![
        Ok("Partial ".to_string()),
        Err(parley::capabilities::CapabilityError::Timeout),
    ]);
    let services = services()
        .with_recognizer(Arc::new(recognizer))
        .with_generator(Arc::new(generator))
        .with_synthesizer(Arc::new(EchoSynthesizer));
    let mut harness = Harness::start(services).await;

    start_recording(&mut harness).await;
    harness.send_audio(1).await;
    harness.until(is_ready_for_next_turn).await;

    let messages = history(&harness);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1], Message::assistant(FALLBACK_MESSAGE));
}

#[tokio::test]
async fn synthesizer_failure_keeps_generated_text() {
    let recognizer = ScriptedRecognizer::new(vec![end_of_turn("hello")]);
    let services = services()
        .with_recognizer(Arc::new(recognizer))
        .with_generator(Arc::new(ScriptedGenerator::new(&["Hello ", "back."])))
        .with_synthesizer(Arc::new(FailingSynthesizer));
    let mut harness = Harness::start(services).await;

    start_recording(&mut harness).await;
    harness.send_audio(1).await;
    let events = harness.until(is_ready_for_next_turn).await;

    let fallbacks: Vec<_> = events
        .iter()
        .filter(|m| matches!(m, ServerMessage::StreamingAudio { is_fallback: true, .. }))
        .collect();
    assert_eq!(fallbacks.len(), 1);
    assert!(events
        .iter()
        .any(|m| matches!(m, ServerMessage::Error { kind: ErrorKind::CapabilityFailure, .. })));
    assert_eq!(
        history(&harness),
        vec![Message::user("hello"), Message::assistant("Hello back.")]
    );
}

#[tokio::test]
async fn missing_recognizer_accepts_audio_silently() {
    let generator = ScriptedGenerator::new(&["unused"]);
    let services = services().with_generator(Arc::new(generator.clone()));
    let mut harness = Harness::start(services).await;
    harness.quiet_for(Duration::from_millis(50)).await;

    harness.send_text("start_recording").await;
    match harness.next().await {
        ServerMessage::Status { message } => {
            assert!(message.contains("Transcription unavailable"), "{}", message)
        }
        other => panic!("expected status, got {:?}", other),
    }

    harness.send_audio(5).await;
    let later = harness.quiet_for(Duration::from_millis(200)).await;
    assert!(later.is_empty(), "unexpected events: {:?}", kinds(&later));
    assert_eq!(generator.calls(), 0);
    assert!(!harness.task.is_finished());
}

#[tokio::test]
async fn recognizer_connect_failure_reports_and_stays_up() {
    let services = services().with_recognizer(Arc::new(FailingRecognizer));
    let mut harness = Harness::start(services).await;

    harness.send_text(r#"{"type":"start_recording"}"#).await;
    let events = harness
        .until(|m| {
            matches!(
                m,
                ServerMessage::ServiceStatus {
                    service: Service::Transcription,
                    connected: false,
                    ..
                }
            ) && !m.to_json().unwrap().contains("not configured")
        })
        .await;
    assert!(events
        .iter()
        .any(|m| matches!(m, ServerMessage::Error { kind: ErrorKind::CapabilityFailure, .. })));

    // Session survives and still answers control messages
    harness.send_text("bogus").await;
    assert!(matches!(
        harness.next().await,
        ServerMessage::Error {
            kind: ErrorKind::Validation,
            ..
        }
    ));
}

#[tokio::test]
async fn empty_turn_skips_generation() {
    let recognizer = ScriptedRecognizer::new(vec![end_of_turn("   ")]);
    let generator = ScriptedGenerator::new(&["never"]);
    let services = services()
        .with_recognizer(Arc::new(recognizer))
        .with_generator(Arc::new(generator.clone()))
        .with_synthesizer(Arc::new(EchoSynthesizer));
    let mut harness = Harness::start(services).await;

    start_recording(&mut harness).await;
    harness.send_audio(1).await;

    match harness.next().await {
        ServerMessage::TurnDetection { text, .. } => assert_eq!(text, ""),
        other => panic!("expected turn_detection, got {:?}", other),
    }
    let later = harness.quiet_for(Duration::from_millis(150)).await;
    assert!(!later
        .iter()
        .any(|m| matches!(m, ServerMessage::LlmResponseStart { .. })));
    assert_eq!(generator.calls(), 0);
    assert!(history(&harness).is_empty());
}

#[tokio::test]
async fn generate_tts_streams_audio_between_turns() {
    let services = services().with_synthesizer(Arc::new(EchoSynthesizer));
    let mut harness = Harness::start(services).await;
    harness.quiet_for(Duration::from_millis(50)).await;

    harness
        .send(Inbound::Control(ClientMessage::GenerateTts {
            text: "Read this aloud".to_string(),
        }))
        .await;
    let events = harness.until(is_ready_for_next_turn).await;

    let audio: Vec<u8> = events.iter().filter_map(|m| m.audio_bytes()).flatten().collect();
    assert_eq!(audio, b"Read this aloud");
    assert!(history(&harness).is_empty());
}

// ============================================================================
// Close
// ============================================================================

#[tokio::test]
async fn disconnect_releases_recognizer_and_registry_entry() {
    let recognizer = ScriptedRecognizer::new(vec![]);
    let services = services().with_recognizer(Arc::new(recognizer.clone()));
    let mut harness = Harness::start(services).await;
    let session_id = harness.session_id.clone();

    start_recording(&mut harness).await;
    harness.send_audio(1).await;

    let services = harness.disconnect().await;
    assert!(services.registry.lookup(&session_id).is_none());
    assert!(services.registry.is_empty());

    // The driver sees its audio queue close
    tokio::time::timeout(WAIT, async {
        while !recognizer.is_released() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("recognizer feed was not released");
}

#[tokio::test]
async fn disconnect_mid_response_cancels_pipeline() {
    let recognizer = ScriptedRecognizer::new(vec![end_of_turn("are you there")]);
    let services = services()
        .with_recognizer(Arc::new(recognizer))
        .with_generator(Arc::new(StalledGenerator))
        .with_synthesizer(Arc::new(EchoSynthesizer));
    let mut harness = Harness::start(services).await;

    start_recording(&mut harness).await;
    harness.send_audio(1).await;
    harness
        .until(|m| matches!(m, ServerMessage::LlmResponseStart { .. }))
        .await;

    let conversation_id = harness.conversation_id.clone();
    let services = harness.disconnect().await;
    assert!(services.registry.is_empty());

    // Only the user message; the cancelled reply never lands
    assert_eq!(
        services.history.snapshot(&conversation_id),
        vec![Message::user("are you there")]
    );
}

#[tokio::test]
async fn close_is_idempotent() {
    let services = Arc::new(services());
    let (out_tx, mut out_rx) = mpsc::channel(64);
    let mut session = SessionOrchestrator::accept(Arc::clone(&services), out_tx, None).await;
    let handle = session.handle();
    assert_eq!(services.registry.len(), 1);

    session.close("first").await;
    assert_eq!(session.state(), &State::Closed);
    assert!(services.registry.is_empty());
    assert!(handle.is_closed());

    while out_rx.try_recv().is_ok() {}
    session.close("second").await;
    assert_eq!(session.state(), &State::Closed);
    assert!(out_rx.try_recv().is_err());

    let summary = parley::metrics::summary(&services.metrics).unwrap();
    assert_eq!(summary.sessions_opened, 1);
    assert_eq!(summary.active_sessions, 0);
}

#[tokio::test]
async fn registry_close_all_ends_sessions() {
    let services = Arc::new(services());
    let a = Harness::resume(Arc::clone(&services), None).await;
    let b = Harness::resume(Arc::clone(&services), None).await;
    assert_eq!(services.registry.len(), 2);

    services.shutdown().await;
    assert!(services.registry.is_empty());

    for harness in [a, b] {
        tokio::time::timeout(WAIT, harness.task)
            .await
            .expect("session did not stop")
            .unwrap();
    }
}

#[tokio::test]
async fn resuming_a_conversation_reuses_its_history() {
    let services = Arc::new(services().with_generator(Arc::new(ScriptedGenerator::new(&["x"]))));
    let conversation = uuid::Uuid::new_v4().to_string();
    services
        .history
        .append(&conversation, Message::user("earlier question"));

    let harness = Harness::resume(Arc::clone(&services), Some(conversation.clone())).await;
    assert_eq!(harness.conversation_id, conversation);
    assert_eq!(history(&harness).len(), 1);

    let other = Harness::resume(Arc::clone(&services), Some("not-a-uuid".to_string())).await;
    assert_eq!(other.conversation_id, other.session_id);
}

// ============================================================================
// Audio during a response
// ============================================================================

#[tokio::test]
async fn audio_during_response_is_held_until_next_turn() {
    let recognizer = ScriptedRecognizer::new(vec![end_of_turn("question")]);
    let generator = GatedGenerator::default();
    let services = services()
        .with_recognizer(Arc::new(recognizer.clone()))
        .with_generator(Arc::new(generator.clone()))
        .with_synthesizer(Arc::new(EchoSynthesizer));
    let mut harness = Harness::start(services).await;

    start_recording(&mut harness).await;
    harness.send_audio(1).await;
    harness
        .until(|m| matches!(m, ServerMessage::LlmResponseStart { .. }))
        .await;

    harness.send_audio(4).await;
    harness.quiet_for(Duration::from_millis(100)).await;
    assert_eq!(recognizer.frames(), 1);

    generator.release();
    let events = harness.until(is_ready_for_next_turn).await;
    match events.iter().find(|m| matches!(m, ServerMessage::LlmResponseEnd { .. })) {
        Some(ServerMessage::LlmResponseEnd { text, .. }) => assert_eq!(text, "Let me think. Done."),
        other => panic!("expected llm_response_end, got {:?}", other),
    }

    let frames = recognizer.clone();
    eventually(move || frames.frames() == 5).await;
}

#[tokio::test]
async fn held_audio_keeps_only_the_newest_frames() {
    let settings = AppSettings {
        max_buffered_frames: 2,
        ..AppSettings::default()
    };
    let recognizer = ScriptedRecognizer::new(vec![end_of_turn("question")]);
    let generator = GatedGenerator::default();
    let services = services_with(settings)
        .with_recognizer(Arc::new(recognizer.clone()))
        .with_generator(Arc::new(generator.clone()))
        .with_synthesizer(Arc::new(EchoSynthesizer));
    let mut harness = Harness::start(services).await;

    start_recording(&mut harness).await;
    harness.send_audio(1).await;
    harness
        .until(|m| matches!(m, ServerMessage::LlmResponseStart { .. }))
        .await;

    harness.send_audio(5).await;
    harness.quiet_for(Duration::from_millis(100)).await;
    generator.release();
    harness.until(is_ready_for_next_turn).await;

    let frames = recognizer.clone();
    eventually(move || frames.frames() == 3).await;
    harness.quiet_for(Duration::from_millis(100)).await;
    assert_eq!(recognizer.frames(), 3);
}

// ============================================================================
// Capability timeouts
// ============================================================================

fn short_timeouts() -> AppSettings {
    AppSettings {
        capability_timeout_ms: 100,
        ..AppSettings::default()
    }
}

#[tokio::test]
async fn silent_generator_times_out_to_fallback() {
    let recognizer = ScriptedRecognizer::new(vec![end_of_turn("hello there")]);
    let services = services_with(short_timeouts())
        .with_recognizer(Arc::new(recognizer))
        .with_generator(Arc::new(StalledGenerator))
        .with_synthesizer(Arc::new(EchoSynthesizer));
    let mut harness = Harness::start(services).await;

    start_recording(&mut harness).await;
    harness.send_audio(1).await;
    let events = harness.until(is_ready_for_next_turn).await;

    let error_at = position(&events, |m| {
        matches!(
            m,
            ServerMessage::Error { kind: ErrorKind::CapabilityFailure, message }
                if message.contains("timed out")
        )
    });
    let fallback_at = position(&events, |m| {
        matches!(m, ServerMessage::StreamingAudio { is_fallback: true, .. })
    });
    assert!(error_at < fallback_at);
    assert_eq!(events[fallback_at].audio_bytes().unwrap(), FALLBACK_AUDIO);

    match events.iter().find(|m| matches!(m, ServerMessage::LlmResponseEnd { .. })) {
        Some(ServerMessage::LlmResponseEnd { text, .. }) => assert_eq!(text, FALLBACK_MESSAGE),
        other => panic!("expected llm_response_end, got {:?}", other),
    }
    assert_eq!(
        history(&harness),
        vec![
            Message::user("hello there"),
            Message::assistant(FALLBACK_MESSAGE)
        ]
    );
}

#[tokio::test]
async fn silent_synthesizer_times_out_once_and_keeps_text() {
    let recognizer = ScriptedRecognizer::new(vec![end_of_turn("hello")]);
    let services = services_with(short_timeouts())
        .with_recognizer(Arc::new(recognizer))
        .with_generator(Arc::new(ScriptedGenerator::new(&["Hello"])))
        .with_synthesizer(Arc::new(StalledSynthesizer));
    let mut harness = Harness::start(services).await;

    start_recording(&mut harness).await;
    harness.send_audio(1).await;
    let events = harness.until(is_ready_for_next_turn).await;

    let errors: Vec<_> = events
        .iter()
        .filter(|m| matches!(m, ServerMessage::Error { kind: ErrorKind::CapabilityFailure, .. }))
        .collect();
    assert_eq!(errors.len(), 1);
    let fallbacks: Vec<_> = events
        .iter()
        .filter(|m| matches!(m, ServerMessage::StreamingAudio { is_fallback: true, .. }))
        .collect();
    assert_eq!(fallbacks.len(), 1);
    assert_eq!(fallbacks[0].audio_bytes().unwrap(), FALLBACK_AUDIO);
    assert!(!events
        .iter()
        .any(|m| matches!(m, ServerMessage::StreamingAudio { is_fallback: false, .. })));
    assert_eq!(
        history(&harness),
        vec![Message::user("hello"), Message::assistant("Hello")]
    );
}
