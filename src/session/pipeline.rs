//! Response pipeline for one turn
//!
//! The generator side runs in the pipeline task; synthesis runs in a child
//! task fed through a channel. Each `llm_chunk` is queued on the ordered
//! outbound channel before its fragment is handed to the synthesizer, so
//! audio for fragment N can never precede chunk N.
//!
//! Failure policy:
//! - generator failure: `error`, fallback audio, `llm_response_end` with the
//!   fallback message, which becomes the assistant message
//! - synthesizer failure: `error`, fallback audio once; the generated text is
//!   kept and the turn completes normally

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::capabilities::{
    next_within, CapabilityError, ResponseGenerator, Service, SpeechSynthesizer, SynthesizerFeed,
};
use crate::error::SessionError;
use crate::fallback::{FailureContext, FallbackPolicy};
use crate::history::Message;
use crate::metrics::{self, SharedMetrics, TurnOutcome};
use crate::protocol::ServerMessage;
use crate::services::Services;

/// Fragments queued between the generator and synthesizer sides
const SYNTH_QUEUE: usize = 32;

/// Reported back to the session loop
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    SynthesisStarted {
        turn_id: Uuid,
    },
    Finished {
        turn_id: Uuid,
        assistant_text: Option<String>,
    },
}

/// The outbound queue is gone; the session is closing
#[derive(Debug)]
struct Disconnected;

/// Everything a pipeline run needs, cloned out of the session
#[derive(Clone)]
pub struct PipelineContext {
    pub turn_id: Uuid,
    pub generator: Option<Arc<dyn ResponseGenerator>>,
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    pub voice_id: String,
    pub fallback: Arc<FallbackPolicy>,
    pub metrics: SharedMetrics,
    pub outbound: mpsc::Sender<ServerMessage>,
    pub events: mpsc::Sender<PipelineEvent>,
    pub step_timeout: Duration,
    pub max_response_chars: usize,
}

impl PipelineContext {
    async fn emit(&self, msg: ServerMessage) -> Result<(), Disconnected> {
        self.outbound.send(msg).await.map_err(|_| Disconnected)
    }

    async fn report(&self, event: PipelineEvent) {
        if self.events.send(event).await.is_err() {
            log::debug!("Pipeline {}: session loop is gone", self.turn_id);
        }
    }
}

/// Aborts the wrapped task when dropped, so cancelling a pipeline also
/// cancels its synthesis child
pub struct TaskGuard<T> {
    handle: Option<JoinHandle<T>>,
}

impl<T> TaskGuard<T> {
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Wait for the task; `None` if it panicked or was aborted
    pub async fn join(mut self) -> Option<T> {
        let handle = self.handle.take()?;
        handle.await.ok()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Start streaming a reply for `history`
pub fn spawn_response(ctx: PipelineContext, history: Vec<Message>) -> TaskGuard<()> {
    TaskGuard::new(tokio::spawn(async move {
        let turn_id = ctx.turn_id;
        if stream_response(ctx, history).await.is_err() {
            log::debug!("Pipeline {}: client disconnected mid-response", turn_id);
        }
    }))
}

/// Start a one-shot synthesis of client-supplied text
pub fn spawn_speech(ctx: PipelineContext, text: String) -> TaskGuard<()> {
    TaskGuard::new(tokio::spawn(async move {
        let turn_id = ctx.turn_id;
        if speak_text(ctx, text).await.is_err() {
            log::debug!("Speech {}: client disconnected", turn_id);
        }
    }))
}

struct SynthJob {
    index: usize,
    text: String,
    is_final: bool,
}

async fn stream_response(ctx: PipelineContext, history: Vec<Message>) -> Result<(), Disconnected> {
    let turn_id = ctx.turn_id;
    metrics::record(&ctx.metrics, |m| m.response_started(turn_id));
    log::info!(
        "Turn {}: generating response ({} messages of history)",
        turn_id,
        history.len()
    );

    ctx.emit(ServerMessage::LlmResponseStart { turn_id }).await?;

    let Some(generator) = ctx.generator.clone() else {
        let reason = Services::missing_reason(Service::Generation);
        let err = CapabilityError::Unavailable(reason.to_string());
        return generation_failed(&ctx, err).await;
    };

    let (synth_tx, synth_rx) = mpsc::channel::<SynthJob>(SYNTH_QUEUE);
    let synth = TaskGuard::new(tokio::spawn(synthesize_jobs(ctx.clone(), synth_rx)));

    let mut fragments = generator.generate(history);
    let mut text = String::new();
    let mut chars = 0usize;
    let mut index = 0usize;

    loop {
        let fragment = match next_within(&mut fragments, ctx.step_timeout).await {
            Ok(Some(fragment)) => fragment,
            Ok(None) => break,
            Err(e) => {
                // Stop live audio before the fallback is played
                drop(synth_tx);
                drop(synth);
                return generation_failed(&ctx, e).await;
            }
        };
        if fragment.is_empty() {
            continue;
        }

        let remaining = ctx.max_response_chars.saturating_sub(chars);
        let fragment_chars = fragment.chars().count();
        let (fragment, capped) = if fragment_chars > remaining {
            (fragment.chars().take(remaining).collect::<String>(), true)
        } else {
            (fragment, false)
        };

        if !fragment.is_empty() {
            if index == 0 {
                metrics::record(&ctx.metrics, |m| m.first_fragment(turn_id));
                ctx.report(PipelineEvent::SynthesisStarted { turn_id }).await;
            }

            ctx.emit(ServerMessage::LlmChunk {
                turn_id,
                index,
                text: fragment.clone(),
            })
            .await?;

            chars += fragment.chars().count();
            text.push_str(&fragment);
            if synth_tx
                .send(SynthJob {
                    index,
                    text: fragment,
                    is_final: false,
                })
                .await
                .is_err()
            {
                log::debug!("Turn {}: synthesizer side already stopped", turn_id);
            }
            index += 1;
        }

        if capped {
            log::info!(
                "Turn {}: response reached {} chars, truncating",
                turn_id,
                ctx.max_response_chars
            );
            break;
        }
    }
    drop(fragments);

    if text.trim().is_empty() {
        drop(synth_tx);
        drop(synth);
        let err = CapabilityError::Failed("empty response".to_string());
        return generation_failed(&ctx, err).await;
    }

    ctx.emit(ServerMessage::LlmResponseEnd {
        turn_id,
        text: text.clone(),
    })
    .await?;

    // Final flag, then let the synthesizer drain
    let _ = synth_tx
        .send(SynthJob {
            index,
            text: String::new(),
            is_final: true,
        })
        .await;
    drop(synth_tx);
    synth.join().await;

    log::info!("Turn {}: response complete ({} fragments)", turn_id, index);
    metrics::record(&ctx.metrics, |m| {
        m.response_finished(turn_id, text.chars().count(), TurnOutcome::Completed)
    });
    ctx.report(PipelineEvent::Finished {
        turn_id,
        assistant_text: Some(text),
    })
    .await;
    Ok(())
}

/// Generator failed or timed out: report, play fallback, record the
/// fallback message as the assistant reply
async fn generation_failed(ctx: &PipelineContext, err: CapabilityError) -> Result<(), Disconnected> {
    let turn_id = ctx.turn_id;
    let session_err = SessionError::from_capability(Service::Generation, err);
    log::warn!("Turn {}: {}", turn_id, session_err);
    metrics::record(&ctx.metrics, |m| {
        m.record_error(session_err.kind().as_str(), session_err.to_string(), None)
    });

    ctx.emit(ServerMessage::error(&session_err)).await?;

    let fallback = ctx.fallback.fallback_for(FailureContext {
        service: Service::Generation,
        reason: session_err.to_string(),
    });
    emit_fallback_audio(ctx, fallback.audio).await?;

    ctx.emit(ServerMessage::LlmResponseEnd {
        turn_id,
        text: fallback.message.clone(),
    })
    .await?;

    metrics::record(&ctx.metrics, |m| {
        m.response_finished(turn_id, fallback.message.chars().count(), TurnOutcome::Fallback)
    });
    ctx.report(PipelineEvent::Finished {
        turn_id,
        assistant_text: Some(fallback.message),
    })
    .await;
    Ok(())
}

async fn emit_fallback_audio(
    ctx: &PipelineContext,
    audio: Result<Arc<[u8]>, crate::fallback::FallbackUnavailable>,
) -> Result<(), Disconnected> {
    match audio {
        Ok(bytes) => {
            ctx.emit(ServerMessage::audio(Some(ctx.turn_id), None, &bytes, true))
                .await
        }
        Err(e) => {
            let err = SessionError::CapabilityUnavailable {
                service: Service::Synthesis,
                reason: e.to_string(),
            };
            ctx.emit(ServerMessage::error(&err)).await
        }
    }
}

/// Synthesizer side: open the feed on first use, stream audio per job
///
/// After a failure the fallback is played once and remaining jobs are
/// drained without synthesis, so the generator side never blocks.
async fn synthesize_jobs(ctx: PipelineContext, mut jobs: mpsc::Receiver<SynthJob>) {
    let mut feed: Option<Box<dyn SynthesizerFeed>> = None;
    let mut failed = false;
    let mut audio_count = 0usize;

    while let Some(job) = jobs.recv().await {
        if failed {
            continue;
        }

        if feed.is_none() {
            match open_feed(&ctx).await {
                Ok(f) => feed = Some(f),
                Err(e) => {
                    failed = true;
                    if synthesis_failed(&ctx, e).await.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }
        let Some(active) = feed.as_mut() else { continue };

        let mut audio = active.synthesize(job.text, job.is_final);
        loop {
            match next_within(&mut audio, ctx.step_timeout).await {
                Ok(Some(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    audio_count += 1;
                    let msg = ServerMessage::audio(Some(ctx.turn_id), Some(job.index), &bytes, false);
                    if ctx.emit(msg).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    failed = true;
                    if synthesis_failed(&ctx, e).await.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }

    if let Some(mut f) = feed {
        f.clear();
    }
    log::debug!(
        "Turn {}: synthesis finished ({} audio chunks, failed={})",
        ctx.turn_id,
        audio_count,
        failed
    );
}

async fn open_feed(ctx: &PipelineContext) -> Result<Box<dyn SynthesizerFeed>, CapabilityError> {
    let synthesizer = ctx
        .synthesizer
        .clone()
        .ok_or_else(|| {
            CapabilityError::Unavailable(Services::missing_reason(Service::Synthesis).to_string())
        })?;
    tokio::time::timeout(ctx.step_timeout, synthesizer.begin(&ctx.voice_id))
        .await
        .map_err(|_| CapabilityError::Timeout)?
}

async fn synthesis_failed(ctx: &PipelineContext, err: CapabilityError) -> Result<(), Disconnected> {
    let session_err = SessionError::from_capability(Service::Synthesis, err);
    log::warn!("Turn {}: {}", ctx.turn_id, session_err);
    metrics::record(&ctx.metrics, |m| {
        m.record_error(session_err.kind().as_str(), session_err.to_string(), None)
    });

    ctx.emit(ServerMessage::error(&session_err)).await?;
    let fallback = ctx.fallback.fallback_for(FailureContext {
        service: Service::Synthesis,
        reason: session_err.to_string(),
    });
    emit_fallback_audio(ctx, fallback.audio).await
}

async fn speak_text(ctx: PipelineContext, text: String) -> Result<(), Disconnected> {
    let turn_id = ctx.turn_id;
    log::info!("Speech {}: synthesizing {} chars", turn_id, text.len());

    let (tx, rx) = mpsc::channel(1);
    let synth = TaskGuard::new(tokio::spawn(synthesize_jobs(ctx.clone(), rx)));
    let _ = tx
        .send(SynthJob {
            index: 0,
            text,
            is_final: true,
        })
        .await;
    drop(tx);
    synth.join().await;

    ctx.report(PipelineEvent::Finished {
        turn_id,
        assistant_text: None,
    })
    .await;
    Ok(())
}
