//! Murf streaming text-to-speech
//!
//! Each fragment is one `POST /v1/speech/stream` whose body is streamed back
//! as encoded audio chunks.

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

use super::{AudioStream, CapabilityError, SpeechSynthesizer, SynthesizerFeed};

const STREAM_URL: &str = "https://api.murf.ai/v1/speech/stream";

/// Voice used when a preset name is unknown
pub const DEFAULT_VOICE_ID: &str = "en-US-natalie";

/// Named voice presets
const VOICE_PRESETS: &[(&str, &str)] = &[
    ("default", DEFAULT_VOICE_ID),
    ("narrator", "en-US-terrell"),
    ("support", "en-US-miles"),
    ("sergeant", "en-US-ken"),
    ("game", "en-US-paul"),
];

/// Resolve a preset name (case-insensitive) to a Murf voice id
pub fn voice_id_for(preset: &str) -> &'static str {
    let preset = preset.to_lowercase();
    VOICE_PRESETS
        .iter()
        .find(|(name, _)| *name == preset)
        .map(|(_, id)| *id)
        .unwrap_or(DEFAULT_VOICE_ID)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamRequest<'a> {
    text: &'a str,
    voice_id: &'a str,
    format: &'a str,
}

/// Speech synthesizer backed by Murf
#[derive(Debug, Clone)]
pub struct MurfSynthesizer {
    client: Client,
    api_key: String,
}

impl MurfSynthesizer {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
        }
    }
}

impl SpeechSynthesizer for MurfSynthesizer {
    fn begin(
        &self,
        voice_id: &str,
    ) -> BoxFuture<'static, Result<Box<dyn SynthesizerFeed>, CapabilityError>> {
        let feed = MurfFeed {
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            voice_id: voice_id.to_string(),
            context_id: Uuid::new_v4(),
        };
        log::debug!("Murf feed ready (voice={}, context={})", feed.voice_id, feed.context_id);
        Box::pin(async move { Ok(Box::new(feed) as Box<dyn SynthesizerFeed>) })
    }
}

/// Per-response Murf feed
struct MurfFeed {
    client: Client,
    api_key: String,
    voice_id: String,
    context_id: Uuid,
}

impl SynthesizerFeed for MurfFeed {
    fn synthesize(&mut self, text: String, is_final: bool) -> AudioStream {
        if text.trim().is_empty() {
            return stream::empty().boxed();
        }

        log::debug!(
            "Murf synthesize ({} chars, final={}, context={})",
            text.len(),
            is_final,
            self.context_id
        );

        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let voice_id = self.voice_id.clone();

        stream::once(async move {
            let body = StreamRequest {
                text: &text,
                voice_id: &voice_id,
                format: "MP3",
            };
            let response = client
                .post(STREAM_URL)
                .header("api-key", api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| CapabilityError::Failed(format!("Network error: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                return Err(CapabilityError::Failed(format!(
                    "Murf API error ({}): {}",
                    status.as_u16(),
                    error_text
                )));
            }

            Ok(response
                .bytes_stream()
                .map_ok(|bytes| bytes.to_vec())
                .map_err(|e| CapabilityError::Failed(format!("Stream error: {}", e))))
        })
        .try_flatten()
        .try_filter(|chunk| futures_util::future::ready(!chunk.is_empty()))
        .boxed()
    }

    fn clear(&mut self) {
        self.context_id = Uuid::new_v4();
        log::debug!("Murf context rotated: {}", self.context_id);
    }
}

/// Get the Murf API key from environment
pub fn get_api_key() -> Option<String> {
    std::env::var("MURF_API_KEY").ok().filter(|k| !k.is_empty())
}
