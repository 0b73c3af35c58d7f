//! Gemini response generator (streaming)
//!
//! Calls `streamGenerateContent?alt=sse` and yields each text part as a
//! fragment. History roles map to Gemini's `user`/`model`.

use futures_util::TryStreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{receiver_stream, CapabilityError, FragmentStream, ResponseGenerator};
use crate::history::{Message, Role};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Header carrying the API key; keeps the secret out of URLs and error text
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Default model
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Fragments buffered between the HTTP reader and the pipeline
const FRAGMENT_QUEUE: usize = 100;

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

/// One SSE `data:` payload
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

/// Map conversation history to Gemini request contents
fn to_contents(history: &[Message]) -> Vec<Content> {
    history
        .iter()
        .map(|m| Content {
            role: Some(
                match m.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                }
                .to_string(),
            ),
            parts: vec![Part {
                text: Some(m.content.clone()),
            }],
        })
        .collect()
}

/// Concatenate the text parts of the first candidate
fn chunk_text(data: &str) -> Result<String, serde_json::Error> {
    let chunk: StreamChunk = serde_json::from_str(data)?;
    Ok(chunk
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default())
}

/// Splits a byte stream into SSE `data:` payloads
///
/// Bytes are buffered until a full line arrives, so a UTF-8 sequence split
/// across network chunks is decoded intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes, returning every complete `data:` payload
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

/// Response generator backed by the Gemini API
#[derive(Debug, Clone)]
pub struct GeminiGenerator {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiGenerator {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: API_BASE.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Point at a different endpoint (proxies, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl ResponseGenerator for GeminiGenerator {
    fn generate(&self, history: Vec<Message>) -> FragmentStream {
        let (tx, rx) = mpsc::channel(FRAGMENT_QUEUE);
        let client = self.client.clone();
        let url = format!("{}/{}:streamGenerateContent?alt=sse", self.base_url, self.model);
        let api_key = self.api_key.clone();
        let model = self.model.clone();

        tokio::spawn(async move {
            if let Err(e) = stream_reply(&client, &url, &api_key, &history, &tx).await {
                log::warn!("Gemini ({}) stream failed: {}", model, e);
                let _ = tx.send(Err(e)).await;
            }
        });

        receiver_stream(rx)
    }
}

async fn stream_reply(
    client: &Client,
    url: &str,
    api_key: &str,
    history: &[Message],
    tx: &mpsc::Sender<Result<String, CapabilityError>>,
) -> Result<(), CapabilityError> {
    let body = GenerateRequest {
        contents: to_contents(history),
    };

    let response = client
        .post(url)
        .header(API_KEY_HEADER, api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| CapabilityError::Failed(format!("Network error: {}", e.without_url())))?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        return Err(CapabilityError::Failed(format!(
            "Gemini API error ({}): {}",
            status.as_u16(),
            error_text
        )));
    }

    log::debug!("Gemini SSE stream established");

    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();
    let mut fragments = 0usize;

    while let Some(bytes) = stream
        .try_next()
        .await
        .map_err(|e| CapabilityError::Failed(format!("Stream error: {}", e.without_url())))?
    {
        for data in decoder.push(&bytes) {
            let text = chunk_text(&data).map_err(|e| {
                CapabilityError::Failed(format!("Failed to parse API response: {}", e))
            })?;
            if text.is_empty() {
                continue;
            }
            fragments += 1;
            if tx.send(Ok(text)).await.is_err() {
                // Receiver dropped (turn cancelled)
                return Ok(());
            }
        }
    }

    log::debug!("Gemini stream completed with {} fragments", fragments);
    Ok(())
}

/// Get the Gemini API key from environment
pub fn get_api_key() -> Option<String> {
    std::env::var("GEMINI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}
