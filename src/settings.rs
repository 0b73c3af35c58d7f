use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capabilities::murf::voice_id_for;
use crate::capabilities::RecognizerConfig;

const SETTINGS_FILE_NAME: &str = "settings.json";

/// Environment variable overriding the settings file location
pub const SETTINGS_PATH_ENV: &str = "PARLEY_SETTINGS";

pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "I'm having trouble connecting right now. Please try again in a moment.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Address the WebSocket server listens on.
    pub bind_addr: String,

    /// Voice preset name (`default`, `narrator`, `support`, `sergeant`, `game`).
    pub voice: String,

    /// Sample rate of the PCM16 frames clients send.
    pub sample_rate: u32,

    /// Gemini model used for replies.
    pub gemini_model: String,

    /// Conversation history file. Defaults to the user data dir.
    pub history_path: Option<PathBuf>,

    /// Fallback audio files, in priority order. The first readable, non-empty one wins.
    pub fallback_candidates: Vec<PathBuf>,

    /// Assistant message used when reply generation fails.
    pub fallback_message: String,

    /// Ceiling for each generator/synthesizer step.
    pub capability_timeout_ms: u64,

    /// Ceiling for opening the recognizer connection.
    pub recognizer_connect_timeout_ms: u64,

    /// Frames queued towards the recognizer before new ones are dropped.
    pub recognizer_audio_queue: usize,

    /// Frames kept while a response is in flight (oldest evicted first).
    pub max_buffered_frames: usize,

    /// Frames shorter than this are rejected as noise.
    pub min_frame_bytes: usize,

    /// Frames larger than this are rejected as malformed.
    pub max_frame_bytes: usize,

    /// Assistant replies are cut at this many characters.
    pub max_response_chars: usize,

    /// Outbound events queued per session before sends wait.
    pub outbound_queue: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            voice: "default".to_string(),
            sample_rate: 16000,
            gemini_model: crate::capabilities::gemini::DEFAULT_MODEL.to_string(),
            history_path: None,
            fallback_candidates: vec![
                PathBuf::from("static/audio/fallback.mp3"),
                PathBuf::from("sample_voice.mp3"),
            ],
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            capability_timeout_ms: 30_000,
            recognizer_connect_timeout_ms: 10_000,
            recognizer_audio_queue: 64,
            max_buffered_frames: 50,
            min_frame_bytes: 2,
            max_frame_bytes: 1 << 20,
            max_response_chars: 3000,
            outbound_queue: 256,
        }
    }
}

impl AppSettings {
    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }

    pub fn recognizer_config(&self) -> RecognizerConfig {
        RecognizerConfig {
            sample_rate: self.sample_rate,
            connect_timeout: Duration::from_millis(self.recognizer_connect_timeout_ms),
            audio_queue: self.recognizer_audio_queue.max(1),
        }
    }

    /// Murf voice id for the configured preset
    pub fn voice_id(&self) -> &'static str {
        voice_id_for(&self.voice)
    }

    /// History file, falling back to `<data dir>/parley/chat_history.json`
    pub fn history_file(&self) -> PathBuf {
        self.history_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("parley")
                .join("chat_history.json")
        })
    }
}

/// Settings file location: `$PARLEY_SETTINGS`, else `./settings.json`
pub fn settings_path() -> PathBuf {
    std::env::var_os(SETTINGS_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), String> {
    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;
    write_atomic(path, &contents)
}

/// Write `contents` to `path` via a temp file in the same directory and a rename,
/// so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create directory {:?}: {}", parent, e))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    std::fs::write(&tmp_path, contents)
        .map_err(|e| format!("Write temp file {:?}: {}", tmp_path, e))?;

    // On Windows, rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp file {:?} to {:?}: {}", tmp_path, path, e))
}
