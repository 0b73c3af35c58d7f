//! Substitute message and audio used when a pipeline stage fails
//!
//! The audio asset is resolved from a prioritized candidate list on first
//! use and cached for the life of the process.

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::capabilities::Service;
use crate::settings::DEFAULT_FALLBACK_MESSAGE;

/// Where fallback audio comes from
pub trait FallbackAssetSource: Send + Sync + 'static {
    fn resolve(&self) -> Option<Vec<u8>>;
}

/// First readable, non-empty file from a list of paths
#[derive(Debug, Clone)]
pub struct FileCandidates {
    paths: Vec<PathBuf>,
}

impl FileCandidates {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl FallbackAssetSource for FileCandidates {
    fn resolve(&self) -> Option<Vec<u8>> {
        for path in &self.paths {
            match std::fs::read(path) {
                Ok(bytes) if !bytes.is_empty() => {
                    log::info!("Fallback audio: using {:?} ({} bytes)", path, bytes.len());
                    return Some(bytes);
                }
                Ok(_) => log::debug!("Fallback audio: {:?} is empty, skipping", path),
                Err(e) => log::debug!("Fallback audio: {:?} unreadable: {}", path, e),
            }
        }
        None
    }
}

/// In-memory asset
#[derive(Debug, Clone)]
pub struct StaticAsset(pub Vec<u8>);

impl FallbackAssetSource for StaticAsset {
    fn resolve(&self) -> Option<Vec<u8>> {
        (!self.0.is_empty()).then(|| self.0.clone())
    }
}

/// No fallback audio could be found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackUnavailable;

impl std::fmt::Display for FallbackUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "No fallback audio available")
    }
}

impl std::error::Error for FallbackUnavailable {}

/// What failed, for logging
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub service: Service,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Fallback {
    pub message: String,
    pub audio: Result<Arc<[u8]>, FallbackUnavailable>,
}

pub struct FallbackPolicy {
    message: String,
    source: Box<dyn FallbackAssetSource>,
    asset: OnceCell<Arc<[u8]>>,
}

impl FallbackPolicy {
    pub fn new(message: impl Into<String>, source: impl FallbackAssetSource) -> Self {
        Self {
            message: message.into(),
            source: Box::new(source),
            asset: OnceCell::new(),
        }
    }

    pub fn from_candidates(message: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Self::new(message, FileCandidates::new(paths))
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Fallback audio. A miss is not cached, so an asset added later is picked up.
    pub fn audio(&self) -> Result<Arc<[u8]>, FallbackUnavailable> {
        self.asset
            .get_or_try_init(|| {
                self.source
                    .resolve()
                    .map(Arc::<[u8]>::from)
                    .ok_or(FallbackUnavailable)
            })
            .cloned()
    }

    pub fn fallback_for(&self, context: FailureContext) -> Fallback {
        log::warn!(
            "Using fallback after {} failure: {}",
            context.service.label(),
            context.reason
        );
        Fallback {
            message: self.message.clone(),
            audio: self.audio(),
        }
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::from_candidates(
            DEFAULT_FALLBACK_MESSAGE,
            vec![
                PathBuf::from("static/audio/fallback.mp3"),
                PathBuf::from("sample_voice.mp3"),
            ],
        )
    }
}
