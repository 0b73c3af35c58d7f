//! Process-scoped collaborators, built once at startup and shared by every
//! session.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::capabilities::assemblyai::AssemblyAiRecognizer;
use crate::capabilities::gemini::{self, GeminiGenerator};
use crate::capabilities::murf::{self, MurfSynthesizer};
use crate::capabilities::{Recognizer, ResponseGenerator, Service, SpeechSynthesizer};
use crate::fallback::FallbackPolicy;
use crate::history::{ConversationHistoryStore, JsonFileHistory};
use crate::metrics::{self, SharedMetrics};
use crate::session::SessionRegistry;
use crate::settings::AppSettings;

/// Overall ceiling for adapter HTTP requests (streams included)
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

pub struct Services {
    pub settings: Arc<AppSettings>,
    pub recognizer: Option<Arc<dyn Recognizer>>,
    pub generator: Option<Arc<dyn ResponseGenerator>>,
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    pub history: Arc<ConversationHistoryStore>,
    pub fallback: Arc<FallbackPolicy>,
    pub registry: Arc<SessionRegistry>,
    pub metrics: SharedMetrics,
}

impl Services {
    /// No capabilities, in-memory history. Add capabilities with the `with_*` methods.
    pub fn new(settings: AppSettings, history: ConversationHistoryStore) -> Self {
        let fallback = FallbackPolicy::from_candidates(
            settings.fallback_message.clone(),
            settings.fallback_candidates.clone(),
        );
        Self {
            settings: Arc::new(settings),
            recognizer: None,
            generator: None,
            synthesizer: None,
            history: Arc::new(history),
            fallback: Arc::new(fallback),
            registry: Arc::new(SessionRegistry::new()),
            metrics: metrics::shared(),
        }
    }

    /// Build the production stack: vendor adapters for every configured API
    /// key, one shared HTTP client, JSON-file history.
    pub async fn from_settings(settings: AppSettings) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

        let history_path = settings.history_file();
        log::info!("Chat history file: {:?}", history_path);
        let persistence = Arc::new(JsonFileHistory::open(history_path));
        let history = ConversationHistoryStore::load(persistence).await;

        let gemini_model = settings.gemini_model.clone();
        let mut services = Self::new(settings, history);

        if let Some(recognizer) = AssemblyAiRecognizer::from_env() {
            services = services.with_recognizer(Arc::new(recognizer));
        }
        if let Some(key) = gemini::get_api_key() {
            services = services.with_generator(Arc::new(
                GeminiGenerator::new(client.clone(), key).with_model(gemini_model),
            ));
        }
        if let Some(key) = murf::get_api_key() {
            services = services.with_synthesizer(Arc::new(MurfSynthesizer::new(client, key)));
        }

        for service in [Service::Transcription, Service::Generation, Service::Synthesis] {
            log::info!(
                "{}: {}",
                service.label(),
                if services.is_configured(service) {
                    "configured"
                } else {
                    "not configured"
                }
            );
        }

        Ok(services)
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn Recognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn ResponseGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = Arc::new(fallback);
        self
    }

    pub fn is_configured(&self, service: Service) -> bool {
        match service {
            Service::Transcription => self.recognizer.is_some(),
            Service::Generation => self.generator.is_some(),
            Service::Synthesis => self.synthesizer.is_some(),
        }
    }

    /// Human-readable reason a capability is unavailable
    pub fn missing_reason(service: Service) -> &'static str {
        match service {
            Service::Transcription => "ASSEMBLYAI_API_KEY not configured",
            Service::Generation => "GEMINI_API_KEY not configured",
            Service::Synthesis => "MURF_API_KEY not configured",
        }
    }

    /// Close every session and flush history
    pub async fn shutdown(&self) {
        let closing = self.registry.close_all();
        log::info!("Shutting down: closing {} sessions", closing);

        // Sessions unregister themselves as they close
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.history.shutdown().await;
        if let Some(summary) = metrics::summary(&self.metrics) {
            log::info!("Metrics: {}", summary);
        }
    }
}
