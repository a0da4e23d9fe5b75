//! Voice transcription pipeline with tiered cloud fallback, oversized-audio
//! handling, live streaming sessions and LLM-backed transcript cleanup.

pub mod audio_toolkit;
pub mod cleanup;
pub mod diagnostics;
pub mod error;
pub mod http_retry;
pub mod keystore;
pub mod managers;
pub mod providers;
pub mod settings;

use std::sync::Arc;

pub use audio_toolkit::AudioBuffer;
pub use error::{ErrorCategory, TranscribeError};
pub use managers::model::ModelManager;
pub use managers::streaming::{StreamingCallbacks, StreamingConfig, StreamingSession};
pub use managers::transcription::{PipelineResult, ProviderAttempt, TranscriptionPipeline};
pub use providers::{Transcription, TranscriptionOptions, TranscriptionProvider};
pub use settings::{AppSettings, SettingsStore};

/// Shared services handed to the pipeline at construction. Everything is
/// reference-counted so embedders can hold onto the same stores the pipeline
/// uses.
#[derive(Clone)]
pub struct PipelineContext {
    pub settings: Arc<settings::SettingsStore>,
    pub keys: Arc<keystore::ProviderKeyStore>,
    pub models: Arc<managers::model::ModelManager>,
}

impl PipelineContext {
    pub fn new(
        settings: Arc<settings::SettingsStore>,
        models: Arc<managers::model::ModelManager>,
    ) -> Self {
        let keys = Arc::new(keystore::ProviderKeyStore::new(settings.clone()));
        Self {
            settings,
            keys,
            models,
        }
    }
}
