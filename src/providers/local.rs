use super::{Transcription, TranscriptionOptions, TranscriptionProvider};
use crate::audio_toolkit::{encode_wav_bytes, AudioBuffer};
use crate::error::TranscribeError;
use crate::managers::model::ModelManager;
use async_trait::async_trait;
use log::debug;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
// Local inference is CPU-bound and can take a while on long clips.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct LocalServerResponse {
    text: String,
}

/// On-device adapter: posts WAV audio to a local whisper-server-compatible
/// inference endpoint. Model availability is gated through the model
/// manager; a missing model fails the attempt as a configuration error so
/// the orchestrator falls through to the cloud chain instead of blocking.
pub struct LocalProvider {
    base_url: String,
    model_id: String,
    models: Arc<ModelManager>,
    client: reqwest::Client,
}

impl LocalProvider {
    pub fn new(
        base_url: impl Into<String>,
        model_id: impl Into<String>,
        models: Arc<ModelManager>,
    ) -> Result<Self, TranscribeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                TranscribeError::Configuration(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            base_url: base_url.into(),
            model_id: model_id.into(),
            models,
            client,
        })
    }
}

#[async_trait]
impl TranscriptionProvider for LocalProvider {
    fn id(&self) -> &str {
        "local"
    }

    fn label(&self) -> &str {
        "Local model"
    }

    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        options: &TranscriptionOptions,
    ) -> Result<Transcription, TranscribeError> {
        if audio.is_empty() {
            return Err(TranscribeError::NoTranscript);
        }

        if !self.models.is_model_available(&self.model_id) {
            return Err(TranscribeError::Configuration(format!(
                "local model '{}' is not downloaded",
                self.model_id
            )));
        }

        let wav_data = encode_wav_bytes(&audio.samples)
            .map_err(|e| TranscribeError::Other(e.context("WAV encoding failed")))?;

        let url = format!(
            "{}/audio/transcriptions",
            self.base_url.trim_end_matches('/')
        );
        debug!("[local] sending transcription request to {}", url);

        let file_part = Part::bytes(wav_data)
            .file_name("recording.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscribeError::Other(anyhow::anyhow!("invalid mime: {}", e)))?;

        let mut form = Form::new()
            .part("file", file_part)
            .text("model", self.model_id.clone())
            .text("response_format", "json")
            .text("temperature", "0");

        if let Some(lang) = options.whisper_language() {
            form = form.text("language", lang);
        }
        if !options.dictionary_hints.is_empty() {
            form = form.text("prompt", options.dictionary_hints.join(", "));
        }

        let response = self.client.post(&url).multipart(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error response".to_string());
            return Err(TranscribeError::from_status(status.as_u16(), body));
        }

        let parsed: LocalServerResponse = response.json().await.map_err(|e| {
            TranscribeError::Other(anyhow::anyhow!("failed to parse local response: {}", e))
        })?;

        Ok(Transcription {
            text: parsed.text.trim().to_string(),
            provider_label: format!("local:{}", self.model_id),
        })
    }
}
