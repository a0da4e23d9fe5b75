use super::{Transcription, TranscriptionOptions, TranscriptionProvider};
use crate::audio_toolkit::{encode_wav_bytes, AudioBuffer};
use crate::error::TranscribeError;
use crate::keystore::ProviderKeyStore;
use async_trait::async_trait;
use log::debug;
use reqwest::multipart::{Form, Part};
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Batch adapter for OpenAI-compatible `/audio/transcriptions` endpoints
/// (OpenAI, Groq, Deepgram's compatibility layer, and friends).
pub struct CloudBatchProvider {
    id: String,
    label: String,
    base_url: String,
    model: String,
    applies_formatting: bool,
    keystore: Arc<ProviderKeyStore>,
    client: reqwest::Client,
}

impl CloudBatchProvider {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        keystore: Arc<ProviderKeyStore>,
    ) -> Result<Self, TranscribeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                TranscribeError::Configuration(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            id: id.into(),
            label: label.into(),
            base_url: base_url.into(),
            model: model.into(),
            applies_formatting: true,
            keystore,
            client,
        })
    }

    async fn upload(
        &self,
        audio_part: Part,
        options: &TranscriptionOptions,
    ) -> Result<Transcription, TranscribeError> {
        let api_key = self.keystore.get_key(&self.id)?;

        let url = format!(
            "{}/audio/transcriptions",
            self.base_url.trim_end_matches('/')
        );
        debug!("[{}] sending transcription request to {}", self.id, url);

        let mut form = Form::new()
            .part("file", audio_part)
            .text("model", self.model.clone())
            .text("response_format", "text")
            .text("temperature", "0");

        if let Some(lang) = options.whisper_language() {
            form = form.text("language", lang);
        }
        if !options.dictionary_hints.is_empty() {
            // Whisper-style APIs accept a vocabulary-bias prompt field. Hints
            // go there, never into the audio prompt itself.
            form = form.text("prompt", options.dictionary_hints.join(", "));
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(&api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error response".to_string());
            return Err(TranscribeError::from_status(status.as_u16(), body));
        }

        let text = response.text().await?.trim().to_string();
        debug!("[{}] transcription response: {} chars", self.id, text.len());

        Ok(Transcription {
            text,
            provider_label: self.label.clone(),
        })
    }
}

#[async_trait]
impl TranscriptionProvider for CloudBatchProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn applies_formatting(&self) -> bool {
        self.applies_formatting
    }

    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        options: &TranscriptionOptions,
    ) -> Result<Transcription, TranscribeError> {
        if audio.is_empty() {
            return Err(TranscribeError::NoTranscript);
        }

        let wav_data = encode_wav_bytes(&audio.samples)
            .map_err(|e| TranscribeError::Other(e.context("WAV encoding failed")))?;
        debug!("[{}] encoded {} bytes of WAV", self.id, wav_data.len());

        let part = Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscribeError::Other(anyhow::anyhow!("invalid mime: {}", e)))?;

        self.upload(part, options).await
    }

    fn supports_encoded(&self) -> bool {
        true
    }

    async fn transcribe_encoded(
        &self,
        data: &[u8],
        mime: &str,
        options: &TranscriptionOptions,
    ) -> Result<Transcription, TranscribeError> {
        let extension = mime.rsplit('/').next().unwrap_or("bin");
        let part = Part::bytes(data.to_vec())
            .file_name(format!("audio.{}", extension))
            .mime_str(mime)
            .map_err(|e| TranscribeError::Other(anyhow::anyhow!("invalid mime: {}", e)))?;

        self.upload(part, options).await
    }
}
