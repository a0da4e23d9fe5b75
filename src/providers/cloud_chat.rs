use super::{Transcription, TranscriptionOptions, TranscriptionProvider};
use crate::audio_toolkit::{encode_wav_bytes, AudioBuffer};
use crate::error::TranscribeError;
use crate::keystore::ProviderKeyStore;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize, Debug)]
struct ChatMessage {
    role: String,
    content: Vec<MessageContent>,
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MessageContent {
    Text { text: String },
    InputAudio { input_audio: AudioData },
}

#[derive(Serialize, Debug)]
struct AudioData {
    data: String,
    format: String,
}

#[derive(Serialize, Debug)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize, Debug)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    content: Option<String>,
}

/// Batch adapter for multimodal chat endpoints that accept inline audio
/// (Gemini's OpenAI-compatible surface and similar). Better long-form
/// accuracy than the whisper-style endpoints, higher latency.
pub struct CloudChatProvider {
    id: String,
    label: String,
    base_url: String,
    model: String,
    keystore: Arc<ProviderKeyStore>,
    client: reqwest::Client,
}

impl CloudChatProvider {
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
            keystore,
            client,
        })
    }

    fn build_prompt(&self, options: &TranscriptionOptions) -> String {
        let mut prompt = match options.whisper_language() {
            Some(lang) => format!(
                "Transcribe this audio in {}. Return only the transcribed text without any additional commentary.",
                lang
            ),
            None => "Transcribe this audio. Return only the transcribed text without any additional commentary.".to_string(),
        };

        if !options.dictionary_hints.is_empty() {
            prompt.push_str(&format!(
                " The speaker may use these terms: {}.",
                options.dictionary_hints.join(", ")
            ));
        }

        prompt
    }
}

#[async_trait]
impl TranscriptionProvider for CloudChatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn applies_formatting(&self) -> bool {
        true
    }

    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        options: &TranscriptionOptions,
    ) -> Result<Transcription, TranscribeError> {
        if audio.is_empty() {
            return Err(TranscribeError::NoTranscript);
        }

        let api_key = self.keystore.get_key(&self.id)?;

        let wav_data = encode_wav_bytes(&audio.samples)
            .map_err(|e| TranscribeError::Other(e.context("WAV encoding failed")))?;
        let base64_audio = STANDARD.encode(&wav_data);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: vec![
                    MessageContent::Text {
                        text: self.build_prompt(options),
                    },
                    MessageContent::InputAudio {
                        input_audio: AudioData {
                            data: base64_audio,
                            format: "wav".to_string(),
                        },
                    },
                ],
            }],
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!("[{}] sending chat transcription request to {}", self.id, url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&api_key)
            .json(&request)
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

        let completion: ChatCompletionResponse = response.json().await.map_err(|e| {
            TranscribeError::Other(anyhow::anyhow!("failed to parse chat response: {}", e))
        })?;

        let text = completion
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .map(|t| t.trim().to_string())
            .ok_or(TranscribeError::NoTranscript)?;

        debug!("[{}] chat transcription: {} chars", self.id, text.len());

        Ok(Transcription {
            text,
            provider_label: self.label.clone(),
        })
    }
}
