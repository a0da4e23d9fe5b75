use super::{Transcription, TranscriptionOptions, TranscriptionProvider};
use crate::audio_toolkit::{encode_wav_bytes, AudioBuffer};
use crate::error::TranscribeError;
use crate::keystore::ProviderKeyStore;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const AUDIO_FRAME_BYTES: usize = 32 * 1024;

#[derive(Serialize)]
struct StartRequest {
    api_key: String,
    model: String,
    audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    language_hints: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vocabulary: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Default)]
struct StreamToken {
    text: String,
    #[serde(default)]
    is_final: bool,
}

#[derive(Deserialize, Debug, Default)]
struct StreamResponse {
    #[serde(default)]
    tokens: Vec<StreamToken>,
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    error_message: Option<String>,
}

/// Batch adapter that uploads a full clip over the provider's realtime
/// WebSocket endpoint. Lowest time-to-first-byte of the cloud adapters, used
/// for short clips where connection setup dominates.
pub struct CloudStreamProvider {
    id: String,
    label: String,
    ws_url: String,
    model: String,
    keystore: Arc<ProviderKeyStore>,
}

impl CloudStreamProvider {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        ws_url: impl Into<String>,
        model: impl Into<String>,
        keystore: Arc<ProviderKeyStore>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            ws_url: ws_url.into(),
            model: model.into(),
            keystore,
        }
    }
}

#[async_trait]
impl TranscriptionProvider for CloudStreamProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
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

        let started = Instant::now();

        let (stream, _) = timeout(CONNECT_TIMEOUT, connect_async(&self.ws_url))
            .await
            .map_err(|_| TranscribeError::Timeout(CONNECT_TIMEOUT))?
            .map_err(|e| TranscribeError::Network(format!("WebSocket connect failed: {}", e)))?;

        let (mut write, mut read) = stream.split();

        let start_request = StartRequest {
            api_key,
            model: self.model.clone(),
            audio_format: "auto".to_string(),
            language_hints: options.whisper_language().map(|l| vec![l]),
            vocabulary: if options.dictionary_hints.is_empty() {
                None
            } else {
                Some(options.dictionary_hints.clone())
            },
        };

        let start_payload = serde_json::to_string(&start_request)
            .map_err(|e| TranscribeError::Other(anyhow::anyhow!("start payload: {}", e)))?;

        write
            .send(Message::Text(start_payload.into()))
            .await
            .map_err(|e| TranscribeError::Network(format!("failed to send start request: {}", e)))?;

        for frame in wav_data.chunks(AUDIO_FRAME_BYTES) {
            write
                .send(Message::Binary(frame.to_vec().into()))
                .await
                .map_err(|e| TranscribeError::Network(format!("failed to send audio: {}", e)))?;
        }

        // Finalize control message, then an empty binary frame to signal
        // end-of-audio.
        write
            .send(Message::Text(r#"{"type":"finalize"}"#.to_string().into()))
            .await
            .map_err(|e| TranscribeError::Network(format!("failed to send finalize: {}", e)))?;
        write
            .send(Message::Binary(Vec::new().into()))
            .await
            .map_err(|e| TranscribeError::Network(format!("failed to close audio stream: {}", e)))?;
        write
            .flush()
            .await
            .map_err(|e| TranscribeError::Network(format!("failed to flush stream: {}", e)))?;

        let mut final_tokens: Vec<String> = Vec::new();
        let mut finished = false;

        loop {
            let remaining = READ_TIMEOUT
                .checked_sub(started.elapsed())
                .ok_or(TranscribeError::Timeout(READ_TIMEOUT))?;

            let frame = timeout(remaining, read.next())
                .await
                .map_err(|_| TranscribeError::Timeout(READ_TIMEOUT))?;
            let Some(frame) = frame else {
                break;
            };
            let frame =
                frame.map_err(|e| TranscribeError::Network(format!("WebSocket read: {}", e)))?;

            match frame {
                Message::Text(text) => {
                    let payload: StreamResponse =
                        serde_json::from_str(text.as_ref()).map_err(|e| {
                            TranscribeError::Other(anyhow::anyhow!("invalid WS payload: {}", e))
                        })?;

                    if let Some(code) = payload.error_code {
                        let message = payload
                            .error_message
                            .unwrap_or_else(|| "unknown streaming error".to_string());
                        return Err(TranscribeError::from_status(code, message));
                    }

                    for token in payload.tokens.into_iter().filter(|t| t.is_final) {
                        if !token.text.is_empty() {
                            final_tokens.push(token.text);
                        }
                    }

                    if payload.finished {
                        finished = true;
                        break;
                    }
                }
                Message::Close(_) => {
                    if !finished {
                        return Err(TranscribeError::Network(
                            "WebSocket closed before completion".to_string(),
                        ));
                    }
                    break;
                }
                // Ping/pong handled by tungstenite internals.
                _ => {}
            }
        }

        if !finished {
            return Err(TranscribeError::Network(
                "stream ended without a completion signal".to_string(),
            ));
        }

        let text = final_tokens.concat().trim().to_string();
        debug!(
            "[{}] streaming upload finished in {}ms ({} chars)",
            self.id,
            started.elapsed().as_millis(),
            text.len()
        );

        Ok(Transcription {
            text,
            provider_label: self.label.clone(),
        })
    }
}
