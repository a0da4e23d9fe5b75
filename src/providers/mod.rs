pub mod cloud_batch;
pub mod cloud_chat;
pub mod cloud_stream;
pub mod local;

pub use cloud_batch::CloudBatchProvider;
pub use cloud_chat::CloudChatProvider;
pub use cloud_stream::CloudStreamProvider;
pub use local::LocalProvider;

use crate::audio_toolkit::AudioBuffer;
use crate::error::TranscribeError;
use async_trait::async_trait;

/// Per-request knobs forwarded to every adapter.
#[derive(Debug, Clone, Default)]
pub struct TranscriptionOptions {
    /// ISO language code, or None/"auto" for detection.
    pub language: Option<String>,
    /// Domain terms forwarded as a recognition-bias hint, never as prompt
    /// instructions (hint text leaking into the transcript as spoken content
    /// is guarded against downstream, in the cleanup stage).
    pub dictionary_hints: Vec<String>,
}

impl TranscriptionOptions {
    /// Language parameter suitable for Whisper-family APIs: "auto" and empty
    /// mean detection, Chinese variants collapse to the ISO 639-1 code.
    pub fn whisper_language(&self) -> Option<String> {
        match self.language.as_deref() {
            None | Some("") | Some("auto") => None,
            Some("zh-Hans") | Some("zh-Hant") => Some("zh".to_string()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Raw transcript from one provider.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub provider_label: String,
}

/// Common contract every backend implements. Vendor request/response shapes
/// never cross this boundary; the orchestrator only sees text or a
/// classified error.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Human-readable label attributed in results.
    fn label(&self) -> &str;

    /// Whether this backend already returns cased and punctuated text. Used
    /// by the smart-skip optimization only; a wrong `false` merely costs
    /// cleanup latency.
    fn applies_formatting(&self) -> bool {
        false
    }

    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        options: &TranscriptionOptions,
    ) -> Result<Transcription, TranscribeError>;

    /// Whether `transcribe_encoded` is implemented.
    fn supports_encoded(&self) -> bool {
        false
    }

    /// Transcribes a pre-encoded (compressed) payload. Only adapters that
    /// upload files can support this; the compression path checks
    /// `supports_encoded` first.
    async fn transcribe_encoded(
        &self,
        _data: &[u8],
        _mime: &str,
        _options: &TranscriptionOptions,
    ) -> Result<Transcription, TranscribeError> {
        Err(TranscribeError::Configuration(format!(
            "provider '{}' does not accept encoded audio",
            self.id()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whisper_language_normalization() {
        let mut options = TranscriptionOptions::default();
        assert_eq!(options.whisper_language(), None);

        options.language = Some("auto".into());
        assert_eq!(options.whisper_language(), None);

        options.language = Some("zh-Hans".into());
        assert_eq!(options.whisper_language(), Some("zh".into()));

        options.language = Some("de".into());
        assert_eq!(options.whisper_language(), Some("de".into()));
    }
}
