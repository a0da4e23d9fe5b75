use crate::audio_toolkit::{
    apply_custom_words, chunk_audio, combine_transcription_results, compress_audio,
    compressor::TempAudioFile, encode_wav_bytes, get_optimal_settings, is_assistant_request,
    looks_formatted, needs_compression, strip_noise_markers, AudioBuffer, CompressionPurpose,
    TranscriptSegment,
};
use crate::diagnostics;
use crate::error::{ErrorCategory, TranscribeError};
use crate::http_retry::{call_with_retry, RetryOptions};
use crate::keystore::ProviderKeyStore;
use crate::providers::{
    CloudBatchProvider, CloudChatProvider, CloudStreamProvider, LocalProvider, Transcription,
    TranscriptionOptions, TranscriptionProvider,
};
use crate::settings::{CloudProviderConfig, SettingsStore};
use crate::PipelineContext;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Clips at or under this duration route to the latency-optimized tier.
const FAST_TIER_MAX_DURATION_MS: u64 = 10_000;
/// Pause between sequential chunk uploads, to stay friendly with provider
/// rate limits.
const INTER_CHUNK_DELAY: Duration = Duration::from_millis(100);

/// One provider invocation in the attempt log, retries included.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderAttempt {
    pub provider_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed { category: ErrorCategory },
}

/// Final output of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub text: String,
    /// Label of the provider that produced the transcript.
    pub provider_label: String,
    /// The wake word appeared in the first three words; cleanup was skipped
    /// so the router sees the utterance verbatim.
    pub is_assistant_request: bool,
    pub attempts: Vec<ProviderAttempt>,
    pub cleanup_guard_triggered: bool,
}

/// Abort rule for the chunked path: once at least half the chunks have been
/// attempted and more than half of those failed, the recording is considered
/// unrecoverable.
fn should_abort_chunking(failed: usize, attempted: usize, total: usize) -> bool {
    attempted * 2 >= total && failed * 2 > attempted
}

fn build_cloud_provider(
    config: &CloudProviderConfig,
    keystore: &Arc<ProviderKeyStore>,
) -> Result<Arc<dyn TranscriptionProvider>, TranscribeError> {
    // The endpoint shape decides the adapter: realtime sockets speak the
    // streaming protocol, multimodal chat models take inline audio, anything
    // else is an OpenAI-compatible file upload.
    if config.base_url.starts_with("ws://") || config.base_url.starts_with("wss://") {
        Ok(Arc::new(CloudStreamProvider::new(
            &config.id,
            &config.label,
            &config.base_url,
            &config.model,
            keystore.clone(),
        )))
    } else if config.model.starts_with("gemini") {
        Ok(Arc::new(CloudChatProvider::new(
            &config.id,
            &config.label,
            &config.base_url,
            &config.model,
            keystore.clone(),
        )?))
    } else {
        Ok(Arc::new(CloudBatchProvider::new(
            &config.id,
            &config.label,
            &config.base_url,
            &config.model,
            keystore.clone(),
        )?))
    }
}

fn build_tier(
    configs: &[CloudProviderConfig],
    keystore: &Arc<ProviderKeyStore>,
) -> Result<Vec<Arc<dyn TranscriptionProvider>>, TranscribeError> {
    configs
        .iter()
        .filter(|c| c.enabled)
        .map(|c| build_cloud_provider(c, keystore))
        .collect()
}

/// Orchestrates one recording through provider selection, fallback,
/// oversized-audio handling and post-processing.
///
/// Providers are constructed once from the settings snapshot at build time;
/// rebuild the pipeline after a settings change.
pub struct TranscriptionPipeline {
    settings: Arc<SettingsStore>,
    cleanup: crate::cleanup::TextCleanupStage,
    local: Option<Arc<dyn TranscriptionProvider>>,
    fast: Vec<Arc<dyn TranscriptionProvider>>,
    accurate: Vec<Arc<dyn TranscriptionProvider>>,
    retry: RetryOptions,
    inter_chunk_delay: Duration,
}

impl TranscriptionPipeline {
    pub fn new(context: &PipelineContext) -> Result<Self, TranscribeError> {
        let settings = context.settings.get();

        let local: Option<Arc<dyn TranscriptionProvider>> =
            if settings.use_local_model && !settings.selected_model.is_empty() {
                Some(Arc::new(LocalProvider::new(
                    &settings.local_server_url,
                    &settings.selected_model,
                    context.models.clone(),
                )?))
            } else {
                None
            };

        Ok(Self {
            cleanup: crate::cleanup::TextCleanupStage::new(
                context.settings.clone(),
                context.keys.clone(),
            ),
            local,
            fast: build_tier(&settings.fast_providers, &context.keys)?,
            accurate: build_tier(&settings.accurate_providers, &context.keys)?,
            settings: context.settings.clone(),
            retry: RetryOptions::default(),
            inter_chunk_delay: INTER_CHUNK_DELAY,
        })
    }

    /// Builds a pipeline over explicit provider chains, bypassing the
    /// settings-driven construction. Used by embedders with custom backends
    /// and by tests.
    pub fn with_providers(
        settings: Arc<SettingsStore>,
        keys: Arc<ProviderKeyStore>,
        local: Option<Arc<dyn TranscriptionProvider>>,
        fast: Vec<Arc<dyn TranscriptionProvider>>,
        accurate: Vec<Arc<dyn TranscriptionProvider>>,
    ) -> Self {
        Self {
            cleanup: crate::cleanup::TextCleanupStage::new(settings.clone(), keys),
            local,
            fast,
            accurate,
            settings,
            retry: RetryOptions::default(),
            inter_chunk_delay: INTER_CHUNK_DELAY,
        }
    }

    pub fn with_retry_options(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_inter_chunk_delay(mut self, delay: Duration) -> Self {
        self.inter_chunk_delay = delay;
        self
    }

    /// Providers to try for this clip, in fallback order.
    fn provider_chain(&self, duration_ms: u64) -> Vec<Arc<dyn TranscriptionProvider>> {
        let mut chain = Vec::new();
        if let Some(local) = &self.local {
            chain.push(local.clone());
        }
        let tier = if duration_ms <= FAST_TIER_MAX_DURATION_MS {
            &self.fast
        } else {
            &self.accurate
        };
        chain.extend(tier.iter().cloned());
        chain
    }

    /// Runs the full pipeline on one recording.
    pub async fn transcribe(
        &self,
        audio: &AudioBuffer,
    ) -> Result<PipelineResult, TranscribeError> {
        if audio.is_empty() {
            return Err(TranscribeError::NoTranscript);
        }

        let settings = self.settings.get();
        let options = TranscriptionOptions {
            language: Some(settings.selected_language.clone()),
            dictionary_hints: settings.dictionary_words.clone(),
        };

        let duration_ms = audio.duration_ms();
        let chain = self.provider_chain(duration_ms);
        if chain.is_empty() {
            return Err(TranscribeError::Configuration(
                "no transcription providers are enabled".to_string(),
            ));
        }

        debug!(
            "Transcribing {}ms of audio ({} bytes) through {} providers",
            duration_ms,
            audio.byte_len(),
            chain.len()
        );

        let mut attempts = Vec::new();

        let outcome = if needs_compression(audio, Some(duration_ms)) {
            self.transcribe_oversized(audio, duration_ms, &chain, &options, &mut attempts)
                .await
        } else {
            self.try_chain(&chain, audio, &options, &mut attempts).await
        };

        let (raw, provider_label, applies_formatting) = match outcome {
            Ok(v) => v,
            Err(e) => return Err(diagnose_failure(e).await),
        };

        let corrected = apply_custom_words(
            &raw,
            &settings.dictionary_words,
            settings.word_correction_threshold,
        );

        if is_assistant_request(&corrected, &settings.wake_word) {
            info!("Wake word detected, routing as assistant request");
            return Ok(PipelineResult {
                text: corrected,
                provider_label,
                is_assistant_request: true,
                attempts,
                cleanup_guard_triggered: false,
            });
        }

        // Smart skip: text a formatting-capable provider already punctuated
        // does not need an LLM pass.
        if settings.cleanup_enabled && !(applies_formatting && looks_formatted(&corrected)) {
            let cleaned = self.cleanup.clean(&corrected).await;
            Ok(PipelineResult {
                text: cleaned.text,
                provider_label,
                is_assistant_request: false,
                attempts,
                cleanup_guard_triggered: cleaned.signature_guard_triggered,
            })
        } else {
            Ok(PipelineResult {
                text: corrected,
                provider_label,
                is_assistant_request: false,
                attempts,
                cleanup_guard_triggered: false,
            })
        }
    }

    /// Tries each provider in order until one yields a non-empty transcript.
    /// A transcript that is empty after noise-marker stripping counts as a
    /// failure for that provider and falls through to the next.
    async fn try_chain(
        &self,
        chain: &[Arc<dyn TranscriptionProvider>],
        audio: &AudioBuffer,
        options: &TranscriptionOptions,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> Result<(String, String, bool), TranscribeError> {
        let mut last_error = None;

        for provider in chain {
            let result = self
                .attempt(provider.as_ref(), attempts, || {
                    provider.transcribe(audio, options)
                })
                .await;

            match result {
                Ok((text, label)) => return Ok((text, label, provider.applies_formatting())),
                Err(e) => {
                    warn!("Provider {} failed: {}", provider.id(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(TranscribeError::NoTranscript))
    }

    /// Runs one provider operation with retries, records it in the attempt
    /// log, and normalizes noise-marker-only output to `NoTranscript`.
    async fn attempt<F, Fut>(
        &self,
        provider: &dyn TranscriptionProvider,
        attempts: &mut Vec<ProviderAttempt>,
        operation: F,
    ) -> Result<(String, String), TranscribeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Transcription, TranscribeError>>,
    {
        let started_at = Utc::now();
        let clock = Instant::now();

        let result = call_with_retry(provider.id(), &self.retry, operation)
            .await
            .and_then(|t| {
                let text = strip_noise_markers(&t.text);
                if text.is_empty() {
                    Err(TranscribeError::NoTranscript)
                } else {
                    Ok((text, t.provider_label))
                }
            });

        attempts.push(ProviderAttempt {
            provider_id: provider.id().to_string(),
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            outcome: match &result {
                Ok(_) => AttemptOutcome::Success,
                Err(e) => AttemptOutcome::Failed {
                    category: e.category(),
                },
            },
        });

        result
    }

    /// Oversized recordings: compress-and-upload first, chunked transfer as
    /// the fallback when no encoder or no file-accepting provider is
    /// available.
    async fn transcribe_oversized(
        &self,
        audio: &AudioBuffer,
        duration_ms: u64,
        chain: &[Arc<dyn TranscriptionProvider>],
        options: &TranscriptionOptions,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> Result<(String, String, bool), TranscribeError> {
        info!(
            "Audio exceeds direct-upload limits ({} bytes, {}ms), using oversized path",
            audio.byte_len(),
            duration_ms
        );

        match self
            .try_compressed(audio, duration_ms, chain, options, attempts)
            .await
        {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!("Compressed upload failed, falling back to chunking: {}", e);
            }
        }

        self.transcribe_chunked(audio, duration_ms, chain, options, attempts)
            .await
    }

    async fn try_compressed(
        &self,
        audio: &AudioBuffer,
        duration_ms: u64,
        chain: &[Arc<dyn TranscriptionProvider>],
        options: &TranscriptionOptions,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> Result<(String, String, bool), TranscribeError> {
        let encoded_chain: Vec<_> = chain.iter().filter(|p| p.supports_encoded()).collect();
        if encoded_chain.is_empty() {
            return Err(TranscribeError::Configuration(
                "no provider in the chain accepts encoded audio".to_string(),
            ));
        }

        let wav = encode_wav_bytes(&audio.samples)
            .map_err(|e| TranscribeError::Other(e.context("WAV encoding failed")))?;
        let input = TempAudioFile::new("wav");
        tokio::fs::write(input.path(), &wav)
            .await
            .map_err(|e| TranscribeError::Other(anyhow::anyhow!("temp write failed: {}", e)))?;

        let settings = get_optimal_settings(duration_ms, CompressionPurpose::Transcription);
        let compressed = compress_audio(input.path(), &settings)
            .await
            .map_err(TranscribeError::Other)?;

        let mut last_error = None;
        for provider in encoded_chain {
            let result = self
                .attempt(provider.as_ref(), attempts, || {
                    provider.transcribe_encoded(&compressed.bytes, &compressed.mime, options)
                })
                .await;

            match result {
                Ok((text, label)) => return Ok((text, label, provider.applies_formatting())),
                Err(e) => {
                    warn!("Provider {} rejected compressed upload: {}", provider.id(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(TranscribeError::NoTranscript))
    }

    /// Sequential chunked transfer with an early-abort check after every
    /// chunk. A completed run with at least one transcribed chunk returns
    /// the partial transcript; a silent chunk is an empty segment, not a
    /// failure.
    async fn transcribe_chunked(
        &self,
        audio: &AudioBuffer,
        duration_ms: u64,
        chain: &[Arc<dyn TranscriptionProvider>],
        options: &TranscriptionOptions,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> Result<(String, String, bool), TranscribeError> {
        let chunks = chunk_audio(audio, duration_ms);
        let total = chunks.len();
        if total == 0 {
            return Err(TranscribeError::NoTranscript);
        }

        let mut segments: Vec<TranscriptSegment> = Vec::new();
        let mut provider_label: Option<String> = None;
        let mut attempted = 0usize;
        let mut failed = 0usize;

        for chunk in &chunks {
            if attempted > 0 {
                tokio::time::sleep(self.inter_chunk_delay).await;
            }
            attempted += 1;

            let chunk_buffer = AudioBuffer::with_duration(
                chunk.samples.clone(),
                chunk.end_ms - chunk.start_ms,
            );

            match self.try_chain(chain, &chunk_buffer, options, attempts).await {
                Ok((text, label, _)) => {
                    provider_label.get_or_insert(label);
                    segments.push(TranscriptSegment {
                        text,
                        start_ms: chunk.start_ms,
                        end_ms: chunk.end_ms,
                    });
                }
                Err(TranscribeError::NoTranscript) => {
                    debug!(
                        "Chunk {} ({}..{}ms) is silent",
                        chunk.sequence_index, chunk.start_ms, chunk.end_ms
                    );
                    segments.push(TranscriptSegment {
                        text: String::new(),
                        start_ms: chunk.start_ms,
                        end_ms: chunk.end_ms,
                    });
                }
                Err(e) => {
                    warn!(
                        "Chunk {} ({}..{}ms) failed: {}",
                        chunk.sequence_index, chunk.start_ms, chunk.end_ms, e
                    );
                    failed += 1;
                }
            }

            if should_abort_chunking(failed, attempted, total) {
                let partial = combine_transcription_results(&segments);
                if !partial.is_empty() {
                    info!("Discarding partial transcript on abort: {:?}", partial);
                }
                return Err(TranscribeError::TooManyChunkFailures {
                    failed,
                    attempted,
                    total,
                });
            }
        }

        let combined = combine_transcription_results(&segments);
        if combined.is_empty() {
            return Err(TranscribeError::NoTranscript);
        }

        if failed > 0 {
            info!(
                "Chunked transcription completed with {} of {} chunks failed, returning partial transcript",
                failed, total
            );
        }

        // Combined text lost per-chunk formatting context, so never
        // smart-skip cleanup for it.
        Ok((
            combined,
            provider_label.unwrap_or_else(|| "chunked".to_string()),
            false,
        ))
    }
}

/// Terminal-failure translation: chain exhaustion becomes
/// `NoProviderAvailable` with a network diagnosis attached, while errors
/// that already carry a verdict pass through unchanged.
async fn diagnose_failure(error: TranscribeError) -> TranscribeError {
    match error {
        e @ (TranscribeError::NoTranscript
        | TranscribeError::TooManyChunkFailures { .. }
        | TranscribeError::Configuration(_)) => e,
        e => {
            let diagnosis = diagnostics::probe().await;
            warn!("All providers failed ({}); {}", e, diagnosis.summary());
            TranscribeError::NoProviderAvailable {
                diagnosis: format!("{} (last error: {})", diagnosis.summary(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_rule_waits_for_half_the_chunks() {
        // 10 chunks: nothing aborts before 5 attempts.
        assert!(!should_abort_chunking(4, 4, 10));
        // At 5 attempts, >50% failures abort.
        assert!(should_abort_chunking(3, 5, 10));
        assert!(!should_abort_chunking(2, 5, 10));
    }

    #[test]
    fn abort_rule_single_chunk() {
        assert!(should_abort_chunking(1, 1, 1));
        assert!(!should_abort_chunking(0, 1, 1));
    }

    #[test]
    fn abort_rule_exactly_half_failures_continues() {
        // failed * 2 == attempted is not "more than half".
        assert!(!should_abort_chunking(3, 6, 10));
        assert!(should_abort_chunking(4, 6, 10));
    }
}
