use super::AudioBuffer;
use log::debug;

/// Encoded-payload size above which a single-shot upload is off the table.
pub const MAX_DIRECT_BYTES: usize = 1024 * 1024;
/// Duration above which a single-shot upload is off the table. Long quiet
/// recordings can be small in bytes yet long in wall-clock time, so both
/// thresholds are checked.
pub const MAX_DIRECT_DURATION_MS: u64 = 15_000;
/// Fixed chunk window. 10 s of 16 kHz PCM16 is ~320 KB, comfortably under
/// single-request provider limits.
pub const CHUNK_WINDOW_MS: u64 = 10_000;

/// One time-bounded piece of a long recording.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub start_ms: u64,
    pub end_ms: u64,
    pub sequence_index: usize,
}

/// Transcript for one chunk, ordered by the chunk's sequence index.
#[derive(Debug, Clone)]
pub struct TranscriptSegment {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// True when the audio exceeds either the byte or the time threshold and
/// must go through the compression/chunking path.
pub fn needs_compression(buffer: &AudioBuffer, duration_ms: Option<u64>) -> bool {
    let duration = duration_ms.unwrap_or_else(|| buffer.duration_ms());
    buffer.byte_len() > MAX_DIRECT_BYTES || duration > MAX_DIRECT_DURATION_MS
}

/// Splits the buffer into contiguous, non-overlapping time windows.
///
/// Concatenating the chunk ranges in sequence order reconstructs
/// `[0, duration_ms]` exactly; the final chunk absorbs the remainder.
pub fn chunk_audio(buffer: &AudioBuffer, duration_ms: u64) -> Vec<AudioChunk> {
    if duration_ms == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start_ms = 0u64;
    let mut sequence_index = 0usize;

    while start_ms < duration_ms {
        let end_ms = (start_ms + CHUNK_WINDOW_MS).min(duration_ms);
        chunks.push(AudioChunk {
            samples: buffer.slice_ms(start_ms, end_ms),
            start_ms,
            end_ms,
            sequence_index,
        });
        start_ms = end_ms;
        sequence_index += 1;
    }

    debug!(
        "Split {}ms of audio into {} chunks of up to {}ms",
        duration_ms,
        chunks.len(),
        CHUNK_WINDOW_MS
    );

    chunks
}

/// Concatenates segment texts in sequence order with single spaces.
/// Segments where the provider returned nothing (silent chunks) are skipped
/// without breaking the join.
pub fn combine_transcription_results(segments: &[TranscriptSegment]) -> String {
    segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_toolkit::SAMPLE_RATE;

    fn buffer_of_ms(ms: u64) -> AudioBuffer {
        let samples = vec![0.1_f32; (ms as usize * SAMPLE_RATE as usize) / 1000];
        AudioBuffer::with_duration(samples, ms)
    }

    #[test]
    fn thresholds_are_strict() {
        // Exactly 1 MiB of PCM16 -> 524288 samples. Not over.
        let at_byte_limit = AudioBuffer::with_duration(vec![0.0; 524_288], 1000);
        assert!(!needs_compression(&at_byte_limit, Some(1000)));

        let over_byte_limit = AudioBuffer::with_duration(vec![0.0; 524_289], 1000);
        assert!(needs_compression(&over_byte_limit, Some(1000)));

        let small = AudioBuffer::new(vec![0.0; 16]);
        assert!(!needs_compression(&small, Some(15_000)));
        assert!(needs_compression(&small, Some(15_001)));
    }

    #[test]
    fn chunks_cover_duration_exactly() {
        let buffer = buffer_of_ms(34_500);
        let chunks = chunk_audio(&buffer, 34_500);

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].start_ms, 0);
        for (i, pair) in chunks.windows(2).enumerate() {
            assert_eq!(pair[0].end_ms, pair[1].start_ms, "gap after chunk {}", i);
            assert_eq!(pair[0].sequence_index + 1, pair[1].sequence_index);
        }
        assert_eq!(chunks.last().unwrap().end_ms, 34_500);
    }

    #[test]
    fn exact_multiple_produces_full_windows() {
        let buffer = buffer_of_ms(20_000);
        let chunks = chunk_audio(&buffer, 20_000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].end_ms, 10_000);
        assert_eq!(chunks[1].end_ms, 20_000);
    }

    #[test]
    fn zero_duration_yields_no_chunks() {
        let buffer = buffer_of_ms(0);
        assert!(chunk_audio(&buffer, 0).is_empty());
    }

    #[test]
    fn combine_joins_in_order_and_skips_empty() {
        let segments = vec![
            TranscriptSegment {
                text: "hello".into(),
                start_ms: 0,
                end_ms: 1000,
            },
            TranscriptSegment {
                text: "".into(),
                start_ms: 1000,
                end_ms: 2000,
            },
            TranscriptSegment {
                text: "world".into(),
                start_ms: 2000,
                end_ms: 3000,
            },
        ];
        assert_eq!(combine_transcription_results(&segments), "hello world");
    }
}
