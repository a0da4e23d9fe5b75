pub mod chunker;
pub mod compressor;
pub mod text;

pub use chunker::{
    chunk_audio, combine_transcription_results, needs_compression, AudioChunk, TranscriptSegment,
};
pub use compressor::{compress_audio, get_optimal_settings, CompressionPurpose, CompressionSettings};
pub use text::{apply_custom_words, is_assistant_request, looks_formatted, strip_noise_markers};

use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

pub const SAMPLE_RATE: u32 = 16000;

/// Raw mono PCM audio at 16 kHz, as handed over by the recording subsystem.
///
/// Consumed read-only by the pipeline. `duration_ms` is the caller-reported
/// wall-clock duration when known; otherwise it is derived from the sample
/// count.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub duration_ms: Option<u64>,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            duration_ms: None,
        }
    }

    pub fn with_duration(samples: Vec<f32>, duration_ms: u64) -> Self {
        Self {
            samples,
            duration_ms: Some(duration_ms),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Size of the PCM16 payload this buffer encodes to, excluding headers.
    pub fn byte_len(&self) -> usize {
        self.samples.len() * 2
    }

    /// Known duration, falling back to the sample count at 16 kHz.
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
            .unwrap_or_else(|| (self.samples.len() as u64 * 1000) / SAMPLE_RATE as u64)
    }

    /// Copies the sample range covering `[start_ms, end_ms)`.
    pub fn slice_ms(&self, start_ms: u64, end_ms: u64) -> Vec<f32> {
        let start = ((start_ms * SAMPLE_RATE as u64) / 1000) as usize;
        let end = (((end_ms * SAMPLE_RATE as u64) / 1000) as usize).min(self.samples.len());
        if start >= end {
            return Vec::new();
        }
        self.samples[start..end].to_vec()
    }
}

/// Encodes samples to an in-memory PCM16 WAV file.
pub fn encode_wav_bytes(samples: &[f32]) -> anyhow::Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut buffer, spec)?;
        for &sample in samples {
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(sample_i16)?;
        }
        writer.finalize()?;
    }

    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_duration_matches_sample_count() {
        let buffer = AudioBuffer::new(vec![0.0; SAMPLE_RATE as usize * 3]);
        assert_eq!(buffer.duration_ms(), 3000);
    }

    #[test]
    fn explicit_duration_wins() {
        let buffer = AudioBuffer::with_duration(vec![0.0; 16], 2500);
        assert_eq!(buffer.duration_ms(), 2500);
    }

    #[test]
    fn wav_header_present() {
        let wav = encode_wav_bytes(&[0.0, 0.5, -0.5]).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }

    #[test]
    fn slice_bounds_are_clamped() {
        let buffer = AudioBuffer::new(vec![0.1; SAMPLE_RATE as usize]); // 1s
        let slice = buffer.slice_ms(500, 2000);
        assert_eq!(slice.len(), SAMPLE_RATE as usize / 2);
        assert!(buffer.slice_ms(2000, 3000).is_empty());
    }
}
