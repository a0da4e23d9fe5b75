use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::Command;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// What the compressed audio is for; transcription tolerates more aggressive
/// settings than archival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionPurpose {
    Transcription,
    Archival,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionSettings {
    /// Container/codec passed to the encoder, e.g. "ogg" (libopus).
    pub format: String,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
}

#[derive(Debug)]
pub struct CompressedAudio {
    pub path: TempAudioFile,
    pub bytes: Vec<u8>,
    pub mime: String,
    pub input_bytes: u64,
    pub output_bytes: u64,
}

/// Temp file that is removed when dropped, so compressed intermediates never
/// outlive the request, including on error paths.
#[derive(Debug)]
pub struct TempAudioFile {
    path: PathBuf,
}

impl TempAudioFile {
    pub fn new(extension: &str) -> Self {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "sotto-{}-{}.{}",
            chrono::Utc::now().timestamp_millis(),
            n,
            extension
        );
        Self {
            path: std::env::temp_dir().join(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempAudioFile {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove temp audio file {:?}: {}", self.path, e);
            }
        }
    }
}

/// Picks encoder settings by duration: longer audio gets squeezed harder so
/// the upload stays under provider payload limits.
pub fn get_optimal_settings(duration_ms: u64, purpose: CompressionPurpose) -> CompressionSettings {
    let bitrate_kbps = match (purpose, duration_ms) {
        (CompressionPurpose::Archival, _) => 64,
        (CompressionPurpose::Transcription, 0..=60_000) => 32,
        (CompressionPurpose::Transcription, 60_001..=300_000) => 24,
        (CompressionPurpose::Transcription, _) => 16,
    };

    CompressionSettings {
        format: "ogg".to_string(),
        bitrate_kbps,
        sample_rate: 16_000,
    }
}

/// Re-encodes `input_path` with an external `ffmpeg` encoder.
///
/// Any failure here (encoder missing, non-zero exit, unreadable output) is
/// reported to the caller, which falls back to the chunking path; compression
/// and chunking are alternate strategies for the same oversized-audio
/// problem.
pub async fn compress_audio(
    input_path: &Path,
    settings: &CompressionSettings,
) -> Result<CompressedAudio> {
    let input_bytes = tokio::fs::metadata(input_path).await?.len();
    let output = TempAudioFile::new(&settings.format);

    debug!(
        "Compressing {:?} -> {:?} ({} kbps, {} Hz)",
        input_path,
        output.path(),
        settings.bitrate_kbps,
        settings.sample_rate
    );

    let status = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(input_path)
        .arg("-ac")
        .arg("1")
        .arg("-ar")
        .arg(settings.sample_rate.to_string())
        .arg("-b:a")
        .arg(format!("{}k", settings.bitrate_kbps))
        .arg(output.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| anyhow!("failed to launch ffmpeg: {}", e))?;

    if !status.success() {
        return Err(anyhow!("ffmpeg exited with {}", status));
    }

    let bytes = tokio::fs::read(output.path()).await?;
    if bytes.is_empty() {
        return Err(anyhow!("encoder produced an empty file"));
    }

    let output_bytes = bytes.len() as u64;
    info!(
        "Compressed audio {} -> {} bytes ({:.0}% of original)",
        input_bytes,
        output_bytes,
        (output_bytes as f64 / input_bytes.max(1) as f64) * 100.0
    );

    let mime = match settings.format.as_str() {
        "ogg" => "audio/ogg",
        "mp3" => "audio/mpeg",
        other => {
            warn!("Unknown compression format '{}', defaulting mime", other);
            "application/octet-stream"
        }
    }
    .to_string();

    Ok(CompressedAudio {
        path: output,
        bytes,
        mime,
        input_bytes,
        output_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longer_audio_gets_lower_bitrate() {
        let short = get_optimal_settings(30_000, CompressionPurpose::Transcription);
        let medium = get_optimal_settings(120_000, CompressionPurpose::Transcription);
        let long = get_optimal_settings(600_000, CompressionPurpose::Transcription);

        assert!(short.bitrate_kbps > medium.bitrate_kbps);
        assert!(medium.bitrate_kbps > long.bitrate_kbps);
        assert_eq!(short.format, "ogg");
    }

    #[test]
    fn archival_keeps_higher_bitrate() {
        let archival = get_optimal_settings(600_000, CompressionPurpose::Archival);
        let transcription = get_optimal_settings(600_000, CompressionPurpose::Transcription);
        assert!(archival.bitrate_kbps > transcription.bitrate_kbps);
    }

    #[test]
    fn temp_file_is_removed_on_drop() {
        let path = {
            let tmp = TempAudioFile::new("ogg");
            std::fs::write(tmp.path(), b"x").unwrap();
            assert!(tmp.path().exists());
            tmp.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
