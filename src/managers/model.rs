use anyhow::Result;
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tar::Archive;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ModelKind {
    /// Single weights file.
    File,
    /// Directory of files shipped as a tar.gz archive.
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub filename: String,
    pub url: String,
    pub size_mb: u64,
    pub kind: ModelKind,
    /// Expected sha256 of the downloaded artifact, when published.
    pub sha256: Option<String>,
    pub is_downloaded: bool,
    pub is_downloading: bool,
    pub partial_size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadProgress {
    pub model_id: String,
    pub downloaded: u64,
    pub total: u64,
    pub percentage: f64,
}

fn builtin_catalog() -> HashMap<String, ModelInfo> {
    let mut models = HashMap::new();

    models.insert(
        "whisper-small".to_string(),
        ModelInfo {
            id: "whisper-small".to_string(),
            name: "Whisper Small".to_string(),
            description: "Fast and fairly accurate.".to_string(),
            filename: "ggml-small.bin".to_string(),
            url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-small.bin"
                .to_string(),
            size_mb: 487,
            kind: ModelKind::File,
            sha256: None,
            is_downloaded: false,
            is_downloading: false,
            partial_size: 0,
        },
    );

    models.insert(
        "whisper-turbo".to_string(),
        ModelInfo {
            id: "whisper-turbo".to_string(),
            name: "Whisper Turbo".to_string(),
            description: "Balanced accuracy and speed.".to_string(),
            filename: "ggml-large-v3-turbo.bin".to_string(),
            url:
                "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-large-v3-turbo.bin"
                    .to_string(),
            size_mb: 1600,
            kind: ModelKind::File,
            sha256: None,
            is_downloaded: false,
            is_downloading: false,
            partial_size: 0,
        },
    );

    models.insert(
        "parakeet-v3".to_string(),
        ModelInfo {
            id: "parakeet-v3".to_string(),
            name: "Parakeet V3".to_string(),
            description: "Fast and accurate, English-focused.".to_string(),
            filename: "parakeet-tdt-0.6b-v3-int8".to_string(), // Directory name
            url: "https://blob.handy.computer/parakeet-v3-int8.tar.gz".to_string(),
            size_mb: 478,
            kind: ModelKind::Directory,
            sha256: None,
            is_downloaded: false,
            is_downloading: false,
            partial_size: 0,
        },
    );

    models
}

/// Catalog and downloader for on-device models.
///
/// Constructed once at application start with the models directory and
/// shared by reference; the local provider consults it before every call.
/// Partial downloads persist as `.partial` files and are resumed with HTTP
/// Range requests across restarts.
pub struct ModelManager {
    models_dir: PathBuf,
    available_models: Mutex<HashMap<String, ModelInfo>>,
    client: reqwest::Client,
}

impl ModelManager {
    pub fn new(models_dir: impl Into<PathBuf>) -> Result<Self> {
        let models_dir = models_dir.into();
        if !models_dir.exists() {
            fs::create_dir_all(&models_dir)?;
        }

        let manager = Self {
            models_dir,
            available_models: Mutex::new(builtin_catalog()),
            client: reqwest::Client::new(),
        };

        manager.update_download_status()?;
        Ok(manager)
    }

    pub fn get_available_models(&self) -> Vec<ModelInfo> {
        let models = self.available_models.lock().unwrap();
        models.values().cloned().collect()
    }

    pub fn get_model_info(&self, model_id: &str) -> Option<ModelInfo> {
        let models = self.available_models.lock().unwrap();
        models.get(model_id).cloned()
    }

    pub fn is_model_available(&self, model_id: &str) -> bool {
        self.get_model_info(model_id)
            .map(|m| m.is_downloaded)
            .unwrap_or(false)
    }

    pub fn get_model_path(&self, model_id: &str) -> Result<PathBuf> {
        let info = self
            .get_model_info(model_id)
            .ok_or_else(|| anyhow::anyhow!("Model not found: {}", model_id))?;
        Ok(self.models_dir.join(&info.filename))
    }

    fn update_download_status(&self) -> Result<()> {
        let mut models = self.available_models.lock().unwrap();

        for model in models.values_mut() {
            let model_path = self.models_dir.join(&model.filename);
            let partial_path = self.models_dir.join(format!("{}.partial", &model.filename));

            if model.kind == ModelKind::Directory {
                // Clean up leftover staging directories from interrupted
                // extractions.
                let extracting_path = self
                    .models_dir
                    .join(format!("{}.extracting", &model.filename));
                if extracting_path.exists() {
                    warn!("Cleaning up interrupted extraction for model: {}", model.id);
                    let _ = fs::remove_dir_all(&extracting_path);
                }
                model.is_downloaded = model_path.exists() && model_path.is_dir();
            } else {
                model.is_downloaded = model_path.exists();
            }

            model.is_downloading = false;
            model.partial_size = if partial_path.exists() {
                partial_path.metadata().map(|m| m.len()).unwrap_or(0)
            } else {
                0
            };
        }

        Ok(())
    }

    fn set_downloading(&self, model_id: &str, downloading: bool) {
        let mut models = self.available_models.lock().unwrap();
        if let Some(model) = models.get_mut(model_id) {
            model.is_downloading = downloading;
        }
    }

    /// Downloads (or resumes) a model, reporting progress through
    /// `on_progress`. Returns once the model is fully installed and
    /// verified.
    pub async fn download_model(
        &self,
        model_id: &str,
        on_progress: impl Fn(DownloadProgress),
    ) -> Result<()> {
        let model_info = self
            .get_model_info(model_id)
            .ok_or_else(|| anyhow::anyhow!("Model not found: {}", model_id))?;

        let model_path = self.models_dir.join(&model_info.filename);
        let partial_path = self
            .models_dir
            .join(format!("{}.partial", &model_info.filename));

        if model_path.exists() {
            info!("Model {} already installed, skipping download", model_id);
            if partial_path.exists() {
                let _ = fs::remove_file(&partial_path);
            }
            self.update_download_status()?;
            return Ok(());
        }

        let mut resume_from = if partial_path.exists() {
            let size = partial_path.metadata()?.len();
            info!("Resuming download of {} from byte {}", model_id, size);
            size
        } else {
            info!("Starting download of {} from {}", model_id, model_info.url);
            0
        };

        self.set_downloading(model_id, true);

        let result = self
            .download_to_partial(&model_info, &partial_path, &mut resume_from, &on_progress)
            .await;

        if let Err(e) = result {
            self.set_downloading(model_id, false);
            return Err(e);
        }

        if let Some(expected) = &model_info.sha256 {
            let actual = sha256_file(&partial_path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = fs::remove_file(&partial_path);
                self.set_downloading(model_id, false);
                return Err(anyhow::anyhow!(
                    "Checksum mismatch for {}: expected {}, got {}",
                    model_id,
                    expected,
                    actual
                ));
            }
            info!("Checksum verified for {}", model_id);
        }

        // Install: extract directory models through a staging dir so an
        // interrupted extraction never looks like a complete model.
        let install_result = if model_info.kind == ModelKind::Directory {
            self.extract_archive(&model_info, &partial_path, &model_path)
        } else {
            fs::rename(&partial_path, &model_path).map_err(Into::into)
        };

        self.set_downloading(model_id, false);
        install_result?;
        self.update_download_status()?;

        info!("Model {} installed at {:?}", model_id, model_path);
        Ok(())
    }

    async fn download_to_partial(
        &self,
        model_info: &ModelInfo,
        partial_path: &Path,
        resume_from: &mut u64,
        on_progress: &impl Fn(DownloadProgress),
    ) -> Result<()> {
        let mut request = self.client.get(&model_info.url);
        if *resume_from > 0 {
            request = request.header("Range", format!("bytes={}-", resume_from));
        }

        let mut response = request.send().await?;

        // A 200 answer to a ranged request means the server ignored the
        // range; restart fresh rather than appending a full file to the
        // partial one.
        if *resume_from > 0 && response.status() == reqwest::StatusCode::OK {
            warn!(
                "Server does not support range requests for {}, restarting download",
                model_info.id
            );
            drop(response);
            let _ = fs::remove_file(partial_path);
            *resume_from = 0;
            response = self.client.get(&model_info.url).send().await?;
        }

        if !response.status().is_success()
            && response.status() != reqwest::StatusCode::PARTIAL_CONTENT
        {
            return Err(anyhow::anyhow!(
                "Failed to download model: HTTP {}",
                response.status()
            ));
        }

        let total_size = *resume_from + response.content_length().unwrap_or(0);
        let mut downloaded = *resume_from;
        let mut stream = response.bytes_stream();

        let mut file = if *resume_from > 0 {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(partial_path)?
        } else {
            File::create(partial_path)?
        };

        let mut last_log = std::time::Instant::now();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;

            let percentage = if total_size > 0 {
                (downloaded as f64 / total_size as f64) * 100.0
            } else {
                0.0
            };

            if last_log.elapsed().as_secs() >= 5 {
                info!(
                    "Download progress for {}: {} / {} bytes ({:.1}%)",
                    model_info.id, downloaded, total_size, percentage
                );
                last_log = std::time::Instant::now();
            }

            on_progress(DownloadProgress {
                model_id: model_info.id.clone(),
                downloaded,
                total: total_size,
                percentage,
            });
        }

        file.flush()?;
        drop(file);

        if total_size > 0 {
            let actual_size = partial_path.metadata()?.len();
            if actual_size != total_size {
                let _ = fs::remove_file(partial_path);
                return Err(anyhow::anyhow!(
                    "Download incomplete: expected {} bytes, got {} bytes",
                    total_size,
                    actual_size
                ));
            }
        }

        Ok(())
    }

    fn extract_archive(
        &self,
        model_info: &ModelInfo,
        archive_path: &Path,
        final_dir: &Path,
    ) -> Result<()> {
        let staging_dir = self
            .models_dir
            .join(format!("{}.extracting", &model_info.filename));

        if staging_dir.exists() {
            let _ = fs::remove_dir_all(&staging_dir);
        }
        fs::create_dir_all(&staging_dir)?;

        info!("Extracting archive for model {}", model_info.id);
        let tar_gz = File::open(archive_path)?;
        let tar = GzDecoder::new(tar_gz);
        let mut archive = Archive::new(tar);
        archive.unpack(&staging_dir).map_err(|e| {
            let _ = fs::remove_dir_all(&staging_dir);
            anyhow::anyhow!("Failed to extract archive: {}", e)
        })?;

        // Archives may wrap everything in a single top-level directory.
        let extracted_dirs: Vec<_> = fs::read_dir(&staging_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .collect();

        if final_dir.exists() {
            fs::remove_dir_all(final_dir)?;
        }

        if extracted_dirs.len() == 1 {
            fs::rename(extracted_dirs[0].path(), final_dir)?;
            let _ = fs::remove_dir_all(&staging_dir);
        } else {
            fs::rename(&staging_dir, final_dir)?;
        }

        let _ = fs::remove_file(archive_path);
        Ok(())
    }

    /// Removes an installed model from disk.
    pub fn delete_model(&self, model_id: &str) -> Result<()> {
        let info = self
            .get_model_info(model_id)
            .ok_or_else(|| anyhow::anyhow!("Model not found: {}", model_id))?;

        let model_path = self.models_dir.join(&info.filename);
        if model_path.exists() {
            if info.kind == ModelKind::Directory {
                fs::remove_dir_all(&model_path)?;
            } else {
                fs::remove_file(&model_path)?;
            }
            info!("Deleted model {}", model_id);
        }

        self.update_download_status()
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_reports_missing_models() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(dir.path()).unwrap();

        assert!(!manager.is_model_available("whisper-small"));
        assert!(!manager.is_model_available("no-such-model"));
        assert!(manager.get_model_info("whisper-small").is_some());
    }

    #[test]
    fn detects_installed_file_model() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ggml-small.bin"), b"weights").unwrap();
        let manager = ModelManager::new(dir.path()).unwrap();

        assert!(manager.is_model_available("whisper-small"));
        assert_eq!(
            manager.get_model_path("whisper-small").unwrap(),
            dir.path().join("ggml-small.bin")
        );
    }

    #[test]
    fn partial_file_reports_resume_offset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ggml-small.bin.partial"), vec![0u8; 1234]).unwrap();
        let manager = ModelManager::new(dir.path()).unwrap();

        let info = manager.get_model_info("whisper-small").unwrap();
        assert!(!info.is_downloaded);
        assert_eq!(info.partial_size, 1234);
    }

    #[test]
    fn directory_model_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        // A stray file with the directory model's name does not count.
        std::fs::write(dir.path().join("parakeet-tdt-0.6b-v3-int8"), b"x").unwrap();
        let manager = ModelManager::new(dir.path()).unwrap();
        assert!(!manager.is_model_available("parakeet-v3"));
    }

    #[test]
    fn interrupted_extraction_is_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("parakeet-tdt-0.6b-v3-int8.extracting");
        std::fs::create_dir_all(&staging).unwrap();

        let _manager = ModelManager::new(dir.path()).unwrap();
        assert!(!staging.exists());
    }

    #[test]
    fn sha256_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
