use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One cloud transcription backend as the user configured it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CloudProviderConfig {
    pub id: String,
    pub label: String,
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub enabled: bool,
}

/// Endpoint used by the text cleanup stage (OpenAI-compatible chat API).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CleanupEndpoint {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppSettings {
    #[serde(default = "default_selected_language")]
    pub selected_language: String,
    #[serde(default = "default_wake_word")]
    pub wake_word: String,

    /// Domain terms forwarded to providers as recognition bias and used for
    /// fuzzy post-correction.
    #[serde(default)]
    pub dictionary_words: Vec<String>,
    #[serde(default = "default_word_correction_threshold")]
    pub word_correction_threshold: f64,

    /// Prefer the on-device model before any cloud provider.
    #[serde(default)]
    pub use_local_model: bool,
    #[serde(default = "default_local_model")]
    pub selected_model: String,
    /// Local inference server (whisperfile-style, OpenAI-compatible).
    #[serde(default = "default_local_server_url")]
    pub local_server_url: String,

    #[serde(default = "default_cleanup_enabled")]
    pub cleanup_enabled: bool,
    #[serde(default)]
    pub cleanup_local: Option<CleanupEndpoint>,
    #[serde(default)]
    pub cleanup_cloud: Option<CleanupEndpoint>,

    /// Latency-optimized providers for short clips, in fallback order.
    #[serde(default = "default_fast_providers")]
    pub fast_providers: Vec<CloudProviderConfig>,
    /// Accuracy-optimized providers for long clips, in fallback order.
    #[serde(default = "default_accurate_providers")]
    pub accurate_providers: Vec<CloudProviderConfig>,

    /// Provider id -> API key. Local plaintext, same trust model as the
    /// settings file itself.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

fn default_selected_language() -> String {
    "auto".to_string()
}

fn default_wake_word() -> String {
    "jarvis".to_string()
}

fn default_word_correction_threshold() -> f64 {
    0.18
}

fn default_local_model() -> String {
    "".to_string()
}

fn default_local_server_url() -> String {
    "http://127.0.0.1:8178/v1".to_string()
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_fast_providers() -> Vec<CloudProviderConfig> {
    vec![
        CloudProviderConfig {
            id: "groq".to_string(),
            label: "Groq Whisper".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "whisper-large-v3-turbo".to_string(),
            enabled: true,
        },
        CloudProviderConfig {
            id: "openai".to_string(),
            label: "OpenAI Whisper".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "whisper-1".to_string(),
            enabled: true,
        },
    ]
}

fn default_accurate_providers() -> Vec<CloudProviderConfig> {
    vec![
        CloudProviderConfig {
            id: "gemini".to_string(),
            label: "Gemini".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai/".to_string(),
            model: "gemini-2.0-flash".to_string(),
            enabled: true,
        },
        CloudProviderConfig {
            id: "openai".to_string(),
            label: "OpenAI Whisper".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "whisper-1".to_string(),
            enabled: true,
        },
    ]
}

pub fn get_default_settings() -> AppSettings {
    AppSettings {
        selected_language: default_selected_language(),
        wake_word: default_wake_word(),
        dictionary_words: Vec::new(),
        word_correction_threshold: default_word_correction_threshold(),
        use_local_model: false,
        selected_model: default_local_model(),
        local_server_url: default_local_server_url(),
        cleanup_enabled: default_cleanup_enabled(),
        cleanup_local: None,
        cleanup_cloud: None,
        fast_providers: default_fast_providers(),
        accurate_providers: default_accurate_providers(),
        api_keys: HashMap::new(),
    }
}

/// JSON-file backed settings store.
///
/// Constructed once at application start and passed by reference into the
/// pipeline. The pipeline only reads; writes come from the settings UI
/// which is out of scope here.
pub struct SettingsStore {
    path: PathBuf,
    cached: Mutex<AppSettings>,
}

impl SettingsStore {
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let settings = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str::<AppSettings>(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Failed to parse settings, falling back to defaults: {}", e);
                    get_default_settings()
                }
            }
        } else {
            let defaults = get_default_settings();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, serde_json::to_string_pretty(&defaults)?)?;
            defaults
        };

        Ok(Self {
            path,
            cached: Mutex::new(settings),
        })
    }

    /// In-memory snapshot of the current settings.
    pub fn get(&self) -> AppSettings {
        self.cached.lock().unwrap().clone()
    }

    pub fn write(&self, settings: AppSettings) -> Result<()> {
        fs::write(&self.path, serde_json::to_string_pretty(&settings)?)?;
        *self.cached.lock().unwrap() = settings;
        Ok(())
    }

    /// Re-reads the settings file, refreshing the in-memory snapshot.
    pub fn reload(&self) -> Result<AppSettings> {
        let raw = fs::read_to_string(&self.path)?;
        let settings: AppSettings = serde_json::from_str(&raw)?;
        *self.cached.lock().unwrap() = settings.clone();
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::load_or_create(&path).unwrap();

        let settings = store.get();
        assert_eq!(settings.selected_language, "auto");
        assert_eq!(settings.wake_word, "jarvis");
        assert!(settings.cleanup_enabled);
        assert!(path.exists());
    }

    #[test]
    fn round_trips_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::load_or_create(&path).unwrap();

        let mut settings = store.get();
        settings.use_local_model = true;
        settings.api_keys.insert("openai".into(), "sk-test".into());
        store.write(settings).unwrap();

        let reopened = SettingsStore::load_or_create(&path).unwrap();
        let settings = reopened.get();
        assert!(settings.use_local_model);
        assert_eq!(settings.api_keys.get("openai").unwrap(), "sk-test");
    }
}
