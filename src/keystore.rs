use crate::error::TranscribeError;
use crate::settings::SettingsStore;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const KEY_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Resolves provider credentials from the settings store.
///
/// Caches resolved keys for a short TTL so repeated pipeline invocations do
/// not hit the settings file on every provider attempt. Not a security
/// boundary: keys live in the local plaintext settings either way, this only
/// adds caching and uniform error reporting.
pub struct ProviderKeyStore {
    settings: Arc<SettingsStore>,
    cache: Mutex<HashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl ProviderKeyStore {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            settings,
            cache: Mutex::new(HashMap::new()),
            ttl: KEY_CACHE_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(settings: Arc<SettingsStore>, ttl: Duration) -> Self {
        Self {
            settings,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get_key(&self, provider_id: &str) -> Result<String, TranscribeError> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some((key, stored_at)) = cache.get(provider_id) {
                if stored_at.elapsed() < self.ttl {
                    return Ok(key.clone());
                }
            }
        }

        let settings = self.settings.get();
        let key = settings
            .api_keys
            .get(provider_id)
            .filter(|k| !k.trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                TranscribeError::Configuration(format!(
                    "no API key configured for provider '{}'",
                    provider_id
                ))
            })?;

        debug!("Resolved API key for provider '{}' (cached for {:?})", provider_id, self.ttl);
        self.cache
            .lock()
            .unwrap()
            .insert(provider_id.to_string(), (key.clone(), Instant::now()));

        Ok(key)
    }

    /// Drops all cached keys, forcing re-resolution on next use. Called when
    /// the settings UI saves new credentials.
    pub fn invalidate(&self) {
        self.cache.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsStore;

    fn store_with_key(provider: &str, key: &str) -> Arc<SettingsStore> {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load_or_create(dir.path().join("settings.json")).unwrap();
        let mut settings = store.get();
        settings.api_keys.insert(provider.to_string(), key.to_string());
        store.write(settings).unwrap();
        // Leak the tempdir so the file survives for the test duration.
        std::mem::forget(dir);
        Arc::new(store)
    }

    #[test]
    fn resolves_and_caches() {
        let keystore = ProviderKeyStore::new(store_with_key("openai", "sk-abc"));
        assert_eq!(keystore.get_key("openai").unwrap(), "sk-abc");
        assert_eq!(keystore.get_key("openai").unwrap(), "sk-abc");
    }

    #[test]
    fn missing_key_is_configuration_error() {
        let keystore = ProviderKeyStore::new(store_with_key("openai", "sk-abc"));
        let err = keystore.get_key("deepgram").unwrap_err();
        assert!(matches!(err, TranscribeError::Configuration(_)));
    }

    #[test]
    fn expired_entries_are_refreshed() {
        let settings = store_with_key("openai", "sk-abc");
        let keystore = ProviderKeyStore::with_ttl(settings.clone(), Duration::ZERO);

        assert_eq!(keystore.get_key("openai").unwrap(), "sk-abc");

        let mut updated = settings.get();
        updated.api_keys.insert("openai".into(), "sk-new".into());
        settings.write(updated).unwrap();

        // TTL of zero means the cached entry is already stale.
        assert_eq!(keystore.get_key("openai").unwrap(), "sk-new");
    }

    #[test]
    fn blank_key_counts_as_unset() {
        let keystore = ProviderKeyStore::new(store_with_key("openai", "   "));
        assert!(matches!(
            keystore.get_key("openai"),
            Err(TranscribeError::Configuration(_))
        ));
    }
}
