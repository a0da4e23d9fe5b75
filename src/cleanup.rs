use crate::keystore::ProviderKeyStore;
use crate::settings::{CleanupEndpoint, SettingsStore};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Instructions sent to the cleanup model. The filler list is closed on
/// purpose: an open-ended "remove fillers" instruction invites the model to
/// drop hedge words the speaker actually meant.
const CLEANUP_PROMPT: &str = "You are a dictation cleanup assistant. Rewrite the transcript below applying ONLY these edits:\n\
- Remove filler words, exactly these and no others: um, uh, er, ah, hmm, you know, I mean, sort of, kind of, like (only when clearly a filler).\n\
- Collapse self-corrections, keeping the speaker's final choice (\"send it Monday, no wait, Tuesday\" becomes \"send it Tuesday\").\n\
- Convert spoken file extensions: \"dot\" followed by a file extension becomes a period (\"readme dot md\" becomes \"readme.md\").\n\
- Replace spoken emoji descriptions with the emoji itself (\"thumbs up emoji\" becomes \"\u{1F44D}\").\n\
- Fix obvious punctuation and capitalization.\n\
Never add content. Never summarize. Never change a sign-off or signature (for example \"Best, Alex\") in any way.\n\
Return only the cleaned text with no commentary.";

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CleanupResult {
    pub text: String,
    /// True when the model altered the sign-off and the original one was
    /// spliced back in.
    pub signature_guard_triggered: bool,
}

/// Email-style sign-off at the end of a text: a closing phrase, optional
/// comma, then a capitalized name of up to four words. The closing phrase
/// matches case-insensitively; the name must be capitalized.
static SIGNATURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)(?i:best regards|warm regards|kind regards|best wishes|thank you|regards|best|thanks|sincerely|cheers)\s*,?\s+([A-Z][A-Za-z.'-]*(?:[ \t]+[A-Z][A-Za-z.'-]*){0,3})[ \t]*$",
    )
    .unwrap()
});

struct SignatureMatch {
    start: usize,
    text: String,
}

fn find_signature(text: &str) -> Option<SignatureMatch> {
    SIGNATURE.find_iter(text.trim_end()).last().map(|m| SignatureMatch {
        start: m.start(),
        text: m.as_str().to_string(),
    })
}

/// Content-level normalization for comparing signatures: case, punctuation
/// and line breaks are presentation, the closing phrase and name are content.
fn normalize_signature(sig: &str) -> String {
    sig.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Restores the original sign-off when the cleanup model changed or dropped
/// it. Pure reformatting (say, moving the name onto its own line) passes
/// through untouched.
fn guard_signature(original: &str, cleaned: &str) -> (String, bool) {
    let Some(original_sig) = find_signature(original) else {
        return (cleaned.to_string(), false);
    };

    match find_signature(cleaned) {
        Some(cleaned_sig)
            if normalize_signature(&cleaned_sig.text)
                == normalize_signature(&original_sig.text) =>
        {
            (cleaned.to_string(), false)
        }
        Some(cleaned_sig) => {
            let mut restored = cleaned[..cleaned_sig.start].to_string();
            restored.push_str(&original_sig.text);
            (restored, true)
        }
        None => {
            let mut restored = cleaned.trim_end().to_string();
            restored.push('\n');
            restored.push_str(&original_sig.text);
            (restored, true)
        }
    }
}

/// LLM-backed transcript cleanup.
///
/// Best-effort by contract: any endpoint failure degrades to the raw
/// transcript instead of failing the pipeline. A local OpenAI-compatible
/// endpoint is preferred over the cloud one when both are configured.
pub struct TextCleanupStage {
    settings: Arc<SettingsStore>,
    keys: Arc<ProviderKeyStore>,
    client: reqwest::Client,
}

impl TextCleanupStage {
    pub fn new(settings: Arc<SettingsStore>, keys: Arc<ProviderKeyStore>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            settings,
            keys,
            client,
        }
    }

    /// Cleans `raw`, returning it unchanged when cleanup is disabled, no
    /// endpoint is configured, or every endpoint fails.
    pub async fn clean(&self, raw: &str) -> CleanupResult {
        let settings = self.settings.get();
        if !settings.cleanup_enabled || raw.trim().is_empty() {
            return CleanupResult {
                text: raw.to_string(),
                signature_guard_triggered: false,
            };
        }

        let endpoints: Vec<&CleanupEndpoint> = settings
            .cleanup_local
            .iter()
            .chain(settings.cleanup_cloud.iter())
            .collect();

        for endpoint in endpoints {
            match self.clean_via(endpoint, raw).await {
                Ok(cleaned) => {
                    let (text, guard_triggered) = guard_signature(raw, &cleaned);
                    if guard_triggered {
                        info!("Cleanup altered the sign-off, restored the original");
                    }
                    return CleanupResult {
                        text,
                        signature_guard_triggered: guard_triggered,
                    };
                }
                Err(e) => {
                    warn!(
                        "Cleanup endpoint {} failed, trying next: {}",
                        endpoint.base_url, e
                    );
                }
            }
        }

        debug!("No cleanup endpoint succeeded, returning raw transcript");
        CleanupResult {
            text: raw.to_string(),
            signature_guard_triggered: false,
        }
    }

    async fn clean_via(&self, endpoint: &CleanupEndpoint, raw: &str) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: endpoint.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: CLEANUP_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: raw.to_string(),
                },
            ],
            temperature: 0.1,
        };

        let url = format!(
            "{}/chat/completions",
            endpoint.base_url.trim_end_matches('/')
        );

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key_id) = &endpoint.api_key_id {
            builder = builder.bearer_auth(self.keys.get_key(key_id)?);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("cleanup endpoint returned HTTP {}", status);
        }

        let parsed: ChatResponse = response.json().await?;
        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("cleanup endpoint returned no content"))?;

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changed_signature_is_restored() {
        let original = "Please review the attached file. Best, Akshay";
        let cleaned = "Please review the attached file. Regards, Akshay";

        let (text, triggered) = guard_signature(original, cleaned);
        assert!(triggered);
        assert!(text.ends_with("Best, Akshay"), "got: {}", text);
    }

    #[test]
    fn changed_name_is_restored() {
        let original = "See you tomorrow. Cheers, Maria";
        let cleaned = "See you tomorrow. Cheers, Mary";

        let (text, triggered) = guard_signature(original, cleaned);
        assert!(triggered);
        assert!(text.ends_with("Cheers, Maria"));
    }

    #[test]
    fn reformatted_signature_is_accepted() {
        let original = "Thanks for the update. Best, Akshay";
        let cleaned = "Thanks for the update.\n\nBest,\nAkshay";

        let (text, triggered) = guard_signature(original, cleaned);
        assert!(!triggered);
        assert_eq!(text, cleaned);
    }

    #[test]
    fn dropped_signature_is_appended() {
        let original = "Sending the report now. Sincerely, Jordan Lee";
        let cleaned = "Sending the report now.";

        let (text, triggered) = guard_signature(original, cleaned);
        assert!(triggered);
        assert!(text.ends_with("Sincerely, Jordan Lee"));
    }

    #[test]
    fn text_without_signature_passes_through() {
        let original = "just a quick note about the meeting";
        let cleaned = "Just a quick note about the meeting.";

        let (text, triggered) = guard_signature(original, cleaned);
        assert!(!triggered);
        assert_eq!(text, cleaned);
    }

    #[test]
    fn multi_word_closing_is_matched() {
        let sig = find_signature("Talk soon. Best regards, Akshay Kumar").unwrap();
        assert_eq!(sig.text, "Best regards, Akshay Kumar");
    }

    #[test]
    fn lowercase_name_is_not_a_signature() {
        // "best, whatever" mid-sentence should not arm the guard.
        assert!(find_signature("this is the best, really").is_none());
    }

    #[test]
    fn normalization_ignores_presentation() {
        assert_eq!(
            normalize_signature("Best,\nAkshay"),
            normalize_signature("best, akshay")
        );
        assert_ne!(
            normalize_signature("Best, Akshay"),
            normalize_signature("Regards, Akshay")
        );
    }
}
