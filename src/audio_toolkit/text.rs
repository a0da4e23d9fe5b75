use natural::phonetics::soundex;
use once_cell::sync::Lazy;
use regex::Regex;
use strsim::levenshtein;

/// Non-speech annotations some engines emit for silence or background noise,
/// e.g. `[BLANK_AUDIO]`, `(music)`, `[inaudible]`.
static NOISE_MARKERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)|\*[^*]*\*").unwrap());

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Removes bracketed/parenthetical noise markers and normalizes whitespace.
///
/// An empty result means the provider produced only silence markers; the
/// orchestrator treats that as "no transcript generated", not as an empty
/// success.
pub fn strip_noise_markers(text: &str) -> String {
    let stripped = NOISE_MARKERS.replace_all(text, " ");
    WHITESPACE.replace_all(stripped.trim(), " ").to_string()
}

/// Strict positional wake-word check: the wake word must appear within the
/// first three punctuation-stripped words. A mention later in dictation text
/// must not reclassify it as an assistant request.
pub fn is_assistant_request(text: &str, wake_word: &str) -> bool {
    let wake_word = wake_word.trim().to_lowercase();
    if wake_word.is_empty() {
        return false;
    }

    text.split_whitespace()
        .take(3)
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .any(|w| w == wake_word)
}

/// Heuristic used by the smart-skip optimization: text that already starts
/// uppercase and ends with terminal punctuation is assumed formatted.
pub fn looks_formatted(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }

    let starts_upper = trimmed
        .chars()
        .find(|c| c.is_alphabetic())
        .map(|c| c.is_uppercase())
        .unwrap_or(false);
    let ends_terminal = trimmed
        .chars()
        .last()
        .map(|c| matches!(c, '.' | '!' | '?' | '…'))
        .unwrap_or(false);

    starts_upper && ends_terminal
}

/// Corrects transcribed words against the user's dictionary hints using
/// Levenshtein distance combined with Soundex phonetic matching.
///
/// `threshold` is the maximum combined score to accept (0.0 = exact match
/// only). Phonetic matches get a significant boost since misrecognized
/// domain terms usually sound like the intended word.
pub fn apply_custom_words(text: &str, custom_words: &[String], threshold: f64) -> String {
    if custom_words.is_empty() {
        return text.to_string();
    }

    let custom_lower: Vec<String> = custom_words.iter().map(|w| w.to_lowercase()).collect();
    let mut corrected = Vec::new();

    for word in text.split_whitespace() {
        let cleaned = word
            .trim_matches(|c: char| !c.is_alphabetic())
            .to_lowercase();

        if cleaned.is_empty() || cleaned.len() > 50 {
            corrected.push(word.to_string());
            continue;
        }

        let mut best: Option<(&String, f64)> = None;
        for (i, candidate) in custom_lower.iter().enumerate() {
            let len_diff = (cleaned.len() as i64 - candidate.len() as i64).abs();
            if len_diff > 5 {
                continue;
            }

            let max_len = cleaned.len().max(candidate.len()) as f64;
            let lev_score = if max_len > 0.0 {
                levenshtein(&cleaned, candidate) as f64 / max_len
            } else {
                1.0
            };

            let score = if soundex(&cleaned, candidate) {
                lev_score * 0.3
            } else {
                lev_score
            };

            if score < threshold && best.map(|(_, s)| score < s).unwrap_or(true) {
                best = Some((&custom_words[i], score));
            }
        }

        match best {
            Some((replacement, _)) => {
                let (prefix, suffix) = surrounding_punctuation(word);
                corrected.push(format!(
                    "{}{}{}",
                    prefix,
                    match_case(word, replacement),
                    suffix
                ));
            }
            None => corrected.push(word.to_string()),
        }
    }

    corrected.join(" ")
}

fn match_case(original: &str, replacement: &str) -> String {
    if original.chars().all(|c| c.is_uppercase()) {
        replacement.to_uppercase()
    } else if original.chars().next().map_or(false, |c| c.is_uppercase()) {
        let mut chars: Vec<char> = replacement.chars().collect();
        if let Some(first) = chars.get_mut(0) {
            *first = first.to_uppercase().next().unwrap_or(*first);
        }
        chars.into_iter().collect()
    } else {
        replacement.to_string()
    }
}

fn surrounding_punctuation(word: &str) -> (&str, &str) {
    // Byte offsets, not char counts: quotes and guillemets are multibyte.
    let Some(prefix_end) = word
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(i, _)| i)
    else {
        return ("", "");
    };

    let suffix_start = word
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(word.len());

    (&word[..prefix_end], &word[suffix_start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_only_transcript_becomes_empty() {
        assert_eq!(strip_noise_markers("[BLANK_AUDIO]"), "");
        assert_eq!(strip_noise_markers(" (music) [inaudible] "), "");
    }

    #[test]
    fn noise_markers_stripped_from_speech() {
        assert_eq!(
            strip_noise_markers("hello [cough] there (laughs) friend"),
            "hello there friend"
        );
    }

    #[test]
    fn wake_word_in_first_three_words() {
        assert!(is_assistant_request("Jarvis can you help me", "jarvis"));
        assert!(is_assistant_request("hey there jarvis, what time is it", "jarvis"));
        assert!(!is_assistant_request(
            "I was talking about jarvis yesterday and need help",
            "jarvis"
        ));
        assert!(!is_assistant_request("no trigger here", "jarvis"));
    }

    #[test]
    fn wake_word_ignores_punctuation() {
        assert!(is_assistant_request("Jarvis, open the file", "jarvis"));
    }

    #[test]
    fn formatted_text_detection() {
        assert!(looks_formatted("This is done."));
        assert!(looks_formatted("Really?"));
        assert!(!looks_formatted("this is done."));
        assert!(!looks_formatted("This is not done"));
        assert!(!looks_formatted("   "));
    }

    #[test]
    fn custom_words_fuzzy_match() {
        let hints = vec!["Kubernetes".to_string()];
        assert_eq!(
            apply_custom_words("deploy to cubernetes now", &hints, 0.3),
            "deploy to Kubernetes now"
        );
    }

    #[test]
    fn custom_words_preserve_punctuation_and_case() {
        let hints = vec!["grafana".to_string()];
        assert_eq!(
            apply_custom_words("Open Grafana, please", &hints, 0.3),
            "Open Grafana, please"
        );
    }

    #[test]
    fn multibyte_punctuation_is_preserved() {
        let hints = vec!["Grafana".to_string()];
        assert_eq!(
            apply_custom_words("open \u{201C}grafana\u{201D} now", &hints, 0.3),
            "open \u{201C}Grafana\u{201D} now"
        );
        assert_eq!(
            apply_custom_words("\u{00AB}grafana\u{00BB}", &hints, 0.3),
            "\u{00AB}Grafana\u{00BB}"
        );
    }

    #[test]
    fn empty_hints_are_a_no_op() {
        assert_eq!(apply_custom_words("hello world", &[], 0.3), "hello world");
    }
}
