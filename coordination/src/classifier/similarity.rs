//! Text similarity for error messages
//!
//! Messages are normalized before comparison so that volatile fragments
//! (line numbers, timestamps, byte counts, whitespace) do not hide repetition.

use regex::Regex;
use std::sync::LazyLock;

/// Longest prefix (in chars) that takes part in a comparison
const MAX_COMPARE_CHARS: usize = 512;

static DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Lowercase, collapse whitespace and replace digit runs with `#`.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    let replaced = DIGIT_RUN.replace_all(&collapsed, "#");
    replaced.chars().take(MAX_COMPARE_CHARS).collect()
}

/// Similarity in `[0.0, 1.0]` between two raw messages.
///
/// Normalized Levenshtein over the normalized forms; two empty messages are
/// identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize(a), &normalize(b))
}

/// Whether every pair in `messages` reaches `threshold`.
pub fn pairwise_similar<S: AsRef<str>>(messages: &[S], threshold: f64) -> bool {
    let normalized: Vec<String> = messages.iter().map(|m| normalize(m.as_ref())).collect();
    for (i, a) in normalized.iter().enumerate() {
        for b in &normalized[i + 1..] {
            if strsim::normalized_levenshtein(a, b) < threshold {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_masks_digits_and_whitespace() {
        assert_eq!(
            normalize("Error  at line 42:\n  Rate LIMIT"),
            "error at line #: rate limit"
        );
    }

    #[test]
    fn test_identical_messages() {
        assert_eq!(similarity("Rate limit exceeded", "Rate limit exceeded"), 1.0);
        assert_eq!(similarity("", ""), 1.0);
    }

    #[test]
    fn test_volatile_numbers_ignored() {
        let a = "Backtest 1893 failed: timeout after 300s";
        let b = "Backtest 2011 failed: timeout after 120s";
        assert_eq!(similarity(a, b), 1.0);
    }

    #[test]
    fn test_unrelated_messages_dissimilar() {
        let s = similarity("Insufficient credits", "IndentationError: unexpected indent");
        assert!(s < 0.5, "similarity was {s}");
    }

    #[test]
    fn test_pairwise_similar() {
        let msgs = [
            "API key invalid for project 1",
            "API key invalid for project 2",
            "API key invalid for project 33",
        ];
        assert!(pairwise_similar(&msgs, 0.8));

        let mixed = ["API key invalid", "API key invalid", "Disk space exhausted on /tmp"];
        assert!(!pairwise_similar(&mixed, 0.8));
    }

    #[test]
    fn test_long_messages_truncated() {
        let a = format!("{}{}", "x".repeat(600), "tail one");
        let b = format!("{}{}", "x".repeat(600), "different tail");
        assert_eq!(similarity(&a, &b), 1.0);
    }
}
