//! Near-duplicate detection across chat turns
//!
//! Fragments are compared as sets of lowercased word tokens. [`ThreadMemory`] keeps, per
//! session, the paragraphs already sent, the last full response and the last fragment so a
//! later turn can suppress repeats.

use super::split_paragraphs;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock};

/// Jaccard similarity at or above which a fragment counts as a repeat
pub const DEFAULT_DEDUP_THRESHOLD: f64 = 0.85;

/// Paragraphs remembered per session by default
pub const DEFAULT_MEMORY_LIMIT: usize = 64;

static WORD_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").unwrap());

/// Lowercased `\w+` tokens of `text`
pub fn tokenize(text: &str) -> HashSet<String> {
    WORD_REGEX
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// |A ∩ B| / |A ∪ B|
///
/// Text without word tokens (`---`, `✅`) scores 0.0 against everything; only the exact-match
/// check can catch it repeating.
pub fn token_jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Token-set Jaccard similarity of two texts
pub fn jaccard(a: &str, b: &str) -> f64 {
    token_jaccard(&tokenize(a), &tokenize(b))
}

#[derive(Debug, Default)]
struct ThreadRecord {
    paragraphs: VecDeque<(String, HashSet<String>)>,
    last_response: Option<String>,
    last_fragment: Option<String>,
}

/// What previous turns of each session already sent
///
/// Cloning shares the underlying record, so one memory can back many bridge streams.
#[derive(Debug, Clone)]
pub struct ThreadMemory {
    threads: Arc<Mutex<HashMap<String, ThreadRecord>>>,
    limit: usize,
}

impl Default for ThreadMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_LIMIT)
    }
}

impl ThreadMemory {
    /// Memory keeping the newest `limit` paragraphs per session
    pub fn new(limit: usize) -> Self {
        Self {
            threads: Arc::new(Mutex::new(HashMap::new())),
            limit: limit.max(1),
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.threads.lock().contains_key(session_id)
    }

    /// Full text of the previous response, trimmed
    pub fn last_response(&self, session_id: &str) -> Option<String> {
        self.threads
            .lock()
            .get(session_id)
            .and_then(|record| record.last_response.clone())
    }

    /// Final fragment of the previous response
    pub fn last_fragment(&self, session_id: &str) -> Option<String> {
        self.threads
            .lock()
            .get(session_id)
            .and_then(|record| record.last_fragment.clone())
    }

    /// True when `response` is the previous turn's full text or its final fragment
    pub fn repeats_previous(&self, session_id: &str, response: &str) -> bool {
        let response = response.trim();
        self.threads.lock().get(session_id).is_some_and(|record| {
            record.last_response.as_deref() == Some(response)
                || record.last_fragment.as_deref() == Some(response)
        })
    }

    /// Record a previous response without any paragraphs, e.g. one restored from a checkpoint
    pub fn seed(&self, session_id: &str, response: &str) {
        let mut threads = self.threads.lock();
        let record = threads.entry(session_id.to_string()).or_default();
        record.last_response = Some(response.trim().to_string());
        record.last_fragment = split_paragraphs(response).pop();
    }

    /// True when `text` is at least `threshold` similar to a paragraph already sent
    pub fn is_near_duplicate(&self, session_id: &str, text: &str, threshold: f64) -> bool {
        let tokens = tokenize(text);
        self.threads.lock().get(session_id).is_some_and(|record| {
            record
                .paragraphs
                .iter()
                .any(|(_, seen)| token_jaccard(&tokens, seen) >= threshold)
        })
    }

    /// Store the paragraphs of a finished turn and, if any, its full response
    ///
    /// The last paragraph sent becomes the turn's final fragment. A turn that sent no
    /// paragraphs (streamed tokens, a placeholder) takes it from the response instead.
    pub fn remember<I>(&self, session_id: &str, paragraphs: I, response: Option<&str>)
    where
        I: IntoIterator<Item = String>,
    {
        let mut threads = self.threads.lock();
        let record = threads.entry(session_id.to_string()).or_default();

        let mut last = None;
        for paragraph in paragraphs {
            let tokens = tokenize(&paragraph);
            last = Some(paragraph.clone());
            record.paragraphs.push_back((paragraph, tokens));
        }
        let overflow = record.paragraphs.len().saturating_sub(self.limit);
        record.paragraphs.drain(..overflow);

        if let Some(response) = response {
            record.last_response = Some(response.trim().to_string());
        }
        if let Some(last) = last.or_else(|| response.and_then(|r| split_paragraphs(r).pop())) {
            record.last_fragment = Some(last);
        }
    }

    /// Paragraphs remembered for a session, oldest first
    pub fn paragraphs(&self, session_id: &str) -> Vec<String> {
        self.threads
            .lock()
            .get(session_id)
            .map(|record| record.paragraphs.iter().map(|(p, _)| p.clone()).collect())
            .unwrap_or_default()
    }

    pub fn forget(&self, session_id: &str) {
        self.threads.lock().remove(session_id);
    }

    /// Number of sessions tracked
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tokenize_lowercases_and_drops_punctuation() {
        let tokens = tokenize("Use eval(x)? NEVER use eval!");
        let expected: HashSet<String> = ["use", "eval", "x", "never"].iter().map(|s| s.to_string()).collect();
        assert_eq!(tokens, expected);
    }

    #[test]
    fn test_jaccard_values() {
        assert_eq!(jaccard("a b c", "a b c"), 1.0);
        assert_eq!(jaccard("a b", "c d"), 0.0);
        assert!((jaccard("a b c d", "a b c e") - 0.6).abs() < 1e-9);
        assert_eq!(jaccard("", "word"), 0.0);
        assert_eq!(jaccard("", "..."), 0.0);
        assert_eq!(jaccard("---", "---"), 0.0);
    }

    #[test]
    fn test_tokenless_paragraphs_are_not_near_duplicates() {
        let memory = ThreadMemory::default();
        memory.remember("t", vec!["---".to_string(), "✅".to_string()], None);

        assert!(!memory.is_near_duplicate("t", "❌", DEFAULT_DEDUP_THRESHOLD));
        assert!(!memory.is_near_duplicate("t", "***", DEFAULT_DEDUP_THRESHOLD));
        assert!(!memory.is_near_duplicate("t", "---", DEFAULT_DEDUP_THRESHOLD));
    }

    #[test]
    fn test_reordered_text_is_near_duplicate() {
        let memory = ThreadMemory::default();
        memory.remember(
            "t",
            vec!["The eval call on line 3 executes untrusted input.".to_string()],
            None,
        );

        assert!(memory.is_near_duplicate(
            "t",
            "Line 3: the eval call executes untrusted input",
            DEFAULT_DEDUP_THRESHOLD
        ));
        assert!(!memory.is_near_duplicate(
            "t",
            "Consider splitting the parser into smaller functions.",
            DEFAULT_DEDUP_THRESHOLD
        ));
        assert!(!memory.is_near_duplicate(
            "other",
            "The eval call on line 3 executes untrusted input.",
            DEFAULT_DEDUP_THRESHOLD
        ));
    }

    #[test]
    fn test_memory_bounded() {
        let memory = ThreadMemory::new(3);
        memory.remember("t", (0..5).map(|i| format!("paragraph {i}")), Some("  full text \n"));

        assert_eq!(memory.paragraphs("t"), vec!["paragraph 2", "paragraph 3", "paragraph 4"]);
        assert_eq!(memory.last_response("t").as_deref(), Some("full text"));
    }

    #[test]
    fn test_seed_and_forget() {
        let memory = ThreadMemory::default();
        assert!(!memory.contains("t"));

        memory.seed("t", "No issues found.\n");
        assert!(memory.contains("t"));
        assert_eq!(memory.last_response("t").as_deref(), Some("No issues found."));
        assert_eq!(memory.last_fragment("t").as_deref(), Some("No issues found."));
        assert!(memory.paragraphs("t").is_empty());

        memory.forget("t");
        assert!(memory.is_empty());
    }

    #[test]
    fn test_repeats_previous_full_text_or_final_fragment() {
        let memory = ThreadMemory::default();
        memory.remember(
            "t",
            vec!["Review complete.".to_string(), "No issues found.".to_string()],
            Some("Review complete.\n\nNo issues found."),
        );

        assert_eq!(memory.last_fragment("t").as_deref(), Some("No issues found."));
        assert!(memory.repeats_previous("t", "No issues found.\n"));
        assert!(memory.repeats_previous("t", "Review complete.\n\nNo issues found."));
        assert!(!memory.repeats_previous("t", "Review complete."));
        assert!(!memory.repeats_previous("other", "No issues found."));

        // A placeholder turn sends no paragraphs; its response decides the final fragment
        memory.remember("t", Vec::new(), Some("Still nothing.\n\nAll good."));
        assert_eq!(memory.last_fragment("t").as_deref(), Some("All good."));
    }

    #[test]
    fn test_clones_share_records() {
        let memory = ThreadMemory::default();
        let other = memory.clone();
        other.remember("t", vec!["shared".to_string()], Some("shared"));
        assert_eq!(memory.last_response("t").as_deref(), Some("shared"));
    }

    proptest! {
        #[test]
        fn prop_jaccard_bounded_and_symmetric(a in "[a-z ]{0,40}", b in "[a-z ]{0,40}") {
            let ab = jaccard(&a, &b);
            let ba = jaccard(&b, &a);
            prop_assert!((0.0..=1.0).contains(&ab));
            prop_assert!((ab - ba).abs() < 1e-12);
        }

        #[test]
        fn prop_text_is_duplicate_of_itself(words in proptest::collection::vec("[a-z]{1,8}", 1..12)) {
            let text = words.join(" ");
            let memory = ThreadMemory::default();
            memory.remember("t", vec![text.clone()], None);
            prop_assert!(memory.is_near_duplicate("t", &text.to_uppercase(), DEFAULT_DEDUP_THRESHOLD));
        }
    }
}
