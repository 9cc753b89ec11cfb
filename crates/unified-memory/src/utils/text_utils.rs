//! Efficient text processing utilities

use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;
use std::collections::HashSet;

lazy_static! {
    static ref TOKEN_REGEX: Regex = Regex::new(r"[\p{L}\p{N}_]+").unwrap();
    static ref STOP_WORDS: HashSet<&'static str> = [
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
        "is", "am", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do",
        "does", "did", "it", "its", "this", "that", "these", "those", "as", "from", "we", "i",
        "you", "they", "he", "she", "so", "if", "then", "than", "into", "our", "your", "not",
    ]
    .into_iter()
    .collect();
}

pub struct TextUtils;

impl TextUtils {
    /// Lowercased word tokens with stop words and 1-character tokens removed.
    ///
    /// Splits on anything that is not a letter, digit or underscore, so
    /// `src/db.rs` yields `src`, `db`, `rs`.
    pub fn tokenize(text: &str) -> Vec<String> {
        TOKEN_REGEX
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .filter(|token| Self::is_significant_word(token, 2))
            .collect()
    }

    /// Truncate to at most `max_chars` characters, appending "..." when cut.
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            return Cow::Borrowed(text);
        }
        if max_chars <= 3 {
            return Cow::Borrowed("...");
        }
        let mut result: String = text.chars().take(max_chars - 3).collect();
        result.push_str("...");
        Cow::Owned(result)
    }

    /// Check if word is significant (not stop word, long enough)
    pub fn is_significant_word(word: &str, min_len: usize) -> bool {
        if word.chars().count() < min_len {
            return false;
        }
        !STOP_WORDS.contains(word.to_lowercase().as_str())
    }
}
