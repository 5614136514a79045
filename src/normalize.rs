//! Text normalization and n-gram token streams
//!
//! Indexed text and queries go through the same two normalization levels:
//!
//! - **strict**: NFKC, lowercase, whitespace collapsed to single spaces.
//!   Punctuation is kept, so `pop-ups` and `popups` differ.
//! - **loose**: NFKD with combining marks removed, lowercase, and only
//!   alphanumeric characters kept. `Café Pop-Ups` and `cafe popups` agree.
//!
//! Either form is decomposed into overlapping character trigrams. Each trigram
//! is written to the full-text index as an opaque alphanumeric word (`g` + hex
//! of its UTF-8 bytes) so the SQLite tokenizer never splits or folds it. A
//! substring of the source text therefore appears as a run of consecutive
//! tokens, which lets an FTS phrase query act as a substring query.

use std::collections::HashSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Characters per n-gram
pub const GRAM_SIZE: usize = 3;

/// Strict canonical form
pub fn strict(text: &str) -> String {
    let lowered: String = text.nfkc().flat_map(char::to_lowercase).collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Diacritic-, width- and punctuation-insensitive form
pub fn loose(text: &str) -> String {
    text.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Overlapping character n-grams of already-normalized text, in order
///
/// Text shorter than `GRAM_SIZE` characters yields nothing.
pub fn grams(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < GRAM_SIZE {
        return Vec::new();
    }
    chars.windows(GRAM_SIZE).map(|w| w.iter().collect()).collect()
}

/// Distinct n-grams, keeping first-occurrence order
pub fn unique_grams(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    grams(text)
        .into_iter()
        .filter(|g| seen.insert(g.clone()))
        .collect()
}

/// Encode one n-gram as a tokenizer-safe word
pub fn encode_gram(gram: &str) -> String {
    let mut token = String::with_capacity(1 + gram.len() * 2);
    token.push('g');
    for byte in gram.as_bytes() {
        token.push_str(&format!("{:02x}", byte));
    }
    token
}

/// Full token stream for one indexed column
pub fn gram_tokens(normalized: &str) -> String {
    grams(normalized)
        .iter()
        .map(|g| encode_gram(g))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Share of `query` n-grams that also occur in `text` (both normalized the same way)
pub fn gram_overlap(query: &str, text: &str) -> f64 {
    let query_grams = unique_grams(query);
    if query_grams.is_empty() {
        return 0.0;
    }
    let text_grams: HashSet<String> = grams(text).into_iter().collect();
    let shared = query_grams.iter().filter(|g| text_grams.contains(*g)).count();
    shared as f64 / query_grams.len() as f64
}

/// CJK ideographs, kana and hangul
pub fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF      // Hiragana, Katakana
        | 0x3400..=0x4DBF    // CJK Extension A
        | 0x4E00..=0x9FFF    // CJK Unified Ideographs
        | 0xAC00..=0xD7AF    // Hangul syllables
        | 0xF900..=0xFAFF    // CJK Compatibility Ideographs
        | 0x20000..=0x2FA1F) // Extensions B+
}

/// True if `needle` occurs in `haystack` with no alphanumeric character
/// directly before or after it. CJK text has no word separators, so any
/// occurrence next to a CJK character counts as a boundary.
pub fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let boundary = |c: Option<char>| match c {
        None => true,
        Some(c) => !c.is_alphanumeric() || is_cjk(c),
    };
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        let start = from + pos;
        let end = start + needle.len();
        let before = haystack[..start].chars().next_back();
        let after = haystack[end..].chars().next();
        let needle_starts_cjk = needle.chars().next().is_some_and(is_cjk);
        let needle_ends_cjk = needle.chars().next_back().is_some_and(is_cjk);
        if (needle_starts_cjk || boundary(before)) && (needle_ends_cjk || boundary(after)) {
            return true;
        }
        // Advance past the first char of this match
        from = start + haystack[start..].chars().next().map_or(1, char::len_utf8);
    }
    false
}
