//! N-gram Jaccard similarity
//!
//! Shared by the dedup compressor and the rerank stage. Word n-grams for
//! text with whitespace, character n-grams as the fallback so CJK text
//! without spaces still compares meaningfully.

use std::collections::HashSet;

/// Default n-gram width.
pub const DEFAULT_NGRAM: usize = 2;

/// Build the n-gram set for a text. Word-level when the text has at least
/// `n` words, character-level otherwise.
pub fn ngram_set(text: &str, n: usize) -> HashSet<String> {
    let n = n.max(1);
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut grams = HashSet::new();

    if words.len() >= n {
        for window in words.windows(n) {
            grams.insert(window.join(" ").to_lowercase());
        }
    } else {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() >= n {
            for window in chars.windows(n) {
                grams.insert(window.iter().collect::<String>().to_lowercase());
            }
        } else if !chars.is_empty() {
            grams.insert(text.to_lowercase());
        }
    }
    grams
}

/// Jaccard similarity of two n-gram sets: |A ∩ B| / |A ∪ B|.
/// Two empty sets are identical.
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Convenience: similarity of two texts with the default n-gram width.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    jaccard_similarity(&ngram_set(a, DEFAULT_NGRAM), &ngram_set(b, DEFAULT_NGRAM))
}
