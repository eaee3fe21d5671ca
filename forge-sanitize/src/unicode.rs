//! Unicode normalization sanitizer

use crate::{SanitizeOutcome, Sanitizer};
use unicode_normalization::UnicodeNormalization;

/// Zero-width characters abused for keyword splitting and hidden payloads.
fn is_zero_width(c: char) -> bool {
    matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}')
}

/// C0/C1 control characters, minus the whitespace we keep.
fn is_stripped_control(c: char) -> bool {
    c.is_control() && !matches!(c, '\t' | '\n' | '\r')
}

/// Normalizes text to NFC and strips control and zero-width characters.
/// Idempotent and never rejects: attackers use alternative encodings to slip
/// past downstream detectors, so this runs first.
///
/// NFC rather than NFKC: NFKC folds fullwidth forms to ASCII, which rewrites
/// CJK punctuation and changes meaning inside LLM context.
pub struct UnicodeNormalizer;

impl UnicodeNormalizer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UnicodeNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sanitizer for UnicodeNormalizer {
    fn name(&self) -> &str {
        "unicode_normalizer"
    }

    fn sanitize(&self, content: &str) -> Result<SanitizeOutcome, String> {
        if content.is_empty() {
            return Ok(SanitizeOutcome::pass(""));
        }

        let normalized: String = content
            .nfc()
            .filter(|c| !is_stripped_control(*c) && !is_zero_width(*c))
            .collect();

        let original_chars = content.chars().count();
        let normalized_chars = normalized.chars().count();
        let removed = original_chars.saturating_sub(normalized_chars);

        let mut outcome = SanitizeOutcome::pass(normalized)
            .with_metadata("original_chars", serde_json::json!(original_chars))
            .with_metadata("normalized_chars", serde_json::json!(normalized_chars));
        if removed > 0 {
            outcome = outcome
                .with_metadata("chars_removed", serde_json::json!(removed))
                .with_warning(format!("normalization removed {removed} characters"));
        }
        Ok(outcome)
    }
}
