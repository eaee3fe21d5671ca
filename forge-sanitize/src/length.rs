//! Length and amplification guard

use crate::{SanitizeOutcome, Sanitizer};
use std::collections::HashMap;

/// Window size for the repetition detector.
const REPEAT_WINDOW: usize = 50;
/// Texts shorter than this skip repetition analysis.
const REPEAT_MIN_LEN: usize = 100;

/// Multi-dimensional length guard protecting the regex engine and downstream
/// consumers from amplification attacks: total chars, line count, longest
/// line, and a sliding-window repetition ratio.
///
/// On overflow, either truncates line-by-line (when configured) or rejects.
pub struct LengthGuard {
    max_chars: usize,
    max_lines: usize,
    max_line_chars: usize,
    max_repeat_ratio: f64,
    truncate_on_overflow: bool,
}

impl LengthGuard {
    pub fn new(
        max_chars: usize,
        max_lines: usize,
        max_line_chars: usize,
        max_repeat_ratio: f64,
        truncate_on_overflow: bool,
    ) -> Self {
        Self {
            max_chars,
            max_lines,
            max_line_chars,
            max_repeat_ratio: max_repeat_ratio.clamp(0.0, 1.0),
            truncate_on_overflow,
        }
    }

    /// Repeated characters over total characters, using a sliding 50-char
    /// window. A window seen N times contributes (N-1) * window_len repeated
    /// characters.
    fn repetition_ratio(content: &str) -> f64 {
        let chars: Vec<char> = content.chars().collect();
        if chars.len() < REPEAT_MIN_LEN {
            return 0.0;
        }
        let window = REPEAT_WINDOW.min(chars.len() / 2);
        let mut counts: HashMap<&[char], usize> = HashMap::new();
        for start in 0..=(chars.len() - window) {
            *counts.entry(&chars[start..start + window]).or_insert(0) += 1;
        }
        let repeated: usize = counts
            .values()
            .filter(|&&count| count > 1)
            .map(|&count| (count - 1) * window)
            .sum();
        repeated as f64 / chars.len() as f64
    }

    /// Truncate to all limits at once, preferring whole lines from the front.
    fn truncate(&self, content: &str) -> String {
        let mut lines: Vec<&str> = content.split('\n').collect();
        lines.truncate(self.max_lines);
        let clipped: Vec<String> = lines
            .into_iter()
            .map(|line| line.chars().take(self.max_line_chars).collect())
            .collect();
        let joined = clipped.join("\n");
        joined.chars().take(self.max_chars).collect()
    }
}

impl Sanitizer for LengthGuard {
    fn name(&self) -> &str {
        "length_guard"
    }

    fn sanitize(&self, content: &str) -> Result<SanitizeOutcome, String> {
        if content.is_empty() {
            return Ok(SanitizeOutcome::pass(""));
        }

        let char_count = content.chars().count();
        let line_count = content.split('\n').count();
        let longest_line = content
            .split('\n')
            .map(|line| line.chars().count())
            .max()
            .unwrap_or(0);

        let mut violations = Vec::new();
        if char_count > self.max_chars {
            violations.push(format!("chars {char_count} > {}", self.max_chars));
        }
        if line_count > self.max_lines {
            violations.push(format!("lines {line_count} > {}", self.max_lines));
        }
        if longest_line > self.max_line_chars {
            violations.push(format!(
                "longest line {longest_line} > {}",
                self.max_line_chars
            ));
        }

        let repetition = Self::repetition_ratio(content);
        if repetition > self.max_repeat_ratio {
            violations.push(format!(
                "repetition {:.1}% > {:.1}%",
                repetition * 100.0,
                self.max_repeat_ratio * 100.0
            ));
        }

        let metadata_base = |outcome: SanitizeOutcome| {
            outcome
                .with_metadata("char_count", serde_json::json!(char_count))
                .with_metadata("line_count", serde_json::json!(line_count))
                .with_metadata("longest_line", serde_json::json!(longest_line))
                .with_metadata(
                    "repetition_ratio",
                    serde_json::json!((repetition * 1000.0).round() / 1000.0),
                )
        };

        if violations.is_empty() {
            return Ok(metadata_base(SanitizeOutcome::pass(content)));
        }

        if self.truncate_on_overflow {
            let truncated = self.truncate(content);
            Ok(metadata_base(SanitizeOutcome::pass(truncated)).with_warning(format!(
                "oversized content truncated: {}",
                violations.join("; ")
            )))
        } else {
            Ok(metadata_base(SanitizeOutcome::reject(
                content,
                format!("length limits exceeded: {}", violations.join("; ")),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(truncate: bool) -> LengthGuard {
        LengthGuard::new(1_000, 50, 200, 0.8, truncate)
    }

    #[test]
    fn test_within_limits_passes_unchanged() {
        let outcome = guard(false).sanitize("short text").unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.content, "short text");
    }

    #[test]
    fn test_oversized_rejected_by_default() {
        let text = "a".repeat(2_000);
        let outcome = guard(false).sanitize(&text).unwrap();
        assert!(!outcome.passed);
        assert!(outcome.warning.unwrap().contains("chars"));
    }

    #[test]
    fn test_oversized_truncated_when_configured() {
        let text = "a".repeat(2_000);
        let outcome = guard(true).sanitize(&text).unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.content.chars().count(), 1_000);
    }

    #[test]
    fn test_newline_bomb_caught() {
        let text = "x\n".repeat(500);
        let outcome = guard(false).sanitize(&text).unwrap();
        assert!(!outcome.passed);
    }

    #[test]
    fn test_truncation_respects_line_limits() {
        let long_line = "b".repeat(500);
        let text = vec![long_line; 100].join("\n");
        let outcome = guard(true).sanitize(&text).unwrap();
        assert!(outcome.passed);
        assert!(outcome.content.split('\n').count() <= 50);
        assert!(outcome
            .content
            .split('\n')
            .all(|line| line.chars().count() <= 200));
    }

    #[test]
    fn test_repetition_flood_rejected() {
        // One 60-char phrase repeated 15 times is nearly all repetition.
        let text = "this phrase repeats to amplify the context window badly. "
            .repeat(15);
        let outcome = guard(false).sanitize(&text).unwrap();
        assert!(!outcome.passed);
        assert!(outcome.warning.unwrap().contains("repetition"));
    }

    #[test]
    fn test_short_text_skips_repetition_analysis() {
        // 10 identical chars would be 100% repetition, but below the floor.
        let outcome = guard(false).sanitize("aaaaaaaaaa").unwrap();
        assert!(outcome.passed);
    }
}
