//! HTML stripping sanitizer

use crate::{SanitizeOutcome, Sanitizer};
use once_cell::sync::Lazy;
use regex::Regex;

static SCRIPT_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>")
        .expect("script/style pattern")
});
static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment pattern"));
static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)</?[a-zA-Z][^<>]*>").expect("tag pattern"));
static NUMERIC_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&#(x[0-9a-fA-F]{1,6}|[0-9]{1,7});").expect("entity pattern"));
static SPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}").expect("space pattern"));
static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("newline pattern"));

/// How markup is neutralized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HtmlStripMode {
    /// Remove tags, keep the text between them.
    #[default]
    Strip,
    /// Escape angle brackets and ampersands instead of removing anything.
    Escape,
}

/// Removes script/style blocks with their bodies, comments, then all tags;
/// decodes entities and collapses the whitespace the removal leaves behind.
/// Transformative only, never rejects.
pub struct HtmlStripper {
    mode: HtmlStripMode,
}

impl HtmlStripper {
    pub fn new(mode: HtmlStripMode) -> Self {
        Self { mode }
    }

    fn decode_entities(text: &str) -> String {
        let decoded = NUMERIC_ENTITY.replace_all(text, |caps: &regex::Captures| {
            let body = &caps[1];
            let code = if let Some(hex) = body.strip_prefix('x') {
                u32::from_str_radix(hex, 16).ok()
            } else {
                body.parse::<u32>().ok()
            };
            code.and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default()
        });
        // Named entities, most common first. &amp; goes last so it cannot
        // create new entities from already-decoded text.
        decoded
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&apos;", "'")
            .replace("&nbsp;", " ")
            .replace("&amp;", "&")
    }

    fn collapse_whitespace(text: &str) -> String {
        let spaced = SPACE_RUN.replace_all(text, " ");
        let collapsed = BLANK_LINES.replace_all(&spaced, "\n\n");
        collapsed.trim().to_string()
    }
}

impl Sanitizer for HtmlStripper {
    fn name(&self) -> &str {
        "html_stripper"
    }

    fn sanitize(&self, content: &str) -> Result<SanitizeOutcome, String> {
        if content.is_empty() {
            return Ok(SanitizeOutcome::pass(""));
        }

        // Fast path: nothing that looks like markup.
        if !content.contains('<') && !content.contains('&') {
            return Ok(SanitizeOutcome::pass(content));
        }

        let result = match self.mode {
            HtmlStripMode::Strip => {
                let without_blocks = SCRIPT_STYLE.replace_all(content, "");
                let without_comments = COMMENT.replace_all(&without_blocks, "");
                let tags_removed = TAG.replace_all(&without_comments, "");
                let decoded = Self::decode_entities(&tags_removed);
                let cleaned = Self::collapse_whitespace(&decoded);
                let changed = cleaned != content;
                (cleaned, changed)
            }
            HtmlStripMode::Escape => {
                let escaped = content
                    .replace('&', "&amp;")
                    .replace('<', "&lt;")
                    .replace('>', "&gt;");
                let changed = escaped != content;
                (escaped, changed)
            }
        };

        let (cleaned, changed) = result;
        let mut outcome = SanitizeOutcome::pass(cleaned);
        if changed {
            outcome = outcome
                .with_metadata("markup_changed", serde_json::json!(true))
                .with_warning("markup removed or escaped");
        }
        Ok(outcome)
    }
}
