//! Prompt-injection detection sanitizer

use crate::{SanitizeOutcome, Sanitizer};
use forge_core::DetectionLevel;
use once_cell::sync::Lazy;
use regex::Regex;

struct InjectionPattern {
    name: &'static str,
    regex: &'static Lazy<Regex>,
    min_level: DetectionLevel,
}

// ============================================================================
// PATTERN BANK
// ============================================================================

static INSTRUCTION_OVERRIDE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:ignore|disregard|forget|override)\s+(?:previous|above|all|any|the|your)\s+(?:instructions?|rules?|prompts?|commands?|directives?)",
    )
    .expect("instruction override pattern")
});

static ROLE_HIJACK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\byou are\s+(?:now\s+)?(?:a|an)?\s*(?:different|new|evil|malicious|unrestricted|unfiltered)\s+(?:assistant|ai|model|system)",
    )
    .expect("role hijack pattern")
});

static PROMPT_EXFILTRATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:show|print|output|reveal|display|tell me)\s+(?:your|the)?\s*(?:system|initial|original|full)?\s*(?:prompt|instructions?|rules?|configuration)",
    )
    .expect("prompt exfiltration pattern")
});

static JAILBREAK_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:jailbreak|dan mode|developer mode|god mode|unrestricted mode)\b")
        .expect("jailbreak pattern")
});

static BIDI_ZERO_WIDTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\u{200B}-\u{200F}\u{202A}-\u{202E}\u{FEFF}]").expect("bidi pattern")
});

static DELIMITER_INJECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:---|===|\*\*\*|###)\s*(?:system|user|assistant|instruction|new prompt)")
        .expect("delimiter pattern")
});

static META_INSTRUCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:start|begin|initiate)\s+(?:new|different|alternative)\s+(?:session|conversation|context|mode)",
    )
    .expect("meta instruction pattern")
});

static PRIORITY_OVERRIDE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:highest|maximum|top|critical)\s+priority\b")
        .expect("priority override pattern")
});

static BASE64_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9+/]{20,}={0,2}\b").expect("base64 pattern")
});

static SPECIAL_CHAR_FLOOD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^\w\s]{10,}").expect("special char pattern")
});

static PATTERNS: &[InjectionPattern] = &[
    // Basic tier: unambiguous attack phrasing.
    InjectionPattern {
        name: "instruction-override",
        regex: &INSTRUCTION_OVERRIDE,
        min_level: DetectionLevel::Basic,
    },
    InjectionPattern {
        name: "role-hijack",
        regex: &ROLE_HIJACK,
        min_level: DetectionLevel::Basic,
    },
    InjectionPattern {
        name: "system-prompt-exfiltration",
        regex: &PROMPT_EXFILTRATION,
        min_level: DetectionLevel::Basic,
    },
    InjectionPattern {
        name: "jailbreak-keyword",
        regex: &JAILBREAK_KEYWORD,
        min_level: DetectionLevel::Basic,
    },
    // Standard tier: common variants and encoding tricks.
    InjectionPattern {
        name: "bidi-zero-width-obfuscation",
        regex: &BIDI_ZERO_WIDTH,
        min_level: DetectionLevel::Standard,
    },
    InjectionPattern {
        name: "delimiter-injection",
        regex: &DELIMITER_INJECTION,
        min_level: DetectionLevel::Standard,
    },
    InjectionPattern {
        name: "meta-instruction",
        regex: &META_INSTRUCTION,
        min_level: DetectionLevel::Standard,
    },
    InjectionPattern {
        name: "priority-override",
        regex: &PRIORITY_OVERRIDE,
        min_level: DetectionLevel::Standard,
    },
    // Strict tier: suspicious shapes, accepts false positives.
    InjectionPattern {
        name: "base64-block",
        regex: &BASE64_BLOCK,
        min_level: DetectionLevel::Strict,
    },
    InjectionPattern {
        name: "special-char-flood",
        regex: &SPECIAL_CHAR_FLOOD,
        min_level: DetectionLevel::Strict,
    },
];

/// How far into the text the repeated-phrase scan looks. Flooding attacks
/// repeat from the start; bounding the scan keeps the guard linear-ish.
const REPEAT_SCAN_LIMIT: usize = 10_000;
const REPEAT_PHRASE_LENGTHS: [usize; 4] = [10, 15, 20, 30];
const REPEAT_MIN_OCCURRENCES: usize = 4;

/// The regex engine has no backreferences, so repeated-phrase flooding is
/// detected by a direct scan: any phrase of a probe length occurring four or
/// more times contiguously.
fn has_repeated_phrase(content: &str) -> bool {
    let chars: Vec<char> = content.chars().take(REPEAT_SCAN_LIMIT).collect();
    for &len in &REPEAT_PHRASE_LENGTHS {
        if chars.len() < len * REPEAT_MIN_OCCURRENCES {
            continue;
        }
        for start in 0..=(chars.len() - len * REPEAT_MIN_OCCURRENCES) {
            let phrase = &chars[start..start + len];
            let repeats = (1..REPEAT_MIN_OCCURRENCES).all(|i| {
                let offset = start + i * len;
                &chars[offset..offset + len] == phrase
            });
            if repeats {
                return true;
            }
        }
    }
    false
}

/// Heuristic prompt-injection detector over a tiered pattern bank.
///
/// Heuristics rather than a classifier model: zero external dependencies,
/// sub-millisecond latency, and every rejection names the pattern that fired
/// so the audit trail stays explainable. An LLM-backed classifier can be
/// layered on top and must degrade to this detector on failure.
pub struct InjectionDetector {
    level: DetectionLevel,
}

impl InjectionDetector {
    pub fn new(level: DetectionLevel) -> Self {
        Self { level }
    }

    /// Names of all patterns that match at the configured level.
    pub fn detect(&self, content: &str) -> Vec<&'static str> {
        let mut detected: Vec<&'static str> = PATTERNS
            .iter()
            .filter(|p| p.min_level <= self.level)
            .filter(|p| p.regex.is_match(content))
            .map(|p| p.name)
            .collect();

        if self.level >= DetectionLevel::Strict && has_repeated_phrase(content) {
            detected.push("repeated-phrase-flooding");
        }
        detected
    }
}

impl Sanitizer for InjectionDetector {
    fn name(&self) -> &str {
        "injection_detector"
    }

    fn sanitize(&self, content: &str) -> Result<SanitizeOutcome, String> {
        if content.is_empty() {
            return Ok(SanitizeOutcome::pass(""));
        }

        let detected = self.detect(content);
        if detected.is_empty() {
            return Ok(SanitizeOutcome::pass(content));
        }

        Ok(SanitizeOutcome::reject(
            content,
            format!("injection patterns matched: {}", detected.join(", ")),
        )
        .with_metadata("detected_patterns", serde_json::json!(detected))
        .with_metadata(
            "detection_level",
            serde_json::json!(format!("{:?}", self.level).to_lowercase()),
        ))
    }
}
