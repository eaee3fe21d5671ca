//! FORGE Sanitize - Zero-Trust Content Filtering
//!
//! An ordered chain of sanitizers applied to every segment before any budget
//! decision. Each sanitizer is a pure function over its input; composition is
//! sequential and short-circuits the moment one sanitizer rejects.
//!
//! Recommended order (the default chain): normalize -> length guard -> strip
//! markup -> redact PII -> detect injection. Detection runs last so encoded
//! attacks are unwrapped before the pattern bank sees them.

use forge_core::{SanitizeError, SanitizePolicy};
use std::collections::BTreeMap;

mod unicode;
mod length;
mod html;
mod pii;
mod injection;

pub use unicode::UnicodeNormalizer;

pub use length::LengthGuard;

pub use html::{HtmlStripMode, HtmlStripper};

pub use pii::{PiiKind, PiiRedactor};

pub use injection::InjectionDetector;

/// Result of one sanitizer pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizeOutcome {
    pub content: String,
    /// False means the content is rejected and the chain stops.
    pub passed: bool,
    pub warning: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SanitizeOutcome {
    /// Content accepted unchanged or transformed.
    pub fn pass(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            passed: true,
            warning: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Content rejected; the chain short-circuits.
    pub fn reject(content: impl Into<String>, warning: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            passed: false,
            warning: Some(warning.into()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// One filter in the chain. Implementations must be pure: same input, same
/// outcome, no shared mutable state.
pub trait Sanitizer: Send + Sync {
    /// Name used in audit entries and error wrapping.
    fn name(&self) -> &str;

    /// Process content. `Err` is reserved for infrastructural failure and is
    /// wrapped by the chain; a policy rejection is `passed = false`.
    fn sanitize(&self, content: &str) -> Result<SanitizeOutcome, String>;
}

/// Final result of running the whole chain on one piece of content.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    pub content: String,
    pub passed: bool,
    /// Name of the sanitizer that rejected, when `passed` is false.
    pub rejected_by: Option<String>,
    /// One entry per sanitizer that warned, prefixed with its name.
    pub warnings: Vec<String>,
    /// Per-sanitizer metadata maps, keyed by sanitizer name.
    pub metadata: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

/// Ordered, short-circuiting sanitizer chain.
pub struct SanitizeChain {
    sanitizers: Vec<Box<dyn Sanitizer>>,
}

impl SanitizeChain {
    pub fn new(sanitizers: Vec<Box<dyn Sanitizer>>) -> Self {
        Self { sanitizers }
    }

    /// Build the chain described by a sanitize policy section.
    pub fn from_policy(policy: &SanitizePolicy) -> Self {
        let mut sanitizers: Vec<Box<dyn Sanitizer>> = Vec::new();
        if policy.unicode_normalize {
            sanitizers.push(Box::new(UnicodeNormalizer::new()));
        }
        sanitizers.push(Box::new(LengthGuard::new(
            policy.max_segment_chars,
            policy.max_lines,
            policy.max_line_chars,
            policy.max_repeat_ratio,
            policy.truncate_on_overflow,
        )));
        if policy.strip_html {
            sanitizers.push(Box::new(HtmlStripper::new(HtmlStripMode::Strip)));
        }
        if policy.pii_redaction {
            sanitizers.push(Box::new(PiiRedactor::from_names(&policy.pii_patterns)));
        }
        if policy.injection_detection {
            sanitizers.push(Box::new(InjectionDetector::new(policy.injection_level)));
        }
        Self::new(sanitizers)
    }

    pub fn len(&self) -> usize {
        self.sanitizers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sanitizers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.sanitizers.iter().map(|s| s.name()).collect()
    }

    /// Run every sanitizer in order. Short-circuits on the first rejection;
    /// sanitizers after the rejecting one are not invoked.
    pub fn run(&self, content: &str) -> Result<ChainOutcome, SanitizeError> {
        let mut current = content.to_string();
        let mut warnings = Vec::new();
        let mut metadata = BTreeMap::new();

        for sanitizer in &self.sanitizers {
            let outcome =
                sanitizer
                    .sanitize(&current)
                    .map_err(|reason| SanitizeError::SanitizerFailed {
                        sanitizer: sanitizer.name().to_string(),
                        reason,
                    })?;

            if !outcome.metadata.is_empty() {
                metadata.insert(sanitizer.name().to_string(), outcome.metadata.clone());
            }
            if let Some(warning) = &outcome.warning {
                warnings.push(format!("[{}] {warning}", sanitizer.name()));
            }

            if !outcome.passed {
                return Ok(ChainOutcome {
                    content: outcome.content,
                    passed: false,
                    rejected_by: Some(sanitizer.name().to_string()),
                    warnings,
                    metadata,
                });
            }

            current = outcome.content;
        }

        Ok(ChainOutcome {
            content: current,
            passed: true,
            rejected_by: None,
            warnings,
            metadata,
        })
    }
}

/// Default chain: everything on, standard injection tier.
pub fn default_chain() -> SanitizeChain {
    SanitizeChain::from_policy(&SanitizePolicy::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Recording {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        reject: bool,
    }

    impl Sanitizer for Recording {
        fn name(&self) -> &str {
            self.name
        }
        fn sanitize(&self, content: &str) -> Result<SanitizeOutcome, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                Ok(SanitizeOutcome::reject(content, "rejected"))
            } else {
                Ok(SanitizeOutcome::pass(format!("{content}.")))
            }
        }
    }

    #[test]
    fn test_chain_threads_content_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = SanitizeChain::new(vec![
            Box::new(Recording { name: "a", calls: Arc::clone(&calls), reject: false }),
            Box::new(Recording { name: "b", calls: Arc::clone(&calls), reject: false }),
        ]);
        let outcome = chain.run("x").unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.content, "x..");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_chain_short_circuits_on_rejection() {
        let early = Arc::new(AtomicUsize::new(0));
        let late = Arc::new(AtomicUsize::new(0));
        let chain = SanitizeChain::new(vec![
            Box::new(Recording { name: "first", calls: Arc::clone(&early), reject: true }),
            Box::new(Recording { name: "second", calls: Arc::clone(&late), reject: false }),
        ]);
        let outcome = chain.run("x").unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.rejected_by.as_deref(), Some("first"));
        assert_eq!(early.load(Ordering::SeqCst), 1);
        // The sanitizer after the rejection is never invoked.
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    struct Failing;

    impl Sanitizer for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn sanitize(&self, _content: &str) -> Result<SanitizeOutcome, String> {
            Err("backend unavailable".to_string())
        }
    }

    #[test]
    fn test_chain_wraps_infrastructural_failure() {
        let chain = SanitizeChain::new(vec![Box::new(Failing)]);
        let err = chain.run("x").unwrap_err();
        match err {
            SanitizeError::SanitizerFailed { sanitizer, reason } => {
                assert_eq!(sanitizer, "failing");
                assert_eq!(reason, "backend unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_default_chain_order() {
        let chain = default_chain();
        assert_eq!(
            chain.names(),
            vec![
                "unicode_normalizer",
                "length_guard",
                "html_stripper",
                "pii_redactor",
                "injection_detector",
            ]
        );
    }

    #[test]
    fn test_default_chain_passes_benign_text() {
        let chain = default_chain();
        let outcome = chain.run("What is the capital of France?").unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.content, "What is the capital of France?");
    }

    #[test]
    fn test_policy_toggles_disable_sanitizers() {
        let policy = SanitizePolicy {
            strip_html: false,
            pii_redaction: false,
            injection_detection: false,
            ..Default::default()
        };
        let chain = SanitizeChain::from_policy(&policy);
        assert_eq!(chain.names(), vec!["unicode_normalizer", "length_guard"]);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        calls: Arc<AtomicUsize>,
        reject: bool,
    }

    impl Sanitizer for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn sanitize(&self, content: &str) -> Result<SanitizeOutcome, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                Ok(SanitizeOutcome::reject(content, "rejected"))
            } else {
                Ok(SanitizeOutcome::pass(content))
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Short-circuit: when sanitizer k rejects, sanitizers after k are
        /// never invoked, for any chain length and rejection position.
        #[test]
        fn prop_chain_short_circuits_at_any_position(
            chain_len in 1usize..8,
            reject_at in 0usize..8,
            content in ".{0,50}",
        ) {
            let reject_at = reject_at % chain_len;
            let counters: Vec<Arc<AtomicUsize>> =
                (0..chain_len).map(|_| Arc::new(AtomicUsize::new(0))).collect();
            let sanitizers: Vec<Box<dyn Sanitizer>> = counters
                .iter()
                .enumerate()
                .map(|(i, calls)| {
                    Box::new(Counting {
                        calls: Arc::clone(calls),
                        reject: i == reject_at,
                    }) as Box<dyn Sanitizer>
                })
                .collect();

            let outcome = SanitizeChain::new(sanitizers).run(&content).unwrap();
            prop_assert!(!outcome.passed);
            for (i, calls) in counters.iter().enumerate() {
                let expected = usize::from(i <= reject_at);
                prop_assert_eq!(calls.load(Ordering::SeqCst), expected);
            }
        }

        /// Normalization is idempotent for any input.
        #[test]
        fn prop_unicode_normalizer_idempotent(content in ".{0,300}") {
            let normalizer = UnicodeNormalizer::new();
            let once = normalizer.sanitize(&content).unwrap().content;
            let twice = normalizer.sanitize(&once).unwrap().content;
            prop_assert_eq!(once, twice);
        }

        /// Truncation mode always produces output within every limit.
        #[test]
        fn prop_length_guard_truncation_respects_limits(content in ".{0,2000}") {
            let guard = LengthGuard::new(300, 10, 40, 0.95, true);
            let outcome = guard.sanitize(&content).unwrap();
            prop_assert!(outcome.passed);
            prop_assert!(outcome.content.chars().count() <= 300);
            prop_assert!(outcome.content.split('\n').count() <= 10);
            prop_assert!(outcome
                .content
                .split('\n')
                .all(|line| line.chars().count() <= 40));
        }

        /// Redaction leaves no mainland mobile number behind, wherever it
        /// sits in the text.
        #[test]
        fn prop_phone_redaction_is_complete(
            prefix in "[a-z ]{0,20}",
            suffix in "[a-z ]{0,20}",
        ) {
            let text = format!("{prefix}13812345678{suffix}");
            let outcome = PiiRedactor::all().sanitize(&text).unwrap();
            prop_assert!(outcome.passed);
            prop_assert!(!outcome.content.contains("13812345678"));
        }
    }
}
