//! Heuristic complexity estimation

use forge_core::ComplexityLevel;
use once_cell::sync::Lazy;
use regex::Regex;

// Keyword sets cover English and CJK phrasing; queries mix both in practice.
const COMPARISON_KEYWORDS: &[&str] = &[
    "compare", "contrast", "difference", "versus", " vs ", "better", "pros and cons",
    "advantages", "disadvantages", "比较", "对比", "区别", "差异", "优缺点", "优劣",
];

const REASONING_KEYWORDS: &[&str] = &[
    "why", "how", "explain", "reasoning", "rationale", "mechanism", "为什么", "如何",
    "怎么", "解释", "原理", "机制", "原因",
];

const COMPLEX_TASK_KEYWORDS: &[&str] = &[
    "analyze", "design", "generate", "create", "implement", "optimize", "evaluate",
    "prove", "derive", "calculate", "write code", "分析", "设计", "生成", "创建",
    "实现", "优化", "评估", "证明", "推导", "计算", "编写代码", "写代码",
];

static MATH_SYMBOLS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[∫∑∏√∂∇≈≠≤≥±∞∈∉⊂⊃∪∩]|\\frac|\\int|\\sum").expect("math pattern")
});

static CODE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```.*?```").expect("code block pattern"));

/// The estimator's intermediate signals, exposed for audit metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexitySignals {
    pub query_length: usize,
    pub word_count: usize,
    pub question_count: usize,
    pub code_block_count: usize,
    pub math_symbol_count: usize,
    pub has_comparison_words: bool,
    pub has_reasoning_words: bool,
    pub has_complex_task_words: bool,
    pub score: f64,
    pub estimated_level: ComplexityLevel,
    /// Confidence in [0,1]; grows with the number of firing signals.
    pub confidence: f64,
}

/// Weighted-sum heuristic scorer. Length, keyword families, and structural
/// elements (code blocks, math) each contribute; the total maps onto the
/// four complexity levels with a higher bar for Expert.
pub struct ComplexityEstimator {
    simple_threshold: usize,
    moderate_threshold: usize,
    complex_threshold: usize,
}

impl ComplexityEstimator {
    pub fn new() -> Self {
        Self {
            simple_threshold: 80,
            moderate_threshold: 200,
            complex_threshold: 500,
        }
    }

    pub fn with_thresholds(simple: usize, moderate: usize, complex: usize) -> Self {
        Self {
            simple_threshold: simple,
            moderate_threshold: moderate,
            complex_threshold: complex,
        }
    }

    pub fn estimate(&self, query: &str) -> ComplexityLevel {
        self.signals(query).estimated_level
    }

    pub fn signals(&self, query: &str) -> ComplexitySignals {
        let query_lower = query.to_lowercase();

        let query_length = query.chars().count();
        let word_count = query.split_whitespace().count();
        let question_count =
            query.matches('?').count() + query.matches('？').count();
        let code_block_count = CODE_BLOCK.find_iter(query).count();
        let math_symbol_count = MATH_SYMBOLS.find_iter(query).count();

        let has_comparison_words = COMPARISON_KEYWORDS.iter().any(|kw| query_lower.contains(kw));
        let has_reasoning_words = REASONING_KEYWORDS.iter().any(|kw| query_lower.contains(kw));
        let has_complex_task_words =
            COMPLEX_TASK_KEYWORDS.iter().any(|kw| query_lower.contains(kw));

        let mut score = 0.0;
        let mut confidence: f64 = 0.5;

        // Length contribution.
        if query_length > self.complex_threshold {
            score += 3.0;
            confidence += 0.15;
        } else if query_length > self.moderate_threshold {
            score += 2.0;
            confidence += 0.1;
        } else if query_length > self.simple_threshold {
            score += 1.0;
            confidence += 0.05;
        }

        // Keyword contribution.
        if has_complex_task_words {
            score += 2.0;
            confidence += 0.2;
        }
        if has_comparison_words {
            score += 1.0;
            confidence += 0.1;
        }
        if has_reasoning_words {
            score += 0.5;
            confidence += 0.05;
        }

        // Structural elements.
        if code_block_count > 0 {
            score += 1.5;
            confidence += 0.15;
        }
        if math_symbol_count > 3 {
            score += 1.5;
            confidence += 0.15;
        } else if math_symbol_count > 0 {
            score += 0.5;
        }

        // Several distinct questions usually mean a multi-part task.
        if question_count > 2 {
            score += 1.0;
            confidence += 0.1;
        }

        // Non-linear mapping: most traffic lives below Expert.
        let estimated_level = if score >= 5.0 {
            ComplexityLevel::Expert
        } else if score >= 3.5 {
            ComplexityLevel::Complex
        } else if score >= 1.5 {
            ComplexityLevel::Moderate
        } else {
            ComplexityLevel::Simple
        };

        ComplexitySignals {
            query_length,
            word_count,
            question_count,
            code_block_count,
            math_symbol_count,
            has_comparison_words,
            has_reasoning_words,
            has_complex_task_words,
            score,
            estimated_level,
            confidence: confidence.min(1.0),
        }
    }
}

impl Default for ComplexityEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_factual_query_is_simple() {
        let estimator = ComplexityEstimator::new();
        assert_eq!(
            estimator.estimate("What is the capital of France?"),
            ComplexityLevel::Simple
        );
    }

    #[test]
    fn test_reasoning_query_scores_higher() {
        let estimator = ComplexityEstimator::new();
        let simple = estimator.signals("capital of France");
        let reasoning = estimator.signals("explain why the borrow checker rejects this");
        assert!(reasoning.score > simple.score);
    }

    #[test]
    fn test_multi_step_reasoning_with_code_is_expert() {
        let estimator = ComplexityEstimator::new();
        let query = format!(
            "Compare these two implementations, prove which one is asymptotically faster, \
             and explain the reasoning step by step. Analyze the allocation behaviour too. \
             {}{}{}",
            "```rust\nfn f() {}\n```",
            " Why does the second one allocate?",
            " How would you optimize it? What about cache locality? ∑"
        );
        let signals = estimator.signals(&query);
        assert_eq!(signals.estimated_level, ComplexityLevel::Expert);
        assert!(signals.code_block_count > 0);
        assert!(signals.has_comparison_words);
    }

    #[test]
    fn test_cjk_keywords_recognized() {
        let estimator = ComplexityEstimator::new();
        let signals = estimator.signals("请分析并比较这两种方案的优缺点，解释原因");
        assert!(signals.has_complex_task_words);
        assert!(signals.has_comparison_words);
        assert!(signals.estimated_level >= ComplexityLevel::Complex);
    }

    #[test]
    fn test_determinism() {
        let estimator = ComplexityEstimator::new();
        let a = estimator.signals("some moderately long query about systems design");
        let b = estimator.signals("some moderately long query about systems design");
        assert_eq!(a, b);
    }

    #[test]
    fn test_confidence_bounded() {
        let estimator = ComplexityEstimator::new();
        let query = "analyze compare explain why ``` ``` ∑∑∑∑ ??? ".repeat(30);
        let signals = estimator.signals(&query);
        assert!(signals.confidence <= 1.0);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// The estimator is a pure function: identical queries always yield
        /// identical signals.
        #[test]
        fn prop_signals_deterministic(query in ".{0,400}") {
            let estimator = ComplexityEstimator::new();
            prop_assert_eq!(estimator.signals(&query), estimator.signals(&query));
        }

        /// Confidence stays within [0, 1] no matter how many signals fire.
        #[test]
        fn prop_confidence_bounded(query in ".{0,400}") {
            let signals = ComplexityEstimator::new().signals(&query);
            prop_assert!((0.0..=1.0).contains(&signals.confidence));
            prop_assert!(signals.score >= 0.0);
        }
    }
}
