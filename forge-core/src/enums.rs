//! Enum types for FORGE entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// SEGMENT ENUMS
// ============================================================================

/// Semantic type of a segment. Drives budgeting quotas, assembly ordering
/// and default priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    System,
    User,
    Assistant,
    Schema,
    ToolDefinition,
    ToolCall,
    ToolResult,
    Rag,
    FewShot,
    State,
    Summary,
}

impl SegmentType {
    /// Assembly rank: lower ranks are emitted earlier in the final package.
    pub fn assembly_rank(&self) -> u8 {
        match self {
            SegmentType::System => 0,
            SegmentType::Schema => 1,
            SegmentType::ToolDefinition => 2,
            SegmentType::FewShot => 3,
            SegmentType::State => 4,
            SegmentType::Summary => 5,
            SegmentType::Rag => 6,
            SegmentType::Assistant => 7,
            SegmentType::ToolCall => 7,
            SegmentType::ToolResult => 7,
            SegmentType::User => 8,
        }
    }

    /// Types that default to Critical priority when none was set.
    pub fn defaults_to_critical(&self) -> bool {
        matches!(
            self,
            SegmentType::System | SegmentType::Schema | SegmentType::ToolDefinition
        )
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SegmentType::System => "system",
            SegmentType::User => "user",
            SegmentType::Assistant => "assistant",
            SegmentType::Schema => "schema",
            SegmentType::ToolDefinition => "tool_definition",
            SegmentType::ToolCall => "tool_call",
            SegmentType::ToolResult => "tool_result",
            SegmentType::Rag => "rag",
            SegmentType::FewShot => "few_shot",
            SegmentType::State => "state",
            SegmentType::Summary => "summary",
        };
        write!(f, "{name}")
    }
}

/// Segment priority. Critical segments are rigid: they bypass bidding and
/// are never compressed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Numeric rank used by the bidding formula: critical=3 .. low=0.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 3,
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        write!(f, "{name}")
    }
}

/// Where a segment originally came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    UserInput,
    Retrieval,
    ToolOutput,
    LlmOutput,
    Compression,
    System,
}

// ============================================================================
// ROUTING ENUMS
// ============================================================================

/// Estimated complexity of a request, used by the router.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    #[default]
    Simple,
    Moderate,
    Complex,
    Expert,
}

impl fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComplexityLevel::Simple => "simple",
            ComplexityLevel::Moderate => "moderate",
            ComplexityLevel::Complex => "complex",
            ComplexityLevel::Expert => "expert",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// POLICY ENUMS
// ============================================================================

/// What to do when rigid spend alone exceeds the content budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Keep rigid segments, warn, and let the elastic tier absorb the cut.
    #[default]
    TruncateLowestPriority,
    /// Fail the whole request with a structured budget error.
    Error,
}

/// Reaction to a detected injection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InjectionAction {
    /// Drop the offending segment and record a warning.
    #[default]
    WarnAndRemove,
    /// Fail the whole request.
    Error,
    /// Keep the segment, only log the detection.
    LogOnly,
}

/// Sensitivity tier of the injection pattern bank.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum DetectionLevel {
    Basic,
    #[default]
    Standard,
    Strict,
}

impl FromStr for DetectionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(DetectionLevel::Basic),
            "standard" => Ok(DetectionLevel::Standard),
            "strict" => Ok(DetectionLevel::Strict),
            other => Err(format!("unknown detection level: {other}")),
        }
    }
}
