//! Build request and its conversion into provisional segments

use forge_core::{Segment, SegmentType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One `(role, content)` dialogue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A retrieval fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagChunk {
    pub content: String,
    pub score: Option<f64>,
    pub source_id: Option<String>,
}

impl RagChunk {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            score: None,
            source_id: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }
}

/// A tool definition offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Canonical build input. Field order here is also segment insertion order:
/// system, tools, few-shot, state, dialogue, retrieval. The serialized form
/// doubles as the package-level cache key input, so every field is ordered
/// deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BuildRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub rag_chunks: Vec<RagChunk>,
    pub tools: Vec<ToolSpec>,
    pub few_shot_examples: Vec<Message>,
    pub state: BTreeMap<String, String>,
    pub current_turn: u32,
    pub target_namespace: String,
}

impl BuildRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_message(mut self, role: impl Into<String>, content: impl Into<String>) -> Self {
        self.messages.push(Message::new(role, content));
        self
    }

    pub fn with_rag_chunk(mut self, chunk: RagChunk) -> Self {
        self.rag_chunks.push(chunk);
        self
    }

    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_few_shot(mut self, role: impl Into<String>, content: impl Into<String>) -> Self {
        self.few_shot_examples.push(Message::new(role, content));
        self
    }

    pub fn with_state(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state.insert(key.into(), value.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.target_namespace = namespace.into();
        self
    }

    /// The concatenated user-facing query, for routing.
    pub fn user_query(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The static head: system prompt, tool definitions, few-shot examples.
    /// These are the reuse unit of the prefix cache.
    pub fn head_segments(&self) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut seq = 0usize;
        let mut push = |segments: &mut Vec<Segment>, seg: Segment| {
            segments.push(seg.with_seq(seq));
            seq += 1;
        };

        if let Some(prompt) = &self.system_prompt {
            push(&mut segments, Segment::new(SegmentType::System, prompt.clone()));
        }

        for tool in &self.tools {
            let content = format!(
                "{}: {}\nparameters: {}",
                tool.name, tool.description, tool.parameters
            );
            push(
                &mut segments,
                Segment::new(SegmentType::ToolDefinition, content)
                    .with_source_id(tool.name.clone()),
            );
        }

        for example in &self.few_shot_examples {
            push(
                &mut segments,
                Segment::new(SegmentType::FewShot, example.content.clone())
                    .with_role(example.role.clone()),
            );
        }

        self.apply_namespace(segments)
    }

    /// Serialized head fields, the prefix-cache key input.
    pub fn head_cache_input(&self) -> String {
        serde_json::to_string(&(&self.system_prompt, &self.tools, &self.few_shot_examples))
            .unwrap_or_default()
    }

    /// Everything after the head, with indices continuing at `start_seq`.
    pub fn dynamic_segments(&self, start_seq: usize) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut seq = start_seq;
        let mut push = |segments: &mut Vec<Segment>, seg: Segment| {
            segments.push(seg.with_seq(seq));
            seq += 1;
        };

        if !self.state.is_empty() {
            let content = self
                .state
                .iter()
                .map(|(key, value)| format!("{key}: {value}"))
                .collect::<Vec<_>>()
                .join("\n");
            push(&mut segments, Segment::new(SegmentType::State, content));
        }

        for message in &self.messages {
            let segment_type = match message.role.as_str() {
                "assistant" => SegmentType::Assistant,
                "tool" => SegmentType::ToolResult,
                _ => SegmentType::User,
            };
            push(
                &mut segments,
                Segment::new(segment_type, message.content.clone())
                    .with_role(message.role.clone()),
            );
        }

        for chunk in &self.rag_chunks {
            let mut seg = Segment::new(SegmentType::Rag, chunk.content.clone());
            if let Some(score) = chunk.score {
                seg = seg.with_score(score);
            }
            if let Some(source) = &chunk.source_id {
                seg = seg.with_source_id(source.clone());
            }
            push(&mut segments, seg);
        }

        self.apply_namespace(segments)
    }

    /// Expand into provisional segments with stable insertion indices.
    pub fn to_segments(&self) -> Vec<Segment> {
        let mut segments = self.head_segments();
        segments.extend(self.dynamic_segments(segments.len()));
        segments
    }

    fn apply_namespace(&self, segments: Vec<Segment>) -> Vec<Segment> {
        let namespace = if self.target_namespace.is_empty() {
            "default".to_string()
        } else {
            self.target_namespace.clone()
        };
        segments
            .into_iter()
            .map(|seg| seg.with_namespace(namespace.clone()))
            .collect()
    }

    /// Deterministic serialization for the package cache key.
    pub fn cache_input(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
