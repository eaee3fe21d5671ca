//! FORGE Bus - Multi-Agent Context Coordination
//!
//! An in-memory index of segments by namespace, not a message queue. Agents
//! publish segments into their own namespace, hand selected segments off to
//! another agent's namespace, and read the union of their own namespace,
//! the `default` namespace, and anything whose visibility set names them.
//! Ordering within a namespace is insertion order.

use chrono::Utc;
use dashmap::DashMap;
use forge_core::{AgentId, BusError, ForgeResult, Segment, SegmentId, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// The shared namespace every agent can read.
pub const DEFAULT_NAMESPACE: &str = "default";

/// One agent's identity on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub agent_id: AgentId,
    pub namespace: String,
    /// Human-readable role ("planner", "researcher", ...).
    pub role: String,
    pub parent_agent_id: Option<AgentId>,
}

impl AgentContext {
    pub fn new(namespace: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            agent_id: Uuid::now_v7(),
            namespace: namespace.into(),
            role: role.into(),
            parent_agent_id: None,
        }
    }

    pub fn child_of(mut self, parent: &AgentContext) -> Self {
        self.parent_agent_id = Some(parent.agent_id);
        self
    }
}

/// What happened on the bus, for `recent_events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusEventKind {
    Publish,
    Handoff,
}

/// One bus event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub kind: BusEventKind,
    pub agent_id: AgentId,
    pub namespace: String,
    /// Target namespace for handoffs.
    pub target_namespace: Option<String>,
    pub segment_ids: Vec<SegmentId>,
    pub at: Timestamp,
}

/// The bus itself. Safe under concurrent publish/read from parallel agents.
pub struct ContextBus {
    namespaces: DashMap<String, Vec<Segment>>,
    agents: DashMap<AgentId, AgentContext>,
    events: Mutex<Vec<BusEvent>>,
}

impl ContextBus {
    pub fn new() -> Self {
        Self {
            namespaces: DashMap::new(),
            agents: DashMap::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, agent: AgentContext) -> AgentId {
        let id = agent.agent_id;
        debug!(agent = %id, namespace = %agent.namespace, role = %agent.role, "agent registered");
        self.agents.insert(id, agent);
        id
    }

    fn agent(&self, agent_id: AgentId) -> ForgeResult<AgentContext> {
        self.agents
            .get(&agent_id)
            .map(|a| a.clone())
            .ok_or_else(|| {
                BusError::NotRegistered {
                    agent: agent_id.to_string(),
                }
                .into()
            })
    }

    /// Publish a segment into the agent's namespace. The segment's metadata
    /// namespace is rewritten to the agent's.
    pub fn publish(&self, agent_id: AgentId, segment: Segment) -> ForgeResult<SegmentId> {
        let agent = self.agent(agent_id)?;
        let segment = segment.with_namespace(agent.namespace.clone());
        let segment_id = segment.id;
        self.namespaces
            .entry(agent.namespace.clone())
            .or_default()
            .push(segment);
        self.record(BusEvent {
            kind: BusEventKind::Publish,
            agent_id,
            namespace: agent.namespace,
            target_namespace: None,
            segment_ids: vec![segment_id],
            at: Utc::now(),
        });
        Ok(segment_id)
    }

    /// Copy segments visible to `from` into `to`'s namespace, attaching a
    /// provenance link to the originals. `selector` filters which segments
    /// travel; `None` hands off everything visible.
    pub fn handoff(
        &self,
        from: AgentId,
        to: AgentId,
        selector: Option<&dyn Fn(&Segment) -> bool>,
    ) -> ForgeResult<Vec<SegmentId>> {
        let from_agent = self.agent(from)?;
        let to_agent = self.agent(to)?;
        if from_agent.namespace == to_agent.namespace {
            return Err(BusError::HandoffFailed {
                from: from_agent.namespace,
                to: to_agent.namespace,
                reason: "source and target namespaces are identical".to_string(),
            }
            .into());
        }

        let visible = self.visible_segments(from)?;
        let mut moved_ids = Vec::new();
        let mut copies = Vec::new();
        for segment in visible {
            if let Some(keep) = selector {
                if !keep(&segment) {
                    continue;
                }
            }
            let mut copy = segment
                .clone()
                .with_namespace(to_agent.namespace.clone());
            copy.id = Uuid::now_v7();
            copy.provenance.parent_segment_ids = vec![segment.id];
            copy.provenance.source_id = Some(format!("handoff:{}", from_agent.namespace));
            moved_ids.push(copy.id);
            copies.push(copy);
        }

        if !copies.is_empty() {
            self.namespaces
                .entry(to_agent.namespace.clone())
                .or_default()
                .extend(copies);
        }

        debug!(
            from = %from_agent.namespace,
            to = %to_agent.namespace,
            count = moved_ids.len(),
            "handoff complete"
        );
        self.record(BusEvent {
            kind: BusEventKind::Handoff,
            agent_id: from,
            namespace: from_agent.namespace,
            target_namespace: Some(to_agent.namespace),
            segment_ids: moved_ids.clone(),
            at: Utc::now(),
        });
        Ok(moved_ids)
    }

    /// Every segment the agent may read: its own namespace, `default`, and
    /// segments whose visibility set names the agent's namespace.
    pub fn visible_segments(&self, agent_id: AgentId) -> ForgeResult<Vec<Segment>> {
        let agent = self.agent(agent_id)?;
        let mut visible = Vec::new();

        if let Some(own) = self.namespaces.get(&agent.namespace) {
            visible.extend(own.iter().cloned());
        }
        if agent.namespace != DEFAULT_NAMESPACE {
            if let Some(shared) = self.namespaces.get(DEFAULT_NAMESPACE) {
                visible.extend(shared.iter().cloned());
            }
        }
        // Grants: other namespaces whose segments explicitly name ours.
        for entry in self.namespaces.iter() {
            if entry.key() == &agent.namespace || entry.key() == DEFAULT_NAMESPACE {
                continue;
            }
            visible.extend(
                entry
                    .value()
                    .iter()
                    .filter(|seg| seg.visibility.iter().any(|ns| ns == &agent.namespace))
                    .cloned(),
            );
        }
        Ok(visible)
    }

    /// The last `limit` publish/handoff records, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<BusEvent> {
        let events = self.events.lock().expect("bus event lock poisoned");
        let start = events.len().saturating_sub(limit);
        events[start..].to_vec()
    }

    /// Number of segments currently indexed under a namespace.
    pub fn namespace_len(&self, namespace: &str) -> usize {
        self.namespaces
            .get(namespace)
            .map(|segs| segs.len())
            .unwrap_or(0)
    }

    fn record(&self, event: BusEvent) {
        self.events
            .lock()
            .expect("bus event lock poisoned")
            .push(event);
    }
}

impl Default for ContextBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::SegmentType;

    fn seg(content: &str) -> Segment {
        Segment::new(SegmentType::State, content)
    }

    #[test]
    fn test_publish_assigns_namespace() {
        let bus = ContextBus::new();
        let agent = bus.register(AgentContext::new("research", "researcher"));
        bus.publish(agent, seg("finding one")).unwrap();
        let visible = bus.visible_segments(agent).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].metadata.namespace, "research");
    }

    #[test]
    fn test_unregistered_agent_rejected() {
        let bus = ContextBus::new();
        let err = bus.publish(Uuid::now_v7(), seg("x")).unwrap_err();
        assert!(matches!(
            err,
            forge_core::ForgeError::Bus(BusError::NotRegistered { .. })
        ));
    }

    #[test]
    fn test_default_namespace_visible_to_all() {
        let bus = ContextBus::new();
        let broadcaster = bus.register(AgentContext::new(DEFAULT_NAMESPACE, "system"));
        let reader = bus.register(AgentContext::new("worker", "worker"));
        bus.publish(broadcaster, seg("shared fact")).unwrap();
        let visible = bus.visible_segments(reader).unwrap();
        assert_eq!(visible.len(), 1);
    }

    #[test]
    fn test_namespace_isolation() {
        let bus = ContextBus::new();
        let a = bus.register(AgentContext::new("team-a", "a"));
        let b = bus.register(AgentContext::new("team-b", "b"));
        bus.publish(a, seg("a-private")).unwrap();
        assert!(bus.visible_segments(b).unwrap().is_empty());
    }

    #[test]
    fn test_visibility_grant_crosses_namespaces() {
        let bus = ContextBus::new();
        let a = bus.register(AgentContext::new("team-a", "a"));
        let b = bus.register(AgentContext::new("team-b", "b"));
        bus.publish(a, seg("granted").with_visibility(vec!["team-b".to_string()]))
            .unwrap();
        let visible = bus.visible_segments(b).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].content.as_ref(), "granted");
    }

    #[test]
    fn test_handoff_copies_with_provenance() {
        let bus = ContextBus::new();
        let planner = bus.register(AgentContext::new("planning", "planner"));
        let executor = bus.register(AgentContext::new("execution", "executor"));
        let original = bus.publish(planner, seg("the plan")).unwrap();

        let moved = bus.handoff(planner, executor, None).unwrap();
        assert_eq!(moved.len(), 1);

        let visible = bus.visible_segments(executor).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].provenance.parent_segment_ids, vec![original]);
        assert_eq!(visible[0].metadata.namespace, "execution");
        // The original stays where it was.
        assert_eq!(bus.namespace_len("planning"), 1);
    }

    #[test]
    fn test_handoff_selector_filters() {
        let bus = ContextBus::new();
        let a = bus.register(AgentContext::new("a", "a"));
        let b = bus.register(AgentContext::new("b", "b"));
        bus.publish(a, seg("keep me")).unwrap();
        bus.publish(a, seg("leave me")).unwrap();

        let keep = |segment: &Segment| segment.content.contains("keep");
        let moved = bus.handoff(a, b, Some(&keep)).unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(bus.namespace_len("b"), 1);
    }

    #[test]
    fn test_handoff_same_namespace_rejected() {
        let bus = ContextBus::new();
        let a = bus.register(AgentContext::new("same", "a"));
        let b = bus.register(AgentContext::new("same", "b"));
        assert!(bus.handoff(a, b, None).is_err());
    }

    #[test]
    fn test_recent_events_ordered_and_limited() {
        let bus = ContextBus::new();
        let a = bus.register(AgentContext::new("a", "a"));
        for i in 0..5 {
            bus.publish(a, seg(&format!("s{i}"))).unwrap();
        }
        let events = bus.recent_events(3);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.kind == BusEventKind::Publish));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let bus = ContextBus::new();
        let a = bus.register(AgentContext::new("a", "a"));
        for i in 0..4 {
            bus.publish(a, seg(&format!("s{i}"))).unwrap();
        }
        let visible = bus.visible_segments(a).unwrap();
        let contents: Vec<String> = visible.iter().map(|s| s.content.to_string()).collect();
        assert_eq!(contents, vec!["s0", "s1", "s2", "s3"]);
    }
}
