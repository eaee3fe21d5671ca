//! Identity and time aliases for FORGE entities

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Identifier for a segment. Globally unique within a request.
pub type SegmentId = Uuid;

/// Identifier for a build request.
pub type RequestId = Uuid;

/// Identifier for an agent on the context bus.
pub type AgentId = Uuid;

/// UTC timestamp used across all entities.
pub type Timestamp = DateTime<Utc>;

/// Create a new timestamp-sortable UUIDv7 id.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}
