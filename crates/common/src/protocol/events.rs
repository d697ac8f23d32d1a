// Event Bus wire types. Transports serialize these into their own framing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{CallStatus, FailureKind, McpType, Partition};

/// Payload of a published event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    /// A call moved to a new lifecycle status.
    CallStatus {
        call_uuid: Uuid,
        name: String,
        mcp_type: McpType,
        status: CallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_spent_ms: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_kind: Option<FailureKind>,
    },
    /// Intermediate progress reported by a running unit.
    CallProgress { call_uuid: Uuid, name: String, progress: Value },
    /// Free-form notification from an embedder.
    Notification { data: Value },
}

impl EventPayload {
    pub fn call_uuid(&self) -> Option<Uuid> {
        match self {
            Self::CallStatus { call_uuid, .. } | Self::CallProgress { call_uuid, .. } => Some(*call_uuid),
            Self::Notification { .. } => None,
        }
    }

    pub fn call_status(&self) -> Option<CallStatus> {
        match self {
            Self::CallStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// An event as stored in the replay buffer and fanned out to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusEvent {
    /// Monotonic per bus; doubles as the SSE `id:` for resume.
    pub id: u64,
    pub partition: Partition,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub emitted_at: DateTime<Utc>,
}
