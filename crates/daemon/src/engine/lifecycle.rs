// Call lifecycle: guarded status transitions, each persisted through the
// entity service and announced on the event bus.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mcpd_common::protocol::events::EventPayload;
use mcpd_common::types::{CallStatus, FailureKind, McpFunctionCall};
use tracing::{debug, warn};

use super::EngineError;
use crate::entities::EntityService;
use crate::events::EventBus;
use crate::registry::ResolutionError;

/// A classified call failure, recorded on the call as `error` + `failure_kind`.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn resolution(error: ResolutionError) -> Self {
        Self { kind: FailureKind::Resolution, message: format!("ResolutionError: {error}") }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Validation, message: format!("ValidationError: {}", message.into()) }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Execution, message: format!("ExecutionError: {}", message.into()) }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self { kind: FailureKind::Timeout, message: format!("TimeoutError: call exceeded {} ms", limit.as_millis()) }
    }

    pub fn record(&self, call: &mut McpFunctionCall) {
        call.error = Some(self.message.clone());
        call.failure_kind = Some(self.kind);
    }
}

/// Persists call records and publishes their status events.
#[derive(Clone)]
pub struct CallRecorder {
    entities: Arc<EntityService>,
    bus: Arc<EventBus>,
}

impl CallRecorder {
    pub fn new(entities: Arc<EntityService>, bus: Arc<EventBus>) -> Self {
        Self { entities, bus }
    }

    /// Store a freshly created call and announce its `initial` status.
    pub async fn create(&self, call: &McpFunctionCall) -> Result<(), EngineError> {
        if call.status != CallStatus::Initial {
            return Err(EngineError::InvalidTransition { from: call.status, to: CallStatus::Initial });
        }
        self.entities.write_call(call).await?;
        self.announce(call);
        Ok(())
    }

    /// Move `call` to `next`, letting `apply` fill in outcome fields first.
    ///
    /// The event is published even when the store write fails so that
    /// subscribers always see the terminal status; the store error is still
    /// returned to the caller.
    pub async fn transition<F>(&self, call: &mut McpFunctionCall, next: CallStatus, apply: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut McpFunctionCall),
    {
        if !call.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition { from: call.status, to: next });
        }
        call.status = next;
        call.updated_at = Utc::now();
        apply(call);

        let stored = self.entities.write_call(call).await;
        self.announce(call);
        match stored {
            Ok(report) => {
                if !report.is_clean() {
                    warn!(call_uuid = %call.call_uuid, failures = report.failures.len(), "call cache invalidation incomplete");
                }
                debug!(call_uuid = %call.call_uuid, status = %next, "call transitioned");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    fn announce(&self, call: &McpFunctionCall) {
        self.bus.publish(
            &call.partition,
            EventPayload::CallStatus {
                call_uuid: call.call_uuid,
                name: call.name.clone(),
                mcp_type: call.mcp_type,
                status: call.status,
                time_spent_ms: call.time_spent_ms,
                error: call.error.clone(),
                failure_kind: call.failure_kind,
            },
        );
    }
}
