//! Lifecycle events published while a workflow runs.
//!
//! `WorkflowEvent` is the unified event type broadcast per execution. All
//! variants are Clone + Send + Sync for use with tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during workflow execution.
///
/// Every variant carries the workflow id, the execution id, and a timestamp
/// so a subscriber can mirror progress without other context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_id: String,
        execution_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A paused execution was picked up again.
    WorkflowResumed {
        workflow_id: String,
        execution_id: Uuid,
        node_id: String,
        timestamp: DateTime<Utc>,
    },

    NodeStarted {
        workflow_id: String,
        execution_id: Uuid,
        node_id: String,
        node_type: String,
        timestamp: DateTime<Utc>,
    },

    NodeCompleted {
        workflow_id: String,
        execution_id: Uuid,
        node_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    NodeFailed {
        workflow_id: String,
        execution_id: Uuid,
        node_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    WorkflowPaused {
        workflow_id: String,
        execution_id: Uuid,
        node_id: String,
        wait_key: String,
        timestamp: DateTime<Utc>,
    },

    WorkflowCompleted {
        workflow_id: String,
        execution_id: Uuid,
        duration_ms: u64,
        nodes_executed: u32,
        timestamp: DateTime<Utc>,
    },

    WorkflowFailed {
        workflow_id: String,
        execution_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowEvent::WorkflowStarted { workflow_id, .. }
            | WorkflowEvent::WorkflowResumed { workflow_id, .. }
            | WorkflowEvent::NodeStarted { workflow_id, .. }
            | WorkflowEvent::NodeCompleted { workflow_id, .. }
            | WorkflowEvent::NodeFailed { workflow_id, .. }
            | WorkflowEvent::WorkflowPaused { workflow_id, .. }
            | WorkflowEvent::WorkflowCompleted { workflow_id, .. }
            | WorkflowEvent::WorkflowFailed { workflow_id, .. } => workflow_id,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::WorkflowStarted { execution_id, .. }
            | WorkflowEvent::WorkflowResumed { execution_id, .. }
            | WorkflowEvent::NodeStarted { execution_id, .. }
            | WorkflowEvent::NodeCompleted { execution_id, .. }
            | WorkflowEvent::NodeFailed { execution_id, .. }
            | WorkflowEvent::WorkflowPaused { execution_id, .. }
            | WorkflowEvent::WorkflowCompleted { execution_id, .. }
            | WorkflowEvent::WorkflowFailed { execution_id, .. } => *execution_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            WorkflowEvent::WorkflowStarted { timestamp, .. }
            | WorkflowEvent::WorkflowResumed { timestamp, .. }
            | WorkflowEvent::NodeStarted { timestamp, .. }
            | WorkflowEvent::NodeCompleted { timestamp, .. }
            | WorkflowEvent::NodeFailed { timestamp, .. }
            | WorkflowEvent::WorkflowPaused { timestamp, .. }
            | WorkflowEvent::WorkflowCompleted { timestamp, .. }
            | WorkflowEvent::WorkflowFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Whether this event ends the execution's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::WorkflowPaused { .. }
                | WorkflowEvent::WorkflowCompleted { .. }
                | WorkflowEvent::WorkflowFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serde_roundtrip() {
        let event = WorkflowEvent::NodeCompleted {
            workflow_id: "order-flow".to_string(),
            execution_id: Uuid::now_v7(),
            node_id: "charge".to_string(),
            duration_ms: 1500,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"node_completed\""));
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed,
            WorkflowEvent::NodeCompleted { duration_ms: 1500, .. }
        ));
    }

    #[test]
    fn accessors_and_terminal_flag() {
        let id = Uuid::now_v7();
        let started = WorkflowEvent::WorkflowStarted {
            workflow_id: "wf".to_string(),
            execution_id: id,
            timestamp: Utc::now(),
        };
        assert_eq!(started.workflow_id(), "wf");
        assert_eq!(started.execution_id(), id);
        assert!(!started.is_terminal());

        let paused = WorkflowEvent::WorkflowPaused {
            workflow_id: "wf".to_string(),
            execution_id: id,
            node_id: "review".to_string(),
            wait_key: "approve".to_string(),
            timestamp: Utc::now(),
        };
        assert!(paused.is_terminal());
    }
}
