//! Execution outcome and suspension types.
//!
//! `WorkflowExecutionResult` is what every `execute`/`resume` call produces.
//! `WorkflowResumeState` is the only piece of engine state meant to cross a
//! suspend/resume boundary, so it is plain serde data throughout: strings,
//! numbers, and nested objects, suitable for an external store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::WorkflowFailure;
use crate::trace::TraceSpan;
use crate::workflow::Variables;

// ---------------------------------------------------------------------------
// Status and result
// ---------------------------------------------------------------------------

/// Terminal status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Paused,
}

/// How a run ended, with the data that belongs to that ending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed { output: Value },
    Failed { error: WorkflowFailure },
    Paused { resume_state: Box<WorkflowResumeState> },
}

/// Result of one `execute` or `resume` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionResult {
    pub workflow_id: String,
    pub execution_id: Uuid,
    /// Wall-clock duration of this call in milliseconds.
    pub execution_time_ms: u64,
    /// Node ids in the order they completed.
    pub nodes_executed: Vec<String>,
    /// Node results keyed by node id, as of the end of this call.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub outputs: Variables,
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
    /// Spans collected during the run, in start order.
    #[serde(default)]
    pub spans: Vec<TraceSpan>,
}

impl WorkflowExecutionResult {
    pub fn status(&self) -> ExecutionStatus {
        match self.outcome {
            ExecutionOutcome::Completed { .. } => ExecutionStatus::Completed,
            ExecutionOutcome::Failed { .. } => ExecutionStatus::Failed,
            ExecutionOutcome::Paused { .. } => ExecutionStatus::Paused,
        }
    }

    pub fn execution_time(&self) -> Duration {
        Duration::from_millis(self.execution_time_ms)
    }

    pub fn output(&self) -> Option<&Value> {
        match &self.outcome {
            ExecutionOutcome::Completed { output } => Some(output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&WorkflowFailure> {
        match &self.outcome {
            ExecutionOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn resume_state(&self) -> Option<&WorkflowResumeState> {
        match &self.outcome {
            ExecutionOutcome::Paused { resume_state } => Some(resume_state),
            _ => None,
        }
    }

    pub fn into_resume_state(self) -> Option<WorkflowResumeState> {
        match self.outcome {
            ExecutionOutcome::Paused { resume_state } => Some(*resume_state),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Pause signal
// ---------------------------------------------------------------------------

/// Raised by an operation to suspend the enclosing run instead of failing it.
///
/// `key` names what the execution is waiting for (e.g. "approve"). The
/// optional timeout is informational: enforcing it is the caller's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseSignal {
    pub key: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl PauseSignal {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload: Value::Null,
            timeout_ms: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

// ---------------------------------------------------------------------------
// Resume state
// ---------------------------------------------------------------------------

/// Serializable snapshot needed to continue a paused run later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResumeState {
    pub workflow_id: String,
    pub execution_id: Uuid,
    /// What the execution is waiting for (first leaf pause reached).
    pub wait: PauseSignal,
    pub paused_at: DateTime<Utc>,
    #[serde(flatten)]
    pub suspension: Suspension,
}

impl WorkflowResumeState {
    pub fn paused_node_id(&self) -> &str {
        &self.suspension.paused_node_id
    }

    pub fn variables(&self) -> &Variables {
        &self.suspension.variables
    }

    pub fn outputs(&self) -> &Variables {
        &self.suspension.outputs
    }

    /// When the wait times out, if the pause declared a timeout.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.wait
            .timeout_ms
            .map(|ms| self.paused_at + chrono::Duration::milliseconds(ms as i64))
    }
}

/// A suspended walk: where it stopped and the state it held at that point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspension {
    pub paused_node_id: String,
    pub variables: Variables,
    pub outputs: Variables,
    #[serde(default)]
    pub nodes_executed: Vec<String>,
    /// Output of the last node this walk completed before pausing.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub last_output: Value,
    pub frame: SuspendedAt,
}

/// What is suspended at the paused node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuspendedAt {
    /// The node's own operation raised the pause signal.
    Operation,
    /// A nested run paused; it must be resumed before the parent continues.
    SubWorkflow { child: Box<WorkflowResumeState> },
    /// One or more branches paused; the rest finished or are snapshotted.
    Parallel { branches: Vec<BranchSnapshot> },
}

/// State of one parallel branch at pause time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSnapshot {
    /// Branch entry node id (also the key in the joined output).
    pub entry: String,
    pub state: BranchState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BranchState {
    Completed {
        variables: Variables,
        outputs: Variables,
        #[serde(default)]
        nodes_executed: Vec<String>,
        #[serde(default)]
        last_output: Value,
    },
    Suspended { suspension: Box<Suspension> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn paused_state() -> WorkflowResumeState {
        let mut variables = Map::new();
        variables.insert("order".to_string(), json!(42));
        WorkflowResumeState {
            workflow_id: "order-flow".to_string(),
            execution_id: Uuid::nil(),
            wait: PauseSignal::new("approve").with_timeout(Duration::from_secs(60)),
            paused_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            suspension: Suspension {
                paused_node_id: "review".to_string(),
                variables,
                outputs: Map::new(),
                nodes_executed: vec!["load".to_string()],
                last_output: Value::Null,
                frame: SuspendedAt::Operation,
            },
        }
    }

    #[test]
    fn resume_state_is_a_flat_record() {
        let state = paused_state();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["paused_node_id"], "review");
        assert_eq!(json["variables"]["order"], 42);
        assert_eq!(json["frame"]["kind"], "operation");
        assert_eq!(json["wait"]["key"], "approve");

        let back: WorkflowResumeState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn deadline_adds_timeout_to_pause_time() {
        let state = paused_state();
        let deadline = state.deadline().unwrap();
        assert_eq!((deadline - state.paused_at).num_seconds(), 60);
    }

    #[test]
    fn result_accessors_follow_outcome() {
        let result = WorkflowExecutionResult {
            workflow_id: "order-flow".to_string(),
            execution_id: Uuid::nil(),
            execution_time_ms: 12,
            nodes_executed: vec!["load".to_string()],
            outputs: Map::new(),
            outcome: ExecutionOutcome::Paused {
                resume_state: Box::new(paused_state()),
            },
            spans: vec![],
        };
        assert_eq!(result.status(), ExecutionStatus::Paused);
        assert!(result.output().is_none());
        assert_eq!(result.resume_state().unwrap().paused_node_id(), "review");
        assert_eq!(result.execution_time(), Duration::from_millis(12));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "paused");
    }
}
