use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a single node failed at run time.
///
/// Clone + serde so it can travel inside a `WorkflowExecutionResult`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeError {
    #[error("operation '{operation}' failed: {message}")]
    OperationFailed { operation: String, message: String },

    #[error("operation '{operation}' is not registered")]
    OperationNotFound { operation: String },

    #[error("node '{from}' references unknown node '{to}'")]
    DanglingReference { from: String, to: String },

    #[error("predicate evaluation failed: {message}")]
    Predicate { message: String },

    #[error("branch '{branch}' failed: {cause}")]
    BranchFailed {
        branch: String,
        cause: Box<WorkflowFailure>,
    },

    #[error("sub-workflow cycle detected: {}", .stack.join(" -> "))]
    SubWorkflowCycle {
        workflow_id: String,
        stack: Vec<String>,
    },

    #[error("sub-workflow depth {depth} exceeds maximum {max}")]
    SubWorkflowDepthExceeded { depth: u32, max: u32 },

    #[error("unknown sub-workflow '{workflow_id}'")]
    UnknownWorkflow { workflow_id: String },

    #[error("sub-workflow '{workflow_id}' failed: {cause}")]
    SubWorkflowFailed {
        workflow_id: String,
        cause: Box<WorkflowFailure>,
    },

    #[error("step limit of {limit} node dispatches exceeded")]
    StepLimitExceeded { limit: u32 },

    #[error("suspended state does not match the node: {reason}")]
    ResumeMismatch { reason: String },
}

/// A failed run: the offending node (if any) and the error it raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub error: NodeError,
}

impl WorkflowFailure {
    pub fn at(node_id: impl Into<String>, error: NodeError) -> Self {
        Self {
            node_id: Some(node_id.into()),
            error,
        }
    }

    /// Follow branch / sub-workflow causes down to the innermost failure.
    pub fn root_cause(&self) -> &WorkflowFailure {
        match &self.error {
            NodeError::BranchFailed { cause, .. } | NodeError::SubWorkflowFailed { cause, .. } => {
                cause.root_cause()
            }
            _ => self,
        }
    }
}

impl fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "node '{node}': {}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for WorkflowFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// A resume state that cannot be applied to the workflow it was given.
///
/// Distinct from `NodeError`: the execution itself is unrecoverable, no
/// operation was attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResumeError {
    #[error("resume state belongs to workflow '{found}', not '{expected}'")]
    WorkflowMismatch { expected: String, found: String },

    #[error("paused node '{node_id}' does not exist in workflow '{workflow_id}'")]
    UnknownNode {
        workflow_id: String,
        node_id: String,
    },

    #[error("resume state is incompatible with node '{node_id}': {reason}")]
    IncompatibleState { node_id: String, reason: String },
}

// ---------------------------------------------------------------------------
// Structural validation report
// ---------------------------------------------------------------------------

/// Category of a structural problem found by `validate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingStartNode,
    DuplicateNodeId,
    DanglingReference,
    UnknownOperation,
    MissingSuccessor,
    UnknownWorkflow,
    Cycle,
    InvalidVersion,
}

/// One structural error, keyed by the offending node when there is one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub kind: IssueKind,
    pub message: String,
}

impl ValidationIssue {
    pub fn node(node_id: impl Into<String>, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            kind,
            message: message.into(),
        }
    }

    pub fn workflow(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            node_id: None,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "[{node}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}
