//! Resume-state validation.
//!
//! A `WorkflowResumeState` is caller-held data and may have been stored,
//! edited, or paired with the wrong definition. Everything is checked up
//! front, down through nested sub-workflow and parallel frames, so a bad
//! state is rejected before any node runs.

use trellis_types::error::ResumeError;
use trellis_types::execution::{BranchState, SuspendedAt, Suspension, WorkflowResumeState};
use trellis_types::workflow::{NodeKind, WorkflowDefinition};

use super::engine::{frame_name, WorkflowEngine};

impl WorkflowEngine {
    pub(super) fn check_resume_state(
        &self,
        workflow: &WorkflowDefinition,
        state: &WorkflowResumeState,
    ) -> Result<(), ResumeError> {
        if state.workflow_id != workflow.id {
            return Err(ResumeError::WorkflowMismatch {
                expected: workflow.id.clone(),
                found: state.workflow_id.clone(),
            });
        }
        self.check_suspension(workflow, &state.suspension)
    }

    fn check_suspension(
        &self,
        workflow: &WorkflowDefinition,
        suspension: &Suspension,
    ) -> Result<(), ResumeError> {
        let node_id = &suspension.paused_node_id;
        let Some(node) = workflow.node(node_id) else {
            return Err(ResumeError::UnknownNode {
                workflow_id: workflow.id.clone(),
                node_id: node_id.clone(),
            });
        };
        let incompatible = |reason: String| ResumeError::IncompatibleState {
            node_id: node_id.clone(),
            reason,
        };

        match (&suspension.frame, &node.kind) {
            (SuspendedAt::Operation, NodeKind::Operation { .. }) => Ok(()),
            (SuspendedAt::SubWorkflow { child }, NodeKind::SubWorkflow { workflow_id, .. }) => {
                if child.workflow_id != *workflow_id {
                    return Err(incompatible(format!(
                        "nested state belongs to '{}', node invokes '{workflow_id}'",
                        child.workflow_id
                    )));
                }
                let Some(child_def) = self.catalog().get(workflow_id) else {
                    return Err(incompatible(format!(
                        "sub-workflow '{workflow_id}' is not in the catalog"
                    )));
                };
                self.check_resume_state(&child_def, child)
            }
            (SuspendedAt::Parallel { branches: snapshots }, NodeKind::Parallel { branches, .. }) => {
                let mut any_suspended = false;
                for snapshot in snapshots {
                    if !branches.contains(&snapshot.entry) {
                        return Err(incompatible(format!(
                            "'{}' is not a branch of this node",
                            snapshot.entry
                        )));
                    }
                    if let BranchState::Suspended { suspension } = &snapshot.state {
                        any_suspended = true;
                        self.check_suspension(workflow, suspension)?;
                    }
                }
                if !any_suspended {
                    return Err(incompatible("no branch is suspended".to_string()));
                }
                Ok(())
            }
            (frame, kind) => Err(incompatible(format!(
                "{} frame cannot resume a {} node",
                frame_name(frame),
                kind.node_type()
            ))),
        }
    }
}
