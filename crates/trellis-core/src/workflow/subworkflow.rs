//! Sub-workflow invocation.
//!
//! A `SubWorkflow` node runs another catalog workflow inline, awaited by the
//! parent walk, under a fresh execution id. The chain of workflow ids in
//! flight guards against recursion; nesting is also capped by
//! `max_sub_workflow_depth`.

use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use trellis_types::error::NodeError;
use trellis_types::execution::{SuspendedAt, WorkflowResumeState};
use trellis_types::workflow::{WorkflowDefinition, WorkflowNode};
use uuid::Uuid;

use super::context::ExecutionContext;
use super::dag::GraphIndex;
use super::engine::{Cursor, NodeStep, Scope, WalkOutcome, WorkflowEngine};

impl WorkflowEngine {
    pub(super) async fn run_sub_workflow(
        &self,
        scope: &Scope<'_>,
        node: &WorkflowNode,
        workflow_id: &str,
        merge_outputs: bool,
        next: Option<&str>,
        ctx: &mut ExecutionContext,
    ) -> NodeStep {
        if scope.call_stack.iter().any(|id| id == workflow_id) {
            let mut stack = scope.call_stack.clone();
            stack.push(workflow_id.to_string());
            return NodeStep::Fail(NodeError::SubWorkflowCycle {
                workflow_id: workflow_id.to_string(),
                stack,
            });
        }

        let depth = scope.call_stack.len() as u32;
        let max = self.config().max_sub_workflow_depth;
        if depth > max {
            return NodeStep::Fail(NodeError::SubWorkflowDepthExceeded { depth, max });
        }

        let Some(child) = self.catalog().get(workflow_id) else {
            return NodeStep::Fail(NodeError::UnknownWorkflow {
                workflow_id: workflow_id.to_string(),
            });
        };

        let variables = ExecutionContext::initial_variables(
            &child.variables,
            Value::Object(ctx.variables.clone()),
        );
        let mut child_ctx =
            ExecutionContext::new(Uuid::now_v7(), variables, self.config().max_output_bytes);
        debug!(
            node_id = %node.id,
            workflow_id,
            child_execution_id = %child_ctx.execution_id,
            depth,
            "invoking sub-workflow"
        );

        let cursor = Cursor::At(Some(child.start_node.clone()));
        let outcome = self.run_child(scope, &child, &mut child_ctx, cursor).await;
        absorb_child(node, &child, child_ctx, outcome, merge_outputs, next, ctx)
    }

    /// Resume a nested run that paused, then continue the parent node.
    pub(super) async fn resume_sub_workflow(
        &self,
        scope: &Scope<'_>,
        node: &WorkflowNode,
        state: WorkflowResumeState,
        input: Value,
        merge_outputs: bool,
        next: Option<&str>,
        ctx: &mut ExecutionContext,
    ) -> NodeStep {
        let Some(child) = self.catalog().get(&state.workflow_id) else {
            return NodeStep::Fail(NodeError::UnknownWorkflow {
                workflow_id: state.workflow_id,
            });
        };

        let mut child_ctx = ExecutionContext::from_suspension(
            state.execution_id,
            &state.suspension,
            self.config().max_output_bytes,
        );
        let cursor = Cursor::Resume {
            node_id: state.suspension.paused_node_id,
            frame: state.suspension.frame,
            input,
        };
        let outcome = self.run_child(scope, &child, &mut child_ctx, cursor).await;
        absorb_child(node, &child, child_ctx, outcome, merge_outputs, next, ctx)
    }

    async fn run_child(
        &self,
        scope: &Scope<'_>,
        child: &WorkflowDefinition,
        child_ctx: &mut ExecutionContext,
        cursor: Cursor,
    ) -> WalkOutcome {
        let graph = GraphIndex::new(child);
        let mut call_stack = scope.call_stack.clone();
        call_stack.push(child.id.clone());

        let child_scope = Scope {
            registry: scope.registry,
            workflow: child,
            graph: &graph,
            execution_id: child_ctx.execution_id,
            emitter: scope.emitter,
            spans: scope.spans,
            parent_span: scope.parent_span.clone(),
            call_stack,
            steps: scope.steps,
        };
        self.drive(child_scope, child_ctx, cursor).await
    }
}

/// Fold a nested run's outcome into the parent node's step.
fn absorb_child(
    node: &WorkflowNode,
    child: &WorkflowDefinition,
    child_ctx: ExecutionContext,
    outcome: WalkOutcome,
    merge_outputs: bool,
    next: Option<&str>,
    ctx: &mut ExecutionContext,
) -> NodeStep {
    match outcome {
        WalkOutcome::Completed => {
            ctx.record_output(&node.id, child_ctx.output(), merge_outputs);
            NodeStep::Continue(next.map(str::to_string))
        }
        WalkOutcome::Failed(failure) => NodeStep::Fail(NodeError::SubWorkflowFailed {
            workflow_id: child.id.clone(),
            cause: Box::new(failure),
        }),
        WalkOutcome::Suspended { suspension, wait } => NodeStep::Suspend {
            frame: SuspendedAt::SubWorkflow {
                child: Box::new(WorkflowResumeState {
                    workflow_id: child.id.clone(),
                    execution_id: child_ctx.execution_id,
                    wait: wait.clone(),
                    paused_at: Utc::now(),
                    suspension,
                }),
            },
            wait,
        },
    }
}
