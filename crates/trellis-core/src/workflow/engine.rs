//! Execution engine: walks a `WorkflowDefinition` node by node.
//!
//! One `execute`/`resume` call is one logical thread of execution. Every
//! operation dispatch is an await point; parallel branches are polled
//! concurrently inside the same task (see `parallel`), and sub-workflows run
//! inline, awaited by their parent (see `subworkflow`).
//!
//! Control outcomes never travel on the error channel: a node finishes by
//! continuing, suspending, or failing (`NodeStep`), and a walk ends by
//! completing, suspending, or failing (`WalkOutcome`).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};
use trellis_observe::attrs;
use trellis_types::config::EngineConfig;
use trellis_types::error::{NodeError, ResumeError, ValidationIssue, WorkflowFailure};
use trellis_types::event::WorkflowEvent;
use trellis_types::execution::{
    ExecutionOutcome, PauseSignal, SuspendedAt, Suspension, WorkflowExecutionResult,
    WorkflowResumeState,
};
use trellis_types::trace::{AttributeValue, SpanStatus};
use trellis_types::workflow::{NodeKind, WorkflowDefinition, WorkflowNode};
use uuid::Uuid;

use super::context::ExecutionContext;
use super::dag::{validate_graph, GraphIndex};
use super::definition::WorkflowCatalog;
use super::expression::evaluate_predicate;
use super::spans::SpanCollector;
use crate::event::{EventEmitter, EventHub};
use crate::operation::{OperationOutcome, OperationRegistry};

// ---------------------------------------------------------------------------
// Walk plumbing
// ---------------------------------------------------------------------------

/// How a single node finished.
pub(super) enum NodeStep {
    /// Advance to the given successor; `None` ends the walk.
    Continue(Option<String>),
    /// Stop here; `frame` records what must be resumed at this node.
    Suspend { frame: SuspendedAt, wait: PauseSignal },
    Fail(NodeError),
}

/// How a walk (a whole run, or one parallel branch) finished.
pub(super) enum WalkOutcome {
    Completed,
    Suspended {
        suspension: Suspension,
        wait: PauseSignal,
    },
    Failed(WorkflowFailure),
}

/// Where a walk begins.
pub(super) enum Cursor {
    /// Dispatch this node first (`None` is an empty walk).
    At(Option<String>),
    /// Finish a node suspended earlier, then continue after it.
    Resume {
        node_id: String,
        frame: SuspendedAt,
        input: Value,
    },
}

/// Everything a walk shares with the nodes it dispatches.
///
/// Nested runs get a copy with their own workflow, graph, and execution id;
/// the registry, emitter, span collector, and step counter are shared by the
/// whole top-level call.
#[derive(Clone)]
pub(super) struct Scope<'a> {
    pub registry: &'a OperationRegistry,
    pub workflow: &'a WorkflowDefinition,
    pub graph: &'a GraphIndex<'a>,
    pub execution_id: Uuid,
    pub emitter: &'a EventEmitter,
    pub spans: &'a SpanCollector,
    pub parent_span: Option<String>,
    /// Workflow ids in flight, outermost first. The last entry is this run.
    pub call_stack: Vec<String>,
    pub steps: &'a AtomicU32,
}

impl Scope<'_> {
    pub fn under(&self, span_id: &str) -> Self {
        Self {
            parent_span: Some(span_id.to_string()),
            ..self.clone()
        }
    }

    /// Sub-workflow nesting depth of this run (0 at top level).
    pub fn depth(&self) -> usize {
        self.call_stack.len().saturating_sub(1)
    }

    pub fn emit(&self, event: WorkflowEvent) {
        self.emitter.emit(event);
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Interprets workflow graphs against a caller-supplied operation registry.
///
/// The engine holds no per-run state: concurrent `execute` calls on one
/// engine are independent. It owns the sub-workflow catalog and the event
/// hub that subscribers attach to.
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    config: EngineConfig,
    catalog: WorkflowCatalog,
    events: EventHub,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig) -> Self {
        let events = EventHub::new(config.event_capacity);
        Self {
            config,
            catalog: WorkflowCatalog::new(),
            events,
        }
    }

    /// Definitions that `SubWorkflow` nodes may invoke.
    pub fn with_catalog(mut self, catalog: WorkflowCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    /// Lifecycle event hub. Subscribe before `execute_with_id` to observe a
    /// run from its first event.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Run `workflow` from its start node.
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        registry: &OperationRegistry,
        input: Value,
    ) -> WorkflowExecutionResult {
        self.execute_with_id(Uuid::now_v7(), workflow, registry, input)
            .await
    }

    /// Run `workflow` under a caller-chosen execution id.
    pub async fn execute_with_id(
        &self,
        execution_id: Uuid,
        workflow: &WorkflowDefinition,
        registry: &OperationRegistry,
        input: Value,
    ) -> WorkflowExecutionResult {
        let variables = ExecutionContext::initial_variables(&workflow.variables, input);
        let mut ctx = ExecutionContext::new(execution_id, variables, self.config.max_output_bytes);
        let cursor = Cursor::At(Some(workflow.start_node.clone()));
        self.run_top_level(workflow, registry, &mut ctx, cursor).await
    }

    /// Continue a paused execution.
    ///
    /// The paused node is not re-executed: `resume_input` stands in for its
    /// result (recorded as its output and merged into variables when it is
    /// an object) and the walk continues at its successor. Nested frames
    /// (sub-workflows, parallel branches) are resumed innermost first.
    pub async fn resume(
        &self,
        workflow: &WorkflowDefinition,
        registry: &OperationRegistry,
        state: WorkflowResumeState,
        resume_input: Value,
    ) -> Result<WorkflowExecutionResult, ResumeError> {
        self.check_resume_state(workflow, &state)?;

        let WorkflowResumeState {
            execution_id,
            suspension,
            ..
        } = state;
        let mut ctx =
            ExecutionContext::from_suspension(execution_id, &suspension, self.config.max_output_bytes);
        let cursor = Cursor::Resume {
            node_id: suspension.paused_node_id,
            frame: suspension.frame,
            input: resume_input,
        };
        Ok(self.run_top_level(workflow, registry, &mut ctx, cursor).await)
    }

    /// Structural problems in `workflow`. Executes nothing.
    pub fn validate(
        &self,
        workflow: &WorkflowDefinition,
        registry: &OperationRegistry,
    ) -> Vec<ValidationIssue> {
        validate_graph(workflow, registry, &self.catalog)
    }

    async fn run_top_level(
        &self,
        workflow: &WorkflowDefinition,
        registry: &OperationRegistry,
        ctx: &mut ExecutionContext,
        cursor: Cursor,
    ) -> WorkflowExecutionResult {
        let started = Instant::now();
        let execution_id = ctx.execution_id;
        let graph = GraphIndex::new(workflow);
        let emitter = self.events.open(execution_id);
        let spans = SpanCollector::new();
        let steps = AtomicU32::new(0);

        let scope = Scope {
            registry,
            workflow,
            graph: &graph,
            execution_id,
            emitter: &emitter,
            spans: &spans,
            parent_span: None,
            call_stack: vec![workflow.id.clone()],
            steps: &steps,
        };

        let run_span = info_span!(
            "workflow.run",
            workflow_id = %workflow.id,
            execution_id = %execution_id,
        );
        let outcome = self.drive(scope, ctx, cursor).instrument(run_span).await;
        self.events.close(execution_id);

        let outcome = match outcome {
            WalkOutcome::Completed => ExecutionOutcome::Completed {
                output: ctx.output(),
            },
            WalkOutcome::Failed(error) => ExecutionOutcome::Failed { error },
            WalkOutcome::Suspended { suspension, wait } => ExecutionOutcome::Paused {
                resume_state: Box::new(WorkflowResumeState {
                    workflow_id: workflow.id.clone(),
                    execution_id,
                    wait,
                    paused_at: Utc::now(),
                    suspension,
                }),
            },
        };

        WorkflowExecutionResult {
            workflow_id: workflow.id.clone(),
            execution_id,
            execution_time_ms: started.elapsed().as_millis() as u64,
            nodes_executed: ctx.nodes_executed.clone(),
            outputs: ctx.outputs.clone(),
            outcome,
            spans: spans.snapshot(),
        }
    }

    /// Run one workflow (top-level or nested) inside its root span,
    /// bracketed by lifecycle events.
    pub(super) fn drive<'a>(
        &'a self,
        scope: Scope<'a>,
        ctx: &'a mut ExecutionContext,
        cursor: Cursor,
    ) -> BoxFuture<'a, WalkOutcome> {
        Box::pin(async move {
            let workflow = scope.workflow;
            let execution_id = scope.execution_id;
            let started = Instant::now();

            let mut root_attrs = BTreeMap::new();
            root_attrs.insert(attrs::WORKFLOW_ID.to_string(), AttributeValue::from(workflow.id.as_str()));
            root_attrs.insert(
                attrs::WORKFLOW_VERSION.to_string(),
                AttributeValue::from(workflow.version.as_str()),
            );
            root_attrs.insert(
                attrs::EXECUTION_ID.to_string(),
                AttributeValue::from(execution_id.to_string()),
            );
            root_attrs.insert(attrs::WORKFLOW_DEPTH.to_string(), AttributeValue::Int(scope.depth() as i64));
            let root = scope.spans.start(
                format!("workflow {}", workflow.id),
                scope.parent_span.as_deref(),
                root_attrs,
            );

            match &cursor {
                Cursor::Resume { node_id, .. } => {
                    info!(workflow_id = %workflow.id, %execution_id, node_id = %node_id, "workflow resumed");
                    let mut event_attrs = BTreeMap::new();
                    event_attrs.insert(attrs::NODE_ID.to_string(), AttributeValue::from(node_id.as_str()));
                    scope.spans.add_event(&root, attrs::EVENT_RESUMED, event_attrs);
                    scope.emit(WorkflowEvent::WorkflowResumed {
                        workflow_id: workflow.id.clone(),
                        execution_id,
                        node_id: node_id.clone(),
                        timestamp: Utc::now(),
                    });
                }
                Cursor::At(_) => {
                    info!(workflow_id = %workflow.id, %execution_id, depth = scope.depth(), "workflow started");
                    scope.emit(WorkflowEvent::WorkflowStarted {
                        workflow_id: workflow.id.clone(),
                        execution_id,
                        timestamp: Utc::now(),
                    });
                }
            }

            let outcome = self.walk(scope.under(&root), ctx, cursor).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match &outcome {
                WalkOutcome::Completed => {
                    scope.spans.finish(&root, SpanStatus::ok());
                    info!(workflow_id = %workflow.id, %execution_id, duration_ms, "workflow completed");
                    scope.emit(WorkflowEvent::WorkflowCompleted {
                        workflow_id: workflow.id.clone(),
                        execution_id,
                        duration_ms,
                        nodes_executed: ctx.nodes_executed.len() as u32,
                        timestamp: Utc::now(),
                    });
                }
                WalkOutcome::Failed(failure) => {
                    scope.spans.finish(&root, SpanStatus::error(failure.to_string()));
                    warn!(workflow_id = %workflow.id, %execution_id, error = %failure, "workflow failed");
                    scope.emit(WorkflowEvent::WorkflowFailed {
                        workflow_id: workflow.id.clone(),
                        execution_id,
                        error: failure.to_string(),
                        timestamp: Utc::now(),
                    });
                }
                WalkOutcome::Suspended { suspension, wait } => {
                    scope.spans.add_event(&root, attrs::EVENT_PAUSED, pause_attributes(wait));
                    scope.spans.end(&root);
                    info!(
                        workflow_id = %workflow.id,
                        %execution_id,
                        node_id = %suspension.paused_node_id,
                        wait_key = %wait.key,
                        "workflow paused"
                    );
                    scope.emit(WorkflowEvent::WorkflowPaused {
                        workflow_id: workflow.id.clone(),
                        execution_id,
                        node_id: suspension.paused_node_id.clone(),
                        wait_key: wait.key.clone(),
                        timestamp: Utc::now(),
                    });
                }
            }

            outcome
        })
    }

    /// Follow successor edges from `cursor` until a terminal node, a pause,
    /// or a failure.
    pub(super) fn walk<'a>(
        &'a self,
        scope: Scope<'a>,
        ctx: &'a mut ExecutionContext,
        cursor: Cursor,
    ) -> BoxFuture<'a, WalkOutcome> {
        Box::pin(async move {
            let (mut current, mut previous) = match cursor {
                Cursor::At(start) => (start, None),
                Cursor::Resume {
                    node_id,
                    frame,
                    input,
                } => {
                    let Some(node) = scope.graph.get(&node_id) else {
                        return WalkOutcome::Failed(dangling(&scope, None, node_id));
                    };
                    let step = self.run_node(&scope, node, ctx, Some((frame, input))).await;
                    match settle(ctx, &node.id, step) {
                        Ok(next) => (next, Some(node.id.clone())),
                        Err(outcome) => return outcome,
                    }
                }
            };

            while let Some(node_id) = current {
                let Some(node) = scope.graph.get(&node_id) else {
                    return WalkOutcome::Failed(dangling(&scope, previous, node_id));
                };

                let dispatched = scope.steps.fetch_add(1, Ordering::Relaxed) + 1;
                if dispatched > self.config.max_steps {
                    return WalkOutcome::Failed(WorkflowFailure::at(
                        node_id,
                        NodeError::StepLimitExceeded {
                            limit: self.config.max_steps,
                        },
                    ));
                }

                let step = self.run_node(&scope, node, ctx, None).await;
                match settle(ctx, &node.id, step) {
                    Ok(next) => {
                        previous = Some(node_id);
                        current = next;
                    }
                    Err(outcome) => return outcome,
                }
            }

            WalkOutcome::Completed
        })
    }

    /// Dispatch (or finish resuming) one node inside its own span.
    async fn run_node(
        &self,
        scope: &Scope<'_>,
        node: &WorkflowNode,
        ctx: &mut ExecutionContext,
        resume: Option<(SuspendedAt, Value)>,
    ) -> NodeStep {
        let span_id = scope.spans.start(
            node.id.as_str(),
            scope.parent_span.as_deref(),
            node_attributes(scope.workflow, node),
        );
        if resume.is_some() {
            scope.spans.add_event(&span_id, attrs::EVENT_RESUMED, BTreeMap::new());
        }
        scope.emit(WorkflowEvent::NodeStarted {
            workflow_id: scope.workflow.id.clone(),
            execution_id: scope.execution_id,
            node_id: node.id.clone(),
            node_type: node.node_type().to_string(),
            timestamp: Utc::now(),
        });

        let started = Instant::now();
        let node_scope = scope.under(&span_id);
        let tracing_span = info_span!(
            "workflow.node",
            node_id = %node.id,
            node_type = %node.node_type(),
            workflow_id = %scope.workflow.id,
        );
        let step = match resume {
            None => {
                self.dispatch(&node_scope, node, ctx, &span_id)
                    .instrument(tracing_span)
                    .await
            }
            Some((frame, input)) => {
                self.continue_frame(&node_scope, node, ctx, frame, input)
                    .instrument(tracing_span)
                    .await
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &step {
            NodeStep::Continue(_) => {
                ctx.mark_executed(&node.id);
                scope.spans.finish(&span_id, SpanStatus::ok());
                debug!(node_id = %node.id, duration_ms, "node completed");
                scope.emit(WorkflowEvent::NodeCompleted {
                    workflow_id: scope.workflow.id.clone(),
                    execution_id: scope.execution_id,
                    node_id: node.id.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
            }
            NodeStep::Suspend { wait, .. } => {
                scope.spans.add_event(&span_id, attrs::EVENT_PAUSED, pause_attributes(wait));
                scope.spans.end(&span_id);
                debug!(node_id = %node.id, wait_key = %wait.key, "node paused");
            }
            NodeStep::Fail(error) => {
                scope.spans.finish(&span_id, SpanStatus::error(error.to_string()));
                debug!(node_id = %node.id, error = %error, "node failed");
                scope.emit(WorkflowEvent::NodeFailed {
                    workflow_id: scope.workflow.id.clone(),
                    execution_id: scope.execution_id,
                    node_id: node.id.clone(),
                    error: error.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
        step
    }

    async fn dispatch(
        &self,
        scope: &Scope<'_>,
        node: &WorkflowNode,
        ctx: &mut ExecutionContext,
        span_id: &str,
    ) -> NodeStep {
        match &node.kind {
            NodeKind::Operation {
                operation,
                config,
                next,
            } => {
                let Some(handler) = scope.registry.get(operation) else {
                    return NodeStep::Fail(NodeError::OperationNotFound {
                        operation: operation.clone(),
                    });
                };
                match handler.call(ctx.call_input(config)).await {
                    Ok(OperationOutcome::Completed(value)) => {
                        ctx.record_output(&node.id, value, true);
                        NodeStep::Continue(next.clone())
                    }
                    Ok(OperationOutcome::Paused(wait)) => NodeStep::Suspend {
                        frame: SuspendedAt::Operation,
                        wait,
                    },
                    Err(e) => NodeStep::Fail(NodeError::OperationFailed {
                        operation: operation.clone(),
                        message: e.to_string(),
                    }),
                }
            }
            NodeKind::Condition {
                predicate,
                true_branch,
                false_branch,
            } => match evaluate_predicate(predicate, &ctx.view()) {
                Ok(taken) => {
                    scope.spans.set_attribute(span_id, attrs::CONDITION_RESULT, taken);
                    let branch = if taken { true_branch } else { false_branch };
                    NodeStep::Continue(Some(branch.clone()))
                }
                Err(e) => NodeStep::Fail(NodeError::Predicate {
                    message: e.to_string(),
                }),
            },
            NodeKind::Sequence { next } => NodeStep::Continue(next.clone()),
            NodeKind::Parallel {
                branches,
                wait_for_all,
                next,
            } => {
                self.run_parallel(scope, node, branches, *wait_for_all, next.as_deref(), ctx)
                    .await
            }
            NodeKind::SubWorkflow {
                workflow_id,
                merge_outputs,
                next,
            } => {
                self.run_sub_workflow(scope, node, workflow_id, *merge_outputs, next.as_deref(), ctx)
                    .await
            }
        }
    }

    /// Finish a node that was suspended, without re-running its operation.
    async fn continue_frame(
        &self,
        scope: &Scope<'_>,
        node: &WorkflowNode,
        ctx: &mut ExecutionContext,
        frame: SuspendedAt,
        input: Value,
    ) -> NodeStep {
        match (frame, &node.kind) {
            (SuspendedAt::Operation, NodeKind::Operation { next, .. }) => {
                ctx.record_resume_input(&node.id, input);
                NodeStep::Continue(next.clone())
            }
            (
                SuspendedAt::SubWorkflow { child },
                NodeKind::SubWorkflow {
                    merge_outputs,
                    next,
                    ..
                },
            ) => {
                self.resume_sub_workflow(scope, node, *child, input, *merge_outputs, next.as_deref(), ctx)
                    .await
            }
            (
                SuspendedAt::Parallel { branches },
                NodeKind::Parallel {
                    wait_for_all,
                    next,
                    ..
                },
            ) => {
                self.resume_parallel(scope, node, branches, *wait_for_all, next.as_deref(), input, ctx)
                    .await
            }
            (frame, kind) => NodeStep::Fail(NodeError::ResumeMismatch {
                reason: format!(
                    "{} frame cannot resume a {} node",
                    frame_name(&frame),
                    kind.node_type()
                ),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Turn a node step into the next node id, or the outcome that ends the walk.
fn settle(
    ctx: &ExecutionContext,
    node_id: &str,
    step: NodeStep,
) -> Result<Option<String>, WalkOutcome> {
    match step {
        NodeStep::Continue(next) => Ok(next),
        NodeStep::Suspend { frame, wait } => Err(WalkOutcome::Suspended {
            suspension: ctx.suspend(node_id, frame),
            wait,
        }),
        NodeStep::Fail(error) => Err(WalkOutcome::Failed(WorkflowFailure::at(node_id, error))),
    }
}

fn dangling(scope: &Scope<'_>, from: Option<String>, to: String) -> WorkflowFailure {
    let from_id = from.clone().unwrap_or_else(|| scope.workflow.id.clone());
    WorkflowFailure {
        node_id: from,
        error: NodeError::DanglingReference { from: from_id, to },
    }
}

pub(super) fn frame_name(frame: &SuspendedAt) -> &'static str {
    match frame {
        SuspendedAt::Operation => "operation",
        SuspendedAt::SubWorkflow { .. } => "sub_workflow",
        SuspendedAt::Parallel { .. } => "parallel",
    }
}

fn pause_attributes(wait: &PauseSignal) -> BTreeMap<String, AttributeValue> {
    let mut attributes = BTreeMap::new();
    attributes.insert(attrs::PAUSE_KEY.to_string(), AttributeValue::from(wait.key.as_str()));
    attributes
}

fn node_attributes(
    workflow: &WorkflowDefinition,
    node: &WorkflowNode,
) -> BTreeMap<String, AttributeValue> {
    let mut attributes = BTreeMap::new();
    attributes.insert(attrs::NODE_ID.to_string(), AttributeValue::from(node.id.as_str()));
    attributes.insert(
        attrs::NODE_TYPE.to_string(),
        AttributeValue::from(node.node_type().as_str()),
    );
    attributes.insert(attrs::WORKFLOW_ID.to_string(), AttributeValue::from(workflow.id.as_str()));

    match &node.kind {
        NodeKind::Operation {
            operation, config, ..
        } => {
            attributes.insert(
                attrs::OPERATION_NAME.to_string(),
                AttributeValue::from(operation.as_str()),
            );
            for (key, value) in config {
                if let Some(value) = AttributeValue::from_json(value) {
                    attributes.insert(format!("{}{key}", attrs::NODE_CONFIG_PREFIX), value);
                }
            }
        }
        NodeKind::Parallel {
            branches,
            wait_for_all,
            ..
        } => {
            attributes.insert(
                attrs::PARALLEL_BRANCHES.to_string(),
                AttributeValue::Int(branches.len() as i64),
            );
            attributes.insert(
                attrs::PARALLEL_WAIT_FOR_ALL.to_string(),
                AttributeValue::Bool(*wait_for_all),
            );
        }
        NodeKind::SubWorkflow { workflow_id, .. } => {
            attributes.insert(
                attrs::SUB_WORKFLOW_ID.to_string(),
                AttributeValue::from(workflow_id.as_str()),
            );
        }
        NodeKind::Condition { .. } | NodeKind::Sequence { .. } => {}
    }
    attributes
}
