//! Parallel fan-out and join.
//!
//! Each branch walks its own forked `ExecutionContext` from the branch entry
//! until the branch runs out of successors. Branches are polled together in
//! one `FuturesUnordered`, so they interleave at every await point without
//! spawning tasks; dropping the set cancels whatever is still pending.
//!
//! With `wait_for_all` the first branch failure fails the node and cancels
//! the rest. Without it the first branch to complete wins and the others are
//! cancelled. Either way the joined output is keyed by branch entry id.

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use tracing::debug;
use trellis_types::error::NodeError;
use trellis_types::execution::{BranchSnapshot, BranchState, SuspendedAt};
use trellis_types::workflow::WorkflowNode;

use super::context::ExecutionContext;
use super::engine::{Cursor, NodeStep, Scope, WalkOutcome, WorkflowEngine};

/// A branch walk that has finished, one way or another.
struct BranchRun {
    /// Position in the parallel node's declared branch list.
    index: usize,
    entry: String,
    outcome: WalkOutcome,
    ctx: ExecutionContext,
}

impl BranchRun {
    fn is_suspended(&self) -> bool {
        matches!(self.outcome, WalkOutcome::Suspended { .. })
    }
}

type PendingBranches<'a> = FuturesUnordered<BoxFuture<'a, BranchRun>>;

impl WorkflowEngine {
    pub(super) async fn run_parallel(
        &self,
        scope: &Scope<'_>,
        node: &WorkflowNode,
        branches: &[String],
        wait_for_all: bool,
        next: Option<&str>,
        ctx: &mut ExecutionContext,
    ) -> NodeStep {
        debug!(
            node_id = %node.id,
            branches = branches.len(),
            wait_for_all,
            "fanning out parallel branches"
        );

        let pending: PendingBranches<'_> = branches
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                self.branch_walk(
                    scope.clone(),
                    index,
                    entry.clone(),
                    ctx.fork(),
                    Cursor::At(Some(entry.clone())),
                )
            })
            .collect();

        self.join_branches(node, pending, Vec::new(), wait_for_all, next, ctx)
            .await
    }

    /// Resume a parallel node from its branch snapshots.
    ///
    /// Completed branches are restored as-is; every suspended branch is
    /// resumed with the same `input`, and the join proceeds as on a first run.
    pub(super) async fn resume_parallel(
        &self,
        scope: &Scope<'_>,
        node: &WorkflowNode,
        snapshots: Vec<BranchSnapshot>,
        wait_for_all: bool,
        next: Option<&str>,
        input: Value,
        ctx: &mut ExecutionContext,
    ) -> NodeStep {
        let mut ready = Vec::new();
        let pending: PendingBranches<'_> = FuturesUnordered::new();

        for (index, BranchSnapshot { entry, state }) in snapshots.into_iter().enumerate() {
            let branch = ctx.restore_branch(&state);
            match state {
                BranchState::Completed { .. } => ready.push(BranchRun {
                    index,
                    entry,
                    outcome: WalkOutcome::Completed,
                    ctx: branch,
                }),
                BranchState::Suspended { suspension } => {
                    let cursor = Cursor::Resume {
                        node_id: suspension.paused_node_id,
                        frame: suspension.frame,
                        input: input.clone(),
                    };
                    pending.push(self.branch_walk(scope.clone(), index, entry, branch, cursor));
                }
            }
        }

        debug!(
            node_id = %node.id,
            completed = ready.len(),
            resuming = pending.len(),
            "resuming parallel branches"
        );
        self.join_branches(node, pending, ready, wait_for_all, next, ctx)
            .await
    }

    fn branch_walk<'a>(
        &'a self,
        scope: Scope<'a>,
        index: usize,
        entry: String,
        mut branch: ExecutionContext,
        cursor: Cursor,
    ) -> BoxFuture<'a, BranchRun> {
        Box::pin(async move {
            let outcome = self.walk(scope, &mut branch, cursor).await;
            BranchRun {
                index,
                entry,
                outcome,
                ctx: branch,
            }
        })
    }

    async fn join_branches(
        &self,
        node: &WorkflowNode,
        mut pending: PendingBranches<'_>,
        ready: Vec<BranchRun>,
        wait_for_all: bool,
        next: Option<&str>,
        ctx: &mut ExecutionContext,
    ) -> NodeStep {
        if wait_for_all {
            let mut finished = ready;
            while let Some(mut run) = pending.next().await {
                if let WalkOutcome::Failed(failure) = run.outcome {
                    debug!(node_id = %node.id, branch = %run.entry, "branch failed, cancelling siblings");
                    let branch = run.entry.clone();
                    run.outcome = WalkOutcome::Completed;
                    finished.push(run);
                    keep_trails(&mut finished, ctx);
                    return NodeStep::Fail(NodeError::BranchFailed {
                        branch,
                        cause: Box::new(failure),
                    });
                }
                finished.push(run);
            }
            finished.sort_by_key(|run| run.index);
            return settle_branches(node, finished, next, ctx);
        }

        // First completion wins.
        let mut settled = Vec::new();
        for run in ready {
            if matches!(run.outcome, WalkOutcome::Completed) {
                return complete(node, vec![run], next, ctx);
            }
            settled.push(run);
        }
        while let Some(run) = pending.next().await {
            if matches!(run.outcome, WalkOutcome::Completed) {
                debug!(node_id = %node.id, branch = %run.entry, "race won, cancelling siblings");
                return complete(node, vec![run], next, ctx);
            }
            settled.push(run);
        }
        settled.sort_by_key(|run| run.index);
        if settled.iter().any(BranchRun::is_suspended) {
            settled.retain(BranchRun::is_suspended);
            return settle_branches(node, settled, next, ctx);
        }

        keep_trails(&mut settled, ctx);
        let Some(first) = settled.into_iter().next() else {
            return complete(node, Vec::new(), next, ctx);
        };
        match first.outcome {
            WalkOutcome::Failed(failure) => NodeStep::Fail(NodeError::BranchFailed {
                branch: first.entry,
                cause: Box::new(failure),
            }),
            _ => complete(node, vec![first], next, ctx),
        }
    }
}

/// Complete the node, or suspend it if any branch is waiting.
fn settle_branches(
    node: &WorkflowNode,
    runs: Vec<BranchRun>,
    next: Option<&str>,
    ctx: &mut ExecutionContext,
) -> NodeStep {
    let wait = runs.iter().find_map(|run| match &run.outcome {
        WalkOutcome::Suspended { wait, .. } => Some(wait.clone()),
        _ => None,
    });
    let Some(wait) = wait else {
        return complete(node, runs, next, ctx);
    };

    let branches = runs
        .into_iter()
        .map(|run| {
            let state = match run.outcome {
                WalkOutcome::Suspended { suspension, .. } => BranchState::Suspended {
                    suspension: Box::new(suspension),
                },
                _ => run.ctx.to_branch_state(),
            };
            BranchSnapshot {
                entry: run.entry,
                state,
            }
        })
        .collect();

    NodeStep::Suspend {
        frame: SuspendedAt::Parallel { branches },
        wait,
    }
}

/// Append the trails of branches that ran before the node failed, in
/// declaration order.
fn keep_trails(runs: &mut [BranchRun], ctx: &mut ExecutionContext) {
    runs.sort_by_key(|run| run.index);
    for run in runs.iter_mut() {
        ctx.nodes_executed.append(&mut run.ctx.nodes_executed);
    }
}

/// Fold branch contexts back in and record `{entry: last_output}` as the
/// parallel node's output.
fn complete(
    node: &WorkflowNode,
    runs: Vec<BranchRun>,
    next: Option<&str>,
    ctx: &mut ExecutionContext,
) -> NodeStep {
    let mut joined = Map::new();
    let mut contexts = Vec::with_capacity(runs.len());
    for run in runs {
        joined.insert(run.entry, run.ctx.last_output.clone());
        contexts.push(run.ctx);
    }
    ctx.join(contexts);
    ctx.record_output(&node.id, Value::Object(joined), false);
    NodeStep::Continue(next.map(str::to_string))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use serde_json::json;
    use trellis_types::config::EngineConfig;
    use trellis_types::execution::ExecutionStatus;

    use crate::operation::{OperationError, OperationOutcome, OperationRegistry};
    use crate::workflow::builder::{Component, Step, WorkflowBuilder};
    use crate::workflow::engine::WorkflowEngine;

    fn sleeper(registry: &mut OperationRegistry, name: &str, ms: u64, value: serde_json::Value) {
        registry.register_fn(name, move |_input| {
            let value = value.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, OperationError>(OperationOutcome::value(value))
            }
        });
    }

    #[tokio::test]
    async fn branches_run_concurrently_and_key_outputs_by_entry() {
        let mut registry = OperationRegistry::new();
        sleeper(&mut registry, "slow.a", 10, json!("a-done"));
        sleeper(&mut registry, "slow.b", 50, json!("b-done"));

        let compiled = WorkflowBuilder::new("fan", "Fan out")
            .add(Component::parallel(
                "fan",
                vec![
                    Step::new("a", "slow.a").into(),
                    Step::new("b", "slow.b").into(),
                ],
            ))
            .build()
            .unwrap();
        registry.extend(&compiled.operations);

        let engine = WorkflowEngine::new(EngineConfig::default());
        let started = Instant::now();
        let result = engine.execute(&compiled.definition, &registry, json!({})).await;
        let elapsed = started.elapsed();

        assert_eq!(result.status(), ExecutionStatus::Completed);
        assert!(elapsed >= Duration::from_millis(50));
        assert_eq!(result.outputs["fan"], json!({"a": "a-done", "b": "b-done"}));

        let fan = result
            .spans
            .iter()
            .find(|s| s.name == "fan")
            .expect("parallel span");
        assert!(fan.is_closed());

        let trail = &result.nodes_executed;
        assert!(trail.contains(&"a".to_string()));
        assert!(trail.contains(&"b".to_string()));
        let fan_pos = trail.iter().position(|n| n == "fan").unwrap();
        assert!(trail.iter().position(|n| n == "a").unwrap() < fan_pos);
        assert!(trail.iter().position(|n| n == "b").unwrap() < fan_pos);
    }

    #[tokio::test]
    async fn branches_overlap_in_time() {
        let mut registry = OperationRegistry::new();
        sleeper(&mut registry, "wait", 80, json!(null));

        let def = serde_json::from_value(json!({
            "id": "overlap",
            "name": "Overlap",
            "version": "1.0.0",
            "start_node": "fan",
            "nodes": [
                {"id": "fan", "type": "parallel", "branches": ["x", "y"]},
                {"id": "x", "type": "operation", "operation": "wait"},
                {"id": "y", "type": "operation", "operation": "wait"}
            ]
        }))
        .unwrap();

        let engine = WorkflowEngine::new(EngineConfig::default());
        let started = Instant::now();
        let result = engine.execute(&def, &registry, json!({})).await;
        assert_eq!(result.status(), ExecutionStatus::Completed);
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn joined_output_is_keyed_by_branch_entry() {
        let mut registry = OperationRegistry::new();
        sleeper(&mut registry, "left", 5, json!({"left": 1}));
        sleeper(&mut registry, "right", 1, json!({"right": 2}));

        let def = serde_json::from_value(json!({
            "id": "join",
            "name": "Join",
            "version": "1.0.0",
            "start_node": "fan",
            "nodes": [
                {"id": "fan", "type": "parallel", "branches": ["l", "r"], "next": "done"},
                {"id": "l", "type": "operation", "operation": "left"},
                {"id": "r", "type": "operation", "operation": "right"},
                {"id": "done", "type": "sequence"}
            ]
        }))
        .unwrap();

        let engine = WorkflowEngine::new(EngineConfig::default());
        let result = engine.execute(&def, &registry, json!({"seed": true})).await;
        let output = result.output().expect("completed");
        assert_eq!(output["left"], 1);
        assert_eq!(output["right"], 2);
        assert_eq!(output["seed"], true);
        assert_eq!(result.nodes_executed.last().map(String::as_str), Some("done"));
    }

    #[tokio::test]
    async fn branch_failure_fails_the_node_and_cancels_siblings() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut registry = OperationRegistry::new();
        registry.register_fn("boom", |_input| async {
            Err::<OperationOutcome, _>(OperationError::failed("exploded"))
        });
        let counter = finished.clone();
        registry.register_fn("slow", move |_input| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OperationError>(OperationOutcome::value(json!(null)))
            }
        });

        let def = serde_json::from_value(json!({
            "id": "fail-fast",
            "name": "Fail fast",
            "version": "1.0.0",
            "start_node": "fan",
            "nodes": [
                {"id": "fan", "type": "parallel", "branches": ["bad", "good"]},
                {"id": "bad", "type": "operation", "operation": "boom"},
                {"id": "good", "type": "operation", "operation": "slow"}
            ]
        }))
        .unwrap();

        let engine = WorkflowEngine::new(EngineConfig::default());
        let started = Instant::now();
        let result = engine.execute(&def, &registry, json!({})).await;

        assert_eq!(result.status(), ExecutionStatus::Failed);
        assert!(started.elapsed() < Duration::from_millis(200));
        let error = result.error().unwrap();
        assert_eq!(error.node_id.as_deref(), Some("fan"));
        match &error.error {
            trellis_types::error::NodeError::BranchFailed { branch, .. } => assert_eq!(branch, "bad"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(error.root_cause().node_id.as_deref(), Some("bad"));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_fan_out_keeps_completed_branch_trails() {
        let mut registry = OperationRegistry::new();
        sleeper(&mut registry, "quick", 0, json!({"ok": true}));
        registry.register_fn("late_boom", |_input| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Err::<OperationOutcome, _>(OperationError::failed("late"))
        });

        let def = serde_json::from_value(json!({
            "id": "partial",
            "name": "Partial",
            "version": "1.0.0",
            "start_node": "pre",
            "nodes": [
                {"id": "pre", "type": "operation", "operation": "quick", "next": "fan"},
                {"id": "fan", "type": "parallel", "branches": ["a", "b1"]},
                {"id": "a", "type": "operation", "operation": "quick"},
                {"id": "b1", "type": "operation", "operation": "quick", "next": "bad"},
                {"id": "bad", "type": "operation", "operation": "late_boom"}
            ]
        }))
        .unwrap();

        let engine = WorkflowEngine::new(EngineConfig::default());
        let result = engine.execute(&def, &registry, json!({})).await;

        assert_eq!(result.status(), ExecutionStatus::Failed);
        assert_eq!(result.nodes_executed, vec!["pre", "a", "b1"]);
    }

    #[tokio::test]
    async fn race_takes_first_completion() {
        let mut registry = OperationRegistry::new();
        sleeper(&mut registry, "fast", 5, json!({"winner": "fast"}));
        sleeper(&mut registry, "slow", 300, json!({"winner": "slow"}));

        let compiled = WorkflowBuilder::new("race", "Race")
            .add(Component::race(
                "race",
                vec![
                    Step::new("slow-branch", "slow").into(),
                    Step::new("fast-branch", "fast").into(),
                ],
            ))
            .build()
            .unwrap();

        let engine = WorkflowEngine::new(EngineConfig::default());
        let started = Instant::now();
        let result = engine.execute(&compiled.definition, &registry, json!({})).await;

        assert!(started.elapsed() < Duration::from_millis(300));
        let output = result.output().expect("completed");
        assert_eq!(output["winner"], "fast");
        assert!(result.nodes_executed.contains(&"fast-branch".to_string()));
        assert!(!result.nodes_executed.contains(&"slow-branch".to_string()));
    }

    #[tokio::test]
    async fn race_fails_only_when_every_branch_fails() {
        let mut registry = OperationRegistry::new();
        registry.register_fn("nope", |_input| async {
            Err::<OperationOutcome, _>(OperationError::failed("no"))
        });

        let def = serde_json::from_value(json!({
            "id": "all-fail",
            "name": "All fail",
            "version": "1.0.0",
            "start_node": "fan",
            "nodes": [
                {"id": "fan", "type": "parallel", "branches": ["x", "y"], "wait_for_all": false},
                {"id": "x", "type": "operation", "operation": "nope"},
                {"id": "y", "type": "operation", "operation": "nope"}
            ]
        }))
        .unwrap();

        let engine = WorkflowEngine::new(EngineConfig::default());
        let result = engine.execute(&def, &registry, json!({})).await;
        let error = result.error().expect("failed");
        match &error.error {
            trellis_types::error::NodeError::BranchFailed { branch, .. } => assert_eq!(branch, "x"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn branch_writes_do_not_clobber_each_other() {
        let mut registry = OperationRegistry::new();
        sleeper(&mut registry, "first", 1, json!({"shared": "first", "a": 1}));
        sleeper(&mut registry, "second", 10, json!({"b": 2}));

        let def = serde_json::from_value(json!({
            "id": "merge",
            "name": "Merge",
            "version": "1.0.0",
            "start_node": "fan",
            "variables": {"shared": "initial"},
            "nodes": [
                {"id": "fan", "type": "parallel", "branches": ["one", "two"]},
                {"id": "one", "type": "operation", "operation": "first"},
                {"id": "two", "type": "operation", "operation": "second"}
            ]
        }))
        .unwrap();

        let engine = WorkflowEngine::new(EngineConfig::default());
        let result = engine.execute(&def, &registry, json!({})).await;
        let output = result.output().unwrap();
        assert_eq!(output["shared"], "first");
        assert_eq!(output["a"], 1);
        assert_eq!(output["b"], 2);
    }
}
