//! Mutable state that flows through one walk of a workflow graph.
//!
//! `ExecutionContext` holds the run's variables, the append-only node output
//! map, and the trail of completed nodes. Parallel branches each get a forked
//! copy and are joined back in declaration order.

use serde_json::{json, Value};
use tracing::warn;
use trellis_types::execution::{BranchState, Suspension, SuspendedAt};
use trellis_types::workflow::{ExecutionView, Variables};
use uuid::Uuid;

/// Variable name that holds a non-object execute input.
pub const INPUT_VARIABLE: &str = "input";

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub variables: Variables,
    /// Node outputs keyed by node id. Written at most once per node.
    pub outputs: Variables,
    /// Completed node ids, in completion order.
    pub nodes_executed: Vec<String>,
    pub last_output: Value,
    max_output_bytes: usize,
}

impl ExecutionContext {
    pub fn new(execution_id: Uuid, variables: Variables, max_output_bytes: usize) -> Self {
        Self {
            execution_id,
            variables,
            outputs: Variables::new(),
            nodes_executed: Vec::new(),
            last_output: Value::Null,
            max_output_bytes,
        }
    }

    /// Rebuild the state a suspended walk held when it paused.
    pub fn from_suspension(execution_id: Uuid, suspension: &Suspension, max_output_bytes: usize) -> Self {
        Self {
            execution_id,
            variables: suspension.variables.clone(),
            outputs: suspension.outputs.clone(),
            nodes_executed: suspension.nodes_executed.clone(),
            last_output: suspension.last_output.clone(),
            max_output_bytes,
        }
    }

    /// Starting variables for a run: the definition's declared defaults with
    /// the caller's input applied on top.
    ///
    /// An object input is merged key by key. Any other non-null input is
    /// stored under [`INPUT_VARIABLE`].
    pub fn initial_variables(defaults: &Variables, input: Value) -> Variables {
        let mut variables = defaults.clone();
        match input {
            Value::Object(map) => variables.extend(map),
            Value::Null => {}
            other => {
                variables.insert(INPUT_VARIABLE.to_string(), other);
            }
        }
        variables
    }

    pub fn view(&self) -> ExecutionView<'_> {
        ExecutionView::new(&self.variables, &self.outputs)
    }

    /// Input for an operation call: current variables with the node's static
    /// config merged over them.
    pub fn call_input(&self, config: &Variables) -> Value {
        let mut input = self.variables.clone();
        input.extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));
        Value::Object(input)
    }

    /// Store a node's result.
    ///
    /// Oversized results are replaced by a truncation marker and never reach
    /// variables. Otherwise, when `merge` is set and the result is an object,
    /// its keys are merged into variables.
    pub fn record_output(&mut self, node_id: &str, output: Value, merge: bool) {
        let (output, truncated) = self.limit_size(node_id, output);
        if merge && !truncated {
            if let Value::Object(map) = &output {
                self.variables
                    .extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        self.outputs.insert(node_id.to_string(), output.clone());
        self.last_output = output;
    }

    /// Record the data a paused operation was resumed with as its result.
    /// A non-object, non-null input is also stored under [`INPUT_VARIABLE`].
    pub fn record_resume_input(&mut self, node_id: &str, input: Value) {
        if !input.is_object() && !input.is_null() {
            self.variables
                .insert(INPUT_VARIABLE.to_string(), input.clone());
        }
        self.record_output(node_id, input, true);
    }

    pub fn mark_executed(&mut self, node_id: &str) {
        self.nodes_executed.push(node_id.to_string());
    }

    /// Copy of this context for a parallel branch. The branch starts with
    /// the same variables and outputs and an empty trail.
    pub fn fork(&self) -> Self {
        Self {
            execution_id: self.execution_id,
            variables: self.variables.clone(),
            outputs: self.outputs.clone(),
            nodes_executed: Vec::new(),
            last_output: Value::Null,
            max_output_bytes: self.max_output_bytes,
        }
    }

    /// Rebuild a branch from its snapshot, forking limits from `self`.
    pub fn restore_branch(&self, state: &BranchState) -> Self {
        match state {
            BranchState::Completed {
                variables,
                outputs,
                nodes_executed,
                last_output,
            } => Self {
                execution_id: self.execution_id,
                variables: variables.clone(),
                outputs: outputs.clone(),
                nodes_executed: nodes_executed.clone(),
                last_output: last_output.clone(),
                max_output_bytes: self.max_output_bytes,
            },
            BranchState::Suspended { suspension } => {
                Self::from_suspension(self.execution_id, suspension, self.max_output_bytes)
            }
        }
    }

    /// Snapshot a finished branch so it survives a suspend/resume boundary.
    pub fn to_branch_state(&self) -> BranchState {
        BranchState::Completed {
            variables: self.variables.clone(),
            outputs: self.outputs.clone(),
            nodes_executed: self.nodes_executed.clone(),
            last_output: self.last_output.clone(),
        }
    }

    /// Fold finished branches back in, in the order given.
    ///
    /// A variable is taken from a branch only if the branch changed it
    /// relative to this context, so untouched keys never clobber a sibling's
    /// write. New output keys and branch trails are appended.
    pub fn join(&mut self, branches: Vec<ExecutionContext>) {
        let base = self.variables.clone();
        for branch in branches {
            for (key, value) in branch.variables {
                if base.get(&key) != Some(&value) {
                    self.variables.insert(key, value);
                }
            }
            for (key, value) in branch.outputs {
                if !self.outputs.contains_key(&key) {
                    self.outputs.insert(key, value);
                }
            }
            self.nodes_executed.extend(branch.nodes_executed);
        }
    }

    /// Capture this walk's state at a pause.
    pub fn suspend(&self, paused_node_id: &str, frame: SuspendedAt) -> Suspension {
        Suspension {
            paused_node_id: paused_node_id.to_string(),
            variables: self.variables.clone(),
            outputs: self.outputs.clone(),
            nodes_executed: self.nodes_executed.clone(),
            last_output: self.last_output.clone(),
            frame,
        }
    }

    /// Final output of a completed run: the variables object.
    pub fn output(&self) -> Value {
        Value::Object(self.variables.clone())
    }

    fn limit_size(&self, node_id: &str, output: Value) -> (Value, bool) {
        let size = serde_json::to_vec(&output).map(|b| b.len()).unwrap_or(0);
        if size <= self.max_output_bytes {
            return (output, false);
        }
        warn!(
            node_id,
            size,
            max = self.max_output_bytes,
            "node output exceeds size limit, truncating"
        );
        let marker = json!({
            "_truncated": true,
            "_original_size": size,
            "_message": format!(
                "output exceeded {} byte limit and was truncated",
                self.max_output_bytes
            ),
        });
        (marker, true)
    }
}
