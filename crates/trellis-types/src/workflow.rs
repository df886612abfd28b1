//! Workflow graph types for Trellis.
//!
//! Defines the canonical node graph that the compiler emits and the engine
//! walks: a flat, id-addressable list of `WorkflowNode`s with explicit
//! successor links. YAML files, JSON payloads, and the fluent builder all
//! converge on `WorkflowDefinition`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Variable bindings: name -> value. Later writes overwrite the same key.
pub type Variables = Map<String, Value>;

// ---------------------------------------------------------------------------
// Workflow Definition (canonical node graph)
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Immutable once constructed. The engine only ever reads it; whoever built
/// or loaded it owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable key used by sub-workflow references and resume states.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Semantic version string (e.g. "1.0.0").
    pub version: String,
    /// Id of the node the walk starts from.
    pub start_node: String,
    /// Ordered node list. Node ids are unique within a definition.
    pub nodes: Vec<WorkflowNode>,
    /// Initial variable bindings, overridden by the caller's input.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Variables,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Extensible metadata for custom integrations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Whether a node with this id exists.
    pub fn contains_node(&self, id: &str) -> bool {
        self.node(id).is_some()
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique node id within the definition.
    pub id: String,
    /// Typed behavior and successor links.
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }
}

/// Node behavior, internally tagged by `type`:
///
/// ```yaml
/// - id: charge
///   type: operation
///   operation: payments.charge
///   next: notify
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Invoke an externally registered operation.
    Operation {
        operation: String,
        /// Static configuration merged over the variables into the call input.
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        config: Variables,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
    },
    /// Branch on a predicate over the execution view.
    Condition {
        predicate: Predicate,
        true_branch: String,
        false_branch: String,
    },
    /// Fan out to concurrent branch walks, then continue at `next`.
    Parallel {
        branches: Vec<String>,
        #[serde(default = "default_wait_for_all")]
        wait_for_all: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
    },
    /// No-op pass-through, used as a join/anchor point.
    Sequence {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
    },
    /// Run another workflow by id through the same engine.
    SubWorkflow {
        workflow_id: String,
        #[serde(default)]
        merge_outputs: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
    },
}

fn default_wait_for_all() -> bool {
    true
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Operation { .. } => NodeType::Operation,
            NodeKind::Condition { .. } => NodeType::Condition,
            NodeKind::Parallel { .. } => NodeType::Parallel,
            NodeKind::Sequence { .. } => NodeType::Sequence,
            NodeKind::SubWorkflow { .. } => NodeType::SubWorkflow,
        }
    }

    /// The linear successor, for kinds that have one.
    pub fn next(&self) -> Option<&str> {
        match self {
            NodeKind::Operation { next, .. }
            | NodeKind::Parallel { next, .. }
            | NodeKind::Sequence { next }
            | NodeKind::SubWorkflow { next, .. } => next.as_deref(),
            NodeKind::Condition { .. } => None,
        }
    }

    /// Mutable access to the linear successor slot. `None` for conditions.
    pub fn next_mut(&mut self) -> Option<&mut Option<String>> {
        match self {
            NodeKind::Operation { next, .. }
            | NodeKind::Parallel { next, .. }
            | NodeKind::Sequence { next }
            | NodeKind::SubWorkflow { next, .. } => Some(next),
            NodeKind::Condition { .. } => None,
        }
    }

    /// Every node id this node can transfer control to, in declaration order.
    pub fn successors(&self) -> Vec<&str> {
        match self {
            NodeKind::Condition {
                true_branch,
                false_branch,
                ..
            } => vec![true_branch.as_str(), false_branch.as_str()],
            NodeKind::Parallel { branches, next, .. } => branches
                .iter()
                .map(String::as_str)
                .chain(next.as_deref())
                .collect(),
            other => other.next().into_iter().collect(),
        }
    }
}

/// The kind of a node, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Operation,
    Condition,
    Parallel,
    Sequence,
    SubWorkflow,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Operation => "operation",
            NodeType::Condition => "condition",
            NodeType::Parallel => "parallel",
            NodeType::Sequence => "sequence",
            NodeType::SubWorkflow => "sub_workflow",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// A pure, synchronous test over the execution view.
///
/// Expression predicates are JEXL strings evaluated against
/// `{ "variables": {...}, "outputs": {...} }` and survive serialization.
/// Native predicates exist only in memory (builder-compiled graphs) and
/// refuse to serialize.
///
/// On the wire a predicate is a plain map, `{ expression: "..." }`, so it
/// reads back through the internally tagged `NodeKind`.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "PredicateRepr")]
pub enum Predicate {
    Expression(String),
    Native(NativePredicate),
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PredicateRepr {
    expression: String,
}

impl From<PredicateRepr> for Predicate {
    fn from(repr: PredicateRepr) -> Self {
        Predicate::Expression(repr.expression)
    }
}

impl Serialize for Predicate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Predicate::Expression(expression) => PredicateRepr {
                expression: expression.clone(),
            }
            .serialize(serializer),
            Predicate::Native(_) => Err(serde::ser::Error::custom(
                "native predicates cannot be serialized",
            )),
        }
    }
}

impl Predicate {
    pub fn expression(expr: impl Into<String>) -> Self {
        Predicate::Expression(expr.into())
    }

    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&ExecutionView<'_>) -> bool + Send + Sync + 'static,
    {
        Predicate::Native(NativePredicate(Arc::new(f)))
    }
}

/// In-memory predicate closure.
#[derive(Clone)]
pub struct NativePredicate(Arc<dyn Fn(&ExecutionView<'_>) -> bool + Send + Sync>);

impl NativePredicate {
    pub fn test(&self, view: &ExecutionView<'_>) -> bool {
        (self.0)(view)
    }
}

impl fmt::Debug for NativePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NativePredicate(..)")
    }
}

/// Read-only view of an execution's state handed to predicates.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionView<'a> {
    pub variables: &'a Variables,
    pub outputs: &'a Variables,
}

impl<'a> ExecutionView<'a> {
    pub fn new(variables: &'a Variables, outputs: &'a Variables) -> Self {
        Self { variables, outputs }
    }

    pub fn variable(&self, name: &str) -> Option<&'a Value> {
        self.variables.get(name)
    }

    pub fn output(&self, node_id: &str) -> Option<&'a Value> {
        self.outputs.get(node_id)
    }

    /// JSON shape used for expression evaluation.
    pub fn to_value(&self) -> Value {
        json!({
            "variables": self.variables,
            "outputs": self.outputs,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
