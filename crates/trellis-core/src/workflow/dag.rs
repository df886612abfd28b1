//! Graph indexing and structural validation.
//!
//! `GraphIndex` gives the engine O(1) node lookup. `validate_graph` checks a
//! definition without running it: references, registry coverage, successor
//! presence, and acyclicity via a `petgraph` topological sort over the
//! successor edges.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use trellis_types::error::{IssueKind, ValidationIssue};
use trellis_types::workflow::{NodeKind, WorkflowDefinition, WorkflowNode};

use super::definition::WorkflowCatalog;
use crate::operation::OperationRegistry;

// ---------------------------------------------------------------------------
// GraphIndex
// ---------------------------------------------------------------------------

/// Id -> node lookup for one definition. On duplicate ids the first
/// declaration wins (duplicates are a validation error).
#[derive(Debug)]
pub struct GraphIndex<'a> {
    nodes: HashMap<&'a str, &'a WorkflowNode>,
}

impl<'a> GraphIndex<'a> {
    pub fn new(definition: &'a WorkflowDefinition) -> Self {
        let mut nodes = HashMap::with_capacity(definition.nodes.len());
        for node in &definition.nodes {
            nodes.entry(node.id.as_str()).or_insert(node);
        }
        Self { nodes }
    }

    pub fn get(&self, id: &str) -> Option<&'a WorkflowNode> {
        self.nodes.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Structural validation
// ---------------------------------------------------------------------------

/// Every structural problem in `definition`, in declaration order.
///
/// An empty result means the definition is safe to execute against
/// `registry` and `catalog`. Nothing is executed.
pub fn validate_graph(
    definition: &WorkflowDefinition,
    registry: &OperationRegistry,
    catalog: &WorkflowCatalog,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let index = GraphIndex::new(definition);

    if semver::Version::parse(&definition.version).is_err() {
        issues.push(ValidationIssue::workflow(
            IssueKind::InvalidVersion,
            format!("version '{}' is not valid semver", definition.version),
        ));
    }

    if !index.contains(&definition.start_node) {
        issues.push(ValidationIssue::workflow(
            IssueKind::MissingStartNode,
            format!("start node '{}' does not exist", definition.start_node),
        ));
    }

    let mut seen = HashSet::new();
    for node in &definition.nodes {
        if !seen.insert(node.id.as_str()) {
            issues.push(ValidationIssue::node(
                &node.id,
                IssueKind::DuplicateNodeId,
                format!("node id '{}' is declared more than once", node.id),
            ));
            continue;
        }
        check_node(node, definition, &index, registry, catalog, &mut issues);
    }

    if let Some(node_id) = find_cycle(definition, &index) {
        issues.push(ValidationIssue::node(
            node_id,
            IssueKind::Cycle,
            format!("cycle detected involving node '{node_id}'"),
        ));
    }

    issues
}

fn check_node(
    node: &WorkflowNode,
    definition: &WorkflowDefinition,
    index: &GraphIndex<'_>,
    registry: &OperationRegistry,
    catalog: &WorkflowCatalog,
    issues: &mut Vec<ValidationIssue>,
) {
    match &node.kind {
        NodeKind::Operation { operation, .. } => {
            if !registry.contains(operation) {
                issues.push(ValidationIssue::node(
                    &node.id,
                    IssueKind::UnknownOperation,
                    format!("operation '{operation}' is not registered"),
                ));
            }
        }
        NodeKind::Condition {
            true_branch,
            false_branch,
            ..
        } => {
            if true_branch.is_empty() || false_branch.is_empty() {
                issues.push(ValidationIssue::node(
                    &node.id,
                    IssueKind::MissingSuccessor,
                    "condition must declare both a true and a false branch",
                ));
            }
        }
        NodeKind::Parallel { branches, .. } => {
            if branches.is_empty() {
                issues.push(ValidationIssue::node(
                    &node.id,
                    IssueKind::MissingSuccessor,
                    "parallel node declares no branches",
                ));
            }
        }
        NodeKind::SubWorkflow { workflow_id, .. } => {
            if *workflow_id != definition.id && !catalog.contains(workflow_id) {
                issues.push(ValidationIssue::node(
                    &node.id,
                    IssueKind::UnknownWorkflow,
                    format!("sub-workflow '{workflow_id}' is not in the catalog"),
                ));
            }
        }
        NodeKind::Sequence { .. } => {}
    }

    let mut reported = HashSet::new();
    for target in node.kind.successors() {
        if target.is_empty() || index.contains(target) || !reported.insert(target) {
            continue;
        }
        issues.push(ValidationIssue::node(
            &node.id,
            IssueKind::DanglingReference,
            format!("node '{}' references unknown node '{target}'", node.id),
        ));
    }
}

/// First node found on a cycle, if any. Dangling edges are ignored.
fn find_cycle<'a>(definition: &'a WorkflowDefinition, index: &GraphIndex<'a>) -> Option<&'a str> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices = HashMap::new();
    for node in &definition.nodes {
        indices
            .entry(node.id.as_str())
            .or_insert_with(|| graph.add_node(node.id.as_str()));
    }

    for node in &definition.nodes {
        // Only the first declaration of an id contributes edges.
        if !index.get(&node.id).is_some_and(|n| std::ptr::eq(n, node)) {
            continue;
        }
        let from = indices[node.id.as_str()];
        for target in node.kind.successors() {
            if let Some(&to) = indices.get(target) {
                graph.add_edge(from, to, ());
            }
        }
    }

    toposort(&graph, None).err().map(|cycle| graph[cycle.node_id()])
}
