//! Graph compiler: turns an ordered list of components into a flat
//! `WorkflowDefinition`.
//!
//! Components nest (a condition's branches, a parallel's members, a
//! sequence's children). Compilation walks them depth-first, emits one node
//! per component, splices nested runs into the parent graph, and inserts a
//! synthetic `Sequence` join after every branching construct so control
//! returns to a single point before the next component. Node ids are unique
//! in the output: a colliding id is renamed `id-2`, `id-3`, ...
//!
//! Compilation is pure. Dependency declarations (`uses_output_of`,
//! `requires`) are checked eagerly, so a forward reference fails `build()`
//! instead of surfacing at run time.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use serde_json::Value;
use thiserror::Error;
use trellis_types::workflow::{NodeKind, Predicate, Variables, WorkflowDefinition, WorkflowNode};

use crate::operation::{
    BoxOperation, FnOperation, Operation, OperationError, OperationOutcome, OperationRegistry,
};

/// Suffix for the synthetic join node placed after a branching component.
pub const JOIN_SUFFIX: &str = "__join";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("workflow has no components")]
    Empty,

    #[error("{kind} component has an empty id")]
    EmptyId { kind: &'static str },

    #[error("parallel component '{id}' has no branches")]
    EmptyParallel { id: String },

    #[error("component '{component}' uses the output of '{dependency}', which is not added before it")]
    ForwardReference {
        component: String,
        dependency: String,
    },

    #[error("component '{component}' requires '{key}', which no earlier component produces")]
    UnresolvedInput { component: String, key: String },

    #[error("invalid version '{version}': {message}")]
    InvalidVersion { version: String, message: String },
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// A single operation call.
#[derive(Debug, Clone)]
pub struct Step {
    id: String,
    operation: String,
    config: Variables,
    handler: Option<BoxOperation>,
    uses_output_of: Vec<String>,
    requires: Vec<String>,
    produces: Vec<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation: operation.into(),
            config: Variables::new(),
            handler: None,
            uses_output_of: Vec::new(),
            requires: Vec::new(),
            produces: Vec::new(),
        }
    }

    /// Static configuration merged over the variables on every call.
    pub fn config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Bundle the execution function with the step. It is registered under
    /// the step's operation name in `CompiledWorkflow::operations`.
    pub fn handler<O: Operation + 'static>(mut self, operation: O) -> Self {
        self.handler = Some(BoxOperation::new(operation));
        self
    }

    pub fn handler_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OperationOutcome, OperationError>> + Send + 'static,
    {
        self.handler(FnOperation::new(f))
    }

    /// Declare that this step reads the output of an earlier component.
    pub fn uses_output_of(mut self, component: impl Into<String>) -> Self {
        self.uses_output_of.push(component.into());
        self
    }

    /// Declare a variable this step reads.
    pub fn requires(mut self, key: impl Into<String>) -> Self {
        self.requires.push(key.into());
        self
    }

    /// Declare a variable this step writes.
    pub fn produces(mut self, key: impl Into<String>) -> Self {
        self.produces.push(key.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum Component {
    Step(Step),
    Condition {
        id: String,
        predicate: Predicate,
        then: Box<Component>,
        otherwise: Option<Box<Component>>,
    },
    Parallel {
        id: String,
        branches: Vec<Component>,
        wait_for_all: bool,
    },
    Sequence {
        id: String,
        children: Vec<Component>,
    },
    SubWorkflow {
        id: String,
        workflow_id: String,
        merge_outputs: bool,
    },
}

impl Component {
    pub fn step(id: impl Into<String>, operation: impl Into<String>) -> Step {
        Step::new(id, operation)
    }

    pub fn condition(
        id: impl Into<String>,
        predicate: Predicate,
        then: impl Into<Component>,
        otherwise: impl Into<Component>,
    ) -> Self {
        Component::Condition {
            id: id.into(),
            predicate,
            then: Box::new(then.into()),
            otherwise: Some(Box::new(otherwise.into())),
        }
    }

    /// A condition whose false branch skips straight to the join.
    pub fn when(id: impl Into<String>, predicate: Predicate, then: impl Into<Component>) -> Self {
        Component::Condition {
            id: id.into(),
            predicate,
            then: Box::new(then.into()),
            otherwise: None,
        }
    }

    /// Fan out and wait for every branch.
    pub fn parallel(id: impl Into<String>, branches: Vec<Component>) -> Self {
        Component::Parallel {
            id: id.into(),
            branches,
            wait_for_all: true,
        }
    }

    /// Fan out and continue with the first branch to complete.
    pub fn race(id: impl Into<String>, branches: Vec<Component>) -> Self {
        Component::Parallel {
            id: id.into(),
            branches,
            wait_for_all: false,
        }
    }

    pub fn sequence(id: impl Into<String>, children: Vec<Component>) -> Self {
        Component::Sequence {
            id: id.into(),
            children,
        }
    }

    pub fn sub_workflow(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        merge_outputs: bool,
    ) -> Self {
        Component::SubWorkflow {
            id: id.into(),
            workflow_id: workflow_id.into(),
            merge_outputs,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Component::Step(step) => &step.id,
            Component::Condition { id, .. }
            | Component::Parallel { id, .. }
            | Component::Sequence { id, .. }
            | Component::SubWorkflow { id, .. } => id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Component::Step(_) => "step",
            Component::Condition { .. } => "condition",
            Component::Parallel { .. } => "parallel",
            Component::Sequence { .. } => "sequence",
            Component::SubWorkflow { .. } => "sub_workflow",
        }
    }
}

impl From<Step> for Component {
    fn from(step: Step) -> Self {
        Component::Step(step)
    }
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

/// Output of [`WorkflowBuilder::build`]: the graph plus any handlers bundled
/// with its steps.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub definition: WorkflowDefinition,
    pub operations: OperationRegistry,
}

#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    id: String,
    name: String,
    version: String,
    variables: Variables,
    inputs: Vec<String>,
    tags: Vec<String>,
    metadata: HashMap<String, Value>,
    components: Vec<Component>,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "1.0.0".to_string(),
            variables: Variables::new(),
            inputs: Vec::new(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            components: Vec::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Initial variable binding. The key counts as available to every step.
    pub fn variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Declare a variable the caller supplies at execute time.
    pub fn input(mut self, key: impl Into<String>) -> Self {
        self.inputs.push(key.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Append a top-level component.
    pub fn add(mut self, component: impl Into<Component>) -> Self {
        self.components.push(component.into());
        self
    }

    pub fn build(self) -> Result<CompiledWorkflow, BuildError> {
        if self.components.is_empty() {
            return Err(BuildError::Empty);
        }
        if let Err(e) = semver::Version::parse(&self.version) {
            return Err(BuildError::InvalidVersion {
                version: self.version,
                message: e.to_string(),
            });
        }

        let mut known = Known::default();
        known.keys.extend(self.variables.keys().cloned());
        known.keys.extend(self.inputs.iter().cloned());

        let mut compiler = Compiler::default();
        let fragment = compiler.compile_chain(&self.components, &mut known)?;

        Ok(CompiledWorkflow {
            definition: WorkflowDefinition {
                id: self.id,
                name: self.name,
                version: self.version,
                start_node: fragment.entry,
                nodes: compiler.nodes,
                variables: self.variables,
                tags: self.tags,
                metadata: self.metadata,
            },
            operations: compiler.operations,
        })
    }
}

// ---------------------------------------------------------------------------
// Compiler internals
// ---------------------------------------------------------------------------

/// Component ids and variable keys available at a point in the chain.
#[derive(Debug, Clone, Default)]
struct Known {
    components: HashSet<String>,
    keys: HashSet<String>,
}

impl Known {
    fn absorb(&mut self, other: Known) {
        self.components.extend(other.components);
        self.keys.extend(other.keys);
    }
}

/// A compiled run of nodes: where control enters, and the nodes whose
/// `next` should point at whatever follows.
struct Fragment {
    entry: String,
    tails: Vec<String>,
}

#[derive(Default)]
struct Compiler {
    nodes: Vec<WorkflowNode>,
    positions: HashMap<String, usize>,
    operations: OperationRegistry,
}

impl Compiler {
    fn allocate(&self, requested: &str) -> String {
        if !self.positions.contains_key(requested) {
            return requested.to_string();
        }
        (2..)
            .map(|n| format!("{requested}-{n}"))
            .find(|candidate| !self.positions.contains_key(candidate))
            .unwrap_or_else(|| requested.to_string())
    }

    fn push(&mut self, id: String, kind: NodeKind) -> usize {
        let position = self.nodes.len();
        self.positions.insert(id.clone(), position);
        self.nodes.push(WorkflowNode::new(id, kind));
        position
    }

    fn link(&mut self, tails: &[String], target: &str) {
        for tail in tails {
            if let Some(&position) = self.positions.get(tail) {
                if let Some(next) = self.nodes[position].kind.next_mut() {
                    *next = Some(target.to_string());
                }
            }
        }
    }

    fn compile_chain(&mut self, components: &[Component], known: &mut Known) -> Result<Fragment, BuildError> {
        let mut entry = None;
        let mut tails: Vec<String> = Vec::new();
        for component in components {
            let fragment = self.compile(component, known)?;
            self.link(&tails, &fragment.entry);
            entry.get_or_insert_with(|| fragment.entry.clone());
            tails = fragment.tails;
        }
        entry
            .map(|entry| Fragment { entry, tails })
            .ok_or(BuildError::Empty)
    }

    fn compile(&mut self, component: &Component, known: &mut Known) -> Result<Fragment, BuildError> {
        if component.id().is_empty() {
            return Err(BuildError::EmptyId {
                kind: component.kind(),
            });
        }

        let fragment = match component {
            Component::Step(step) => self.compile_step(step, known)?,
            Component::SubWorkflow {
                id,
                workflow_id,
                merge_outputs,
            } => {
                let id = self.allocate(id);
                self.push(
                    id.clone(),
                    NodeKind::SubWorkflow {
                        workflow_id: workflow_id.clone(),
                        merge_outputs: *merge_outputs,
                        next: None,
                    },
                );
                Fragment {
                    entry: id.clone(),
                    tails: vec![id],
                }
            }
            Component::Sequence { id, children } => {
                let anchor = self.allocate(id);
                self.push(anchor.clone(), NodeKind::Sequence { next: None });
                if children.is_empty() {
                    Fragment {
                        entry: anchor.clone(),
                        tails: vec![anchor],
                    }
                } else {
                    let inner = self.compile_chain(children, known)?;
                    self.link(std::slice::from_ref(&anchor), &inner.entry);
                    Fragment {
                        entry: anchor,
                        tails: inner.tails,
                    }
                }
            }
            Component::Condition {
                id,
                predicate,
                then,
                otherwise,
            } => self.compile_condition(id, predicate, then, otherwise.as_deref(), known)?,
            Component::Parallel {
                id,
                branches,
                wait_for_all,
            } => self.compile_parallel(id, branches, *wait_for_all, known)?,
        };

        known.components.insert(component.id().to_string());
        Ok(fragment)
    }

    fn compile_step(&mut self, step: &Step, known: &mut Known) -> Result<Fragment, BuildError> {
        for dependency in &step.uses_output_of {
            if !known.components.contains(dependency) {
                return Err(BuildError::ForwardReference {
                    component: step.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        for key in &step.requires {
            if !known.keys.contains(key) {
                return Err(BuildError::UnresolvedInput {
                    component: step.id.clone(),
                    key: key.clone(),
                });
            }
        }

        let id = self.allocate(&step.id);
        self.push(
            id.clone(),
            NodeKind::Operation {
                operation: step.operation.clone(),
                config: step.config.clone(),
                next: None,
            },
        );
        if let Some(handler) = &step.handler {
            self.operations.insert(step.operation.clone(), handler.clone());
        }
        known.keys.extend(step.produces.iter().cloned());

        Ok(Fragment {
            entry: id.clone(),
            tails: vec![id],
        })
    }

    fn compile_condition(
        &mut self,
        id: &str,
        predicate: &Predicate,
        then: &Component,
        otherwise: Option<&Component>,
        known: &mut Known,
    ) -> Result<Fragment, BuildError> {
        let id = self.allocate(id);
        // Placeholder until both branch entries are known.
        let position = self.push(id.clone(), NodeKind::Sequence { next: None });

        let mut then_known = known.clone();
        let then_fragment = self.compile(then, &mut then_known)?;
        let mut else_known = known.clone();
        let else_fragment = otherwise
            .map(|component| self.compile(component, &mut else_known))
            .transpose()?;

        let join = self.allocate(&format!("{id}{JOIN_SUFFIX}"));
        self.push(join.clone(), NodeKind::Sequence { next: None });
        self.link(&then_fragment.tails, &join);
        if let Some(fragment) = &else_fragment {
            self.link(&fragment.tails, &join);
        }

        self.nodes[position].kind = NodeKind::Condition {
            predicate: predicate.clone(),
            true_branch: then_fragment.entry,
            false_branch: else_fragment.map_or_else(|| join.clone(), |f| f.entry),
        };

        known.absorb(then_known);
        known.absorb(else_known);
        Ok(Fragment {
            entry: id,
            tails: vec![join],
        })
    }

    fn compile_parallel(
        &mut self,
        id: &str,
        branches: &[Component],
        wait_for_all: bool,
        known: &mut Known,
    ) -> Result<Fragment, BuildError> {
        if branches.is_empty() {
            return Err(BuildError::EmptyParallel { id: id.to_string() });
        }

        let id = self.allocate(id);
        let position = self.push(id.clone(), NodeKind::Sequence { next: None });

        // Branches run concurrently: none may depend on a sibling.
        let mut entries = Vec::with_capacity(branches.len());
        let mut branch_known = Vec::with_capacity(branches.len());
        for branch in branches {
            let mut scope = known.clone();
            let fragment = self.compile(branch, &mut scope)?;
            entries.push(fragment.entry);
            branch_known.push(scope);
        }

        let join = self.allocate(&format!("{id}{JOIN_SUFFIX}"));
        self.push(join.clone(), NodeKind::Sequence { next: None });
        self.nodes[position].kind = NodeKind::Parallel {
            branches: entries,
            wait_for_all,
            next: Some(join.clone()),
        };

        for scope in branch_known {
            known.absorb(scope);
        }
        Ok(Fragment {
            entry: id,
            tails: vec![join],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::workflow::dag::validate_graph;
    use crate::workflow::definition::WorkflowCatalog;

    fn echo(id: &str) -> Step {
        Component::step(id, format!("op.{id}")).handler_fn(|input| async move {
            Ok::<_, OperationError>(OperationOutcome::Completed(input))
        })
    }

    fn next_of<'a>(def: &'a WorkflowDefinition, id: &str) -> Option<&'a str> {
        def.node(id).and_then(|n| n.kind.next())
    }

    #[test]
    fn linear_steps_chain_in_order() {
        let compiled = WorkflowBuilder::new("wf", "Linear")
            .add(echo("a"))
            .add(echo("b"))
            .add(echo("c"))
            .build()
            .unwrap();
        let def = &compiled.definition;

        assert_eq!(def.start_node, "a");
        assert_eq!(next_of(def, "a"), Some("b"));
        assert_eq!(next_of(def, "b"), Some("c"));
        assert_eq!(next_of(def, "c"), None);
        assert_eq!(compiled.operations.names(), vec!["op.a", "op.b", "op.c"]);
    }

    #[test]
    fn colliding_ids_are_renamed() {
        let compiled = WorkflowBuilder::new("wf", "Dupes")
            .add(echo("fetch"))
            .add(echo("fetch"))
            .add(echo("fetch"))
            .build()
            .unwrap();
        let ids: Vec<&str> = compiled.definition.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["fetch", "fetch-2", "fetch-3"]);
        assert_eq!(next_of(&compiled.definition, "fetch-2"), Some("fetch-3"));
    }

    #[test]
    fn condition_gets_join_and_both_branches_converge() {
        let compiled = WorkflowBuilder::new("wf", "Branchy")
            .add(Component::condition(
                "check",
                Predicate::expression("variables.vip"),
                echo("fast"),
                echo("slow"),
            ))
            .add(echo("after"))
            .build()
            .unwrap();
        let def = &compiled.definition;

        match &def.node("check").unwrap().kind {
            NodeKind::Condition {
                true_branch,
                false_branch,
                ..
            } => {
                assert_eq!(true_branch, "fast");
                assert_eq!(false_branch, "slow");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(next_of(def, "fast"), Some("check__join"));
        assert_eq!(next_of(def, "slow"), Some("check__join"));
        assert_eq!(next_of(def, "check__join"), Some("after"));
    }

    #[test]
    fn one_armed_condition_skips_to_join() {
        let compiled = WorkflowBuilder::new("wf", "When")
            .add(Component::when("gate", Predicate::expression("true"), echo("extra")))
            .build()
            .unwrap();
        match &compiled.definition.node("gate").unwrap().kind {
            NodeKind::Condition { false_branch, .. } => assert_eq!(false_branch, "gate__join"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn parallel_branches_end_and_join_follows() {
        let compiled = WorkflowBuilder::new("wf", "Fan")
            .add(Component::parallel(
                "fan",
                vec![
                    Component::sequence("left", vec![echo("l1").into(), echo("l2").into()]),
                    echo("right").into(),
                ],
            ))
            .add(echo("done"))
            .build()
            .unwrap();
        let def = &compiled.definition;

        match &def.node("fan").unwrap().kind {
            NodeKind::Parallel {
                branches,
                wait_for_all,
                next,
            } => {
                assert_eq!(branches, &vec!["left".to_string(), "right".to_string()]);
                assert!(*wait_for_all);
                assert_eq!(next.as_deref(), Some("fan__join"));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(next_of(def, "left"), Some("l1"));
        assert_eq!(next_of(def, "l1"), Some("l2"));
        assert_eq!(next_of(def, "l2"), None);
        assert_eq!(next_of(def, "right"), None);
        assert_eq!(next_of(def, "fan__join"), Some("done"));
    }

    #[test]
    fn compiled_graph_validates_clean() {
        let compiled = WorkflowBuilder::new("wf", "Mixed")
            .add(echo("start"))
            .add(Component::race("fan", vec![echo("a").into(), echo("b").into()]))
            .add(Component::when("check", Predicate::native(|_| true), echo("a")))
            .add(Component::sub_workflow("child", "wf", false))
            .build()
            .unwrap();
        let issues = validate_graph(
            &compiled.definition,
            &compiled.operations,
            &WorkflowCatalog::new(),
        );
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
        assert!(compiled.definition.contains_node("a-2"));
    }

    #[test]
    fn forward_reference_is_a_build_error() {
        let err = WorkflowBuilder::new("wf", "Bad")
            .add(echo("report").uses_output_of("fetch"))
            .add(echo("fetch"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            BuildError::ForwardReference {
                component: "report".to_string(),
                dependency: "fetch".to_string(),
            }
        );
    }

    #[test]
    fn requires_resolves_against_earlier_produces_and_inputs() {
        let ok = WorkflowBuilder::new("wf", "Keys")
            .input("order_id")
            .add(echo("fetch").requires("order_id").produces("order"))
            .add(echo("charge").requires("order").uses_output_of("fetch"))
            .build();
        assert!(ok.is_ok());

        let err = WorkflowBuilder::new("wf", "Keys")
            .add(echo("charge").requires("order"))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::UnresolvedInput { key, .. } if key == "order"));
    }

    #[test]
    fn parallel_siblings_cannot_depend_on_each_other() {
        let err = WorkflowBuilder::new("wf", "Race")
            .add(Component::parallel(
                "fan",
                vec![
                    echo("a").produces("x").into(),
                    echo("b").requires("x").into(),
                ],
            ))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::UnresolvedInput { .. }));

        let ok = WorkflowBuilder::new("wf", "Race")
            .add(Component::parallel("fan", vec![echo("a").produces("x").into()]))
            .add(echo("b").requires("x").uses_output_of("fan"))
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn empty_inputs_rejected() {
        assert_eq!(WorkflowBuilder::new("wf", "Empty").build().unwrap_err(), BuildError::Empty);
        assert!(matches!(
            WorkflowBuilder::new("wf", "Fan")
                .add(Component::parallel("fan", vec![]))
                .build(),
            Err(BuildError::EmptyParallel { .. })
        ));
        assert!(matches!(
            WorkflowBuilder::new("wf", "Anon").add(echo("")).build(),
            Err(BuildError::EmptyId { kind: "step" })
        ));
        assert!(matches!(
            WorkflowBuilder::new("wf", "Ver").version("latest").add(echo("a")).build(),
            Err(BuildError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn builder_carries_variables_and_metadata() {
        let compiled = WorkflowBuilder::new("wf", "Meta")
            .version("2.1.0")
            .variable("region", "eu")
            .tag("billing")
            .metadata("owner", json!("payments"))
            .add(echo("a").config("limit", 5))
            .build()
            .unwrap();
        let def = compiled.definition;
        assert_eq!(def.version, "2.1.0");
        assert_eq!(def.variables["region"], json!("eu"));
        assert_eq!(def.tags, vec!["billing"]);
        assert_eq!(def.metadata["owner"], json!("payments"));
        match &def.nodes[0].kind {
            NodeKind::Operation { config, .. } => assert_eq!(config["limit"], json!(5)),
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
