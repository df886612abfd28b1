//! Workflow definitions as data: parsing, serialization, file I/O, and the
//! catalog that sub-workflow nodes resolve against.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use trellis_types::workflow::WorkflowDefinition;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to parse workflow: {0}")]
    Parse(String),

    #[error("failed to serialize workflow: {0}")]
    Serialize(String),

    #[error("unsupported workflow file extension: {0}")]
    UnsupportedFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing and serialization
// ---------------------------------------------------------------------------

pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))
}

pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, DefinitionError> {
    serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Fails if the definition holds a native (closure) predicate.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Serialize(e.to_string()))
}

/// Fails if the definition holds a native (closure) predicate.
pub fn serialize_workflow_json(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_json::to_string_pretty(def).map_err(|e| DefinitionError::Serialize(e.to_string()))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

enum Format {
    Yaml,
    Json,
}

fn format_of(path: &Path) -> Result<Format, DefinitionError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => Ok(Format::Yaml),
        Some("json") => Ok(Format::Json),
        other => Err(DefinitionError::UnsupportedFormat(
            other.unwrap_or_default().to_string(),
        )),
    }
}

/// Load a definition from a `.yaml`, `.yml`, or `.json` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let format = format_of(path)?;
    let content = std::fs::read_to_string(path)?;
    match format {
        Format::Yaml => parse_workflow_yaml(&content),
        Format::Json => parse_workflow_json(&content),
    }
}

/// Save a definition, picking the format from the extension.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    let content = match format_of(path)? {
        Format::Yaml => serialize_workflow_yaml(def)?,
        Format::Json => serialize_workflow_json(def)?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// WorkflowCatalog
// ---------------------------------------------------------------------------

/// Definitions addressable by id, for `SubWorkflow` nodes.
///
/// Cloning is cheap: definitions are shared behind `Arc`.
#[derive(Debug, Clone, Default)]
pub struct WorkflowCatalog {
    workflows: HashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition under its own id, returning the one it replaced.
    pub fn register(&mut self, def: WorkflowDefinition) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.insert(def.id.clone(), Arc::new(def))
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workflows.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

impl FromIterator<WorkflowDefinition> for WorkflowCatalog {
    fn from_iter<I: IntoIterator<Item = WorkflowDefinition>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for def in iter {
            catalog.register(def);
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_types::workflow::{NodeKind, Predicate};

    const YAML: &str = r#"
id: order-flow
name: Order flow
version: 1.2.0
start_node: check
variables:
  region: eu
nodes:
  - id: check
    type: condition
    predicate:
      expression: "variables.total > 100"
    true_branch: review
    false_branch: charge
  - id: review
    type: operation
    operation: orders.review
    next: charge
  - id: charge
    type: operation
    operation: payments.charge
    config:
      currency: EUR
  - id: fan
    type: parallel
    branches: [review, charge]
  - id: child
    type: sub_workflow
    workflow_id: billing
    merge_outputs: true
"#;

    #[test]
    fn parse_yaml_covers_every_node_kind() {
        let def = parse_workflow_yaml(YAML).unwrap();
        assert_eq!(def.id, "order-flow");
        assert_eq!(def.nodes.len(), 5);
        assert_eq!(def.variables["region"], serde_json::json!("eu"));

        match &def.node("check").unwrap().kind {
            NodeKind::Condition { predicate, .. } => {
                assert!(matches!(predicate, Predicate::Expression(e) if e == "variables.total > 100"));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        match &def.node("fan").unwrap().kind {
            NodeKind::Parallel { wait_for_all, next, .. } => {
                assert!(*wait_for_all);
                assert!(next.is_none());
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        match &def.node("child").unwrap().kind {
            NodeKind::SubWorkflow { workflow_id, merge_outputs, .. } => {
                assert_eq!(workflow_id, "billing");
                assert!(*merge_outputs);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn unknown_node_type_is_a_parse_error() {
        let yaml = "id: x\nname: x\nversion: 1.0.0\nstart_node: a\nnodes:\n  - id: a\n    type: teleport\n";
        assert!(matches!(parse_workflow_yaml(yaml), Err(DefinitionError::Parse(_))));
    }

    #[test]
    fn json_and_yaml_agree() {
        let def = parse_workflow_yaml(YAML).unwrap();
        let json = serialize_workflow_json(&def).unwrap();
        let back = parse_workflow_json(&json).unwrap();
        assert_eq!(back.nodes.len(), def.nodes.len());
        assert_eq!(back.start_node, "check");
    }

    #[test]
    fn native_predicate_cannot_be_saved() {
        let mut def = parse_workflow_yaml(YAML).unwrap();
        if let NodeKind::Condition { predicate, .. } = &mut def.nodes[0].kind {
            *predicate = Predicate::native(|_| true);
        }
        assert!(matches!(
            serialize_workflow_yaml(&def),
            Err(DefinitionError::Serialize(_))
        ));
    }

    #[test]
    fn condition_survives_yaml_round_trip() {
        let def = parse_workflow_yaml(YAML).unwrap();
        let yaml = serialize_workflow_yaml(&def).unwrap();
        assert!(yaml.contains("expression:"));
        assert!(!yaml.contains("!expression"));

        let back = parse_workflow_yaml(&yaml).unwrap();
        match &back.node("check").unwrap().kind {
            NodeKind::Condition { predicate, .. } => {
                assert!(matches!(predicate, Predicate::Expression(e) if e == "variables.total > 100"));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn save_and_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let def = parse_workflow_yaml(YAML).unwrap();

        for name in ["flows/order.yaml", "flows/order.json"] {
            let path = dir.path().join(name);
            save_workflow_file(&path, &def).expect("should save");
            let loaded = load_workflow_file(&path).expect("should load");
            assert_eq!(loaded.id, "order-flow");
            assert_eq!(loaded.nodes.len(), 5);
        }
    }

    #[test]
    fn unsupported_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order.toml");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            load_workflow_file(&path),
            Err(DefinitionError::UnsupportedFormat(ext)) if ext == "toml"
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_workflow_file(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, DefinitionError::Io(_)));
    }

    #[test]
    fn catalog_register_and_lookup() {
        let def = parse_workflow_yaml(YAML).unwrap();
        let mut catalog: WorkflowCatalog = std::iter::once(def.clone()).collect();
        assert!(catalog.contains("order-flow"));
        assert_eq!(catalog.get("order-flow").unwrap().name, "Order flow");
        assert!(catalog.register(def).is_some());
        assert_eq!(catalog.ids(), vec!["order-flow"]);
    }
}
