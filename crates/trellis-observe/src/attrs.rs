//! Span attribute keys for workflow instrumentation.
//!
//! Used both as `tracing` span field names and as keys of the engine's own
//! `TraceSpan` attribute maps, so the two views of a run line up when spans
//! are exported through OpenTelemetry.
//!
//! Span naming convention: `"workflow <workflow_id>"` for a run, the node id
//! for each node.

// --- Workflow-level attributes ---

/// The id of the workflow definition being executed.
pub const WORKFLOW_ID: &str = "workflow.id";

/// The version string of the workflow definition.
pub const WORKFLOW_VERSION: &str = "workflow.version";

/// The id of this execution (stable across pause/resume).
pub const EXECUTION_ID: &str = "workflow.execution_id";

/// Sub-workflow nesting depth (0 for a top-level run).
pub const WORKFLOW_DEPTH: &str = "workflow.depth";

// --- Node-level attributes ---

/// The id of the node being dispatched.
pub const NODE_ID: &str = "node.id";

/// The node kind ("operation", "condition", ...).
pub const NODE_TYPE: &str = "node.type";

/// Prefix for scalar static-config values of an operation node.
pub const NODE_CONFIG_PREFIX: &str = "node.config.";

/// The registered operation name invoked by an operation node.
pub const OPERATION_NAME: &str = "operation.name";

/// Result of a condition node's predicate.
pub const CONDITION_RESULT: &str = "condition.result";

/// Number of branches fanned out by a parallel node.
pub const PARALLEL_BRANCHES: &str = "parallel.branches";

/// Whether a parallel node waits for every branch.
pub const PARALLEL_WAIT_FOR_ALL: &str = "parallel.wait_for_all";

/// The workflow id referenced by a sub-workflow node.
pub const SUB_WORKFLOW_ID: &str = "sub_workflow.id";

/// The wait key of a pause signal.
pub const PAUSE_KEY: &str = "pause.key";

// --- Span event names ---

/// Recorded on a node span when its operation raised a pause signal.
pub const EVENT_PAUSED: &str = "paused";

/// Recorded on a node span when it continues after a resume.
pub const EVENT_RESUMED: &str = "resumed";
