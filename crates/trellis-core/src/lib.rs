//! Workflow compiler, execution engine, and suspension controller for Trellis.
//!
//! This crate interprets `trellis-types` workflow graphs. It depends only on
//! `trellis-types` and `trellis-observe`; operations are supplied by the
//! caller through an [`OperationRegistry`].

pub mod config;
pub mod event;
pub mod operation;
pub mod workflow;

pub use event::{EventHub, EventSubscription};
pub use operation::{Operation, OperationError, OperationOutcome, OperationRegistry};
pub use workflow::builder::{CompiledWorkflow, Component, Step, WorkflowBuilder};
pub use workflow::definition::WorkflowCatalog;
pub use workflow::engine::WorkflowEngine;
