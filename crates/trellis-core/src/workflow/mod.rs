//! Workflow engine core: compilation, validation, execution, and resume.
//!
//! - `builder` -- fluent component builder compiled into a node graph
//! - `definition` -- YAML/JSON parsing, filesystem load/save, workflow catalog
//! - `dag` -- node index, structural validation, cycle detection
//! - `context` -- execution context with output tracking and branch forking
//! - `expression` -- JEXL evaluator for condition predicates
//! - `spans` -- per-run trace span collector
//! - `engine` -- node-by-node walk and per-node dispatch
//! - `parallel` -- concurrent branch fan-out and join
//! - `subworkflow` -- nested workflow invocation with cycle guard
//! - `suspend` -- resume state validation

pub mod builder;
pub mod context;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod expression;
mod parallel;
pub mod spans;
mod subworkflow;
mod suspend;
