//! Shared domain types for Trellis.
//!
//! This crate contains the data side of the workflow engine: the node graph,
//! execution results, resume states, trace spans, lifecycle events, and
//! configuration, along with their error types.
//!
//! Zero behavior and no runtime dependencies -- only serde, uuid, chrono,
//! thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod trace;
pub mod workflow;
