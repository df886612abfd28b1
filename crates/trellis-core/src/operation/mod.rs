//! Operations: the named, user-supplied units of work a workflow calls.
//!
//! - `Operation` -- the trait every handler implements (RPITIT)
//! - `BoxOperation` -- object-safe wrapper for runtime lookup by name
//! - `FnOperation` -- adapter for plain async closures
//! - `OperationRegistry` -- name -> handler map handed to the engine
//! - `Retry` -- wrapper that re-attempts a failing handler with backoff

pub mod box_operation;
pub mod registry;
pub mod retry;

use std::future::Future;

use serde_json::Value;
use thiserror::Error;
use trellis_types::execution::PauseSignal;

pub use box_operation::{BoxOperation, FnOperation, OperationDyn};
pub use registry::OperationRegistry;
pub use retry::Retry;

/// What a successful operation call produced.
///
/// A pause is not an error: it is one of the two ways an operation can
/// finish normally, and the engine turns it into a resumable suspension.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Completed(Value),
    Paused(PauseSignal),
}

impl OperationOutcome {
    pub fn value(value: impl Into<Value>) -> Self {
        OperationOutcome::Completed(value.into())
    }

    pub fn pause(key: impl Into<String>) -> Self {
        OperationOutcome::Paused(PauseSignal::new(key))
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, OperationOutcome::Paused(_))
    }
}

impl From<Value> for OperationOutcome {
    fn from(value: Value) -> Self {
        OperationOutcome::Completed(value)
    }
}

impl From<PauseSignal> for OperationOutcome {
    fn from(signal: PauseSignal) -> Self {
        OperationOutcome::Paused(signal)
    }
}

/// Failure raised by an operation handler.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OperationError {
    pub fn failed(message: impl Into<String>) -> Self {
        OperationError::Failed(message.into())
    }
}

/// A unit of work invoked by `Operation` nodes.
///
/// `input` is the run's current variables with the node's static config
/// merged over them. Returning `Ok(OperationOutcome::Paused(..))` suspends
/// the run at the calling node.
///
/// Uses native async fn in traits (RPITIT). For dynamic dispatch wrap the
/// implementation in [`BoxOperation`].
pub trait Operation: Send + Sync {
    fn call(
        &self,
        input: Value,
    ) -> impl Future<Output = Result<OperationOutcome, OperationError>> + Send;
}
