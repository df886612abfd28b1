//! BoxOperation -- object-safe dynamic dispatch wrapper for `Operation`.
//!
//! Blanket-impl pattern:
//! 1. Define an object-safe `OperationDyn` trait with boxed futures
//! 2. Blanket-impl `OperationDyn` for all `T: Operation`
//! 3. `BoxOperation` wraps `Arc<dyn OperationDyn>` and delegates

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::{Operation, OperationError, OperationOutcome};

/// Object-safe version of [`Operation`] with a boxed future.
pub trait OperationDyn: Send + Sync {
    fn call_boxed<'a>(
        &'a self,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<OperationOutcome, OperationError>> + Send + 'a>>;
}

impl<T: Operation> OperationDyn for T {
    fn call_boxed<'a>(
        &'a self,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<OperationOutcome, OperationError>> + Send + 'a>> {
        Box::pin(self.call(input))
    }
}

/// Type-erased operation handler.
///
/// Cloning is cheap (shared `Arc`), so one handler can be registered in
/// several registries, e.g. a parent workflow's and a compiled fragment's.
#[derive(Clone)]
pub struct BoxOperation {
    inner: Arc<dyn OperationDyn>,
}

impl BoxOperation {
    pub fn new<T: Operation + 'static>(operation: T) -> Self {
        Self {
            inner: Arc::new(operation),
        }
    }

    pub async fn call(&self, input: Value) -> Result<OperationOutcome, OperationError> {
        self.inner.call_boxed(input).await
    }
}

impl fmt::Debug for BoxOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoxOperation(..)")
    }
}

/// Adapts an async closure `Fn(Value) -> Future<Output = Result<..>>` into an
/// [`Operation`].
pub struct FnOperation<F> {
    f: F,
}

impl<F> FnOperation<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<OperationOutcome, OperationError>> + Send,
{
    fn call(
        &self,
        input: Value,
    ) -> impl Future<Output = Result<OperationOutcome, OperationError>> + Send {
        (self.f)(input)
    }
}
