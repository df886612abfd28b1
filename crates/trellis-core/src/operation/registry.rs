//! Operation registry for runtime handler lookup.
//!
//! A name-indexed map of boxed operations. The engine never owns one: each
//! `execute`/`resume` call borrows the registry the caller supplies.

use std::collections::HashMap;
use std::future::Future;

use serde_json::Value;

use super::box_operation::{BoxOperation, FnOperation};
use super::{Operation, OperationError, OperationOutcome};

/// Handlers available to `Operation` nodes, indexed by operation name.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    operations: HashMap<String, BoxOperation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the given name.
    ///
    /// If a handler with this name already exists, it is replaced.
    pub fn register<T: Operation + 'static>(&mut self, name: impl Into<String>, operation: T) {
        self.operations.insert(name.into(), BoxOperation::new(operation));
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OperationOutcome, OperationError>> + Send + 'static,
    {
        self.register(name, FnOperation::new(f));
    }

    /// Register an already-boxed handler.
    pub fn insert(&mut self, name: impl Into<String>, operation: BoxOperation) {
        self.operations.insert(name.into(), operation);
    }

    pub fn get(&self, name: &str) -> Option<&BoxOperation> {
        self.operations.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered names, sorted for stable output.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Copy every handler from `other` into this registry; `other` wins on
    /// name clashes.
    pub fn extend(&mut self, other: &OperationRegistry) {
        for (name, op) in &other.operations {
            self.operations.insert(name.clone(), op.clone());
        }
    }
}
