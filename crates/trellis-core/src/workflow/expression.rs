//! JEXL expression evaluator for `Condition` node predicates.
//!
//! Wraps `jexl_eval::Evaluator` with a set of standard transforms. Expressions
//! see the run through a read-only JSON view:
//!
//! ```json
//! { "variables": { ... }, "outputs": { "<node_id>": <value>, ... } }
//! ```
//!
//! Run state is always passed as the context object, never interpolated into
//! the expression string.

use serde_json::{json, Value};
use trellis_types::workflow::{ExecutionView, Predicate};

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// WorkflowEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with standard transforms pre-registered.
///
/// The underlying evaluator stores its transforms as plain boxed closures, so
/// it is neither `Send` nor `Sync`. Build one where it is needed and drop it
/// before the next `.await`.
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl WorkflowEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(first_str(args).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(first_str(args).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(first_str(args).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(Value::as_str).unwrap_or(",");
                let parts: Vec<&str> = first_str(args).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
            })
            .with_transform("contains", |args: &[Value]| {
                let needle = args.get(1);
                let found = match args.first() {
                    Some(Value::String(s)) => {
                        needle.and_then(Value::as_str).is_some_and(|n| s.contains(n))
                    }
                    Some(Value::Array(items)) => needle.is_some_and(|n| items.contains(n)),
                    Some(Value::Object(map)) => needle
                        .and_then(Value::as_str)
                        .is_some_and(|k| map.contains_key(k)),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let prefix = args.get(1).and_then(Value::as_str).unwrap_or("");
                Ok(json!(first_str(args).starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let suffix = args.get(1).and_then(Value::as_str).unwrap_or("");
                Ok(json!(first_str(args).ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<&String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and coerce the result with JavaScript-like
    /// truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context).map(|v| truthy(&v))
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Decide a `Condition` node's branch.
///
/// Native predicates are called directly; expression predicates are
/// evaluated against `view.to_value()`.
pub fn evaluate_predicate(
    predicate: &Predicate,
    view: &ExecutionView<'_>,
) -> Result<bool, ExpressionError> {
    match predicate {
        Predicate::Native(native) => Ok(native.test(view)),
        Predicate::Expression(expr) => WorkflowEvaluator::new().evaluate_bool(expr, &view.to_value()),
    }
}

fn first_str(args: &[Value]) -> &str {
    args.first().and_then(Value::as_str).unwrap_or("")
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn evaluator() -> WorkflowEvaluator {
        WorkflowEvaluator::new()
    }

    // -------------------------------------------------------------------
    // Property access and operators
    // -------------------------------------------------------------------

    #[test]
    fn dot_notation_nested() {
        let ctx = json!({ "variables": { "order": { "customer": { "name": "Ada" } } } });
        let result = evaluator()
            .evaluate_value("variables.order.customer.name", &ctx)
            .unwrap();
        assert_eq!(result, json!("Ada"));
    }

    #[test]
    fn array_indexing() {
        let ctx = json!({ "outputs": { "fetch": ["rust", "wasm", "jexl"] } });
        let eval = evaluator();
        assert_eq!(eval.evaluate_value("outputs.fetch[0]", &ctx).unwrap(), json!("rust"));
        assert_eq!(eval.evaluate_value("outputs.fetch[2]", &ctx).unwrap(), json!("jexl"));
    }

    #[test]
    fn boolean_and_or() {
        let ctx = json!({ "variables": { "kind": "push", "branch": "dev" } });
        let eval = evaluator();
        assert!(!eval
            .evaluate_bool("variables.kind == 'push' && variables.branch == 'main'", &ctx)
            .unwrap());
        assert!(eval
            .evaluate_bool("variables.branch == 'main' || variables.branch == 'dev'", &ctx)
            .unwrap());
    }

    #[test]
    fn numeric_comparison() {
        let ctx = json!({ "variables": { "total": 150.0 } });
        let eval = evaluator();
        assert!(eval.evaluate_bool("variables.total > 100", &ctx).unwrap());
        assert!(!eval.evaluate_bool("variables.total > 200", &ctx).unwrap());
    }

    #[test]
    fn in_operator_on_arrays() {
        let ctx = json!({ "variables": { "roles": ["user", "admin"] } });
        let eval = evaluator();
        assert!(eval.evaluate_bool("'admin' in variables.roles", &ctx).unwrap());
        assert!(!eval.evaluate_bool("'root' in variables.roles", &ctx).unwrap());
    }

    // -------------------------------------------------------------------
    // Transforms
    // -------------------------------------------------------------------

    #[test]
    fn string_transforms_chain() {
        let ctx = json!({ "name": "  Hello World  " });
        let result = evaluator().evaluate_value("name|trim|lower", &ctx).unwrap();
        assert_eq!(result, json!("hello world"));
    }

    #[test]
    fn contains_handles_strings_arrays_objects() {
        let ctx = json!({
            "msg": "disk error on sda",
            "tags": ["a", "b"],
            "outputs": { "fetch": 1 }
        });
        let eval = evaluator();
        assert!(eval.evaluate_bool("msg|contains('error')", &ctx).unwrap());
        assert!(eval.evaluate_bool("tags|contains('b')", &ctx).unwrap());
        assert!(eval.evaluate_bool("outputs|contains('fetch')", &ctx).unwrap());
        assert!(!eval.evaluate_bool("outputs|contains('charge')", &ctx).unwrap());
    }

    #[test]
    fn prefix_and_suffix() {
        let ctx = json!({ "path": "/api/orders.json" });
        let eval = evaluator();
        assert!(eval.evaluate_bool("path|startsWith('/api')", &ctx).unwrap());
        assert!(eval.evaluate_bool("path|endsWith('.json')", &ctx).unwrap());
        assert!(!eval.evaluate_bool("path|endsWith('.pdf')", &ctx).unwrap());
    }

    #[test]
    fn length_and_keys() {
        let ctx = json!({ "items": ["a", "b", "c", "d", "e"], "obj": { "x": 1, "y": 2 } });
        let eval = evaluator();
        assert!(eval.evaluate_bool("items|length > 3", &ctx).unwrap());
        assert!(!eval.evaluate_bool("items|length > 10", &ctx).unwrap());
        assert_eq!(eval.evaluate_value("obj|keys", &ctx).unwrap(), json!(["x", "y"]));
    }

    #[test]
    fn split_defaults_to_comma() {
        let ctx = json!({ "csv": "a,b,c" });
        let result = evaluator().evaluate_value("csv|split", &ctx).unwrap();
        assert_eq!(result, json!(["a", "b", "c"]));
    }

    #[test]
    fn not_transform_uses_truthiness() {
        let eval = evaluator();
        assert!(!eval.evaluate_bool("(flag)|not", &json!({ "flag": true })).unwrap());
        assert!(eval.evaluate_bool("(flag)|not", &json!({ "flag": "" })).unwrap());
    }

    // -------------------------------------------------------------------
    // Truthiness and errors
    // -------------------------------------------------------------------

    #[test]
    fn missing_property_is_falsy() {
        let ctx = json!({ "variables": {} });
        let eval = evaluator();
        assert_eq!(eval.evaluate_value("variables.nope", &ctx).unwrap(), Value::Null);
        assert!(!eval.evaluate_bool("variables.nope", &ctx).unwrap());
    }

    #[test]
    fn truthiness_rules() {
        assert!(truthy(&json!("x")));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!(42.0)));
        assert!(!truthy(&json!(0)));
        assert!(truthy(&json!([])));
        assert!(!truthy(&Value::Null));
    }

    #[test]
    fn context_must_be_object() {
        let err = evaluator().evaluate_bool("true", &json!("nope")).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
    }

    #[test]
    fn syntax_error_is_reported() {
        let err = evaluator().evaluate_bool("variables.(", &json!({})).unwrap_err();
        assert!(matches!(err, ExpressionError::EvalFailed(_)));
    }

    // -------------------------------------------------------------------
    // Predicates
    // -------------------------------------------------------------------

    #[test]
    fn expression_predicate_sees_variables_and_outputs() {
        let mut variables = Map::new();
        variables.insert("region".to_string(), json!("eu"));
        let mut outputs = Map::new();
        outputs.insert("score".to_string(), json!({ "value": 0.9 }));
        let view = ExecutionView::new(&variables, &outputs);

        let pred = Predicate::expression("variables.region == 'eu' && outputs.score.value > 0.5");
        assert!(evaluate_predicate(&pred, &view).unwrap());
    }

    #[test]
    fn native_predicate_is_called_directly() {
        let variables = Map::new();
        let outputs = Map::new();
        let view = ExecutionView::new(&variables, &outputs);

        let pred = Predicate::native(|view| view.variable("missing").is_none());
        assert!(evaluate_predicate(&pred, &view).unwrap());
    }
}
