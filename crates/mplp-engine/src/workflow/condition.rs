use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use mplp_core::error::Result;

use crate::context::WorkflowContext;

type PredicateFn = dyn Fn(Arc<WorkflowContext>) -> BoxFuture<'static, Result<bool>> + Send + Sync;

/// A predicate over the live execution context.
///
/// Conditions gate single steps (`Step::condition`), choose the branch of a
/// conditional step, and drive loops. Evaluation is asynchronous and sees the
/// current variables and step results of the execution.
#[derive(Clone)]
pub struct Condition {
    description: String,
    predicate: Predicate,
}

#[derive(Clone)]
enum Predicate {
    Async(Arc<PredicateFn>),
    Expr(String),
}

impl Condition {
    /// An asynchronous predicate.
    pub fn new<F, Fut>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<WorkflowContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        Self {
            description: description.into(),
            predicate: Predicate::Async(Arc::new(move |ctx| Box::pin(f(ctx)))),
        }
    }

    /// A synchronous predicate that cannot fail.
    pub fn when<F>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(description, move |ctx| {
            let f = f.clone();
            async move { Ok(f(&ctx)) }
        })
    }

    /// A condition that always yields `value`.
    pub fn constant(value: bool) -> Self {
        Self::when(value.to_string(), move |_| value)
    }

    /// A simple expression over the context.
    ///
    /// Keys resolve against the execution variables and a `<step_id>_status`
    /// entry for every step that has a result (`"completed"`, `"failed"`,
    /// `"skipped"`, ...). See [`evaluate_condition`] for the grammar.
    pub fn expr(expr: impl Into<String>) -> Self {
        let expr = expr.into();
        Self {
            description: expr.clone(),
            predicate: Predicate::Expr(expr),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The expression source, for expression conditions.
    pub fn expression(&self) -> Option<&str> {
        match &self.predicate {
            Predicate::Expr(expr) => Some(expr),
            Predicate::Async(_) => None,
        }
    }

    pub async fn evaluate(&self, ctx: Arc<WorkflowContext>) -> Result<bool> {
        match &self.predicate {
            Predicate::Async(f) => f(ctx).await,
            Predicate::Expr(expr) => Ok(evaluate_condition(expr, &ctx.condition_data())),
        }
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Evaluate a simple conditional expression against context data.
///
/// Supported expressions:
/// - `key == "value"` exact match
/// - `key != "value"` not equal (a missing key never matches)
/// - `key contains "substr"` substring match
/// - `key` truthiness (true, non-zero number, non-empty string/array/object)
/// - `!key` negated truthiness
///
/// Numbers and booleans compare by their JSON text, so `count == "3"` and
/// `count == 3` both match the number 3. Returns `false` for anything else.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();

    if let Some((key, op, value)) = split_operator(expr) {
        let text = context.get(key).and_then(as_text);
        return match op {
            CONTAINS => text.is_some_and(|s| s.contains(value)),
            NOT_EQUALS => text.is_some_and(|s| s != value),
            _ => text.is_some_and(|s| s == value),
        };
    }

    if let Some(key) = expr.strip_prefix('!') {
        let key = key.trim();
        return is_identifier(key) && !context.get(key).is_some_and(is_truthy);
    }

    is_identifier(expr) && context.get(expr).is_some_and(is_truthy)
}

const CONTAINS: &str = " contains ";
const NOT_EQUALS: &str = "!=";
const EQUALS: &str = "==";

/// Split `key OP "value"` at the first operator outside double quotes,
/// returning (key, op, value) with the quotes stripped from the value.
fn split_operator(expr: &str) -> Option<(&str, &'static str, &str)> {
    let mut quoted = false;
    for (at, c) in expr.char_indices() {
        if c == '"' {
            quoted = !quoted;
            continue;
        }
        if quoted {
            continue;
        }
        let rest = &expr[at..];
        let Some(op) = [CONTAINS, NOT_EQUALS, EQUALS]
            .into_iter()
            .find(|op| rest.starts_with(*op))
        else {
            continue;
        };
        let key = expr[..at].trim();
        if key.is_empty() {
            return None;
        }
        let value = rest[op.len()..].trim().trim_matches('"');
        return Some((key, op, value));
    }
    None
}

fn as_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}
