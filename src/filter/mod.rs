//! Per-event payload filters.
//!
//! A filter is a Rhai expression evaluated against the top-level fields of a
//! JSON payload, each bound as a constant. Dashes in field names are
//! rewritten to underscores before evaluation so `x-request-id` can be
//! referenced as `x_request_id`.
//!
//! ```text
//! action == "opened" && body.repo.name.starts_with("event")
//! ["push", "release"].contains(headers["X-GitHub-Event"][0])
//! ```

use rhai::{Dynamic, Engine, Scope, AST};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Nesting allowed in a filter expression.
const MAX_EXPR_DEPTH: usize = 64;

/// Operations one evaluation may run before it is aborted.
const MAX_OPERATIONS: u64 = 10_000;

const MAX_CALL_LEVELS: usize = 16;

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("invalid filter expression: {0}")]
    Parse(String),

    #[error("filter evaluation failed: {0}")]
    Eval(String),

    #[error("payload is not a JSON object: {0}")]
    Payload(String),
}

/// Filter as declared on an event source entry.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct FilterConfig {
    pub expression: String,
}

/// Compiled filter expression.
#[derive(Clone)]
pub struct EventFilter {
    source: String,
    engine: Arc<Engine>,
    compiled: AST,
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("expression", &self.source)
            .finish()
    }
}

/// Sandboxed engine: expressions only, bounded depth and work.
fn engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH);
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_call_levels(MAX_CALL_LEVELS);
    engine.on_print(|_| {});
    engine.on_debug(|_, _, _| {});
    engine
}

impl EventFilter {
    pub fn parse(expression: &str) -> Result<Self, FilterError> {
        if expression.trim().is_empty() {
            return Err(FilterError::Parse("expression is empty".to_string()));
        }
        let engine = engine();
        let compiled = engine
            .compile_expression(expression)
            .map_err(|e| FilterError::Parse(e.to_string()))?;
        Ok(Self {
            source: expression.to_string(),
            engine: Arc::new(engine),
            compiled,
        })
    }

    pub fn expression(&self) -> &str {
        &self.source
    }

    /// Evaluates the filter against a raw payload.
    pub fn apply(&self, payload: &[u8]) -> Result<bool, FilterError> {
        let decoded: Map<String, Value> =
            serde_json::from_slice(payload).map_err(|e| FilterError::Payload(e.to_string()))?;

        let mut scope = Scope::new();
        for (key, value) in decoded {
            let value = rhai::serde::to_dynamic(value).map_err(|e| FilterError::Eval(e.to_string()))?;
            scope.push_constant_dynamic(key.replace('-', "_"), value);
        }

        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut scope, &self.compiled)
            .map_err(|e| FilterError::Eval(e.to_string()))?;
        result.as_bool().map_err(|actual| {
            FilterError::Eval(format!(
                "expression produced {} instead of a boolean",
                actual
            ))
        })
    }

    /// True only when the filter evaluates to `true`. Errors count as a miss.
    pub fn passes(&self, payload: &[u8]) -> bool {
        self.apply(payload).unwrap_or(false)
    }
}
