// src/expr.rs
//! The expression-evaluator seam.
//!
//! Alarm calculation, warning, and critical conditions are compiled by
//! an external expression engine. The health engine only needs to run
//! them against the alarm's current state and read the numeric result,
//! so the whole contract is the [`Expression`] trait: evaluate against
//! an [`ExprEnv`], plus the original source text and the parsed form
//! for diagnostics and notifier arguments.

use std::fmt;

use crate::alarm::AlarmStatus;

/// The variables an expression may reference during evaluation.
#[derive(Debug, Clone, Copy)]
pub struct ExprEnv {
    /// The alarm's current value (possibly NaN).
    pub value: f64,
    /// The alarm's current status.
    pub status: AlarmStatus,
    /// The linked chart's green threshold (NaN when unset).
    pub green: f64,
    /// The linked chart's red threshold (NaN when unset).
    pub red: f64,
    /// Current wall-clock time, Unix seconds.
    pub now: i64,
}

/// An evaluation failure, carrying the evaluator's message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError(pub String);

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for EvalError {}

/// Result of evaluating an expression.
pub type EvalResult = std::result::Result<f64, EvalError>;

/// A compiled expression, owned by the external expression engine.
pub trait Expression: Send + Sync {
    /// Evaluate the expression against the given environment.
    fn evaluate(&self, env: &ExprEnv) -> EvalResult;

    /// The original source text the expression was compiled from.
    fn source(&self) -> &str;

    /// The normalized form the compiler parsed the source as.
    fn parsed_as(&self) -> &str;
}
