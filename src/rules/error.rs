//! Error types for the rule engine
//!
//! Defines specific error categories for definition loading, expression
//! compilation and evaluation, and rule matching failures.

use thiserror::Error;

/// Error types for rule engine operations
///
/// Each variant represents a specific failure mode in the rule pipeline.
#[derive(Debug, Error)]
pub enum RuleError {
    /// Definition file could not be read or parsed
    #[error("Definition error: {0}")]
    DefinitionError(String),

    /// Expression source could not be compiled
    ///
    /// Carries the expression text so the log points at the offending
    /// node in the definition file.
    #[error("Cannot compile expression '{expr}': {reason}")]
    CompileError { expr: String, reason: String },

    /// Expression evaluation failed at runtime
    #[error("The expression '{expr}' failed: {reason}")]
    EvalError { expr: String, reason: String },

    /// Inbound payload did not satisfy a rule's read section
    ///
    /// The path is dotted, e.g. `state.section_code`.
    #[error("Topic data validation failed. {0}")]
    ValidationError(String),
}

impl RuleError {
    pub fn eval(expr: &str, reason: impl ToString) -> Self {
        RuleError::EvalError {
            expr: expr.to_string(),
            reason: reason.to_string(),
        }
    }
}
