//! Definition-driven rule engine
//!
//! Translates between serial lines and MQTT JSON payloads using two
//! ordered rule sets compiled from a YAML definition file:
//!
//! ```text
//! serial line ──► serial2mqtt rules ──► topic + JSON payload
//! topic + JSON payload ──► mqtt2serial rules ──► serial line
//! ```
//!
//! Each rule pairs a `read` matcher with a `write` template; both may
//! embed `!expr` expressions evaluated against the dynamic [`Scope`].
//! Rule order within a topic is the declaration order and matching stops
//! at the first hit unless the rule sets `process_next_rule`.
pub mod definition;
pub mod error;
pub mod expr;
pub mod scope;

// Re-exports for simpler API access
pub use definition::{deep_eval, deep_merge, Definition, Node, Rule, Topic};
pub use error::RuleError;
pub use expr::CompiledExpr;
pub use scope::{Matcher, MatcherRegistry, Scope, Value};
