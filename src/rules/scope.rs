//! Value model, matcher objects, and the evaluation scope
//!
//! Expressions in the definition file evaluate to [`Value`]s. A value can
//! be a plain JSON-like datum or a [`Matcher`], an object that can be
//! tested against a serial line and afterwards queried for captured
//! groups and derived attributes. Stateful matchers (`prf_state`,
//! `section_state`) are memoised in a [`MatcherRegistry`] owned by the
//! bridge so they can observe change across rule evaluations.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use regex::Regex;

use crate::prfstate::PrfTracker;
use crate::rules::error::RuleError;

/// Prefix of peripheral state report lines.
pub const PRFSTATE_PREFIX: &str = "PRFSTATE";

/// Runtime value of the rule engine.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Matcher(Arc<Matcher>),
}

impl Value {
    /// Name of the value's type, used in validation error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Seq(_) => "seq",
            Value::Map(_) => "map",
            Value::Matcher(_) => "matcher",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Seq(s) => !s.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Matcher(_) => true,
        }
    }

    /// Attribute lookup used by dotted paths in expressions.
    pub fn attr(&self, name: &str) -> Option<Value> {
        match self {
            Value::Map(m) => m.get(name).cloned(),
            Value::Matcher(m) => m.attr(name),
            _ => None,
        }
    }

    /// Tests the value against a serial line. Strings compare literally,
    /// matchers run their own matching logic and remember captures.
    pub fn matches_line(&self, line: &str) -> bool {
        match self {
            Value::Str(s) => s == line,
            Value::Matcher(m) => m.matches(line),
            _ => false,
        }
    }

    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(xs) => Value::Seq(xs.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(m) => Value::Map(
                m.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Seq(xs) => serde_json::Value::Array(xs.iter().map(Value::to_json).collect()),
            Value::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Matcher(m) => serde_json::Value::String(m.to_string()),
        }
    }

    /// Converts a plain YAML scalar or collection. Tagged nodes are the
    /// definition loader's concern and must not reach this function.
    pub fn from_yaml(v: &serde_yaml::Value) -> Value {
        match v {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) => Value::Bool(*b),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_yaml::Value::String(s) => Value::Str(s.clone()),
            serde_yaml::Value::Sequence(xs) => {
                Value::Seq(xs.iter().map(Value::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(m) => Value::Map(
                m.iter()
                    .filter_map(|(k, v)| {
                        k.as_str().map(|k| (k.to_string(), Value::from_yaml(v)))
                    })
                    .collect(),
            ),
            serde_yaml::Value::Tagged(t) => Value::from_yaml(&t.value),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Matcher(a), Value::Matcher(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Matcher(m) => write!(f, "{m}"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// A matcher object produced by one of the matcher constructors.
///
/// Matching against a line both answers yes/no and, for regex-backed
/// variants, remembers the captured groups for later use in `write`.
#[derive(Debug)]
pub enum Matcher {
    Pattern(PatternMatcher),
    PrfState(PrfStateMatcher),
    SectionState(SectionStateMatcher),
}

impl Matcher {
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Matcher::Pattern(m) => m.matches(line),
            Matcher::PrfState(m) => m.matches(line),
            Matcher::SectionState(m) => m.matches(line),
        }
    }

    pub fn group(&self, n: usize) -> Option<String> {
        match self {
            Matcher::Pattern(m) => m.group(n),
            Matcher::SectionState(m) => m.group(n),
            Matcher::PrfState(_) => None,
        }
    }

    pub fn attr(&self, name: &str) -> Option<Value> {
        match self {
            Matcher::Pattern(_) => None,
            Matcher::PrfState(m) => m.attr(name),
            Matcher::SectionState(m) => m.attr(name),
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Pattern(m) => match m.group(0) {
                Some(text) => write!(f, "{text}"),
                None => write!(f, "r'{}'", m.pattern),
            },
            Matcher::PrfState(m) => write!(f, "prf_state({})", m.pos),
            Matcher::SectionState(m) => match m.group(0) {
                Some(text) => write!(f, "{text}"),
                None => write!(f, "r'{}'", m.pattern),
            },
        }
    }
}

/// Compiles a pattern anchored at the start of the line, preserving the
/// author's group numbering.
fn compile_anchored(pattern: &str) -> Result<Regex, RuleError> {
    Regex::new(&format!("^(?:{pattern})")).map_err(|e| RuleError::CompileError {
        expr: pattern.to_string(),
        reason: e.to_string(),
    })
}

fn captured_groups(caps: &regex::Captures<'_>) -> Vec<Option<String>> {
    (0..caps.len())
        .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
        .collect()
}

/// Regex matcher created by `pattern(re)`. A fresh instance is built per
/// evaluation; the last successful match is remembered on the instance.
#[derive(Debug)]
pub struct PatternMatcher {
    pub pattern: String,
    re: Regex,
    groups: Mutex<Option<Vec<Option<String>>>>,
}

impl PatternMatcher {
    pub fn new(pattern: &str) -> Result<Self, RuleError> {
        Ok(Self {
            pattern: pattern.to_string(),
            re: compile_anchored(pattern)?,
            groups: Mutex::new(None),
        })
    }

    pub fn matches(&self, line: &str) -> bool {
        match self.re.captures(line) {
            Some(caps) => {
                *self.groups.lock().expect("pattern state lock") = Some(captured_groups(&caps));
                true
            }
            None => {
                *self.groups.lock().expect("pattern state lock") = None;
                false
            }
        }
    }

    pub fn group(&self, n: usize) -> Option<String> {
        self.groups
            .lock()
            .expect("pattern state lock")
            .as_ref()
            .and_then(|g| g.get(n).cloned().flatten())
    }
}

/// Matcher created by `prf_state(pos)`; true when the peripheral at that
/// position transitioned in the most recent snapshot.
#[derive(Debug)]
pub struct PrfStateMatcher {
    pub pos: usize,
    tracker: Arc<Mutex<PrfTracker>>,
}

impl PrfStateMatcher {
    pub fn matches(&self, line: &str) -> bool {
        if !line.starts_with(PRFSTATE_PREFIX) {
            return false;
        }
        self.tracker.lock().expect("prf tracker lock").changed(self.pos)
    }

    pub fn attr(&self, name: &str) -> Option<Value> {
        match name {
            "pos" => Some(Value::Int(self.pos as i64)),
            "state" => Some(Value::Str(
                self.tracker
                    .lock()
                    .expect("prf tracker lock")
                    .state(self.pos)
                    .to_string(),
            )),
            _ => None,
        }
    }
}

/// Matcher created by `section_state(re, g1, g2)`.
///
/// Parses the section code (group `g1`) and state (group `g2`) out of a
/// line and reports true whenever the state differs from the one seen
/// before for that section. Memoised per pattern, so the remembered
/// states survive across lines.
#[derive(Debug)]
pub struct SectionStateMatcher {
    pub pattern: String,
    re: Regex,
    g1: usize,
    g2: usize,
    states: Mutex<HashMap<i64, String>>,
    last: Mutex<Option<LastSectionMatch>>,
}

#[derive(Debug)]
struct LastSectionMatch {
    section: i64,
    state: String,
    groups: Vec<Option<String>>,
}

impl SectionStateMatcher {
    pub fn new(pattern: &str, g1: usize, g2: usize) -> Result<Self, RuleError> {
        Ok(Self {
            pattern: pattern.to_string(),
            re: compile_anchored(pattern)?,
            g1,
            g2,
            states: Mutex::new(HashMap::new()),
            last: Mutex::new(None),
        })
    }

    pub fn matches(&self, line: &str) -> bool {
        let caps = match self.re.captures(line) {
            Some(c) => c,
            None => {
                *self.last.lock().expect("section state lock") = None;
                return false;
            }
        };
        let section = match caps.get(self.g1).and_then(|m| m.as_str().parse::<i64>().ok()) {
            Some(s) => s,
            None => return false,
        };
        let state = match caps.get(self.g2) {
            Some(m) => m.as_str().to_string(),
            None => return false,
        };
        *self.last.lock().expect("section state lock") = Some(LastSectionMatch {
            section,
            state: state.clone(),
            groups: captured_groups(&caps),
        });
        let mut states = self.states.lock().expect("section state lock");
        let changed = states.get(&section) != Some(&state);
        states.insert(section, state);
        changed
    }

    pub fn group(&self, n: usize) -> Option<String> {
        self.last
            .lock()
            .expect("section state lock")
            .as_ref()
            .and_then(|l| l.groups.get(n).cloned().flatten())
    }

    pub fn attr(&self, name: &str) -> Option<Value> {
        let last = self.last.lock().expect("section state lock");
        let last = last.as_ref()?;
        match name {
            "section" => Some(Value::Int(last.section)),
            "state" => Some(Value::Str(last.state.clone())),
            _ => None,
        }
    }
}

/// Registry of stateful matchers, owned by the bridge.
///
/// `prf_state` matchers are memoised per position, `section_state`
/// matchers per pattern, so repeated rule evaluations observe the same
/// underlying state.
#[derive(Debug)]
pub struct MatcherRegistry {
    tracker: Arc<Mutex<PrfTracker>>,
    prf: Mutex<HashMap<usize, Arc<Matcher>>>,
    sections: Mutex<HashMap<String, Arc<Matcher>>>,
}

impl MatcherRegistry {
    pub fn new(tracker: Arc<Mutex<PrfTracker>>) -> Self {
        Self {
            tracker,
            prf: Mutex::new(HashMap::new()),
            sections: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> Arc<Mutex<PrfTracker>> {
        self.tracker.clone()
    }

    pub fn prf_state(&self, pos: usize) -> Arc<Matcher> {
        self.prf
            .lock()
            .expect("matcher registry lock")
            .entry(pos)
            .or_insert_with(|| {
                Arc::new(Matcher::PrfState(PrfStateMatcher {
                    pos,
                    tracker: self.tracker.clone(),
                }))
            })
            .clone()
    }

    pub fn section_state(
        &self,
        pattern: &str,
        g1: usize,
        g2: usize,
    ) -> Result<Arc<Matcher>, RuleError> {
        let mut sections = self.sections.lock().expect("matcher registry lock");
        if let Some(m) = sections.get(pattern) {
            return Ok(m.clone());
        }
        let matcher = Arc::new(Matcher::SectionState(SectionStateMatcher::new(
            pattern, g1, g2,
        )?));
        sections.insert(pattern.to_string(), matcher.clone());
        Ok(matcher)
    }

    /// Arms the PRFSTATE tracker so the next decoded snapshot reports a
    /// transition on every position.
    pub fn arm_prfstate(&self) {
        self.tracker.lock().expect("prf tracker lock").arm();
    }
}

/// The dynamic environment rule expressions evaluate against.
///
/// `topology` comes from the user configuration and is read-only; `data`
/// is installed for the duration of a single rule evaluation and must be
/// removed on every path out of it.
#[derive(Debug)]
pub struct Scope {
    topology: Value,
    data: Option<Value>,
    registry: Arc<MatcherRegistry>,
}

impl Scope {
    pub fn new(topology: Value, registry: Arc<MatcherRegistry>) -> Self {
        Self {
            topology,
            data: None,
            registry,
        }
    }

    pub fn registry(&self) -> &MatcherRegistry {
        &self.registry
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        match name {
            "topology" => Some(self.topology.clone()),
            "data" => self.data.clone(),
            _ => None,
        }
    }

    pub fn install_data(&mut self, data: Value) {
        self.data = Some(data);
    }

    pub fn remove_data(&mut self) {
        self.data = None;
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<MatcherRegistry> {
        Arc::new(MatcherRegistry::new(Arc::new(Mutex::new(PrfTracker::new(
            16,
        )))))
    }

    #[test]
    fn pattern_matches_and_remembers_groups() {
        let m = PatternMatcher::new(r"STATE (\d+) (\w+)").unwrap();
        assert!(m.matches("STATE 1 ARMED"));
        assert_eq!(m.group(1).as_deref(), Some("1"));
        assert_eq!(m.group(2).as_deref(), Some("ARMED"));
        assert!(!m.matches("OK"));
        assert_eq!(m.group(1), None);
    }

    #[test]
    fn pattern_is_anchored_at_line_start() {
        let m = PatternMatcher::new("ERROR.*").unwrap();
        assert!(m.matches("ERROR: 3 NO_ACCESS"));
        assert!(!m.matches("XX ERROR: 3 NO_ACCESS"));
    }

    #[test]
    fn section_state_reports_changes_only() {
        let m = SectionStateMatcher::new(r"STATE (\d+) (\w+)", 1, 2).unwrap();
        assert!(m.matches("STATE 1 ARMED"));
        assert!(!m.matches("STATE 1 ARMED"));
        assert!(m.matches("STATE 1 READY"));
        assert!(m.matches("STATE 2 READY"));
        assert_eq!(m.attr("section"), Some(Value::Int(2)));
        assert_eq!(m.attr("state"), Some(Value::Str("READY".into())));
    }

    #[test]
    fn prf_state_matchers_are_memoised() {
        let reg = registry();
        let a = reg.prf_state(3);
        let b = reg.prf_state(3);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn prf_state_matches_on_transition() {
        let reg = registry();
        let m = reg.prf_state(8);
        reg.tracker()
            .lock()
            .unwrap()
            .record("0001")
            .unwrap();
        assert!(m.matches("PRFSTATE 0001"));
        assert!(!m.matches("STATE 1 ARMED"));
        assert_eq!(m.attr("state"), Some(Value::Str("ON".into())));
    }

    #[test]
    fn scope_data_lifecycle() {
        let mut scope = Scope::new(Value::Null, registry());
        assert!(scope.lookup("data").is_none());
        scope.install_data(Value::Int(1));
        assert_eq!(scope.lookup("data"), Some(Value::Int(1)));
        scope.remove_data();
        assert!(scope.lookup("data").is_none());
    }

    #[test]
    fn value_equality_across_numeric_types() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::Str("2".into()));
    }
}
