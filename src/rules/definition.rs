//! Definition file loading and rule compilation
//!
//! The definition file is YAML with two ordered topic lists, `serial2mqtt`
//! and `mqtt2serial`, plus a `system` section with bridge options.
//! `read`/`write` subtrees are walked eagerly at load time: every
//! `!expr`-tagged scalar is compiled once into a [`CompiledExpr`] and its
//! literal regex arguments are checked, so a broken definition fails at
//! startup rather than at match time.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde_yaml::Value as Yaml;
use tracing::warn;

use crate::rules::error::RuleError;
use crate::rules::expr::CompiledExpr;
use crate::rules::scope::{Scope, Value};

/// Default topic namespace.
pub const DEFAULT_TOPIC_PREFIX: &str = "ja2mqtt";
/// Default number of peripheral slots in a PRFSTATE report.
pub const DEFAULT_PRFSTATE_BITS: usize = 128;

/// A compiled `read`/`write` subtree: literals, expressions, and nested
/// collections with declaration order preserved.
#[derive(Debug, Clone)]
pub enum Node {
    Literal(Value),
    Expr(CompiledExpr),
    Map(Vec<(String, Node)>),
    Seq(Vec<Node>),
}

impl Node {
    /// Compiles a YAML subtree, turning `!expr` scalars into compiled
    /// expressions. Also used by the simulator for its time rules.
    pub fn compile(yaml: &Yaml) -> Result<Node, RuleError> {
        match yaml {
            Yaml::Tagged(tagged) if tagged.tag == "expr" => {
                let source = tagged.value.as_str().ok_or_else(|| {
                    RuleError::DefinitionError(
                        "An !expr node must be a string scalar.".to_string(),
                    )
                })?;
                let expr = CompiledExpr::compile(source)?;
                expr.validate()?;
                Ok(Node::Expr(expr))
            }
            Yaml::Tagged(tagged) => Err(RuleError::DefinitionError(format!(
                "Unknown tag '!{}' in the definition file.",
                tagged.tag
            ))),
            Yaml::Mapping(m) => {
                let mut entries = Vec::with_capacity(m.len());
                for (k, v) in m {
                    let key = k.as_str().ok_or_else(|| {
                        RuleError::DefinitionError("Mapping keys must be strings.".to_string())
                    })?;
                    entries.push((key.to_string(), Node::compile(v)?));
                }
                Ok(Node::Map(entries))
            }
            Yaml::Sequence(xs) => Ok(Node::Seq(
                xs.iter().map(Node::compile).collect::<Result<_, _>>()?,
            )),
            other => Ok(Node::Literal(Value::from_yaml(other))),
        }
    }

    pub fn as_literal_str(&self) -> Option<&str> {
        match self {
            Node::Literal(Value::Str(s)) => Some(s),
            _ => None,
        }
    }
}

/// Recursively evaluates a node against the scope.
///
/// With `lenient` set (the `write` path), expression failures are logged
/// and replaced by `null`; otherwise (the `read` path) they propagate and
/// the caller treats the rule as non-matching.
pub fn deep_eval(node: &Node, scope: &Scope, lenient: bool) -> Result<Value, RuleError> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Expr(expr) => match expr.eval(scope) {
            Ok(v) => Ok(v),
            Err(e) if lenient => {
                warn!("{}", e);
                Ok(Value::Null)
            }
            Err(e) => Err(e),
        },
        Node::Map(entries) => {
            let mut out = BTreeMap::new();
            for (k, v) in entries {
                out.insert(k.clone(), deep_eval(v, scope, lenient)?);
            }
            Ok(Value::Map(out))
        }
        Node::Seq(items) => Ok(Value::Seq(
            items
                .iter()
                .map(|n| deep_eval(n, scope, lenient))
                .collect::<Result<_, _>>()?,
        )),
    }
}

/// Merges a correlation patch into a write template before evaluation.
/// Patch keys take precedence; template keys are added where absent,
/// nested maps merge recursively.
pub fn deep_merge(node: &Node, patch: &BTreeMap<String, Value>) -> Node {
    if patch.is_empty() {
        return node.clone();
    }
    match node {
        Node::Map(entries) => {
            let mut out: Vec<(String, Node)> = patch
                .iter()
                .map(|(k, v)| (k.clone(), Node::Literal(v.clone())))
                .collect();
            for (k, v) in entries {
                match out.iter().position(|(existing, _)| existing == k) {
                    Some(idx) => {
                        if let (Node::Map(_), Node::Literal(Value::Map(nested))) =
                            (v, &out[idx].1)
                        {
                            let nested = nested.clone();
                            out[idx].1 = deep_merge(v, &nested);
                        }
                    }
                    None => out.push((k.clone(), v.clone())),
                }
            }
            Node::Map(out)
        }
        other => other.clone(),
    }
}

/// One translation rule: a read matcher and a write template plus the
/// correlation flags described in the definition file format.
#[derive(Debug, Clone)]
pub struct Rule {
    pub read: Option<Node>,
    pub write: Option<Node>,
    pub require_request: bool,
    pub no_correlation: bool,
    pub process_next_rule: bool,
    pub request_ttl: u32,
}

impl Rule {
    fn compile(yaml: &Yaml) -> Result<Rule, RuleError> {
        let map = yaml.as_mapping().ok_or_else(|| {
            RuleError::DefinitionError("A rule must be a mapping.".to_string())
        })?;
        let field = |name: &str| map.get(name);
        let flag = |name: &str| -> Result<bool, RuleError> {
            match field(name) {
                None | Some(Yaml::Null) => Ok(false),
                Some(Yaml::Bool(b)) => Ok(*b),
                Some(_) => Err(RuleError::DefinitionError(format!(
                    "The rule property '{name}' must be a boolean."
                ))),
            }
        };
        let read = match field("read") {
            None | Some(Yaml::Null) => None,
            Some(v) => Some(Node::compile(v)?),
        };
        let write = match field("write") {
            None | Some(Yaml::Null) => None,
            Some(v) => Some(Node::compile(v)?),
        };
        let request_ttl = match field("request_ttl").and_then(Yaml::as_u64) {
            Some(ttl) => ttl as u32,
            None if matches!(field("request_ttl"), None | Some(Yaml::Null)) => 1,
            None => {
                return Err(RuleError::DefinitionError(
                    "The rule property 'request_ttl' must be a non-negative integer.".to_string(),
                ))
            }
        };
        Ok(Rule {
            read,
            write,
            require_request: flag("require_request")?,
            no_correlation: flag("no_correlation")?,
            process_next_rule: flag("process_next_rule")?,
            request_ttl,
        })
    }
}

/// A named topic with its ordered rules. The stored name is already
/// prefixed with the configured topic prefix.
#[derive(Debug, Clone)]
pub struct Topic {
    pub name: String,
    pub disabled: bool,
    pub rules: Vec<Rule>,
}

impl Topic {
    fn compile(yaml: &Yaml, prefix: &str) -> Result<Topic, RuleError> {
        let map = yaml.as_mapping().ok_or_else(|| {
            RuleError::DefinitionError("A topic must be a mapping.".to_string())
        })?;
        let name = map
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                RuleError::DefinitionError("A topic must have a string 'name'.".to_string())
            })?;
        let disabled = map
            .get("disabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let rules_yaml = map
            .get("rules")
            .and_then(|v| v.as_sequence())
            .ok_or_else(|| {
                RuleError::DefinitionError(format!(
                    "The topic '{name}' must have a list of rules."
                ))
            })?;
        let rules = rules_yaml
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Topic {
            name: prefix_topic(prefix, name),
            disabled,
            rules,
        })
    }
}

/// Resolves a topic name under the prefix unless it is already prefixed.
pub fn prefix_topic(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() || name == prefix || name.starts_with(&format!("{prefix}/")) {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// The compiled definition: bridge options plus the two immutable,
/// ordered rule sets.
#[derive(Debug)]
pub struct Definition {
    pub topic_prefix: String,
    pub correlation_id: Option<String>,
    pub correlation_timeout: f64,
    pub topic_sys_error: Option<String>,
    pub prfstate_bits: usize,
    pub serial2mqtt: Vec<Topic>,
    pub mqtt2serial: Vec<Topic>,
}

impl Definition {
    pub async fn load(path: &Path) -> Result<Definition, RuleError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            RuleError::DefinitionError(format!(
                "Cannot read the definition file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Definition, RuleError> {
        let root: Yaml = serde_yaml::from_str(content)
            .map_err(|e| RuleError::DefinitionError(format!("Invalid definition file: {e}")))?;
        let map = root.as_mapping().ok_or_else(|| {
            RuleError::DefinitionError("The definition file must be a mapping.".to_string())
        })?;

        let system = map
            .get("system")
            .and_then(|v| v.as_mapping());
        let sys_str = |name: &str| -> Option<String> {
            system
                .and_then(|m| m.get(name))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        let topic_prefix = sys_str("topic_prefix").unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.into());
        let correlation_id = sys_str("correlation_id");
        let correlation_timeout = system
            .and_then(|m| m.get("correlation_timeout"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let topic_sys_error =
            sys_str("topic_sys_error").map(|name| prefix_topic(&topic_prefix, &name));
        let prfstate_bits = system
            .and_then(|m| m.get("prfstate_bits"))
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_PRFSTATE_BITS);
        if prfstate_bits == 0 || prfstate_bits % 8 != 0 {
            return Err(RuleError::DefinitionError(format!(
                "The property 'system.prfstate_bits' must be a positive multiple of 8, found {prfstate_bits}."
            )));
        }

        let topics = |direction: &str| -> Result<Vec<Topic>, RuleError> {
            let list = match map
                .get(direction)
                .and_then(|v| v.as_sequence())
            {
                Some(xs) => xs,
                None => return Ok(Vec::new()),
            };
            let compiled = list
                .iter()
                .map(|t| Topic::compile(t, &topic_prefix))
                .collect::<Result<Vec<_>, _>>()?;
            let mut seen = HashSet::new();
            for topic in &compiled {
                if !seen.insert(topic.name.clone()) {
                    return Err(RuleError::DefinitionError(format!(
                        "There are duplicate topic names in '{direction}': {}",
                        topic.name
                    )));
                }
            }
            Ok(compiled)
        };

        Ok(Definition {
            serial2mqtt: topics("serial2mqtt")?,
            mqtt2serial: topics("mqtt2serial")?,
            topic_prefix,
            correlation_id,
            correlation_timeout,
            topic_sys_error,
            prfstate_bits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prfstate::PrfTracker;
    use crate::rules::scope::MatcherRegistry;
    use std::sync::{Arc, Mutex};

    const DEFINITION: &str = r#"
version: "1.0"
system:
  topic_prefix: ja2mqtt
  correlation_id: corrid
  correlation_timeout: 1.5
  topic_sys_error: error
  prfstate_bits: 16
serial2mqtt:
  - name: section
    rules:
      - read: !expr pattern('STATE (\d+) (\w+)')
        write:
          section_code: !expr int(data.group(1))
          state: !expr data.group(2)
  - name: heartbeat
    disabled: true
    rules:
      - read: OK
        write:
          heartbeat: true
mqtt2serial:
  - name: section/set
    rules:
      - read:
          section_code: !expr 1 + 0
          pin: abc
        write: "{pin} SET {section_code}"
        request_ttl: 2
"#;

    fn scope() -> Scope {
        let tracker = Arc::new(Mutex::new(PrfTracker::new(16)));
        Scope::new(Value::Null, Arc::new(MatcherRegistry::new(tracker)))
    }

    #[test]
    fn loads_topics_in_order_with_prefixes() {
        let def = Definition::from_str(DEFINITION).unwrap();
        assert_eq!(def.topic_prefix, "ja2mqtt");
        assert_eq!(def.correlation_id.as_deref(), Some("corrid"));
        assert_eq!(def.correlation_timeout, 1.5);
        assert_eq!(def.topic_sys_error.as_deref(), Some("ja2mqtt/error"));
        assert_eq!(def.prfstate_bits, 16);
        let names: Vec<_> = def.serial2mqtt.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["ja2mqtt/section", "ja2mqtt/heartbeat"]);
        assert!(def.serial2mqtt[1].disabled);
        assert_eq!(def.mqtt2serial[0].name, "ja2mqtt/section/set");
        assert_eq!(def.mqtt2serial[0].rules[0].request_ttl, 2);
    }

    #[test]
    fn already_prefixed_names_stay_untouched() {
        assert_eq!(prefix_topic("ja2mqtt", "ja2mqtt/section"), "ja2mqtt/section");
        assert_eq!(prefix_topic("ja2mqtt", "section"), "ja2mqtt/section");
        assert_eq!(prefix_topic("ja2mqtt/", "/section"), "ja2mqtt/section");
    }

    #[test]
    fn duplicate_topic_names_are_rejected() {
        let bad = r#"
serial2mqtt:
  - name: a
    rules: [{read: OK, write: {ok: true}}]
  - name: a
    rules: [{read: OK, write: {ok: true}}]
"#;
        assert!(matches!(
            Definition::from_str(bad),
            Err(RuleError::DefinitionError(_))
        ));
    }

    #[test]
    fn bad_regex_is_fatal_at_load() {
        let bad = r#"
serial2mqtt:
  - name: a
    rules:
      - read: !expr pattern('(')
        write: {x: 1}
"#;
        assert!(Definition::from_str(bad).is_err());
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let bad = r#"
serial2mqtt:
  - name: a
    rules:
      - read: !py 1 + 1
        write: {x: 1}
"#;
        assert!(Definition::from_str(bad).is_err());
    }

    #[test]
    fn deep_eval_replaces_expressions() {
        let def = Definition::from_str(DEFINITION).unwrap();
        let mut scope = scope();
        let rule = &def.serial2mqtt[0].rules[0];
        let read = deep_eval(rule.read.as_ref().unwrap(), &scope, false).unwrap();
        assert!(read.matches_line("STATE 1 ARMED"));
        scope.install_data(read);
        let write = deep_eval(rule.write.as_ref().unwrap(), &scope, true).unwrap();
        let json = write.to_json();
        assert_eq!(json["section_code"], 1);
        assert_eq!(json["state"], "ARMED");
        scope.remove_data();
    }

    #[test]
    fn deep_merge_prefers_patch_keys() {
        let node = Node::Map(vec![
            ("state".into(), Node::Literal(Value::Str("ARMED".into()))),
            ("corrid".into(), Node::Literal(Value::Str("rule".into()))),
        ]);
        let mut patch = BTreeMap::new();
        patch.insert("corrid".to_string(), Value::Str("abc".into()));
        let merged = deep_merge(&node, &patch);
        let json = deep_eval(&merged, &scope(), true).unwrap().to_json();
        assert_eq!(json["corrid"], "abc");
        assert_eq!(json["state"], "ARMED");
    }

    #[test]
    fn empty_patch_keeps_the_template() {
        let node = Node::Map(vec![(
            "state".into(),
            Node::Literal(Value::Str("ARMED".into())),
        )]);
        let merged = deep_merge(&node, &BTreeMap::new());
        let json = deep_eval(&merged, &scope(), true).unwrap().to_json();
        assert_eq!(json, serde_json::json!({"state": "ARMED"}));
    }
}
