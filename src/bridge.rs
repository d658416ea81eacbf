//! # Serial ↔ MQTT Bridge Core
//!
//! The translator between the two wire forms. It consumes lines from the
//! serial buffer, applies the `serial2mqtt` rules, and publishes JSON
//! payloads; it consumes inbound MQTT messages, applies the `mqtt2serial`
//! rules, and writes serial command lines. It also owns the shared rule
//! [`Scope`], the PRFSTATE snapshot history, and the correlation queue
//! pairing outbound commands with the asynchronous responses that follow.
//!
//! ## Rule walk
//!
//! Topics and rules are walked in declaration order. On the serial side
//! the first matching rule of a topic fires and, unless it sets
//! `process_next_rule`, stops the walk across the remaining topics. On
//! the MQTT side the inbound payload is validated against the rule's
//! `read` section and the first valid rule fires; a validation failure
//! drops the message with a dotted-path error.
//!
//! ## Correlation
//!
//! Each translated MQTT command enqueues a [`PendingRequest`]. When a
//! serial line is translated back, the correlation manager is consulted
//! once for that line: a queued request supersedes the current one, and a
//! live request (within `correlation_timeout`, positive TTL) contributes
//! the correlation id field to the published JSON and loses one TTL unit.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::mqtt::{MqttHandle, MqttPublish};
use crate::prfstate::PrfTracker;
use crate::rules::definition::{deep_eval, deep_merge, Node};
use crate::rules::expr::render_template;
use crate::rules::{Definition, MatcherRegistry, Rule, RuleError, Scope, Value};
use crate::serial::SerialHandle;

/// Poll interval of the bridge worker on the serial buffer.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Cannot parse the event data. {0}")]
    Payload(String),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// A request produced by an MQTT command, waiting for the serial
/// responses that belong to it.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub corr_id: Option<Value>,
    pub created_at: Instant,
    pub ttl: u32,
}

/// FIFO of pending requests plus the single current slot.
#[derive(Debug)]
struct CorrelationTracker {
    field: Option<String>,
    timeout: Duration,
    queue: VecDeque<PendingRequest>,
    current: Option<PendingRequest>,
}

impl CorrelationTracker {
    fn new(field: Option<String>, timeout: Duration) -> Self {
        Self {
            field,
            timeout,
            queue: VecDeque::new(),
            current: None,
        }
    }

    fn enqueue(&mut self, corr_id: Option<Value>, ttl: u32) {
        self.queue.push_back(PendingRequest {
            corr_id,
            created_at: Instant::now(),
            ttl,
        });
    }

    /// Consulted once per serial line. Returns the correlation patch for
    /// the published JSON and whether a live request exists.
    fn update(&mut self) -> (BTreeMap<String, Value>, bool) {
        if let Some(next) = self.queue.pop_front() {
            // a new request always supersedes the previous one
            self.current = Some(next);
        }
        let mut patch = BTreeMap::new();
        let live = self
            .current
            .as_ref()
            .map(|request| request.created_at.elapsed() < self.timeout && request.ttl > 0)
            .unwrap_or(false);
        if !live {
            if self.current.take().is_some() {
                debug!(
                    "Discarding the request for correlation. The correlation timeout or TTL \
                     expired."
                );
            }
            return (patch, false);
        }
        if let Some(request) = self.current.as_mut() {
            if let (Some(field), Some(corr_id)) = (&self.field, &request.corr_id) {
                patch.insert(field.clone(), corr_id.clone());
            }
            request.ttl -= 1;
        }
        (patch, true)
    }
}

/// Mutable bridge state, guarded by one lock so that a rule evaluation is
/// a single critical path.
struct BridgeState {
    scope: Scope,
    correlation: CorrelationTracker,
}

/// The bridge component. Constructed after the definition, serial, and
/// MQTT components; owns no worker thread of its own apart from
/// [`Bridge::start_worker`] and [`Bridge::start_mqtt_consumer`].
pub struct Bridge {
    definition: Definition,
    serial: SerialHandle,
    mqtt: MqttHandle,
    tracker: Arc<StdMutex<PrfTracker>>,
    state: Mutex<BridgeState>,
}

impl Bridge {
    pub fn new(
        definition: Definition,
        topology: Value,
        serial: SerialHandle,
        mqtt: MqttHandle,
    ) -> Self {
        let tracker = Arc::new(StdMutex::new(PrfTracker::new(definition.prfstate_bits)));
        let registry = Arc::new(MatcherRegistry::new(tracker.clone()));
        let scope = Scope::new(topology, registry);
        let correlation = CorrelationTracker::new(
            definition.correlation_id.clone(),
            Duration::from_secs_f64(definition.correlation_timeout),
        );
        info!(
            "There are {} serial2mqtt and {} mqtt2serial topics.",
            definition.serial2mqtt.len(),
            definition.mqtt2serial.len()
        );
        debug!(
            "The serial2mqtt topics are: {}",
            topic_list(&definition.serial2mqtt)
        );
        debug!(
            "The mqtt2serial topics are: {}",
            topic_list(&definition.mqtt2serial)
        );
        Self {
            definition,
            serial,
            mqtt,
            tracker,
            state: Mutex::new(BridgeState { scope, correlation }),
        }
    }

    /// Topics the MQTT client subscribes to: every non-disabled
    /// `mqtt2serial` topic.
    pub fn subscriptions(&self) -> Vec<String> {
        self.definition
            .mqtt2serial
            .iter()
            .filter(|t| !t.disabled)
            .map(|t| t.name.clone())
            .collect()
    }

    /// Handles one message received from the broker: validates it
    /// against the `mqtt2serial` rules and writes the translated line to
    /// the serial port, enqueueing a pending request for correlation.
    pub async fn on_mqtt_message(&self, topic_name: &str, payload: &str) -> Result<(), BridgeError> {
        if !self.serial.is_ready() {
            warn!("No messages will be processed. The serial interface is not available.");
            return Ok(());
        }
        let json: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| BridgeError::Payload(e.to_string()))?;
        if !json.is_object() {
            return Err(BridgeError::Payload(
                "The event data is not a JSON object.".to_string(),
            ));
        }
        let data = Value::from_json(&json);
        debug!("The event data parsed as JSON object: {}", json);

        let mut state = self.state.lock().await;
        for topic in &self.definition.mqtt2serial {
            if topic.name != topic_name || topic.disabled {
                continue;
            }
            for rule in &topic.rules {
                if let Some(read) = &rule.read {
                    check_rule_data(read, &data, &state.scope, &mut Vec::new())?;
                    debug!("The event data is valid according to the defined rules.");
                }
                // the serial write and the request enqueue happen under
                // the state lock, atomically w.r.t. other commands
                state.scope.install_data(data.clone());
                let result = self.translate_command(&mut state, rule, &data);
                state.scope.remove_data();
                result?;
                break;
            }
        }
        Ok(())
    }

    /// Evaluates the rule's write template, enqueues the pending request,
    /// and emits the line. Runs with `data` installed in the scope.
    fn translate_command(
        &self,
        state: &mut BridgeState,
        rule: &Rule,
        data: &Value,
    ) -> Result<(), BridgeError> {
        let write = match &rule.write {
            Some(write) => write,
            None => {
                debug!("The rule has no write template, nothing to send.");
                return Ok(());
            }
        };
        let line = match write.as_literal_str() {
            // a plain-string write is a template over the payload fields
            Some(template) => render_template(template, data)?,
            None => deep_eval(write, &state.scope, false)?.to_string(),
        };
        let corr_id = self
            .definition
            .correlation_id
            .as_deref()
            .and_then(|field| data.attr(field));
        state.correlation.enqueue(corr_id, rule.request_ttl);
        if let Err(e) = self.serial.write_line(&line) {
            error!("{}", e);
        }
        Ok(())
    }

    /// Handles one line received from the serial port: records PRFSTATE
    /// snapshots, walks the `serial2mqtt` rules, and publishes the first
    /// match as JSON.
    pub async fn on_serial_data(&self, line: &str) {
        if let Some(hex) = line.strip_prefix("PRFSTATE ") {
            let mut tracker = self.tracker.lock().expect("prf tracker lock");
            if let Err(e) = tracker.record(hex.trim()) {
                error!("{}", e);
            }
        }
        if !self.mqtt.is_connected() {
            warn!("No events will be published. The client is not connected to the MQTT broker.");
            return;
        }

        let mut state = self.state.lock().await;
        // remembers the last matched rule's process_next_rule flag
        let mut matched: Option<bool> = None;
        // the correlation manager is consulted at most once per line
        let mut correlation: Option<(BTreeMap<String, Value>, bool)> = None;

        'topics: for topic in &self.definition.serial2mqtt {
            for rule in &topic.rules {
                let read = match &rule.read {
                    Some(read) => read,
                    None => continue,
                };
                let value = match deep_eval(read, &state.scope, false) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("{}", e);
                        continue;
                    }
                };
                if !value.matches_line(line) {
                    continue;
                }
                matched = Some(rule.process_next_rule);
                if !topic.disabled {
                    let (patch, has_request) = correlation
                        .get_or_insert_with(|| state.correlation.update())
                        .clone();
                    if rule.require_request && !has_request {
                        debug!(
                            "The rule requires a pending request and there is none, skipping."
                        );
                    } else if let Some(write) = &rule.write {
                        let patch = if rule.no_correlation {
                            BTreeMap::new()
                        } else {
                            patch
                        };
                        state.scope.install_data(value);
                        let merged = deep_merge(write, &patch);
                        let payload = deep_eval(&merged, &state.scope, true);
                        state.scope.remove_data();
                        match payload {
                            Ok(payload) => {
                                let json = payload.to_json().to_string();
                                if let Err(e) = self.mqtt.publish(&topic.name, json) {
                                    error!("{}", e);
                                }
                            }
                            Err(e) => warn!("{}", e),
                        }
                    }
                }
                if !rule.process_next_rule {
                    break;
                }
            }
            if matched == Some(false) {
                break 'topics;
            }
        }

        if matched.is_none() {
            debug!("No rule found for the data: {}", line);
        }
    }

    /// Publishes a system error to the configured error topic, when any.
    pub fn report_error(&self, text: &str) {
        if let Some(topic) = &self.definition.topic_sys_error {
            if self.mqtt.is_connected() {
                let payload = serde_json::json!({ "error": text }).to_string();
                if let Err(e) = self.mqtt.publish(topic, payload) {
                    error!("{}", e);
                }
            }
        }
    }

    /// The bridge worker: drains the serial line buffer with a 1 s poll.
    /// After the exit signal it keeps draining until one poll interval
    /// passes without a line, so buffered input is not lost.
    pub fn start_worker(
        self: &Arc<Self>,
        mut lines: mpsc::UnboundedReceiver<String>,
        exit: CancellationToken,
    ) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(POLL_INTERVAL, lines.recv()).await {
                    Ok(Some(line)) => bridge.on_serial_data(&line).await,
                    Ok(None) => break,
                    Err(_) => {
                        if exit.is_cancelled() {
                            break;
                        }
                    }
                }
            }
            info!("Bridge worker ended.");
        })
    }

    /// Consumer of inbound MQTT messages. Protocol failures are logged,
    /// reported to the system error topic, and the message is dropped.
    pub fn start_mqtt_consumer(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<MqttPublish>,
        exit: CancellationToken,
    ) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = exit.cancelled() => break,
                    message = inbound.recv() => {
                        let Some(message) = message else { break };
                        if let Err(e) = bridge.on_mqtt_message(&message.topic, &message.payload).await {
                            error!("{}", e);
                            bridge.report_error(&e.to_string());
                        }
                    }
                }
            }
            info!("Bridge MQTT consumer ended.");
        })
    }
}

fn topic_list(topics: &[crate::rules::Topic]) -> String {
    topics
        .iter()
        .map(|t| {
            if t.disabled {
                format!("{} (disabled)", t.name)
            } else {
                t.name.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Structural validation of an inbound payload against a rule's `read`
/// section. Every key must be present; literal values must match in type
/// and value; expression values must equal the payload value at match
/// time; nested mappings recurse. Failures carry the dotted path.
fn check_rule_data(
    read: &Node,
    data: &Value,
    scope: &Scope,
    path: &mut Vec<String>,
) -> Result<(), RuleError> {
    let entries = match read {
        Node::Map(entries) => entries,
        // a scalar read at the top level accepts any payload it equals
        _ => return Ok(()),
    };
    for (key, node) in entries {
        path.push(key.clone());
        let dotted = path.join(".");
        let found = match data.attr(key) {
            Some(found) => found,
            None => {
                return Err(RuleError::ValidationError(format!(
                    "Missing property {key}."
                )))
            }
        };
        match node {
            Node::Map(_) => {
                if !matches!(found, Value::Map(_)) {
                    return Err(RuleError::ValidationError(format!(
                        "Invalid type of property {dotted}, found: {}, expected: map",
                        found.type_name()
                    )));
                }
                check_rule_data(node, &found, scope, path)?;
            }
            Node::Expr(expr) => {
                let expected = expr.eval(scope).map_err(|e| {
                    RuleError::ValidationError(format!(
                        "Cannot evaluate the expression for property {dotted}. {e}"
                    ))
                })?;
                if expected != found {
                    return Err(RuleError::ValidationError(format!(
                        "Invalid value of property {dotted}, found: {found}, expected: {expected}"
                    )));
                }
            }
            Node::Literal(expected) => {
                if expected.type_name() != found.type_name()
                    && !matches!(
                        (expected, &found),
                        (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_))
                    )
                {
                    return Err(RuleError::ValidationError(format!(
                        "Invalid type of property {dotted}, found: {}, expected: {}",
                        found.type_name(),
                        expected.type_name()
                    )));
                }
                if *expected != found {
                    return Err(RuleError::ValidationError(format!(
                        "Invalid value of property {dotted}, found: {found}, expected: {expected}"
                    )));
                }
            }
            Node::Seq(_) => {
                if !matches!(found, Value::Seq(_)) {
                    return Err(RuleError::ValidationError(format!(
                        "Invalid type of property {dotted}, found: {}, expected: seq",
                        found.type_name()
                    )));
                }
            }
        }
        path.pop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEST_DEF: &str = r#"
system:
  topic_prefix: ja2mqtt
  correlation_id: corrid
  correlation_timeout: 5
  topic_sys_error: error
  prfstate_bits: 16
serial2mqtt:
  - name: section
    rules:
      - read: !expr section_state('STATE (\d+) (\w+)', 1, 2)
        write:
          section_code: !expr int(data.group(1))
          state: !expr data.group(2)
  - name: prfstate
    rules:
      - read: !expr prf_state(8)
        write:
          pos: 8
          state: !expr data.state
      - read: !expr prf_state(9)
        write:
          pos: 9
          state: !expr data.state
  - name: error
    rules:
      - read: !expr pattern('ERROR.*')
        write:
          error: !expr data.group(0)
        no_correlation: true
mqtt2serial:
  - name: section/set
    rules:
      - read:
          section_code: !expr data.section_code
          pin: !expr data.pin
        write: "{pin} SET {section_code}"
  - name: section/get
    rules:
      - read: null
        write: "{pin} STATE"
        request_ttl: 4
"#;

    fn bridge_with(
        def: &str,
        serial_ready: bool,
        mqtt_connected: bool,
    ) -> (
        Arc<Bridge>,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedReceiver<MqttPublish>,
    ) {
        let definition = Definition::from_str(def).unwrap();
        let (serial, serial_rx) = SerialHandle::test_handle(serial_ready);
        let (mqtt, mqtt_rx) = MqttHandle::test_handle(mqtt_connected);
        (
            Arc::new(Bridge::new(definition, Value::Null, serial, mqtt)),
            serial_rx,
            mqtt_rx,
        )
    }

    fn published(rx: &mut mpsc::UnboundedReceiver<MqttPublish>) -> Vec<(String, serde_json::Value)> {
        let mut out = Vec::new();
        while let Ok(publish) = rx.try_recv() {
            out.push((
                publish.topic,
                serde_json::from_str(&publish.payload).unwrap(),
            ));
        }
        out
    }

    #[tokio::test]
    async fn arming_a_section_translates_both_ways() {
        let (bridge, mut serial_rx, mut mqtt_rx) = bridge_with(TEST_DEF, true, true);
        bridge
            .on_mqtt_message("ja2mqtt/section/set", r#"{"section_code": 1, "pin": "1234"}"#)
            .await
            .unwrap();
        assert_eq!(serial_rx.try_recv().unwrap(), "1234 SET 1");

        bridge.on_serial_data("STATE 1 ARMED").await;
        let messages = published(&mut mqtt_rx);
        assert_eq!(
            messages,
            [(
                "ja2mqtt/section".to_string(),
                json!({"section_code": 1, "state": "ARMED"}),
            )]
        );
    }

    #[tokio::test]
    async fn correlation_id_flows_to_the_response() {
        let (bridge, mut serial_rx, mut mqtt_rx) = bridge_with(TEST_DEF, true, true);
        bridge
            .on_mqtt_message(
                "ja2mqtt/section/set",
                r#"{"section_code": 1, "pin": "1234", "corrid": "abc"}"#,
            )
            .await
            .unwrap();
        assert_eq!(serial_rx.try_recv().unwrap(), "1234 SET 1");

        bridge.on_serial_data("STATE 1 ARMED").await;
        let messages = published(&mut mqtt_rx);
        assert_eq!(
            messages[0].1,
            json!({"corrid": "abc", "section_code": 1, "state": "ARMED"})
        );
    }

    #[tokio::test]
    async fn correlation_expires_after_the_timeout() {
        let def = TEST_DEF.replace("correlation_timeout: 5", "correlation_timeout: 0.1");
        let (bridge, _serial_rx, mut mqtt_rx) = bridge_with(&def, true, true);
        bridge
            .on_mqtt_message(
                "ja2mqtt/section/set",
                r#"{"section_code": 1, "pin": "1234", "corrid": "abc"}"#,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        bridge.on_serial_data("STATE 1 ARMED").await;
        let messages = published(&mut mqtt_rx);
        assert_eq!(
            messages[0].1,
            json!({"section_code": 1, "state": "ARMED"})
        );
    }

    #[tokio::test]
    async fn request_ttl_bounds_the_correlated_responses() {
        let (bridge, _serial_rx, mut mqtt_rx) = bridge_with(TEST_DEF, true, true);
        bridge
            .on_mqtt_message("ja2mqtt/section/get", r#"{"pin": "1234", "corrid": "xyz"}"#)
            .await
            .unwrap();
        // request_ttl is 4, so the fifth response line loses the id
        for line in [
            "STATE 1 ARMED",
            "STATE 2 ARMED",
            "STATE 1 READY",
            "STATE 2 READY",
            "STATE 3 ARMED",
        ] {
            bridge.on_serial_data(line).await;
        }
        let messages = published(&mut mqtt_rx);
        assert_eq!(messages.len(), 5);
        for message in &messages[..4] {
            assert_eq!(message.1["corrid"], "xyz");
        }
        assert_eq!(messages[4].1.get("corrid"), None);
    }

    #[tokio::test]
    async fn no_correlation_rules_strip_the_patch() {
        let (bridge, _serial_rx, mut mqtt_rx) = bridge_with(TEST_DEF, true, true);
        bridge
            .on_mqtt_message(
                "ja2mqtt/section/set",
                r#"{"section_code": 1, "pin": "9999", "corrid": "abc"}"#,
            )
            .await
            .unwrap();
        bridge.on_serial_data("ERROR: 3 NO_ACCESS").await;
        let messages = published(&mut mqtt_rx);
        assert_eq!(
            messages,
            [(
                "ja2mqtt/error".to_string(),
                json!({"error": "ERROR: 3 NO_ACCESS"}),
            )]
        );
    }

    #[tokio::test]
    async fn prfstate_transitions_publish_per_position() {
        let (bridge, _serial_rx, mut mqtt_rx) = bridge_with(TEST_DEF, true, true);
        bridge.on_serial_data("PRFSTATE 0001").await;
        let messages = published(&mut mqtt_rx);
        assert_eq!(
            messages,
            [(
                "ja2mqtt/prfstate".to_string(),
                json!({"pos": 8, "state": "ON"}),
            )]
        );

        bridge.on_serial_data("PRFSTATE 0003").await;
        let messages = published(&mut mqtt_rx);
        assert_eq!(
            messages,
            [(
                "ja2mqtt/prfstate".to_string(),
                json!({"pos": 9, "state": "ON"}),
            )]
        );
    }

    #[tokio::test]
    async fn unchanged_prfstate_produces_no_publish() {
        let (bridge, _serial_rx, mut mqtt_rx) = bridge_with(TEST_DEF, true, true);
        bridge.on_serial_data("PRFSTATE 0001").await;
        published(&mut mqtt_rx);
        bridge.on_serial_data("PRFSTATE 0001").await;
        assert!(published(&mut mqtt_rx).is_empty());
    }

    #[tokio::test]
    async fn validation_failure_drops_the_message_and_cleans_the_scope() {
        let (bridge, mut serial_rx, _mqtt_rx) = bridge_with(TEST_DEF, true, true);
        let result = bridge
            .on_mqtt_message("ja2mqtt/section/set", r#"{"section_code": 1}"#)
            .await;
        assert!(matches!(
            result,
            Err(BridgeError::Rule(RuleError::ValidationError(_)))
        ));
        assert!(serial_rx.try_recv().is_err());
        assert!(!bridge.state.lock().await.scope.has_data());
    }

    #[tokio::test]
    async fn malformed_json_is_a_payload_error() {
        let (bridge, _serial_rx, _mqtt_rx) = bridge_with(TEST_DEF, true, true);
        let result = bridge.on_mqtt_message("ja2mqtt/section/set", "not json").await;
        assert!(matches!(result, Err(BridgeError::Payload(_))));
    }

    #[tokio::test]
    async fn messages_are_dropped_while_the_serial_port_is_down() {
        let (bridge, mut serial_rx, _mqtt_rx) = bridge_with(TEST_DEF, false, true);
        bridge
            .on_mqtt_message("ja2mqtt/section/set", r#"{"section_code": 1, "pin": "1234"}"#)
            .await
            .unwrap();
        assert!(serial_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn nothing_is_published_while_disconnected() {
        let (bridge, _serial_rx, mut mqtt_rx) = bridge_with(TEST_DEF, true, false);
        bridge.on_serial_data("PRFSTATE 0001").await;
        assert!(published(&mut mqtt_rx).is_empty());
        // the snapshot was still recorded, so no transition after reconnect
        assert!(!bridge.tracker.lock().unwrap().changed(0));
        assert_eq!(bridge.tracker.lock().unwrap().state(8), "ON");
    }

    #[tokio::test]
    async fn disabled_topics_match_but_do_not_publish() {
        let def = r#"
serial2mqtt:
  - name: first
    disabled: true
    rules:
      - read: OK
        write:
          heartbeat: true
  - name: second
    rules:
      - read: OK
        write:
          heartbeat: true
"#;
        let (bridge, _serial_rx, mut mqtt_rx) = bridge_with(def, true, true);
        bridge.on_serial_data("OK").await;
        // the disabled topic still stops the walk
        assert!(published(&mut mqtt_rx).is_empty());
    }

    #[tokio::test]
    async fn process_next_rule_continues_the_walk() {
        let def = r#"
serial2mqtt:
  - name: first
    rules:
      - read: OK
        write:
          source: first
        process_next_rule: true
  - name: second
    rules:
      - read: OK
        write:
          source: second
"#;
        let (bridge, _serial_rx, mut mqtt_rx) = bridge_with(def, true, true);
        bridge.on_serial_data("OK").await;
        let messages = published(&mut mqtt_rx);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, "ja2mqtt/first");
        assert_eq!(messages[1].0, "ja2mqtt/second");
    }

    #[tokio::test]
    async fn require_request_skips_without_a_live_request() {
        let def = r#"
system:
  correlation_id: corrid
  correlation_timeout: 5
serial2mqtt:
  - name: reply
    rules:
      - read: OK
        write:
          ok: true
        require_request: true
mqtt2serial:
  - name: command
    rules:
      - read: null
        write: "CMD"
"#;
        let (bridge, _serial_rx, mut mqtt_rx) = bridge_with(def, true, true);
        bridge.on_serial_data("OK").await;
        assert!(published(&mut mqtt_rx).is_empty());

        bridge
            .on_mqtt_message("ja2mqtt/command", r#"{"corrid": "r1"}"#)
            .await
            .unwrap();
        bridge.on_serial_data("OK").await;
        let messages = published(&mut mqtt_rx);
        assert_eq!(messages[0].1, json!({"corrid": "r1", "ok": true}));
    }

    #[tokio::test]
    async fn wrong_literal_value_reports_the_dotted_path() {
        let def = r#"
mqtt2serial:
  - name: command
    rules:
      - read:
          options:
            mode: fast
        write: "CMD"
"#;
        let (bridge, _serial_rx, _mqtt_rx) = bridge_with(def, true, true);
        let result = bridge
            .on_mqtt_message("ja2mqtt/command", r#"{"options": {"mode": "slow"}}"#)
            .await;
        match result {
            Err(BridgeError::Rule(RuleError::ValidationError(message))) => {
                assert!(message.contains("options.mode"), "message: {message}");
            }
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sys_errors_are_reported_to_the_error_topic() {
        let (bridge, _serial_rx, mut mqtt_rx) = bridge_with(TEST_DEF, true, true);
        bridge.report_error("Cannot parse the event data.");
        let messages = published(&mut mqtt_rx);
        assert_eq!(
            messages,
            [(
                "ja2mqtt/error".to_string(),
                json!({"error": "Cannot parse the event data."}),
            )]
        );
    }

    #[tokio::test]
    async fn expression_writes_render_serial_lines() {
        let def = r#"
mqtt2serial:
  - name: section/unset
    rules:
      - read:
          section_code: !expr data.section_code
          pin: !expr data.pin
        write: !expr format('{pin} UNSET {code}', pin=data.pin, code=data.section_code)
"#;
        let (bridge, mut serial_rx, _mqtt_rx) = bridge_with(def, true, true);
        bridge
            .on_mqtt_message(
                "ja2mqtt/section/unset",
                r#"{"section_code": 2, "pin": "1234"}"#,
            )
            .await
            .unwrap();
        assert_eq!(serial_rx.try_recv().unwrap(), "1234 UNSET 2");
    }

    #[tokio::test]
    async fn worker_drains_buffered_lines_after_exit() {
        let (bridge, _serial_rx, mut mqtt_rx) = bridge_with(TEST_DEF, true, true);
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let exit = CancellationToken::new();
        lines_tx.send("STATE 1 ARMED".to_string()).unwrap();
        lines_tx.send("STATE 2 ARMED".to_string()).unwrap();
        exit.cancel();
        let worker = bridge.start_worker(lines_rx, exit);
        worker.await.unwrap();
        assert_eq!(published(&mut mqtt_rx).len(), 2);
    }
}
