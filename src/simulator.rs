//! JA-121T panel simulator
//!
//! A stand-in for the real panel used by tests and local development. It
//! implements the serial link trait, interprets the command grammar of
//! the JA-121T (`SET`/`UNSET`/`STATE`/`PRFSTATE`), and produces replies
//! into an internal buffer that the serial worker drains. Replies are
//! delayed by `response_delay` to mimic panel latency, and a background
//! worker injects periodic lines from time-triggered rules.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SimulatorConfig;
use crate::prfstate::{self, PrfTracker};
use crate::rules::definition::{deep_eval, Node};
use crate::rules::{MatcherRegistry, RuleError, Scope, Value};
use crate::serial::{SerialError, SerialLink};

pub const ERROR_INVALID_VALUE: &str = "ERROR: 4 INVALID_VALUE";
pub const ERROR_NO_ACCESS: &str = "ERROR: 3 NO_ACCESS";

const STATE_READY: &str = "READY";
const STATE_ARMED: &str = "ARMED";

/// How often the time-rule worker checks its schedule.
const WORKER_TICK: Duration = Duration::from_millis(500);

/// Buffer of pending reply lines, each released at its due time.
///
/// Keeps the response delay out of the write path so that a command never
/// blocks the caller; `pop` waits on a condition variable until the front
/// entry is due or the timeout expires.
#[derive(Debug, Default)]
struct ReplyBuffer {
    queue: Mutex<VecDeque<(Instant, String)>>,
    available: Condvar,
}

impl ReplyBuffer {
    fn push(&self, line: String, delay: Duration) {
        let mut queue = self.queue.lock().expect("reply buffer lock");
        queue.push_back((Instant::now() + delay, line));
        self.available.notify_all();
    }

    fn pop(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().expect("reply buffer lock");
        loop {
            let now = Instant::now();
            let wait = match queue.front() {
                Some((due, _)) if *due <= now => {
                    return queue.pop_front().map(|(_, line)| line);
                }
                Some((due, _)) => {
                    if now >= deadline {
                        return None;
                    }
                    (*due).min(deadline).saturating_duration_since(now)
                }
                None => {
                    if now >= deadline {
                        return None;
                    }
                    deadline - now
                }
            };
            let (guard, _) = self
                .available
                .wait_timeout(queue, wait)
                .expect("reply buffer lock");
            queue = guard;
        }
    }
}

/// Shared state of the simulated panel.
struct PanelState {
    pin: String,
    sections: Mutex<BTreeMap<u32, String>>,
    buffer: ReplyBuffer,
    response_delay: Duration,
    positions: Vec<usize>,
    bits: usize,
    re_set: Regex,
    re_state: Regex,
}

impl PanelState {
    fn check_pin(&self, pin: &str) -> bool {
        if pin != self.pin {
            self.buffer
                .push(ERROR_NO_ACCESS.to_string(), self.response_delay);
            return false;
        }
        true
    }

    /// Interprets one command line and queues the replies.
    fn handle_command(&self, line: &str) {
        if let Some(caps) = self.re_set.captures(line) {
            let pin = &caps["pin"];
            let arm = &caps["command"] == "SET";
            let code: u32 = match caps["code"].parse() {
                Ok(c) => c,
                Err(_) => {
                    self.buffer
                        .push(ERROR_INVALID_VALUE.to_string(), self.response_delay);
                    return;
                }
            };
            if !self.check_pin(pin) {
                return;
            }
            let reply = self.switch_section(code, arm);
            self.buffer.push(reply, self.response_delay);
            return;
        }
        if let Some(caps) = self.re_state.captures(line) {
            if !self.check_pin(&caps["pin"]) {
                return;
            }
            let filter: Option<u32> = caps.name("code").and_then(|m| m.as_str().parse().ok());
            let sections = self.sections.lock().expect("panel sections lock");
            for (code, state) in sections.iter() {
                if filter.map(|f| f == *code).unwrap_or(true) {
                    self.buffer
                        .push(format!("STATE {code} {state}"), self.response_delay);
                }
            }
            return;
        }
        if line.trim() == "PRFSTATE" {
            self.buffer
                .push(self.random_prfstate(), self.response_delay);
            return;
        }
        warn!("The simulator received an unknown command: {}", line);
    }

    fn switch_section(&self, code: u32, arm: bool) -> String {
        let mut sections = self.sections.lock().expect("panel sections lock");
        let state = match sections.get_mut(&code) {
            Some(state) => state,
            None => return ERROR_INVALID_VALUE.to_string(),
        };
        let (from, to) = if arm {
            (STATE_READY, STATE_ARMED)
        } else {
            (STATE_ARMED, STATE_READY)
        };
        if *state == to {
            return ERROR_INVALID_VALUE.to_string();
        }
        if *state != from {
            warn!(
                "Cannot switch section {} from state {}.",
                code, state
            );
            return ERROR_INVALID_VALUE.to_string();
        }
        *state = to.to_string();
        format!("STATE {code} {to}")
    }

    /// A fresh random peripheral map over the configured positions,
    /// encoded the way the panel reports it.
    fn random_prfstate(&self) -> String {
        let mut rng = rand::rng();
        let mut flags = vec![false; self.bits];
        for &pos in &self.positions {
            if pos < self.bits {
                flags[pos] = rng.random_bool(0.5);
            }
        }
        format!("PRFSTATE {}", prfstate::encode(&flags, self.bits))
    }
}

/// Compiled time-triggered rule of the simulator worker.
struct TimeRule {
    time_next: Node,
    write: Node,
    next_at: Option<Instant>,
}

/// The simulator component. Hand its [`SerialLink`] to the serial
/// component and start the worker for time-triggered injections.
pub struct Simulator {
    state: Arc<PanelState>,
    rules: Vec<TimeRule>,
    scope: Scope,
}

impl Simulator {
    pub fn new(
        config: &SimulatorConfig,
        positions: Vec<usize>,
        bits: usize,
        topology: Value,
    ) -> Result<Self, RuleError> {
        let sections = config
            .sections
            .iter()
            .map(|s| (s.code, s.state.clone()))
            .collect();
        let state = Arc::new(PanelState {
            pin: config.pin.clone(),
            sections: Mutex::new(sections),
            buffer: ReplyBuffer::default(),
            response_delay: Duration::from_secs_f64(config.response_delay),
            positions,
            bits,
            re_set: Regex::new(r"^(?P<pin>[0-9]+) (?P<command>SET|UNSET) (?P<code>[0-9]+)$")
                .expect("simulator command pattern"),
            re_state: Regex::new(r"^(?P<pin>[0-9]+) STATE(?: (?P<code>[0-9]+))?$")
                .expect("simulator command pattern"),
        });
        let rules = config
            .rules
            .iter()
            .map(|r| {
                Ok(TimeRule {
                    time_next: Node::compile(&r.time_next)?,
                    write: Node::compile(&r.write)?,
                    next_at: None,
                })
            })
            .collect::<Result<Vec<_>, RuleError>>()?;
        // the simulator evaluates its rules against its own registry, not
        // the bridge's
        let registry = Arc::new(MatcherRegistry::new(Arc::new(Mutex::new(PrfTracker::new(
            bits,
        )))));
        info!(
            "The serial interface events will be simulated, pin={}, sections={}.",
            state.pin,
            state.sections.lock().expect("panel sections lock").len()
        );
        Ok(Self {
            state,
            rules,
            scope: Scope::new(topology, registry),
        })
    }

    /// A serial link backed by this simulator.
    pub fn link(&self) -> SimulatorLink {
        SimulatorLink {
            state: self.state.clone(),
        }
    }

    /// Worker that injects lines from time-triggered rules.
    pub fn start(mut self, exit: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = exit.cancelled() => break,
                    _ = tokio::time::sleep(WORKER_TICK) => {
                        let now = Instant::now();
                        for rule in &mut self.rules {
                            match rule.next_at {
                                // first observation only schedules
                                None => {
                                    if let Some(interval) = Simulator::interval_of(&self.scope, rule) {
                                        rule.next_at = Some(now + interval);
                                    }
                                }
                                Some(due) if due <= now => {
                                    match deep_eval(&rule.write, &self.scope, true) {
                                        Ok(line) => self.state.buffer.push(line.to_string(), Duration::ZERO),
                                        Err(e) => error!("{}", e),
                                    }
                                    rule.next_at = Simulator::interval_of(&self.scope, rule)
                                        .map(|interval| now + interval);
                                }
                                Some(_) => {}
                            }
                        }
                    }
                }
            }
            info!("Simulator worker ended.");
        })
    }

    fn interval_of(scope: &Scope, rule: &TimeRule) -> Option<Duration> {
        match deep_eval(&rule.time_next, scope, false) {
            Ok(Value::Int(secs)) if secs >= 0 => Some(Duration::from_secs(secs as u64)),
            Ok(Value::Float(secs)) if secs >= 0.0 => Some(Duration::from_secs_f64(secs)),
            Ok(other) => {
                error!(
                    "The simulator rule interval evaluated to a {} value.",
                    other.type_name()
                );
                None
            }
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }
}

/// Serial link backed by the in-process simulator.
#[derive(Clone)]
pub struct SimulatorLink {
    state: Arc<PanelState>,
}

impl SerialLink for SimulatorLink {
    fn open(&mut self) -> Result<(), SerialError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn write_line(&mut self, line: &str) -> Result<(), SerialError> {
        if !line.is_ascii() {
            return Err(SerialError::Encoding(line.to_string()));
        }
        self.state.handle_command(line.trim_end_matches('\n'));
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, SerialError> {
        Ok(self.state.buffer.pop(timeout))
    }

    fn label(&self) -> String {
        "<simulator>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SimSection, SimulatorConfig};
    use crate::prfstate;

    fn simulator() -> Simulator {
        let config = SimulatorConfig {
            pin: "1234".to_string(),
            response_delay: 0.0,
            sections: vec![
                SimSection {
                    code: 1,
                    state: "READY".to_string(),
                },
                SimSection {
                    code: 2,
                    state: "ARMED".to_string(),
                },
            ],
            rules: Vec::new(),
        };
        Simulator::new(&config, vec![1, 8], 16, Value::Null).unwrap()
    }

    fn roundtrip(sim: &Simulator, command: &str) -> Vec<String> {
        let mut link = sim.link();
        link.write_line(command).unwrap();
        let mut replies = Vec::new();
        while let Some(line) = link.read_line(Duration::from_millis(10)).unwrap() {
            replies.push(line);
        }
        replies
    }

    #[test]
    fn set_arms_a_ready_section() {
        let sim = simulator();
        assert_eq!(roundtrip(&sim, "1234 SET 1"), ["STATE 1 ARMED"]);
        assert_eq!(roundtrip(&sim, "1234 SET 1"), [ERROR_INVALID_VALUE]);
    }

    #[test]
    fn unset_is_symmetric() {
        let sim = simulator();
        assert_eq!(roundtrip(&sim, "1234 UNSET 2"), ["STATE 2 READY"]);
        assert_eq!(roundtrip(&sim, "1234 UNSET 2"), [ERROR_INVALID_VALUE]);
    }

    #[test]
    fn wrong_pin_is_no_access() {
        let sim = simulator();
        assert_eq!(roundtrip(&sim, "9999 SET 1"), [ERROR_NO_ACCESS]);
    }

    #[test]
    fn unknown_section_is_invalid_value() {
        let sim = simulator();
        assert_eq!(roundtrip(&sim, "1234 SET 9"), [ERROR_INVALID_VALUE]);
    }

    #[test]
    fn state_lists_sections_with_optional_filter() {
        let sim = simulator();
        assert_eq!(
            roundtrip(&sim, "1234 STATE"),
            ["STATE 1 READY", "STATE 2 ARMED"]
        );
        assert_eq!(roundtrip(&sim, "1234 STATE 2"), ["STATE 2 ARMED"]);
    }

    #[test]
    fn prfstate_reports_only_configured_positions() {
        let sim = simulator();
        let replies = roundtrip(&sim, "PRFSTATE");
        assert_eq!(replies.len(), 1);
        let hex = replies[0].strip_prefix("PRFSTATE ").unwrap();
        let flags = prfstate::decode(hex).unwrap();
        assert_eq!(flags.len(), 16);
        for (pos, on) in flags.iter().enumerate() {
            if *on {
                assert!([1usize, 8].contains(&pos), "unexpected peripheral {pos}");
            }
        }
    }

    #[test]
    fn replies_are_delayed_by_response_delay() {
        let config = SimulatorConfig {
            pin: "1".to_string(),
            response_delay: 0.05,
            sections: vec![SimSection {
                code: 1,
                state: "READY".to_string(),
            }],
            rules: Vec::new(),
        };
        let sim = Simulator::new(&config, vec![], 16, Value::Null).unwrap();
        let mut link = sim.link();
        link.write_line("1 SET 1").unwrap();
        assert_eq!(link.read_line(Duration::from_millis(5)).unwrap(), None);
        assert_eq!(
            link.read_line(Duration::from_millis(200)).unwrap().as_deref(),
            Some("STATE 1 ARMED")
        );
    }
}
