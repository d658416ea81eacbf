use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::rules::Value;

pub const DEFAULT_BAUDRATE: u32 = 9600;
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_KEEPALIVE: u64 = 60;
pub const DEFAULT_RECONNECT_AFTER: u64 = 30;
pub const DEFAULT_LOOP_TIMEOUT: u64 = 1;
pub const DEFAULT_WAIT_ON_READY: u64 = 10;
pub const DEFAULT_RESPONSE_DELAY: f64 = 0.5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("The configuration file {0} does not exist or cannot be read: {1}")]
    Io(PathBuf, String),

    #[error("The configuration file is not valid: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration loaded from a YAML file.
///
/// The rule definition file is referenced by the `definition` property
/// and resolved relative to the configuration file's directory.
#[derive(Deserialize, Clone, Debug)]
pub struct AppConfig {
    pub definition: PathBuf,

    /// User-provided topology mapping, exposed read-only to rule
    /// expressions. Free-form apart from the duplicate checks below.
    #[serde(default)]
    pub topology: serde_yaml::Value,

    pub serial: SerialConfig,

    #[serde(rename = "mqtt-broker")]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub simulator: Option<SimulatorConfig>,

    #[serde(skip)]
    config_dir: PathBuf,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SerialConfig {
    #[serde(default)]
    pub use_simulator: bool,

    #[serde(default)]
    pub port: Option<String>,

    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    #[serde(default = "default_bytesize")]
    pub bytesize: u8,

    #[serde(default = "default_parity")]
    pub parity: String,

    #[serde(default = "default_stopbits")]
    pub stopbits: u8,

    #[serde(default)]
    pub rtscts: bool,

    #[serde(default)]
    pub xonxoff: bool,

    /// Seconds to wait between attempts to open the port.
    #[serde(default = "default_wait_on_ready")]
    pub wait_on_ready: u64,
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum MqttProtocol {
    #[serde(rename = "3.1")]
    V31,
    #[serde(rename = "3.1.1")]
    V311,
    #[serde(rename = "5")]
    V5,
}

impl Default for MqttProtocol {
    fn default() -> Self {
        MqttProtocol::V311
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MqttTransport {
    #[default]
    Tcp,
    Websocket,
}

#[derive(Deserialize, Clone, Debug)]
pub struct MqttConfig {
    pub address: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_keepalive")]
    pub keepalive: u64,

    /// Seconds to wait after a connection error before polling again.
    #[serde(default = "default_reconnect_after")]
    pub reconnect_after: u64,

    /// Upper bound in seconds for one pass of the network loop.
    #[serde(default = "default_loop_timeout")]
    pub loop_timeout: u64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub protocol: MqttProtocol,

    #[serde(default)]
    pub transport: MqttTransport,

    #[serde(default = "default_clean_session")]
    pub clean_session: bool,

    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SimulatorConfig {
    #[serde(deserialize_with = "string_or_number")]
    pub pin: String,

    #[serde(default = "default_response_delay")]
    pub response_delay: f64,

    pub sections: Vec<SimSection>,

    /// Time-triggered line injections, evaluated by the simulator worker.
    #[serde(default)]
    pub rules: Vec<SimRule>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SimSection {
    pub code: u32,
    pub state: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SimRule {
    /// Seconds until the next firing; may be an `!expr` scalar.
    pub time_next: serde_yaml::Value,
    /// Line to inject; may be an `!expr` scalar.
    pub write: serde_yaml::Value,
}

impl AppConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
        let mut config: AppConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.config_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: AppConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.config_dir = PathBuf::from(".");
        config.validate()?;
        Ok(config)
    }

    /// Path of the rule definition file, resolved against the directory
    /// the configuration file was loaded from.
    pub fn definition_path(&self) -> PathBuf {
        if self.definition.is_absolute() {
            self.definition.clone()
        } else {
            self.config_dir.join(&self.definition)
        }
    }

    /// Topology converted into the rule engine's value model.
    pub fn topology_value(&self) -> Value {
        Value::from_yaml(&self.topology)
    }

    /// Positions declared under `topology.peripheral`, used by the
    /// simulator to generate PRFSTATE reports.
    pub fn peripheral_positions(&self) -> Vec<usize> {
        let mut positions = Vec::new();
        if let Some(list) = self
            .topology
            .get("peripheral")
            .and_then(|v| v.as_sequence())
        {
            for entry in list {
                if let Some(pos) = entry.get("pos").and_then(|v| v.as_u64()) {
                    positions.push(pos as usize);
                }
            }
        }
        positions
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.use_simulator {
            if self.simulator.is_none() {
                return Err(ConfigError::Invalid(
                    "The serial interface is set to be simulated but the simulator \
                     configuration does not exist."
                        .to_string(),
                ));
            }
        } else if self.serial.port.is_none() {
            return Err(ConfigError::Invalid(
                "The property 'serial.port' is required when the simulator is not used."
                    .to_string(),
            ));
        }
        if self.mqtt.protocol == MqttProtocol::V5 {
            return Err(ConfigError::Invalid(
                "The MQTT protocol version 5 is not supported by this build.".to_string(),
            ));
        }
        if self.mqtt.protocol == MqttProtocol::V31 {
            warn!("The MQTT protocol 3.1 is negotiated as 3.1.1 by the client library.");
        }
        self.check_duplicates("section", "code")?;
        self.check_duplicates("peripheral", "pos")?;
        if let Some(sim) = &self.simulator {
            let mut seen = std::collections::HashSet::new();
            for section in &sim.sections {
                if !seen.insert(section.code) {
                    return Err(ConfigError::Invalid(format!(
                        "There are duplicate values in 'simulator.sections.code': {}",
                        section.code
                    )));
                }
            }
        }
        Ok(())
    }

    // topology lists must not repeat their key property
    fn check_duplicates(&self, list: &str, prop: &str) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        if let Some(entries) = self.topology.get(list).and_then(|v| v.as_sequence()) {
            for entry in entries {
                if let Some(value) = entry.get(prop).and_then(|v| v.as_i64()) {
                    if !seen.insert(value) {
                        return Err(ConfigError::Invalid(format!(
                            "There are duplicate values in 'topology.{list}.{prop}': {value}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUDRATE
}
fn default_bytesize() -> u8 {
    8
}
fn default_parity() -> String {
    "N".to_string()
}
fn default_stopbits() -> u8 {
    1
}
fn default_wait_on_ready() -> u64 {
    DEFAULT_WAIT_ON_READY
}
fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}
fn default_keepalive() -> u64 {
    DEFAULT_KEEPALIVE
}
fn default_reconnect_after() -> u64 {
    DEFAULT_RECONNECT_AFTER
}
fn default_loop_timeout() -> u64 {
    DEFAULT_LOOP_TIMEOUT
}
fn default_clean_session() -> bool {
    true
}
fn default_response_delay() -> f64 {
    DEFAULT_RESPONSE_DELAY
}

// accepts both `pin: 1234` and `pin: "1234"`
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(i64),
    }
    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Number(n) => n.to_string(),
    })
}
