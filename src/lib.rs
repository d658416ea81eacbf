//! ja2mqtt: a bidirectional bridge between the line-oriented ASCII
//! protocol of a Jablotron JA-121T alarm panel interface and an MQTT
//! broker. Home-automation software observes alarm state (sections,
//! peripherals) and issues arm/disarm commands without learning the
//! serial protocol; the translation in both directions is driven by a
//! YAML rule definition file.

pub mod bridge;
pub mod config;
pub mod mqtt;
pub mod prfstate;
pub mod rules;
pub mod runtime;
pub mod serial;
pub mod simulator;
