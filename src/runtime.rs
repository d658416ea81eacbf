//! Worker orchestration and shutdown
//!
//! Builds the components in dependency order (definition, serial, MQTT,
//! bridge), wires them together, and runs every worker under one
//! process-wide exit signal. SIGTERM, SIGINT, and SIGHUP cancel the
//! signal; every blocking wait in the workers honours it, so joining the
//! tasks afterwards completes within one poll interval.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{eyre, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::Bridge;
use crate::config::AppConfig;
use crate::mqtt::Mqtt;
use crate::rules::Definition;
use crate::serial::{Serial, UartLink};
use crate::simulator::Simulator;

/// The explicit runtime passed around instead of process-global state:
/// currently just the cancellation token every worker observes.
#[derive(Clone, Debug, Default)]
pub struct Runtime {
    exit: CancellationToken,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exit(&self) -> CancellationToken {
        self.exit.clone()
    }

    pub fn shutdown(&self) {
        self.exit.cancel();
    }
}

/// Runs the bridge until the exit signal is set.
pub async fn run(config: AppConfig) -> Result<()> {
    let runtime = Runtime::new();
    let signal_task = install_signal_handlers(&runtime)?;

    let definition_path = config.definition_path();
    let definition = Definition::load(&definition_path).await?;
    info!("The definition file is {}", definition_path.display());

    // construction order: definition, serial, mqtt, bridge; the optional
    // simulator backs the serial link
    let mut simulator_worker: Option<JoinHandle<()>> = None;
    let mut serial = if config.serial.use_simulator {
        let sim_config = config
            .simulator
            .as_ref()
            .ok_or_else(|| eyre!("The simulator configuration does not exist."))?;
        let simulator = Simulator::new(
            sim_config,
            config.peripheral_positions(),
            definition.prfstate_bits,
            config.topology_value(),
        )?;
        let link = simulator.link();
        simulator_worker = Some(simulator.start(runtime.exit()));
        Serial::new(Box::new(link), config.serial.wait_on_ready)
    } else {
        Serial::new(
            Box::new(UartLink::new(config.serial.clone())?),
            config.serial.wait_on_ready,
        )
    };

    let client_name = format!("ja2mqtt-server+{}", definition.topic_prefix);
    let mut mqtt = Mqtt::new(client_name, config.mqtt.clone());
    let bridge = Arc::new(Bridge::new(
        definition,
        config.topology_value(),
        serial.handle(),
        mqtt.handle(),
    ));
    mqtt.set_subscriptions(bridge.subscriptions());

    // start in reverse producer order so consumers are ready first
    let mut workers = vec![
        bridge.start_worker(serial.take_lines(), runtime.exit()),
        bridge.start_mqtt_consumer(mqtt.take_inbound(), runtime.exit()),
        mqtt.start(runtime.exit()),
        serial.start(runtime.exit()),
    ];
    if let Some(worker) = simulator_worker.take() {
        workers.push(worker);
    }

    let connect_timeout = Duration::from_secs(config.mqtt.reconnect_after);
    if !mqtt
        .handle()
        .wait_connected(&runtime.exit(), connect_timeout)
        .await
    {
        warn!(
            "The MQTT broker at {}:{} is not reachable yet, the client keeps trying.",
            config.mqtt.address, config.mqtt.port
        );
    }

    for worker in workers {
        let _ = worker.await;
    }
    let _ = signal_task.await;
    info!("Done.");
    Ok(())
}

/// Registers the process signal handlers. The returned task cancels the
/// exit token on SIGTERM, SIGINT, or SIGHUP.
fn install_signal_handlers(runtime: &Runtime) -> Result<JoinHandle<()>> {
    let exit = runtime.exit();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())
            .map_err(|e| eyre!("Cannot install the SIGTERM handler: {e}"))?;
        let mut int = signal(SignalKind::interrupt())
            .map_err(|e| eyre!("Cannot install the SIGINT handler: {e}"))?;
        let mut hup = signal(SignalKind::hangup())
            .map_err(|e| eyre!("Cannot install the SIGHUP handler: {e}"))?;
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = exit.cancelled() => return,
                _ = term.recv() => {}
                _ = int.recv() => {}
                _ = hup.recv() => {}
            }
            info!("Exit signal received, shutting down.");
            exit.cancel();
        }))
    }
    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = exit.cancelled() => return,
                result = tokio::signal::ctrl_c() => {
                    if result.is_err() {
                        return;
                    }
                }
            }
            info!("Exit signal received, shutting down.");
            exit.cancel();
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_exit_is_shared() {
        let runtime = Runtime::new();
        let token = runtime.exit();
        assert!(!token.is_cancelled());
        runtime.shutdown();
        assert!(token.is_cancelled());
    }
}
