//! # MQTT Client Component
//!
//! Implements the broker side of the bridge using a state machine for the
//! connection lifecycle and channel-based message routing towards the
//! bridge core.
//!
//! ## Lifecycle
//!
//! ```text
//! Initializing → Configured → Processing
//!      ↓             ↓            ↓
//!  Build options  Queue subs   Network loop
//!  Create client               Publish drain
//! ```
//!
//! The machine position is separate from actual network connectivity,
//! which is tracked in [`ConnectionState`]: the processing loop marks the
//! connection `Connected` on CONNACK and `Disconnected` on any network
//! error, waits `reconnect_after` seconds, and keeps polling; the client
//! library re-establishes the session on the next poll.
//!
//! ## Message flow
//!
//! - **Outbound**: the bridge queues [`MqttPublish`] values through
//!   [`MqttHandle::publish`]; the processing loop drains the queue and
//!   publishes with QoS 1. The bridge checks [`MqttHandle::is_connected`]
//!   first, so publishes while disconnected are dropped at the source.
//! - **Inbound**: every PUBLISH packet received from the broker is
//!   forwarded into an unbounded channel consumed by the bridge.
//!
//! Subscriptions are issued once at activation and again on every CONNACK
//! since a clean session drops them on reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use statum::{machine, state, transition};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MqttConfig, MqttTransport};

/// Poll interval for connectivity waits.
const CONNECT_POLL: Duration = Duration::from_millis(200);

/// Capacity of the internal rumqttc request channel.
const CLIENT_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("The MQTT worker is not running.")]
    WorkerGone,
}

/// One message on its way to or from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttPublish {
    pub topic: String,
    pub payload: String,
}

/// Network connectivity of the client, tracked separately from the state
/// machine position.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// Operational counters for logging and diagnostics.
#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub messages_received: usize,
    pub messages_sent: usize,
}

/// Cloneable handle the bridge uses to reach the MQTT worker.
#[derive(Clone, Debug)]
pub struct MqttHandle {
    publish_tx: mpsc::UnboundedSender<MqttPublish>,
    connected: Arc<AtomicBool>,
}

impl MqttHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queues a publish for the worker loop.
    pub fn publish(&self, topic: &str, payload: String) -> Result<(), MqttError> {
        self.publish_tx
            .send(MqttPublish {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|_| MqttError::WorkerGone)
    }

    /// Waits until the client is connected, the timeout elapses, or the
    /// exit signal is set. A zero timeout means no limit.
    pub async fn wait_connected(&self, exit: &CancellationToken, timeout: Duration) -> bool {
        let deadline = (!timeout.is_zero()).then(|| std::time::Instant::now() + timeout);
        while !exit.is_cancelled() && !self.is_connected() {
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    break;
                }
            }
            tokio::time::sleep(CONNECT_POLL).await;
        }
        self.is_connected()
    }
}

/// State definitions for the MQTT connection lifecycle.
#[state]
#[derive(Debug, Clone, Copy)]
pub enum MqttLifecycle {
    Initializing,
    Configured,
    Processing,
}

/// State machine for the MQTT connection.
///
/// The client and event loop are created at the Initializing→Configured
/// transition so that a configuration problem surfaces before the worker
/// starts processing.
#[machine]
pub struct MqttConnection<MqttLifecycle> {
    /// Connection status and counters
    status: MqttStatus,

    /// Broker options from the configuration file
    config: MqttConfig,

    /// Client identifier announced to the broker
    client_name: String,

    /// Topics subscribed at activation and on every CONNACK
    subscriptions: Vec<String>,

    /// rumqttc async client, created in `configure`
    client: Option<AsyncClient>,

    /// rumqttc event loop, created in `configure`
    event_loop: Option<EventLoop>,

    /// Connectivity flag shared with [`MqttHandle`]
    connected: Arc<AtomicBool>,

    /// Outbound queue drained by the processing loop
    publish_rx: mpsc::UnboundedReceiver<MqttPublish>,

    /// Inbound messages forwarded to the bridge
    inbound_tx: mpsc::UnboundedSender<MqttPublish>,
}

impl MqttConnection<Initializing> {
    #[allow(clippy::too_many_arguments)]
    fn create(
        config: MqttConfig,
        client_name: String,
        subscriptions: Vec<String>,
        connected: Arc<AtomicBool>,
        publish_rx: mpsc::UnboundedReceiver<MqttPublish>,
        inbound_tx: mpsc::UnboundedSender<MqttPublish>,
    ) -> Self {
        Self::builder()
            .status(MqttStatus::default())
            .config(config)
            .client_name(client_name)
            .subscriptions(subscriptions)
            .connected(connected)
            .publish_rx(publish_rx)
            .inbound_tx(inbound_tx)
            .build()
    }
}

#[transition]
impl MqttConnection<Initializing> {
    /// Builds the client from the configuration and transitions to
    /// Configured.
    fn configure(mut self) -> MqttConnection<Configured> {
        let mut options = MqttOptions::new(
            self.client_name.clone(),
            self.config.address.clone(),
            self.config.port,
        );
        options
            .set_keep_alive(Duration::from_secs(self.config.keepalive))
            .set_clean_session(self.config.clean_session);
        if self.config.transport == MqttTransport::Websocket {
            options.set_transport(Transport::Ws);
        }
        if let Some(username) = &self.config.username {
            debug!("Using '{}/*******' to authenticate with the MQTT broker.", username);
            if self.config.password.is_none() {
                warn!("The password was not specified!");
            }
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }
        let (client, event_loop) = AsyncClient::new(options, CLIENT_QUEUE_CAPACITY);
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        self.status.connection_state = ConnectionState::Connecting;
        info!(
            "The MQTT client configured for {}:{}.",
            self.config.address, self.config.port
        );
        self.transition()
    }
}

#[transition]
impl MqttConnection<Configured> {
    /// Queues the initial subscriptions and transitions to Processing.
    /// The SUBSCRIBE packets go out once the CONNECT handshake completes.
    async fn activate(self) -> MqttConnection<Processing> {
        if let Some(client) = &self.client {
            for topic in &self.subscriptions {
                info!("Subscribing to {}", topic);
                if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                    error!("Failed to subscribe to topic {}: {}", topic, e);
                }
            }
        }
        self.transition()
    }
}

impl MqttConnection<Processing> {
    /// Main network loop: drains outbound publishes, polls the event
    /// loop, and handles reconnects until the exit signal is set.
    async fn run(mut self, exit: CancellationToken) {
        let client = self.client.take().expect("client created in configure");
        let mut event_loop = self.event_loop.take().expect("event loop created in configure");
        let loop_timeout = Duration::from_secs(self.config.loop_timeout.max(1));
        let reconnect_after = Duration::from_secs(self.config.reconnect_after);

        loop {
            tokio::select! {
                _ = exit.cancelled() => break,

                publish = self.publish_rx.recv() => {
                    let Some(publish) = publish else { break };
                    info!("<-- send: {}, data={}", publish.topic, publish.payload);
                    match client
                        .publish(&publish.topic, QoS::AtLeastOnce, false, publish.payload)
                        .await
                    {
                        Ok(()) => self.status.messages_sent += 1,
                        Err(e) => warn!("Failed to publish to topic {}: {}", publish.topic, e),
                    }
                }

                polled = tokio::time::timeout(loop_timeout, event_loop.poll()) => {
                    match polled {
                        // no event within the loop timeout; check exit and go on
                        Err(_) => continue,
                        Ok(Ok(event)) => self.handle_event(&client, event).await,
                        Ok(Err(e)) => {
                            self.connected.store(false, Ordering::SeqCst);
                            self.status.connection_state = ConnectionState::Disconnected;
                            error!(
                                "Error occurred in the MQTT loop. {}. Will attempt to reconnect \
                                 after {} seconds.",
                                e,
                                reconnect_after.as_secs()
                            );
                            tokio::select! {
                                _ = exit.cancelled() => break,
                                _ = tokio::time::sleep(reconnect_after) => {}
                            }
                        }
                    }
                }
            }
        }

        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = client.disconnect().await;
            info!("Disconnected from the MQTT broker.");
        }
        info!(
            "MQTT worker ended, {} messages received, {} messages sent.",
            self.status.messages_received, self.status.messages_sent
        );
    }

    async fn handle_event(&mut self, client: &AsyncClient, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    error!("The MQTT broker rejected the connection: {:?}", ack.code);
                    return;
                }
                self.connected.store(true, Ordering::SeqCst);
                self.status.connection_state = ConnectionState::Connected;
                info!(
                    "Connected to the MQTT broker at {}:{}",
                    self.config.address, self.config.port
                );
                // a clean session drops subscriptions on reconnect
                for topic in &self.subscriptions {
                    if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                        error!("Failed to subscribe to topic {}: {}", topic, e);
                    }
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let topic = publish.topic.clone();
                match std::str::from_utf8(&publish.payload) {
                    Ok(payload) => {
                        info!("--> recv: {}, payload={}", topic, payload);
                        self.status.messages_received += 1;
                        let _ = self.inbound_tx.send(MqttPublish {
                            topic,
                            payload: payload.to_string(),
                        });
                    }
                    Err(e) => error!("Invalid UTF-8 payload on topic {}: {}", topic, e),
                }
            }
            // acks, pings and outgoing confirmations are normal traffic
            _ => {}
        }
    }
}

/// The MQTT component: owns the channel wiring and spawns the state
/// machine as a worker task.
pub struct Mqtt {
    config: MqttConfig,
    client_name: String,
    subscriptions: Vec<String>,
    handle: MqttHandle,
    publish_rx: Option<mpsc::UnboundedReceiver<MqttPublish>>,
    inbound_tx: mpsc::UnboundedSender<MqttPublish>,
    inbound_rx: Option<mpsc::UnboundedReceiver<MqttPublish>>,
}

impl Mqtt {
    pub fn new(client_name: String, config: MqttConfig) -> Self {
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let client_name = config.client_id.clone().unwrap_or(client_name);
        Self {
            config,
            client_name,
            subscriptions: Vec::new(),
            handle: MqttHandle {
                publish_tx,
                connected: Arc::new(AtomicBool::new(false)),
            },
            publish_rx: Some(publish_rx),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
        }
    }

    /// Topics to subscribe to: the non-disabled `mqtt2serial` topics.
    pub fn set_subscriptions(&mut self, topics: Vec<String>) {
        self.subscriptions = topics;
    }

    pub fn handle(&self) -> MqttHandle {
        self.handle.clone()
    }

    /// Messages received from the broker, consumed by the bridge.
    pub fn take_inbound(&mut self) -> mpsc::UnboundedReceiver<MqttPublish> {
        self.inbound_rx.take().expect("inbound receiver already taken")
    }

    /// Spawns the connection state machine as the MQTT worker.
    pub fn start(&mut self, exit: CancellationToken) -> JoinHandle<()> {
        let publish_rx = self.publish_rx.take().expect("mqtt worker already started");
        let connection = MqttConnection::create(
            self.config.clone(),
            self.client_name.clone(),
            self.subscriptions.clone(),
            self.handle.connected.clone(),
            publish_rx,
            self.inbound_tx.clone(),
        );
        tokio::spawn(async move {
            let connection = connection.configure();
            let connection = connection.activate().await;
            connection.run(exit).await;
        })
    }
}

#[cfg(test)]
impl MqttHandle {
    /// Detached handle with a tap on the publish queue, for bridge tests.
    pub(crate) fn test_handle(connected: bool) -> (MqttHandle, mpsc::UnboundedReceiver<MqttPublish>) {
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        (
            MqttHandle {
                publish_tx,
                connected: Arc::new(AtomicBool::new(connected)),
            },
            publish_rx,
        )
    }
}
