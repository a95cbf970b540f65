//! Connection supervisor: keeps the broker connection alive until shutdown.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use rumqttc::{ConnectionError, Event, EventLoop, Incoming, Request};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use hkz2m_common::{LoggingConfig, init_tracing, mqtt_options};

use crate::BridgeArgs;
use crate::bus::{Bus, BusEvent, BusMessage, MqttBus};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

/// Connection state of the supervised bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopping,
    Terminated,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Stopping => write!(f, "stopping"),
            ConnectionState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Delay schedule for reconnect attempts.
///
/// The first attempt after a loss waits `initial`; every further attempt
/// waits `interval`. Retries never stop on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            interval: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based) of the current outage.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            self.initial
        } else {
            self.interval.max(self.initial)
        }
    }
}

/// Where the supervisor gets broker events from.
///
/// Implemented by rumqttc's [`EventLoop`]; tests script their own.
pub trait EventSource: Send {
    /// Next event, connecting first when there is no connection.
    fn poll(&mut self) -> impl Future<Output = std::result::Result<Event, ConnectionError>> + Send;

    /// Requests kept across a disconnect and written after the next connect.
    fn pending_mut(&mut self) -> &mut VecDeque<Request>;
}

impl EventSource for EventLoop {
    fn poll(&mut self) -> impl Future<Output = std::result::Result<Event, ConnectionError>> + Send {
        EventLoop::poll(self)
    }

    fn pending_mut(&mut self) -> &mut VecDeque<Request> {
        &mut self.pending
    }
}

/// Drives the rumqttc event loop: connects, reconnects per
/// [`ReconnectPolicy`], subscribes the bridge topics after every ConnAck
/// and hands connection changes and messages to the dispatch loop.
///
/// ```ignore
/// let runner = BridgeRunner::new_with_args("hkz2m", config, Some(&args))?;
///
/// let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
/// let dispatch = tokio::spawn(my_dispatch(runner.bus(), events_rx));
///
/// runner.run(topics, events_tx).await?;
/// dispatch.await?;
/// ```
pub struct BridgeRunner<C: BridgeConfig, S: EventSource = EventLoop> {
    name: String,
    version: String,
    config: C,
    /// Shared with the dispatch loop.
    bus: MqttBus,
    source: S,
    reconnect: ReconnectPolicy,
    state: ConnectionState,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Install the tracing subscriber and build the MQTT client. Nothing
    /// connects before [`run`](Self::run).
    pub fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None)
    }

    /// As [`new`](Self::new), with `--log-level` taking precedence over
    /// the configured level.
    pub fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = match args.and_then(|args| args.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                format: config.logging().format,
            },
            None => config.logging().clone(),
        };

        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        tracing::info!(bridge = %name, version = %version, "Initializing");

        Self::without_tracing(name, version, config)
    }

    /// Create a runner without installing a tracing subscriber.
    pub fn without_tracing(
        name: impl Into<String>,
        version: impl Into<String>,
        config: C,
    ) -> Result<Self> {
        let options = mqtt_options(config.mqtt())?;
        let (bus, event_loop) = MqttBus::new(options);
        Ok(Self::from_parts(name, version, config, bus, event_loop))
    }
}

impl<C: BridgeConfig, S: EventSource> BridgeRunner<C, S> {
    /// Assemble a runner around an existing bus and the source of its
    /// events. The reconnect schedule comes from the MQTT config.
    pub fn from_parts(
        name: impl Into<String>,
        version: impl Into<String>,
        config: C,
        bus: MqttBus,
        source: S,
    ) -> Self {
        let reconnect = ReconnectPolicy {
            initial: config.mqtt().reconnect_initial(),
            interval: config.mqtt().reconnect_interval(),
        };

        Self {
            name: name.into(),
            version: version.into(),
            config,
            bus,
            source,
            reconnect,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    /// Handle to the bus this runner drives.
    pub fn bus(&self) -> MqttBus {
        self.bus.clone()
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.reconnect
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "Connection state");
            self.state = state;
        }
    }

    /// Run until Ctrl+C or SIGTERM.
    ///
    /// `topics` are subscribed after every successful connect; a rejected
    /// subscription ends the run with an error. Messages and connection
    /// changes go to `events`, which is dropped on return so the dispatch
    /// loop sees the end of the stream.
    pub async fn run(
        self,
        topics: Vec<String>,
        events: mpsc::UnboundedSender<BusEvent>,
    ) -> Result<()> {
        self.run_until(topics, events, shutdown_signal()).await
    }

    /// Run until `shutdown` completes.
    pub async fn run_until<F>(
        mut self,
        topics: Vec<String>,
        events: mpsc::UnboundedSender<BusEvent>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let server = self.config.mqtt().server();
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<BridgeError>(1);
        let mut subscriber: Option<JoinHandle<()>> = None;
        let mut retry: Option<Duration> = None;
        let mut attempt = 0u32;

        tokio::pin!(shutdown);

        tracing::info!(
            bridge = %self.name,
            server = %server,
            topics = topics.len(),
            "Supervising broker connection"
        );

        let outcome = loop {
            if let Some(delay) = retry.take() {
                tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
                tokio::select! {
                    _ = &mut shutdown => break Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if self.state != ConnectionState::Connected {
                self.set_state(ConnectionState::Connecting);
            }

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(bridge = %self.name, "Shutting down");
                    break Ok(());
                }
                Some(err) = fatal_rx.recv() => {
                    tracing::error!(error = %err, "Subscribing bridge topics failed");
                    break Err(err);
                }
                polled = self.source.poll() => match polled {
                    Ok(event) => {
                        self.bus.track(&event);
                        match event {
                            Event::Incoming(Incoming::ConnAck(_)) => {
                                tracing::info!(server = %server, "Connected");
                                self.set_state(ConnectionState::Connected);
                                attempt = 0;
                                if let Some(previous) = subscriber.take() {
                                    previous.abort();
                                }
                                subscriber = Some(tokio::spawn(subscribe_all(
                                    self.bus.clone(),
                                    topics.clone(),
                                    fatal_tx.clone(),
                                )));
                                if events.send(BusEvent::Connected).is_err() {
                                    break Err(BridgeError::worker("dispatch loop stopped"));
                                }
                            }
                            Event::Incoming(Incoming::Publish(publish)) => {
                                tracing::trace!(topic = %publish.topic, bytes = publish.payload.len(), "Message");
                                let message = BusMessage::new(publish.topic, publish.payload.to_vec());
                                if events.send(BusEvent::Message(message)).is_err() {
                                    break Err(BridgeError::worker("dispatch loop stopped"));
                                }
                            }
                            _ => {}
                        }
                    }
                    Err(e) => {
                        if let Some(previous) = subscriber.take() {
                            previous.abort();
                        }
                        self.bus.connection_lost();
                        // The next connect subscribes these again.
                        self.bus.discard_replayed(self.source.pending_mut(), &topics);

                        if self.state == ConnectionState::Connected {
                            tracing::warn!(server = %server, error = %e, "Connection lost");
                            let _ = events.send(BusEvent::Disconnected { reason: e.to_string() });
                        } else {
                            tracing::warn!(server = %server, error = %e, attempt, "Connect failed");
                        }

                        self.set_state(ConnectionState::Disconnected);
                        retry = Some(self.reconnect.delay(attempt));
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
        };

        self.set_state(ConnectionState::Stopping);
        if let Some(subscriber) = subscriber.take() {
            subscriber.abort();
        }
        self.bus.close();
        drop(events);
        self.set_state(ConnectionState::Terminated);

        tracing::info!(bridge = %self.name, "Connection supervisor stopped");
        outcome
    }
}

/// Subscribe every bridge topic, in order, waiting for each acknowledgement.
///
/// A dropped connection is not fatal: the next connect starts over.
async fn subscribe_all<B: Bus>(
    bus: B,
    topics: Vec<String>,
    fatal: mpsc::Sender<BridgeError>,
) {
    for topic in &topics {
        match bus.subscribe(topic).await {
            Ok(()) => tracing::debug!(topic = %topic, "Subscribed"),
            Err(e) if e.is_connection_lost() => {
                tracing::debug!(topic = %topic, "Connection lost while subscribing");
                return;
            }
            Err(e) => {
                let _ = fatal.send(e).await;
                return;
            }
        }
    }
    tracing::info!(count = topics.len(), "Subscribed bridge topics");
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    #[test]
    fn test_reconnect_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(100), Duration::from_secs(5));
    }

    #[test]
    fn test_reconnect_interval_never_below_initial() {
        let policy = ReconnectPolicy {
            initial: Duration::from_secs(3),
            interval: Duration::from_secs(1),
        };
        assert_eq!(policy.delay(4), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_subscribe_all_in_order() {
        let bus = MemoryBus::new();
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let topics = vec!["z2m/bridge/state".to_string(), "z2m/bridge/devices".to_string()];

        subscribe_all(bus.clone(), topics.clone(), fatal_tx).await;

        assert_eq!(bus.subscriptions(), topics);
        assert!(fatal_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_all_failure_is_fatal() {
        let bus = MemoryBus::new();
        bus.set_fail_subscribe(true);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);

        subscribe_all(
            bus.clone(),
            vec!["z2m/bridge/state".to_string(), "z2m/bridge/info".to_string()],
            fatal_tx,
        )
        .await;

        assert!(matches!(fatal_rx.recv().await, Some(BridgeError::Bus { .. })));
        // Stops at the first failure
        assert_eq!(bus.subscriptions().len(), 1);
    }
}
