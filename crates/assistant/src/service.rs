use std::future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Sleep, sleep, timeout};

use crate::backoff::{ReconnectDecision, ReconnectPolicy};
use crate::bus::{AssistantEvent, DisconnectReason, EventBus, EventName, SubscriptionId};
use crate::config::AssistantSettings;
use crate::error::{AssistantResult, NotConnectedSnafu, TransportGoneSnafu};
use crate::frame::OutboundFrame;
use crate::router::FrameRouter;
use crate::transport::{
    Connector, OutboundSender, TransportChannel, TransportEvent, TransportHandle,
};
use crate::ws::WsConnector;

/// Observable lifecycle of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Reconnecting {
        attempt: u32,
    },
    /// Closed on request; nothing is scheduled.
    Closed,
    /// Retry budget exhausted; only an explicit `connect()` resumes.
    PermanentlyDisconnected,
}

#[derive(Debug)]
enum DriverCommand {
    Connect,
    /// `done` fires once the torn-down transport worker has exited.
    Disconnect { done: Option<oneshot::Sender<()>> },
}

/// Handle to one assistant connection.
///
/// Cloning is cheap; all clones drive the same connection. When the last clone is
/// dropped the driver task stops and the live transport is closed.
#[derive(Clone)]
pub struct AssistantService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    endpoint: String,
    debug: bool,
    bus: EventBus,
    commands: mpsc::UnboundedSender<DriverCommand>,
    outbound: Arc<ArcSwapOption<OutboundSender>>,
    state: watch::Receiver<ConnectionState>,
}

impl AssistantService {
    /// Spawns the connection driver on the current tokio runtime. Does not connect.
    pub fn spawn(settings: &AssistantSettings, bus: EventBus) -> Self {
        let connector: Arc<dyn Connector> = Arc::new(WsConnector::new(settings.debug));
        Self::spawn_with_connector(settings, bus, connector)
    }

    pub fn spawn_with_connector(
        settings: &AssistantSettings,
        bus: EventBus,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let endpoint = settings.endpoint();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let outbound = Arc::new(ArcSwapOption::empty());

        let driver = ConnectionDriver {
            endpoint: endpoint.clone(),
            connector,
            bus: bus.clone(),
            router: FrameRouter::new(bus.clone(), settings.debug),
            policy: ReconnectPolicy::from_settings(&settings.reconnect),
            commands: command_rx,
            transport: None,
            worker: None,
            retry: None,
            outbound: Arc::clone(&outbound),
            state: state_tx,
        };
        tokio::spawn(driver.run());

        Self {
            inner: Arc::new(ServiceInner {
                endpoint,
                debug: settings.debug,
                bus,
                commands: command_tx,
                outbound,
                state: state_rx,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Opens a fresh transport, replacing any live one, with a full retry budget.
    pub fn connect(&self) {
        if self.inner.commands.send(DriverCommand::Connect).is_err() {
            tracing::warn!(endpoint = %self.inner.endpoint, "connection driver is gone");
        }
    }

    /// Closes the live transport and cancels any pending retry. Safe to repeat.
    pub fn disconnect(&self) {
        // Refuse sends immediately; the driver finishes the teardown in order.
        self.inner.outbound.store(None);
        let _ = self.inner.commands.send(DriverCommand::Disconnect { done: None });
    }

    /// Disconnects and waits, at most `grace`, until the transport worker has
    /// finished its close handshake. Returns false on timeout or a stopped driver.
    pub async fn disconnect_and_wait(&self, grace: Duration) -> bool {
        self.inner.outbound.store(None);
        let (done_tx, done_rx) = oneshot::channel();
        let command = DriverCommand::Disconnect { done: Some(done_tx) };
        if self.inner.commands.send(command).is_err() {
            return false;
        }
        match timeout(grace, done_rx).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!(
                    endpoint = %self.inner.endpoint,
                    "disconnect did not settle in time"
                );
                false
            }
        }
    }

    /// Sends a user message. On failure an `error` event has already been published.
    pub fn send_message(&self, text: &str) -> AssistantResult<()> {
        self.send_frame(OutboundFrame::message(text))?;
        self.inner.bus.publish(&AssistantEvent::MessageAdd {
            text: text.to_string(),
        });
        Ok(())
    }

    /// Sends a named action. On failure an `error` event has already been published.
    pub fn send_action(&self, action_type: &str, payload: Value) -> AssistantResult<()> {
        self.send_frame(OutboundFrame::action(action_type, payload))?;
        if self.inner.debug {
            tracing::debug!(action_type, "action sent");
        }
        Ok(())
    }

    pub fn on<F>(&self, name: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&AssistantEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(name, handler)
    }

    pub fn off(&self, name: EventName, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(name, id)
    }

    fn send_frame(&self, frame: OutboundFrame) -> AssistantResult<()> {
        let result = self.try_send_frame(&frame);
        if let Err(error) = &result {
            tracing::warn!(
                endpoint = %self.inner.endpoint,
                kind = frame.kind(),
                error = ?error,
                "outbound frame not delivered"
            );
            self.inner
                .bus
                .publish(&AssistantEvent::error(error.to_string()));
        }
        result
    }

    fn try_send_frame(&self, frame: &OutboundFrame) -> AssistantResult<()> {
        let Some(sender) = self.inner.outbound.load_full() else {
            return NotConnectedSnafu {
                stage: "send-frame",
            }
            .fail();
        };

        let encoded = frame.encode()?;
        sender.send(encoded).map_err(|_| {
            TransportGoneSnafu {
                stage: "send-frame",
                kind: frame.kind(),
            }
            .build()
        })
    }
}

enum DriverStep {
    Command(Option<DriverCommand>),
    Transport(TransportEvent),
    RetryElapsed,
}

/// Owns the live transport and the single retry timer.
///
/// Runs as one task, so every transport event, timer fire and command is handled
/// to completion before the next one is looked at.
struct ConnectionDriver {
    endpoint: String,
    connector: Arc<dyn Connector>,
    bus: EventBus,
    router: FrameRouter,
    policy: ReconnectPolicy,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    transport: Option<TransportChannel>,
    worker: Option<JoinHandle<()>>,
    retry: Option<Pin<Box<Sleep>>>,
    outbound: Arc<ArcSwapOption<OutboundSender>>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionDriver {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => DriverStep::Command(command),
                event = next_transport_event(&mut self.transport) => DriverStep::Transport(event),
                () = retry_elapsed(&mut self.retry) => DriverStep::RetryElapsed,
            };

            match step {
                DriverStep::Command(Some(DriverCommand::Connect)) => {
                    self.policy.reset();
                    self.open();
                }
                DriverStep::Command(Some(DriverCommand::Disconnect { done })) => {
                    let worker = self.worker.take();
                    self.shutdown();
                    if let Some(done) = done {
                        tokio::spawn(async move {
                            if let Some(worker) = worker {
                                let _ = worker.await;
                            }
                            let _ = done.send(());
                        });
                    }
                }
                DriverStep::Command(None) => {
                    self.retry = None;
                    self.drop_transport();
                    tracing::debug!(endpoint = %self.endpoint, "assistant service dropped");
                    break;
                }
                DriverStep::Transport(event) => self.on_transport_event(event),
                DriverStep::RetryElapsed => {
                    self.retry = None;
                    self.open();
                }
            }
        }
    }

    fn open(&mut self) {
        self.retry = None;
        self.drop_transport();
        self.state.send_replace(ConnectionState::Connecting);

        tracing::info!(
            endpoint = %self.endpoint,
            failures = self.policy.attempts(),
            "connecting to assistant"
        );
        let TransportHandle { channel, worker } = self.connector.open(&self.endpoint);
        self.worker = Some(tokio::spawn(worker));
        self.transport = Some(channel);
    }

    /// Expected closure: no reconnection follows.
    fn shutdown(&mut self) {
        let had_retry = self.retry.take().is_some();
        let had_transport = self.drop_transport();
        if !had_retry && !had_transport {
            return;
        }

        tracing::info!(endpoint = %self.endpoint, "disconnected on request");
        self.state.send_replace(ConnectionState::Closed);
        self.bus.publish(&AssistantEvent::Disconnected {
            reason: DisconnectReason::ClientRequested,
        });
    }

    fn drop_transport(&mut self) -> bool {
        self.outbound.store(None);
        match self.transport.take() {
            Some(mut channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                self.policy.reset();
                if let Some(channel) = &self.transport {
                    self.outbound.store(Some(Arc::new(channel.sender())));
                }
                self.state.send_replace(ConnectionState::Open);
                tracing::info!(endpoint = %self.endpoint, "connected to assistant server");
                self.bus.publish(&AssistantEvent::Connected);
            }
            TransportEvent::Frame(raw) => {
                self.router.dispatch(&raw);
            }
            TransportEvent::Error(description) => {
                tracing::warn!(endpoint = %self.endpoint, error = %description, "transport error");
                self.bus.publish(&AssistantEvent::error(description));
            }
            TransportEvent::Closed { reason } => {
                self.transport = None;
                self.worker = None;
                self.outbound.store(None);
                tracing::info!(endpoint = %self.endpoint, reason = ?reason, "connection closed");
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.policy.next_attempt() {
            ReconnectDecision::Retry { attempt, delay } => {
                tracing::info!(
                    endpoint = %self.endpoint,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "attempting to reconnect"
                );
                // Replacing the slot drops any earlier timer.
                self.retry = Some(Box::pin(sleep(delay)));
                self.state.send_replace(ConnectionState::Reconnecting { attempt });
                self.bus.publish(&AssistantEvent::Reconnecting { attempt, delay });
            }
            ReconnectDecision::Exhausted { attempts } => {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    attempts,
                    "max reconnect attempts reached"
                );
                self.retry = None;
                self.state.send_replace(ConnectionState::PermanentlyDisconnected);
                self.bus.publish(&AssistantEvent::Disconnected {
                    reason: DisconnectReason::RetriesExhausted { attempts },
                });
            }
        }
    }
}

async fn next_transport_event(transport: &mut Option<TransportChannel>) -> TransportEvent {
    match transport {
        // A worker that vanished without reporting is treated as an unexpected close.
        Some(channel) => channel
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed { reason: None }),
        None => future::pending().await,
    }
}

async fn retry_elapsed(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(timer) => timer.as_mut().await,
        None => future::pending().await,
    }
}
