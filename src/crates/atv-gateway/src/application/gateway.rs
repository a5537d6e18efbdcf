//! The gateway task: one event queue, one owner of the session.
//!
//! # Event flow
//!
//! ```text
//! ws session ──ClientAttached/ClientMessage/ClientDetached──┐
//! device listener ──Device{generation, event}───────────────┼──► queue ──► Gateway::handle_event
//! reconnect task ──ReconnectFinished{attempt, result}───────┤
//! stop file / Ctrl+C ──Shutdown─────────────────────────────┘
//! ```
//!
//! Each event is handled to completion, provider awaits included, before the
//! next one is taken.  A shutdown request also wakes the task directly, so a
//! provider call that never settles is abandoned instead of blocking exit.  Replies to a command go to the client that sent it;
//! unsolicited events go to the active client.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atv_core::{DeviceConnection, DeviceEvent, DeviceProvider, KeyTable, KeyTableError, ProviderResult};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use super::clients::{ClientId, ClientOutbox, ClientRegistry};
use super::dispatcher::Dispatcher;
use super::session::{LinkFactory, Session};
use super::supervisor::{self, LossDecision, ReconnectionSupervisor};
use crate::domain::{ClientCommand, GatewayConfig, InboundEnvelope, ServerMessage};

// ── Events ────────────────────────────────────────────────────────────────────

/// Everything the gateway task reacts to.
pub enum GatewayEvent {
    /// A WebSocket connection opened; it becomes the active client.
    ClientAttached {
        client: ClientId,
        outbox: ClientOutbox,
    },
    /// A text frame arrived from a client.
    ClientMessage { client: ClientId, text: String },
    /// A WebSocket connection closed.
    ClientDetached { client: ClientId },
    /// A lifecycle callback from the link stamped `generation`.
    Device { generation: u64, event: DeviceEvent },
    /// A reconnection cycle finished.
    ReconnectFinished {
        attempt: u64,
        result: ProviderResult<Box<dyn DeviceConnection>>,
    },
    /// Stop the gateway.
    Shutdown,
}

impl fmt::Debug for GatewayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientAttached { client, .. } => write!(f, "ClientAttached({client})"),
            Self::ClientMessage { client, .. } => write!(f, "ClientMessage({client})"),
            Self::ClientDetached { client } => write!(f, "ClientDetached({client})"),
            Self::Device { generation, event } => {
                write!(f, "Device(#{generation}, {})", event.kind())
            }
            Self::ReconnectFinished { attempt, result } => {
                write!(f, "ReconnectFinished(#{attempt}, ok={})", result.is_ok())
            }
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Cloneable sender used by the infrastructure layer.
#[derive(Clone)]
pub struct GatewayHandle {
    events: mpsc::UnboundedSender<GatewayEvent>,
    stop: Arc<Notify>,
}

impl GatewayHandle {
    /// Each method returns `false` once the gateway has stopped.
    pub fn attach(&self, client: ClientId, outbox: ClientOutbox) -> bool {
        self.post(GatewayEvent::ClientAttached { client, outbox })
    }

    pub fn message(&self, client: ClientId, text: String) -> bool {
        self.post(GatewayEvent::ClientMessage { client, text })
    }

    pub fn detach(&self, client: ClientId) -> bool {
        self.post(GatewayEvent::ClientDetached { client })
    }

    /// Queues `Shutdown` and interrupts whatever event is being handled.
    pub fn shutdown(&self) -> bool {
        self.stop.notify_one();
        self.post(GatewayEvent::Shutdown)
    }

    fn post(&self, event: GatewayEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

// ── Gateway ───────────────────────────────────────────────────────────────────

/// Owner of the session and everything that mutates it.
pub struct Gateway {
    provider: Arc<dyn DeviceProvider>,
    config: GatewayConfig,
    keys: KeyTable,
    session: Session,
    supervisor: ReconnectionSupervisor,
    clients: ClientRegistry,
    links: LinkFactory,
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl Gateway {
    /// Creates the gateway and returns it together with its event receiver.
    ///
    /// # Errors
    ///
    /// Returns [`KeyTableError`] if the built-in key table fails validation.
    pub fn new(
        provider: Arc<dyn DeviceProvider>,
        config: GatewayConfig,
        running: Arc<AtomicBool>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GatewayEvent>), KeyTableError> {
        let keys = KeyTable::new()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = Self {
            provider,
            config,
            keys,
            session: Session::new(),
            supervisor: ReconnectionSupervisor::new(),
            clients: ClientRegistry::new(),
            links: LinkFactory::new(tx),
            running,
            stop: Arc::new(Notify::new()),
        };
        Ok((gateway, rx))
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            events: self.links.events(),
            stop: Arc::clone(&self.stop),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn supervisor(&self) -> &ReconnectionSupervisor {
        &self.supervisor
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Drains `events` until `quit`, a shutdown request, or the queue
    /// closes, then closes the device connection.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<GatewayEvent>) {
        info!("gateway task started");
        let stop = Arc::clone(&self.stop);
        while let Some(event) = events.recv().await {
            let flow = tokio::select! {
                biased;
                flow = self.handle_event(event) => flow,
                () = stop.notified() => {
                    warn!("shutdown requested; abandoning the event in progress");
                    ControlFlow::Break(())
                }
            };
            if flow.is_break() {
                break;
            }
        }
        self.shutdown().await;
        info!("gateway task stopped");
    }

    /// Handles one event.  `Break` means the gateway should stop.
    pub async fn handle_event(&mut self, event: GatewayEvent) -> ControlFlow<()> {
        match event {
            GatewayEvent::ClientAttached { client, outbox } => {
                self.clients.register(client, outbox);
                debug!("client {client} attached ({} connected)", self.clients.len());
                self.session.set_active_client(client);
            }
            GatewayEvent::ClientMessage { client, text } => {
                return self.handle_client_message(client, &text).await;
            }
            GatewayEvent::ClientDetached { client } => {
                if self.clients.remove(client) {
                    debug!("client {client} detached ({} connected)", self.clients.len());
                }
                if self.session.release_client(client) {
                    debug!("active client {client} detached");
                }
            }
            GatewayEvent::Device { generation, event } => {
                self.handle_device_event(generation, event).await;
            }
            GatewayEvent::ReconnectFinished { attempt, result } => {
                self.handle_reconnect_finished(attempt, result).await;
            }
            GatewayEvent::Shutdown => {
                info!("shutdown requested");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // ── Client messages ───────────────────────────────────────────────────────

    async fn handle_client_message(&mut self, client: ClientId, text: &str) -> ControlFlow<()> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!("client {client}: invalid JSON: {e}");
                return ControlFlow::Continue(());
            }
        };
        self.session.set_active_client(client);

        let Some(envelope) = InboundEnvelope::from_value(value) else {
            debug!("client {client}: message without a string `cmd` ignored");
            return ControlFlow::Continue(());
        };
        let command = match ClientCommand::parse(&envelope) {
            Ok(Some(command)) => command,
            Ok(None) => {
                debug!("client {client}: unknown command {:?} ignored", envelope.cmd);
                return ControlFlow::Continue(());
            }
            Err(e) => {
                warn!("client {client}: {e}");
                return ControlFlow::Continue(());
            }
        };
        debug!("client {client}: {}", command.name());

        let mut replies = Vec::new();
        let flow = Dispatcher {
            provider: self.provider.as_ref(),
            keys: &self.keys,
            config: &self.config,
            session: &mut self.session,
            links: &self.links,
            reconnecting: self.supervisor.is_in_flight(),
        }
        .dispatch(command, &mut replies)
        .await;

        for reply in replies {
            self.clients.send(client, reply);
        }
        if flow.is_break() {
            self.running.store(false, Ordering::Relaxed);
        }
        flow
    }

    // ── Device events ─────────────────────────────────────────────────────────

    async fn handle_device_event(&mut self, generation: u64, event: DeviceEvent) {
        if !self.session.is_current(generation) {
            debug!("ignoring {} from stale link #{generation}", event.kind());
            return;
        }
        match event {
            DeviceEvent::ConnectionLost { reason } => {
                warn!("connection lost: {reason}");
                self.handle_connection_lost(generation).await;
            }
            DeviceEvent::ConnectionClosed => {
                info!("connection closed by device");
                // Already closed; dropping the link detaches it.
                drop(self.session.take_link_if(generation));
                self.notify(ServerMessage::ConnectionClosed);
            }
            DeviceEvent::PowerStateChanged { old, new } => {
                info!("power state changed from {old} to {new}");
                self.notify(ServerMessage::PowerStateChanged { old, new });
            }
            DeviceEvent::FocusStateChanged { old, new } => {
                info!("focus state changed from {old} to {new}");
                self.notify(ServerMessage::KeyboardChangeState { old, new });
            }
        }
    }

    async fn handle_connection_lost(&mut self, generation: u64) {
        match self
            .supervisor
            .on_connection_lost(&mut self.session, generation)
        {
            LossDecision::Stale => {}
            LossDecision::NoTarget { stale } => {
                debug!("no target to reconnect to");
                close_quietly(stale.close().await);
            }
            LossDecision::SkipPairing { stale } => {
                info!("skipping reconnection: pairing in progress");
                self.notify(ServerMessage::ConnectionLost);
                close_quietly(stale.close().await);
            }
            LossDecision::Reconnect {
                attempt,
                target,
                stale,
            } => {
                self.notify(ServerMessage::ConnectionLost);
                supervisor::spawn_attempt(
                    attempt,
                    target,
                    stale,
                    Arc::clone(&self.provider),
                    self.config.reconnect_timeout,
                    self.links.events(),
                );
            }
        }
    }

    async fn handle_reconnect_finished(
        &mut self,
        attempt: u64,
        result: ProviderResult<Box<dyn DeviceConnection>>,
    ) {
        if !self.supervisor.on_finished(attempt) {
            debug!("ignoring result of superseded reconnect #{attempt}");
            if let Ok(connection) = result {
                close_quietly(connection.close().await);
            }
            return;
        }
        match result {
            Ok(connection) => {
                if self.session.active_target().is_none() || self.session.is_connected() {
                    info!("reconnect #{attempt} succeeded but the session moved on; closing");
                    close_quietly(connection.close().await);
                    return;
                }
                let link = self.links.attach(connection);
                self.session.restore_link(link);
                info!("reconnect #{attempt} succeeded");
                self.notify(ServerMessage::Reconnected);
            }
            Err(e) => {
                warn!("reconnect #{attempt} failed: {e}");
                if self.session.active_target().is_some() && !self.session.is_connected() {
                    self.notify(ServerMessage::ReconnectionFailed);
                }
            }
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    /// Sends an unsolicited event to the active client, if any.
    fn notify(&self, message: ServerMessage) {
        match self.session.active_client() {
            Some(client) => {
                self.clients.send(client, message);
            }
            None => debug!("no active client for {}", message.command()),
        }
    }

    async fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(link) = self.session.take_link() {
            info!("closing device connection");
            close_quietly(link.close().await);
        }
        if let Some(pairing) = self.session.take_pairing() {
            pairing.close().await;
        }
    }
}

fn close_quietly(result: ProviderResult<()>) {
    if let Err(e) = result {
        debug!("close failed: {e}");
    }
}
