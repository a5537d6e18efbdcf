//! The provider seam: everything the gateway needs from a device stack.
//!
//! The gateway never speaks AirPlay or Companion itself.  It orchestrates an
//! implementation of [`DeviceProvider`], which performs discovery, runs the
//! per-protocol pairing handshakes, and opens connections.  A live
//! connection ([`DeviceConnection`]) exposes the remote-control and keyboard
//! capabilities and reports lifecycle changes as [`DeviceEvent`]s.
//!
//! # Callback registration
//!
//! Listeners are attached with [`DeviceConnection::subscribe`], which returns
//! a [`Subscription`].  Dropping or detaching the subscription stops
//! delivery, so the gateway can cut a connection loose before closing it and
//! never hear its farewell `ConnectionClosed`.
//!
//! ```text
//! connection.subscribe(listener) ──► Subscription
//!        │                               │
//!        └─ ListenerSet::emit(event) ────┴─► listener(event)   (while active)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use crate::device::{DeviceTarget, Protocol};
use crate::remote::{Keyboard, KeyboardFocusState, PowerState, RemoteControl};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures reported by a provider.
///
/// The gateway converts every one of these into a named event at the call
/// site; none of them is allowed to escape into the socket-serving loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Discovery found nothing for the requested identifier.
    #[error("no device found with identifier {0}")]
    NotFound(String),

    /// The transport could not be opened (unreachable, bad credentials, ...).
    #[error("connection failed: {0}")]
    Connection(String),

    /// A pairing handshake step failed.
    #[error("pairing failed: {0}")]
    Pairing(String),

    /// A remote-control or keyboard action failed on a live connection.
    #[error("command failed: {0}")]
    Command(String),

    /// The connection has already been closed.
    #[error("connection is closed")]
    Closed,

    /// The operation did not complete in time.
    #[error("operation timed out")]
    Timeout,
}

/// Convenience alias used throughout the provider traits.
pub type ProviderResult<T> = Result<T, ProviderError>;

// ── Lifecycle events ──────────────────────────────────────────────────────────

/// An unsolicited change reported by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The connection dropped without being asked to.
    ConnectionLost { reason: String },
    /// The connection was closed cleanly.
    ConnectionClosed,
    /// The device changed power state.
    PowerStateChanged { old: PowerState, new: PowerState },
    /// The on-screen keyboard gained or lost focus.
    FocusStateChanged {
        old: KeyboardFocusState,
        new: KeyboardFocusState,
    },
}

impl DeviceEvent {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceEvent::ConnectionLost { .. } => "connection_lost",
            DeviceEvent::ConnectionClosed => "connection_closed",
            DeviceEvent::PowerStateChanged { .. } => "power_state_changed",
            DeviceEvent::FocusStateChanged { .. } => "focus_state_changed",
        }
    }
}

/// A callback receiving [`DeviceEvent`]s.
///
/// Providers may invoke it from any thread, so it must not block; the gateway
/// implementation only posts the event onto its queue.
pub type DeviceListener = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

// ── Subscription ──────────────────────────────────────────────────────────────

/// Handle for one registered listener.
///
/// Delivery stops as soon as the subscription is detached or dropped.
#[derive(Debug)]
pub struct Subscription {
    active: Arc<AtomicBool>,
}

impl Subscription {
    fn new(active: Arc<AtomicBool>) -> Self {
        Self { active }
    }

    /// A subscription that was never attached to anything.
    pub fn detached() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)))
    }

    /// Stops delivery to the listener.  Idempotent.
    pub fn detach(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// A set of listeners that providers use to fan out [`DeviceEvent`]s.
///
/// Cloning shares the same underlying set.
#[derive(Clone, Default)]
pub struct ListenerSet {
    inner: Arc<Mutex<Vec<(Arc<AtomicBool>, DeviceListener)>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` and returns the handle controlling its delivery.
    pub fn subscribe(&self, listener: DeviceListener) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((Arc::clone(&active), listener));
        Subscription::new(active)
    }

    /// Delivers `event` to every active listener and returns how many
    /// received it.  Detached listeners are pruned.
    ///
    /// Listeners are invoked outside the internal lock, so a listener may
    /// subscribe or emit again without deadlocking.
    pub fn emit(&self, event: DeviceEvent) -> usize {
        let targets: Vec<DeviceListener> = {
            let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            guard.retain(|(active, _)| active.load(Ordering::Acquire));
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in &targets {
            listener(event.clone());
        }
        targets.len()
    }

    /// Number of listeners still attached.
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(active, _)| active.load(Ordering::Acquire))
            .count()
    }
}

// ── Provider traits ───────────────────────────────────────────────────────────

/// One in-progress pairing attempt for one protocol.
///
/// The call order is `begin` → `pin` → `finish`, after which `has_paired`
/// and `credentials` report the result.  A rejected PIN is not an error:
/// `finish` succeeds and `has_paired` returns `false`.
#[async_trait]
pub trait PairingHandshake: Send + Sync {
    /// The protocol this handshake pairs.
    fn protocol(&self) -> Protocol;

    /// Starts the handshake; the device shows a PIN on screen.
    async fn begin(&mut self) -> ProviderResult<()>;

    /// Records the PIN the user read off the screen.
    fn pin(&mut self, pin: &str);

    /// Completes the handshake with the recorded PIN.
    async fn finish(&mut self) -> ProviderResult<()>;

    /// Whether the last `finish` produced a pairing.
    fn has_paired(&self) -> bool;

    /// The credential produced by a successful pairing.
    fn credentials(&self) -> Option<String>;

    /// Releases any resources held by the handshake.
    async fn close(&mut self) -> ProviderResult<()>;
}

/// A live connection to one device.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    /// Remote-control capability; always available while the connection is.
    fn remote_control(&self) -> &dyn RemoteControl;

    /// On-device keyboard (text entry) capability.
    fn keyboard(&self) -> &dyn Keyboard;

    /// Registers a lifecycle listener.
    fn subscribe(&self, listener: DeviceListener) -> Subscription;

    /// Closes the connection.
    async fn close(&self) -> ProviderResult<()>;
}

/// Discovery, pairing, and connection for one family of devices.
#[async_trait]
pub trait DeviceProvider: Send + Sync + 'static {
    /// Discovers devices, optionally restricted to a single identifier.
    async fn scan(&self, identifier: Option<&str>) -> ProviderResult<Vec<DeviceTarget>>;

    /// Creates a pairing handshake for `protocol` with `target`.
    async fn pair(
        &self,
        target: &DeviceTarget,
        protocol: Protocol,
    ) -> ProviderResult<Box<dyn PairingHandshake>>;

    /// Connects to `target` using the credentials it carries.
    async fn connect(&self, target: &DeviceTarget) -> ProviderResult<Box<dyn DeviceConnection>>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
