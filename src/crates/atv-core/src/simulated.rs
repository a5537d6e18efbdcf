//! In-memory provider backed by a TOML device inventory.
//!
//! [`SimulatedProvider`] behaves like a small network of streaming devices:
//! discovery returns the inventory, pairing accepts the configured PIN per
//! protocol and hands out a deterministic credential, and `connect` only
//! succeeds when the target carries the matching AirPlay credential.
//!
//! It serves two purposes:
//!
//! - **Local development** – run the gateway with `--devices inventory.toml`
//!   and drive it from a browser without any hardware.
//! - **Tests** – the hooks (`lose_connection`, `fail_next_connects`,
//!   `set_focus`, ...) let tests script every lifecycle path the gateway has
//!   to survive.
//!
//! # Inventory format
//!
//! ```toml
//! [[devices]]
//! name = "Living Room"
//! address = "10.0.0.5"
//! identifier = "AA:BB:CC:DD:EE:FF"
//! model = "Apple TV 4K"      # optional, defaults to "Apple TV"
//! airplay_pin = "1234"       # optional, defaults to "1234"
//! companion_pin = "5678"     # optional, defaults to "1234"
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::device::{DeviceTarget, Protocol};
use crate::provider::{
    DeviceConnection, DeviceEvent, DeviceListener, DeviceProvider, ListenerSet, PairingHandshake,
    ProviderError, ProviderResult, Subscription,
};
use crate::remote::{InputAction, Keyboard, KeyboardFocusState, PowerState, RemoteControl};

// ── Inventory ─────────────────────────────────────────────────────────────────

/// Error type for loading an inventory file.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// The file could not be read.
    #[error("I/O error reading inventory at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse inventory TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

fn default_model() -> String {
    "Apple TV".to_string()
}

fn default_pin() -> String {
    "1234".to_string()
}

/// One device in the simulated network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedDevice {
    pub name: String,
    pub address: IpAddr,
    pub identifier: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_pin")]
    pub airplay_pin: String,
    #[serde(default = "default_pin")]
    pub companion_pin: String,
}

impl SimulatedDevice {
    /// Creates a TV-class device with the default PIN for both protocols.
    pub fn new(name: impl Into<String>, address: IpAddr, identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address,
            identifier: identifier.into(),
            model: default_model(),
            airplay_pin: default_pin(),
            companion_pin: default_pin(),
        }
    }

    /// Overrides the model string.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Overrides the PIN for one protocol.
    pub fn with_pin(mut self, protocol: Protocol, pin: impl Into<String>) -> Self {
        match protocol {
            Protocol::AirPlay => self.airplay_pin = pin.into(),
            Protocol::Companion => self.companion_pin = pin.into(),
        }
        self
    }

    /// The target discovery reports for this device.
    pub fn target(&self) -> DeviceTarget {
        DeviceTarget::new(&self.name, self.address, &self.identifier, &self.model)
    }

    /// The PIN the device "shows" for `protocol`.
    pub fn pin(&self, protocol: Protocol) -> &str {
        match protocol {
            Protocol::AirPlay => &self.airplay_pin,
            Protocol::Companion => &self.companion_pin,
        }
    }

    /// The credential a successful pairing for `protocol` produces.
    pub fn credential(&self, protocol: Protocol) -> String {
        format!("{}:{}", protocol.as_str().to_lowercase(), self.identifier)
    }
}

/// The full simulated network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedInventory {
    #[serde(default)]
    pub devices: Vec<SimulatedDevice>,
}

impl SimulatedInventory {
    /// Parses an inventory from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Parse`] if the text is not a valid inventory.
    pub fn from_toml_str(text: &str) -> Result<Self, InventoryError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses an inventory file.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Io`] if the file cannot be read and
    /// [`InventoryError::Parse`] if it is not a valid inventory.
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let text = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct SimState {
    scan_calls: usize,
    connect_calls: usize,
    pair_calls: Vec<Protocol>,
    fail_connects: u32,
    key_failure: Option<String>,
    presses: Vec<(String, Option<InputAction>)>,
    focus: KeyboardFocusState,
    power: PowerState,
    text: Option<String>,
    live: Option<Arc<LinkShared>>,
}

type SharedState = Arc<Mutex<SimState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of one simulated connection.
struct LinkShared {
    listeners: ListenerSet,
    closed: AtomicBool,
    state: SharedState,
}

impl LinkShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn press(&self, key: &str, action: Option<InputAction>) -> ProviderResult<()> {
        if self.is_closed() {
            return Err(ProviderError::Closed);
        }
        let mut state = lock(&self.state);
        if let Some(reason) = &state.key_failure {
            return Err(ProviderError::Command(reason.clone()));
        }
        state.presses.push((key.to_string(), action));
        Ok(())
    }
}

// ── Provider ──────────────────────────────────────────────────────────────────

/// A [`DeviceProvider`] over an in-memory inventory.
///
/// Cloning shares the same simulated network and counters, so a test can keep
/// a handle while the gateway owns another.
#[derive(Clone)]
pub struct SimulatedProvider {
    devices: Arc<Vec<SimulatedDevice>>,
    state: SharedState,
}

impl SimulatedProvider {
    pub fn new(inventory: SimulatedInventory) -> Self {
        Self {
            devices: Arc::new(inventory.devices),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Convenience constructor from a device list.
    pub fn with_devices(devices: Vec<SimulatedDevice>) -> Self {
        Self::new(SimulatedInventory { devices })
    }

    pub fn devices(&self) -> &[SimulatedDevice] {
        &self.devices
    }

    fn find(&self, identifier: &str) -> Option<&SimulatedDevice> {
        self.devices.iter().find(|d| d.identifier == identifier)
    }

    fn live(&self) -> Option<Arc<LinkShared>> {
        lock(&self.state).live.clone()
    }

    // ── Test hooks ────────────────────────────────────────────────────────────

    /// Makes the next `n` calls to `connect` fail.
    pub fn fail_next_connects(&self, n: u32) {
        lock(&self.state).fail_connects = n;
    }

    /// Makes every key press fail with `reason` (or succeed again with `None`).
    pub fn set_key_failure(&self, reason: Option<&str>) {
        lock(&self.state).key_failure = reason.map(str::to_string);
    }

    /// Delivers `event` to the listeners of the live connection.
    ///
    /// Returns the number of listeners that received it.
    pub fn emit(&self, event: DeviceEvent) -> usize {
        match self.live() {
            Some(link) => link.listeners.emit(event),
            None => 0,
        }
    }

    /// Simulates an unsolicited drop of the live connection.
    pub fn lose_connection(&self, reason: &str) -> usize {
        let Some(link) = lock(&self.state).live.take() else {
            return 0;
        };
        link.closed.store(true, Ordering::Release);
        link.listeners.emit(DeviceEvent::ConnectionLost {
            reason: reason.to_string(),
        })
    }

    /// Changes keyboard focus and notifies listeners.
    pub fn set_focus(&self, new: KeyboardFocusState) -> usize {
        let old = std::mem::replace(&mut lock(&self.state).focus, new);
        self.emit(DeviceEvent::FocusStateChanged { old, new })
    }

    /// Changes power state and notifies listeners.
    pub fn set_power(&self, new: PowerState) -> usize {
        let old = std::mem::replace(&mut lock(&self.state).power, new);
        self.emit(DeviceEvent::PowerStateChanged { old, new })
    }

    /// Replaces the text in the simulated focused field.
    pub fn set_text(&self, text: Option<&str>) {
        lock(&self.state).text = text.map(str::to_string);
    }

    pub fn text(&self) -> Option<String> {
        lock(&self.state).text.clone()
    }

    pub fn scan_calls(&self) -> usize {
        lock(&self.state).scan_calls
    }

    pub fn connect_calls(&self) -> usize {
        lock(&self.state).connect_calls
    }

    /// Protocols passed to `pair`, in call order.
    pub fn pair_calls(&self) -> Vec<Protocol> {
        lock(&self.state).pair_calls.clone()
    }

    /// Keys pressed on any connection, in order.
    pub fn presses(&self) -> Vec<(String, Option<InputAction>)> {
        lock(&self.state).presses.clone()
    }

    /// Whether a connection is currently open.
    pub fn has_live_connection(&self) -> bool {
        self.live().is_some_and(|link| !link.is_closed())
    }

    /// Number of listeners attached to the live connection.
    pub fn live_listener_count(&self) -> usize {
        self.live().map_or(0, |link| link.listeners.active_count())
    }
}

#[async_trait]
impl DeviceProvider for SimulatedProvider {
    async fn scan(&self, identifier: Option<&str>) -> ProviderResult<Vec<DeviceTarget>> {
        lock(&self.state).scan_calls += 1;
        Ok(self
            .devices
            .iter()
            .filter(|d| identifier.map_or(true, |id| d.identifier == id))
            .map(SimulatedDevice::target)
            .collect())
    }

    async fn pair(
        &self,
        target: &DeviceTarget,
        protocol: Protocol,
    ) -> ProviderResult<Box<dyn PairingHandshake>> {
        let device = self
            .find(target.identifier())
            .ok_or_else(|| ProviderError::NotFound(target.identifier().to_string()))?;
        lock(&self.state).pair_calls.push(protocol);
        Ok(Box::new(SimulatedHandshake {
            protocol,
            expected_pin: device.pin(protocol).to_string(),
            credential: device.credential(protocol),
            entered: None,
            begun: false,
            paired: false,
        }))
    }

    async fn connect(&self, target: &DeviceTarget) -> ProviderResult<Box<dyn DeviceConnection>> {
        {
            let mut state = lock(&self.state);
            state.connect_calls += 1;
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(ProviderError::Connection(
                    "simulated connection failure".to_string(),
                ));
            }
        }

        let device = self
            .find(target.identifier())
            .ok_or_else(|| ProviderError::NotFound(target.identifier().to_string()))?;
        for protocol in Protocol::ALL {
            let supplied = target.credentials().get(protocol);
            let valid = match (protocol, supplied) {
                (Protocol::AirPlay, None) => false,
                (_, None) => true,
                (_, Some(cred)) => cred == device.credential(protocol),
            };
            if !valid {
                return Err(ProviderError::Connection(format!(
                    "invalid {protocol} credentials"
                )));
            }
        }

        let link = Arc::new(LinkShared {
            listeners: ListenerSet::new(),
            closed: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        });
        lock(&self.state).live = Some(Arc::clone(&link));
        debug!("simulated connection opened to {}", target.identifier());
        Ok(Box::new(SimulatedConnection { link }))
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

struct SimulatedHandshake {
    protocol: Protocol,
    expected_pin: String,
    credential: String,
    entered: Option<String>,
    begun: bool,
    paired: bool,
}

#[async_trait]
impl PairingHandshake for SimulatedHandshake {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn begin(&mut self) -> ProviderResult<()> {
        self.begun = true;
        Ok(())
    }

    fn pin(&mut self, pin: &str) {
        self.entered = Some(pin.to_string());
    }

    async fn finish(&mut self) -> ProviderResult<()> {
        if !self.begun {
            return Err(ProviderError::Pairing("handshake was not started".to_string()));
        }
        self.paired = self.entered.as_deref() == Some(self.expected_pin.as_str());
        Ok(())
    }

    fn has_paired(&self) -> bool {
        self.paired
    }

    fn credentials(&self) -> Option<String> {
        self.paired.then(|| self.credential.clone())
    }

    async fn close(&mut self) -> ProviderResult<()> {
        self.begun = false;
        Ok(())
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

struct SimulatedConnection {
    link: Arc<LinkShared>,
}

#[async_trait]
impl DeviceConnection for SimulatedConnection {
    fn remote_control(&self) -> &dyn RemoteControl {
        self
    }

    fn keyboard(&self) -> &dyn Keyboard {
        self
    }

    fn subscribe(&self, listener: DeviceListener) -> Subscription {
        self.link.listeners.subscribe(listener)
    }

    async fn close(&self) -> ProviderResult<()> {
        if self.link.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let mut state = lock(&self.link.state);
            if state
                .live
                .as_ref()
                .is_some_and(|live| Arc::ptr_eq(live, &self.link))
            {
                state.live = None;
            }
        }
        // A clean close is reported to whoever is still listening.
        self.link.listeners.emit(DeviceEvent::ConnectionClosed);
        Ok(())
    }
}

#[async_trait]
impl RemoteControl for SimulatedConnection {
    async fn up(&self, action: InputAction) -> ProviderResult<()> {
        self.link.press("up", Some(action))
    }
    async fn down(&self, action: InputAction) -> ProviderResult<()> {
        self.link.press("down", Some(action))
    }
    async fn left(&self, action: InputAction) -> ProviderResult<()> {
        self.link.press("left", Some(action))
    }
    async fn right(&self, action: InputAction) -> ProviderResult<()> {
        self.link.press("right", Some(action))
    }
    async fn select(&self, action: InputAction) -> ProviderResult<()> {
        self.link.press("select", Some(action))
    }
    async fn menu(&self, action: InputAction) -> ProviderResult<()> {
        self.link.press("menu", Some(action))
    }
    async fn top_menu(&self, action: InputAction) -> ProviderResult<()> {
        self.link.press("top_menu", Some(action))
    }
    async fn home(&self, action: InputAction) -> ProviderResult<()> {
        self.link.press("home", Some(action))
    }
    async fn skip_backward(&self, action: InputAction) -> ProviderResult<()> {
        self.link.press("skip_backward", Some(action))
    }
    async fn skip_forward(&self, action: InputAction) -> ProviderResult<()> {
        self.link.press("skip_forward", Some(action))
    }
    async fn home_hold(&self) -> ProviderResult<()> {
        self.link.press("home_hold", None)
    }
    async fn play_pause(&self) -> ProviderResult<()> {
        self.link.press("play_pause", None)
    }
    async fn volume_up(&self) -> ProviderResult<()> {
        self.link.press("volume_up", None)
    }
    async fn volume_down(&self) -> ProviderResult<()> {
        self.link.press("volume_down", None)
    }
}

#[async_trait]
impl Keyboard for SimulatedConnection {
    fn focus_state(&self) -> KeyboardFocusState {
        lock(&self.link.state).focus
    }

    async fn text_get(&self) -> ProviderResult<Option<String>> {
        if self.link.is_closed() {
            return Err(ProviderError::Closed);
        }
        Ok(lock(&self.link.state).text.clone())
    }

    async fn text_set(&self, text: &str) -> ProviderResult<()> {
        if self.link.is_closed() {
            return Err(ProviderError::Closed);
        }
        lock(&self.link.state).text = Some(text.to_string());
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_parses_with_defaults() {
        // Arrange
        let text = r#"
            [[devices]]
            name = "Living Room"
            address = "10.0.0.5"
            identifier = "AA:BB"
        "#;

        // Act
        let inventory = SimulatedInventory::from_toml_str(text).unwrap();

        // Assert
        assert_eq!(inventory.devices.len(), 1);
        let device = &inventory.devices[0];
        assert_eq!(device.model, "Apple TV");
        assert_eq!(device.airplay_pin, "1234");
        assert_eq!(device.companion_pin, "1234");
    }

    #[test]
    fn test_inventory_empty_text_has_no_devices() {
        let inventory = SimulatedInventory::from_toml_str("").unwrap();
        assert!(inventory.devices.is_empty());
    }

    #[test]
    fn test_inventory_rejects_bad_address() {
        let text = r#"
            [[devices]]
            name = "Broken"
            address = "not-an-ip"
            identifier = "x"
        "#;
        assert!(matches!(
            SimulatedInventory::from_toml_str(text),
            Err(InventoryError::Parse(_))
        ));
    }

    #[test]
    fn test_inventory_load_missing_file_is_io_error() {
        let path = Path::new("/nonexistent/atv-gateway/inventory.toml");
        assert!(matches!(
            SimulatedInventory::load(path),
            Err(InventoryError::Io { .. })
        ));
    }

    #[test]
    fn test_credential_is_deterministic_per_protocol() {
        let device = SimulatedDevice::new("A", "10.0.0.1".parse().unwrap(), "id-1");
        assert_eq!(device.credential(Protocol::AirPlay), "airplay:id-1");
        assert_eq!(device.credential(Protocol::Companion), "companion:id-1");
    }

    #[tokio::test]
    async fn test_handshake_finish_before_begin_fails() {
        let provider =
            SimulatedProvider::with_devices(vec![SimulatedDevice::new("A", "10.0.0.1".parse().unwrap(), "id-1")]);
        let target = provider.devices()[0].target();
        let mut handshake = provider.pair(&target, Protocol::AirPlay).await.unwrap();

        handshake.pin("1234");
        let result = handshake.finish().await;

        assert!(matches!(result, Err(ProviderError::Pairing(_))));
        assert!(!handshake.has_paired());
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_key_presses() {
        let device = SimulatedDevice::new("A", "10.0.0.1".parse().unwrap(), "id-1");
        let cred = device.credential(Protocol::AirPlay);
        let provider = SimulatedProvider::with_devices(vec![device.clone()]);
        let mut creds = crate::CredentialSet::new();
        creds.insert(Protocol::AirPlay, cred);
        let conn = provider
            .connect(&device.target().with_credentials(&creds))
            .await
            .unwrap();

        conn.close().await.unwrap();
        let result = conn.remote_control().menu(InputAction::SingleTap).await;

        assert_eq!(result, Err(ProviderError::Closed));
        assert!(!provider.has_live_connection());
    }
}
